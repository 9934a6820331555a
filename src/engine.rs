use crate::channel::DaemonChannel;
use crate::codec::{DaemonFailure, DaemonRequest, DaemonResponse};
use crate::demo::DemoShadow;
use crate::error::{ErrorCode, SrError};
use crate::host::{shell_single_quote, CapabilityHost};
use crate::logs::LogReader;
use crate::model::{
    validate_package_id, AppConfig, AppConfigPatch, ConfigSnapshot, DaemonStatus, GlobalConfig,
    LogEntry, LogStats, MonitorFile, PackageInfo, PackageScope,
};
use crate::queue::SaveQueue;
use crate::settings::Settings;
use crate::store::{FileConfigStore, StoreLayout};
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const PIDOF_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Live,
    LiveFileFallback,
    Demo,
}

#[derive(Debug)]
struct Mirror {
    mode: OperatingMode,
    status: DaemonStatus,
    apps: Vec<PackageInfo>,
    app_configs: BTreeMap<String, AppConfig>,
    global: Option<GlobalConfig>,
    load_error: Option<String>,
}

enum Backend<'a> {
    Live,
    Demo(&'a DemoShadow),
}

/// The mirror lock is never held across an await.
pub struct ConfigSyncEngine {
    host: Arc<dyn CapabilityHost>,
    channel: DaemonChannel,
    files: FileConfigStore,
    logs: LogReader,
    demo: DemoShadow,
    queue: SaveQueue,
    state: Mutex<Mirror>,
}

impl ConfigSyncEngine {
    pub fn new(
        host: Arc<dyn CapabilityHost>,
        daemon_bin: impl Into<String>,
        layout: StoreLayout,
    ) -> Self {
        let channel = DaemonChannel::new(host.clone(), daemon_bin);
        let files = FileConfigStore::new(host.clone(), layout);
        let logs = LogReader::new(files.clone());
        Self {
            host,
            channel,
            files,
            logs,
            demo: DemoShadow::new(),
            queue: SaveQueue::new(),
            state: Mutex::new(Mirror {
                mode: OperatingMode::LiveFileFallback,
                status: DaemonStatus::default(),
                apps: Vec::new(),
                app_configs: BTreeMap::new(),
                global: None,
                load_error: None,
            }),
        }
    }

    pub fn from_settings(host: Arc<dyn CapabilityHost>, settings: &Settings) -> Self {
        let engine = Self::new(
            host,
            settings.daemon_bin().to_string_lossy().to_string(),
            settings.layout(),
        );
        if settings.demo.force {
            engine.enter_demo();
        }
        engine
    }

    fn state(&self) -> MutexGuard<'_, Mirror> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn backend(&self) -> Backend<'_> {
        match self.mode() {
            OperatingMode::Demo => Backend::Demo(&self.demo),
            OperatingMode::Live | OperatingMode::LiveFileFallback => Backend::Live,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.state().mode
    }

    pub fn daemon_status(&self) -> DaemonStatus {
        self.state().status.clone()
    }

    pub fn load_error(&self) -> Option<String> {
        self.state().load_error.clone()
    }

    pub fn apps(&self) -> Vec<PackageInfo> {
        self.state().apps.clone()
    }

    pub fn app_configs(&self) -> BTreeMap<String, AppConfig> {
        self.state().app_configs.clone()
    }

    pub fn global_config(&self) -> Option<GlobalConfig> {
        self.state().global.clone()
    }

    fn set_load_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(event = "engine.load_error", message = %message);
        self.state().load_error = Some(message);
    }

    fn enter_demo(&self) {
        let status = self.demo.status();
        let mut state = self.state();
        state.mode = OperatingMode::Demo;
        state.status = status;
        state.load_error = None;
    }

    fn note_daemon_failure(&self, failure: &DaemonFailure) {
        let transport = matches!(
            failure.code,
            ErrorCode::Exception | ErrorCode::DaemonUnreachable | ErrorCode::IpcTimeout
        );
        let mut state = self.state();
        if transport && state.mode == OperatingMode::Live {
            state.mode = OperatingMode::LiveFileFallback;
            state.status.online = false;
            info!(event = "engine.mode", mode = "live_file_fallback", code = %failure.code);
        }
    }

    fn observe(&self, response: &DaemonResponse) {
        if let Some(failure) = response.error() {
            self.note_daemon_failure(failure);
        }
    }

    async fn call(&self, request: &DaemonRequest) -> DaemonResponse {
        let response = self.channel.call(request).await;
        self.observe(&response);
        response
    }

    async fn notify(&self, message: &str) {
        if let Err(err) = self.host.notify(message).await {
            info!(event = "engine.notify_unavailable", message, error = %err);
        }
    }

    pub async fn check_daemon(&self) -> DaemonStatus {
        if self.mode() == OperatingMode::Demo {
            return self.demo.status();
        }

        let response = self.channel.call(&DaemonRequest::Ping).await;
        if response.is_ok() {
            let status = DaemonStatus {
                online: true,
                version: response.field::<String>("version").unwrap_or_default(),
            };
            let mut state = self.state();
            state.mode = OperatingMode::Live;
            state.status = status.clone();
            info!(event = "engine.mode", mode = "live", version = %status.version);
            return status;
        }

        match self.host.list_packages(PackageScope::User).await {
            Err(err) => {
                info!(event = "engine.mode", mode = "demo", error = %err);
                self.enter_demo();
                self.demo.status()
            }
            Ok(_) => {
                let status = DaemonStatus::default();
                let mut state = self.state();
                state.mode = OperatingMode::LiveFileFallback;
                state.status = status.clone();
                info!(event = "engine.mode", mode = "live_file_fallback");
                status
            }
        }
    }

    pub async fn load_demo_data(&self) {
        self.enter_demo();
        let apps = self.demo.apps(PackageScope::All);
        let configs = self.demo.app_configs();
        let global = self.demo.global();
        {
            let mut state = self.state();
            state.apps = apps;
            state.app_configs = configs;
            state.global = Some(global);
        }
        self.notify("Demo data loaded").await;
    }

    pub async fn load_apps(&self, scope: PackageScope) -> Vec<PackageInfo> {
        if let Backend::Demo(demo) = self.backend() {
            return demo.apps(scope);
        }

        let scopes: &[PackageScope] = match scope {
            PackageScope::All => &[PackageScope::User, PackageScope::System],
            PackageScope::User => &[PackageScope::User],
            PackageScope::System => &[PackageScope::System],
        };
        let listings = join_all(scopes.iter().map(|s| self.host.list_packages(*s))).await;
        let mut seen = HashSet::new();
        let mut packages = Vec::new();
        for (listed_scope, listing) in scopes.iter().zip(listings) {
            match listing {
                Ok(list) => {
                    for pkg in list {
                        if seen.insert(pkg.clone()) {
                            packages.push(pkg);
                        }
                    }
                }
                Err(err) => {
                    warn!(event = "engine.list_packages_failed", scope = listed_scope.as_str(), error = %err);
                }
            }
        }
        if packages.is_empty() {
            self.set_load_error("package list is empty");
            return Vec::new();
        }

        let infos = match self.host.packages_info(&packages).await {
            Ok(infos) => infos,
            Err(err) => {
                self.set_load_error(format!("package info unavailable: {err}"));
                return Vec::new();
            }
        };
        let apps: Vec<PackageInfo> = infos.into_iter().filter_map(PackageInfo::sanitized).collect();
        let mut state = self.state();
        state.apps = apps.clone();
        state.load_error = None;
        apps
    }

    fn partition_apps(&self, with_rules: bool) -> Vec<PackageInfo> {
        let (apps, configs) = match self.backend() {
            Backend::Demo(demo) => (demo.apps(PackageScope::All), demo.app_configs()),
            Backend::Live => {
                let state = self.state();
                (state.apps.clone(), state.app_configs.clone())
            }
        };
        apps.into_iter()
            .filter(|app| {
                let has = configs
                    .get(&app.package_id)
                    .map_or(false, AppConfig::has_rules);
                has == with_rules
            })
            .collect()
    }

    pub fn apps_with_rules(&self) -> Vec<PackageInfo> {
        self.partition_apps(true)
    }

    pub fn apps_without_rules(&self) -> Vec<PackageInfo> {
        self.partition_apps(false)
    }

    pub async fn load_app_configs(&self) -> BTreeMap<String, AppConfig> {
        if let Backend::Demo(demo) = self.backend() {
            return demo.app_configs();
        }

        let configs = match self.files.list_apps().await {
            Ok(configs) => configs,
            Err(err) => {
                debug!(event = "engine.list_apps_fallback", error = %err);
                match self.app_configs_from_daemon().await {
                    Some(configs) => configs,
                    None => {
                        self.set_load_error(format!("app configs unavailable: {err}"));
                        return BTreeMap::new();
                    }
                }
            }
        };
        self.state().app_configs = configs.clone();
        configs
    }

    async fn app_configs_from_daemon(&self) -> Option<BTreeMap<String, AppConfig>> {
        #[derive(Deserialize)]
        struct Listed {
            pkg: String,
        }

        // A daemon with no configs answers `"apps": null`.
        let listed: Vec<Listed> = self
            .call(&DaemonRequest::AppList)
            .await
            .field::<Option<Vec<Listed>>>("apps")?
            .unwrap_or_default();
        let packages: Vec<String> = listed.into_iter().map(|item| item.pkg).collect();
        let responses = join_all(packages.iter().map(|pkg| async move {
            self.call(&DaemonRequest::AppGet { pkg: pkg.clone() }).await
        }))
        .await;
        let configs = packages
            .into_iter()
            .zip(responses)
            .filter_map(|(pkg, response)| {
                let raw = response.field::<Value>("app")?;
                Some((pkg, AppConfig::normalize(&raw)))
            })
            .collect();
        Some(configs)
    }

    /// Each half falls back to the daemon on its own.
    pub async fn load_global_config(&self) -> GlobalConfig {
        if let Backend::Demo(demo) = self.backend() {
            return demo.global();
        }

        let (global, monitor) = tokio::join!(self.files.read_global(), self.files.read_monitor());
        let global = match global {
            Ok(global) => global,
            Err(err) => {
                debug!(event = "engine.global_fallback", error = %err);
                match self
                    .call(&DaemonRequest::GlobalGet)
                    .await
                    .field::<GlobalConfig>("global")
                {
                    Some(mut global) => {
                        global.monitor_paths = None;
                        global
                    }
                    None => {
                        self.set_load_error(format!("global config unavailable: {err}"));
                        GlobalConfig::default()
                    }
                }
            }
        };
        let monitor = match monitor {
            Ok(monitor) => monitor,
            Err(err) => {
                debug!(event = "engine.monitor_fallback", error = %err);
                match self
                    .call(&DaemonRequest::MonitorGet)
                    .await
                    .field::<MonitorFile>("monitor")
                {
                    Some(monitor) => monitor,
                    None => {
                        self.set_load_error(format!("monitor paths unavailable: {err}"));
                        MonitorFile::default()
                    }
                }
            }
        };
        let unified = global.with_monitor(monitor);
        self.state().global = Some(unified.clone());
        unified
    }

    pub async fn get_app_config(&self, pkg: &str) -> Option<AppConfig> {
        if let Backend::Demo(demo) = self.backend() {
            return demo.app_config(pkg);
        }

        let file_error = match self.files.read_app(pkg).await {
            Ok(Some(config)) => {
                self.state()
                    .app_configs
                    .insert(pkg.to_string(), config.clone());
                return Some(config);
            }
            Ok(None) => None,
            Err(err) => {
                debug!(event = "engine.app_read_fallback", pkg, error = %err);
                Some(err)
            }
        };

        let response = self
            .call(&DaemonRequest::AppGet {
                pkg: pkg.to_string(),
            })
            .await;
        if let Some(raw) = response.field::<Value>("app") {
            let config = AppConfig::normalize(&raw);
            self.state()
                .app_configs
                .insert(pkg.to_string(), config.clone());
            return Some(config);
        }
        if let (Some(err), Some(failure)) = (file_error, response.error()) {
            if failure.code != ErrorCode::NotFound {
                self.set_load_error(format!(
                    "config for {pkg} unavailable: {err}; daemon: {}",
                    failure.message
                ));
            }
        }
        None
    }

    pub async fn save_app_config(&self, pkg: &str, patch: AppConfigPatch) -> bool {
        if let Err(err) = validate_package_id(pkg) {
            self.notify(&format!("Save failed: {err}")).await;
            return false;
        }
        if let Backend::Demo(demo) = self.backend() {
            demo.save_app_config(pkg, &patch);
            self.notify("Saved (demo mode)").await;
            return true;
        }
        self.queue
            .enqueue(pkg, || self.persist_app(pkg, &patch))
            .await
    }

    async fn current_app_config(&self, pkg: &str) -> AppConfig {
        let cached = self.state().app_configs.get(pkg).cloned();
        match cached {
            Some(config) => config,
            None => self.get_app_config(pkg).await.unwrap_or_default(),
        }
    }

    async fn persist_app(&self, pkg: &str, patch: &AppConfigPatch) -> bool {
        let base = self.current_app_config(pkg).await;
        let merged = patch.apply_to(&base);
        match self.store_app(pkg, &merged).await {
            Ok(()) => {
                self.state()
                    .app_configs
                    .insert(pkg.to_string(), merged);
                self.notify(&format!("Saved configuration for {pkg}")).await;
                true
            }
            Err(err) => {
                warn!(event = "engine.save_app_failed", pkg, error = %err);
                self.notify(&format!("Save failed for {pkg}: {err}")).await;
                false
            }
        }
    }

    async fn store_app(&self, pkg: &str, config: &AppConfig) -> Result<(), SrError> {
        let response = self
            .call(&DaemonRequest::AppSet {
                pkg: pkg.to_string(),
                app: config.to_persisted(),
            })
            .await;
        if response.is_ok() {
            return Ok(());
        }
        debug!(event = "engine.app_write_fallback", pkg);
        self.files.write_app(pkg, config).await
    }

    pub async fn delete_app_config(&self, pkg: &str) -> bool {
        if let Err(err) = validate_package_id(pkg) {
            self.notify(&format!("Delete failed: {err}")).await;
            return false;
        }
        if let Backend::Demo(demo) = self.backend() {
            demo.delete_app(pkg);
            self.notify("Deleted (demo mode)").await;
            return true;
        }
        self.queue
            .enqueue(pkg, || async {
                let response = self
                    .call(&DaemonRequest::AppDelete {
                        pkg: pkg.to_string(),
                    })
                    .await;
                let result = if response.is_ok() {
                    Ok(())
                } else {
                    self.files.delete_app(pkg).await
                };
                match result {
                    Ok(()) => {
                        self.state().app_configs.remove(pkg);
                        self.notify(&format!("Deleted configuration for {pkg}")).await;
                        true
                    }
                    Err(err) => {
                        self.notify(&format!("Delete failed for {pkg}: {err}")).await;
                        false
                    }
                }
            })
            .await
    }

    pub async fn save_global_config(&self, global: GlobalConfig) -> bool {
        if let Backend::Demo(demo) = self.backend() {
            demo.save_global(&global);
            self.notify("Saved (demo mode)").await;
            return true;
        }
        match self.store_global(&global).await {
            Ok(()) => {
                self.remember_global(global);
                self.notify("Saved global configuration").await;
                true
            }
            Err(err) => {
                warn!(event = "engine.save_global_failed", error = %err);
                self.notify(&format!("Save failed: {err}")).await;
                false
            }
        }
    }

    fn remember_global(&self, global: GlobalConfig) {
        let mut state = self.state();
        let mut next = global;
        if next.monitor_paths.is_none() {
            next.monitor_paths = state
                .global
                .as_ref()
                .and_then(|current| current.monitor_paths.clone());
        }
        state.global = Some(next);
    }

    async fn store_global(&self, global: &GlobalConfig) -> Result<(), SrError> {
        let (trimmed, monitor) = global.split();
        let mut daemon_ok = self
            .call(&DaemonRequest::GlobalSet {
                global: to_object(&trimmed),
            })
            .await
            .is_ok();
        if daemon_ok {
            if let Some(monitor) = &monitor {
                daemon_ok = self
                    .call(&DaemonRequest::MonitorSet {
                        monitor: to_object(monitor),
                    })
                    .await
                    .is_ok();
            }
        }
        if daemon_ok {
            return Ok(());
        }

        debug!(event = "engine.global_write_fallback");
        let monitor_write = async {
            match &monitor {
                Some(monitor) => self.files.write_monitor(monitor).await,
                None => Ok(()),
            }
        };
        let (global_written, monitor_written) =
            tokio::join!(self.files.write_global(&trimmed), monitor_write);
        global_written?;
        monitor_written
    }

    pub async fn tail_logs(&self, pkg: Option<&str>, n: usize) -> Vec<LogEntry> {
        if let Backend::Demo(demo) = self.backend() {
            return demo.tail(pkg, n);
        }
        let response = self
            .call(&DaemonRequest::LogTail {
                pkg: pkg.map(str::to_string),
                n,
            })
            .await;
        if let Some(entries) = response.field::<Option<Vec<LogEntry>>>("entries") {
            return entries.unwrap_or_default();
        }
        debug!(event = "logs.tail_fallback", pkg = pkg.unwrap_or("*"));
        self.logs.tail(pkg, n).await
    }

    pub async fn clear_logs(&self, pkg: &str) -> bool {
        if pkg.trim().is_empty() {
            self.notify("Clear failed: invalid package name").await;
            return false;
        }
        if let Backend::Demo(demo) = self.backend() {
            demo.clear(pkg);
            self.notify("Logs cleared (demo mode)").await;
            return true;
        }
        let response = self
            .call(&DaemonRequest::LogClear {
                pkg: pkg.to_string(),
            })
            .await;
        let result = if response.is_ok() {
            Ok(())
        } else {
            debug!(event = "logs.clear_fallback", pkg);
            self.logs.clear(pkg).await
        };
        match result {
            Ok(()) => {
                self.notify("Logs cleared").await;
                true
            }
            Err(err) => {
                warn!(event = "engine.clear_logs_failed", pkg, error = %err);
                self.notify(&format!("Clear failed: {err}")).await;
                false
            }
        }
    }

    pub async fn log_stats(&self) -> LogStats {
        if let Backend::Demo(demo) = self.backend() {
            return demo.stats();
        }
        let response = self.call(&DaemonRequest::LogStats).await;
        if let Some(payload) = response.payload() {
            if let Ok(stats) = serde_json::from_value(Value::Object(payload.clone())) {
                return stats;
            }
        }
        debug!(event = "logs.stats_fallback");
        self.logs.stats().await
    }

    pub async fn export_snapshot(&self) -> ConfigSnapshot {
        let (global, apps) = tokio::join!(self.load_global_config(), self.load_app_configs());
        ConfigSnapshot {
            version: 1,
            global,
            apps,
        }
    }

    pub async fn import_snapshot(&self, snapshot: ConfigSnapshot) -> bool {
        for pkg in snapshot.apps.keys() {
            if let Err(err) = validate_package_id(pkg) {
                self.notify(&format!("Import failed: {err}")).await;
                return false;
            }
        }
        if let Backend::Demo(demo) = self.backend() {
            demo.save_global(&snapshot.global);
            for (pkg, config) in &snapshot.apps {
                demo.replace_app_config(pkg, config.clone());
            }
            self.notify("Imported (demo mode)").await;
            return true;
        }

        let apps_written = join_all(snapshot.apps.iter().map(|(pkg, config)| {
            self.queue.enqueue(pkg, move || async move {
                match self.store_app(pkg, config).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(event = "engine.import_app_failed", pkg = %pkg, error = %err);
                        false
                    }
                }
            })
        }));
        let (global_written, apps_written) =
            tokio::join!(self.store_global(&snapshot.global), apps_written);

        let apps_ok = apps_written.iter().all(|written| *written);
        if let Err(err) = &global_written {
            warn!(event = "engine.import_global_failed", error = %err);
        }
        if global_written.is_ok() {
            self.remember_global(snapshot.global.clone());
        }
        {
            let mut state = self.state();
            for ((pkg, config), written) in snapshot.apps.iter().zip(&apps_written) {
                if *written {
                    state.app_configs.insert(pkg.clone(), config.clone());
                }
            }
        }
        let ok = apps_ok && global_written.is_ok();
        if ok {
            self.notify(&format!("Imported {} app configurations", snapshot.apps.len()))
                .await;
        } else {
            self.notify("Import finished with errors").await;
        }
        ok
    }

    /// User packages with at least one live process.
    pub async fn running_apps(&self) -> Vec<String> {
        if let Backend::Demo(demo) = self.backend() {
            return demo.running_apps();
        }
        let packages = match self.host.list_packages(PackageScope::User).await {
            Ok(packages) => packages,
            Err(err) => {
                warn!(event = "engine.running_apps_failed", error = %err);
                return Vec::new();
            }
        };
        let running = stream::iter(packages)
            .map(|pkg| async move {
                let command = format!("pidof {} 2>/dev/null", shell_single_quote(&pkg));
                match self.host.execute(&command).await {
                    Ok(output) if !output.stdout.trim().is_empty() => Some(pkg),
                    _ => None,
                }
            })
            .buffered(PIDOF_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
        running.into_iter().flatten().collect()
    }

    pub async fn daemon_report(&self) -> Value {
        match self.backend() {
            Backend::Demo(demo) => demo.status_document(),
            Backend::Live => self.call(&DaemonRequest::Status).await.to_document(),
        }
    }
}

fn to_object<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CommandOutput;
    use crate::model::{MonitorPath, RedirectRule, MONITOR_PATHS_KEY};
    use crate::testing::{json_payload, MockHost};
    use serde_json::json;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn layout(dir: &TempDir) -> StoreLayout {
        StoreLayout {
            config_dir: dir.path().join("config"),
            log_dir: dir.path().join("logs"),
            temp_dir: dir.path().join("tmp"),
        }
    }

    /// Real files, no daemon binary.
    fn offline_engine(dir: &TempDir) -> (Arc<MockHost>, ConfigSyncEngine) {
        let host = Arc::new(MockHost::shell().with_packages(&["com.a", "com.b"]));
        let missing = dir.path().join("bin").join("daemonctl");
        let engine = ConfigSyncEngine::new(
            host.clone(),
            missing.to_string_lossy().to_string(),
            layout(dir),
        );
        (host, engine)
    }

    /// Every command answered from the queue, then empty success.
    fn scripted_engine(dir: &TempDir) -> (Arc<MockHost>, ConfigSyncEngine) {
        let host = Arc::new(MockHost::default());
        let engine = ConfigSyncEngine::new(host.clone(), "daemonctl", layout(dir));
        (host, engine)
    }

    fn daemon_error(status_code: i32, code: &str) -> CommandOutput {
        CommandOutput {
            status_code,
            stdout: String::new(),
            stderr: format!(r#"{{"ok":false,"error":{{"code":"{code}","message":"failed"}}}}"#),
        }
    }

    fn read_json(path: &std::path::Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    fn rules() -> Vec<RedirectRule> {
        vec![RedirectRule::new("/sdcard/Download/", "/sdcard/Sandbox/")]
    }

    #[tokio::test]
    async fn missing_daemon_with_working_host_means_file_fallback() {
        let dir = tempdir().unwrap();
        let (_, engine) = offline_engine(&dir);
        let status = engine.check_daemon().await;
        assert!(!status.online);
        assert_eq!(engine.mode(), OperatingMode::LiveFileFallback);
    }

    #[tokio::test]
    async fn saves_fall_back_to_files_and_read_back() {
        let dir = tempdir().unwrap();
        let (host, engine) = offline_engine(&dir);
        engine.check_daemon().await;

        let saved = engine
            .save_app_config(
                "com.a",
                AppConfigPatch::new().enabled(true).redirect_rules(rules()),
            )
            .await;
        assert!(saved);
        assert_eq!(host.notifications().len(), 1);

        let fresh = offline_engine(&dir).1;
        let read = fresh.get_app_config("com.a").await.unwrap();
        assert!(read.enabled);
        assert_eq!(read.redirect_rules, rules());
        assert_eq!(engine.app_configs()["com.a"], read);
    }

    #[tokio::test]
    async fn partial_save_keeps_untouched_fields() {
        let dir = tempdir().unwrap();
        let (_, first) = offline_engine(&dir);
        assert!(
            first
                .save_app_config("com.a", AppConfigPatch::new().redirect_rules(rules()))
                .await
        );

        // A new process has an empty mirror; the stored rules must survive.
        let (_, second) = offline_engine(&dir);
        assert!(
            second
                .save_app_config("com.a", AppConfigPatch::new().enabled(true))
                .await
        );
        let stored = read_json(&layout(&dir).app_path("com.a"));
        assert_eq!(stored["enabled"], true);
        assert_eq!(stored["redirectRules"][0]["src"], "/sdcard/Download/");
    }

    #[tokio::test]
    async fn monitor_paths_never_reach_app_files() {
        let dir = tempdir().unwrap();
        let (_, engine) = offline_engine(&dir);
        let patch = AppConfigPatch::from_value(json!({
            "enabled": true,
            "monitorPaths": [{"path": "/sdcard", "ops": ["open"]}]
        }))
        .unwrap();
        assert!(engine.save_app_config("com.a", patch).await);
        let stored = read_json(&layout(&dir).app_path("com.a"));
        assert!(stored.get(MONITOR_PATHS_KEY).is_none());
    }

    #[tokio::test]
    async fn monitor_paths_never_reach_daemon_payloads() {
        let dir = tempdir().unwrap();
        let host = Arc::new(MockHost::default());
        let engine = ConfigSyncEngine::new(host.clone(), "daemonctl", layout(&dir));
        // cat for the base config, then the daemon's app.set answer.
        host.push_stdout("{}");
        host.push_stdout(r#"{"ok":false,"error":{"code":"E_NOT_FOUND","message":"none"}}"#);
        host.push_stdout(r#"{"ok":true,"data":{"configVersion":2}}"#);
        let patch = AppConfigPatch::from_value(json!({
            "enabled": true,
            "monitorPaths": []
        }))
        .unwrap();
        assert!(engine.save_app_config("com.a", patch).await);

        let set = host
            .commands()
            .into_iter()
            .find(|cmd| cmd.contains("'app' 'set'"))
            .unwrap();
        let payload = json_payload(&set).unwrap();
        assert_eq!(payload["enabled"], true);
        assert!(payload.get(MONITOR_PATHS_KEY).is_none());
        assert_eq!(payload["redirectRules"], json!([]));
    }

    #[tokio::test]
    async fn queued_saves_apply_in_arrival_order() {
        let dir = tempdir().unwrap();
        let (host, engine) = offline_engine(&dir);
        let first = AppConfigPatch::new().enabled(false).redirect_rules(rules());
        let second = AppConfigPatch::new().enabled(true);
        let (a, b) = tokio::join!(
            engine.save_app_config("com.a", first),
            engine.save_app_config("com.a", second),
        );
        assert!(a && b);

        let stored = read_json(&layout(&dir).app_path("com.a"));
        assert_eq!(stored["enabled"], true);
        assert_eq!(stored["redirectRules"][0]["dst"], "/sdcard/Sandbox/");

        let sets: Vec<Value> = host
            .commands()
            .iter()
            .filter_map(|cmd| json_payload(cmd))
            .collect();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0]["enabled"], false);
        assert_eq!(sets[1]["enabled"], true);
        assert_eq!(sets[1]["redirectRules"], sets[0]["redirectRules"]);
    }

    #[tokio::test]
    async fn failed_write_leaves_mirror_alone_and_notifies_once() {
        let dir = tempdir().unwrap();
        let host = Arc::new(MockHost::default());
        let engine = ConfigSyncEngine::new(host.clone(), "daemonctl", layout(&dir));
        host.push_stdout("{}");
        host.push_stdout(r#"{"ok":false,"error":{"code":"E_NOT_FOUND","message":"none"}}"#);
        host.push_output(CommandOutput {
            status_code: 10,
            stdout: String::new(),
            stderr: r#"{"ok":false,"error":{"code":"E_DAEMON_UNREACHABLE","message":"down"}}"#
                .to_string(),
        });
        host.push_output(CommandOutput {
            status_code: 1,
            stdout: String::new(),
            stderr: "mkdir: permission denied".to_string(),
        });
        assert!(
            !engine
                .save_app_config("com.a", AppConfigPatch::new().enabled(true))
                .await
        );
        assert!(engine.app_configs().is_empty());
        let notes = host.notifications();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].starts_with("Save failed"));
    }

    #[tokio::test]
    async fn transport_failure_downgrades_live_mode() {
        let dir = tempdir().unwrap();
        let host = Arc::new(MockHost::default());
        let engine = ConfigSyncEngine::new(host.clone(), "daemonctl", layout(&dir));
        host.push_stdout(r#"{"ok":true,"data":{"version":"1.2.0","pid":7,"configVersion":1}}"#);
        let status = engine.check_daemon().await;
        assert_eq!(status.version, "1.2.0");
        assert_eq!(engine.mode(), OperatingMode::Live);

        host.push_output(CommandOutput {
            status_code: 10,
            stdout: String::new(),
            stderr: r#"{"ok":false,"error":{"code":"E_DAEMON_UNREACHABLE","message":"socket gone"}}"#
                .to_string(),
        });
        engine.daemon_report().await;
        assert_eq!(engine.mode(), OperatingMode::LiveFileFallback);
        assert!(!engine.daemon_status().online);
    }

    #[tokio::test]
    async fn absent_host_switches_to_demo_and_saves_stay_in_memory() {
        let dir = tempdir().unwrap();
        let host = Arc::new(MockHost::unavailable());
        let engine = ConfigSyncEngine::new(host.clone(), "daemonctl", layout(&dir));
        let status = engine.check_daemon().await;
        assert!(status.online);
        assert_eq!(status.version, crate::demo::DEMO_VERSION);
        assert_eq!(engine.mode(), OperatingMode::Demo);
        let calls_after_check = host.commands().len();

        assert!(
            engine
                .save_app_config("com.example.demo", AppConfigPatch::new().enabled(false))
                .await
        );
        assert_eq!(host.commands().len(), calls_after_check);
        let config = engine.get_app_config("com.example.demo").await.unwrap();
        assert!(!config.enabled);
        assert_eq!(config.redirect_rules.len(), 1);
        assert!(!dir.path().join("config").exists());
    }

    #[tokio::test]
    async fn empty_tree_reads_as_empty_global() {
        let dir = tempdir().unwrap();
        let (_, engine) = offline_engine(&dir);
        let global = engine.load_global_config().await;
        assert_eq!(serde_json::to_value(&global).unwrap(), json!({"monitorPaths": []}));
        assert!(engine.load_error().is_none());
    }

    #[tokio::test]
    async fn global_save_splits_monitor_paths() {
        let dir = tempdir().unwrap();
        let (_, engine) = offline_engine(&dir);
        let mut global = GlobalConfig::recommended();
        global.monitor_paths = Some(vec![MonitorPath::new("/sdcard/DCIM", &["create", "delete"])]);
        assert!(engine.save_global_config(global).await);

        let layout = layout(&dir);
        assert!(read_json(&layout.global_path()).get(MONITOR_PATHS_KEY).is_none());
        assert_eq!(read_json(&layout.monitor_path())["paths"][0]["path"], "/sdcard/DCIM");

        let mut without_monitor = GlobalConfig::recommended();
        without_monitor.monitor_paths = None;
        without_monitor.log_level = Some("debug".to_string());
        assert!(engine.save_global_config(without_monitor).await);
        assert_eq!(read_json(&layout.monitor_path())["paths"][0]["ops"][1], "delete");
        let unified = engine.load_global_config().await;
        assert_eq!(unified.log_level.as_deref(), Some("debug"));
        assert_eq!(unified.monitor_paths_or_empty().len(), 1);
    }

    #[tokio::test]
    async fn catalogue_is_deduplicated_and_partitioned() {
        let dir = tempdir().unwrap();
        let (_, engine) = offline_engine(&dir);
        let apps = engine.load_apps(PackageScope::All).await;
        let ids: Vec<&str> = apps.iter().map(|a| a.package_id.as_str()).collect();
        assert_eq!(ids, vec!["com.a", "com.b"]);

        assert!(
            engine
                .save_app_config("com.b", AppConfigPatch::new().redirect_rules(rules()))
                .await
        );
        let with: Vec<String> = engine
            .apps_with_rules()
            .into_iter()
            .map(|a| a.package_id)
            .collect();
        let without: Vec<String> = engine
            .apps_without_rules()
            .into_iter()
            .map(|a| a.package_id)
            .collect();
        assert_eq!(with, vec!["com.b"]);
        assert_eq!(without, vec!["com.a"]);
    }

    #[tokio::test]
    async fn delete_removes_file_and_mirror_entry() {
        let dir = tempdir().unwrap();
        let (_, engine) = offline_engine(&dir);
        assert!(
            engine
                .save_app_config("com.a", AppConfigPatch::new().enabled(true))
                .await
        );
        assert!(engine.delete_app_config("com.a").await);
        assert!(!layout(&dir).app_path("com.a").exists());
        assert!(engine.app_configs().is_empty());
        assert!(engine.get_app_config("com.a").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_files() {
        let source_dir = tempdir().unwrap();
        let (_, source) = offline_engine(&source_dir);
        assert!(
            source
                .save_app_config("com.a", AppConfigPatch::new().enabled(true).redirect_rules(rules()))
                .await
        );
        assert!(source.save_global_config(GlobalConfig::recommended()).await);
        let snapshot = source.export_snapshot().await;
        assert_eq!(snapshot.apps.len(), 1);

        let target_dir = tempdir().unwrap();
        let (host, target) = offline_engine(&target_dir);
        assert!(target.import_snapshot(snapshot.clone()).await);
        assert_eq!(host.notifications().len(), 1);
        assert_eq!(target.export_snapshot().await, snapshot);
    }

    #[tokio::test]
    async fn import_writes_app_named_like_global_file() {
        let dir = tempdir().unwrap();
        let (_, engine) = offline_engine(&dir);
        let mut apps = BTreeMap::new();
        apps.insert(
            "global".to_string(),
            AppConfig {
                enabled: true,
                redirect_rules: rules(),
                ..AppConfig::default()
            },
        );
        let snapshot = ConfigSnapshot {
            version: 1,
            global: GlobalConfig::recommended(),
            apps,
        };
        assert!(engine.import_snapshot(snapshot).await);

        let layout = layout(&dir);
        let app = read_json(&layout.app_path("global"));
        assert_eq!(app["enabled"], true);
        assert_eq!(app["redirectRules"][0]["dst"], "/sdcard/Sandbox/");
        assert_eq!(read_json(&layout.global_path())["maxLogSizeMB"], 64);
        assert!(engine.load_error().is_none());
    }

    #[tokio::test]
    async fn clear_logs_rejects_empty_package() {
        let dir = tempdir().unwrap();
        let (host, engine) = offline_engine(&dir);
        assert!(!engine.clear_logs("").await);
        assert_eq!(host.notifications().len(), 1);
    }

    #[tokio::test]
    async fn demo_data_serves_logs_and_running_apps() {
        let dir = tempdir().unwrap();
        let (host, engine) = offline_engine(&dir);
        engine.load_demo_data().await;
        assert_eq!(engine.mode(), OperatingMode::Demo);
        assert_eq!(engine.tail_logs(Some("com.example.demo"), 10).await.len(), 3);
        assert_eq!(engine.running_apps().await.len(), 2);
        assert!(engine.clear_logs("com.example.demo").await);
        assert!(engine.tail_logs(None, 10).await.is_empty());
        assert!(host.commands().is_empty());
    }

    #[tokio::test]
    async fn corrupt_app_file_falls_back_to_daemon() {
        let dir = tempdir().unwrap();
        let (host, engine) = scripted_engine(&dir);
        host.push_stdout("{not json");
        host.push_stdout(
            r#"{"ok":true,"data":{"app":{"enabled":true,"redirectRules":null,"monitorPaths":[],"note":"x"}}}"#,
        );

        let config = engine.get_app_config("com.a").await.unwrap();
        assert!(config.enabled);
        assert!(config.redirect_rules.is_empty());
        assert!(config.read_only_rules.is_empty());
        assert_eq!(config.extra.get("note"), Some(&json!("x")));
        assert!(!config.to_persisted().contains_key(MONITOR_PATHS_KEY));
        assert_eq!(engine.app_configs()["com.a"], config);
        assert!(host.commands()[1].contains("'app' 'get' '--pkg' 'com.a'"));
        assert!(engine.load_error().is_none());
    }

    #[tokio::test]
    async fn corrupt_global_files_fall_back_to_daemon_per_part() {
        let dir = tempdir().unwrap();
        let (host, engine) = scripted_engine(&dir);
        host.push_stdout("{broken global");
        host.push_stdout("{broken monitor");
        host.push_stdout(
            r#"{"ok":true,"data":{"global":{"logLevel":"debug","monitorPaths":[{"path":"/stale","ops":["open"]}]}}}"#,
        );
        host.push_stdout(r#"{"ok":true,"data":{"monitor":{"paths":[{"path":"/sdcard/","ops":["open"]}]}}}"#);

        let global = engine.load_global_config().await;
        assert_eq!(global.log_level.as_deref(), Some("debug"));
        let paths = global.monitor_paths_or_empty();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].path, "/sdcard/");
        assert_eq!(engine.global_config(), Some(global));
        assert!(engine.load_error().is_none());
        let commands = host.commands();
        assert!(commands[2].contains("'global' 'get'"));
        assert!(commands[3].contains("'monitor' 'get'"));
    }

    #[tokio::test]
    async fn unlistable_app_dir_falls_back_to_daemon() {
        let dir = tempdir().unwrap();
        let (host, engine) = scripted_engine(&dir);
        host.push_error(std::io::ErrorKind::PermissionDenied);
        host.push_stdout(r#"{"ok":true,"data":{"apps":[{"pkg":"com.a"},{"pkg":"com.b"}]}}"#);
        host.push_stdout(r#"{"ok":true,"data":{"app":{"enabled":true}}}"#);
        host.push_output(daemon_error(4, "E_NOT_FOUND"));

        let configs = engine.load_app_configs().await;
        assert_eq!(configs.keys().collect::<Vec<_>>(), vec!["com.a"]);
        assert!(configs["com.a"].enabled);
        assert!(configs["com.a"].redirect_rules.is_empty());
        assert_eq!(engine.app_configs(), configs);
        assert!(engine.load_error().is_none());
    }

    #[tokio::test]
    async fn null_app_list_reads_as_empty() {
        let dir = tempdir().unwrap();
        let (host, engine) = scripted_engine(&dir);
        host.push_error(std::io::ErrorKind::PermissionDenied);
        host.push_stdout(r#"{"ok":true,"data":{"apps":null}}"#);

        assert!(engine.load_app_configs().await.is_empty());
        assert!(engine.load_error().is_none());
        assert_eq!(host.commands().len(), 2);
    }

    #[tokio::test]
    async fn log_transport_failures_downgrade_live_mode() {
        let dir = tempdir().unwrap();
        let (host, engine) = scripted_engine(&dir);
        let ping = r#"{"ok":true,"data":{"version":"1.2.0"}}"#;

        host.push_stdout(ping);
        engine.check_daemon().await;
        assert_eq!(engine.mode(), OperatingMode::Live);
        host.push_output(daemon_error(10, "E_DAEMON_UNREACHABLE"));
        assert!(engine.tail_logs(Some("com.a"), 5).await.is_empty());
        assert_eq!(engine.mode(), OperatingMode::LiveFileFallback);

        host.push_stdout(ping);
        engine.check_daemon().await;
        host.push_output(daemon_error(1, "E_EXCEPTION"));
        assert!(engine.clear_logs("com.a").await);
        assert_eq!(engine.mode(), OperatingMode::LiveFileFallback);

        host.push_stdout(ping);
        engine.check_daemon().await;
        host.push_output(daemon_error(1, "E_IPC_TIMEOUT"));
        assert_eq!(engine.log_stats().await.entry_count, Some(0));
        assert_eq!(engine.mode(), OperatingMode::LiveFileFallback);
    }

    #[tokio::test]
    async fn log_tail_prefers_daemon_entries() {
        let dir = tempdir().unwrap();
        let (host, engine) = scripted_engine(&dir);
        host.push_stdout(r#"{"ok":true,"data":{"pkg":"P","entries":[{"ts":5,"pkg":"P"}]}}"#);
        let entries = engine.tail_logs(Some("P"), 10).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ts, 5);

        host.push_stdout(r#"{"ok":true,"data":{"pkg":"P","entries":null}}"#);
        assert!(engine.tail_logs(Some("P"), 10).await.is_empty());
        assert_eq!(host.commands().len(), 2);
    }

    #[tokio::test]
    async fn demo_import_replaces_stored_configs() {
        let dir = tempdir().unwrap();
        let (host, engine) = offline_engine(&dir);
        engine.load_demo_data().await;

        let mut apps = BTreeMap::new();
        apps.insert(
            "com.example.demo".to_string(),
            AppConfig {
                enabled: true,
                ..AppConfig::default()
            },
        );
        let snapshot = ConfigSnapshot {
            version: 1,
            global: GlobalConfig::recommended(),
            apps,
        };
        assert!(engine.import_snapshot(snapshot).await);
        let config = engine.get_app_config("com.example.demo").await.unwrap();
        assert!(config.enabled);
        assert!(config.redirect_rules.is_empty());
        assert!(config.read_only_rules.is_empty());
        assert!(host.commands().is_empty());
    }
}
