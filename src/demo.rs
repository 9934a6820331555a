use crate::logs::newest_entries_from;
use crate::model::{
    AppConfig, AppConfigPatch, DaemonStatus, Decision, GlobalConfig, LogEntry, LogStats,
    MonitorFile, MonitorPath, Outcome, PackageInfo, PackageScope, ReadOnlyRule, RedirectRule,
};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

pub const DEMO_VERSION: &str = "1.0.0-demo";

#[derive(Debug)]
pub struct DemoShadow {
    state: Mutex<DemoState>,
}

#[derive(Debug, Clone)]
struct DemoState {
    apps: Vec<PackageInfo>,
    configs: BTreeMap<String, AppConfig>,
    global: GlobalConfig,
    logs: Vec<LogEntry>,
}

impl Default for DemoShadow {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoShadow {
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            state: Mutex::new(DemoState {
                apps: demo_apps(),
                configs: demo_configs(),
                global: GlobalConfig::recommended().with_monitor(MonitorFile {
                    paths: vec![
                        MonitorPath::new("/storage/emulated/0/", &["open", "write", "delete"]),
                        MonitorPath::new("/storage/emulated/0/Download/", &["open", "write"]),
                    ],
                }),
                logs: demo_logs(now),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DemoState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            online: true,
            version: DEMO_VERSION.to_string(),
        }
    }

    pub fn status_document(&self) -> Value {
        let state = self.state();
        let size: usize = state
            .logs
            .iter()
            .filter_map(|entry| serde_json::to_string(entry).ok())
            .map(|line| line.len() + 1)
            .sum();
        json!({
            "ok": true,
            "daemon": {"pid": 1234, "version": DEMO_VERSION},
            "config": {"version": 1},
            "runtime": {
                "connectedProcesses": 2,
                "appsActive": state.configs.values().filter(|c| c.enabled).count(),
            },
            "logs": {"totalSizeBytes": size, "maxSizeBytes": 64 * 1024 * 1024},
        })
    }

    pub fn apps(&self, scope: PackageScope) -> Vec<PackageInfo> {
        self.state()
            .apps
            .iter()
            .filter(|app| match scope {
                PackageScope::User => !app.is_system_app,
                PackageScope::System => app.is_system_app,
                PackageScope::All => true,
            })
            .cloned()
            .collect()
    }

    pub fn app_config(&self, pkg: &str) -> Option<AppConfig> {
        self.state().configs.get(pkg).cloned()
    }

    pub fn app_configs(&self) -> BTreeMap<String, AppConfig> {
        self.state().configs.clone()
    }

    pub fn save_app_config(&self, pkg: &str, patch: &AppConfigPatch) -> AppConfig {
        let mut state = self.state();
        let base = state.configs.get(pkg).cloned().unwrap_or_default();
        let merged = patch.apply_to(&base);
        state.configs.insert(pkg.to_string(), merged.clone());
        merged
    }

    pub fn replace_app_config(&self, pkg: &str, config: AppConfig) {
        self.state().configs.insert(pkg.to_string(), config);
    }

    pub fn delete_app(&self, pkg: &str) -> bool {
        self.state().configs.remove(pkg).is_some()
    }

    pub fn global(&self) -> GlobalConfig {
        self.state().global.clone()
    }

    /// `monitor_paths: None` keeps the current list.
    pub fn save_global(&self, global: &GlobalConfig) -> GlobalConfig {
        let mut state = self.state();
        let mut next = global.clone();
        if next.monitor_paths.is_none() {
            next.monitor_paths = state.global.monitor_paths.clone();
        }
        state.global = next.clone();
        next
    }

    pub fn tail(&self, pkg: Option<&str>, n: usize) -> Vec<LogEntry> {
        newest_entries_from(self.state().logs.clone(), pkg, n)
    }

    pub fn clear(&self, pkg: &str) {
        self.state().logs.retain(|entry| entry.pkg != pkg);
    }

    pub fn stats(&self) -> LogStats {
        let state = self.state();
        let apps: BTreeSet<&str> = state.logs.iter().map(|e| e.pkg.as_str()).collect();
        let size: usize = state
            .logs
            .iter()
            .filter_map(|entry| serde_json::to_string(entry).ok())
            .map(|line| line.len() + 1)
            .sum();
        LogStats {
            total_size_bytes: size as u64,
            max_size_bytes: Some(64 * 1024 * 1024),
            entry_count: Some(state.logs.len() as u64),
            app_count: Some(apps.len() as u64),
            extra: Map::new(),
        }
    }

    pub fn running_apps(&self) -> Vec<String> {
        vec!["com.example.demo".to_string(), "com.tencent.mm".to_string()]
    }
}

fn app(
    pkg: &str,
    label: &str,
    version: (&str, i64),
    is_system_app: bool,
    uid: u32,
    user: u32,
) -> PackageInfo {
    PackageInfo {
        package_id: pkg.to_string(),
        label: label.to_string(),
        version_name: version.0.to_string(),
        version_code: version.1,
        is_system_app,
        uid,
        user_namespace_id: user,
    }
}

fn demo_apps() -> Vec<PackageInfo> {
    vec![
        app("com.example.demo", "Demo App", ("1.0.0", 1), false, 10123, 0),
        app("com.tencent.mm", "WeChat", ("8.0.0", 800), false, 10124, 0),
        app("com.tencent.mm", "WeChat", ("8.0.0", 800), false, 10124, 10),
        app("com.android.settings", "Settings", ("12.0", 1200), true, 1000, 0),
        app("com.google.android.apps.photos", "Google Photos", ("6.0", 600), false, 10125, 0),
        app("com.taobao.taobao", "Taobao", ("10.0", 1000), false, 10126, 0),
        app("com.sina.weibo", "Weibo", ("12.0", 1200), false, 10127, 0),
        app("com.baidu.netdisk", "Baidu Netdisk", ("11.0", 1100), false, 10128, 0),
        app("com.android.chrome", "Chrome", ("100.0", 10000), true, 10129, 0),
    ]
}

fn demo_configs() -> BTreeMap<String, AppConfig> {
    let mut configs = BTreeMap::new();
    configs.insert(
        "com.example.demo".to_string(),
        AppConfig {
            enabled: true,
            redirect_rules: vec![RedirectRule::new(
                "/storage/emulated/0/Download/",
                "/storage/emulated/0/Download/Demo/",
            )],
            read_only_rules: vec![ReadOnlyRule::new("/storage/emulated/0/DCIM/")],
            extra: Map::new(),
        },
    );
    configs.insert(
        "com.tencent.mm".to_string(),
        AppConfig {
            enabled: true,
            redirect_rules: vec![RedirectRule::new(
                "/storage/emulated/0/Pictures/",
                "/storage/emulated/0/Android/data/com.tencent.mm/files/Pictures/",
            )],
            read_only_rules: Vec::new(),
            extra: Map::new(),
        },
    );
    configs
}

fn demo_logs(now: i64) -> Vec<LogEntry> {
    let entry = |age_ms: i64, op: &str, path: &str, mapped: Option<&str>, decision, result| {
        LogEntry {
            ts: now - age_ms,
            pkg: "com.example.demo".to_string(),
            proc: "com.example.demo".to_string(),
            pid: 1234,
            tid: 1234,
            uid: 10123,
            op: op.to_string(),
            path: path.to_string(),
            mapped: mapped.map(str::to_string),
            decision,
            result,
            errno: None,
            extra: Map::new(),
        }
    };
    let mut denied = entry(
        5_000,
        "write",
        "/storage/emulated/0/DCIM/photo.jpg",
        None,
        Decision::DenyRo,
        Outcome::Fail,
    );
    denied.errno = Some(13);
    vec![
        entry(
            10_000,
            "open",
            "/storage/emulated/0/Download/test.txt",
            Some("/storage/emulated/0/Download/Demo/test.txt"),
            Decision::Redirect,
            Outcome::Ok,
        ),
        denied,
        entry(
            3_000,
            "mkdir",
            "/storage/emulated/0/Download/NewFolder",
            Some("/storage/emulated/0/Download/Demo/NewFolder"),
            Decision::Redirect,
            Outcome::Ok,
        ),
    ]
}
