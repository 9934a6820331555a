use crate::codec::encode_base64;
use crate::error::SrError;
use crate::host::{shell_single_quote, CapabilityHost, CommandOutput};
use crate::model::{validate_package_id, AppConfig, GlobalConfig, MonitorFile};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const GLOBAL_FILE: &str = "global.json";
pub const MONITOR_FILE: &str = "monitor_paths.json";
pub const APPS_DIR: &str = "apps";
pub const ACCESS_LOG_FILE: &str = "access.log";

// Stays under the kernel's per-argument limit; a multiple of 4 so every
// chunk is itself valid base64.
const STAGE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl StoreLayout {
    pub fn global_path(&self) -> PathBuf {
        self.config_dir.join(GLOBAL_FILE)
    }

    pub fn monitor_path(&self) -> PathBuf {
        self.config_dir.join(MONITOR_FILE)
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.config_dir.join(APPS_DIR)
    }

    pub fn app_path(&self, pkg: &str) -> PathBuf {
        self.apps_dir().join(format!("{pkg}.json"))
    }

    pub fn access_log_path(&self) -> PathBuf {
        self.log_dir.join(ACCESS_LOG_FILE)
    }
}

#[derive(Clone)]
pub struct FileConfigStore {
    host: Arc<dyn CapabilityHost>,
    layout: StoreLayout,
}

impl FileConfigStore {
    pub fn new(host: Arc<dyn CapabilityHost>, layout: StoreLayout) -> Self {
        Self { host, layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub async fn read_global(&self) -> Result<GlobalConfig, SrError> {
        let value = self.read_json_or(&self.layout.global_path(), "{}").await?;
        let mut global: GlobalConfig = serde_json::from_value(value)?;
        global.monitor_paths = None;
        Ok(global)
    }

    pub async fn read_monitor(&self) -> Result<MonitorFile, SrError> {
        let value = self
            .read_json_or(&self.layout.monitor_path(), r#"{"paths":[]}"#)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn read_app(&self, pkg: &str) -> Result<Option<AppConfig>, SrError> {
        validate_package_id(pkg)?;
        let value = self.read_json_or(&self.layout.app_path(pkg), "{}").await?;
        match &value {
            Value::Object(map) if map.is_empty() => Ok(None),
            Value::Object(_) => Ok(Some(AppConfig::normalize(&value))),
            other => Err(SrError::Config(format!(
                "app config for {pkg} is not a JSON object: {other}"
            ))),
        }
    }

    pub async fn write_global(&self, global: &GlobalConfig) -> Result<(), SrError> {
        let (trimmed, _) = global.split();
        self.write_json(&self.layout.global_path(), &trimmed).await
    }

    pub async fn write_monitor(&self, monitor: &MonitorFile) -> Result<(), SrError> {
        self.write_json(&self.layout.monitor_path(), monitor).await
    }

    pub async fn write_app(&self, pkg: &str, config: &AppConfig) -> Result<(), SrError> {
        validate_package_id(pkg)?;
        self.write_json(&self.layout.app_path(pkg), &config.to_persisted())
            .await
    }

    pub async fn delete_app(&self, pkg: &str) -> Result<(), SrError> {
        validate_package_id(pkg)?;
        self.remove(&self.layout.app_path(pkg)).await
    }

    /// Unparseable files are left out.
    pub async fn list_apps(&self) -> Result<BTreeMap<String, AppConfig>, SrError> {
        let command = format!(
            "ls {}/*.json 2>/dev/null || echo ''",
            shell_single_quote(&path_text(&self.layout.apps_dir()))
        );
        let output = self.run(&command).await?;
        let packages: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.ends_with(".json"))
            .filter_map(|line| {
                Path::new(line)
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
            })
            .filter(|pkg| validate_package_id(pkg).is_ok())
            .collect();

        let reads = join_all(packages.iter().map(|pkg| self.read_app(pkg))).await;
        let mut apps = BTreeMap::new();
        for (pkg, read) in packages.into_iter().zip(reads) {
            match read {
                Ok(Some(config)) => {
                    apps.insert(pkg, config);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(event = "store.app_skipped", pkg = %pkg, error = %err);
                }
            }
        }
        Ok(apps)
    }

    pub async fn exists(&self, path: &Path) -> Result<bool, SrError> {
        let command = format!("test -f {}", shell_single_quote(&path_text(path)));
        let output = self.run(&command).await?;
        Ok(output.success())
    }

    pub async fn read_text(&self, path: &Path) -> Result<String, SrError> {
        let command = format!("cat {}", shell_single_quote(&path_text(path)));
        let output = self.run(&command).await?;
        if !output.success() {
            return Err(command_failed("read", path, &output));
        }
        Ok(output.stdout)
    }

    pub async fn write_text(&self, path: &Path, content: &str) -> Result<(), SrError> {
        let target = path_text(path);
        let parent = path
            .parent()
            .map(path_text)
            .unwrap_or_else(|| ".".to_string());
        let staging = path_text(&self.staging_path(path));
        let decoded = format!("{target}.srctl-tmp");

        let result = self
            .stage_and_decode(&parent, &staging, &decoded, &target, content)
            .await;
        let cleanup = format!(
            "rm -f {} {}",
            shell_single_quote(&staging),
            shell_single_quote(&decoded)
        );
        if let Err(err) = self.run(&cleanup).await {
            debug!(event = "store.cleanup_failed", path = %target, error = %err);
        }
        if let Err(err) = &result {
            warn!(event = "store.write_failed", path = %target, error = %err);
        }
        result
    }

    // `apps/global.json` and `global.json` may be written at the same time.
    fn staging_path(&self, target: &Path) -> PathBuf {
        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "payload".to_string());
        let hash = stable_path_hash(target);
        self.layout
            .temp_dir
            .join(format!("srctl_{hash:016x}_{file_name}.b64"))
    }

    async fn stage_and_decode(
        &self,
        parent: &str,
        staging: &str,
        decoded: &str,
        target: &str,
        content: &str,
    ) -> Result<(), SrError> {
        let mkdir = format!(
            "mkdir -p {} {}",
            shell_single_quote(parent),
            shell_single_quote(&path_text(&self.layout.temp_dir))
        );
        self.run_checked(&mkdir, "mkdir", target).await?;

        let encoded = encode_base64(content);
        let truncate = format!(": > {}", shell_single_quote(staging));
        self.run_checked(&truncate, "stage", target).await?;
        let mut rest = encoded.as_str();
        while !rest.is_empty() {
            let (chunk, tail) = rest.split_at(rest.len().min(STAGE_CHUNK));
            let append = format!(
                "printf '%s' {} >> {}",
                shell_single_quote(chunk),
                shell_single_quote(staging)
            );
            self.run_checked(&append, "stage", target).await?;
            rest = tail;
        }

        let decode = format!(
            "base64 -d {} > {} && mv -f {} {}",
            shell_single_quote(staging),
            shell_single_quote(decoded),
            shell_single_quote(decoded),
            shell_single_quote(target)
        );
        self.run_checked(&decode, "decode", target).await
    }

    pub async fn remove(&self, path: &Path) -> Result<(), SrError> {
        let command = format!("rm -f {}", shell_single_quote(&path_text(path)));
        self.run_checked(&command, "remove", &path_text(path)).await
    }

    async fn read_json_or(&self, path: &Path, fallback: &str) -> Result<Value, SrError> {
        let command = format!(
            "cat {} 2>/dev/null || echo {}",
            shell_single_quote(&path_text(path)),
            shell_single_quote(fallback)
        );
        let output = self.run(&command).await?;
        let text = output.stdout.trim();
        if text.is_empty() {
            return Ok(serde_json::from_str(fallback)?);
        }
        Ok(serde_json::from_str(text)?)
    }

    async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), SrError> {
        let text = serde_json::to_string_pretty(value)?;
        self.write_text(path, &text).await
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, SrError> {
        Ok(self.host.execute(command).await?)
    }

    async fn run_checked(&self, command: &str, step: &str, target: &str) -> Result<(), SrError> {
        let output = self.run(command).await?;
        if !output.success() {
            return Err(command_failed(step, Path::new(target), &output));
        }
        Ok(())
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

// FNV-1a, stable across runs and platforms.
fn stable_path_hash(path: &Path) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in path.to_string_lossy().bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn command_failed(step: &str, path: &Path, output: &CommandOutput) -> SrError {
    SrError::Process(format!(
        "{step} failed for {} (exit {}): {}",
        path.display(),
        output.status_code,
        output.stderr.trim()
    ))
}
