use crate::error::SrError;
use crate::store::StoreLayout;
use dirs::{config_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const SETTINGS_VERSION: u32 = 1;
pub const CONFIG_ENV: &str = "SRCTL_CONFIG";
pub const MODULE_DIR_ENV: &str = "SR_MODDIR";
pub const DEFAULT_MODULE_DIR: &str = "/data/adb/modules/StorageRedirect";

const SETTINGS_HEADER: &str = "\
# srctl client settings.
# Empty paths are derived from paths.module_dir.
# daemon.call_timeout_sec bounds every shell call; 0 disables the bound.
";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub version: u32,
    pub paths: PathSettings,
    pub daemon: DaemonSettings,
    pub demo: DemoSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PathSettings {
    pub module_dir: String,
    pub daemon_bin: String,
    pub config_dir: String,
    pub log_dir: String,
    pub temp_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSettings {
    pub call_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct DemoSettings {
    pub force: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            paths: PathSettings::default(),
            daemon: DaemonSettings::default(),
            demo: DemoSettings::default(),
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        let module_dir = env::var(MODULE_DIR_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODULE_DIR.to_string());
        Self {
            module_dir,
            daemon_bin: String::new(),
            config_dir: String::new(),
            log_dir: String::new(),
            temp_dir: String::new(),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            call_timeout_sec: 30,
        }
    }
}

impl Settings {
    pub fn module_dir(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.paths.module_dir))
    }

    pub fn daemon_bin(&self) -> PathBuf {
        self.derived(&self.paths.daemon_bin, "bin/daemonctl")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.derived(&self.paths.config_dir, "config")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.derived(&self.paths.log_dir, "logs")
    }

    pub fn temp_dir(&self) -> PathBuf {
        if self.paths.temp_dir.trim().is_empty() {
            return PathBuf::from("/tmp");
        }
        PathBuf::from(expand_path(&self.paths.temp_dir))
    }

    pub fn layout(&self) -> StoreLayout {
        StoreLayout {
            config_dir: self.config_dir(),
            log_dir: self.log_dir(),
            temp_dir: self.temp_dir(),
        }
    }

    fn derived(&self, explicit: &str, relative: &str) -> PathBuf {
        if explicit.trim().is_empty() {
            self.module_dir().join(relative)
        } else {
            PathBuf::from(expand_path(explicit))
        }
    }
}

pub fn resolve_settings_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let mut base = default_settings_dir();
    base.push("config.yaml");
    base
}

fn default_settings_dir() -> PathBuf {
    if let Some(mut base) = config_dir() {
        base.push("srctl");
        return base;
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("srctl");
    base
}

pub fn read_settings_from_str(content: &str) -> Result<Settings, SrError> {
    let settings: Settings = serde_yaml::from_str(content)?;
    if settings.version != SETTINGS_VERSION {
        return Err(SrError::Config(format!(
            "unsupported config version {}",
            settings.version
        )));
    }
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn read_settings(path: &Path) -> Result<Settings, SrError> {
    let content = fs::read_to_string(path)?;
    read_settings_from_str(&content)
}

/// Device installs usually have no settings file; defaults apply then.
pub fn load_settings(path: &Path) -> Result<Settings, SrError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    read_settings(path)
}

pub fn validate_settings(settings: &Settings) -> Result<(), SrError> {
    let checks = [
        ("paths.module_dir", settings.module_dir()),
        ("paths.daemon_bin", settings.daemon_bin()),
        ("paths.config_dir", settings.config_dir()),
        ("paths.log_dir", settings.log_dir()),
        ("paths.temp_dir", settings.temp_dir()),
    ];
    for (field, path) in checks {
        let text = path.to_string_lossy();
        if !path.is_absolute() {
            return Err(SrError::Config(format!(
                "{field} must be an absolute path, got {text}"
            )));
        }
        if text.contains('\n') || text.contains('\r') {
            return Err(SrError::Config(format!(
                "{field} must not contain newlines"
            )));
        }
    }
    Ok(())
}

pub fn default_settings_yaml() -> Result<String, SrError> {
    let body = serde_yaml::to_string(&Settings::default())?;
    Ok(format!("{SETTINGS_HEADER}{body}"))
}

pub fn ensure_parent(path: &Path) -> Result<(), SrError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    let trimmed = input.trim();
    if let Some(stripped) = trimmed.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    trimmed.to_string()
}
