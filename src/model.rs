use crate::error::SrError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const MONITOR_PATHS_KEY: &str = "monitorPaths";

const APP_KNOWN_KEYS: [&str; 4] = ["enabled", "redirectRules", "readOnlyRules", MONITOR_PATHS_KEY];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageScope {
    User,
    System,
    All,
}

impl PackageScope {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageScope::User => "user",
            PackageScope::System => "system",
            PackageScope::All => "all",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    #[serde(rename = "packageName", alias = "packageId", default)]
    pub package_id: String,
    #[serde(rename = "appLabel", alias = "label", default)]
    pub label: String,
    #[serde(rename = "versionName", default)]
    pub version_name: String,
    #[serde(rename = "versionCode", default)]
    pub version_code: i64,
    #[serde(rename = "isSystem", alias = "isSystemApp", default)]
    pub is_system_app: bool,
    #[serde(default)]
    pub uid: u32,
    #[serde(rename = "userId", alias = "userNamespaceId", default)]
    pub user_namespace_id: u32,
}

impl PackageInfo {
    pub fn new(package_id: &str) -> Self {
        Self {
            package_id: package_id.to_string(),
            label: package_id.to_string(),
            version_name: String::new(),
            version_code: 0,
            is_system_app: false,
            uid: 0,
            user_namespace_id: 0,
        }
    }

    pub fn sanitized(mut self) -> Option<Self> {
        if self.package_id.trim().is_empty() {
            return None;
        }
        if self.label.trim().is_empty() {
            self.label = self.package_id.clone();
        }
        Some(self)
    }
}

/// Package ids double as file names under `apps/`.
pub fn validate_package_id(pkg: &str) -> Result<(), SrError> {
    let valid = !pkg.is_empty()
        && !pkg.starts_with('.')
        && pkg
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SrError::Config(format!("invalid package name: {pkg:?}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedirectRule {
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub dst: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RedirectRule {
    pub fn new(src: &str, dst: &str) -> Self {
        Self {
            src: src.to_string(),
            dst: dst.to_string(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadOnlyRule {
    #[serde(default)]
    pub path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReadOnlyRule {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub redirect_rules: Vec<RedirectRule>,
    #[serde(default)]
    pub read_only_rules: Vec<ReadOnlyRule>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppConfig {
    // `enabled` only for a JSON `true`. Bad rule lists read as empty.
    pub fn normalize(raw: &Value) -> Self {
        let empty = Map::new();
        let obj = raw.as_object().unwrap_or(&empty);
        let extra = obj
            .iter()
            .filter(|(key, _)| !APP_KNOWN_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self {
            enabled: matches!(obj.get("enabled"), Some(Value::Bool(true))),
            redirect_rules: rules_from(obj.get("redirectRules")),
            read_only_rules: rules_from(obj.get("readOnlyRules")),
            extra,
        }
    }

    pub fn has_rules(&self) -> bool {
        self.enabled || !self.redirect_rules.is_empty() || !self.read_only_rules.is_empty()
    }

    pub fn to_persisted(&self) -> Map<String, Value> {
        let mut map = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.remove(MONITOR_PATHS_KEY);
        map
    }

    pub fn validate(&self) -> Result<(), SrError> {
        for (idx, rule) in self.redirect_rules.iter().enumerate() {
            if !rule.src.starts_with('/') {
                return Err(SrError::Config(format!(
                    "redirectRules[{idx}].src must be an absolute path"
                )));
            }
            if !rule.dst.starts_with('/') {
                return Err(SrError::Config(format!(
                    "redirectRules[{idx}].dst must be an absolute path"
                )));
            }
        }
        for (idx, rule) in self.read_only_rules.iter().enumerate() {
            if !rule.path.starts_with('/') {
                return Err(SrError::Config(format!(
                    "readOnlyRules[{idx}].path must be an absolute path"
                )));
            }
        }
        Ok(())
    }
}

fn rules_from<T: DeserializeOwned>(value: Option<&Value>) -> Vec<T> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter(|item| item.is_object())
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfigPatch {
    fields: Map<String, Value>,
}

impl AppConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self, SrError> {
        match value {
            Value::Object(mut fields) => {
                fields.remove(MONITOR_PATHS_KEY);
                Ok(Self { fields })
            }
            other => Err(SrError::Config(format!(
                "app config must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.fields.insert("enabled".to_string(), Value::Bool(enabled));
        self
    }

    pub fn redirect_rules(mut self, rules: Vec<RedirectRule>) -> Self {
        self.fields.insert(
            "redirectRules".to_string(),
            serde_json::to_value(rules).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
        self
    }

    pub fn read_only_rules(mut self, rules: Vec<ReadOnlyRule>) -> Self {
        self.fields.insert(
            "readOnlyRules".to_string(),
            serde_json::to_value(rules).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn apply_to(&self, base: &AppConfig) -> AppConfig {
        let mut merged = base.to_persisted();
        for (key, value) in &self.fields {
            merged.insert(key.clone(), value.clone());
        }
        AppConfig::normalize(&Value::Object(merged))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorPath {
    #[serde(default)]
    pub path: String,
    #[serde(default, alias = "operations")]
    pub ops: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MonitorPath {
    pub fn new(path: &str, ops: &[&str]) -> Self {
        Self {
            path: path.to_string(),
            ops: ops.iter().map(|op| op.to_string()).collect(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorFile {
    #[serde(default)]
    pub paths: Vec<MonitorPath>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_check_interval: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessAttribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit_to_all_same_uid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit_to_isolated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit_to_child_process: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_unknown_policy: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UriPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_mapping_failed: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `monitor_paths: None` on a save leaves the monitor file alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(
        rename = "maxLogSizeMB",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_log_size_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdatePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_attribution: Option<ProcessAttribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<UriPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_paths: Option<Vec<MonitorPath>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GlobalConfig {
    pub fn recommended() -> Self {
        Self {
            monitor_enabled: Some(true),
            log_level: Some("info".to_string()),
            max_log_size_mb: Some(64),
            update: Some(UpdatePolicy {
                poll_interval_ms: Some(3000),
                op_check_interval: Some(50),
                extra: Map::new(),
            }),
            process_attribution: Some(ProcessAttribution {
                mode: Some("strict".to_string()),
                inherit_to_all_same_uid: Some(true),
                inherit_to_isolated: Some(true),
                inherit_to_child_process: Some(true),
                fallback_unknown_policy: Some("denyWriteOnMatchedPaths".to_string()),
                extra: Map::new(),
            }),
            uri: Some(UriPolicy {
                redirect_enabled: Some(true),
                on_mapping_failed: Some("enforceReadonlyAndMonitor".to_string()),
                extra: Map::new(),
            }),
            monitor_paths: Some(Vec::new()),
            extra: Map::new(),
        }
    }

    pub fn split(&self) -> (GlobalConfig, Option<MonitorFile>) {
        let mut trimmed = self.clone();
        let monitor = trimmed
            .monitor_paths
            .take()
            .map(|paths| MonitorFile { paths });
        trimmed.extra.remove(MONITOR_PATHS_KEY);
        (trimmed, monitor)
    }

    pub fn with_monitor(mut self, monitor: MonitorFile) -> Self {
        self.monitor_paths = Some(monitor.paths);
        self
    }

    pub fn monitor_paths_or_empty(&self) -> &[MonitorPath] {
        self.monitor_paths.as_deref().unwrap_or(&[])
    }

    pub fn validate(&self) -> Result<(), SrError> {
        if let Some(size) = self.max_log_size_mb {
            if !(8..=1024).contains(&size) {
                return Err(SrError::Config(
                    "maxLogSizeMB must be between 8 and 1024".to_string(),
                ));
            }
        }
        if let Some(mode) = self
            .process_attribution
            .as_ref()
            .and_then(|attr| attr.mode.as_deref())
        {
            if !matches!(mode, "strict" | "balanced" | "relaxed") {
                return Err(SrError::Config(
                    "processAttribution.mode must be strict, balanced, or relaxed".to_string(),
                ));
            }
        }
        for (idx, item) in self.monitor_paths_or_empty().iter().enumerate() {
            if !item.path.starts_with('/') {
                return Err(SrError::Config(format!(
                    "monitorPaths[{idx}].path must be an absolute path"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Decision {
    Redirect,
    DenyRo,
    Allow,
    #[default]
    Unknown,
    Other(String),
}

impl From<String> for Decision {
    fn from(value: String) -> Self {
        match value.as_str() {
            "REDIRECT" => Decision::Redirect,
            "DENY_RO" => Decision::DenyRo,
            "ALLOW" => Decision::Allow,
            "" => Decision::Unknown,
            _ => Decision::Other(value),
        }
    }
}

impl From<Decision> for String {
    fn from(value: Decision) -> Self {
        match value {
            Decision::Redirect => "REDIRECT".to_string(),
            Decision::DenyRo => "DENY_RO".to_string(),
            Decision::Allow => "ALLOW".to_string(),
            Decision::Unknown => String::new(),
            Decision::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Outcome {
    Ok,
    Fail,
    #[default]
    Unknown,
    Other(String),
}

impl From<String> for Outcome {
    fn from(value: String) -> Self {
        match value.as_str() {
            "OK" => Outcome::Ok,
            "FAIL" => Outcome::Fail,
            "" => Outcome::Unknown,
            _ => Outcome::Other(value),
        }
    }
}

impl From<Outcome> for String {
    fn from(value: Outcome) -> Self {
        match value {
            Outcome::Ok => "OK".to_string(),
            Outcome::Fail => "FAIL".to_string(),
            Outcome::Unknown => String::new(),
            Outcome::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub pkg: String,
    #[serde(default)]
    pub proc: String,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub tid: i64,
    #[serde(default)]
    pub uid: i64,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped: Option<String>,
    #[serde(default)]
    pub decision: Decision,
    #[serde(default)]
    pub result: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    #[serde(default)]
    pub total_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_count: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub online: bool,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default = "snapshot_version")]
    pub version: u32,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub apps: BTreeMap<String, AppConfig>,
}

fn snapshot_version() -> u32 {
    1
}
