use crate::error::ErrorCode;
use crate::host::{shell_single_quote, CommandOutput};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum DaemonRequest {
    Ping,
    Status,
    AppList,
    AppGet { pkg: String },
    AppSet { pkg: String, app: Map<String, Value> },
    AppDelete { pkg: String },
    GlobalGet,
    GlobalSet { global: Map<String, Value> },
    LogTail { pkg: Option<String>, n: usize },
    LogClear { pkg: String },
    LogStats,
    MonitorGet,
    MonitorSet { monitor: Map<String, Value> },
}

impl DaemonRequest {
    pub fn verb(&self) -> &'static str {
        match self {
            DaemonRequest::Ping => "ping",
            DaemonRequest::Status => "status",
            DaemonRequest::AppList => "app.list",
            DaemonRequest::AppGet { .. } => "app.get",
            DaemonRequest::AppSet { .. } => "app.set",
            DaemonRequest::AppDelete { .. } => "app.delete",
            DaemonRequest::GlobalGet => "global.get",
            DaemonRequest::GlobalSet { .. } => "global.set",
            DaemonRequest::LogTail { .. } => "log.tail",
            DaemonRequest::LogClear { .. } => "log.clear",
            DaemonRequest::LogStats => "log.stats",
            DaemonRequest::MonitorGet => "monitor.get",
            DaemonRequest::MonitorSet { .. } => "monitor.set",
        }
    }

    fn args(&self) -> Vec<String> {
        let words = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            DaemonRequest::Ping => words(&["ping"]),
            DaemonRequest::Status => words(&["status"]),
            DaemonRequest::AppList => words(&["app", "list"]),
            DaemonRequest::AppGet { pkg } => words(&["app", "get", "--pkg", pkg.as_str()]),
            DaemonRequest::AppSet { pkg, app } => {
                let encoded = encode_json_payload(app);
                words(&["app", "set", "--pkg", pkg.as_str(), "--json-base64", encoded.as_str()])
            }
            DaemonRequest::AppDelete { pkg } => words(&["app", "delete", "--pkg", pkg.as_str()]),
            DaemonRequest::GlobalGet => words(&["global", "get"]),
            DaemonRequest::GlobalSet { global } => {
                let encoded = encode_json_payload(global);
                words(&["global", "set", "--json-base64", encoded.as_str()])
            }
            DaemonRequest::LogTail { pkg, n } => {
                let mut args = words(&["log", "tail"]);
                if let Some(pkg) = pkg {
                    args.extend(words(&["--pkg", pkg.as_str()]));
                }
                let count = n.to_string();
                args.extend(words(&["--n", count.as_str()]));
                args
            }
            DaemonRequest::LogClear { pkg } => words(&["log", "clear", "--pkg", pkg.as_str()]),
            DaemonRequest::LogStats => words(&["log", "stats"]),
            DaemonRequest::MonitorGet => words(&["monitor", "get"]),
            DaemonRequest::MonitorSet { monitor } => {
                let encoded = encode_json_payload(monitor);
                words(&["monitor", "set", "--json-base64", encoded.as_str()])
            }
        }
    }
}

pub fn encode_command(binary: &str, request: &DaemonRequest) -> String {
    let mut parts = vec![shell_single_quote(binary)];
    parts.extend(request.args().iter().map(|arg| shell_single_quote(arg)));
    parts.join(" ")
}

pub fn encode_base64(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

fn encode_json_payload(map: &Map<String, Value>) -> String {
    encode_base64(&Value::Object(map.clone()).to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonFailure {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl DaemonFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            hint: None,
        }
    }
}

/// Fields under `data` are lifted to the top level.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonResponse {
    Success(Map<String, Value>),
    Failure(DaemonFailure),
}

impl DaemonResponse {
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        DaemonResponse::Failure(DaemonFailure::new(code, message))
    }

    /// `None` when the document is not a response envelope at all.
    pub fn from_document(doc: Value) -> Option<Self> {
        let Value::Object(mut map) = doc else {
            return None;
        };
        let ok = map.remove("ok")?.as_bool()?;
        if ok {
            map.remove("error");
            if let Some(Value::Object(data)) = map.remove("data") {
                for (key, value) in data {
                    map.entry(key).or_insert(value);
                }
            }
            return Some(DaemonResponse::Success(map));
        }
        let failure = map
            .remove("error")
            .and_then(|raw| serde_json::from_value::<DaemonFailure>(raw).ok())
            .map(|mut failure| {
                failure.field = failure.field.filter(|s| !s.is_empty());
                failure.hint = failure.hint.filter(|s| !s.is_empty());
                failure
            })
            .unwrap_or_else(|| {
                DaemonFailure::new(ErrorCode::Exec, "daemon reported failure without details")
            });
        Some(DaemonResponse::Failure(failure))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, DaemonResponse::Success(_))
    }

    pub fn payload(&self) -> Option<&Map<String, Value>> {
        match self {
            DaemonResponse::Success(map) => Some(map),
            DaemonResponse::Failure(_) => None,
        }
    }

    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.payload()?.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn error(&self) -> Option<&DaemonFailure> {
        match self {
            DaemonResponse::Success(_) => None,
            DaemonResponse::Failure(failure) => Some(failure),
        }
    }

    pub fn to_document(&self) -> Value {
        match self {
            DaemonResponse::Success(map) => {
                let mut doc = map.clone();
                doc.insert("ok".to_string(), Value::Bool(true));
                Value::Object(doc)
            }
            DaemonResponse::Failure(failure) => json!({"ok": false, "error": failure}),
        }
    }
}

// daemonctl prints its error envelope on stderr.
pub fn decode_response(output: &CommandOutput) -> DaemonResponse {
    if output.success() {
        if let Some(response) = parse_envelope(&output.stdout) {
            return response;
        }
        return DaemonResponse::failure(ErrorCode::Exec, raw_message(output));
    }
    for stream in [&output.stdout, &output.stderr] {
        if let Some(response @ DaemonResponse::Failure(_)) = parse_envelope(stream) {
            return response;
        }
    }
    DaemonResponse::failure(ErrorCode::Exec, raw_message(output))
}

fn parse_envelope(text: &str) -> Option<DaemonResponse> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(DaemonResponse::from_document)
}

fn raw_message(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = output.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("exit status {}", output.status_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(status_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            status_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn structured_payloads_are_base64_and_quoted() {
        let mut app = Map::new();
        app.insert("note".to_string(), json!("it's \"quoted\" $(rm -rf /) 中文"));
        let cmd = encode_command(
            "/data/adb/modules/StorageRedirect/bin/daemonctl",
            &DaemonRequest::AppSet {
                pkg: "com.example".to_string(),
                app: app.clone(),
            },
        );
        assert!(cmd.starts_with("'/data/adb/modules/StorageRedirect/bin/daemonctl' 'app' 'set'"));
        assert!(!cmd.contains("rm -rf"));
        let encoded = encode_json_payload(&app);
        assert!(cmd.ends_with(&format!("'--json-base64' '{encoded}'")));
        let decoded = STANDARD.decode(encoded).unwrap();
        let round: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(round, Value::Object(app));
    }

    #[test]
    fn log_tail_omits_pkg_when_unfiltered() {
        let cmd = encode_command("dc", &DaemonRequest::LogTail { pkg: None, n: 5 });
        assert_eq!(cmd, "'dc' 'log' 'tail' '--n' '5'");
    }

    #[test]
    fn success_lifts_data_fields() {
        let response = decode_response(&out(
            0,
            r#"{"ok":true,"data":{"version":"1.0.0","pid":42,"configVersion":3}}"#,
            "",
        ));
        assert!(response.is_ok());
        assert_eq!(response.field::<String>("version").as_deref(), Some("1.0.0"));
        assert_eq!(response.field::<u64>("pid"), Some(42));
    }

    #[test]
    fn zero_exit_with_garbage_is_exec_error() {
        let response = decode_response(&out(0, "not json", "boom"));
        let error = response.error().unwrap();
        assert_eq!(error.code, ErrorCode::Exec);
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn nonzero_exit_prefers_structured_error_on_either_stream() {
        let body = r#"{"ok":false,"error":{"code":"E_NOT_FOUND","message":"no config","field":"","hint":""}}"#;
        let from_stderr = decode_response(&out(4, "", body));
        let error = from_stderr.error().unwrap();
        assert_eq!(error.code, ErrorCode::NotFound);
        assert_eq!(error.field, None);

        let from_stdout = decode_response(&out(4, body, "noise"));
        assert_eq!(from_stdout.error().unwrap().code, ErrorCode::NotFound);
    }

    #[test]
    fn nonzero_exit_without_body_is_exec_error() {
        let response = decode_response(&out(127, "", "sh: daemonctl: not found\n"));
        let error = response.error().unwrap();
        assert_eq!(error.code, ErrorCode::Exec);
        assert_eq!(error.message, "sh: daemonctl: not found");

        let silent = decode_response(&out(9, "", ""));
        assert_eq!(silent.error().unwrap().message, "exit status 9");
    }

    #[test]
    fn nonzero_exit_never_reports_success() {
        let response = decode_response(&out(1, r#"{"ok":true}"#, ""));
        assert!(!response.is_ok());
    }
}
