use crate::error::SrError;
use crate::model::{LogEntry, LogStats};
use crate::store::FileConfigStore;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::warn;

/// Direct access to `access.log` for when the daemon does not answer.
#[derive(Clone)]
pub struct LogReader {
    files: FileConfigStore,
    log_path: PathBuf,
}

impl LogReader {
    pub fn new(files: FileConfigStore) -> Self {
        let log_path = files.layout().access_log_path();
        Self { files, log_path }
    }

    pub async fn tail(&self, pkg: Option<&str>, n: usize) -> Vec<LogEntry> {
        match self.read_file().await {
            Ok(Some(text)) => newest_entries(&text, pkg, n),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(event = "logs.read_failed", path = %self.log_path.display(), error = %err);
                Vec::new()
            }
        }
    }

    /// A missing log counts as already cleared.
    pub async fn clear(&self, pkg: &str) -> Result<(), SrError> {
        let Some(text) = self.read_file().await? else {
            return Ok(());
        };
        let kept = lines_without_pkg(&text, pkg);
        if kept.is_empty() {
            self.files.remove(&self.log_path).await
        } else {
            // Trailing newline so the daemon's next append starts a new line.
            let mut content = kept.join("\n");
            content.push('\n');
            self.files.write_text(&self.log_path, &content).await
        }
    }

    pub async fn stats(&self) -> LogStats {
        match self.read_file().await {
            Ok(Some(text)) => stats_from_text(&text),
            Ok(None) => LogStats::default(),
            Err(err) => {
                warn!(event = "logs.read_failed", path = %self.log_path.display(), error = %err);
                LogStats::default()
            }
        }
    }

    async fn read_file(&self) -> Result<Option<String>, SrError> {
        if !self.files.exists(&self.log_path).await? {
            return Ok(None);
        }
        self.files.read_text(&self.log_path).await.map(Some)
    }
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim_end).filter(|line| !line.trim().is_empty())
}

pub fn parse_entries(text: &str) -> Vec<LogEntry> {
    non_empty_lines(text)
        .filter_map(|line| serde_json::from_str::<LogEntry>(line).ok())
        .collect()
}

pub fn newest_entries(text: &str, pkg: Option<&str>, n: usize) -> Vec<LogEntry> {
    newest_entries_from(parse_entries(text), pkg, n)
}

pub fn newest_entries_from(entries: Vec<LogEntry>, pkg: Option<&str>, n: usize) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = entries
        .into_iter()
        .filter(|entry| pkg.map_or(true, |pkg| entry.pkg == pkg))
        .collect();
    entries.sort_by(|a, b| b.ts.cmp(&a.ts));
    entries.truncate(n);
    entries
}

// Unparseable lines belong to nobody and stay.
fn lines_without_pkg<'a>(text: &'a str, pkg: &str) -> Vec<&'a str> {
    non_empty_lines(text)
        .filter(|line| match serde_json::from_str::<Map<String, Value>>(line) {
            Ok(entry) => entry.get("pkg").and_then(Value::as_str) != Some(pkg),
            Err(_) => true,
        })
        .collect()
}

fn stats_from_text(text: &str) -> LogStats {
    let entries = parse_entries(text);
    let apps: BTreeSet<&str> = entries
        .iter()
        .map(|entry| entry.pkg.as_str())
        .filter(|pkg| !pkg.is_empty())
        .collect();
    LogStats {
        total_size_bytes: text.len() as u64,
        max_size_bytes: None,
        entry_count: Some(entries.len() as u64),
        app_count: Some(apps.len() as u64),
        extra: Map::new(),
    }
}
