use crate::model::{PackageInfo, PackageScope};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const PACKAGE_INFO_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

#[async_trait]
pub trait CapabilityHost: Send + Sync {
    async fn list_packages(&self, scope: PackageScope) -> io::Result<Vec<String>>;

    async fn packages_info(&self, packages: &[String]) -> io::Result<Vec<PackageInfo>>;

    async fn execute(&self, command: &str) -> io::Result<CommandOutput>;

    async fn notify(&self, message: &str) -> io::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct ShellHost {
    timeout: Option<Duration>,
}

impl ShellHost {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// `0` disables the bound.
    pub fn with_timeout_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::new(None)
        } else {
            Self::new(Some(Duration::from_secs(secs)))
        }
    }

    async fn run_checked(&self, command: &str) -> io::Result<String> {
        let output = self.execute(command).await?;
        if !output.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "`{command}` exited with status {}: {}",
                    output.status_code,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(output.stdout)
    }

    async fn package_info(&self, package: &str) -> Option<PackageInfo> {
        let command = format!("pm dump {}", shell_single_quote(package));
        match self.run_checked(&command).await {
            Ok(dump) => parse_package_dump(package, &dump),
            Err(err) => {
                debug!(event = "host.package_info_failed", pkg = package, error = %err);
                PackageInfo::new(package).sanitized()
            }
        }
    }
}

#[async_trait]
impl CapabilityHost for ShellHost {
    async fn list_packages(&self, scope: PackageScope) -> io::Result<Vec<String>> {
        let command = match scope {
            PackageScope::User => "pm list packages -3",
            PackageScope::System => "pm list packages -s",
            PackageScope::All => "pm list packages",
        };
        let stdout = self.run_checked(command).await?;
        Ok(parse_package_list(&stdout))
    }

    async fn packages_info(&self, packages: &[String]) -> io::Result<Vec<PackageInfo>> {
        let infos = stream::iter(packages.iter().cloned())
            .map(|pkg| async move { self.package_info(&pkg).await })
            .buffered(PACKAGE_INFO_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
        Ok(infos.into_iter().flatten().collect())
    }

    async fn execute(&self, command: &str) -> io::Result<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("command timed out after {limit:?}"),
                    )
                })??,
            None => cmd.output().await?,
        };
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn notify(&self, message: &str) -> io::Result<()> {
        eprintln!("srctl: {message}");
        Ok(())
    }
}

/// Stand-in for an environment without any host capabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsentHost;

fn unsupported() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "capability host is not available")
}

#[async_trait]
impl CapabilityHost for AbsentHost {
    async fn list_packages(&self, _scope: PackageScope) -> io::Result<Vec<String>> {
        Err(unsupported())
    }

    async fn packages_info(&self, _packages: &[String]) -> io::Result<Vec<PackageInfo>> {
        Err(unsupported())
    }

    async fn execute(&self, _command: &str) -> io::Result<CommandOutput> {
        Err(unsupported())
    }

    async fn notify(&self, _message: &str) -> io::Result<()> {
        Err(unsupported())
    }
}

pub fn shell_single_quote(value: &str) -> String {
    // foo'bar -> 'foo'\''bar'
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

fn parse_package_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(|pkg| pkg.trim().to_string())
        .filter(|pkg| !pkg.is_empty())
        .collect()
}

fn parse_package_dump(package: &str, dump: &str) -> Option<PackageInfo> {
    let mut info = PackageInfo::new(package);
    for line in dump.lines().map(str::trim) {
        for token in line.split_whitespace() {
            if let Some(value) = token.strip_prefix("versionName=") {
                if info.version_name.is_empty() {
                    info.version_name = value.to_string();
                }
            } else if let Some(value) = token.strip_prefix("versionCode=") {
                if info.version_code == 0 {
                    info.version_code = value.parse().unwrap_or(0);
                }
            } else if let Some(value) = token.strip_prefix("userId=") {
                if info.uid == 0 {
                    info.uid = value.parse().unwrap_or(0);
                }
            }
        }
        if line.starts_with("pkgFlags=") && line.contains(" SYSTEM ") {
            info.is_system_app = true;
        }
    }
    info.user_namespace_id = info.uid / 100_000;
    info.sanitized()
}
