use crate::host::{CapabilityHost, CommandOutput, ShellHost};
use crate::model::{PackageInfo, PackageScope};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

/// Queued outputs first, then a real `sh` or empty success.
#[derive(Default)]
pub struct MockHost {
    commands: Mutex<Vec<String>>,
    notifications: Mutex<Vec<String>>,
    outputs: Mutex<VecDeque<io::Result<CommandOutput>>>,
    packages: Mutex<Vec<String>>,
    shell: Option<ShellHost>,
    unavailable: bool,
}

impl MockHost {
    pub fn shell() -> Self {
        Self {
            shell: Some(ShellHost::new(None)),
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn with_packages(self, packages: &[&str]) -> Self {
        *self.packages.lock().unwrap() = packages.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn push_output(&self, output: CommandOutput) {
        self.outputs.lock().unwrap().push_back(Ok(output));
    }

    /// The next execute fails before any command runs.
    pub fn push_error(&self, kind: io::ErrorKind) {
        self.outputs
            .lock()
            .unwrap()
            .push_back(Err(io::Error::new(kind, "queued failure")));
    }

    pub fn push_stdout(&self, stdout: &str) {
        self.push_output(CommandOutput {
            status_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        });
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl CapabilityHost for MockHost {
    async fn list_packages(&self, _scope: PackageScope) -> io::Result<Vec<String>> {
        if self.unavailable {
            return Err(gone());
        }
        Ok(self.packages.lock().unwrap().clone())
    }

    async fn packages_info(&self, packages: &[String]) -> io::Result<Vec<PackageInfo>> {
        if self.unavailable {
            return Err(gone());
        }
        Ok(packages.iter().map(|pkg| PackageInfo::new(pkg)).collect())
    }

    async fn execute(&self, command: &str) -> io::Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        if self.unavailable {
            return Err(gone());
        }
        let queued = self.outputs.lock().unwrap().pop_front();
        if let Some(output) = queued {
            return output;
        }
        match &self.shell {
            Some(shell) => shell.execute(command).await,
            None => Ok(CommandOutput::default()),
        }
    }

    async fn notify(&self, message: &str) -> io::Result<()> {
        if self.unavailable {
            return Err(gone());
        }
        self.notifications.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "host bridge missing")
}

/// Decoded `--json-base64` payload of a recorded daemon command.
pub fn json_payload(command: &str) -> Option<serde_json::Value> {
    use base64::Engine as _;
    let start = command.find("'--json-base64' '")? + "'--json-base64' '".len();
    let rest = &command[start..];
    let encoded = &rest[..rest.find('\'')?];
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    serde_json::from_slice(&bytes).ok()
}
