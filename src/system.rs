//! OS action primitives used only by the execution engine's dispatcher.

use crate::action::ActionKind;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Stdio};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} action has no payload")]
    MissingPayload(ActionKind),

    #[error("{0}")]
    Other(String),
}

impl ActionError {
    fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }
}

/// Side-effecting primitives of the host desktop.
///
/// Every call only *requests* the effect: a successful return means the
/// request was issued, not that the application is now visible.
pub trait SystemActions: Send + Sync {
    fn launch_path(&self, path: &Path) -> Result<(), ActionError>;
    fn launch_name(&self, name: &str) -> Result<(), ActionError>;
    fn open_in_file_browser(&self, path: &Path) -> Result<(), ActionError>;
    fn open_url(&self, url: &str) -> Result<(), ActionError>;
    /// Returns how many processes were asked to terminate.
    fn terminate_by_name(&self, name: &str) -> Result<usize, ActionError>;
    fn run_shell(&self, command: &str) -> Result<(), ActionError>;
}

/// Freedesktop implementation: `xdg-open` for paths and URLs, `sh -c` for
/// name lookups and shell commands.
pub struct LinuxDesktop {
    opener: String,
    shell: String,
}

impl LinuxDesktop {
    pub fn new() -> Self {
        Self {
            opener: "xdg-open".to_string(),
            shell: "sh".to_string(),
        }
    }

    fn spawn_detached(&self, mut command: Command, label: &str) -> Result<(), ActionError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = command.spawn().map_err(|e| ActionError::spawn(label, e))?;
        debug!(pid = child.id(), program = label, "spawned");
        // Reap in the background so finished children do not linger as zombies.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }

    fn open(&self, target: &OsStr) -> Result<(), ActionError> {
        let mut command = Command::new(&self.opener);
        command.arg(target);
        self.spawn_detached(command, &self.opener)
    }
}

impl Default for LinuxDesktop {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemActions for LinuxDesktop {
    fn launch_path(&self, path: &Path) -> Result<(), ActionError> {
        info!(path = %path.display(), "launching by path");
        let label = path.display().to_string();
        self.spawn_detached(Command::new(path), &label)
    }

    fn launch_name(&self, name: &str) -> Result<(), ActionError> {
        info!(name, "launching by name");
        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(name);
        self.spawn_detached(command, name)
    }

    fn open_in_file_browser(&self, path: &Path) -> Result<(), ActionError> {
        info!(path = %path.display(), "opening folder");
        self.open(path.as_os_str())
    }

    fn open_url(&self, url: &str) -> Result<(), ActionError> {
        info!(url, "opening url");
        self.open(OsStr::new(url))
    }

    fn terminate_by_name(&self, name: &str) -> Result<usize, ActionError> {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut signalled = 0;
        for process in sys.processes_by_name(OsStr::new(name)) {
            if process.kill() {
                signalled += 1;
            }
        }
        info!(name, signalled, "termination requested");
        Ok(signalled)
    }

    fn run_shell(&self, command: &str) -> Result<(), ActionError> {
        info!(command, "running shell command");
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);
        self.spawn_detached(cmd, command)
    }
}
