//! PTY spawning and process plumbing for terminal records.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use crate::protocol::TerminalMode;

pub const MAX_PTY_COLS: u16 = 500;
pub const MAX_PTY_ROWS: u16 = 200;

/// Resolved spawn parameters for one terminal process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub file: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Maps the requested mode/shell/command onto a concrete argv.
pub fn spawn_spec(
    mode: TerminalMode,
    shell: Option<&str>,
    command: &[String],
    cwd: Option<&Path>,
) -> SpawnSpec {
    let (file, args) = match mode {
        TerminalMode::Command if !command.is_empty() => {
            (command[0].clone(), command[1..].to_vec())
        }
        // A command terminal without an argv degrades to a shell.
        TerminalMode::Command | TerminalMode::Shell => (
            shell.map(str::to_string).unwrap_or_else(default_shell),
            Vec::new(),
        ),
    };
    SpawnSpec {
        file,
        args,
        cwd: cwd.map(Path::to_path_buf),
        env: vec![("TERM".to_string(), "xterm-256color".to_string())],
    }
}

/// The user's shell, falling back through common locations.
pub fn default_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    for shell in &["/bin/bash", "/bin/zsh", "/bin/sh"] {
        if Path::new(shell).exists() {
            return shell.to_string();
        }
    }
    "/bin/sh".to_string()
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.clamp(1, MAX_PTY_ROWS),
        cols: cols.clamp(1, MAX_PTY_COLS),
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// One exclusively-owned PTY-backed process.
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

impl PtyProcess {
    /// Opens a PTY of the given size and spawns the spec's argv on it.
    /// Returns the process handle and the master-side output reader.
    pub fn spawn(spec: &SpawnSpec, cols: u16, rows: u16) -> Result<(Self, Box<dyn Read + Send>)> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .context("openpty failed")?;

        let mut cmd = CommandBuilder::new(&spec.file);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn {}", spec.file))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        Ok((
            Self {
                master: pair.master,
                writer: Mutex::new(writer),
                child: Mutex::new(child),
            },
            reader,
        ))
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(pty_size(cols, rows))
            .context("pty resize failed")
    }

    /// Terminates the process and reaps it. Idempotent.
    pub fn kill(&self) {
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
    }

    /// Blocks until the process exits; used by the reader pump after EOF.
    pub fn wait_exit_code(&self) -> Option<i32> {
        self.child
            .lock()
            .wait()
            .ok()
            .map(|status| status.exit_code() as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_mode_uses_the_given_argv() {
        let spec = spawn_spec(
            TerminalMode::Command,
            None,
            &["/bin/echo".to_string(), "hi".to_string()],
            None,
        );
        assert_eq!(spec.file, "/bin/echo");
        assert_eq!(spec.args, vec!["hi".to_string()]);
    }

    #[test]
    fn shell_mode_prefers_the_requested_shell() {
        let spec = spawn_spec(TerminalMode::Shell, Some("/bin/sh"), &[], None);
        assert_eq!(spec.file, "/bin/sh");
        assert!(spec.args.is_empty());
    }

    #[test]
    fn empty_command_falls_back_to_a_shell() {
        let spec = spawn_spec(TerminalMode::Command, None, &[], None);
        assert!(!spec.file.is_empty());
    }

    #[test]
    fn spawn_spec_sets_term() {
        let spec = spawn_spec(TerminalMode::Shell, Some("/bin/sh"), &[], None);
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "TERM" && v == "xterm-256color"));
    }
}
