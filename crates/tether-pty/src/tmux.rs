//! Commands issued against the tmux server.
//!
//! Short-lived commands (`has-session`, `capture-pane`, ...) run through an
//! [`Executor`] so sessions can be exercised against an in-memory server.
//! Commands that need a terminal (`new-session`, `attach-session`) are only
//! described here as [`CommandSpec`]s; the caller runs them on a PTY.

use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use crate::pty::CommandSpec;

const TMUX: &str = "tmux";

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a program to completion and collects its output.
pub trait Executor: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// [`Executor`] that runs real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TmuxError {
    #[error("failed to run tmux {command}: {source}")]
    Exec {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("tmux {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

/// Handle on one tmux server, optionally on a private `-L` socket.
#[derive(Clone)]
pub struct Tmux {
    executor: Arc<dyn Executor>,
    socket: Option<String>,
}

impl Tmux {
    pub fn new(executor: Arc<dyn Executor>, socket: Option<String>) -> Self {
        Self { executor, socket }
    }

    /// Talk to the real `tmux` binary.
    pub fn system(socket: Option<String>) -> Self {
        Self::new(Arc::new(SystemExecutor), socket)
    }

    pub fn socket(&self) -> Option<&str> {
        self.socket.as_deref()
    }

    fn argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        if let Some(socket) = &self.socket {
            argv.push("-L".to_string());
            argv.push(socket.clone());
        }
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput, TmuxError> {
        self.executor
            .run(TMUX, &self.argv(args))
            .map_err(|source| TmuxError::Exec {
                command: args[0].to_string(),
                source,
            })
    }

    fn run_checked(&self, args: &[&str]) -> Result<String, TmuxError> {
        let output = self.run(args)?;
        if !output.success {
            return Err(TmuxError::Failed {
                command: args[0].to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Whether a session with exactly this name exists. A missing server
    /// counts as "no"; only failing to run tmux at all is an error.
    pub fn has_session(&self, name: &str) -> Result<bool, TmuxError> {
        Ok(self.run(&["has-session", "-t", &exact(name)])?.success)
    }

    /// Visible pane content with escape sequences preserved and wrapped
    /// lines joined. `range` selects scrollback lines (`-S`/`-E`).
    pub fn capture_pane(&self, name: &str, range: Option<(i64, i64)>) -> Result<String, TmuxError> {
        let target = exact_pane(name);
        let mut args = vec!["capture-pane", "-p", "-e", "-J", "-t", target.as_str()];
        let bounds = range.map(|(start, end)| (start.to_string(), end.to_string()));
        if let Some((start, end)) = &bounds {
            args.extend(["-S", start.as_str(), "-E", end.as_str()]);
        }
        self.run_checked(&args)
    }

    pub fn set_option(&self, name: &str, option: &str, value: &str) -> Result<(), TmuxError> {
        self.run_checked(&["set-option", "-t", &exact(name), option, value])
            .map(|_| ())
    }

    pub fn resize_window(&self, name: &str, cols: u16, rows: u16) -> Result<(), TmuxError> {
        let (cols, rows) = (cols.to_string(), rows.to_string());
        self.run_checked(&["resize-window", "-t", &exact_pane(name), "-x", &cols, "-y", &rows])
            .map(|_| ())
    }

    /// Type `text` into the pane without key-name interpretation.
    pub fn send_keys_literal(&self, name: &str, text: &str) -> Result<(), TmuxError> {
        self.run_checked(&["send-keys", "-t", &exact_pane(name), "-l", text])
            .map(|_| ())
    }

    /// Press a named key such as `Enter` or `Escape`.
    pub fn send_key(&self, name: &str, key: &str) -> Result<(), TmuxError> {
        self.run_checked(&["send-keys", "-t", &exact_pane(name), key])
            .map(|_| ())
    }

    pub fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        self.run_checked(&["kill-session", "-t", &exact(name)])
            .map(|_| ())
    }

    /// Names of every session on the server; empty when no server runs.
    pub fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        let output = self.run(&["list-sessions", "-F", "#{session_name}"])?;
        if !output.success {
            if is_no_server(&output.stderr) {
                return Ok(Vec::new());
            }
            return Err(TmuxError::Failed {
                command: "list-sessions".to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Command that creates a detached session running `program` in `workdir`.
    pub fn new_session_spec(&self, name: &str, workdir: &Path, program: &str) -> CommandSpec {
        let workdir_arg = workdir.to_string_lossy();
        let args = self.argv(&["new-session", "-d", "-s", name, "-c", &workdir_arg, program]);
        terminal_env(CommandSpec::new(TMUX).args(args).cwd(workdir))
    }

    /// Command that attaches a tmux client to the session.
    pub fn attach_spec(&self, name: &str) -> CommandSpec {
        let target = exact(name);
        terminal_env(CommandSpec::new(TMUX).args(self.argv(&["attach-session", "-t", &target])))
    }
}

/// Kill every session whose name starts with `prefix`. Returns how many
/// sessions were killed.
pub fn cleanup_sessions(tmux: &Tmux, prefix: &str) -> Result<usize, TmuxError> {
    let mut killed = 0;
    for name in tmux.list_sessions()? {
        if !name.starts_with(prefix) {
            continue;
        }
        tmux.kill_session(&name)?;
        log::info!("killed stale tmux session {name}");
        killed += 1;
    }
    Ok(killed)
}

/// Exact-match target; a bare name would also match any session it
/// prefixes.
fn exact(name: &str) -> String {
    format!("={name}")
}

/// Exact session, current window and pane.
fn exact_pane(name: &str) -> String {
    format!("={name}:")
}

fn is_no_server(stderr: &str) -> bool {
    stderr.contains("no server running") || stderr.contains("error connecting to")
}

/// tmux clients refuse to start without a usable `TERM`, and refuse to nest
/// when `TMUX` is inherited from an enclosing session.
fn terminal_env(spec: CommandSpec) -> CommandSpec {
    let term = std::env::var("TERM")
        .ok()
        .filter(|t| !t.is_empty() && t != "dumb")
        .unwrap_or_else(|| "xterm-256color".to_string());
    spec.env("TERM", term).env_remove("TMUX")
}
