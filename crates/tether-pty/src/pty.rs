use std::io::{Read, Write};
use std::path::PathBuf;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

/// Errors from PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("PTY spawn failed: {0}")]
    SpawnFailed(String),
    #[error("PTY I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),
    #[error("PTY is closed")]
    Closed,
}

/// Description of a child process to run on a fresh pseudo-terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Value following `flag` in the argument list, e.g. the session name
    /// after `-s`.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    fn to_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.cwd(dir);
        }
        for key in &self.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Master side of a pseudo-terminal whose slave runs a child process.
///
/// The reader and writer are handed out once each; they stay usable from
/// other threads while the handle itself is kept for resizes and closing.
pub trait PtyMaster: Send {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PtyError>;

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, PtyError>;

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;

    /// Tear down the terminal and its child. Any reader previously taken
    /// observes end-of-stream afterwards. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), PtyError>;
}

/// Starts child processes connected to fresh pseudo-terminals.
pub trait PtySpawner: Send + Sync {
    fn spawn(
        &self,
        spec: &CommandSpec,
        cols: u16,
        rows: u16,
    ) -> Result<Box<dyn PtyMaster>, PtyError>;
}

/// [`PtySpawner`] backed by the operating system's PTY implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSpawner;

impl PtySpawner for NativeSpawner {
    fn spawn(
        &self,
        spec: &CommandSpec,
        cols: u16,
        rows: u16,
    ) -> Result<Box<dyn PtyMaster>, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(spec.to_builder())
            .map_err(|e| {
                PtyError::SpawnFailed(format!("failed to spawn {}: {e}", spec.program))
            })?;

        // Only the child may hold the slave, otherwise readers never see EOF.
        drop(pair.slave);

        log::debug!("spawned {} {:?} on a {cols}x{rows} PTY", spec.program, spec.args);

        Ok(Box::new(NativeMaster {
            master: Some(pair.master),
            child,
        }))
    }
}

/// Owns a portable-pty master and the child process on its slave side.
pub struct NativeMaster {
    master: Option<Box<dyn MasterPty + Send>>,
    child: Box<dyn Child + Send + Sync>,
}

impl NativeMaster {
    fn master(&self) -> Result<&(dyn MasterPty + Send), PtyError> {
        self.master.as_deref().ok_or(PtyError::Closed)
    }
}

impl PtyMaster for NativeMaster {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master()?
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master()?
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master()?
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    fn close(&mut self) -> Result<(), PtyError> {
        let Some(master) = self.master.take() else {
            return Ok(());
        };
        drop(master);

        if self.child.try_wait()?.is_none() {
            if let Err(err) = self.child.kill() {
                // Lost the race with a natural exit.
                if self.child.try_wait()?.is_none() {
                    return Err(err.into());
                }
            }
        }
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for NativeMaster {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to close PTY on drop: {e}");
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
