use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tether_vt::{ContentMonitor, PromptMonitor};

use crate::attach::{self, AttachIo, AttachState, DetachSignal};
use crate::config::SessionConfig;
use crate::console::{Console, StdConsole};
use crate::lock;
use crate::pty::{NativeSpawner, PtyError, PtyMaster, PtySpawner};
use crate::tmux::{Executor, SystemExecutor, Tmux, TmuxError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to start session {name}: {source}")]
    Startup {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("session {name} did not appear within {waited:?}")]
    Timeout { name: String, waited: Duration },
    #[error("failed to attach to session {name}: {source}")]
    Attach {
        name: String,
        #[source]
        source: PtyError,
    },
    #[error("session {0} is already attached")]
    AlreadyAttached(String),
    #[error("session {0} does not exist")]
    NotFound(String),
    #[error("failed to start attach workers: {0}")]
    Workers(#[source] std::io::Error),
    #[error(transparent)]
    Tmux(#[from] TmuxError),
    #[error(transparent)]
    Pty(#[from] PtyError),
}

impl SessionError {
    fn startup(name: &str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        SessionError::Startup {
            name: name.to_string(),
            source: Box::new(source),
        }
    }
}

/// Collaborators a session is built from.
pub struct SessionDeps {
    pub spawner: Arc<dyn PtySpawner>,
    pub executor: Arc<dyn Executor>,
    pub console: Arc<dyn Console>,
    pub monitor: Box<dyn ContentMonitor>,
}

impl SessionDeps {
    /// Real PTYs, the real `tmux` binary, stdin/stdout, and a prompt
    /// monitor chosen for `program`.
    pub fn native(program: &str) -> Self {
        Self {
            spawner: Arc::new(NativeSpawner),
            executor: Arc::new(SystemExecutor),
            console: Arc::new(StdConsole),
            monitor: Box::new(PromptMonitor::for_program(program)),
        }
    }
}

/// Server-side session name: `prefix` + the display name without
/// whitespace and with tmux target separators replaced + creation second.
pub fn server_name(prefix: &str, display_name: &str, created_unix: i64) -> String {
    let sanitized: String = display_name
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '.' || c == ':' { '_' } else { c })
        .collect();
    format!("{prefix}{sanitized}_{created_unix}")
}

/// State shared between a [`Session`] and its attach workers.
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) display_name: String,
    pub(crate) tmux: Tmux,
    /// Open only while attached; never read from outside the output relay.
    pub(crate) master: Mutex<Option<Box<dyn PtyMaster>>>,
    pub(crate) attach: Mutex<Option<AttachState>>,
    /// Last known `(cols, rows)`.
    pub(crate) size: Mutex<(u16, u16)>,
}

/// One tmux-hosted agent session.
///
/// Lifecycle: [`Session::new`] → [`start`](Session::start) (idle) →
/// [`attach`](Session::attach) (live) → detach (idle again) →
/// [`kill`](Session::kill). Lifecycle calls are made by a single owner;
/// only the live attach runs concurrent workers.
pub struct Session {
    shared: Arc<Shared>,
    program: String,
    spawner: Arc<dyn PtySpawner>,
    console: Arc<dyn Console>,
    monitor: Box<dyn ContentMonitor>,
    config: SessionConfig,
}

impl Session {
    /// Session for `program` on the default tmux server. Nothing runs until
    /// [`start`](Session::start).
    pub fn new(display_name: &str, program: &str) -> Self {
        Self::with_config(display_name, program, SessionConfig::default())
    }

    pub fn with_config(display_name: &str, program: &str, config: SessionConfig) -> Self {
        Self::with_deps(display_name, program, config, SessionDeps::native(program))
    }

    pub fn with_deps(
        display_name: &str,
        program: &str,
        config: SessionConfig,
        deps: SessionDeps,
    ) -> Self {
        let created = chrono::Utc::now().timestamp();
        let name = server_name(&config.session_prefix, display_name, created);
        let tmux = Tmux::new(deps.executor, config.socket_name.clone());

        Self {
            shared: Arc::new(Shared {
                name,
                display_name: display_name.to_string(),
                tmux,
                master: Mutex::new(None),
                attach: Mutex::new(None),
                size: Mutex::new((config.default_cols, config.default_rows)),
            }),
            program: program.to_string(),
            spawner: deps.spawner,
            console: deps.console,
            monitor: deps.monitor,
            config,
        }
    }

    /// Name used for every tmux command.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn display_name(&self) -> &str {
        &self.shared.display_name
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Last known `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *lock(&self.shared.size)
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.shared.attach).is_some()
    }

    /// Whether the tmux server still has this session.
    pub fn exists(&self) -> Result<bool, SessionError> {
        Ok(self.shared.tmux.has_session(self.name())?)
    }

    /// Bring the tmux session into existence in `workdir`, or adopt it if it
    /// is already running. Leaves the session idle.
    pub fn start(&mut self, workdir: impl AsRef<Path>) -> Result<(), SessionError> {
        let name = self.shared.name.clone();
        let exists = self
            .shared
            .tmux
            .has_session(&name)
            .map_err(|e| SessionError::startup(&name, e))?;

        if exists {
            log::info!("adopting existing tmux session {name}");
        } else {
            self.create(&name, workdir.as_ref())?;
        }

        match self.shared.tmux.has_session(&name) {
            Ok(true) => Ok(()),
            Ok(false) => Err(SessionError::NotFound(name)),
            Err(e) => Err(SessionError::startup(&name, e)),
        }
    }

    fn create(&self, name: &str, workdir: &Path) -> Result<(), SessionError> {
        let tmux = &self.shared.tmux;
        let spec = tmux.new_session_spec(name, workdir, &self.program);
        let (cols, rows) = self.size();
        let mut bootstrap = self
            .spawner
            .spawn(&spec, cols, rows)
            .map_err(|e| SessionError::startup(name, e))?;

        let timeout = self.config.startup_timeout();
        let deadline = Instant::now() + timeout;
        let mut delay = self.config.poll_initial();
        loop {
            match tmux.has_session(name) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    close_quietly(bootstrap.as_mut());
                    return Err(SessionError::startup(name, e));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!("tmux session {name} did not appear within {timeout:?}");
                if let Err(e) = tmux.kill_session(name) {
                    log::debug!("cleanup of partial session {name}: {e}");
                }
                close_quietly(bootstrap.as_mut());
                return Err(SessionError::Timeout {
                    name: name.to_string(),
                    waited: timeout,
                });
            }
            thread::sleep(delay.min(deadline - now));
            delay = (delay * 2).min(self.config.poll_max());
        }

        bootstrap
            .close()
            .map_err(|e| SessionError::startup(name, e))?;

        let history = self.config.history_limit.to_string();
        let mouse = if self.config.mouse { "on" } else { "off" };
        tmux.set_option(name, "history-limit", &history)
            .and_then(|_| tmux.set_option(name, "mouse", mouse))
            .map_err(|e| SessionError::startup(name, e))?;

        log::info!("started tmux session {name} running {:?}", self.program);
        Ok(())
    }

    /// Current visible pane content, escape sequences preserved.
    pub fn capture_pane_content(&self) -> Result<String, SessionError> {
        Ok(self.shared.tmux.capture_pane(self.name(), None)?)
    }

    /// Pane content including scrollback between `start` and `end`
    /// (negative lines are history, as in `tmux capture-pane -S/-E`).
    pub fn capture_pane_history(&self, start: i64, end: i64) -> Result<String, SessionError> {
        Ok(self.shared.tmux.capture_pane(self.name(), Some((start, end)))?)
    }

    /// `(changed, looks_idle)` for content captured from this session.
    pub fn has_updated(&mut self, content: &str) -> (bool, bool) {
        self.monitor.has_updated(content)
    }

    /// Propagate a new terminal size to the session: through the live PTY
    /// while attached, otherwise by resizing the tmux window.
    pub fn set_detached_size(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        *lock(&self.shared.size) = (cols, rows);

        if let Some(master) = lock(&self.shared.master).as_ref() {
            return Ok(master.resize(cols, rows)?);
        }
        Ok(self.shared.tmux.resize_window(self.name(), cols, rows)?)
    }

    /// Type `text` into the agent without attaching.
    pub fn send_keys(&self, text: &str) -> Result<(), SessionError> {
        Ok(self.shared.tmux.send_keys_literal(self.name(), text)?)
    }

    pub fn tap_enter(&self) -> Result<(), SessionError> {
        Ok(self.shared.tmux.send_key(self.name(), "Enter")?)
    }

    /// Connect the real terminal to the session.
    ///
    /// Returns immediately; the returned signal completes once the user
    /// presses the detach key or [`detach`](Session::detach) is called.
    pub fn attach(&mut self) -> Result<DetachSignal, SessionError> {
        let name = self.shared.name.clone();
        if self.is_attached() {
            return Err(SessionError::AlreadyAttached(name));
        }
        if !self.shared.tmux.has_session(&name)? {
            return Err(SessionError::NotFound(name));
        }

        let (cols, rows) = self.console.size().unwrap_or_else(|| self.size());
        let spec = self.shared.tmux.attach_spec(&name);
        let mut master = self
            .spawner
            .spawn(&spec, cols, rows)
            .map_err(|source| SessionError::Attach {
                name: name.clone(),
                source,
            })?;

        let streams = master
            .take_reader()
            .and_then(|reader| Ok((reader, master.take_writer()?)));
        let (reader, writer) = match streams {
            Ok(streams) => streams,
            Err(source) => {
                close_quietly(master.as_mut());
                return Err(SessionError::Attach { name, source });
            }
        };

        *lock(&self.shared.size) = (cols, rows);
        *lock(&self.shared.master) = Some(master);

        let io = AttachIo {
            reader,
            writer,
            console: Arc::clone(&self.console),
        };
        match attach::launch(&self.shared, io, &self.config) {
            Ok(signal) => {
                log::info!("attached to {name}");
                Ok(signal)
            }
            Err(e) => {
                if let Some(mut master) = lock(&self.shared.master).take() {
                    close_quietly(master.as_mut());
                }
                Err(e)
            }
        }
    }

    /// End a live attach. No-op when idle, or when a detach is already
    /// under way.
    pub fn detach(&self) {
        self.shared.detach();
    }

    /// End any live attach and destroy the tmux session.
    pub fn kill(&mut self) -> Result<(), SessionError> {
        self.shared.detach();

        if let Some(mut master) = lock(&self.shared.master).take() {
            master.close()?;
        }

        let name = self.name();
        if self.shared.tmux.has_session(name)? {
            self.shared.tmux.kill_session(name)?;
            log::info!("killed tmux session {name}");
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The tmux session outlives us; only the attach workers must not.
        self.shared.detach();
    }
}

fn close_quietly(master: &mut dyn PtyMaster) {
    if let Err(e) = master.close() {
        log::debug!("failed to close PTY: {e}");
    }
}
