//! tether-pty: tmux-hosted agent sessions and live terminal attachment.
//!
//! A tmux server keeps each agent session alive independently of the UI.
//! This crate creates those sessions, observes them while detached, and
//! relays the user's real terminal into them while attached.
//!
//! # Architecture
//!
//! - [`PtySpawner`] / [`PtyMaster`]: start a child on a fresh PTY
//!   (`portable-pty` in production, [`testing::FakeSpawner`] in tests).
//! - [`Tmux`]: the tmux commands a session issues, over an [`Executor`].
//! - [`Console`]: the user's real terminal during a live attach.
//! - [`Session`]: lifecycle of one tmux session: start, capture, attach,
//!   detach, kill.

mod attach;
pub mod config;
pub mod console;
pub mod pty;
pub mod session;
pub mod tmux;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use attach::DetachSignal;
pub use config::SessionConfig;
pub use console::{Console, ConsoleInput, StdConsole};
pub use pty::{CommandSpec, NativeSpawner, PtyError, PtyMaster, PtySpawner};
pub use session::{server_name, Session, SessionDeps, SessionError};
pub use tether_vt::{last_non_blank_line, strip_escapes, AgentKind, ContentMonitor, PromptMonitor};
pub use tmux::{cleanup_sessions, CommandOutput, Executor, SystemExecutor, Tmux, TmuxError};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a worker panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
