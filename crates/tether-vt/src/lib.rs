//! tether-vt: Pane content inspection for tether sessions.
//!
//! tmux hands back captured panes with their escape sequences intact. This
//! crate reduces that capture to plain text and decides whether it changed
//! since the last look and whether the agent inside appears to be waiting.
//!
//! - [`strip_escapes`]: VTE-driven escape sequence removal.
//! - [`ContentMonitor`]: change/idle detection contract consumed by sessions.
//! - [`PromptMonitor`]: default monitor keyed on the agent program.

pub mod monitor;
pub mod text;

pub use monitor::{AgentKind, ContentMonitor, PromptMonitor};
pub use text::{last_non_blank_line, strip_escapes};
