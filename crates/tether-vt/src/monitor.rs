use std::path::Path;

use crate::text::{last_non_blank_line, strip_escapes};

/// Change and idle detection over successive pane captures.
pub trait ContentMonitor: Send {
    /// Returns `(changed, looks_idle)` for a freshly captured pane.
    ///
    /// `changed` is relative to the previous call on the same monitor; the
    /// first call always reports a change.
    fn has_updated(&mut self, content: &str) -> (bool, bool);
}

/// Known agent CLIs and the prompts they show while waiting on the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Claude,
    Aider,
    Gemini,
    Unknown,
}

impl AgentKind {
    /// Detect the agent from a program command line such as
    /// `/usr/local/bin/claude --resume`.
    pub fn detect(program: &str) -> Self {
        let binary = program.split_whitespace().next().unwrap_or(program);
        let name = Path::new(binary)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(binary);

        if name.starts_with("claude") {
            AgentKind::Claude
        } else if name.starts_with("aider") {
            AgentKind::Aider
        } else if name.starts_with("gemini") {
            AgentKind::Gemini
        } else {
            AgentKind::Unknown
        }
    }

    /// Text that only appears while the agent is blocked on a confirmation.
    fn waiting_markers(self) -> &'static [&'static str] {
        match self {
            AgentKind::Claude => &["No, and tell Claude what to do differently"],
            AgentKind::Aider => &["(Y)es/(N)o/(D)on't ask again"],
            AgentKind::Gemini => &["Yes, allow once"],
            AgentKind::Unknown => &[],
        }
    }
}

/// Trailing characters that mark a shell-style input prompt.
const PROMPT_SUFFIXES: &[char] = &['$', '#', '%', '>', '❯'];

/// Default [`ContentMonitor`]: remembers the previous capture and looks for
/// agent confirmation prompts or a shell prompt on the last visible line.
#[derive(Debug)]
pub struct PromptMonitor {
    kind: AgentKind,
    last: Option<String>,
}

impl PromptMonitor {
    pub fn new(kind: AgentKind) -> Self {
        Self { kind, last: None }
    }

    pub fn for_program(program: &str) -> Self {
        Self::new(AgentKind::detect(program))
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    fn looks_idle(&self, content: &str) -> bool {
        let text = strip_escapes(content);
        if self
            .kind
            .waiting_markers()
            .iter()
            .any(|marker| text.contains(marker))
        {
            return true;
        }
        last_non_blank_line(&text)
            .map(|line| line.trim_end().ends_with(PROMPT_SUFFIXES))
            .unwrap_or(false)
    }
}

impl ContentMonitor for PromptMonitor {
    fn has_updated(&mut self, content: &str) -> (bool, bool) {
        let changed = self.last.as_deref() != Some(content);
        if changed {
            self.last = Some(content.to_string());
        }
        let idle = self.looks_idle(content);
        if idle {
            log::trace!("pane looks idle ({:?})", self.kind);
        }
        (changed, idle)
    }
}
