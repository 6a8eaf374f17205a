use std::time::Duration;

use serde::Deserialize;

/// Tunables for tmux-backed sessions.
///
/// Every field has a default, so a config file only needs the keys it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Private tmux socket (`tmux -L <name>`); `None` uses the default server.
    pub socket_name: Option<String>,
    /// Prepended to every server-side session name.
    pub session_prefix: String,
    /// Scrollback lines kept by tmux for each session.
    pub history_limit: u32,
    /// Enable tmux mouse reporting for the session.
    pub mouse: bool,
    /// Byte that ends a live attach instead of being forwarded (Ctrl-Q).
    pub detach_key: u8,
    /// Input discarded right after attaching, in milliseconds.
    pub input_grace_ms: u64,
    pub resize_interval_ms: u64,
    pub startup_timeout_ms: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    /// Size used when the real terminal cannot be queried.
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_name: None,
            session_prefix: "tether_".to_string(),
            history_limit: 10_000,
            mouse: true,
            detach_key: 0x11,
            input_grace_ms: 50,
            resize_interval_ms: 100,
            startup_timeout_ms: 2_000,
            poll_initial_ms: 5,
            poll_max_ms: 50,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl SessionConfig {
    pub fn input_grace(&self) -> Duration {
        Duration::from_millis(self.input_grace_ms)
    }

    pub fn resize_interval(&self) -> Duration {
        Duration::from_millis(self.resize_interval_ms.max(1))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms.max(1))
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms.max(self.poll_initial_ms).max(1))
    }

    /// Human-readable name of the detach key, e.g. `Ctrl-Q`.
    pub fn detach_key_name(&self) -> String {
        match self.detach_key {
            key @ 0x01..=0x1a => format!("Ctrl-{}", (b'A' + key - 1) as char),
            key => format!("0x{key:02x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.history_limit, 10_000);
        assert_eq!(config.input_grace(), Duration::from_millis(50));
        assert_eq!(config.resize_interval(), Duration::from_millis(100));
        assert_eq!(config.startup_timeout(), Duration::from_secs(2));
        assert_eq!(config.poll_initial(), Duration::from_millis(5));
        assert_eq!(config.poll_max(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            socket_name = "agents"
            history_limit = 50000
            mouse = false
            "#,
        )
        .unwrap();

        assert_eq!(config.socket_name.as_deref(), Some("agents"));
        assert_eq!(config.history_limit, 50_000);
        assert!(!config.mouse);
        assert_eq!(config.session_prefix, "tether_");
        assert_eq!(config.detach_key, 0x11);
    }

    #[test]
    fn test_detach_key_name() {
        let mut config = SessionConfig::default();
        assert_eq!(config.detach_key_name(), "Ctrl-Q");
        config.detach_key = 0x01;
        assert_eq!(config.detach_key_name(), "Ctrl-A");
        config.detach_key = 0x1d;
        assert_eq!(config.detach_key_name(), "0x1d");
    }

    #[test]
    fn test_poll_max_never_below_initial() {
        let config = SessionConfig {
            poll_initial_ms: 80,
            poll_max_ms: 10,
            ..SessionConfig::default()
        };
        assert_eq!(config.poll_max(), Duration::from_millis(80));
    }
}
