use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tether_pty::{cleanup_sessions, last_non_blank_line, strip_escapes, Session, SessionConfig, Tmux};

mod config;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Run coding agents in tmux sessions you can attach to and leave")]
#[command(version)]
struct Cli {
    /// Path to the config file (defaults to ~/.config/tether/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an agent session and attach to it
    Run {
        /// Display name for the session
        name: String,

        /// Agent command line to run inside the session
        #[arg(short, long, default_value = "claude")]
        program: String,

        /// Working directory (defaults to the current directory)
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Leave the session running after detaching
        #[arg(long)]
        keep: bool,
    },

    /// List sessions on the tmux server
    List,

    /// Kill every session created by tether
    Cleanup,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            name,
            program,
            workdir,
            keep,
        } => run(&name, &program, workdir, keep, config),
        Commands::List => list(&config),
        Commands::Cleanup => {
            let tmux = Tmux::system(config.socket_name.clone());
            let killed = cleanup_sessions(&tmux, &config.session_prefix)
                .context("Failed to clean up sessions")?;
            println!("killed {killed} session(s)");
            Ok(())
        }
    }
}

fn run(name: &str, program: &str, workdir: Option<PathBuf>, keep: bool, config: SessionConfig) -> Result<()> {
    let workdir = match workdir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let detach_key = config.detach_key_name();

    let mut session = Session::with_config(name, program, config);
    session
        .start(&workdir)
        .with_context(|| format!("Failed to start {program:?} in {}", workdir.display()))?;
    println!("started {} ({}); press {detach_key} to detach", session.display_name(), session.name());

    {
        let _raw = RawMode::enable()?;
        let signal = session.attach().context("Failed to attach")?;
        signal.wait();
    }

    if keep {
        println!("left {} running", session.name());
        return Ok(());
    }

    // Show where the agent was before tearing it down.
    if let Ok(content) = session.capture_pane_content() {
        let (_, idle) = session.has_updated(&content);
        if let Some(line) = last_non_blank_line(&strip_escapes(&content)) {
            println!("last output{}: {}", if idle { " (waiting)" } else { "" }, line.trim());
        }
    }
    session.kill().context("Failed to kill session")?;
    Ok(())
}

fn list(config: &SessionConfig) -> Result<()> {
    let tmux = Tmux::system(config.socket_name.clone());
    let names = tmux.list_sessions().context("Failed to list sessions")?;
    for name in names {
        let marker = if name.starts_with(&config.session_prefix) { "*" } else { " " };
        println!("{marker} {name}");
    }
    Ok(())
}

/// Puts the real terminal in raw mode for the life of the guard.
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            log::warn!("failed to restore terminal: {e}");
        }
    }
}
