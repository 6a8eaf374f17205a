//! Live attach/detach protocol.
//!
//! An attach runs its workers on a private tokio runtime, all watching one
//! cancellation token:
//!
//! - input pump: polls the real terminal for keystrokes,
//! - output relay: PTY master → real terminal (blocking copy),
//! - input relay: pumped keystrokes → PTY master, minus the grace window and
//!   the detach key,
//! - resize relay: polls the real terminal size.
//!
//! Whoever triggers detach first (the detach key or an explicit call) cancels
//! the token, closes the master to unblock the output relay, waits for every
//! worker, then closes the [`DetachSignal`]. Later triggers do nothing. Once
//! the signal closes nothing reads the real terminal any more.

use std::future::Future;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::console::{Console, ConsoleInput};
use crate::lock;
use crate::session::{SessionError, Shared};

/// Longest the input pump waits on the terminal before rechecking the token.
const INPUT_POLL: Duration = Duration::from_millis(20);

/// Completes once a live attach has fully detached.
///
/// Usable from blocking code ([`wait`](Self::wait),
/// [`wait_timeout`](Self::wait_timeout)) or awaited as a future.
#[derive(Debug)]
pub struct DetachSignal {
    rx: oneshot::Receiver<()>,
    done: Receiver<()>,
}

impl DetachSignal {
    /// Block the calling thread until the attach ends.
    pub fn wait(self) {
        let _ = self.done.recv();
    }

    /// Block for at most `timeout`. Returns whether the attach ended.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        matches!(
            self.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Whether the attach has already ended. Never blocks.
    pub fn is_detached(&mut self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl Future for DetachSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

/// Both halves close together when dropped.
struct DetachNotifier {
    _waker: oneshot::Sender<()>,
    _blocking: Sender<()>,
}

fn detach_signal() -> (DetachNotifier, DetachSignal) {
    let (waker_tx, rx) = oneshot::channel();
    let (blocking_tx, done) = std::sync::mpsc::channel();
    (
        DetachNotifier {
            _waker: waker_tx,
            _blocking: blocking_tx,
        },
        DetachSignal { rx, done },
    )
}

/// Fields that exist only while an attach is live.
pub(crate) struct AttachState {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    runtime: Option<Runtime>,
    /// Dropped to close the caller's [`DetachSignal`].
    detached: Option<DetachNotifier>,
    detaching: Arc<Mutex<bool>>,
}

/// Streams handed to a new attach.
pub(crate) struct AttachIo {
    pub(crate) reader: Box<dyn Read + Send>,
    pub(crate) writer: Box<dyn Write + Send>,
    pub(crate) console: Arc<dyn Console>,
}

/// Start the workers for an attach whose master is already stored in
/// `shared`. The input grace window starts as this returns.
pub(crate) fn launch(
    shared: &Arc<Shared>,
    io: AttachIo,
    config: &SessionConfig,
) -> Result<DetachSignal, SessionError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("tether-attach")
        .enable_time()
        .build()
        .map_err(SessionError::Workers)?;

    let cancel = CancellationToken::new();
    let (notifier, signal) = detach_signal();
    let (chunks_tx, chunks_rx) = mpsc::channel(64);
    let grace_until = Arc::new(OnceLock::new());

    // Held while the workers start so a trigger never sees a partial group.
    let mut slot = lock(&shared.attach);

    let pump = {
        let input = io.console.input();
        let cancel = cancel.clone();
        runtime.spawn_blocking(move || pump_input(input, chunks_tx, &cancel))
    };

    let output = {
        let screen = io.console.output();
        let cancel = cancel.clone();
        let display_name = shared.display_name.clone();
        let detach_key = config.detach_key_name();
        let reader = io.reader;
        runtime.spawn_blocking(move || {
            relay_output(reader, screen, &cancel, &display_name, &detach_key)
        })
    };

    let input = runtime.spawn(relay_input(
        chunks_rx,
        io.writer,
        cancel.clone(),
        Arc::clone(shared),
        config.detach_key,
        Arc::clone(&grace_until),
    ));

    let resize = runtime.spawn(relay_resize(
        Arc::clone(shared),
        io.console,
        cancel.clone(),
        config.resize_interval(),
    ));

    *slot = Some(AttachState {
        cancel,
        workers: vec![pump, output, input, resize],
        runtime: Some(runtime),
        detached: Some(notifier),
        detaching: Arc::new(Mutex::new(false)),
    });
    drop(slot);

    let _ = grace_until.set(Instant::now() + config.input_grace());
    Ok(signal)
}

impl Shared {
    /// Run the detach sequence if an attach is live and no other trigger got
    /// there first.
    pub(crate) fn detach(&self) {
        let (cancel, detaching) = match lock(&self.attach).as_ref() {
            Some(state) => (state.cancel.clone(), Arc::clone(&state.detaching)),
            None => return,
        };
        {
            let mut triggered = lock(&detaching);
            if *triggered {
                log::debug!("detach of {} already in progress", self.name);
                return;
            }
            *triggered = true;
        }

        log::debug!("detaching from {}", self.name);
        cancel.cancel();

        if let Some(mut master) = lock(&self.master).take() {
            if let Err(e) = master.close() {
                fatal("failed to close attach PTY", &e);
            }
        }

        let (workers, runtime) = match lock(&self.attach).as_mut() {
            Some(state) => (std::mem::take(&mut state.workers), state.runtime.take()),
            None => (Vec::new(), None),
        };
        for outcome in futures::executor::block_on(futures::future::join_all(workers)) {
            if let Err(e) = outcome {
                log::error!("attach worker for {} failed: {e}", self.name);
            }
        }
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }

        // Clear the group before waking the caller so it can re-attach at once.
        let state = lock(&self.attach).take();
        drop(state.and_then(|mut s| s.detached.take()));
        log::info!("detached from {}", self.name);

        match self.tmux.has_session(&self.name) {
            Ok(true) => {}
            Ok(false) => log::warn!("tmux session {} is gone after detach", self.name),
            Err(e) => fatal("tmux unreachable after detach", &e),
        }
    }
}

/// Teardown failed half way; the terminal state is unknown.
fn fatal(what: &str, err: &dyn std::error::Error) -> ! {
    log::error!("{what}: {err}");
    eprintln!("tether: fatal: {what}: {err}");
    std::process::abort()
}

/// Forward keystrokes until cancelled. Reads are bounded by [`INPUT_POLL`],
/// so after cancellation nothing more is taken from the terminal.
fn pump_input(
    mut input: Box<dyn ConsoleInput>,
    chunks: mpsc::Sender<Vec<u8>>,
    cancel: &CancellationToken,
) {
    let mut buf = [0u8; 1024];
    while !cancel.is_cancelled() {
        let n = match input.read_timeout(&mut buf, INPUT_POLL) {
            Ok(None) => continue,
            Ok(Some(0)) => return,
            Ok(Some(n)) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("terminal input ended: {e}");
                return;
            }
        };
        if chunks.blocking_send(buf[..n].to_vec()).is_err() {
            return;
        }
    }
}

/// Whether the grace window has been opened and has elapsed.
fn accepting_input(grace_until: &OnceLock<Instant>) -> bool {
    grace_until.get().is_some_and(|until| Instant::now() >= *until)
}

fn relay_output(
    mut reader: Box<dyn Read + Send>,
    mut screen: Box<dyn Write + Send>,
    cancel: &CancellationToken,
    display_name: &str,
    detach_key: &str,
) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if screen.write_all(&buf[..n]).and_then(|_| screen.flush()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("attach output for {display_name} ended: {e}");
                break;
            }
        }
    }

    if !cancel.is_cancelled() {
        log::warn!("session {display_name} ended unexpectedly while attached");
        let _ = write!(
            screen,
            "\r\n[tether] session '{display_name}' ended unexpectedly; press {detach_key} to return\r\n"
        );
        let _ = screen.flush();
    }
}

async fn relay_input(
    mut chunks: mpsc::Receiver<Vec<u8>>,
    mut writer: Box<dyn Write + Send>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    detach_key: u8,
    grace_until: Arc<OnceLock<Instant>>,
) {
    let mut write_failed = false;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = chunks.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        // Replies to the terminal queries tmux sends on attach.
        if !accepting_input(&grace_until) {
            log::trace!("discarding {} input bytes inside grace window", chunk.len());
            continue;
        }

        let detach_at = chunk.iter().position(|&b| b == detach_key);
        let forward = &chunk[..detach_at.unwrap_or(chunk.len())];
        if !forward.is_empty() {
            if let Err(e) = writer.write_all(forward).and_then(|_| writer.flush()) {
                if !write_failed {
                    log::warn!("input to {} not delivered: {e}", shared.name);
                    write_failed = true;
                }
            }
        }

        if detach_at.is_some() {
            trigger_detach(shared);
            break;
        }
    }
}

/// The detach sequence waits for this relay, so it runs elsewhere.
fn trigger_detach(shared: Arc<Shared>) {
    let name = format!("tether-detach-{}", shared.name);
    if let Err(e) = thread::Builder::new().name(name).spawn(move || shared.detach()) {
        log::error!("failed to start detach: {e}");
    }
}

async fn relay_resize(
    shared: Arc<Shared>,
    console: Arc<dyn Console>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Some(size) = console.size() {
            apply_size(&shared, size);
        }
    }
}

fn apply_size(shared: &Shared, size: (u16, u16)) {
    {
        let mut last = lock(&shared.size);
        if *last == size {
            return;
        }
        *last = size;
    }
    if let Some(master) = lock(&shared.master).as_ref() {
        match master.resize(size.0, size.1) {
            Ok(()) => log::debug!("resized {} to {}x{}", shared.name, size.0, size.1),
            Err(e) => log::debug!("resize of {} failed: {e}", shared.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionDeps};
    use crate::testing::{FakeConsole, FakePty, FakeServer, FakeSpawner};
    use tether_vt::PromptMonitor;

    const DETACH: u8 = 0x11;
    const WAIT: Duration = Duration::from_secs(5);

    struct Rig {
        session: Session,
        server: Arc<FakeServer>,
        spawner: Arc<FakeSpawner>,
        console: Arc<FakeConsole>,
    }

    impl Rig {
        fn started() -> Self {
            Self::started_with(SessionConfig::default())
        }

        fn started_with(config: SessionConfig) -> Self {
            let server = Arc::new(FakeServer::new());
            let hook_server = Arc::clone(&server);
            let spawner = Arc::new(FakeSpawner::with_hook(move |spec| {
                hook_server.handle_spawn(spec)
            }));
            let console = Arc::new(FakeConsole::new(120, 40));
            let deps = SessionDeps {
                spawner: spawner.clone(),
                executor: server.clone(),
                console: console.clone(),
                monitor: Box::new(PromptMonitor::for_program("claude")),
            };
            let mut session = Session::with_deps("claude", "claude", config, deps);
            session.start("/work/repo").unwrap();
            Rig {
                session,
                server,
                spawner,
                console,
            }
        }

        /// Attach and return the signal plus the attach PTY.
        fn attach(&mut self) -> (DetachSignal, FakePty) {
            let signal = self.session.attach().unwrap();
            let pty = self.spawner.last().unwrap();
            assert!(pty.spec().args.iter().any(|a| a == "attach-session"));
            (signal, pty)
        }
    }

    /// Poll `cond` until it holds or `WAIT` elapses.
    fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn past_grace() {
        thread::sleep(Duration::from_millis(120));
    }

    #[test]
    fn test_attach_forwards_input_and_output() {
        let mut rig = Rig::started();
        let (mut signal, pty) = rig.attach();
        assert!(rig.session.is_attached());
        assert_eq!(pty.initial_size(), (120, 40));

        assert!(pty.emit(b"agent says hi"));
        assert!(eventually(|| rig.console.printed().contains("agent says hi")));

        past_grace();
        assert!(rig.console.type_bytes(b"hello"));
        assert!(eventually(|| pty.written() == b"hello"));

        rig.session.detach();
        assert!(signal.wait_timeout(WAIT));
        assert!(!rig.session.is_attached());
        assert!(pty.is_closed());
    }

    #[test]
    fn test_grace_window_discards_early_input() {
        let mut rig = Rig::started_with(SessionConfig {
            input_grace_ms: 300,
            ..SessionConfig::default()
        });
        let (mut signal, pty) = rig.attach();

        assert!(rig.console.type_bytes(b"\x1b[?1;2c"));
        assert!(rig.console.type_bytes(&[DETACH]));
        thread::sleep(Duration::from_millis(400));
        assert!(!signal.is_detached(), "detach key inside grace window must be ignored");

        assert!(rig.console.type_bytes(b"late"));
        assert!(eventually(|| pty.written() == b"late"));

        rig.session.detach();
        assert!(signal.wait_timeout(WAIT));
    }

    #[test]
    fn test_detach_key_forwards_prefix_only() {
        let mut rig = Rig::started();
        let (mut signal, pty) = rig.attach();

        past_grace();
        assert!(rig.console.type_bytes(b"ab\x11cd"));

        assert!(signal.wait_timeout(WAIT));
        assert_eq!(pty.written(), b"ab");
        assert!(!rig.session.is_attached());
        assert_eq!(pty.close_count(), 1);
    }

    #[test]
    fn test_repeated_detach_triggers_run_once() {
        let mut rig = Rig::started();
        let (mut signal, pty) = rig.attach();
        let checks_before = rig.server.count("has-session");

        past_grace();
        rig.console.type_bytes(&[DETACH, DETACH, DETACH]);
        rig.console.type_bytes(&[DETACH]);
        rig.session.detach();
        rig.session.detach();

        assert!(signal.wait_timeout(WAIT));
        // Let a losing trigger finish if it were going to misbehave.
        thread::sleep(Duration::from_millis(100));

        assert_eq!(pty.close_count(), 1);
        assert!(pty.written().is_empty());
        // Exactly one post-detach liveness check.
        assert_eq!(rig.server.count("has-session"), checks_before + 1);
        assert!(!rig.session.is_attached());
    }

    #[test]
    fn test_detach_interrupts_blocked_input_read() {
        let mut rig = Rig::started();
        let (mut signal, _pty) = rig.attach();

        // Nothing typed: the pump is parked in a read.
        let started = Instant::now();
        rig.session.detach();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(signal.is_detached());
        assert!(!rig.session.is_attached());
    }

    #[test]
    fn test_unexpected_end_warns_and_stays_detachable() {
        let mut rig = Rig::started();
        let (mut signal, pty) = rig.attach();

        pty.hang_up();
        assert!(eventually(|| rig.console.printed().contains("ended unexpectedly")));
        assert!(rig.console.printed().contains("Ctrl-Q"));
        assert!(rig.session.is_attached());

        past_grace();
        rig.console.type_bytes(&[DETACH]);
        assert!(signal.wait_timeout(WAIT));
    }

    #[test]
    fn test_clean_detach_does_not_warn() {
        let mut rig = Rig::started();
        let (mut signal, _pty) = rig.attach();
        rig.session.detach();
        assert!(signal.wait_timeout(WAIT));
        assert!(!rig.console.printed().contains("ended unexpectedly"));
    }

    #[test]
    fn test_resize_relay_follows_console() {
        let mut rig = Rig::started();
        let (mut signal, pty) = rig.attach();

        rig.console.set_size(Some((100, 30)));
        assert!(eventually(|| pty.resizes().contains(&(100, 30))));
        assert_eq!(rig.session.size(), (100, 30));

        rig.session.set_detached_size(90, 20).unwrap();
        assert!(pty.resizes().contains(&(90, 20)));

        rig.session.detach();
        assert!(signal.wait_timeout(WAIT));
    }

    #[test]
    fn test_round_trip_cycles() {
        let mut rig = Rig::started();
        for _ in 0..5 {
            let (mut signal, pty) = rig.attach();
            past_grace();
            assert!(rig.console.type_bytes(&[DETACH]));
            assert!(signal.wait_timeout(WAIT));
            assert_eq!(pty.close_count(), 1);
            assert!(!rig.session.is_attached());
        }
        // One bootstrap PTY plus one per attach.
        assert_eq!(rig.spawner.specs().len(), 6);
        assert!(rig.session.capture_pane_content().is_ok());
    }

    #[test]
    fn test_attach_spawn_failure_leaves_idle() {
        let mut rig = Rig::started();
        rig.spawner.fail_next();
        let err = rig.session.attach().unwrap_err();
        assert!(matches!(err, SessionError::Attach { .. }), "got {err:?}");
        assert!(!rig.session.is_attached());

        let (mut signal, _pty) = rig.attach();
        rig.session.detach();
        assert!(signal.wait_timeout(WAIT));
    }

    #[test]
    fn test_double_attach_rejected() {
        let mut rig = Rig::started();
        let (mut signal, _pty) = rig.attach();
        assert!(matches!(
            rig.session.attach(),
            Err(SessionError::AlreadyAttached(_))
        ));
        rig.session.detach();
        assert!(signal.wait_timeout(WAIT));
    }

    #[test]
    fn test_attach_missing_session() {
        let mut rig = Rig::started();
        rig.server.remove_session(rig.session.name());
        assert!(matches!(rig.session.attach(), Err(SessionError::NotFound(_))));
        assert_eq!(rig.spawner.specs().len(), 1);
    }

    #[test]
    fn test_kill_while_attached() {
        let mut rig = Rig::started();
        let name = rig.session.name().to_string();
        let (mut signal, pty) = rig.attach();

        rig.session.kill().unwrap();
        assert!(signal.is_detached());
        assert!(pty.is_closed());
        assert!(!rig.server.has(&name));
    }

    #[test]
    fn test_drop_while_attached_detaches() {
        let mut rig = Rig::started();
        let (mut signal, pty) = rig.attach();
        let name = rig.session.name().to_string();

        drop(rig.session);
        assert!(signal.wait_timeout(WAIT));
        assert!(pty.is_closed());
        // Dropping a session never destroys the tmux side.
        assert!(rig.server.has(&name));
    }

    #[test]
    fn test_reattach_after_external_detach_sees_detach_key() {
        let mut rig = Rig::started();
        let (mut first, _) = rig.attach();
        rig.session.detach();
        assert!(first.wait_timeout(WAIT));

        let (mut second, pty) = rig.attach();
        thread::sleep(Duration::from_millis(150));
        assert!(rig.console.type_bytes(b"y"));
        assert!(rig.console.type_bytes(&[DETACH]));
        assert!(second.wait_timeout(WAIT), "detach key typed on second attach was lost");
        assert_eq!(pty.written(), b"y");
    }

    #[test]
    fn test_detached_attach_reads_no_more_input() {
        let mut rig = Rig::started();
        let (mut signal, pty) = rig.attach();
        rig.session.detach();
        assert!(signal.wait_timeout(WAIT));

        // Typed after detach: belongs to whoever reads the terminal next.
        assert!(rig.console.type_bytes(b"ls\n"));
        thread::sleep(Duration::from_millis(100));

        let mut input = rig.console.input();
        let mut buf = [0u8; 8];
        assert_eq!(input.read_timeout(&mut buf, WAIT).unwrap(), Some(3));
        assert_eq!(&buf[..3], b"ls\n");
        assert!(pty.written().is_empty());
    }

    #[test]
    fn test_wait_timeout_expires_while_attached() {
        let mut rig = Rig::started();
        let (mut signal, _pty) = rig.attach();

        let started = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!signal.is_detached());

        rig.session.detach();
        assert!(signal.is_detached());
    }

    #[test]
    fn test_grace_window_opens_only_once_armed() {
        let grace = OnceLock::new();
        assert!(!accepting_input(&grace));

        grace.set(Instant::now() + Duration::from_secs(60)).unwrap();
        assert!(!accepting_input(&grace));

        let elapsed = OnceLock::new();
        elapsed.set(Instant::now()).unwrap();
        assert!(accepting_input(&elapsed));
    }

    #[tokio::test]
    async fn test_signal_is_awaitable() {
        let mut rig = Rig::started();
        let (signal, _pty) = rig.attach();

        tokio::time::sleep(Duration::from_millis(120)).await;
        rig.console.type_bytes(&[DETACH]);
        tokio::time::timeout(WAIT, signal)
            .await
            .expect("detach signal did not fire");
    }
}
