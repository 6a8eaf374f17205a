//! In-memory doubles for the PTY spawner, the tmux server and the console.
//!
//! Together they let the full start/attach/detach protocol run without a
//! terminal or a tmux binary. Each double hands out cheap cloneable handles
//! so a test can feed input and inspect side effects while a session owns
//! the other end.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::console::{Console, ConsoleInput};
use crate::pty::{CommandSpec, PtyError, PtyMaster, PtySpawner};
use crate::tmux::{CommandOutput, Executor};
use crate::lock;

/// Blocking reader over a channel of byte chunks. Reports EOF once every
/// sender is gone.
pub struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            pos: 0,
        }
    }

    /// Like [`Read::read`], but gives up after `timeout` with `Ok(None)`.
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if self.pos >= self.pending.len() {
            match self.rx.recv_timeout(timeout) {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Ok(Some(0)),
            }
        }
        Ok(Some(self.take_pending(buf)))
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = (self.pending.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        Ok(self.take_pending(buf))
    }
}

/// Writer appending into a shared buffer.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct PtyState {
    output: Option<Sender<Vec<u8>>>,
    reader: Option<ChannelReader>,
    written: Vec<u8>,
    resizes: Vec<(u16, u16)>,
    closes: usize,
    closed: bool,
}

/// Test-side handle on a PTY handed out by [`FakeSpawner`].
#[derive(Clone)]
pub struct FakePty {
    spec: CommandSpec,
    size: (u16, u16),
    state: Arc<Mutex<PtyState>>,
}

impl FakePty {
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Size requested at spawn time.
    pub fn initial_size(&self) -> (u16, u16) {
        self.size
    }

    /// Make the "child" print `bytes`. Returns false once the PTY is gone.
    pub fn emit(&self, bytes: &[u8]) -> bool {
        match &lock(&self.state).output {
            Some(tx) => tx.send(bytes.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Simulate the child exiting on its own: readers see EOF without
    /// anyone closing the master.
    pub fn hang_up(&self) {
        lock(&self.state).output = None;
    }

    /// Everything written to the master so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        lock(&self.state).resizes.clone()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

struct FakeMaster {
    state: Arc<Mutex<PtyState>>,
}

impl PtyMaster for FakeMaster {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PtyError> {
        let reader = lock(&self.state).reader.take().ok_or(PtyError::Closed)?;
        Ok(Box::new(reader))
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, PtyError> {
        Ok(Box::new(FakeWriter {
            state: Arc::clone(&self.state),
        }))
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(PtyError::Closed);
        }
        state.resizes.push((cols, rows));
        Ok(())
    }

    fn close(&mut self) -> Result<(), PtyError> {
        let mut state = lock(&self.state);
        state.closes += 1;
        state.closed = true;
        state.output = None;
        Ok(())
    }
}

struct FakeWriter {
    state: Arc<Mutex<PtyState>>,
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "PTY closed"));
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type SpawnHook = Box<dyn Fn(&CommandSpec) + Send + Sync>;

/// [`PtySpawner`] that fabricates PTYs and records every request.
#[derive(Default)]
pub struct FakeSpawner {
    ptys: Mutex<Vec<FakePty>>,
    fail_next: AtomicBool,
    hook: Option<SpawnHook>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` for every successful spawn, before the master is returned.
    pub fn with_hook(hook: impl Fn(&CommandSpec) + Send + Sync + 'static) -> Self {
        Self {
            hook: Some(Box::new(hook)),
            ..Self::default()
        }
    }

    /// Make the next spawn fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        lock(&self.ptys).iter().map(|p| p.spec.clone()).collect()
    }

    pub fn ptys(&self) -> Vec<FakePty> {
        lock(&self.ptys).clone()
    }

    pub fn last(&self) -> Option<FakePty> {
        lock(&self.ptys).last().cloned()
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(
        &self,
        spec: &CommandSpec,
        cols: u16,
        rows: u16,
    ) -> Result<Box<dyn PtyMaster>, PtyError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PtyError::SpawnFailed("injected failure".to_string()));
        }

        let (tx, rx) = mpsc::channel();
        let state = Arc::new(Mutex::new(PtyState {
            output: Some(tx),
            reader: Some(ChannelReader::new(rx)),
            ..PtyState::default()
        }));
        lock(&self.ptys).push(FakePty {
            spec: spec.clone(),
            size: (cols, rows),
            state: Arc::clone(&state),
        });
        if let Some(hook) = &self.hook {
            hook(spec);
        }
        Ok(Box::new(FakeMaster { state }))
    }
}

#[derive(Default)]
struct ServerState {
    sessions: BTreeSet<String>,
    panes: HashMap<String, String>,
    calls: Vec<Vec<String>>,
    unreachable: bool,
}

/// In-memory tmux server answering the commands sessions issue.
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, name: &str) {
        lock(&self.state).sessions.insert(name.to_string());
    }

    pub fn remove_session(&self, name: &str) {
        lock(&self.state).sessions.remove(name);
    }

    pub fn has(&self, name: &str) -> bool {
        lock(&self.state).sessions.contains(name)
    }

    pub fn set_pane(&self, name: &str, content: &str) {
        lock(&self.state)
            .panes
            .insert(name.to_string(), content.to_string());
    }

    pub fn pane(&self, name: &str) -> String {
        lock(&self.state).panes.get(name).cloned().unwrap_or_default()
    }

    /// Make every command fail to execute, as if tmux were not installed.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Every command seen, with any `-L <socket>` prefix removed.
    pub fn calls(&self) -> Vec<Vec<String>> {
        lock(&self.state).calls.clone()
    }

    /// Number of calls to a tmux subcommand such as `has-session`.
    pub fn count(&self, subcommand: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some(subcommand))
            .count()
    }

    /// Spawn hook: a `new-session` run on a PTY creates the session.
    pub fn handle_spawn(&self, spec: &CommandSpec) {
        if spec.args.iter().any(|a| a == "new-session") {
            if let Some(name) = spec.flag_value("-s") {
                self.add_session(name);
            }
        }
    }
}

fn strip_socket(args: &[String]) -> &[String] {
    match args {
        [flag, _, rest @ ..] if flag == "-L" => rest,
        _ => args,
    }
}

fn target(args: &[String]) -> String {
    args.iter()
        .position(|a| a == "-t")
        .and_then(|i| args.get(i + 1))
        .map(|t| t.trim_start_matches('=').trim_end_matches(':').to_string())
        .unwrap_or_default()
}

impl Executor for FakeServer {
    fn run(&self, _program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let args = strip_socket(args);
        let mut state = lock(&self.state);
        state.calls.push(args.to_vec());
        if state.unreachable {
            return Err(io::Error::new(io::ErrorKind::NotFound, "tmux: not found"));
        }

        let name = target(args);
        let exists = state.sessions.contains(&name);
        let ok = |stdout: String| CommandOutput {
            success: true,
            stdout,
            stderr: String::new(),
        };
        let missing = CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: format!("can't find session: {name}"),
        };

        let subcommand = args.first().map(String::as_str).unwrap_or_default();
        let output = match subcommand {
            "list-sessions" => {
                let names: Vec<&str> = state.sessions.iter().map(String::as_str).collect();
                ok(names.join("\n"))
            }
            _ if !exists => missing,
            "has-session" | "set-option" | "resize-window" => ok(String::new()),
            "capture-pane" => ok(state.panes.get(&name).cloned().unwrap_or_default()),
            "send-keys" => {
                let literal = args.iter().any(|a| a == "-l");
                let keys = args.last().cloned().unwrap_or_default();
                let pane = state.panes.entry(name).or_default();
                if literal {
                    pane.push_str(&keys);
                } else if keys == "Enter" {
                    pane.push('\n');
                }
                ok(String::new())
            }
            "kill-session" => {
                state.sessions.remove(&name);
                state.panes.remove(&name);
                ok(String::new())
            }
            other => CommandOutput {
                success: false,
                stdout: String::new(),
                stderr: format!("unknown command: {other}"),
            },
        };
        Ok(output)
    }
}

/// [`Console`] backed by channels and buffers.
///
/// Every [`Console::input`] handle reads the same stream, the way every
/// `io::stdin()` handle shares one file descriptor. A handle left running
/// after an attach would steal keystrokes from the next one.
pub struct FakeConsole {
    typed: Mutex<Sender<Vec<u8>>>,
    input: Arc<Mutex<ChannelReader>>,
    screen: SharedBuffer,
    size: Mutex<Option<(u16, u16)>>,
}

impl FakeConsole {
    pub fn new(cols: u16, rows: u16) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            typed: Mutex::new(tx),
            input: Arc::new(Mutex::new(ChannelReader::new(rx))),
            screen: SharedBuffer::default(),
            size: Mutex::new(Some((cols, rows))),
        }
    }

    /// Simulate the user typing.
    pub fn type_bytes(&self, bytes: &[u8]) -> bool {
        lock(&self.typed).send(bytes.to_vec()).is_ok()
    }

    /// Everything written to the screen so far.
    pub fn printed(&self) -> String {
        self.screen.text()
    }

    pub fn set_size(&self, size: Option<(u16, u16)>) {
        *lock(&self.size) = size;
    }
}

struct FakeInput(Arc<Mutex<ChannelReader>>);

impl ConsoleInput for FakeInput {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        lock(&self.0).read_timeout(buf, timeout)
    }
}

impl Console for FakeConsole {
    fn input(&self) -> Box<dyn ConsoleInput> {
        Box::new(FakeInput(Arc::clone(&self.input)))
    }

    fn output(&self) -> Box<dyn Write + Send> {
        Box::new(self.screen.clone())
    }

    fn size(&self) -> Option<(u16, u16)> {
        *lock(&self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_reader_splits_chunks() {
        let (tx, rx) = mpsc::channel();
        let mut reader = ChannelReader::new(rx);
        tx.send(b"hello".to_vec()).unwrap();
        tx.send(Vec::new()).unwrap();
        tx.send(b"!".to_vec()).unwrap();
        drop(tx);

        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'!');
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_fake_master_close_ends_output() {
        let spawner = FakeSpawner::new();
        let mut master = spawner.spawn(&CommandSpec::new("tmux"), 80, 24).unwrap();
        let mut reader = master.take_reader().unwrap();
        let pty = spawner.last().unwrap();

        assert!(pty.emit(b"hi"));
        master.close().unwrap();
        assert!(!pty.emit(b"late"));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hi");
        assert_eq!(pty.close_count(), 1);
    }

    #[test]
    fn test_fake_spawner_failure_is_one_shot() {
        let spawner = FakeSpawner::new();
        spawner.fail_next();
        assert!(spawner.spawn(&CommandSpec::new("tmux"), 80, 24).is_err());
        assert!(spawner.spawn(&CommandSpec::new("tmux"), 80, 24).is_ok());
        assert_eq!(spawner.specs().len(), 1);
    }

    #[test]
    fn test_fake_server_lifecycle() {
        let server = FakeServer::new();
        let spec = CommandSpec::new("tmux").args(["new-session", "-d", "-s", "s1", "-c", "/", "sh"]);
        server.handle_spawn(&spec);
        assert!(server.has("s1"));

        let args = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(server.run("tmux", &args(&["-L", "x", "has-session", "-t", "=s1"])).unwrap().success);
        server.run("tmux", &args(&["kill-session", "-t", "=s1"])).unwrap();
        assert!(!server.run("tmux", &args(&["has-session", "-t", "=s1"])).unwrap().success);
        assert_eq!(server.count("has-session"), 2);
    }

    #[test]
    fn test_channel_reader_times_out() {
        let (tx, rx) = mpsc::channel();
        let mut reader = ChannelReader::new(rx);
        let mut buf = [0u8; 4];

        let wait = Duration::from_millis(10);
        assert_eq!(reader.read_timeout(&mut buf, wait).unwrap(), None);
        tx.send(b"ok".to_vec()).unwrap();
        assert_eq!(reader.read_timeout(&mut buf, wait).unwrap(), Some(2));
        drop(tx);
        assert_eq!(reader.read_timeout(&mut buf, wait).unwrap(), Some(0));
    }

    #[test]
    fn test_fake_console_handles_share_one_stream() {
        let console = FakeConsole::new(80, 24);
        let mut first = console.input();
        let mut second = console.input();
        let wait = Duration::from_millis(50);
        let mut buf = [0u8; 8];

        assert!(console.type_bytes(b"abc"));
        assert_eq!(first.read_timeout(&mut buf[..1], wait).unwrap(), Some(1));
        assert_eq!(buf[0], b'a');
        // Whatever one handle leaves unread, the next one gets.
        assert_eq!(second.read_timeout(&mut buf, wait).unwrap(), Some(2));
        assert_eq!(&buf[..2], b"bc");
        assert_eq!(first.read_timeout(&mut buf, wait).unwrap(), None);
    }
}
