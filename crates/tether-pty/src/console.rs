use std::io::{self, Write};
use std::time::Duration;

/// The user's real terminal, as seen by a live attach.
pub trait Console: Send + Sync {
    /// A handle on the keyboard input stream.
    fn input(&self) -> Box<dyn ConsoleInput>;

    /// A fresh handle on the screen output stream.
    fn output(&self) -> Box<dyn Write + Send>;

    /// Current `(cols, rows)`, or `None` when it cannot be determined.
    fn size(&self) -> Option<(u16, u16)>;
}

/// Keyboard input that can be waited on with a deadline.
///
/// Readers never block past `timeout`, so a reader that is told to stop
/// consumes nothing more from the stream.
pub trait ConsoleInput: Send {
    /// Read what is available within `timeout`. `Ok(None)` means nothing
    /// arrived; `Ok(Some(0))` means end of input.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

/// [`Console`] over the process's stdin/stdout.
///
/// Raw mode is the caller's responsibility; the attach protocol only moves
/// bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdConsole;

impl Console for StdConsole {
    fn input(&self) -> Box<dyn ConsoleInput> {
        Box::new(StdInput)
    }

    fn output(&self) -> Box<dyn Write + Send> {
        Box::new(io::stdout())
    }

    fn size(&self) -> Option<(u16, u16)> {
        crossterm::terminal::size()
            .ok()
            .filter(|&(cols, rows)| cols > 0 && rows > 0)
    }
}

/// Reads file descriptor 0 directly. Going through `io::stdin()` would let
/// its internal buffer hold bytes that `poll` cannot see.
struct StdInput;

#[cfg(unix)]
impl ConsoleInput for StdInput {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let mut fd = libc::pollfd {
            fd: libc::STDIN_FILENO,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `fd` is a single valid pollfd that outlives the call.
        let ready = unsafe { libc::poll(&mut fd, 1, millis) };
        if ready < 0 {
            return retry_or(io::Error::last_os_error());
        }
        if ready == 0 {
            return Ok(None);
        }

        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return retry_or(io::Error::last_os_error());
        }
        Ok(Some(n as usize))
    }
}

#[cfg(unix)]
fn retry_or(err: io::Error) -> io::Result<Option<usize>> {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => Ok(None),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
impl ConsoleInput for StdInput {
    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<Option<usize>> {
        use std::io::Read;
        io::stdin().read(buf).map(Some)
    }
}
