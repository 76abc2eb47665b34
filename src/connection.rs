//! A single accepted TCP connection: its buffers, framing state, and the
//! deferred-close protocol.

use crate::close::CloseReason;
use crate::fmt as formatters;
use crate::severity::{logger_default, Severity};
use crate::tokenizer;
use mio::net::TcpStream;
use std::fmt::Arguments;
use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Sends `data` the way the original's `SETSOCKOPT_NOSIGPIPE_UNLESS_MSG_NOSIGNAL`
/// dance does: on platforms where `send(2)` takes `MSG_NOSIGNAL`, pass it so a
/// peer that already closed its read side reports `EPIPE` as a normal error
/// instead of raising `SIGPIPE`. Apple targets have no `MSG_NOSIGNAL`; there,
/// `SO_NOSIGPIPE` is set once on the socket at accept time instead (see
/// `server::set_nosigpipe`), so a plain write is already safe. Other
/// platforms get a plain write too, relying on Rust's Unix runtime disabling
/// `SIGPIPE` process-wide at startup (see DESIGN.md).
#[cfg(target_os = "linux")]
fn sigsafe_send(stream: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
    let fd = stream.as_raw_fd();
    let n = unsafe { libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), libc::MSG_NOSIGNAL) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(not(target_os = "linux"))]
fn sigsafe_send(stream: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
    stream.write(data)
}

/// Which byte sequence terminates a command line.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LineTerm {
    /// A bare `\n` ends a line.
    Lf,
    /// Only `\r\n` ends a line; a lone `\n` is just data.
    CrLf,
    /// Either `\r\n` or a bare `\n` ends a line.
    CrLfOrLf,
}

/// Whether a cmd handler is currently executing on this connection.
///
/// `close()` behaves differently depending on this: called while
/// `Handled`, it can't free the connection immediately (the handler is
/// still running with a borrow into it), so it only records the reason;
/// the reader finalizes the close once the handler returns.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ConnState {
    Default,
    Handled,
}

/// What happened during one [`Connection::read`] call.
pub(crate) enum ReadOutcome {
    /// The connection is still open; zero or more lines were dispatched.
    Continue,
    /// The connection must be closed for the given reason. The reader
    /// stopped looking at the buffer the moment this was decided.
    Close(CloseReason),
}

pub(crate) type TokenizerFn = fn(&str, usize) -> Result<Vec<String>, tokenizer::TooManyTokens>;

/// A single accepted connection.
///
/// `Connection` owns its framing buffers and per-connection settings; it
/// has no idea what the command/open/close handlers are -- those are
/// invoked by the server, which is the sole owner of that shared,
/// possibly-stateful application logic. A connection only ever sees a
/// `dispatch` closure handed to it by the server for the duration of one
/// `read` call.
pub struct Connection {
    id: u64,
    stream: TcpStream,
    peer: String,

    connected_at: Instant,
    last_activity_at: Instant,
    client_timeout: Option<Duration>,

    readbuf: Vec<u8>,
    readbuf_size: usize,
    buflen: usize,
    overflow: bool,

    argc_max: usize,
    lineterm: LineTerm,
    tokenizer: Option<TokenizerFn>,

    writebuf: Vec<u8>,

    state: ConnState,
    close_reason: Option<CloseReason>,

    log_fn: fn(Severity, &str),
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        stream: TcpStream,
        peer: String,
        now: Instant,
        readbuf_size: usize,
        argc_max: usize,
        lineterm: LineTerm,
        tokenizer: Option<TokenizerFn>,
        client_timeout: Option<Duration>,
    ) -> Connection {
        Connection {
            id,
            stream,
            peer,
            connected_at: now,
            last_activity_at: now,
            client_timeout,
            readbuf: vec![0u8; readbuf_size],
            readbuf_size,
            buflen: 0,
            overflow: false,
            argc_max,
            lineterm,
            tokenizer,
            writebuf: Vec::with_capacity(1024),
            state: ConnState::Default,
            close_reason: None,
            log_fn: logger_default,
        }
    }

    /// Connection id, assigned once at accept time and never reused.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `[host]:port` of the peer, resolved numerically at accept time.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn time_connected(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.connected_at)
    }

    pub fn time_idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_at)
    }

    pub fn client_timeout(&self) -> Option<Duration> {
        self.client_timeout
    }

    /// Sets the idle timeout; `None` or a zero duration disables it.
    pub fn set_client_timeout(&mut self, timeout: Option<Duration>) {
        self.client_timeout = match timeout {
            Some(d) if d.is_zero() => None,
            other => other,
        };
    }

    /// Installs a different tokenizer (or `None` for raw-line mode),
    /// returning whichever was in effect before.
    pub fn set_tokenizer(&mut self, tokenizer: Option<TokenizerFn>) -> Option<TokenizerFn> {
        std::mem::replace(&mut self.tokenizer, tokenizer)
    }

    pub fn lineterm(&self) -> LineTerm {
        self.lineterm
    }

    pub fn set_lineterm(&mut self, lineterm: LineTerm) {
        self.lineterm = lineterm;
    }

    /// Replaces the log sink used by [`Connection::log`] and the
    /// library's own internal diagnostics for this connection.
    pub fn set_log_fn(&mut self, log_fn: fn(Severity, &str)) {
        self.log_fn = log_fn;
    }

    #[cfg(unix)]
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub(crate) fn raw_stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Logs a message prefixed with this connection's id, e.g. `#7 client
    /// said something odd`.
    pub fn log(&self, severity: Severity, message: &str) {
        (self.log_fn)(severity, &format!("#{} {}", self.id, message));
    }

    fn vlog(&self, severity: Severity, args: Arguments<'_>) {
        self.log(severity, &args.to_string());
    }

    /// Builds the log-safe, quoted representation of a dispatched
    /// command's arguments, e.g. `value set "answer" "42"`.
    pub fn command_string(argv: &[String]) -> String {
        argv.iter()
            .map(|tok| format!("\"{}\"", formatters::logsafe_str(tok.as_bytes())))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Requests that this connection be closed.
    ///
    /// If called while a command handler is running on this connection
    /// (i.e. from inside that very handler), the close is deferred: the
    /// reason is recorded and the reader finalizes the close once the
    /// handler returns, since the handler still holds a borrow into this
    /// connection that must not be invalidated out from under it. If
    /// called from anywhere else, the caller (the server) must finalize
    /// the close immediately -- this returns `true` in that case.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        let reason = reason.normalize();
        self.close_reason = Some(reason);
        self.state != ConnState::Handled
    }

    /// The reason this connection was closed, or is in the process of
    /// being closed, if any. Meant to be read from a close handler.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    fn eol(&self) -> &'static [u8] {
        match self.lineterm {
            LineTerm::Lf => b"\n",
            LineTerm::CrLf | LineTerm::CrLfOrLf => b"\r\n",
        }
    }

    /// Sends a three-digit status code followed by a message, e.g. `200
    /// ok`. Codes outside `100..=999` are clamped to `500`.
    pub fn send_status(&mut self, status: u16, message: &str) {
        let status = if (100..=999).contains(&status) { status } else { 500 };
        self.writebuf.clear();
        let _ = write!(self.writebuf, "{:03} {}", status, message);
        self.writebuf.extend_from_slice(self.eol());
        self.flush_writebuf();
    }

    /// Writes `message` verbatim, without a trailing line terminator.
    pub fn print(&mut self, message: &str) {
        self.writebuf.clear();
        self.writebuf.extend_from_slice(message.as_bytes());
        self.flush_writebuf();
    }

    /// Writes `message` followed by the configured line terminator.
    pub fn println(&mut self, message: &str) {
        self.writebuf.clear();
        self.writebuf.extend_from_slice(message.as_bytes());
        self.writebuf.extend_from_slice(self.eol());
        self.flush_writebuf();
    }

    /// Writes formatted text, without a trailing line terminator. The
    /// idiomatic Rust replacement for the original's pair of `printf` /
    /// `vprintf` helpers -- `std::fmt::Arguments` already carries the
    /// format-and-args pairing a C varargs call would have needed.
    pub fn write_fmt_unterminated(&mut self, args: Arguments<'_>) {
        self.writebuf.clear();
        let _ = self.writebuf.write_fmt(args);
        self.flush_writebuf();
    }

    /// Sends raw bytes exactly as given, bypassing formatting entirely.
    pub fn send(&mut self, data: &[u8]) {
        let _ = Self::best_effort_write(&mut self.stream, data);
    }

    fn flush_writebuf(&mut self) {
        let _ = Self::best_effort_write(&mut self.stream, &self.writebuf);
    }

    /// A single non-blocking write attempt. Short writes and `WouldBlock`
    /// are silently accepted: this library doesn't queue or retry egress,
    /// matching its explicit non-goal of not implementing write-side
    /// back-pressure beyond the fixed read buffer.
    fn best_effort_write(stream: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
        #[cfg(all(test, unix))]
        {
            use std::os::unix::io::AsRawFd;
            if let Some(err) = crate::sys::intercept(stream.as_raw_fd(), crate::sys::Op::Send) {
                return Err(err);
            }
        }

        match sigsafe_send(stream, data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Drains one readiness-triggered read, dispatching every complete
    /// line found to `dispatch`, and reports whether the connection must
    /// now be closed.
    pub(crate) fn read(&mut self, mut dispatch: impl FnMut(&mut Connection, &[String])) -> ReadOutcome {
        let free = self.readbuf_size - self.buflen;
        if free == 0 {
            // Shouldn't happen: the overflow branch below always resets
            // buflen before the next read gets a chance to run.
            self.overflow = true;
            self.buflen = 0;
            return ReadOutcome::Continue;
        }

        #[cfg(all(test, unix))]
        let forced_fault = crate::sys::intercept(self.stream.as_raw_fd(), crate::sys::Op::Recv);
        #[cfg(not(all(test, unix)))]
        let forced_fault: Option<io::Error> = None;

        let read_result = match forced_fault {
            Some(err) => Err(err),
            None => {
                let dst = &mut self.readbuf[self.buflen..self.buflen + free];
                self.stream.read(dst)
            }
        };

        match read_result {
            Ok(0) => {
                self.log(Severity::Info, "client disconnect");
                self.close(CloseReason::ClientDisconnect);
                return ReadOutcome::Close(CloseReason::ClientDisconnect);
            }
            Ok(n) => {
                self.last_activity_at = Instant::now();
                self.buflen += n;
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return ReadOutcome::Continue;
            }
            Err(e) => {
                self.log(Severity::Err, &format!("recv error: {}", e));
                self.close(CloseReason::ClientReceiveError);
                return ReadOutcome::Close(CloseReason::ClientReceiveError);
            }
        }

        loop {
            match self.find_terminator() {
                Some((line_end, consumed)) => {
                    if self.overflow {
                        self.overflow = false;
                        self.send_status(400, "Command too long");
                    } else {
                        let line = String::from_utf8_lossy(&self.readbuf[..line_end]).into_owned();
                        self.state = ConnState::Handled;
                        self.handle_line(&line, &mut dispatch);
                        self.state = ConnState::Default;

                        if let Some(reason) = self.close_reason {
                            return ReadOutcome::Close(reason);
                        }
                    }

                    self.readbuf.copy_within(consumed..self.buflen, 0);
                    self.buflen -= consumed;
                }
                None => {
                    if self.buflen == self.readbuf_size {
                        self.overflow = true;
                        self.buflen = 0;
                        self.log(Severity::Warning, "command too long");
                    }
                    break;
                }
            }
        }

        ReadOutcome::Continue
    }

    /// Looks for a line terminator in `readbuf[..buflen]`. Returns the
    /// index where the line's content ends (terminator stripped, and for
    /// CRLF-flavored modes the trailing `\r` stripped too) along with how
    /// many bytes of the raw buffer the line plus its terminator consumed.
    fn find_terminator(&self) -> Option<(usize, usize)> {
        let buf = &self.readbuf[..self.buflen];

        for i in 0..buf.len() {
            let hit = match self.lineterm {
                LineTerm::Lf => buf[i] == b'\n',
                LineTerm::CrLf => buf[i] == b'\n' && i > 0 && buf[i - 1] == b'\r',
                LineTerm::CrLfOrLf => buf[i] == b'\n',
            };

            if hit {
                let strip_cr = i > 0 && buf[i - 1] == b'\r';
                let line_end = if strip_cr { i - 1 } else { i };
                return Some((line_end, i + 1));
            }
        }

        None
    }

    fn handle_line(&mut self, line: &str, dispatch: &mut impl FnMut(&mut Connection, &[String])) {
        match self.tokenizer {
            None => {
                let argv = vec![line.to_string()];
                dispatch(self, &argv);
            }
            Some(tokenize) => match tokenize(line, self.argc_max) {
                Ok(argv) => dispatch(self, &argv),
                Err(_) => {
                    self.log(Severity::Warning, "too many arguments");
                    self.send_status(400, "Too many arguments");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_terminator_lf() {
        let mut conn = test_connection(LineTerm::Lf);
        conn.readbuf[..6].copy_from_slice(b"abc\r\nx");
        conn.buflen = 6;
        assert_eq!(conn.find_terminator(), Some((3, 5)));
    }

    #[test]
    fn find_terminator_crlf_requires_cr() {
        let mut conn = test_connection(LineTerm::CrLf);
        conn.readbuf[..4].copy_from_slice(b"abc\n");
        conn.buflen = 4;
        assert_eq!(conn.find_terminator(), None);
    }

    #[test]
    fn find_terminator_crlf_or_lf_accepts_bare_lf() {
        let mut conn = test_connection(LineTerm::CrLfOrLf);
        conn.readbuf[..4].copy_from_slice(b"abc\n");
        conn.buflen = 4;
        assert_eq!(conn.find_terminator(), Some((3, 4)));
    }

    #[test]
    fn close_outside_handler_requests_immediate_finalize() {
        let mut conn = test_connection(LineTerm::Lf);
        assert!(conn.close(CloseReason::ApplicationClose));
    }

    #[test]
    fn close_inside_handler_is_deferred() {
        let mut conn = test_connection(LineTerm::Lf);
        conn.state = ConnState::Handled;
        assert!(!conn.close(CloseReason::ApplicationClose));
        assert_eq!(conn.close_reason, Some(CloseReason::ApplicationClose));
    }

    #[test]
    fn command_string_quotes_and_escapes() {
        let argv = vec!["value".to_string(), "set \"x\"".to_string()];
        assert_eq!(Connection::command_string(&argv), "\"value\" \"set \\\"x\\\"\"");
    }

    #[cfg(unix)]
    #[test]
    fn forced_recv_error_closes_with_client_receive_error() {
        let mut conn = test_connection(LineTerm::Lf);
        crate::sys::arm(conn.fd(), crate::sys::Op::Recv, io::ErrorKind::ConnectionReset);

        let outcome = conn.read(|_, _| panic!("dispatch shouldn't run on a failed recv"));
        assert!(matches!(outcome, ReadOutcome::Close(CloseReason::ClientReceiveError)));
        assert_eq!(conn.close_reason(), Some(CloseReason::ClientReceiveError));
    }

    #[cfg(unix)]
    #[test]
    fn forced_send_error_is_swallowed_by_best_effort_write() {
        let mut conn = test_connection(LineTerm::Lf);
        crate::sys::arm(conn.fd(), crate::sys::Op::Send, io::ErrorKind::BrokenPipe);

        // best-effort sends never propagate a failure to the caller, so this
        // just has to not panic.
        conn.send_status(200, "ok");
    }

    fn test_connection(lineterm: LineTerm) -> Connection {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        drop(client);
        Connection::new(
            1,
            TcpStream::from_stream(stream).unwrap(),
            "[127.0.0.1]:0".to_string(),
            Instant::now(),
            16,
            8,
            lineterm,
            Some(tokenizer::tokenize),
            None,
        )
    }
}
