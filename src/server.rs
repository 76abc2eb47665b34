//! The connection multiplexer: accept, slot table, tick loop, status
//! report, shutdown.

use crate::close::CloseReason;
use crate::config::{CloseHandler, CmdHandler, ConnectionConfig, OpenHandler, ServerConfig};
use crate::connection::{Connection, ReadOutcome};
use crate::fmt::duration_str_from;
use crate::severity::{logger_default, Severity};
use mio::net::TcpListener;
use mio::{Event, Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: Token = Token(0);

fn slot_token(slot: usize) -> Token {
    Token(slot + 1)
}

fn token_slot(token: Token) -> usize {
    token.0 - 1
}

/// The command server itself: a listening socket plus a fixed-capacity
/// table of connection slots, driven one readiness wait at a time by
/// [`Server::tick`].
pub struct Server {
    listener: TcpListener,
    poll: Poll,
    events: Events,

    slots: Vec<Option<Connection>>,
    free: Vec<usize>,
    conns: u64,

    connection_config: ConnectionConfig,
    started_at: Instant,

    cmd_handler: Option<CmdHandler>,
    open_handler: Option<OpenHandler>,
    close_handler: Option<CloseHandler>,

    log_fn: fn(Severity, &str),
}

impl Server {
    /// Binds the listener on the IPv6 wildcard address and starts
    /// accepting connections on the next call to [`Server::tick`].
    pub fn start(config: ServerConfig) -> io::Result<Server> {
        let addr: SocketAddr = format!("[::]:{}", config.port)
            .parse()
            .expect("constructed address is always valid");

        let listener = bind_listener(addr, config.connections_backlog)?;

        let poll = Poll::new()?;
        // Level-triggered: a connection with unread data keeps reporting
        // readable every tick until it's drained, matching `select()`'s
        // behavior in the reference implementation this is modeled on.
        // One accept/read call is made per readiness per tick either way
        // (see `accept_one`/`Connection::read`), so a burst just spreads
        // itself over however many ticks it takes instead of needing a
        // drain-to-`WouldBlock` loop.
        poll.register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::level())?;

        let mut slots = Vec::with_capacity(config.connections_max);
        slots.resize_with(config.connections_max, || None);

        Ok(Server {
            listener,
            poll,
            events: Events::with_capacity(config.connections_max + 1),
            slots,
            free: (0..config.connections_max).rev().collect(),
            conns: 0,
            connection_config: config.connection_config,
            started_at: Instant::now(),
            cmd_handler: None,
            open_handler: None,
            close_handler: None,
            log_fn: logger_default,
        })
    }

    pub fn set_cmd_handler(&mut self, handler: CmdHandler) {
        self.cmd_handler = Some(handler);
    }

    pub fn set_open_handler(&mut self, handler: OpenHandler) {
        self.open_handler = Some(handler);
    }

    pub fn set_close_handler(&mut self, handler: CloseHandler) {
        self.close_handler = Some(handler);
    }

    pub fn set_log_fn(&mut self, log_fn: fn(Severity, &str)) {
        self.log_fn = log_fn;
    }

    /// The listener's bound address, useful when `ServerConfig::port` was
    /// `0` and the OS picked an ephemeral port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn log(&self, severity: Severity, message: &str) {
        (self.log_fn)(severity, message);
    }

    /// Runs one iteration: closes any connection that has exceeded its
    /// idle timeout, waits for readiness for at most `timeout`, then
    /// drains every ready event (new connections, then readable/writable
    /// existing connections) exactly once.
    ///
    /// `timeout` is never mutated here even though `mio`'s wait can
    /// return early for reasons other than a ready fd; unlike the
    /// `select()`-based original there's no risk of a caller-visible
    /// struct being clobbered by the call, since `Duration` is passed by
    /// value.
    pub fn tick(&mut self, timeout: Duration) -> io::Result<()> {
        self.enforce_timeouts();

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.log(Severity::Debug, "poll() interrupted by signal");
                return Ok(());
            }
            Err(e) => {
                self.log(Severity::Err, &format!("poll() error: {}", e));
                return Ok(());
            }
        }

        let events: Vec<Event> = self.events.iter().collect();
        for event in events {
            if event.token() == LISTENER_TOKEN {
                self.accept_one();
            } else {
                self.service(token_slot(event.token()));
            }
        }

        Ok(())
    }

    fn enforce_timeouts(&mut self) {
        let now = Instant::now();
        for slot in 0..self.slots.len() {
            let exceeded = match &self.slots[slot] {
                Some(conn) => match conn.client_timeout() {
                    Some(timeout) => conn.time_idle(now) >= timeout,
                    None => false,
                },
                None => false,
            };

            if exceeded {
                self.finalize_close(slot, CloseReason::ClientTimeout);
            }
        }
    }

    /// Accepts at most one connection per call, matching the reference
    /// implementation's one-`accept()`-per-readiness contract: if several
    /// connections are queued up, level-triggered readiness just has this
    /// fire again next tick rather than this draining the whole backlog
    /// in one go.
    fn accept_one(&mut self) {
        #[cfg(all(test, unix))]
        {
            use std::os::unix::io::AsRawFd;
            if let Some(err) = crate::sys::intercept(self.listener.as_raw_fd(), crate::sys::Op::Accept) {
                self.log(Severity::Err, &format!("accept() error: {}", err));
                return;
            }
        }

        let (stream, peer_addr) = loop {
            match self.listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.log(Severity::Err, &format!("accept() error: {}", e));
                    return;
                }
            }
        };

        if let Err(e) = set_nosigpipe(&stream) {
            self.log(Severity::Warning, &format!("SO_NOSIGPIPE setup failed: {}", e));
        }

        self.conns += 1;
        let id = self.conns;

        let peer = peer_addr
            .map(|a| format!("[{}]:{}", a.ip(), a.port()))
            .unwrap_or_else(|_| "[?]:?".to_string());

        let slot = self.free.pop();
        let reason = if slot.is_none() {
            CloseReason::ServerTooManyConnections
        } else {
            CloseReason::NoClose
        };

        let cfg = &self.connection_config;
        let mut conn = Connection::new(
            id,
            stream,
            peer.clone(),
            Instant::now(),
            cfg.readbuf_size,
            cfg.argc_max,
            cfg.lineterm,
            cfg.tokenizer,
            cfg.client_timeout,
        );

        self.log(Severity::Info, &format!("#{} connected from {}", id, peer));

        if let Some(handler) = self.open_handler.as_mut() {
            handler(&mut conn, reason);
        }

        match slot {
            Some(slot) => {
                if let Err(e) =
                    self.poll
                        .register(&conn_stream(&conn), slot_token(slot), Ready::readable(), PollOpt::level())
                {
                    self.log(Severity::Err, &format!("register() error: {}", e));
                    self.free.push(slot);
                    self.run_close_handler(&mut conn);
                    return;
                }
                self.slots[slot] = Some(conn);
            }
            None => {
                self.log(
                    Severity::Warning,
                    &format!("too many connections, turning #{} away", id),
                );
                conn.close(CloseReason::ServerTooManyConnections);
                self.run_close_handler(&mut conn);
            }
        }
    }

    fn service(&mut self, slot: usize) {
        let outcome = match self.slots[slot].as_mut() {
            Some(conn) => {
                let cmd_handler = &mut self.cmd_handler;
                conn.read(move |conn, argv| {
                    if let Some(handler) = cmd_handler.as_mut() {
                        handler(conn, argv);
                    }
                })
            }
            None => return,
        };

        if let ReadOutcome::Close(reason) = outcome {
            self.finalize_close(slot, reason);
        }
    }

    fn finalize_close(&mut self, slot: usize, reason: CloseReason) {
        if let Some(mut conn) = self.slots[slot].take() {
            let _ = self.poll.deregister(&conn_stream(&conn));
            conn.close(reason);
            self.log(Severity::Info, &format!("#{} closing", conn.id()));
            self.run_close_handler(&mut conn);
            self.free.push(slot);
        }
    }

    fn run_close_handler(&mut self, conn: &mut Connection) {
        if let Some(handler) = self.close_handler.as_mut() {
            handler(conn);
        }
    }

    /// Total connections accepted since start, including any rejected
    /// for lack of a free slot.
    pub fn connections_handled(&self) -> u64 {
        self.conns
    }

    /// Human-readable, not machine-parsed, multi-line status report.
    /// `mark` (if given) prefixes that connection's row with `*`.
    pub fn status(&self, mark: Option<u64>) -> String {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.started_at);
        let elapsed_secs = elapsed.as_secs().max(1);
        let rate = self.conns as f64 / elapsed_secs as f64;

        let mut out = String::new();
        let banner = "=".repeat(60);
        out.push_str(&banner);
        out.push('\n');
        out.push_str("SERVER STATUS\n");
        out.push_str(&banner);
        out.push('\n');
        out.push_str(&format!("server uptime: {}\n", duration_str_from(elapsed)));
        out.push_str(&format!("connections handled: {}\n", self.conns));
        out.push_str(&format!("connections/sec: {:.2}\n", rate));
        out.push('\n');
        out.push_str(&format!(
            "{:>4} {:<10} {:<5} {:>13} {:>13} client\n",
            "slot", "connection", "fd", "connected", "idle"
        ));
        out.push_str(&"=".repeat(60));
        out.push('\n');

        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(conn) = slot {
                let marker = if mark == Some(conn.id()) { "*" } else { " " };
                #[cfg(unix)]
                let fd = conn.fd();
                #[cfg(not(unix))]
                let fd = -1;
                out.push_str(&format!(
                    "{}{:>3} #{:<9} #{:<4} {:>13} {:>13} {}\n",
                    marker,
                    i + 1,
                    conn.id(),
                    fd,
                    duration_str_from(conn.time_connected(now)),
                    duration_str_from(conn.time_idle(now)),
                    conn.peer(),
                ));
            }
        }

        out
    }

    /// Closes every occupied slot with [`CloseReason::ServerShutdown`]
    /// and consumes the server. There's no way to call this twice: `self`
    /// is gone once it returns.
    pub fn shutdown(mut self) {
        self.log(Severity::Info, "server shutdown initiated");

        for slot in 0..self.slots.len() {
            if self.slots[slot].is_some() {
                self.finalize_close(slot, CloseReason::ServerShutdown);
            }
        }

        self.log(Severity::Info, "server shutdown reached");
    }
}

fn conn_stream(conn: &Connection) -> &mio::net::TcpStream {
    conn.raw_stream()
}

/// Binds the IPv6 wildcard address with `SO_REUSEADDR` and the
/// configured backlog, then hands the resulting socket to mio.
///
/// `std::net::TcpListener::bind` has no way to set the listen backlog,
/// so this goes through `socket2`, the usual escape hatch for socket
/// options std doesn't expose.
fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Sets `SO_NOSIGPIPE` once per accepted connection on Apple targets,
/// which have no `MSG_NOSIGNAL` send flag. Mirrors the original's
/// `SETSOCKOPT_NOSIGPIPE_UNLESS_MSG_NOSIGNAL` macro: platforms with
/// `MSG_NOSIGNAL` (handled per-send in `connection::sigsafe_send`) don't
/// need this at all, so it's a no-op there.
#[cfg(target_vendor = "apple")]
fn set_nosigpipe(stream: &mio::net::TcpStream) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &optval as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(target_vendor = "apple"))]
fn set_nosigpipe(_stream: &mio::net::TcpStream) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn start_binds_and_status_reports_zero_connections() {
        let mut config = ServerConfig::default();
        config.port = 0; // let the OS pick an ephemeral port
        config.connections_max = 4;

        let server = Server::start(config).expect("server should bind");

        assert_eq!(server.connections_handled(), 0);
        assert!(server.status(None).contains("SERVER STATUS"));
        assert!(server.local_addr().unwrap().port() > 0);
    }

    #[cfg(unix)]
    #[test]
    fn forced_accept_error_is_logged_and_handled_gracefully() {
        use std::os::unix::io::AsRawFd;

        let mut config = ServerConfig::default();
        config.port = 0;
        let mut server = Server::start(config).expect("server should bind");

        crate::sys::arm(server.listener.as_raw_fd(), crate::sys::Op::Accept, io::ErrorKind::Other);

        server.accept_one();
        assert_eq!(server.connections_handled(), 0);
    }

    #[test]
    fn token_slot_roundtrip() {
        for slot in 0..10 {
            assert_eq!(token_slot(slot_token(slot)), slot);
        }
    }
}
