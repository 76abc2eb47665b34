//! Configuration records for [`crate::Server`] and [`crate::Connection`].
//!
//! Both configs are plain value records with a `Default` impl providing
//! the library's out-of-the-box behavior; an application is expected to
//! start from `Default::default()` and override only the fields it cares
//! about.

use crate::close::CloseReason;
use crate::connection::{Connection, LineTerm};
use crate::tokenizer;
use std::time::Duration;

/// Invoked once per accepted connection, before it is registered for
/// I/O. `reason` is [`CloseReason::ServerTooManyConnections`] when the
/// server has no free slot for this connection -- the handler gets a
/// chance to write a rejection banner before the connection is closed --
/// and [`CloseReason::NoClose`] otherwise.
pub type OpenHandler = Box<dyn FnMut(&mut Connection, CloseReason)>;
/// Invoked exactly once per connection that was ever handed to
/// `OpenHandler`, including ones rejected for too many connections.
/// Call `Connection::close_reason` to find out why.
pub type CloseHandler = Box<dyn FnMut(&mut Connection)>;
/// Invoked once per dispatched command line.
pub type CmdHandler = Box<dyn FnMut(&mut Connection, &[String])>;
pub type TokenizerFn = fn(&str, usize) -> Result<Vec<String>, tokenizer::TooManyTokens>;

/// Server-wide configuration.
pub struct ServerConfig {
    /// TCP port the listener binds to, on the IPv6 wildcard address.
    pub port: u16,
    /// Maximum number of simultaneously open connections.
    pub connections_max: usize,
    /// Backlog passed to `listen()`.
    pub connections_backlog: i32,
    /// Per-connection configuration template applied to every accepted
    /// connection.
    pub connection_config: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 50000,
            connections_max: 16,
            connections_backlog: 8,
            connection_config: ConnectionConfig::default(),
        }
    }
}

/// Per-connection configuration, copied into each [`Connection`] at
/// accept time.
pub struct ConnectionConfig {
    /// Capacity of the fixed-size read (framing) buffer, in bytes.
    pub readbuf_size: usize,
    /// Maximum number of tokens a dispatched line may be split into.
    pub argc_max: usize,
    /// Line terminator recognized when scanning the read buffer.
    pub lineterm: LineTerm,
    /// Tokenizer applied to each line before dispatch. `None` disables
    /// tokenization: the whole line is delivered as a single argument.
    pub tokenizer: Option<TokenizerFn>,
    /// Idle timeout; `None` (or a zero duration) disables enforcement.
    pub client_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            readbuf_size: 1024,
            argc_max: 8,
            lineterm: LineTerm::CrLfOrLf,
            tokenizer: Some(tokenizer::tokenize),
            client_timeout: None,
        }
    }
}
