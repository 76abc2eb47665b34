//! An embeddable, single-threaded, non-blocking line command server over
//! TCP.
//!
//! An application builds a [`config::ServerConfig`], starts a
//! [`Server`], registers its command/open/close handlers, and then
//! repeatedly calls [`Server::tick`] from its own event loop. Each
//! accepted connection is a [`Connection`]: a fixed-size read buffer
//! framed on a configurable line terminator, a shell-like
//! [`tokenizer`], and a deferred-close protocol so a handler can close
//! its own connection mid-dispatch without the reader's borrow into it
//! being invalidated.
//!
//! This crate does not implement TLS, HTTP, authentication, persistence,
//! multi-threading, non-TCP transports, or egress back-pressure beyond
//! the fixed read buffer -- see `DESIGN.md` for the reasoning.

pub mod close;
pub mod config;
pub mod connection;
pub mod fmt;
pub mod server;
pub mod severity;
#[cfg(test)]
pub(crate) mod sys;
pub mod tokenizer;

pub use close::CloseReason;
pub use config::{ConnectionConfig, ServerConfig};
pub use connection::{Connection, LineTerm};
pub use server::Server;
pub use severity::Severity;
