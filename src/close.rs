//! Reasons a connection can be closed.

/// Why a [`crate::Connection`] was closed.
///
/// The well-known reasons carry fixed numeric values so application logs
/// and the `server status` report stay meaningful across versions.
/// Applications may signal their own reasons through [`CloseReason::Other`]
/// for anything not covered here; values 2..489 and 493..589 and 592.. are
/// free for that use, though the crate itself never inspects them.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CloseReason {
    /// Sentinel meaning "no close in progress". Never observed by a
    /// `close_handler`; passing it to [`crate::Connection::close`] is
    /// normalized to [`CloseReason::ApplicationClose`].
    NoClose,
    /// The application called `close()` for its own reasons.
    ApplicationClose,
    /// The peer closed its side of the connection (`recv` returned 0).
    ClientDisconnect,
    /// A `recv` call failed with something other than a transient error.
    ClientReceiveError,
    /// The connection's idle timeout elapsed.
    ClientTimeout,
    /// The server is shutting down.
    ServerShutdown,
    /// The connection was rejected because the server had no free slot.
    ServerTooManyConnections,
    /// Anything else, defined by the embedding application.
    Other(u32),
}

impl CloseReason {
    pub fn code(self) -> u32 {
        match self {
            CloseReason::NoClose => 0,
            CloseReason::ApplicationClose => 1,
            CloseReason::ClientDisconnect => 490,
            CloseReason::ClientReceiveError => 491,
            CloseReason::ClientTimeout => 492,
            CloseReason::ServerShutdown => 590,
            CloseReason::ServerTooManyConnections => 591,
            CloseReason::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> CloseReason {
        match code {
            0 => CloseReason::NoClose,
            1 => CloseReason::ApplicationClose,
            490 => CloseReason::ClientDisconnect,
            491 => CloseReason::ClientReceiveError,
            492 => CloseReason::ClientTimeout,
            590 => CloseReason::ServerShutdown,
            591 => CloseReason::ServerTooManyConnections,
            other => CloseReason::Other(other),
        }
    }

    /// Normalizes the sentinel `NoClose` to `ApplicationClose`, matching the
    /// original contract that calling `close()` always produces a non-zero
    /// reason visible to the close handler.
    pub(crate) fn normalize(self) -> CloseReason {
        match self {
            CloseReason::NoClose => CloseReason::ApplicationClose,
            other => other,
        }
    }
}
