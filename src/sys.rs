#![cfg(unix)]
//! Test-only fault injection.
//!
//! The reference implementation intercepts libc syscalls (`accept`,
//! `recv`, `send`) at link time and redirects them through a programmable
//! failure table, so its test suite can exercise every error branch
//! without needing a real flaky network. Rust has no portable equivalent
//! of link-time interposition, but the same idea works at the file
//! descriptor level: arm a `(fd, op)` pair with a failure, and the one
//! call site in `Connection`/`Server` that would otherwise touch that fd
//! checks this table first and returns the armed error instead.
//!
//! Not part of the public API; `lib.rs` only compiles this module under
//! `#[cfg(test)]`, and everything in it is itself gated on `unix` since
//! there's no portable `RawFd` to key the table on otherwise.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;

/// Which syscall a forced failure applies to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) enum Op {
    Accept,
    Recv,
    Send,
}

thread_local! {
    static FAULTS: RefCell<HashMap<(RawFd, Op), VecDeque<io::ErrorKind>>> = RefCell::new(HashMap::new());
}

/// Arms `fd` so its next `op` call fails with `kind` instead of reaching
/// the real socket. Calling this more than once for the same `(fd, op)`
/// queues further failures for subsequent calls.
pub(crate) fn arm(fd: RawFd, op: Op, kind: io::ErrorKind) {
    FAULTS.with(|f| f.borrow_mut().entry((fd, op)).or_insert_with(VecDeque::new).push_back(kind));
}

/// Pops and returns the next armed failure for `(fd, op)`, if any.
pub(crate) fn intercept(fd: RawFd, op: Op) -> Option<io::Error> {
    FAULTS
        .with(|f| f.borrow_mut().get_mut(&(fd, op)).and_then(VecDeque::pop_front))
        .map(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_fault_is_returned_once() {
        let fd: RawFd = 999;
        arm(fd, Op::Recv, io::ErrorKind::ConnectionReset);

        let err = intercept(fd, Op::Recv).expect("should be armed");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        assert!(intercept(fd, Op::Recv).is_none());
    }

    #[test]
    fn faults_are_scoped_per_fd_and_op() {
        arm(1001, Op::Send, io::ErrorKind::BrokenPipe);

        assert!(intercept(1002, Op::Send).is_none());
        assert!(intercept(1001, Op::Recv).is_none());
        assert!(intercept(1001, Op::Send).is_some());
    }
}
