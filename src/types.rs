//! Core type definitions for reglock.
//!
//! This module contains the fundamental data types shared by the lock table
//! engine, the registry, and the descriptor layer.
//!
//! # Key Types
//!
//! - [`Owner`]: one holder of a lock record, a `(pid, fd)` pair
//! - [`LockMode`]: shared (read) or exclusive (write) locking
//! - [`LockRequest`]: a byte-range request mirroring `struct flock`
//! - [`LockCommand`]: `F_SETLK` / `F_SETLKW` style command selection
//! - [`LockOutcome`]: granted, or blocked by a live owner
//!
//! # Capacities
//!
//! The lock table lives in a flat shared-memory blob with no allocator, so
//! every collection is a fixed-capacity array whose size must be identical
//! in every process mapping the registry. The capacities are therefore
//! compile-time constants, not configuration:
//!
//! - [`MAX_OWNERS`] owners per lock record
//! - [`MAX_RECORDS`] lock records per registry
//! - [`MAX_OPEN_FILES`] registry-mapped files per process
//!
//! # Examples
//!
//! ```rust
//! use reglock::types::{LockRequest, Whence};
//!
//! // Exclusive lock on the first 10 bytes of the file.
//! let req = LockRequest::exclusive(0, 10);
//! assert_eq!(req.whence, Whence::Start);
//!
//! // Shared lock from offset 100 to end of file (len 0 = unbounded).
//! let req = LockRequest::shared(100, 0);
//! assert!(req.is_unbounded());
//! ```

use std::fmt;
use std::time::Duration;

use libc::{c_int, off_t, pid_t};

/// Maximum number of owners per lock record.
pub const MAX_OWNERS: usize = 32;

/// Maximum number of lock records per registry.
pub const MAX_RECORDS: usize = 32;

/// Maximum number of registry-mapped files per process.
pub const MAX_OPEN_FILES: usize = 256;

/// Sentinel descriptor value marking a free owner slot.
pub(crate) const FREE_OWNER: c_int = -1;

/// Sentinel starting offset marking a free lock record slot.
pub(crate) const FREE_RECORD: off_t = -2;

/// One holder of a lock record: the process that acquired it and the
/// descriptor number it used.
///
/// A process holding the same file under several descriptors (after `dup`)
/// is several distinct owners. Two owners are equal iff both fields match.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Owner {
    /// Process that holds the lock.
    pub pid: pid_t,
    /// Descriptor number the lock was acquired through.
    pub fd: c_int,
}

impl Owner {
    /// The distinguished "free slot" owner value.
    pub(crate) const FREE: Owner = Owner {
        pid: FREE_OWNER as pid_t,
        fd: FREE_OWNER,
    };

    /// Create an owner from explicit parts.
    pub fn new(pid: pid_t, fd: c_int) -> Self {
        Self { pid, fd }
    }

    /// The calling process's owner identity for `fd`.
    pub fn current(fd: c_int) -> Self {
        // SAFETY: getpid never fails.
        Self {
            pid: unsafe { libc::getpid() },
            fd,
        }
    }

    /// Whether this slot holds no owner.
    pub(crate) fn is_free(&self) -> bool {
        self.fd == FREE_OWNER
    }

    /// Mark the slot free.
    pub(crate) fn erase(&mut self) {
        *self = Owner::FREE;
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.fd)
    }
}

/// Lock mode.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock (multiple readers).
    Shared = 0,
    /// Exclusive lock (single writer).
    Exclusive = 1,
}

impl LockMode {
    /// Whether two overlapping locks of these modes held by different
    /// owners conflict: exclusive conflicts with everything, shared only
    /// with exclusive.
    pub fn conflicts_with(self, other: LockMode) -> bool {
        self == LockMode::Exclusive || other == LockMode::Exclusive
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Interpretation of [`LockRequest::start`], mirroring `l_whence`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    /// Relative to the start of the file (`SEEK_SET`).
    Start,
    /// Relative to the current file position (`SEEK_CUR`).
    Current,
    /// Relative to the end of the file (`SEEK_END`).
    End,
}

/// What a lock request asks for: a lock of some mode, or an unlock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Place a shared lock (`F_RDLCK`).
    Shared,
    /// Place an exclusive lock (`F_WRLCK`).
    Exclusive,
    /// Release locks over the range (`F_UNLCK`).
    Unlock,
}

impl RequestKind {
    /// The lock mode this request places, if it places one.
    pub fn mode(self) -> Option<LockMode> {
        match self {
            RequestKind::Shared => Some(LockMode::Shared),
            RequestKind::Exclusive => Some(LockMode::Exclusive),
            RequestKind::Unlock => None,
        }
    }
}

/// A byte-range lock request, mirroring `struct flock`.
///
/// `len == 0` is the POSIX sentinel for "from `start` to end of file,
/// growing implicitly as the file grows".
#[derive(Clone, Copy, Debug)]
pub struct LockRequest {
    /// What to do over the range.
    pub kind: RequestKind,
    /// How to interpret `start`.
    pub whence: Whence,
    /// Range start, relative to `whence`. May be negative for
    /// `Current`/`End` as long as the resolved offset is non-negative.
    pub start: off_t,
    /// Range length; 0 means "to end of file".
    pub len: off_t,
}

impl LockRequest {
    /// Shared lock on `[start, start + len)` from the start of the file.
    pub fn shared(start: off_t, len: off_t) -> Self {
        Self {
            kind: RequestKind::Shared,
            whence: Whence::Start,
            start,
            len,
        }
    }

    /// Exclusive lock on `[start, start + len)` from the start of the file.
    pub fn exclusive(start: off_t, len: off_t) -> Self {
        Self {
            kind: RequestKind::Exclusive,
            whence: Whence::Start,
            start,
            len,
        }
    }

    /// Unlock `[start, start + len)` from the start of the file.
    pub fn unlock(start: off_t, len: off_t) -> Self {
        Self {
            kind: RequestKind::Unlock,
            whence: Whence::Start,
            start,
            len,
        }
    }

    /// Reinterpret `start` relative to a different origin.
    pub fn with_whence(mut self, whence: Whence) -> Self {
        self.whence = whence;
        self
    }

    /// Whether the range extends to end of file.
    pub fn is_unbounded(&self) -> bool {
        self.len == 0
    }
}

/// Lock command selection, mirroring the `fcntl` command space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockCommand {
    /// Try to set the lock; never wait (`F_SETLK`).
    TrySet,
    /// Set the lock, waiting for conflicting locks to go away
    /// (`F_SETLKW`). `deadline` bounds the wait; `None` waits until the
    /// range becomes available.
    SetWait {
        /// Give up after this long, reporting `WouldBlock`.
        deadline: Option<Duration>,
    },
}

/// Result of a lock operation that completed without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The request was applied to the table.
    Granted,
    /// A conflicting record is held by a live owner.
    WouldBlock {
        /// One of the owners blocking the request.
        owner: Owner,
    },
}

impl LockOutcome {
    /// Whether the request was applied.
    pub fn is_granted(&self) -> bool {
        matches!(self, LockOutcome::Granted)
    }
}

/// Description of a conflicting lock, as reported by the `F_GETLK`-style
/// query.
#[derive(Clone, Copy, Debug)]
pub struct ConflictInfo {
    /// Start of the conflicting record.
    pub start: off_t,
    /// Length of the conflicting record (0 = to end of file).
    pub len: off_t,
    /// Mode of the conflicting record.
    pub mode: LockMode,
    /// One owner of the conflicting record.
    pub owner: Owner,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_equality() {
        let a = Owner::new(100, 3);
        let b = Owner::new(100, 3);
        let c = Owner::new(100, 4);
        let d = Owner::new(101, 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_owner_free_sentinel() {
        let mut o = Owner::new(42, 7);
        assert!(!o.is_free());
        o.erase();
        assert!(o.is_free());
        assert_eq!(o, Owner::FREE);
    }

    #[test]
    fn test_mode_conflicts() {
        assert!(LockMode::Exclusive.conflicts_with(LockMode::Exclusive));
        assert!(LockMode::Exclusive.conflicts_with(LockMode::Shared));
        assert!(LockMode::Shared.conflicts_with(LockMode::Exclusive));
        assert!(!LockMode::Shared.conflicts_with(LockMode::Shared));
    }

    #[test]
    fn test_request_builders() {
        let req = LockRequest::exclusive(10, 0);
        assert_eq!(req.kind, RequestKind::Exclusive);
        assert!(req.is_unbounded());
        assert_eq!(req.kind.mode(), Some(LockMode::Exclusive));

        let req = LockRequest::unlock(0, 5).with_whence(Whence::Current);
        assert_eq!(req.whence, Whence::Current);
        assert_eq!(req.kind.mode(), None);
    }
}
