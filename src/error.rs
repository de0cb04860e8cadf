//! Error types for reglock operations.
//!
//! This module provides a unified error type [`RegLockError`] for all reglock
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! Errors are organized into the following categories:
//!
//! - **Resource exhaustion**: lock table full, owner table full, per-process
//!   file table full
//! - **Invalid request**: malformed ranges, stale descriptors
//! - **Synchronization**: process-shared mutex/condvar failures at the OS
//!   level (non-recoverable for that registry)
//! - **Shared state**: a registry whose counters or slots no longer satisfy
//!   the table invariants
//! - **I/O**: failures from the wrapped `open`/`close`/`dup`/`fork` calls
//!
//! A conflicting lock held by a live process is *not* an error: it is
//! reported as [`LockOutcome::WouldBlock`](crate::types::LockOutcome), and a
//! conflicting lock held by a dead process is reclaimed without surfacing
//! anything to the caller.
//!
//! # Example
//!
//! ```rust
//! use reglock::error::{RegLockError, Result};
//!
//! fn check_len(len: i64) -> Result<()> {
//!     if len < 0 {
//!         return Err(RegLockError::InvalidRange(format!("negative len {}", len)));
//!     }
//!     Ok(())
//! }
//! ```

use std::io;
use thiserror::Error;

/// Main error type for reglock operations.
#[derive(Error, Debug)]
pub enum RegLockError {
    // Resource exhaustion
    #[error("lock table full: all {0} record slots in use")]
    LockTableFull(usize),

    #[error("owner table full for record starting at {start}: all {capacity} owner slots in use")]
    OwnerTableFull { start: i64, capacity: usize },

    #[error("too many registry-mapped files: limit is {0}")]
    TooManyOpenFiles(usize),

    // Invalid requests
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    // Synchronization failures (fatal for the affected registry)
    #[error("{op} failed with code {code}")]
    Sync { op: &'static str, code: i32 },

    // Shared state damage
    #[error("registry corrupt: {0}")]
    Corrupt(String),

    #[error("registry not initialized after {attempts} probe(s)")]
    RegistryUnready { attempts: u32 },

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RegLockError {
    /// Convert to a POSIX errno, mirroring what `fcntl(2)` would report.
    pub fn to_errno(&self) -> i32 {
        match self {
            RegLockError::LockTableFull(_) | RegLockError::OwnerTableFull { .. } => libc::ENOLCK,
            RegLockError::TooManyOpenFiles(_) => libc::EMFILE,
            RegLockError::InvalidRange(_) | RegLockError::InvalidDescriptor(_) => libc::EINVAL,
            RegLockError::Sync { code, .. } => *code,
            RegLockError::Corrupt(_) => libc::EIO,
            RegLockError::RegistryUnready { .. } => libc::EAGAIN,
            RegLockError::Config(_) | RegLockError::InvalidConfig { .. } => libc::EINVAL,
            RegLockError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Check if the operation may be retried against the same registry.
    ///
    /// Synchronization and corruption failures are final: retrying against a
    /// broken mutex can deadlock other processes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegLockError::RegistryUnready { .. })
    }
}

/// Result type alias for reglock operations.
pub type Result<T> = std::result::Result<T, RegLockError>;
