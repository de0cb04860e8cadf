//! reglock - advisory byte-range record locking over POSIX shared memory.
//!
//! reglock emulates `fcntl(F_SETLK)`-style record locking in user space:
//! byte-range locks, shared and exclusive modes, lock splitting and
//! merging, inheritance across `dup` and `fork`, and reclamation of locks
//! abandoned by dead holders. It rebuilds what the kernel's record-locking
//! table provides, using only shared memory and process-shared pthread
//! primitives, so unrelated processes coordinate purely through a mapped
//! registry keyed by the file's `(device, inode)` identity.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         reglock                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Descriptor façade: open | close | lock | dup | fork        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Registry: shm object per (dev, ino) | mutex | condvar      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Lock table engine: grant | release | split | merge | GC    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Segment arithmetic: overlap | intersection | whence        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The lock table is a fixed-capacity `#[repr(C)]` structure with sentinel
//! free markers and manual compaction: it lives in a flat shared-memory
//! blob, so no allocator and no process-local pointers ever cross into it.
//!
//! # Quick Start
//!
//! ```no_run
//! use reglock::{LockCommand, LockLibrary, LockOutcome, LockRequest};
//! use std::path::Path;
//!
//! fn main() -> reglock::Result<()> {
//!     // One context per process, before anything else.
//!     let mut lib = LockLibrary::new();
//!
//!     let file = lib.open(Path::new("/tmp/shared.db"), libc::O_RDWR, 0)?;
//!
//!     // Exclusive lock on the first 128 bytes; fail instead of waiting.
//!     match lib.lock(&file, LockCommand::TrySet, &LockRequest::exclusive(0, 128))? {
//!         LockOutcome::Granted => { /* critical section */ }
//!         LockOutcome::WouldBlock { owner } => {
//!             eprintln!("blocked by {}", owner);
//!         }
//!     }
//!
//!     lib.lock(&file, LockCommand::TrySet, &LockRequest::unlock(0, 128))?;
//!     lib.close(file)?;
//!     Ok(())
//! }
//! ```
//!
//! # Caveats
//!
//! Liveness of lock holders is probed with `kill(pid, 0)`; a pid recycled
//! by the OS after a crash can read as alive. There is no lease or
//! heartbeat protocol behind it. Registries are never destroyed by the
//! library; the shared-memory objects persist until explicitly unlinked.

pub mod config;
pub mod error;
pub mod types;

pub mod descriptor;
pub mod registry;
pub mod segment;
pub mod table;

pub use config::RegLockConfig;
pub use descriptor::{ForkOutcome, LockLibrary, RecordLockFile};
pub use error::{RegLockError, Result};
pub use types::{
    ConflictInfo, LockCommand, LockMode, LockOutcome, LockRequest, Owner, RequestKind, Whence,
};
