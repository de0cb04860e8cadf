//! Descriptor façade: the public open/close/lock/dup/fork surface.
//!
//! [`LockLibrary`] is the explicit per-process library context (its
//! construction is the per-process `init`): it owns the bounded set of
//! registries this process has mapped and composes registry lookup with
//! the lock table engine and the real descriptor lifecycle. There is no
//! teardown; mappings live until the process exits.
//!
//! A [`RecordLockFile`] is process-local: a real file descriptor plus the
//! index of its mapped registry. It is never shared between processes,
//! though the registry it refers to is.
//!
//! The library spawns no threads and expects to be driven from one thread
//! per process; cross-process synchronization happens entirely through the
//! registries' process-shared primitives.

use crate::config::RegLockConfig;
use crate::error::{RegLockError, Result};
use crate::registry::RegistryHandle;
use crate::segment;
use crate::table::{Applicability, SignalProbe};
use crate::types::{
    ConflictInfo, LockCommand, LockOutcome, LockRequest, Owner, MAX_OPEN_FILES,
};
use libc::{c_int, mode_t, pid_t};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// A record-locked open file: the real descriptor plus a reference (by
/// index, the mapping address is process-local) to its registry.
#[derive(Debug)]
pub struct RecordLockFile {
    fd: c_int,
    registry: usize,
}

impl RecordLockFile {
    /// The underlying file descriptor.
    pub fn raw_fd(&self) -> c_int {
        self.fd
    }
}

/// What `fork_with_locks` returned in this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkOutcome {
    /// This is the original process; `child` is the new pid.
    Parent {
        /// Pid of the forked child.
        child: pid_t,
    },
    /// This is the child; it now co-owns every record the parent owned.
    Child,
}

/// Per-process library context.
///
/// Construct one instance per process before any other call; dropping it
/// unmaps the registries but never destroys them.
pub struct LockLibrary {
    config: RegLockConfig,
    files: Vec<RegistryHandle>,
}

impl LockLibrary {
    /// Create a context with the default configuration.
    pub fn new() -> Self {
        Self {
            config: RegLockConfig::default(),
            files: Vec::new(),
        }
    }

    /// Create a context with an explicit, validated configuration.
    pub fn with_config(config: RegLockConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            files: Vec::new(),
        })
    }

    /// Open `path` with `open(2)` semantics and map its registry.
    ///
    /// Fails with `TooManyOpenFiles` before touching the filesystem when
    /// the per-process registry table is exhausted. Any later failure
    /// closes the descriptor again; nothing leaks.
    pub fn open(&mut self, path: &Path, flags: c_int, mode: mode_t) -> Result<RecordLockFile> {
        if self.files.len() >= MAX_OPEN_FILES {
            return Err(RegLockError::TooManyOpenFiles(MAX_OPEN_FILES));
        }

        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            RegLockError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path contains a NUL byte",
            ))
        })?;

        // SAFETY: cpath is a valid NUL-terminated string; mode is only
        // read when O_CREAT is set, passing it unconditionally is fine.
        let fd = unsafe { libc::open(cpath.as_ptr(), flags, mode as libc::c_uint) };
        if fd == -1 {
            return Err(io::Error::last_os_error().into());
        }

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: st is a valid stat buffer.
        if unsafe { libc::fstat(fd, &mut st) } == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err.into());
        }

        let name = RegistryHandle::shm_name(&self.config.shm.prefix, st.st_dev, st.st_ino);
        let registry = match self.files.iter().position(|h| h.name() == name) {
            Some(i) => i,
            None => match RegistryHandle::open_or_create(st.st_dev, st.st_ino, &self.config.shm) {
                Ok(handle) => {
                    self.files.push(handle);
                    self.files.len() - 1
                }
                Err(e) => {
                    unsafe { libc::close(fd) };
                    return Err(e);
                }
            },
        };

        debug!(path = %path.display(), fd, "opened record-locked file");
        Ok(RecordLockFile { fd, registry })
    }

    /// Close a record-locked file: remove this descriptor's ownership from
    /// every record, then close the real descriptor.
    pub fn close(&self, file: RecordLockFile) -> Result<()> {
        let owner = Owner::current(file.fd);
        let handle = self.handle(&file)?;
        {
            let mut guard = handle.lock()?;
            guard.table().release_owner(owner)?;
        }
        handle.notify_all();

        // SAFETY: file.fd came from open/dup and is consumed here.
        if unsafe { libc::close(file.fd) } == -1 {
            return Err(io::Error::last_os_error().into());
        }
        debug!(fd = file.fd, "closed record-locked file");
        Ok(())
    }

    /// Apply a lock request, mirroring `F_SETLK`/`F_SETLKW`.
    ///
    /// Unlock requests are always applicable. Lock requests run the
    /// applicability check under the registry mutex; a conflict whose
    /// owners are all dead is reclaimed on the spot and the check re-run.
    /// With [`LockCommand::TrySet`] a live conflict returns
    /// [`LockOutcome::WouldBlock`]; with [`LockCommand::SetWait`] the
    /// caller sleeps on the registry condition variable (waking at least
    /// every configured re-check interval, since a dying holder broadcasts
    /// nothing) until the range is free or the deadline passes.
    pub fn lock(
        &self,
        file: &RecordLockFile,
        command: LockCommand,
        request: &LockRequest,
    ) -> Result<LockOutcome> {
        let start = segment::resolve_start(request, file.fd)?;
        let owner = Owner::current(file.fd);
        let handle = self.handle(file)?;

        let mode = match request.kind.mode() {
            None => {
                {
                    let mut guard = handle.lock()?;
                    guard.table().release(start, request.len, owner)?;
                }
                handle.notify_all();
                trace!(%owner, start, len = request.len, "released range");
                return Ok(LockOutcome::Granted);
            }
            Some(mode) => mode,
        };

        let deadline = match command {
            LockCommand::SetWait {
                deadline: Some(max),
            } => Some(Instant::now() + max),
            _ => None,
        };
        let probe = SignalProbe;

        let mut guard = handle.lock()?;
        loop {
            match guard
                .table()
                .check_applicable(start, request.len, mode, owner, &probe)?
            {
                Applicability::Applicable => {
                    guard.table().grant(start, request.len, mode, owner)?;
                    drop(guard);
                    handle.notify_all();
                    trace!(%owner, start, len = request.len, %mode, "granted lock");
                    return Ok(LockOutcome::Granted);
                }
                Applicability::ReclaimNeeded(pid) => {
                    warn!(pid, "conflicting owner is dead; reclaiming its records");
                    guard.table().reclaim_pid(pid)?;
                }
                Applicability::Blocked(holder) => {
                    if command == LockCommand::TrySet {
                        return Ok(LockOutcome::WouldBlock { owner: holder });
                    }
                    let recheck = self.config.wait.recheck_interval();
                    let max_wait = match deadline {
                        Some(d) => {
                            let left = d.saturating_duration_since(Instant::now());
                            if left.is_zero() {
                                return Ok(LockOutcome::WouldBlock { owner: holder });
                            }
                            left.min(recheck)
                        }
                        None => recheck,
                    };
                    // Woken or timed out, re-check either way: the wake
                    // order is not FIFO and a holder may have died.
                    guard.wait(max_wait)?;
                }
            }
        }
    }

    /// Report the first lock that would block `request`, mirroring
    /// `F_GETLK`. `None` means the request would be granted right now.
    pub fn get_lock(
        &self,
        file: &RecordLockFile,
        request: &LockRequest,
    ) -> Result<Option<ConflictInfo>> {
        let mode = request.kind.mode().ok_or_else(|| {
            RegLockError::InvalidRange("conflict query needs a lock mode, not unlock".into())
        })?;
        let start = segment::resolve_start(request, file.fd)?;
        segment::validate_range(start, request.len)?;
        let owner = Owner::current(file.fd);
        let handle = self.handle(file)?;

        let guard = handle.lock()?;
        Ok(guard
            .table_ref()
            .conflicting_record(start, request.len, mode, owner))
    }

    /// Duplicate a descriptor with `dup(2)`; the new descriptor co-owns
    /// every record the old one owns.
    pub fn dup(&self, file: &RecordLockFile) -> Result<RecordLockFile> {
        let handle = self.handle(file)?;
        // SAFETY: file.fd is a live descriptor.
        let new_fd = unsafe { libc::dup(file.fd) };
        if new_fd == -1 {
            return Err(io::Error::last_os_error().into());
        }
        self.inherit_dup(handle, file, new_fd)
    }

    /// Duplicate a descriptor onto an explicit number with `dup2(2)`.
    /// Duplicating onto the descriptor's own number is a no-op returning
    /// the same descriptor.
    pub fn dup_to(&self, file: &RecordLockFile, target: c_int) -> Result<RecordLockFile> {
        if target < 0 {
            return Err(RegLockError::InvalidDescriptor(format!(
                "target descriptor {} is negative",
                target
            )));
        }
        if target == file.fd {
            return Ok(RecordLockFile {
                fd: file.fd,
                registry: file.registry,
            });
        }
        let handle = self.handle(file)?;
        // SAFETY: file.fd is a live descriptor; dup2 closes target first
        // if it was open.
        let new_fd = unsafe { libc::dup2(file.fd, target) };
        if new_fd == -1 {
            return Err(io::Error::last_os_error().into());
        }
        self.inherit_dup(handle, file, new_fd)
    }

    fn inherit_dup(
        &self,
        handle: &RegistryHandle,
        file: &RecordLockFile,
        new_fd: c_int,
    ) -> Result<RecordLockFile> {
        let pid = unsafe { libc::getpid() };
        let inherited = {
            let mut guard = handle.lock()?;
            guard.table().inherit_dup(pid, file.fd, new_fd)
        };
        if let Err(e) = inherited {
            unsafe { libc::close(new_fd) };
            return Err(e);
        }
        Ok(RecordLockFile {
            fd: new_fd,
            registry: file.registry,
        })
    }

    /// `fork(2)` with lock inheritance: the child becomes co-owner of
    /// every record the parent owned, under the same descriptor numbers,
    /// before this returns in the child.
    pub fn fork_with_locks(&self) -> Result<ForkOutcome> {
        let parent = unsafe { libc::getpid() };
        // SAFETY: this library holds no locks or heap state that fork
        // would tear; the child only touches the shared registries.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(io::Error::last_os_error().into()),
            0 => {
                let child = unsafe { libc::getpid() };
                for handle in &self.files {
                    let mut guard = handle.lock()?;
                    guard.table().inherit_fork(parent, child)?;
                }
                Ok(ForkOutcome::Child)
            }
            child => Ok(ForkOutcome::Parent { child }),
        }
    }

    /// Remove the shared-memory registry object for `path`. Maintenance
    /// helper: live mappings stay valid, only the name disappears.
    pub fn unlink_registry(&self, path: &Path) -> Result<()> {
        let meta = std::fs::metadata(path)?;
        RegistryHandle::unlink(&self.config.shm.prefix, meta.dev(), meta.ino())
    }

    fn handle(&self, file: &RecordLockFile) -> Result<&RegistryHandle> {
        if file.fd < 0 {
            return Err(RegLockError::InvalidDescriptor(format!(
                "negative descriptor {}",
                file.fd
            )));
        }
        self.files.get(file.registry).ok_or_else(|| {
            RegLockError::InvalidDescriptor(format!(
                "registry index {} is not mapped",
                file.registry
            ))
        })
    }
}

impl Default for LockLibrary {
    fn default() -> Self {
        Self::new()
    }
}
