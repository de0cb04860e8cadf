//! Shared open-file registry.
//!
//! One registry exists per distinct `(device, inode)` file identity,
//! backed by a POSIX shared-memory object named `/<prefix>_<dev>_<ino>`,
//! so unrelated processes opening the same path map the same physical
//! structure. The registry holds the file's [`LockTable`] plus the
//! process-shared mutex and condition variable guarding it.
//!
//! # Initialization protocol
//!
//! Between creating the object and finishing its initialization there is a
//! window where another process can map uninitialized memory. The window
//! is closed with two pieces:
//!
//! - creation uses `O_CREAT | O_EXCL`, so exactly one process ever
//!   initializes a given object (a loser of the create race falls back to
//!   the open-existing path);
//! - the creator publishes a ready marker (an atomic magic word) as its
//!   *last* store, and late openers spin on the marker (bounded by the
//!   configured retry budget) before touching anything else.
//!
//! Registries are never destroyed by normal operation: the object outlives
//! the processes that map it. [`RegistryHandle::unlink`] exists for tests
//! and explicit maintenance.

use crate::config::ShmConfig;
use crate::error::{RegLockError, Result};
use crate::table::LockTable;
use libc::{dev_t, ino_t, off_t};
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Magic word stored in [`Registry::ready`] once initialization is
/// complete.
const REGISTRY_READY: u32 = 0x5247_4c4b; // "RGLK"

/// The shared-memory structure mapped by every process that opens the same
/// file.
///
/// The layout must be identical in every process, hence `#[repr(C)]` and
/// fixed-capacity members only. All references into it are expressed as
/// array indices, never as addresses: the mapping address differs between
/// processes.
#[repr(C)]
pub struct Registry {
    ready: AtomicU32,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
    table: UnsafeCell<LockTable>,
}

/// Outcome of a bounded wait on the registry condition variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// Another process broadcast a table change; re-check.
    Woken,
    /// The deadline passed without a wakeup.
    TimedOut,
}

/// A process-local mapping of one registry.
///
/// The handle owns the mapping (unmapped on drop) but never the
/// shared-memory object itself.
pub struct RegistryHandle {
    name: String,
    ptr: NonNull<Registry>,
}

// SAFETY: the mapping is valid for the lifetime of the handle and all
// shared mutation happens under the embedded process-shared mutex.
unsafe impl Send for RegistryHandle {}

impl RegistryHandle {
    /// Registry object name for a file identity. Stable across processes
    /// and collision-free across distinct identities (the fields are
    /// numeric, so the separator is unambiguous).
    pub fn shm_name(prefix: &str, dev: dev_t, ino: ino_t) -> String {
        format!("/{}_{}_{}", prefix, dev, ino)
    }

    /// Map the registry for `(dev, ino)`, creating and initializing it if
    /// it does not exist yet.
    pub fn open_or_create(dev: dev_t, ino: ino_t, config: &ShmConfig) -> Result<Self> {
        let name = Self::shm_name(&config.prefix, dev, ino);
        let cname = CString::new(name.clone())
            .map_err(|_| RegLockError::Config(format!("bad registry name {:?}", name)))?;

        loop {
            // SAFETY: cname is a valid NUL-terminated string.
            let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
            if fd >= 0 {
                debug!(%name, "mapping existing registry");
                return Self::map_existing(fd, name, config);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err.into());
            }

            // Nothing there: race to create it. Exactly one process wins
            // the O_EXCL and initializes; losers loop back to the
            // open-existing path.
            let fd = unsafe {
                libc::shm_open(
                    cname.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    config.create_mode as libc::mode_t,
                )
            };
            if fd >= 0 {
                debug!(%name, "creating registry");
                return Self::create(fd, &cname, name);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err.into());
            }
        }
    }

    fn map_existing(fd: libc::c_int, name: String, config: &ShmConfig) -> Result<Self> {
        let size = mem::size_of::<Registry>();

        // The creator may not have run ftruncate yet; mapping a too-small
        // object would fault on first access.
        let mut attempts = 0u32;
        loop {
            let mut st: libc::stat = unsafe { mem::zeroed() };
            // SAFETY: st is a valid stat buffer.
            if unsafe { libc::fstat(fd, &mut st) } == -1 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err.into());
            }
            if st.st_size as usize >= size {
                break;
            }
            attempts += 1;
            if attempts >= config.init_retry_attempts {
                unsafe { libc::close(fd) };
                return Err(RegLockError::RegistryUnready { attempts });
            }
            std::thread::sleep(config.init_retry_delay());
        }

        let ptr = Self::map(fd, size)?;
        let handle = Self { name, ptr };

        // Wait for the creator to publish the ready marker.
        while handle.registry().ready.load(Ordering::Acquire) != REGISTRY_READY {
            attempts += 1;
            if attempts >= config.init_retry_attempts {
                return Err(RegLockError::RegistryUnready { attempts });
            }
            std::thread::sleep(config.init_retry_delay());
        }
        Ok(handle)
    }

    fn create(fd: libc::c_int, cname: &CString, name: String) -> Result<Self> {
        let size = mem::size_of::<Registry>();

        // The name is already published by the exclusive create. If
        // initialization fails anywhere before the ready marker is stored,
        // the object must be unlinked again: it would otherwise sit there
        // forever without the marker, and every later open of this file
        // identity would spin out with `RegistryUnready`.
        let mut cleanup = UnlinkOnFailure::new(cname);

        // SAFETY: fd is the object we just created exclusively.
        if unsafe { libc::ftruncate(fd, size as off_t) } == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err.into());
        }

        let ptr = Self::map(fd, size)?;
        let handle = Self { name, ptr };

        let registry = handle.registry();
        init_process_shared_mutex(registry.mutex.get())?;
        init_process_shared_cond(registry.cond.get())?;
        // SAFETY: no other process can see the object as initialized until
        // the ready marker below is published.
        unsafe { (*registry.table.get()).init() };
        registry.ready.store(REGISTRY_READY, Ordering::Release);

        cleanup.disarm();
        Ok(handle)
    }

    /// mmap the registry and close the descriptor (the mapping keeps the
    /// object alive).
    fn map(fd: libc::c_int, size: usize) -> Result<NonNull<Registry>> {
        // SAFETY: fd refers to a shared-memory object of at least `size`
        // bytes.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let map_err = if ptr == libc::MAP_FAILED {
            Some(io::Error::last_os_error())
        } else {
            None
        };
        unsafe { libc::close(fd) };
        match map_err {
            Some(err) => Err(err.into()),
            None => NonNull::new(ptr as *mut Registry)
                .ok_or_else(|| RegLockError::Corrupt("registry mapped at null".into())),
        }
    }

    /// Name of the backing shared-memory object.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn registry(&self) -> &Registry {
        // SAFETY: the mapping is valid for the lifetime of the handle.
        unsafe { self.ptr.as_ref() }
    }

    /// Take the registry mutex.
    pub fn lock(&self) -> Result<RegistryGuard<'_>> {
        // SAFETY: the mutex was initialized process-shared by the creator.
        let rc = unsafe { libc::pthread_mutex_lock(self.registry().mutex.get()) };
        if rc != 0 {
            return Err(RegLockError::Sync {
                op: "pthread_mutex_lock",
                code: rc,
            });
        }
        Ok(RegistryGuard { handle: self })
    }

    /// Wake every process waiting on this registry's condition variable.
    /// Failure to broadcast only delays waiters (they re-check on their
    /// own), so it is logged, not surfaced.
    pub fn notify_all(&self) {
        // SAFETY: the condvar was initialized process-shared by the creator.
        let rc = unsafe { libc::pthread_cond_broadcast(self.registry().cond.get()) };
        if rc != 0 {
            warn!(name = %self.name, code = rc, "pthread_cond_broadcast failed");
        }
    }

    /// Remove the shared-memory object for a file identity. Extant
    /// mappings stay valid; only the name goes away. Missing objects are
    /// not an error.
    pub fn unlink(prefix: &str, dev: dev_t, ino: ino_t) -> Result<()> {
        let name = Self::shm_name(prefix, dev, ino);
        let cname = CString::new(name.clone())
            .map_err(|_| RegLockError::Config(format!("bad registry name {:?}", name)))?;
        // SAFETY: cname is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(cname.as_ptr()) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err.into());
            }
        }
        Ok(())
    }
}

impl Drop for RegistryHandle {
    fn drop(&mut self) {
        // Unmap only; the object itself is never destroyed here.
        // SAFETY: ptr was returned by mmap with this size.
        unsafe {
            libc::munmap(
                self.ptr.as_ptr() as *mut libc::c_void,
                mem::size_of::<Registry>(),
            );
        }
    }
}

/// Unlinks a freshly created shared-memory object unless disarmed,
/// covering every early return between the exclusive create and the ready
/// marker being published.
struct UnlinkOnFailure<'a> {
    cname: &'a CString,
    armed: bool,
}

impl<'a> UnlinkOnFailure<'a> {
    fn new(cname: &'a CString) -> Self {
        Self { cname, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for UnlinkOnFailure<'_> {
    fn drop(&mut self) {
        if self.armed {
            // SAFETY: cname is a valid NUL-terminated string.
            unsafe { libc::shm_unlink(self.cname.as_ptr()) };
        }
    }
}

/// Holds the registry mutex; unlocks on drop on every exit path.
pub struct RegistryGuard<'a> {
    handle: &'a RegistryHandle,
}

impl RegistryGuard<'_> {
    /// The lock table, mutable under the held mutex.
    pub fn table(&mut self) -> &mut LockTable {
        // SAFETY: the registry mutex is held for the guard's lifetime, so
        // this process has exclusive access to the table.
        unsafe { &mut *self.handle.registry().table.get() }
    }

    /// The lock table, read-only.
    pub fn table_ref(&self) -> &LockTable {
        // SAFETY: as for `table`.
        unsafe { &*self.handle.registry().table.get() }
    }

    /// Release the mutex and sleep on the condition variable, reacquiring
    /// it before returning. Returns after a broadcast or after `max_wait`,
    /// whichever comes first. This is the only suspension point in the
    /// library.
    pub fn wait(&mut self, max_wait: Duration) -> Result<WaitStatus> {
        let registry = self.handle.registry();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let abs = now + max_wait;
        let ts = libc::timespec {
            tv_sec: abs.as_secs() as libc::time_t,
            tv_nsec: abs.subsec_nanos() as libc::c_long,
        };
        // SAFETY: the mutex is held by this guard and both primitives were
        // initialized process-shared; timedwait atomically releases and
        // reacquires the mutex.
        let rc = unsafe {
            libc::pthread_cond_timedwait(registry.cond.get(), registry.mutex.get(), &ts)
        };
        match rc {
            0 => Ok(WaitStatus::Woken),
            libc::ETIMEDOUT => Ok(WaitStatus::TimedOut),
            code => Err(RegLockError::Sync {
                op: "pthread_cond_timedwait",
                code,
            }),
        }
    }
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the mutex.
        let rc = unsafe { libc::pthread_mutex_unlock(self.handle.registry().mutex.get()) };
        if rc != 0 {
            warn!(name = %self.handle.name, code = rc, "pthread_mutex_unlock failed");
        }
    }
}

fn init_process_shared_mutex(mutex: *mut libc::pthread_mutex_t) -> Result<()> {
    // SAFETY: attr is initialized before every use and destroyed after.
    unsafe {
        let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
        let rc = libc::pthread_mutexattr_init(&mut attr);
        if rc != 0 {
            return Err(RegLockError::Sync {
                op: "pthread_mutexattr_init",
                code: rc,
            });
        }
        let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if rc != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(RegLockError::Sync {
                op: "pthread_mutexattr_setpshared",
                code: rc,
            });
        }
        let rc = libc::pthread_mutex_init(mutex, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(RegLockError::Sync {
                op: "pthread_mutex_init",
                code: rc,
            });
        }
    }
    Ok(())
}

fn init_process_shared_cond(cond: *mut libc::pthread_cond_t) -> Result<()> {
    // SAFETY: as for the mutex attribute.
    unsafe {
        let mut attr: libc::pthread_condattr_t = mem::zeroed();
        let rc = libc::pthread_condattr_init(&mut attr);
        if rc != 0 {
            return Err(RegLockError::Sync {
                op: "pthread_condattr_init",
                code: rc,
            });
        }
        let rc = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if rc != 0 {
            libc::pthread_condattr_destroy(&mut attr);
            return Err(RegLockError::Sync {
                op: "pthread_condattr_setpshared",
                code: rc,
            });
        }
        let rc = libc::pthread_cond_init(cond, &attr);
        libc::pthread_condattr_destroy(&mut attr);
        if rc != 0 {
            return Err(RegLockError::Sync {
                op: "pthread_cond_init",
                code: rc,
            });
        }
    }
    Ok(())
}
