//! Segment arithmetic for byte-range locks.
//!
//! Pure interval reasoning over half-open ranges `[start, start + len)`,
//! with the POSIX rule that `len == 0` means "from `start` to end of file,
//! growing as the file grows". Unbounded ranges have no right endpoint, so
//! every comparison goes through [`end_of`], which maps a range to
//! `Option<off_t>` (`None` = unbounded).

use crate::error::{RegLockError, Result};
use crate::types::{LockRequest, Whence};
use libc::{c_int, off_t};

/// Reject ranges the lock table cannot represent: negative fields, and a
/// bounded range whose exclusive end does not fit in `off_t`. Every range
/// entering the table goes through here, so the interval arithmetic below
/// never overflows on stored records either.
pub(crate) fn validate_range(start: off_t, len: off_t) -> Result<()> {
    if start < 0 || len < 0 || start.checked_add(len).is_none() {
        return Err(RegLockError::InvalidRange(format!(
            "start {} len {}",
            start, len
        )));
    }
    Ok(())
}

/// Exclusive end of `[start, start + len)`, or `None` when the range is
/// unbounded.
pub fn end_of(start: off_t, len: off_t) -> Option<off_t> {
    if len == 0 {
        None
    } else {
        Some(start + len)
    }
}

/// Whether `[s1, s1 + l1)` and `[s2, s2 + l2)` intersect.
///
/// Adjacent ranges do not overlap: `[0, 10)` and `[10, 20)` are disjoint.
/// A zero length makes a range unbounded on the right; two unbounded
/// ranges always overlap.
pub fn overlap(s1: off_t, l1: off_t, s2: off_t, l2: off_t) -> bool {
    if l1 == 0 {
        return l2 == 0 || s2 + l2 > s1;
    }

    if s2 >= s1 {
        s2 < s1 + l1
    } else {
        l2 == 0 || s2 + l2 > s1
    }
}

/// Intersection of two ranges, as `(start, end)` with `end == None` for
/// unbounded. `None` when the ranges do not overlap.
pub fn intersection(
    s1: off_t,
    l1: off_t,
    s2: off_t,
    l2: off_t,
) -> Option<(off_t, Option<off_t>)> {
    if !overlap(s1, l1, s2, l2) {
        return None;
    }
    let start = s1.max(s2);
    let end = match (end_of(s1, l1), end_of(s2, l2)) {
        (Some(e1), Some(e2)) => Some(e1.min(e2)),
        (Some(e), None) | (None, Some(e)) => Some(e),
        (None, None) => None,
    };
    Some((start, end))
}

/// Resolve a request's `(whence, start)` pair into an absolute starting
/// offset for the file behind `fd`.
///
/// `Whence::Current` consults the descriptor's file position via `lseek`;
/// `Whence::End` consults the file size via `fstat`. A resolved offset
/// before the start of the file is rejected.
pub fn resolve_start(req: &LockRequest, fd: c_int) -> Result<off_t> {
    let base = match req.whence {
        Whence::Start => 0,
        Whence::Current => {
            // SAFETY: lseek with SEEK_CUR does not move the position.
            let pos = unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) };
            if pos == -1 {
                return Err(std::io::Error::last_os_error().into());
            }
            pos
        }
        Whence::End => {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            // SAFETY: st is a valid stat buffer for the duration of the call.
            if unsafe { libc::fstat(fd, &mut st) } == -1 {
                return Err(std::io::Error::last_os_error().into());
            }
            st.st_size
        }
    };

    let start = base.checked_add(req.start).ok_or_else(|| {
        RegLockError::InvalidRange(format!(
            "offset {} from base {} does not fit in off_t",
            req.start, base
        ))
    })?;
    if start < 0 {
        return Err(RegLockError::InvalidRange(format!(
            "resolved offset {} is before the start of the file",
            start
        )));
    }
    Ok(start)
}
