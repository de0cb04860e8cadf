//! Lock table engine.
//!
//! The table is the shared half of a registry: a fixed-capacity array of
//! [`LockRecord`]s, each covering one byte range with one mode and a bounded
//! owner set. It lives in a flat shared-memory blob, so there is no pointer
//! or allocation in here: only plain `#[repr(C)]` data, sentinel free
//! markers, and manual compaction keeping occupied slots in a contiguous
//! prefix.
//!
//! Every method on [`LockTable`] assumes the caller holds the registry's
//! process-shared mutex. The engine itself is pure table manipulation and
//! is unit-tested against tables in ordinary process memory.
//!
//! Structural mutations are planned before they are applied: a release that
//! needs to split records first counts the extra slots it requires, and
//! fails without touching the table when they are not available.

use crate::error::{RegLockError, Result};
use crate::segment::{end_of, intersection, overlap, validate_range};
use crate::types::{
    ConflictInfo, LockMode, Owner, FREE_RECORD, MAX_OWNERS, MAX_RECORDS,
};
use libc::{c_int, off_t, pid_t};
use tracing::debug;

/// Result of the applicability check for a lock request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applicability {
    /// No conflicting record: the request can be granted now.
    Applicable,
    /// A conflicting record is held by this (live) owner.
    Blocked(Owner),
    /// Every conflicting owner is dead; the caller should reclaim this
    /// pid's records and re-check.
    ReclaimNeeded(pid_t),
}

/// Non-blocking probe for whether a lock-holding process still exists.
///
/// The production probe sends signal 0; tests substitute a fake so dead
/// owners can be simulated without spawning processes.
pub trait Liveness {
    /// Whether a process with this pid exists right now.
    fn is_alive(&self, pid: pid_t) -> bool;
}

/// Liveness probe backed by `kill(pid, 0)`.
///
/// `EPERM` counts as alive: the process exists, we merely cannot signal
/// it. A recycled pid makes a dead holder look alive; this design has no
/// heartbeat or lease to detect that, and accepts the false reading.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

impl Liveness for SignalProbe {
    fn is_alive(&self, pid: pid_t) -> bool {
        // SAFETY: signal 0 performs error checking only, nothing is sent.
        let ret = unsafe { libc::kill(pid, 0) };
        if ret == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// One locked byte range and the set of owners holding it.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LockRecord {
    start: off_t,
    len: off_t,
    mode: LockMode,
    owner_count: u32,
    owners: [Owner; MAX_OWNERS],
}

impl LockRecord {
    const FREE: LockRecord = LockRecord {
        start: FREE_RECORD,
        len: 0,
        mode: LockMode::Shared,
        owner_count: 0,
        owners: [Owner::FREE; MAX_OWNERS],
    };

    fn single(start: off_t, len: off_t, mode: LockMode, owner: Owner) -> Self {
        let mut rec = LockRecord::FREE;
        rec.start = start;
        rec.len = len;
        rec.mode = mode;
        rec.owners[0] = owner;
        rec.owner_count = 1;
        rec
    }

    /// Start of the locked range.
    pub fn start(&self) -> off_t {
        self.start
    }

    /// Length of the locked range (0 = to end of file).
    pub fn len(&self) -> off_t {
        self.len
    }

    /// Mode of the lock.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Number of owners currently holding the record.
    pub fn owner_count(&self) -> usize {
        self.owner_count as usize
    }

    /// Live owners of the record.
    pub fn owners(&self) -> impl Iterator<Item = Owner> + '_ {
        self.owners.iter().copied().filter(|o| !o.is_free())
    }

    fn is_free(&self) -> bool {
        self.start == FREE_RECORD
    }

    fn erase(&mut self) {
        *self = LockRecord::FREE;
    }

    /// A copy of this record (mode and owner set) covering a different
    /// range.
    fn with_range(&self, start: off_t, len: off_t) -> Self {
        let mut rec = *self;
        rec.start = start;
        rec.len = len;
        rec
    }

    pub(crate) fn has_owner(&self, owner: Owner) -> bool {
        self.owners().any(|o| o == owner)
    }

    /// First live owner different from `owner`, if any.
    fn other_owner(&self, owner: Owner) -> Option<Owner> {
        self.owners().find(|o| *o != owner)
    }

    /// Whether `owner` is the only holder of the record.
    fn solely_owned_by(&self, owner: Owner) -> bool {
        self.owner_count == 1 && self.has_owner(owner)
    }

    /// Add an owner to the record. Adding an owner that is already present
    /// is a no-op.
    fn add_owner(&mut self, owner: Owner) -> Result<()> {
        if self.has_owner(owner) {
            return Ok(());
        }
        if self.owner_count as usize >= MAX_OWNERS {
            return Err(RegLockError::OwnerTableFull {
                start: self.start,
                capacity: MAX_OWNERS,
            });
        }
        self.owners[self.owner_count as usize] = owner;
        self.owner_count += 1;
        Ok(())
    }

    /// Remove an owner from the record, keeping the owner slots compacted.
    /// Returns whether the owner was present.
    fn remove_owner(&mut self, owner: Owner) -> Result<bool> {
        let mut removed = false;
        for slot in self.owners.iter_mut() {
            if !slot.is_free() && *slot == owner {
                slot.erase();
                removed = true;
            }
        }
        if removed {
            self.owner_count = self.owner_count.saturating_sub(1);
            self.compact_owners()?;
        }
        Ok(removed)
    }

    /// Shift live owners into the first `owner_count` slots.
    fn compact_owners(&mut self) -> Result<()> {
        if self.owner_count as usize > MAX_OWNERS {
            return Err(RegLockError::Corrupt(format!(
                "record at {} claims {} owners",
                self.start, self.owner_count
            )));
        }
        let mut write = 0;
        for read in 0..MAX_OWNERS {
            if !self.owners[read].is_free() {
                if read != write {
                    self.owners[write] = self.owners[read];
                    self.owners[read].erase();
                }
                write += 1;
            }
        }
        if write != self.owner_count as usize {
            return Err(RegLockError::Corrupt(format!(
                "record at {} has {} live owners but claims {}",
                self.start, write, self.owner_count
            )));
        }
        Ok(())
    }
}

/// The complete lock state of one open file: a bounded table of records.
#[repr(C)]
pub struct LockTable {
    record_count: u32,
    records: [LockRecord; MAX_RECORDS],
}

impl LockTable {
    /// Erase every record and owner slot. Used on freshly created shared
    /// memory and in unit tests.
    pub fn init(&mut self) {
        self.record_count = 0;
        for rec in self.records.iter_mut() {
            rec.erase();
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.record_count as usize
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Live records, in slot order.
    pub fn records(&self) -> impl Iterator<Item = &LockRecord> {
        self.records.iter().filter(|r| !r.is_free())
    }

    fn live_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_RECORDS).filter(|&i| !self.records[i].is_free())
    }

    fn check_counts(&self) -> Result<()> {
        if self.record_count as usize > MAX_RECORDS {
            return Err(RegLockError::Corrupt(format!(
                "table claims {} records",
                self.record_count
            )));
        }
        Ok(())
    }

    /// Shift live records into the first `record_count` slots.
    fn compact(&mut self) -> Result<()> {
        self.check_counts()?;
        let mut write = 0;
        for read in 0..MAX_RECORDS {
            if !self.records[read].is_free() {
                if read != write {
                    self.records[write] = self.records[read];
                    self.records[read].erase();
                }
                write += 1;
            }
        }
        if write != self.record_count as usize {
            return Err(RegLockError::Corrupt(format!(
                "table has {} live records but claims {}",
                write, self.record_count
            )));
        }
        Ok(())
    }

    /// Insert a record into the first free slot. The table must be
    /// compacted.
    fn insert(&mut self, rec: LockRecord) -> Result<()> {
        if self.record_count as usize >= MAX_RECORDS {
            return Err(RegLockError::LockTableFull(MAX_RECORDS));
        }
        self.records[self.record_count as usize] = rec;
        self.record_count += 1;
        Ok(())
    }

    /// Decide whether a request for `[start, start + len)` in `mode` by
    /// `owner` can be granted against the current table.
    ///
    /// A conflicting record held by a live other owner blocks the request.
    /// When every conflicting owner's process is dead, the request is
    /// neither granted nor blocked: the caller is told to reclaim the dead
    /// pid's records and re-check.
    pub fn check_applicable(
        &self,
        start: off_t,
        len: off_t,
        mode: LockMode,
        owner: Owner,
        probe: &dyn Liveness,
    ) -> Result<Applicability> {
        validate_range(start, len)?;
        self.check_counts()?;

        let mut dead: Option<pid_t> = None;
        for i in self.live_indices() {
            let rec = &self.records[i];
            if !overlap(rec.start, rec.len, start, len) || !rec.mode.conflicts_with(mode) {
                continue;
            }
            for other in rec.owners().filter(|o| *o != owner) {
                if probe.is_alive(other.pid) {
                    return Ok(Applicability::Blocked(other));
                }
                dead.get_or_insert(other.pid);
            }
        }

        match dead {
            Some(pid) => Ok(Applicability::ReclaimNeeded(pid)),
            None => Ok(Applicability::Applicable),
        }
    }

    /// First record that would block a request, without probing liveness.
    /// This is the `F_GETLK` answer.
    pub fn conflicting_record(
        &self,
        start: off_t,
        len: off_t,
        mode: LockMode,
        owner: Owner,
    ) -> Option<ConflictInfo> {
        for i in self.live_indices() {
            let rec = &self.records[i];
            if !overlap(rec.start, rec.len, start, len) || !rec.mode.conflicts_with(mode) {
                continue;
            }
            if let Some(other) = rec.other_owner(owner) {
                return Some(ConflictInfo {
                    start: rec.start,
                    len: rec.len,
                    mode: rec.mode,
                    owner: other,
                });
            }
        }
        None
    }

    /// Grant a lock on `[start, start + len)` in `mode` to `owner`.
    ///
    /// The caller must have established applicability under the same
    /// critical section. The grant first releases the owner's own coverage
    /// inside the range (a descriptor never holds overlapping records),
    /// then merges abutting same-mode records solely owned by the
    /// requester, then inserts the final record or joins an identical one.
    pub fn grant(
        &mut self,
        start: off_t,
        len: off_t,
        mode: LockMode,
        owner: Owner,
    ) -> Result<()> {
        validate_range(start, len)?;

        self.release(start, len, owner)?;

        let mut start = start;
        let mut len = len;

        // A bounded record ending exactly at the new range's start, same
        // mode, held only by the requester: fold it into the new range.
        let left = self.live_indices().find(|&i| {
            let rec = &self.records[i];
            rec.len != 0
                && rec.start + rec.len == start
                && rec.mode == mode
                && rec.solely_owned_by(owner)
        });
        if let Some(i) = left {
            let merged = self.records[i];
            start = merged.start;
            if len != 0 {
                len += merged.len;
            }
            self.records[i].erase();
            self.record_count -= 1;
        }

        // Same on the right; an unbounded request has no right edge.
        if len != 0 {
            let edge = start + len;
            let right = self.live_indices().find(|&i| {
                let rec = &self.records[i];
                rec.start == edge && rec.mode == mode && rec.solely_owned_by(owner)
            });
            if let Some(i) = right {
                let merged = self.records[i];
                len = if merged.len == 0 { 0 } else { len + merged.len };
                self.records[i].erase();
                self.record_count -= 1;
            }
        }

        self.compact()?;

        // Identical range and mode already in the table: share the record.
        let twin = self.live_indices().find(|&i| {
            let rec = &self.records[i];
            rec.start == start && rec.len == len && rec.mode == mode
        });
        if let Some(i) = twin {
            return self.records[i].add_owner(owner);
        }

        self.insert(LockRecord::single(start, len, mode, owner))
    }

    /// Release `owner`'s coverage of `[start, start + len)`.
    ///
    /// Records fully covered lose the owner; records partially covered are
    /// truncated or split, with the residual portions keeping the full
    /// owner set and the covered middle keeping everyone but the releasing
    /// owner. All slots needed for splits are accounted for before any
    /// mutation, so a release either applies completely or fails without
    /// side effects.
    pub fn release(&mut self, start: off_t, len: off_t, owner: Owner) -> Result<()> {
        validate_range(start, len)?;
        self.check_counts()?;

        // Plan phase: compute each affected record's replacement pieces.
        let mut planned: Vec<(usize, Vec<LockRecord>)> = Vec::new();
        let mut extra = 0usize;
        for i in self.live_indices() {
            let rec = self.records[i];
            if !rec.has_owner(owner) || !overlap(rec.start, rec.len, start, len) {
                continue;
            }
            let (cov_start, cov_end) = match intersection(rec.start, rec.len, start, len) {
                Some(cov) => cov,
                None => continue,
            };
            let rec_end = end_of(rec.start, rec.len);

            let mut pieces = Vec::new();
            if rec.start < cov_start {
                pieces.push(rec.with_range(rec.start, cov_start - rec.start));
            }
            if rec.owner_count > 1 {
                let (mid_start, mid_len) = match cov_end {
                    Some(e) => (cov_start, e - cov_start),
                    None => (cov_start, 0),
                };
                let mut mid = rec.with_range(mid_start, mid_len);
                mid.remove_owner(owner)?;
                pieces.push(mid);
            }
            match (cov_end, rec_end) {
                (Some(ce), Some(re)) if ce < re => {
                    pieces.push(rec.with_range(ce, re - ce));
                }
                (Some(ce), None) => {
                    pieces.push(rec.with_range(ce, 0));
                }
                _ => {}
            }

            extra += pieces.len().saturating_sub(1);
            planned.push((i, pieces));
        }

        if planned.is_empty() {
            return Ok(());
        }
        if self.record_count as usize + extra > MAX_RECORDS {
            return Err(RegLockError::LockTableFull(MAX_RECORDS));
        }

        // Commit phase.
        let mut to_insert = Vec::new();
        for (i, pieces) in planned {
            match pieces.split_first() {
                None => {
                    self.records[i].erase();
                    self.record_count -= 1;
                }
                Some((first, rest)) => {
                    self.records[i] = *first;
                    to_insert.extend_from_slice(rest);
                }
            }
        }
        self.compact()?;
        for rec in to_insert {
            self.insert(rec)?;
        }
        Ok(())
    }

    /// Remove `owner` from every record, erasing records left without
    /// owners. This is the close path.
    pub fn release_owner(&mut self, owner: Owner) -> Result<()> {
        self.check_counts()?;
        let mut erased = 0u32;
        for i in 0..MAX_RECORDS {
            if self.records[i].is_free() {
                continue;
            }
            if self.records[i].remove_owner(owner)? && self.records[i].owner_count == 0 {
                self.records[i].erase();
                erased += 1;
            }
        }
        self.record_count -= erased;
        self.compact()
    }

    /// Remove every descriptor of a dead process from the table. This is
    /// the close path run on behalf of a crashed holder.
    pub fn reclaim_pid(&mut self, pid: pid_t) -> Result<()> {
        debug!(pid, "reclaiming records abandoned by dead process");
        self.check_counts()?;
        let mut erased = 0u32;
        for i in 0..MAX_RECORDS {
            if self.records[i].is_free() {
                continue;
            }
            let stale: Vec<Owner> = self.records[i]
                .owners()
                .filter(|o| o.pid == pid)
                .collect();
            for owner in stale {
                self.records[i].remove_owner(owner)?;
            }
            if self.records[i].owner_count == 0 {
                self.records[i].erase();
                erased += 1;
            }
        }
        self.record_count -= erased;
        self.compact()
    }

    /// After `fork`, register the child as co-owner of everything the
    /// parent owns: for every `(parent, fd)` owner, add `(child, fd)`.
    pub fn inherit_fork(&mut self, parent: pid_t, child: pid_t) -> Result<()> {
        self.check_counts()?;
        for i in self.live_indices().collect::<Vec<_>>() {
            let fds: Vec<c_int> = self.records[i]
                .owners()
                .filter(|o| o.pid == parent)
                .map(|o| o.fd)
                .collect();
            for fd in fds {
                self.records[i].add_owner(Owner::new(child, fd))?;
            }
        }
        Ok(())
    }

    /// After `dup`, register the new descriptor as co-owner of everything
    /// the old one owns: for every `(pid, old_fd)` owner, add
    /// `(pid, new_fd)`.
    pub fn inherit_dup(&mut self, pid: pid_t, old_fd: c_int, new_fd: c_int) -> Result<()> {
        self.check_counts()?;
        for i in self.live_indices().collect::<Vec<_>>() {
            if self.records[i].has_owner(Owner::new(pid, old_fd)) {
                self.records[i].add_owner(Owner::new(pid, new_fd))?;
            }
        }
        Ok(())
    }
}
