//! The fid table (§4.2): a fixed-capacity, slot-indexed allocator for
//! session-scoped 32-bit handles.
//!
//! Unlike a `HashMap<u32, _>` keyed by the fid number, the table below
//! is a fixed-size array of slots; `alloc` scans for a free slot and
//! binds the caller-chosen fid number into it, `lookup` scans by
//! number. This matches the fixed-capacity-allocator assumption the
//! design document calls out (§9: "works well with the fixed-capacity
//! allocators this spec assumes") and bounds a session's fid usage to
//! `max_fids` regardless of how many distinct numbers a hostile or
//! buggy client tries.

use crate::error::{Error, ProtoKind};
use crate::fcall::QId;
use crate::utils::Result;

/// Per-fid state tracked by the dispatcher, parameterized over the
/// backend's own node handle type `N`.
#[derive(Clone, Debug)]
pub struct FidEntry<N> {
    pub fid: u32,
    /// The backend node this fid is bound to.
    pub node: N,
    /// The qid last returned for this fid (walk/attach/create/open).
    pub qid: QId,
    /// The uname claimed at attach time.
    pub uname: String,
    /// Set once `Topen`/`Tcreate` has succeeded on this fid.
    pub iounit: Option<u32>,
}

#[derive(Debug)]
struct Slot<N> {
    in_use: bool,
    entry: Option<FidEntry<N>>,
}

/// A fixed-capacity fid table, one per session.
#[derive(Debug)]
pub struct FidTable<N> {
    slots: Vec<Slot<N>>,
}

impl<N> FidTable<N> {
    pub fn new(capacity: usize) -> FidTable<N> {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot {
            in_use: false,
            entry: None,
        });
        FidTable { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_slot(&self, fid: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.in_use && s.entry.as_ref().is_some_and(|e| e.fid == fid))
    }

    /// Allocate `fid`, binding it to `entry`. Fails with `FidInUse` if
    /// the number is already bound, or `FidExhausted` if every slot is
    /// occupied.
    pub fn alloc(&mut self, fid: u32, entry: FidEntry<N>) -> Result<()> {
        if self.find_slot(fid).is_some() {
            return Err(Error::proto(ProtoKind::FidInUse));
        }
        let free = self
            .slots
            .iter()
            .position(|s| !s.in_use)
            .ok_or_else(|| Error::proto(ProtoKind::FidExhausted))?;
        self.slots[free] = Slot {
            in_use: true,
            entry: Some(entry),
        };
        Ok(())
    }

    pub fn lookup(&self, fid: u32) -> Result<&FidEntry<N>> {
        self.find_slot(fid)
            .and_then(|i| self.slots[i].entry.as_ref())
            .ok_or_else(|| Error::proto(ProtoKind::UnknownFid))
    }

    pub fn lookup_mut(&mut self, fid: u32) -> Result<&mut FidEntry<N>> {
        match self.find_slot(fid) {
            Some(i) => self.slots[i]
                .entry
                .as_mut()
                .ok_or_else(|| Error::proto(ProtoKind::UnknownFid)),
            None => Err(Error::proto(ProtoKind::UnknownFid)),
        }
    }

    pub fn contains(&self, fid: u32) -> bool {
        self.find_slot(fid).is_some()
    }

    /// Release `fid` unconditionally, returning its entry if it was
    /// bound. Freeing an unbound fid is not an error: Tclunk/Tremove
    /// must always succeed from the caller's perspective (§4.5).
    pub fn free(&mut self, fid: u32) -> Option<FidEntry<N>> {
        match self.find_slot(fid) {
            Some(i) => {
                self.slots[i].in_use = false;
                self.slots[i].entry.take()
            }
            None => None,
        }
    }

    /// Release every bound fid, returning their entries so the caller
    /// can run backend clunk hooks. Used on `Tversion` (§4.5: "Tversion
    /// resets all session state") and session teardown.
    pub fn clear(&mut self) -> Vec<FidEntry<N>> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            if slot.in_use {
                slot.in_use = false;
                if let Some(e) = slot.entry.take() {
                    out.push(e);
                }
            }
        }
        out
    }
}
