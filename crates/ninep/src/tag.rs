//! The client-side tag table (§4.3): a fixed-capacity array of
//! outstanding-request slots. Slot index doubles as the tag number,
//! giving O(1) lookup when a response arrives.

use crate::error::{Error, ProtoKind};
use crate::fcall::NOTAG;
use crate::utils::Result;

/// A fixed-capacity table mapping tag -> `T` (typically a pending
/// request's completion handle). `NOTAG` is never a valid allocatable
/// tag, so the table's capacity must stay below `NOTAG` (always true
/// for any sane `max_tags`).
#[derive(Debug)]
pub struct TagTable<T> {
    slots: Vec<Option<T>>,
}

impl<T> TagTable<T> {
    pub fn new(capacity: usize) -> TagTable<T> {
        assert!(
            capacity < NOTAG as usize,
            "tag table capacity must leave NOTAG unused"
        );
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        TagTable { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Allocate the first free slot, returning its index as the tag.
    /// Returns `TagExhausted` when every slot is in use.
    pub fn alloc(&mut self, value: T) -> Result<u16> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or_else(|| Error::proto(ProtoKind::TagExhausted))?;
        self.slots[idx] = Some(value);
        Ok(idx as u16)
    }

    pub fn get(&self, tag: u16) -> Option<&T> {
        self.slots.get(tag as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, tag: u16) -> Option<&mut T> {
        self.slots.get_mut(tag as usize).and_then(|s| s.as_mut())
    }

    /// Release `tag`, returning its value if it was in use.
    pub fn free(&mut self, tag: u16) -> Option<T> {
        self.slots.get_mut(tag as usize).and_then(|s| s.take())
    }

    pub fn is_in_use(&self, tag: u16) -> bool {
        self.slots
            .get(tag as usize)
            .map(|s| s.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_allocation_yields_distinct_tags() {
        let mut t: TagTable<()> = TagTable::new(16);
        let mut tags = Vec::new();
        for _ in 0..16 {
            tags.push(t.alloc(()).unwrap());
        }
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), 16);
        assert!(tags.iter().all(|&tag| tag != NOTAG));
    }

    #[test]
    fn exhaustion_reports_tag_exhausted() {
        let mut t: TagTable<()> = TagTable::new(2);
        t.alloc(()).unwrap();
        t.alloc(()).unwrap();
        let err = t.alloc(()).unwrap_err();
        assert!(matches!(err, Error::Proto(ProtoKind::TagExhausted, _)));
    }

    #[test]
    fn free_recycles_slot() {
        let mut t: TagTable<u32> = TagTable::new(2);
        let tag0 = t.alloc(10).unwrap();
        t.alloc(20).unwrap();
        t.free(tag0);
        let reused = t.alloc(30).unwrap();
        assert_eq!(reused, tag0);
        assert_eq!(*t.get(reused).unwrap(), 30);
    }
}
