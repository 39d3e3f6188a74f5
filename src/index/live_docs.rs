//! Live documents bitmap of a segment.

use bit_vec::BitVec;

use crate::error::{QuireError, Result};
use crate::index::sorter::DocMap;

/// One bit per document; set means the document is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDocs {
    bits: BitVec,
    deleted: u32,
}

impl LiveDocs {
    /// All `max_doc` documents live.
    pub fn all_live(max_doc: u32) -> Self {
        LiveDocs {
            bits: BitVec::from_elem(max_doc as usize, true),
            deleted: 0,
        }
    }

    /// Rebuild from the on-disk byte form.
    pub fn from_bytes(bytes: &[u8], max_doc: u32) -> Result<Self> {
        let mut bits = BitVec::from_bytes(bytes);
        if bits.len() < max_doc as usize {
            return Err(QuireError::corrupt(format!(
                "live docs hold {} bits, segment has {max_doc} documents",
                bits.len()
            )));
        }
        bits.truncate(max_doc as usize);
        let deleted = bits.iter().filter(|live| !live).count() as u32;
        Ok(LiveDocs { bits, deleted })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    pub fn max_doc(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_live(&self, doc: u32) -> bool {
        self.bits.get(doc as usize).unwrap_or(false)
    }

    /// Mark `doc` deleted. Returns true if it was live.
    pub fn delete(&mut self, doc: u32) -> bool {
        if self.is_live(doc) {
            self.bits.set(doc as usize, false);
            self.deleted += 1;
            true
        } else {
            false
        }
    }

    pub fn deleted_count(&self) -> u32 {
        self.deleted
    }

    pub fn live_count(&self) -> u32 {
        self.max_doc() - self.deleted
    }

    pub fn is_fully_deleted(&self) -> bool {
        self.deleted == self.max_doc()
    }

    /// Deleted documents in ascending order.
    pub fn deleted_docs(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, live)| !live)
            .map(|(doc, _)| doc as u32)
    }

    /// Documents live here but deleted in `newer`.
    pub fn newly_deleted<'a>(&'a self, newer: &'a LiveDocs) -> impl Iterator<Item = u32> + 'a {
        newer.deleted_docs().filter(move |doc| self.is_live(*doc))
    }

    /// Intersect with another bitmap of the same length.
    pub fn and(&self, other: &LiveDocs) -> LiveDocs {
        let mut bits = self.bits.clone();
        bits.and(&other.bits);
        let deleted = bits.iter().filter(|live| !live).count() as u32;
        LiveDocs { bits, deleted }
    }

    /// Reorder for a sorted segment.
    pub fn remap(&self, map: &DocMap) -> LiveDocs {
        let mut remapped = LiveDocs::all_live(self.max_doc());
        for doc in self.deleted_docs() {
            remapped.delete(map.old_to_new(doc));
        }
        remapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_and_count() {
        let mut live = LiveDocs::all_live(10);
        assert!(live.delete(3));
        assert!(!live.delete(3));
        assert!(live.delete(9));
        assert!(!live.delete(42));
        assert_eq!(live.deleted_count(), 2);
        assert_eq!(live.live_count(), 8);
        assert_eq!(live.deleted_docs().collect::<Vec<_>>(), vec![3, 9]);
    }

    #[test]
    fn test_bytes_round_trip() {
        let mut live = LiveDocs::all_live(13);
        live.delete(0);
        live.delete(12);
        let restored = LiveDocs::from_bytes(&live.to_bytes(), 13).unwrap();
        assert_eq!(restored, live);
        assert!(LiveDocs::from_bytes(&[0xff], 13).is_err());
    }

    #[test]
    fn test_newly_deleted() {
        let mut before = LiveDocs::all_live(5);
        before.delete(1);
        let mut after = before.clone();
        after.delete(4);
        after.delete(2);
        assert_eq!(before.newly_deleted(&after).collect::<Vec<_>>(), vec![2, 4]);
    }

    #[test]
    fn test_remap() {
        let mut live = LiveDocs::all_live(3);
        live.delete(0);
        let map = DocMap::from_new_to_old(vec![2, 0, 1]);
        let remapped = live.remap(&map);
        assert!(!remapped.is_live(1));
        assert!(remapped.is_live(0));
    }
}
