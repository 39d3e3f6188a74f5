//! Index sorting: ordering documents within a segment by a numeric doc
//! values field.

use serde::{Deserialize, Serialize};

/// Sort applied to every segment's documents at flush and merge time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSort {
    /// Numeric doc values field to sort on.
    pub field: String,
    /// Descending when true.
    pub reverse: bool,
    /// Value used for documents without the field.
    pub missing_value: i64,
}

impl IndexSort {
    pub fn new<S: Into<String>>(field: S) -> Self {
        IndexSort {
            field: field.into(),
            reverse: false,
            missing_value: 0,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = !self.reverse;
        self
    }

    pub fn with_missing_value(mut self, missing_value: i64) -> Self {
        self.missing_value = missing_value;
        self
    }

    /// Compute the doc order for `values` (one entry per document).
    ///
    /// Returns `None` if the documents are already in order. Ties keep their
    /// original relative order.
    pub fn sort(&self, values: &[Option<i64>]) -> Option<DocMap> {
        let key = |doc: usize| values[doc].unwrap_or(self.missing_value);
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|a, b| {
            let ord = key(*a).cmp(&key(*b));
            if self.reverse { ord.reverse() } else { ord }
        });
        if order.iter().enumerate().all(|(i, d)| i == *d) {
            return None;
        }
        Some(DocMap::from_new_to_old(order.into_iter().map(|d| d as u32).collect()))
    }
}

/// Bidirectional document id mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocMap {
    old_to_new: Vec<u32>,
    new_to_old: Vec<u32>,
}

impl DocMap {
    pub fn from_new_to_old(new_to_old: Vec<u32>) -> Self {
        let mut old_to_new = vec![0u32; new_to_old.len()];
        for (new, old) in new_to_old.iter().enumerate() {
            old_to_new[*old as usize] = new as u32;
        }
        DocMap {
            old_to_new,
            new_to_old,
        }
    }

    pub fn old_to_new(&self, doc: u32) -> u32 {
        self.old_to_new[doc as usize]
    }

    pub fn new_to_old(&self, doc: u32) -> u32 {
        self.new_to_old[doc as usize]
    }

    pub fn len(&self) -> usize {
        self.new_to_old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.new_to_old.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_ascending_with_missing() {
        let sort = IndexSort::new("rank").with_missing_value(5);
        let map = sort.sort(&[Some(9), None, Some(1)]).unwrap();
        // new order: doc2 (1), doc1 (5), doc0 (9)
        assert_eq!(map.new_to_old(0), 2);
        assert_eq!(map.new_to_old(1), 1);
        assert_eq!(map.old_to_new(0), 2);
    }

    #[test]
    fn test_already_sorted() {
        let sort = IndexSort::new("rank");
        assert!(sort.sort(&[Some(1), Some(1), Some(2)]).is_none());
        assert!(sort.clone().reversed().sort(&[Some(1), Some(2)]).is_some());
    }
}
