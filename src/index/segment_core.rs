//! In-memory image of one segment.
//!
//! A [`SegmentCore`] is what a flush or merge produces before the codec
//! writes it, and what a reader loads back. Terms of each field are looked
//! up through an [`fst::Map`] from term bytes to the ordinal of the term's
//! posting list.

use std::collections::BTreeMap;

use fst::{Map, Streamer};

use crate::document::FieldValue;
use crate::error::{QuireError, Result};
use crate::index::field_info::{DocValuesType, FieldInfos};
use crate::index::reader::TermSource;
use crate::index::sorter::DocMap;
use crate::index::term::Term;

/// One occurrence of a term inside a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionEntry {
    pub position: u32,
    pub start_offset: u32,
    pub end_offset: u32,
    pub payload: Option<Vec<u8>>,
}

/// Postings of one term in one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub doc: u32,
    pub freq: u32,
    /// Empty unless the field indexes positions.
    pub positions: Vec<PositionEntry>,
}

/// Term dictionary and posting lists of one field.
#[derive(Debug, Clone)]
pub struct FieldTerms {
    dictionary: Map<Vec<u8>>,
    postings: Vec<Vec<Posting>>,
}

impl FieldTerms {
    /// Build from sorted terms.
    pub fn build(terms: BTreeMap<Vec<u8>, Vec<Posting>>) -> Result<Self> {
        let dictionary = Map::from_iter(
            terms
                .keys()
                .enumerate()
                .map(|(ord, term)| (term.as_slice(), ord as u64)),
        )?;
        let postings = terms.into_values().collect();
        Ok(FieldTerms {
            dictionary,
            postings,
        })
    }

    /// Rebuild from a serialized dictionary and ordinal-indexed postings.
    pub fn from_parts(fst_bytes: Vec<u8>, postings: Vec<Vec<Posting>>) -> Result<Self> {
        let dictionary = Map::new(fst_bytes)?;
        if dictionary.len() != postings.len() {
            return Err(QuireError::corrupt(format!(
                "term dictionary has {} terms but {} posting lists",
                dictionary.len(),
                postings.len()
            )));
        }
        Ok(FieldTerms {
            dictionary,
            postings,
        })
    }

    pub fn postings(&self, term: &[u8]) -> Option<&[Posting]> {
        self.dictionary
            .get(term)
            .and_then(|ord| self.postings.get(ord as usize))
            .map(|p| p.as_slice())
    }

    pub fn postings_by_ord(&self, ord: usize) -> &[Posting] {
        &self.postings[ord]
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    /// All terms in order with their ordinals.
    pub fn terms(&self) -> Vec<(Vec<u8>, usize)> {
        let mut out = Vec::with_capacity(self.len());
        let mut stream = self.dictionary.stream();
        while let Some((term, ord)) = stream.next() {
            out.push((term.to_vec(), ord as usize));
        }
        out
    }

    pub fn fst_bytes(&self) -> &[u8] {
        self.dictionary.as_fst().as_bytes()
    }

    /// Renumber documents and keep each posting list sorted by doc.
    fn remap(&self, map: &DocMap) -> FieldTerms {
        let postings = self
            .postings
            .iter()
            .map(|list| {
                let mut list: Vec<Posting> = list
                    .iter()
                    .map(|p| Posting {
                        doc: map.old_to_new(p.doc),
                        ..p.clone()
                    })
                    .collect();
                list.sort_by_key(|p| p.doc);
                list
            })
            .collect();
        FieldTerms {
            dictionary: self.dictionary.clone(),
            postings,
        }
    }
}

/// Column of per-document values for one field.
#[derive(Debug, Clone, PartialEq)]
pub enum DocValuesColumn {
    Numeric(Vec<Option<i64>>),
    Binary(Vec<Option<Vec<u8>>>),
    Sorted(Vec<Option<Vec<u8>>>),
    SortedNumeric(Vec<Vec<i64>>),
    SortedSet(Vec<Vec<Vec<u8>>>),
}

impl DocValuesColumn {
    /// Column of `dv_type` with no values for `max_doc` documents.
    pub fn empty(dv_type: DocValuesType, max_doc: u32) -> Result<Self> {
        let n = max_doc as usize;
        Ok(match dv_type {
            DocValuesType::Numeric => DocValuesColumn::Numeric(vec![None; n]),
            DocValuesType::Binary => DocValuesColumn::Binary(vec![None; n]),
            DocValuesType::Sorted => DocValuesColumn::Sorted(vec![None; n]),
            DocValuesType::SortedNumeric => DocValuesColumn::SortedNumeric(vec![Vec::new(); n]),
            DocValuesType::SortedSet => DocValuesColumn::SortedSet(vec![Vec::new(); n]),
            DocValuesType::None => {
                return Err(QuireError::invalid_argument(
                    "cannot build a doc values column of type None",
                ));
            }
        })
    }

    pub fn dv_type(&self) -> DocValuesType {
        match self {
            DocValuesColumn::Numeric(_) => DocValuesType::Numeric,
            DocValuesColumn::Binary(_) => DocValuesType::Binary,
            DocValuesColumn::Sorted(_) => DocValuesType::Sorted,
            DocValuesColumn::SortedNumeric(_) => DocValuesType::SortedNumeric,
            DocValuesColumn::SortedSet(_) => DocValuesType::SortedSet,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DocValuesColumn::Numeric(v) => v.len(),
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => v.len(),
            DocValuesColumn::SortedNumeric(v) => v.len(),
            DocValuesColumn::SortedSet(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn numeric(&self, doc: u32) -> Option<i64> {
        match self {
            DocValuesColumn::Numeric(v) => v.get(doc as usize).copied().flatten(),
            DocValuesColumn::SortedNumeric(v) => {
                v.get(doc as usize).and_then(|vals| vals.first().copied())
            }
            _ => None,
        }
    }

    pub fn binary(&self, doc: u32) -> Option<&[u8]> {
        match self {
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => {
                v.get(doc as usize).and_then(|b| b.as_deref())
            }
            DocValuesColumn::SortedSet(v) => {
                v.get(doc as usize).and_then(|vals| vals.first().map(|b| b.as_slice()))
            }
            _ => None,
        }
    }

    pub fn has_value(&self, doc: u32) -> bool {
        let i = doc as usize;
        match self {
            DocValuesColumn::Numeric(v) => v.get(i).is_some_and(|x| x.is_some()),
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => {
                v.get(i).is_some_and(|x| x.is_some())
            }
            DocValuesColumn::SortedNumeric(v) => v.get(i).is_some_and(|x| !x.is_empty()),
            DocValuesColumn::SortedSet(v) => v.get(i).is_some_and(|x| !x.is_empty()),
        }
    }

    /// Add one value of a document. Single valued kinds reject a second value.
    pub fn add(&mut self, doc: u32, value: &FieldValue, field: &str) -> Result<()> {
        let i = doc as usize;
        let dv_type = self.dv_type();
        let mismatch = || {
            QuireError::invalid_argument(format!(
                "value {value:?} does not fit {dv_type:?} doc values of field \"{field}\""
            ))
        };
        let duplicate = || {
            QuireError::invalid_argument(format!(
                "doc values field \"{field}\" appears more than once in this document \
                 (only one value is allowed per field)"
            ))
        };
        match self {
            DocValuesColumn::Numeric(v) => {
                let value = numeric_value(value).ok_or_else(mismatch)?;
                grow(v, i + 1, None);
                if v[i].is_some() {
                    return Err(duplicate());
                }
                v[i] = Some(value);
            }
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => {
                let value = value.as_bytes().ok_or_else(mismatch)?.to_vec();
                grow(v, i + 1, None);
                if v[i].is_some() {
                    return Err(duplicate());
                }
                v[i] = Some(value);
            }
            DocValuesColumn::SortedNumeric(v) => {
                let value = numeric_value(value).ok_or_else(mismatch)?;
                grow(v, i + 1, Vec::new());
                let vals = &mut v[i];
                let at = vals.partition_point(|x| *x <= value);
                vals.insert(at, value);
            }
            DocValuesColumn::SortedSet(v) => {
                let value = value.as_bytes().ok_or_else(mismatch)?.to_vec();
                grow(v, i + 1, Vec::new());
                let vals = &mut v[i];
                if let Err(at) = vals.binary_search(&value) {
                    vals.insert(at, value);
                }
            }
        }
        Ok(())
    }

    /// Pad with missing values up to `max_doc` documents.
    pub fn pad(&mut self, max_doc: u32) {
        let n = max_doc as usize;
        match self {
            DocValuesColumn::Numeric(v) => grow(v, n, None),
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => grow(v, n, None),
            DocValuesColumn::SortedNumeric(v) => grow(v, n, Vec::new()),
            DocValuesColumn::SortedSet(v) => grow(v, n, Vec::new()),
        }
    }

    /// Replace the numeric value of a document; `None` clears it.
    pub fn set_numeric(&mut self, doc: u32, value: Option<i64>) -> Result<()> {
        match self {
            DocValuesColumn::Numeric(v) => {
                let slot = v.get_mut(doc as usize).ok_or_else(|| out_of_range(doc))?;
                *slot = value;
                Ok(())
            }
            other => Err(QuireError::invalid_argument(format!(
                "cannot apply a numeric update to {:?} doc values",
                other.dv_type()
            ))),
        }
    }

    /// Replace the binary value of a document; `None` clears it.
    pub fn set_binary(&mut self, doc: u32, value: Option<Vec<u8>>) -> Result<()> {
        match self {
            DocValuesColumn::Binary(v) => {
                let slot = v.get_mut(doc as usize).ok_or_else(|| out_of_range(doc))?;
                *slot = value;
                Ok(())
            }
            other => Err(QuireError::invalid_argument(format!(
                "cannot apply a binary update to {:?} doc values",
                other.dv_type()
            ))),
        }
    }

    /// Values of `docs`, in that order.
    pub fn select(&self, docs: &[u32]) -> DocValuesColumn {
        fn pick<T: Clone>(v: &[T], docs: &[u32]) -> Vec<T> {
            docs.iter().map(|d| v[*d as usize].clone()).collect()
        }
        match self {
            DocValuesColumn::Numeric(v) => DocValuesColumn::Numeric(pick(v, docs)),
            DocValuesColumn::Binary(v) => DocValuesColumn::Binary(pick(v, docs)),
            DocValuesColumn::Sorted(v) => DocValuesColumn::Sorted(pick(v, docs)),
            DocValuesColumn::SortedNumeric(v) => DocValuesColumn::SortedNumeric(pick(v, docs)),
            DocValuesColumn::SortedSet(v) => DocValuesColumn::SortedSet(pick(v, docs)),
        }
    }

    /// Append the values of another column of the same type.
    pub fn extend(&mut self, other: DocValuesColumn) -> Result<()> {
        match (self, other) {
            (DocValuesColumn::Numeric(a), DocValuesColumn::Numeric(b)) => a.extend(b),
            (DocValuesColumn::Binary(a), DocValuesColumn::Binary(b)) => a.extend(b),
            (DocValuesColumn::Sorted(a), DocValuesColumn::Sorted(b)) => a.extend(b),
            (DocValuesColumn::SortedNumeric(a), DocValuesColumn::SortedNumeric(b)) => a.extend(b),
            (DocValuesColumn::SortedSet(a), DocValuesColumn::SortedSet(b)) => a.extend(b),
            (a, b) => {
                return Err(QuireError::invalid_argument(format!(
                    "cannot combine {:?} and {:?} doc values",
                    a.dv_type(),
                    b.dv_type()
                )));
            }
        }
        Ok(())
    }

    /// Column reordered for a sorted segment.
    pub fn remap(&self, map: &DocMap) -> DocValuesColumn {
        let new_to_old: Vec<u32> = (0..map.len() as u32).map(|d| map.new_to_old(d)).collect();
        self.select(&new_to_old)
    }

    pub fn ram_bytes(&self) -> usize {
        match self {
            DocValuesColumn::Numeric(v) => v.len() * 16,
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => v
                .iter()
                .map(|b| 24 + b.as_ref().map_or(0, |b| b.len()))
                .sum(),
            DocValuesColumn::SortedNumeric(v) => v.iter().map(|x| 24 + x.len() * 8).sum(),
            DocValuesColumn::SortedSet(v) => v
                .iter()
                .map(|x| 24 + x.iter().map(|b| 24 + b.len()).sum::<usize>())
                .sum(),
        }
    }
}

fn grow<T: Clone>(v: &mut Vec<T>, len: usize, fill: T) {
    if v.len() < len {
        v.resize(len, fill);
    }
}

fn out_of_range(doc: u32) -> QuireError {
    QuireError::invalid_argument(format!("document {doc} is out of range"))
}

/// Numeric doc value of a field value. Floats are stored by their bits.
pub fn numeric_value(value: &FieldValue) -> Option<i64> {
    match value {
        FieldValue::Int(v) => Some(*v as i64),
        FieldValue::Long(v) => Some(*v),
        FieldValue::Float(v) => Some(v.to_bits() as i64),
        FieldValue::Double(v) => Some(v.to_bits() as i64),
        _ => None,
    }
}

/// Stored values of one document as `(field number, value)` pairs.
pub type StoredFields = Vec<(u32, FieldValue)>;

/// One segment held in memory.
#[derive(Debug, Clone)]
pub struct SegmentCore {
    max_doc: u32,
    field_infos: FieldInfos,
    terms: BTreeMap<u32, FieldTerms>,
    stored: Vec<StoredFields>,
    /// Field length per document for fields with norms.
    norms: BTreeMap<u32, Vec<u32>>,
    doc_values: BTreeMap<u32, DocValuesColumn>,
}

impl SegmentCore {
    pub fn new(
        max_doc: u32,
        field_infos: FieldInfos,
        terms: BTreeMap<u32, FieldTerms>,
        stored: Vec<StoredFields>,
        norms: BTreeMap<u32, Vec<u32>>,
        doc_values: BTreeMap<u32, DocValuesColumn>,
    ) -> Result<Self> {
        if stored.len() != max_doc as usize {
            return Err(QuireError::corrupt(format!(
                "{} stored documents for maxDoc={max_doc}",
                stored.len()
            )));
        }
        for (field, column) in &doc_values {
            if column.len() != max_doc as usize {
                return Err(QuireError::corrupt(format!(
                    "doc values of field {field} hold {} documents, maxDoc={max_doc}",
                    column.len()
                )));
            }
        }
        Ok(SegmentCore {
            max_doc,
            field_infos,
            terms,
            stored,
            norms,
            doc_values,
        })
    }

    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }

    pub fn field_infos(&self) -> &FieldInfos {
        &self.field_infos
    }

    pub fn field_terms(&self, field: u32) -> Option<&FieldTerms> {
        self.terms.get(&field)
    }

    pub fn all_field_terms(&self) -> &BTreeMap<u32, FieldTerms> {
        &self.terms
    }

    pub fn stored(&self, doc: u32) -> &[(u32, FieldValue)] {
        self.stored
            .get(doc as usize)
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    pub fn all_stored(&self) -> &[StoredFields] {
        &self.stored
    }

    pub fn norm(&self, field: u32, doc: u32) -> Option<u32> {
        self.norms.get(&field).and_then(|n| n.get(doc as usize)).copied()
    }

    pub fn all_norms(&self) -> &BTreeMap<u32, Vec<u32>> {
        &self.norms
    }

    pub fn doc_values(&self, field: u32) -> Option<&DocValuesColumn> {
        self.doc_values.get(&field)
    }

    pub fn all_doc_values(&self) -> &BTreeMap<u32, DocValuesColumn> {
        &self.doc_values
    }

    /// Mutable column, created empty if the field has none yet.
    pub fn doc_values_mut(
        &mut self,
        field: u32,
        dv_type: DocValuesType,
    ) -> Result<&mut DocValuesColumn> {
        if !self.doc_values.contains_key(&field) {
            let column = DocValuesColumn::empty(dv_type, self.max_doc)?;
            self.doc_values.insert(field, column);
        }
        self.doc_values
            .get_mut(&field)
            .ok_or_else(|| QuireError::internal("doc values column vanished"))
    }

    pub fn set_field_infos(&mut self, field_infos: FieldInfos) {
        self.field_infos = field_infos;
    }

    /// Copy of this segment with documents in `map` order.
    pub fn sorted(&self, map: &DocMap) -> SegmentCore {
        let terms = self
            .terms
            .iter()
            .map(|(f, t)| (*f, t.remap(map)))
            .collect();
        let stored = (0..self.max_doc)
            .map(|d| self.stored[map.new_to_old(d) as usize].clone())
            .collect();
        let norms = self
            .norms
            .iter()
            .map(|(f, n)| {
                let sorted = (0..self.max_doc)
                    .map(|d| n.get(map.new_to_old(d) as usize).copied().unwrap_or(0))
                    .collect();
                (*f, sorted)
            })
            .collect();
        let doc_values = self
            .doc_values
            .iter()
            .map(|(f, c)| (*f, c.remap(map)))
            .collect();
        SegmentCore {
            max_doc: self.max_doc,
            field_infos: self.field_infos.clone(),
            terms,
            stored,
            norms,
            doc_values,
        }
    }

    /// Numeric values of a field, one slot per document.
    pub fn numeric_values(&self, field: &str) -> Vec<Option<i64>> {
        let column = self
            .field_infos
            .by_name(field)
            .and_then(|info| self.doc_values.get(&info.number));
        (0..self.max_doc)
            .map(|d| column.and_then(|c| c.numeric(d)))
            .collect()
    }
}

impl TermSource for SegmentCore {
    fn max_doc(&self) -> u32 {
        self.max_doc
    }

    fn postings(&self, term: &Term) -> Option<&[Posting]> {
        let info = self.field_infos.by_name(term.field())?;
        self.terms.get(&info.number)?.postings(term.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::field_info::{FieldInfo, IndexOptions};

    fn posting(doc: u32) -> Posting {
        Posting {
            doc,
            freq: 1,
            positions: Vec::new(),
        }
    }

    #[test]
    fn test_field_terms_lookup() {
        let mut terms = BTreeMap::new();
        terms.insert(b"banana".to_vec(), vec![posting(1)]);
        terms.insert(b"apple".to_vec(), vec![posting(0), posting(2)]);
        let field = FieldTerms::build(terms).unwrap();

        assert_eq!(field.len(), 2);
        assert_eq!(field.postings(b"apple").unwrap().len(), 2);
        assert!(field.postings(b"cherry").is_none());
        let order: Vec<Vec<u8>> = field.terms().into_iter().map(|(t, _)| t).collect();
        assert_eq!(order, vec![b"apple".to_vec(), b"banana".to_vec()]);

        let copy =
            FieldTerms::from_parts(field.fst_bytes().to_vec(), vec![vec![], vec![posting(3)]])
                .unwrap();
        assert_eq!(copy.postings(b"banana").unwrap()[0].doc, 3);
    }

    #[test]
    fn test_doc_values_single_valued() {
        let mut column = DocValuesColumn::empty(DocValuesType::Numeric, 0).unwrap();
        column.add(1, &FieldValue::Long(7), "n").unwrap();
        assert!(column.add(1, &FieldValue::Long(8), "n").is_err());
        assert!(column.add(2, &FieldValue::Text("x".into()), "n").is_err());
        column.pad(4);
        assert_eq!(column.len(), 4);
        assert_eq!(column.numeric(0), None);
        assert_eq!(column.numeric(1), Some(7));

        column.set_numeric(1, None).unwrap();
        assert!(!column.has_value(1));
        assert!(column.set_binary(0, Some(vec![1])).is_err());
    }

    #[test]
    fn test_sorted_set_dedups() {
        let mut column = DocValuesColumn::empty(DocValuesType::SortedSet, 1).unwrap();
        column.add(0, &FieldValue::Text("b".into()), "tags").unwrap();
        column.add(0, &FieldValue::Text("a".into()), "tags").unwrap();
        column.add(0, &FieldValue::Text("b".into()), "tags").unwrap();
        assert_eq!(
            column,
            DocValuesColumn::SortedSet(vec![vec![b"a".to_vec(), b"b".to_vec()]])
        );
    }

    #[test]
    fn test_sorted_core() {
        let mut info = FieldInfo::new("id", 0);
        info.index_options = IndexOptions::Docs;
        let field_infos = FieldInfos::new(vec![info]).unwrap();
        let mut terms = BTreeMap::new();
        terms.insert(b"a".to_vec(), vec![posting(0), posting(2)]);
        let mut field_terms = BTreeMap::new();
        field_terms.insert(0, FieldTerms::build(terms).unwrap());
        let stored = (0..3)
            .map(|d| vec![(0, FieldValue::Long(d))])
            .collect::<Vec<_>>();
        let core = SegmentCore::new(
            3,
            field_infos,
            field_terms,
            stored,
            BTreeMap::new(),
            BTreeMap::new(),
        )
        .unwrap();

        let map = DocMap::from_new_to_old(vec![2, 1, 0]);
        let sorted = core.sorted(&map);
        assert_eq!(sorted.stored(0), &[(0, FieldValue::Long(2))]);
        let docs: Vec<u32> = sorted
            .postings(&Term::text("id", "a"))
            .unwrap()
            .iter()
            .map(|p| p.doc)
            .collect();
        assert_eq!(docs, vec![0, 2]);
    }
}
