//! Field schema records and the global field number allocator.
//!
//! Every field name maps to one number for the life of an index. Numbers are
//! handed out by [`FieldNumbers`], which is shared by all per-thread writers
//! and merges so that concurrently built segments agree on field identity.
//! Each segment carries its own [`FieldInfos`] describing the fields it
//! actually contains.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::document::FieldType;
use crate::error::{QuireError, Result};

/// What the inverted index records for a field. Ordered by richness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexOptions {
    None,
    Docs,
    DocsAndFreqs,
    DocsAndFreqsAndPositions,
    DocsAndFreqsAndPositionsAndOffsets,
}

impl IndexOptions {
    pub fn has_freqs(self) -> bool {
        self >= IndexOptions::DocsAndFreqs
    }

    pub fn has_positions(self) -> bool {
        self >= IndexOptions::DocsAndFreqsAndPositions
    }

    pub fn has_offsets(self) -> bool {
        self >= IndexOptions::DocsAndFreqsAndPositionsAndOffsets
    }

    pub fn to_u8(self) -> u8 {
        match self {
            IndexOptions::None => 0,
            IndexOptions::Docs => 1,
            IndexOptions::DocsAndFreqs => 2,
            IndexOptions::DocsAndFreqsAndPositions => 3,
            IndexOptions::DocsAndFreqsAndPositionsAndOffsets => 4,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => IndexOptions::None,
            1 => IndexOptions::Docs,
            2 => IndexOptions::DocsAndFreqs,
            3 => IndexOptions::DocsAndFreqsAndPositions,
            4 => IndexOptions::DocsAndFreqsAndPositionsAndOffsets,
            other => return Err(QuireError::corrupt(format!("invalid index options {other}"))),
        })
    }
}

/// Columnar per-document value kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocValuesType {
    None,
    Numeric,
    Binary,
    Sorted,
    SortedNumeric,
    SortedSet,
}

impl DocValuesType {
    pub fn to_u8(self) -> u8 {
        match self {
            DocValuesType::None => 0,
            DocValuesType::Numeric => 1,
            DocValuesType::Binary => 2,
            DocValuesType::Sorted => 3,
            DocValuesType::SortedNumeric => 4,
            DocValuesType::SortedSet => 5,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => DocValuesType::None,
            1 => DocValuesType::Numeric,
            2 => DocValuesType::Binary,
            3 => DocValuesType::Sorted,
            4 => DocValuesType::SortedNumeric,
            5 => DocValuesType::SortedSet,
            other => {
                return Err(QuireError::corrupt(format!(
                    "invalid doc values type {other}"
                )));
            }
        })
    }
}

/// Similarity used by vector fields. Recorded as metadata only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VectorSimilarity {
    #[default]
    Euclidean,
    DotProduct,
    Cosine,
}

impl VectorSimilarity {
    pub fn to_u8(self) -> u8 {
        match self {
            VectorSimilarity::Euclidean => 0,
            VectorSimilarity::DotProduct => 1,
            VectorSimilarity::Cosine => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => VectorSimilarity::Euclidean,
            1 => VectorSimilarity::DotProduct,
            2 => VectorSimilarity::Cosine,
            other => {
                return Err(QuireError::corrupt(format!(
                    "invalid vector similarity {other}"
                )));
            }
        })
    }
}

/// Schema of one field within one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub number: u32,
    pub index_options: IndexOptions,
    pub doc_values_type: DocValuesType,
    pub store_term_vectors: bool,
    pub omit_norms: bool,
    pub store_payloads: bool,
    pub point_dimension_count: u32,
    pub point_index_dimension_count: u32,
    pub point_num_bytes: u32,
    pub vector_dimension: u32,
    pub vector_similarity: VectorSimilarity,
    pub soft_deletes_field: bool,
    /// Codec attributes.
    pub attributes: BTreeMap<String, String>,
    /// Generation of the doc values update holding this field, or -1.
    pub dv_gen: i64,
}

impl FieldInfo {
    pub fn new<S: Into<String>>(name: S, number: u32) -> Self {
        FieldInfo {
            name: name.into(),
            number,
            index_options: IndexOptions::None,
            doc_values_type: DocValuesType::None,
            store_term_vectors: false,
            omit_norms: false,
            store_payloads: false,
            point_dimension_count: 0,
            point_index_dimension_count: 0,
            point_num_bytes: 0,
            vector_dimension: 0,
            vector_similarity: VectorSimilarity::default(),
            soft_deletes_field: false,
            attributes: BTreeMap::new(),
            dv_gen: -1,
        }
    }

    /// Record that this field has doc values of `dv_type`.
    ///
    /// `None` never clears an existing type. Moving from one concrete type to
    /// another is rejected.
    pub fn set_doc_values_type(&mut self, dv_type: DocValuesType) -> Result<()> {
        if dv_type == DocValuesType::None {
            return Ok(());
        }
        if self.doc_values_type != DocValuesType::None && self.doc_values_type != dv_type {
            return Err(QuireError::invalid_argument(format!(
                "cannot change DocValues type from {:?} to {:?} for field \"{}\"",
                self.doc_values_type, dv_type, self.name
            )));
        }
        self.doc_values_type = dv_type;
        Ok(())
    }

    /// Record the index options of a new instance of this field.
    pub fn set_index_options(&mut self, options: IndexOptions) -> Result<()> {
        if options == IndexOptions::None {
            return Ok(());
        }
        if self.index_options != IndexOptions::None && self.index_options != options {
            return Err(QuireError::invalid_argument(format!(
                "cannot change index options from {:?} to {:?} for field \"{}\"",
                self.index_options, options, self.name
            )));
        }
        self.index_options = options;
        if !options.has_positions() {
            self.store_payloads = false;
        }
        Ok(())
    }

    /// Merge the options of one field instance into this record.
    pub fn update(&mut self, field_type: &FieldType) -> Result<()> {
        self.set_index_options(field_type.index_options)?;
        self.set_doc_values_type(field_type.doc_values_type)?;
        if field_type.is_indexed() {
            self.omit_norms |= field_type.omit_norms;
            self.store_term_vectors |= field_type.store_term_vectors;
            if field_type.store_payloads && self.index_options.has_positions() {
                self.store_payloads = true;
            }
        }
        self.set_point_dimensions(field_type.point_dimension_count, field_type.point_num_bytes)?;
        self.set_vector_dimension(field_type.vector_dimension)?;
        Ok(())
    }

    pub fn set_point_dimensions(&mut self, dims: u32, num_bytes: u32) -> Result<()> {
        if dims == 0 {
            return Ok(());
        }
        if self.point_dimension_count != 0
            && (self.point_dimension_count != dims || self.point_num_bytes != num_bytes)
        {
            return Err(QuireError::invalid_argument(format!(
                "cannot change point dimensions from {}x{} to {}x{} for field \"{}\"",
                self.point_dimension_count, self.point_num_bytes, dims, num_bytes, self.name
            )));
        }
        self.point_dimension_count = dims;
        self.point_index_dimension_count = dims;
        self.point_num_bytes = num_bytes;
        Ok(())
    }

    pub fn set_vector_dimension(&mut self, dims: u32) -> Result<()> {
        if dims == 0 {
            return Ok(());
        }
        if self.vector_dimension != 0 && self.vector_dimension != dims {
            return Err(QuireError::invalid_argument(format!(
                "cannot change vector dimension from {} to {} for field \"{}\"",
                self.vector_dimension, dims, self.name
            )));
        }
        self.vector_dimension = dims;
        Ok(())
    }

    pub fn is_indexed(&self) -> bool {
        self.index_options != IndexOptions::None
    }

    pub fn has_norms(&self) -> bool {
        self.is_indexed() && !self.omit_norms
    }

    pub fn has_doc_values(&self) -> bool {
        self.doc_values_type != DocValuesType::None
    }

    /// Merge another segment's record of the same field (used by merges).
    pub fn absorb(&mut self, other: &FieldInfo) -> Result<()> {
        self.set_index_options(other.index_options)?;
        self.set_doc_values_type(other.doc_values_type)?;
        self.omit_norms |= other.omit_norms && other.is_indexed();
        self.store_term_vectors |= other.store_term_vectors;
        self.store_payloads |= other.store_payloads;
        self.set_point_dimensions(other.point_dimension_count, other.point_num_bytes)?;
        self.set_vector_dimension(other.vector_dimension)?;
        self.soft_deletes_field |= other.soft_deletes_field;
        for (k, v) in &other.attributes {
            self.attributes.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Ok(())
    }
}

/// Immutable collection of field records for one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldInfos {
    by_number: BTreeMap<u32, FieldInfo>,
    by_name: HashMap<String, u32>,
}

impl FieldInfos {
    pub fn new(infos: Vec<FieldInfo>) -> Result<Self> {
        let mut by_number = BTreeMap::new();
        let mut by_name = HashMap::new();
        for info in infos {
            if let Some(prev) = by_name.insert(info.name.clone(), info.number) {
                return Err(QuireError::corrupt(format!(
                    "duplicate field name \"{}\" (numbers {} and {})",
                    info.name, prev, info.number
                )));
            }
            if by_number.contains_key(&info.number) {
                return Err(QuireError::corrupt(format!(
                    "duplicate field number {} for \"{}\"",
                    info.number, info.name
                )));
            }
            by_number.insert(info.number, info);
        }
        Ok(FieldInfos { by_number, by_name })
    }

    pub fn by_name(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name).and_then(|n| self.by_number.get(n))
    }

    pub fn by_number(&self, number: u32) -> Option<&FieldInfo> {
        self.by_number.get(&number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.by_number.values()
    }

    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }

    pub fn has_doc_values(&self) -> bool {
        self.iter().any(FieldInfo::has_doc_values)
    }

    pub fn has_norms(&self) -> bool {
        self.iter().any(FieldInfo::has_norms)
    }

    pub fn has_postings(&self) -> bool {
        self.iter().any(FieldInfo::is_indexed)
    }

    pub fn soft_deletes_field(&self) -> Option<&str> {
        self.iter()
            .find(|f| f.soft_deletes_field)
            .map(|f| f.name.as_str())
    }

    /// Copy with the doc values generation of `field` replaced.
    pub fn with_dv_gen(&self, field: &str, dv_gen: i64) -> Result<FieldInfos> {
        let mut copy = self.clone();
        let number = *copy
            .by_name
            .get(field)
            .ok_or_else(|| QuireError::invalid_argument(format!("unknown field \"{field}\"")))?;
        if let Some(info) = copy.by_number.get_mut(&number) {
            info.dv_gen = dv_gen;
        }
        Ok(copy)
    }

    /// Copy with a field record added or replaced.
    pub fn with_field(&self, info: FieldInfo) -> Result<FieldInfos> {
        let mut infos: Vec<FieldInfo> = self
            .iter()
            .filter(|f| f.number != info.number)
            .cloned()
            .collect();
        infos.push(info);
        FieldInfos::new(infos)
    }
}

#[derive(Debug, Default)]
struct FieldNumbersInner {
    name_to_number: HashMap<String, u32>,
    number_to_name: HashMap<u32, String>,
    index_options: HashMap<String, IndexOptions>,
    doc_values_types: HashMap<String, DocValuesType>,
    soft_deletes_field: Option<String>,
    lowest_unassigned: u32,
}

/// Global, mutex-guarded field number allocator.
///
/// The whole read-check-assign sequence runs under one lock so that two
/// writers registering the same new field concurrently get the same number.
#[derive(Debug, Default)]
pub struct FieldNumbers {
    inner: Mutex<FieldNumbersInner>,
}

impl FieldNumbers {
    pub fn new(soft_deletes_field: Option<String>) -> Self {
        FieldNumbers {
            inner: Mutex::new(FieldNumbersInner {
                soft_deletes_field,
                ..Default::default()
            }),
        }
    }

    /// Return the number for `name`, assigning one if needed.
    ///
    /// `preferred` is used when it is still free, so numbers survive a reopen.
    /// Index options and doc values types are validated against every earlier
    /// registration of the field.
    pub fn add_or_get(
        &self,
        name: &str,
        preferred: Option<u32>,
        index_options: IndexOptions,
        dv_type: DocValuesType,
        is_soft_deletes_field: bool,
    ) -> Result<u32> {
        let mut inner = self.inner.lock();

        if index_options != IndexOptions::None {
            if let Some(current) = inner.index_options.get(name) {
                if *current != IndexOptions::None && *current != index_options {
                    return Err(QuireError::invalid_argument(format!(
                        "cannot change index options from {current:?} to {index_options:?} for field \"{name}\""
                    )));
                }
            }
        }
        if dv_type != DocValuesType::None {
            if let Some(current) = inner.doc_values_types.get(name) {
                if *current != DocValuesType::None && *current != dv_type {
                    return Err(QuireError::invalid_argument(format!(
                        "cannot change DocValues type from {current:?} to {dv_type:?} for field \"{name}\""
                    )));
                }
            }
        }

        let configured_soft = inner.soft_deletes_field.as_deref() == Some(name);
        if is_soft_deletes_field && !configured_soft {
            return Err(QuireError::invalid_argument(format!(
                "field \"{name}\" is marked as soft deletes field but the configured one is {:?}",
                inner.soft_deletes_field
            )));
        }

        if index_options != IndexOptions::None {
            inner.index_options.insert(name.to_string(), index_options);
        }
        if dv_type != DocValuesType::None {
            inner.doc_values_types.insert(name.to_string(), dv_type);
        }

        if let Some(number) = inner.name_to_number.get(name) {
            return Ok(*number);
        }

        let number = match preferred {
            Some(p) if !inner.number_to_name.contains_key(&p) => p,
            _ => {
                while inner.number_to_name.contains_key(&inner.lowest_unassigned) {
                    inner.lowest_unassigned += 1;
                }
                inner.lowest_unassigned
            }
        };
        inner.name_to_number.insert(name.to_string(), number);
        inner.number_to_name.insert(number, name.to_string());
        Ok(number)
    }

    /// Register every field of an existing segment.
    pub fn register_all(&self, infos: &FieldInfos) -> Result<()> {
        for info in infos.iter() {
            let number = self.add_or_get(
                &info.name,
                Some(info.number),
                info.index_options,
                info.doc_values_type,
                info.soft_deletes_field,
            )?;
            if number != info.number {
                return Err(QuireError::corrupt(format!(
                    "field \"{}\" has number {} in a segment but {} globally",
                    info.name, info.number, number
                )));
            }
        }
        Ok(())
    }

    /// Check that `name` exists with doc values of `dv_type`.
    pub fn verify_doc_values_type(&self, name: &str, dv_type: DocValuesType) -> Result<()> {
        let inner = self.inner.lock();
        match inner.doc_values_types.get(name) {
            Some(current) if *current == dv_type => Ok(()),
            Some(current) => Err(QuireError::invalid_argument(format!(
                "can only update existing {dv_type:?} doc values, field \"{name}\" is {current:?}"
            ))),
            None => Err(QuireError::invalid_argument(format!(
                "can only update existing doc values fields, \"{name}\" has none"
            ))),
        }
    }

    pub fn number_of(&self, name: &str) -> Option<u32> {
        self.inner.lock().name_to_number.get(name).copied()
    }

    pub fn soft_deletes_field(&self) -> Option<String> {
        self.inner.lock().soft_deletes_field.clone()
    }

    /// Forget every field (used by delete-all).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let soft = inner.soft_deletes_field.take();
        *inner = FieldNumbersInner {
            soft_deletes_field: soft,
            ..Default::default()
        };
    }
}

/// Accumulates the field records of one segment under construction.
#[derive(Debug)]
pub struct FieldInfosBuilder {
    global: Arc<FieldNumbers>,
    infos: BTreeMap<u32, FieldInfo>,
    by_name: HashMap<String, u32>,
}

impl FieldInfosBuilder {
    pub fn new(global: Arc<FieldNumbers>) -> Self {
        FieldInfosBuilder {
            global,
            infos: BTreeMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Validate one field instance and return its number.
    ///
    /// Nothing is recorded if validation fails.
    pub fn add_field(&mut self, name: &str, field_type: &FieldType) -> Result<u32> {
        let existing = self.by_name.get(name).and_then(|n| self.infos.get(n));
        let mut candidate = match existing {
            Some(info) => info.clone(),
            None => FieldInfo::new(name, u32::MAX),
        };
        candidate.update(field_type)?;

        let is_soft = self.global.soft_deletes_field().as_deref() == Some(name);
        let number = self.global.add_or_get(
            name,
            existing.map(|i| i.number),
            field_type.index_options,
            field_type.doc_values_type,
            false,
        )?;
        candidate.number = number;
        candidate.soft_deletes_field = is_soft;
        self.by_name.insert(name.to_string(), number);
        self.infos.insert(number, candidate);
        Ok(number)
    }

    /// Add a field record taken from another segment (merges).
    pub fn absorb(&mut self, other: &FieldInfo) -> Result<u32> {
        let number = self.global.add_or_get(
            &other.name,
            Some(other.number),
            other.index_options,
            other.doc_values_type,
            other.soft_deletes_field,
        )?;
        match self.infos.get_mut(&number) {
            Some(info) => info.absorb(other)?,
            None => {
                let mut info = other.clone();
                info.number = number;
                info.dv_gen = -1;
                self.infos.insert(number, info);
                self.by_name.insert(other.name.clone(), number);
            }
        }
        Ok(number)
    }

    pub fn get(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name).and_then(|n| self.infos.get(n))
    }

    pub fn get_by_number(&self, number: u32) -> Option<&FieldInfo> {
        self.infos.get(&number)
    }

    pub fn finish(&self) -> Result<FieldInfos> {
        FieldInfos::new(self.infos.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_values_transition() {
        let mut info = FieldInfo::new("f", 0);
        info.set_doc_values_type(DocValuesType::Numeric).unwrap();
        info.set_doc_values_type(DocValuesType::None).unwrap();
        assert_eq!(info.doc_values_type, DocValuesType::Numeric);
        info.set_doc_values_type(DocValuesType::Numeric).unwrap();
        assert!(info.set_doc_values_type(DocValuesType::Binary).is_err());
        assert_eq!(info.doc_values_type, DocValuesType::Numeric);
    }

    #[test]
    fn test_field_numbers_stable() {
        let numbers = FieldNumbers::new(None);
        let a = numbers
            .add_or_get("a", None, IndexOptions::Docs, DocValuesType::None, false)
            .unwrap();
        let b = numbers
            .add_or_get("b", None, IndexOptions::Docs, DocValuesType::None, false)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(
            numbers
                .add_or_get("a", Some(9), IndexOptions::Docs, DocValuesType::None, false)
                .unwrap(),
            a
        );
        let c = numbers
            .add_or_get("c", Some(7), IndexOptions::None, DocValuesType::None, false)
            .unwrap();
        assert_eq!(c, 7);
    }

    #[test]
    fn test_field_numbers_reject_schema_change() {
        let numbers = FieldNumbers::new(None);
        numbers
            .add_or_get("f", None, IndexOptions::None, DocValuesType::Numeric, false)
            .unwrap();
        let err = numbers.add_or_get("f", None, IndexOptions::None, DocValuesType::Sorted, false);
        assert!(matches!(err, Err(QuireError::InvalidArgument(_))));
        numbers
            .add_or_get("f", None, IndexOptions::Docs, DocValuesType::None, false)
            .unwrap();
        assert!(
            numbers
                .add_or_get("f", None, IndexOptions::DocsAndFreqs, DocValuesType::None, false)
                .is_err()
        );
    }

    #[test]
    fn test_builder_shares_numbers() {
        let global = Arc::new(FieldNumbers::new(None));
        let mut first = FieldInfosBuilder::new(global.clone());
        let mut second = FieldInfosBuilder::new(global.clone());

        let x1 = first.add_field("x", &FieldType::text(true)).unwrap();
        let y2 = second.add_field("y", &FieldType::string(true)).unwrap();
        let x2 = second.add_field("x", &FieldType::text(false)).unwrap();

        assert_eq!(x1, x2);
        assert_ne!(x1, y2);
        let infos = second.finish().unwrap();
        assert_eq!(infos.len(), 2);
        assert!(infos.by_name("x").unwrap().has_norms());
        assert!(!infos.by_name("y").unwrap().has_norms());
    }

    #[test]
    fn test_builder_rejects_conflict_without_recording() {
        let global = Arc::new(FieldNumbers::new(None));
        let mut builder = FieldInfosBuilder::new(global);
        builder
            .add_field("n", &FieldType::doc_values(DocValuesType::Numeric))
            .unwrap();
        assert!(
            builder
                .add_field("n", &FieldType::doc_values(DocValuesType::Binary))
                .is_err()
        );
        assert_eq!(
            builder.get("n").unwrap().doc_values_type,
            DocValuesType::Numeric
        );
    }

    #[test]
    fn test_with_dv_gen() {
        let infos = FieldInfos::new(vec![FieldInfo::new("a", 0), FieldInfo::new("b", 1)]).unwrap();
        let updated = infos.with_dv_gen("b", 3).unwrap();
        assert_eq!(updated.by_name("b").unwrap().dv_gen, 3);
        assert_eq!(infos.by_name("b").unwrap().dv_gen, -1);
        assert!(infos.with_dv_gen("zzz", 1).is_err());
    }
}
