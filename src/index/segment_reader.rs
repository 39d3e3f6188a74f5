//! Point-in-time reader over one segment.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::document::{Document, Field};
use crate::error::{QuireError, Result};
use crate::index::codec::codec_for_name;
use crate::index::live_docs::LiveDocs;
use crate::index::reader::{DocSource, TermSource};
use crate::index::segment_core::{Posting, SegmentCore};
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::term::Term;
use crate::storage::Storage;

/// One segment as seen at the moment the reader was opened.
#[derive(Debug, Clone)]
pub struct SegmentReader {
    commit_info: SegmentCommitInfo,
    core: Arc<SegmentCore>,
    /// Hard deletes only.
    hard_live_docs: Option<Arc<LiveDocs>>,
    /// What readers see: hard deletes plus hidden soft deletes.
    live_docs: Option<Arc<LiveDocs>>,
    num_docs: u32,
}

/// Load a segment's core with its field infos and doc values updates
/// applied.
pub fn load_core(storage: &dyn Storage, commit_info: &SegmentCommitInfo) -> Result<SegmentCore> {
    let info = commit_info.info();
    let codec = codec_for_name(&info.codec)?;
    let mut core = codec.read_segment(storage, info)?;
    if !commit_info.has_field_updates() {
        return Ok(core);
    }
    let field_infos =
        codec.read_field_infos(storage, commit_info.name(), commit_info.field_infos_gen())?;
    let mut by_gen: BTreeMap<i64, Vec<u32>> = BTreeMap::new();
    for field in field_infos.iter().filter(|f| f.dv_gen != -1) {
        by_gen.entry(field.dv_gen).or_default().push(field.number);
    }
    for (generation, fields) in by_gen {
        let mut columns = codec.read_doc_values_updates(
            storage,
            commit_info.name(),
            generation,
            info.max_doc,
        )?;
        for number in fields {
            let column = columns.remove(&number).ok_or_else(|| {
                QuireError::corrupt(format!(
                    "{}: doc values update generation {generation} misses field {number}",
                    commit_info.name()
                ))
            })?;
            let dv_type = column.dv_type();
            *core.doc_values_mut(number, dv_type)? = column;
        }
    }
    core.set_field_infos(field_infos);
    Ok(core)
}

/// Read the live docs of the commit's current deletion generation.
pub fn load_live_docs(
    storage: &dyn Storage,
    commit_info: &SegmentCommitInfo,
) -> Result<Option<LiveDocs>> {
    if !commit_info.has_deletions() {
        return Ok(None);
    }
    let codec = codec_for_name(&commit_info.info().codec)?;
    let live_docs = codec.read_live_docs(
        storage,
        commit_info.name(),
        commit_info.del_gen(),
        commit_info.max_doc(),
    )?;
    if live_docs.deleted_count() != commit_info.del_count() {
        return Err(QuireError::corrupt(format!(
            "{}: live docs hold {} deletions, commit says {}",
            commit_info.name(),
            live_docs.deleted_count(),
            commit_info.del_count()
        )));
    }
    Ok(Some(live_docs))
}

impl SegmentReader {
    /// Open a committed segment from storage.
    ///
    /// With `soft_deletes_field` set, documents holding a value in that
    /// field are hidden.
    pub fn open(
        storage: &dyn Storage,
        commit_info: &SegmentCommitInfo,
        soft_deletes_field: Option<&str>,
    ) -> Result<Self> {
        let core = load_core(storage, commit_info)?;
        let live_docs = load_live_docs(storage, commit_info)?;
        Self::from_parts(
            commit_info.clone(),
            Arc::new(core),
            live_docs.map(Arc::new),
            soft_deletes_field,
        )
    }

    /// Build from state the writer already holds in memory.
    pub fn from_parts(
        commit_info: SegmentCommitInfo,
        core: Arc<SegmentCore>,
        hard_live_docs: Option<Arc<LiveDocs>>,
        soft_deletes_field: Option<&str>,
    ) -> Result<Self> {
        if core.max_doc() != commit_info.max_doc() {
            return Err(QuireError::corrupt(format!(
                "{}: core has {} documents, segment info says {}",
                commit_info.name(),
                core.max_doc(),
                commit_info.max_doc()
            )));
        }
        let soft_column = soft_deletes_field
            .and_then(|name| core.field_infos().by_name(name))
            .and_then(|info| core.doc_values(info.number));
        let live_docs = match soft_column {
            Some(column) => {
                let mut live = hard_live_docs
                    .as_deref()
                    .cloned()
                    .unwrap_or_else(|| LiveDocs::all_live(core.max_doc()));
                for doc in 0..core.max_doc() {
                    if column.has_value(doc) {
                        live.delete(doc);
                    }
                }
                if live.deleted_count() == 0 {
                    None
                } else {
                    Some(Arc::new(live))
                }
            }
            None => hard_live_docs.clone(),
        };
        let num_docs = live_docs
            .as_ref()
            .map(|l| l.live_count())
            .unwrap_or_else(|| core.max_doc());
        Ok(SegmentReader {
            commit_info,
            core,
            hard_live_docs,
            live_docs,
            num_docs,
        })
    }

    pub fn name(&self) -> &str {
        self.commit_info.name()
    }

    pub fn commit_info(&self) -> &SegmentCommitInfo {
        &self.commit_info
    }

    pub fn core(&self) -> &Arc<SegmentCore> {
        &self.core
    }

    pub fn max_doc(&self) -> u32 {
        self.core.max_doc()
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn num_deleted_docs(&self) -> u32 {
        self.max_doc() - self.num_docs
    }

    pub fn live_docs(&self) -> Option<&Arc<LiveDocs>> {
        self.live_docs.as_ref()
    }

    pub fn hard_live_docs(&self) -> Option<&Arc<LiveDocs>> {
        self.hard_live_docs.as_ref()
    }

    pub fn is_live(&self, doc: u32) -> bool {
        if doc >= self.max_doc() {
            return false;
        }
        self.live_docs.as_ref().map(|l| l.is_live(doc)).unwrap_or(true)
    }

    /// Numeric doc value of `doc`, if the field has one.
    pub fn numeric_doc_value(&self, field: &str, doc: u32) -> Option<i64> {
        let info = self.core.field_infos().by_name(field)?;
        self.core.doc_values(info.number)?.numeric(doc)
    }

    pub fn binary_doc_value(&self, field: &str, doc: u32) -> Option<&[u8]> {
        let info = self.core.field_infos().by_name(field)?;
        self.core.doc_values(info.number)?.binary(doc)
    }

    /// Stored fields of `doc`, deleted or not.
    pub fn stored_document(&self, doc: u32) -> Result<Document> {
        if doc >= self.max_doc() {
            return Err(QuireError::invalid_argument(format!(
                "doc {doc} is out of bounds for segment {} (maxDoc={})",
                self.name(),
                self.max_doc()
            )));
        }
        let infos = self.core.field_infos();
        let mut document = Document::new();
        for (number, value) in self.core.stored(doc) {
            let info = infos.by_number(*number).ok_or_else(|| {
                QuireError::corrupt(format!(
                    "{}: stored value of unknown field {number}",
                    self.name()
                ))
            })?;
            document.add(Field::stored(info.name.clone(), value.clone()));
        }
        Ok(document)
    }
}

impl TermSource for SegmentReader {
    fn max_doc(&self) -> u32 {
        self.core.max_doc()
    }

    fn postings(&self, term: &Term) -> Option<&[Posting]> {
        self.core.postings(term)
    }
}

impl DocSource for SegmentReader {
    fn num_docs(&self) -> u32 {
        self.num_docs
    }

    fn is_live(&self, doc: u32) -> bool {
        SegmentReader::is_live(self, doc)
    }

    fn document(&self, doc: u32) -> Result<Document> {
        if !self.is_live(doc) {
            return Err(QuireError::invalid_argument(format!(
                "doc {doc} of segment {} is deleted",
                self.name()
            )));
        }
        self.stored_document(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::StandardAnalyzer;
    use crate::document::FieldValue;
    use crate::index::codec::{Codec, StandardCodec};
    use crate::index::dwpt::{DwptSettings, write_new_segment};
    use crate::index::field_info::{DocValuesType, FieldInfo, FieldInfos};
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    fn core(max_doc: u32, soft: &[u32]) -> SegmentCore {
        let id = FieldInfo::new("id", 0);
        let mut deleted = FieldInfo::new("__soft", 1);
        deleted.doc_values_type = DocValuesType::Numeric;
        deleted.soft_deletes_field = true;
        let infos = FieldInfos::new(vec![id, deleted]).unwrap();
        let stored = (0..max_doc)
            .map(|d| vec![(0, FieldValue::Text(d.to_string()))])
            .collect();
        let mut column = crate::index::segment_core::DocValuesColumn::empty(
            DocValuesType::Numeric,
            max_doc,
        )
        .unwrap();
        for doc in soft {
            column.set_numeric(*doc, Some(1)).unwrap();
        }
        let mut doc_values = BTreeMap::new();
        doc_values.insert(1, column);
        SegmentCore::new(max_doc, infos, BTreeMap::new(), stored, BTreeMap::new(), doc_values)
            .unwrap()
    }

    fn settings() -> DwptSettings {
        DwptSettings {
            analyzer: Arc::new(StandardAnalyzer::new()),
            codec: Arc::new(StandardCodec),
            use_compound_file: false,
            index_sort: None,
            soft_deletes_field: Some("__soft".to_string()),
        }
    }

    #[test]
    fn test_open_applies_hard_and_soft_deletes() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut live = LiveDocs::all_live(4);
        live.delete(0);
        let segment =
            write_new_segment(&storage, "_0", core(4, &[0, 2]), &settings(), live, 1, "test")
                .unwrap();
        assert_eq!(segment.commit_info.del_count(), 1);
        assert_eq!(segment.commit_info.soft_del_count(), 1);

        let plain = SegmentReader::open(&storage, &segment.commit_info, None).unwrap();
        assert_eq!(plain.num_docs(), 3);
        assert!(plain.is_live(2));

        let soft = SegmentReader::open(&storage, &segment.commit_info, Some("__soft")).unwrap();
        assert_eq!(soft.num_docs(), 2);
        assert!(!soft.is_live(0));
        assert!(!soft.is_live(2));
        assert_eq!(
            soft.document(3).unwrap().get_text("id"),
            Some("3")
        );
        assert!(soft.document(2).is_err());
        assert_eq!(soft.numeric_doc_value("__soft", 2), Some(1));
    }

    #[test]
    fn test_doc_values_updates_are_loaded() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let segment = write_new_segment(
            &storage,
            "_1",
            core(3, &[]),
            &settings(),
            LiveDocs::all_live(3),
            0,
            "test",
        )
        .unwrap();
        let mut commit = segment.commit_info;
        let codec = StandardCodec;

        let mut column = segment.core.doc_values(1).unwrap().clone();
        column.set_numeric(1, Some(7)).unwrap();
        let mut columns = BTreeMap::new();
        columns.insert(1, column);
        let dv_gen = commit.next_write_dv_gen();
        let dvu = codec
            .write_doc_values_updates(&storage, "_1", dv_gen, &columns)
            .unwrap();
        let infos = segment.field_infos.with_dv_gen("__soft", dv_gen).unwrap();
        let fnm = codec
            .write_field_infos(&storage, "_1", commit.next_write_field_infos_gen(), &infos)
            .unwrap();
        commit.advance_dv_gen();
        commit.advance_field_infos_gen();
        commit.set_dv_updates_files([(1, [dvu].into_iter().collect())].into_iter().collect());
        commit.set_field_infos_files([fnm].into_iter().collect());

        let reader = SegmentReader::open(&storage, &commit, None).unwrap();
        assert_eq!(reader.numeric_doc_value("__soft", 1), Some(7));
        assert_eq!(reader.numeric_doc_value("__soft", 0), None);
    }
}
