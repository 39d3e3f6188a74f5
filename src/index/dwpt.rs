//! Per-thread document writer (DWPT).
//!
//! A DWPT buffers the documents of exactly one future segment. Only the
//! thread that checked it out of the pool touches it, so it needs no lock of
//! its own.
//!
//! Adding documents runs in two phases. The first analyzes every document of
//! the call into an [`AnalyzedDoc`] and validates it (field schema, positions,
//! term length, doc values arity) without touching the buffers. The second
//! commits the analyzed documents, which cannot fail for document-local
//! reasons. A block therefore becomes visible entirely or not at all, and a
//! rejected document leaves the earlier ones intact.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use log::debug;

use crate::analysis::token::{PreAnalyzedTokenStream, PreToken, TokenStream};
use crate::analysis::{Analyzer, TokenStreamComponents};
use crate::document::{Document, Field, FieldType, FieldValue};
use crate::error::{QuireError, Result};
use crate::index::buffered_updates::{BufferedUpdates, FrozenBufferedUpdates};
use crate::index::codec::Codec;
use crate::index::delete_queue::{DeleteNode, DeleteQueue, DeleteSlice};
use crate::index::field_info::{DocValuesType, FieldInfos, FieldInfosBuilder, FieldNumbers};
use crate::index::file_names::{LIVE_DOCS_EXTENSION, file_name_from_generation};
use crate::index::live_docs::LiveDocs;
use crate::index::segment_core::{DocValuesColumn, SegmentCore, StoredFields, numeric_value};
use crate::index::segment_info::{SegmentCommitInfo, SegmentInfo};
use crate::index::sorter::{DocMap, IndexSort};
use crate::index::terms_hash::{TermsHash, TokenOccurrence};
use crate::storage::Storage;

/// Largest token position a document may reach.
pub const MAX_POSITION: u32 = i32::MAX as u32 - 128;

/// Largest term, in bytes.
pub const MAX_TERM_LENGTH: usize = 32766;

/// Settings a DWPT needs from the writer configuration.
#[derive(Debug, Clone)]
pub struct DwptSettings {
    pub analyzer: Arc<dyn Analyzer>,
    pub codec: Arc<dyn Codec>,
    pub use_compound_file: bool,
    pub index_sort: Option<IndexSort>,
    pub soft_deletes_field: Option<String>,
}

/// One document after analysis, ready to be committed.
#[derive(Debug, Default)]
struct AnalyzedDoc {
    occurrences: Vec<(u32, Vec<u8>, TokenOccurrence)>,
    lengths: Vec<(u32, u32)>,
    stored: StoredFields,
    doc_values: Vec<(u32, DocValuesType, FieldValue)>,
}

#[derive(Debug)]
struct FieldInvertState {
    position: i64,
    offset_base: usize,
    last_start_offset: usize,
    length: u32,
    seen: bool,
}

impl Default for FieldInvertState {
    fn default() -> Self {
        FieldInvertState {
            position: -1,
            offset_base: 0,
            last_start_offset: 0,
            length: 0,
            seen: false,
        }
    }
}

/// A segment written by a flush.
#[derive(Debug)]
pub struct FlushedSegment {
    pub commit_info: SegmentCommitInfo,
    pub field_infos: FieldInfos,
    pub live_docs: Option<LiveDocs>,
    pub core: Arc<SegmentCore>,
}

pub struct Dwpt {
    id: u64,
    segment_name: String,
    settings: Arc<DwptSettings>,
    delete_queue: Arc<DeleteQueue>,
    delete_slice: DeleteSlice,
    pending_updates: BufferedUpdates,
    field_infos: FieldInfosBuilder,
    terms_hash: TermsHash,
    stored: Vec<StoredFields>,
    stored_bytes: usize,
    norms: BTreeMap<u32, Vec<u32>>,
    doc_values: BTreeMap<u32, DocValuesColumn>,
    components: AHashMap<String, TokenStreamComponents>,
    num_docs: u32,
    flushed: bool,
    aborted: bool,
}

impl fmt::Debug for Dwpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dwpt")
            .field("id", &self.id)
            .field("segment_name", &self.segment_name)
            .field("num_docs", &self.num_docs)
            .field("queue_generation", &self.delete_queue.generation())
            .finish()
    }
}

impl Dwpt {
    pub fn new(
        id: u64,
        segment_name: String,
        settings: Arc<DwptSettings>,
        field_numbers: Arc<FieldNumbers>,
        delete_queue: Arc<DeleteQueue>,
    ) -> Self {
        let delete_slice = delete_queue.new_slice();
        Dwpt {
            id,
            segment_name,
            settings,
            field_infos: FieldInfosBuilder::new(field_numbers),
            delete_queue,
            delete_slice,
            pending_updates: BufferedUpdates::new(),
            terms_hash: TermsHash::new(),
            stored: Vec::new(),
            stored_bytes: 0,
            norms: BTreeMap::new(),
            doc_values: BTreeMap::new(),
            components: AHashMap::new(),
            num_docs: 0,
            flushed: false,
            aborted: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn delete_queue(&self) -> &Arc<DeleteQueue> {
        &self.delete_queue
    }

    pub fn num_pending_term_deletes(&self) -> usize {
        self.pending_updates.num_term_deletes()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Approximate heap held by this DWPT's buffers.
    pub fn ram_bytes_used(&self) -> usize {
        self.terms_hash.bytes_used()
            + self.stored_bytes
            + self.norms.values().map(|n| n.len() * 4).sum::<usize>()
            + self.doc_values.values().map(|c| c.ram_bytes()).sum::<usize>()
            + self.pending_updates.bytes_used()
    }

    /// Add a block of documents, optionally together with a delete or
    /// update node that applies to every earlier document.
    ///
    /// Returns the sequence number of the operation.
    pub fn update_documents(&mut self, docs: &[Document], node: Option<DeleteNode>) -> Result<i64> {
        if self.flushed || self.aborted {
            return Err(QuireError::illegal_state(format!(
                "DWPT for {} no longer accepts documents",
                self.segment_name
            )));
        }
        let mut analyzed = Vec::with_capacity(docs.len());
        for doc in docs {
            analyzed.push(self.analyze(doc)?);
        }
        let doc_id_upto = self.num_docs;
        for doc in analyzed {
            self.commit_doc(doc)?;
        }
        self.finish_documents(node, doc_id_upto)
    }

    fn finish_documents(&mut self, node: Option<DeleteNode>, doc_id_upto: u32) -> Result<i64> {
        match node {
            Some(node) => {
                let seq_no = self.delete_queue.add_with_slice(node, &mut self.delete_slice)?;
                self.delete_queue
                    .apply_slice(&mut self.delete_slice, &mut self.pending_updates, doc_id_upto);
                Ok(seq_no)
            }
            None => {
                let (changed, seq_no) =
                    self.delete_queue.update_slice_with_seq_no(&mut self.delete_slice)?;
                if changed {
                    self.delete_queue.apply_slice(
                        &mut self.delete_slice,
                        &mut self.pending_updates,
                        doc_id_upto,
                    );
                }
                Ok(seq_no)
            }
        }
    }

    fn components_for(&mut self, field: &str) -> &mut TokenStreamComponents {
        let analyzer = &self.settings.analyzer;
        self.components
            .entry(field.to_string())
            .or_insert_with(|| analyzer.create_components(field))
    }

    fn analyze(&mut self, doc: &Document) -> Result<AnalyzedDoc> {
        let mut out = AnalyzedDoc::default();
        let mut invert: AHashMap<u32, FieldInvertState> = AHashMap::new();
        let mut single_valued_dv: AHashSet<u32> = AHashSet::new();

        for field in doc.fields() {
            let field_type = &field.field_type;
            let number = self.field_infos.add_field(&field.name, field_type)?;

            if field_type.is_indexed() {
                let state = invert.entry(number).or_default();
                if state.seen {
                    let analyzer = &self.settings.analyzer;
                    state.position += analyzer.position_increment_gap(&field.name) as i64;
                    state.offset_base += analyzer.offset_gap(&field.name);
                }
                let mut state = std::mem::take(state);
                self.invert_field(number, field, &mut state, &mut out)?;
                state.seen = true;
                invert.insert(number, state);
            }

            if field_type.stored {
                out.stored.push((number, field.value.clone()));
            }

            let dv_type = field_type.doc_values_type;
            if dv_type != DocValuesType::None {
                let fits = match dv_type {
                    DocValuesType::Numeric | DocValuesType::SortedNumeric => {
                        numeric_value(&field.value).is_some()
                    }
                    _ => field.value.as_bytes().is_some(),
                };
                if !fits {
                    return Err(QuireError::invalid_argument(format!(
                        "value {:?} does not fit {dv_type:?} doc values of field \"{}\"",
                        field.value, field.name
                    )));
                }
                let single = matches!(
                    dv_type,
                    DocValuesType::Numeric | DocValuesType::Binary | DocValuesType::Sorted
                );
                if single && !single_valued_dv.insert(number) {
                    return Err(QuireError::invalid_argument(format!(
                        "doc values field \"{}\" appears more than once in this document \
                         (only one value is allowed per field)",
                        field.name
                    )));
                }
                out.doc_values.push((number, dv_type, field.value.clone()));
            }
        }

        for (number, state) in invert {
            let has_norms = self
                .field_infos
                .get_by_number(number)
                .is_some_and(|info| info.has_norms());
            if has_norms {
                out.lengths.push((number, state.length));
            }
        }
        Ok(out)
    }

    fn invert_field(
        &mut self,
        number: u32,
        field: &Field,
        state: &mut FieldInvertState,
        out: &mut AnalyzedDoc,
    ) -> Result<()> {
        let field_type: &FieldType = &field.field_type;
        let options = field_type.index_options;

        let mut pre_analyzed;
        let mut single;
        let stream: &mut dyn TokenStream = if let Some(tokens) = &field.tokens {
            pre_analyzed = PreAnalyzedTokenStream::new(tokens.clone());
            pre_analyzed.reset()?;
            &mut pre_analyzed
        } else if field_type.tokenized {
            let text = field.value.as_text().ok_or_else(|| {
                QuireError::invalid_argument(format!(
                    "tokenized field \"{}\" needs a text value, got {:?}",
                    field.name, field.value
                ))
            })?;
            self.components_for(&field.name).token_stream(text)?
        } else {
            let term = field.value.to_term_string();
            let len = term.len();
            single = PreAnalyzedTokenStream::new(vec![PreToken::new(term, 0, len)]);
            single.reset()?;
            &mut single
        };

        while stream.increment_token()? {
            let attrs = stream.attributes();
            let increment = attrs.position_increment;
            if increment == 0 && state.position < 0 {
                return Err(QuireError::invalid_argument(format!(
                    "first position increment must be > 0 (got 0) for field \"{}\"",
                    field.name
                )));
            }
            state.position += increment as i64;
            if state.position > MAX_POSITION as i64 {
                return Err(QuireError::invalid_argument(format!(
                    "position overflowed in field \"{}\": position={} exceeds {MAX_POSITION}",
                    field.name, state.position
                )));
            }

            let term = attrs.term.as_bytes();
            if term.len() > MAX_TERM_LENGTH {
                return Err(QuireError::invalid_argument(format!(
                    "document contains an immense term in field \"{}\" ({} bytes, max {MAX_TERM_LENGTH})",
                    field.name,
                    term.len()
                )));
            }

            let (start_offset, end_offset) = if options.has_offsets() {
                let start = state.offset_base + attrs.start_offset;
                let end = state.offset_base + attrs.end_offset;
                if start < state.last_start_offset || end < start {
                    return Err(QuireError::invalid_argument(format!(
                        "offsets must not go backwards in field \"{}\": start={start} end={end} last start={}",
                        field.name, state.last_start_offset
                    )));
                }
                state.last_start_offset = start;
                (start as u32, end as u32)
            } else {
                (0, 0)
            };

            out.occurrences.push((
                number,
                term.to_vec(),
                TokenOccurrence {
                    position: state.position as u32,
                    start_offset,
                    end_offset,
                    payload: if field_type.store_payloads {
                        attrs.payload.clone()
                    } else {
                        None
                    },
                },
            ));
            state.length += 1;
        }
        stream.end()?;
        let end = stream.attributes();
        state.position += end.position_increment as i64;
        state.offset_base += end.end_offset;
        Ok(())
    }

    fn commit_doc(&mut self, doc: AnalyzedDoc) -> Result<()> {
        let doc_id = self.num_docs;
        for (field, term, occurrence) in &doc.occurrences {
            self.terms_hash.add(*field, term, doc_id, occurrence);
        }
        for (field, length) in doc.lengths {
            let lengths = self.norms.entry(field).or_default();
            lengths.resize(doc_id as usize, 0);
            lengths.push(length);
        }
        for (field, dv_type, value) in &doc.doc_values {
            let name = self
                .field_infos
                .get_by_number(*field)
                .map(|i| i.name.clone())
                .unwrap_or_default();
            if !self.doc_values.contains_key(field) {
                self.doc_values
                    .insert(*field, DocValuesColumn::empty(*dv_type, 0)?);
            }
            let added = match self.doc_values.get_mut(field) {
                Some(column) => column.add(doc_id, value, &name),
                None => Err(QuireError::internal("doc values column vanished")),
            };
            if let Err(e) = added {
                self.aborted = true;
                return Err(QuireError::internal(format!(
                    "doc values rejected after validation: {e}"
                )));
            }
        }
        self.stored_bytes += doc
            .stored
            .iter()
            .map(|(_, v)| 16 + v.as_bytes().map_or(8, |b| b.len()))
            .sum::<usize>();
        self.stored.push(doc.stored);
        self.num_docs += 1;
        Ok(())
    }

    /// Catch the slice up with the queue and freeze the global buffer in one
    /// step. Must run under the flush queue lock so tickets follow freeze
    /// order.
    pub fn prepare_flush(&mut self) -> Option<FrozenBufferedUpdates> {
        let global = self
            .delete_queue
            .freeze_global_buffer(Some(&mut self.delete_slice));
        self.delete_queue
            .apply_slice(&mut self.delete_slice, &mut self.pending_updates, self.num_docs);
        global
    }

    /// Write the buffered documents as a new segment.
    ///
    /// Returns `None` when no documents were buffered. A DWPT can only be
    /// flushed once.
    pub fn flush(&mut self, storage: &dyn Storage) -> Result<Option<FlushedSegment>> {
        if self.flushed {
            return Err(QuireError::illegal_state(format!(
                "segment {} was already flushed",
                self.segment_name
            )));
        }
        if self.aborted {
            return Err(QuireError::illegal_state(format!(
                "segment {} was aborted",
                self.segment_name
            )));
        }
        self.flushed = true;
        self.delete_queue.release_slice(&self.delete_slice);
        if self.num_docs == 0 {
            return Ok(None);
        }

        // updated fields must exist in this segment even without values
        for (_, update, _) in self.pending_updates.doc_values_updates() {
            self.field_infos
                .add_field(update.field(), &FieldType::doc_values(update.dv_type()))?;
        }

        let max_doc = self.num_docs;
        let field_infos = self.field_infos.finish()?;
        let terms = std::mem::take(&mut self.terms_hash).finish(&field_infos)?;
        let mut norms = std::mem::take(&mut self.norms);
        for lengths in norms.values_mut() {
            lengths.resize(max_doc as usize, 0);
        }
        let mut doc_values = std::mem::take(&mut self.doc_values);
        for column in doc_values.values_mut() {
            column.pad(max_doc);
        }
        let stored = std::mem::take(&mut self.stored);
        let mut core = SegmentCore::new(max_doc, field_infos, terms, stored, norms, doc_values)?;

        let deleted = self.pending_updates.resolve_deletes(&core)?;
        self.pending_updates.apply_doc_values_updates(&mut core)?;
        let mut live_docs = LiveDocs::all_live(max_doc);
        for (doc, is_deleted) in deleted.iter().enumerate() {
            if is_deleted {
                live_docs.delete(doc as u32);
            }
        }

        if let Some(sort) = &self.settings.index_sort {
            if let Some(map) = sort_map(&core, sort) {
                core = core.sorted(&map);
                live_docs = live_docs.remap(&map);
            }
        }

        let soft_del_count =
            soft_deleted_count(&core, self.settings.soft_deletes_field.as_deref(), &live_docs);
        let segment = write_new_segment(
            storage,
            &self.segment_name,
            core,
            &self.settings,
            live_docs,
            soft_del_count,
            "flush",
        )?;
        debug!(
            "flushed segment {} with {} docs ({} deleted, {} soft deleted)",
            self.segment_name,
            max_doc,
            segment.commit_info.del_count(),
            soft_del_count
        );
        self.pending_updates.clear();
        Ok(Some(segment))
    }

    /// Drop every buffered document.
    pub fn abort(&mut self) {
        if !self.flushed {
            self.delete_queue.release_slice(&self.delete_slice);
        }
        self.aborted = true;
        self.flushed = true;
        self.terms_hash = TermsHash::new();
        self.stored.clear();
        self.norms.clear();
        self.doc_values.clear();
        self.pending_updates.clear();
        debug!("aborted DWPT {} ({} docs dropped)", self.segment_name, self.num_docs);
        self.num_docs = 0;
    }
}

impl Drop for Dwpt {
    fn drop(&mut self) {
        if !self.flushed {
            self.delete_queue.release_slice(&self.delete_slice);
        }
    }
}

/// Doc order for `sort`, or `None` when already sorted.
pub fn sort_map(core: &SegmentCore, sort: &IndexSort) -> Option<DocMap> {
    sort.sort(&core.numeric_values(&sort.field))
}

/// Live documents with a value in the soft deletes field.
pub fn soft_deleted_count(
    core: &SegmentCore,
    soft_field: Option<&str>,
    live_docs: &LiveDocs,
) -> u32 {
    let Some(column) = soft_field
        .and_then(|name| core.field_infos().by_name(name))
        .and_then(|info| core.doc_values(info.number))
    else {
        return 0;
    };
    (0..core.max_doc())
        .filter(|d| live_docs.is_live(*d) && column.has_value(*d))
        .count() as u32
}

/// Write `core` as segment `name`, plus its live docs if any are deleted.
///
/// On failure every file written is removed again.
pub fn write_new_segment(
    storage: &dyn Storage,
    name: &str,
    core: SegmentCore,
    settings: &DwptSettings,
    live_docs: LiveDocs,
    soft_del_count: u32,
    source: &str,
) -> Result<FlushedSegment> {
    let mut diagnostics = BTreeMap::new();
    diagnostics.insert("source".to_string(), source.to_string());
    diagnostics.insert("os".to_string(), std::env::consts::OS.to_string());
    diagnostics.insert("quire.version".to_string(), crate::VERSION.to_string());
    diagnostics.insert(
        "timestamp".to_string(),
        chrono::Utc::now().timestamp_millis().to_string(),
    );
    let mut info = SegmentInfo::new(
        name,
        core.max_doc(),
        settings.codec.name(),
        diagnostics,
        settings.index_sort.clone(),
    );
    settings
        .codec
        .write_segment(storage, &mut info, &core, settings.use_compound_file)?;

    let mut commit_info = SegmentCommitInfo::for_new_segment(info);
    let result = (|| -> Result<Option<LiveDocs>> {
        if live_docs.deleted_count() == 0 {
            commit_info.set_soft_del_count(soft_del_count)?;
            return Ok(None);
        }
        if let Err(e) = settings.codec.write_live_docs(
            storage,
            name,
            commit_info.next_write_del_gen(),
            &live_docs,
        ) {
            commit_info.advance_next_write_del_gen();
            return Err(e);
        }
        commit_info.advance_del_gen();
        commit_info.set_del_counts(live_docs.deleted_count(), soft_del_count)?;
        Ok(Some(live_docs))
    })();
    match result {
        Ok(live_docs) => Ok(FlushedSegment {
            field_infos: core.field_infos().clone(),
            core: Arc::new(core),
            commit_info,
            live_docs,
        }),
        Err(e) => {
            let mut files = commit_info.files();
            // a live docs write that failed half way
            files.extend(file_name_from_generation(
                name,
                LIVE_DOCS_EXTENSION,
                commit_info.next_write_del_gen() - 1,
            ));
            for file in files {
                if storage.file_exists(&file) {
                    let _ = storage.delete_file(&file);
                }
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::StandardAnalyzer;
    use crate::index::codec::StandardCodec;
    use crate::index::reader::TermSource;
    use crate::index::term::Term;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    fn settings() -> Arc<DwptSettings> {
        Arc::new(DwptSettings {
            analyzer: Arc::new(StandardAnalyzer::new()),
            codec: Arc::new(StandardCodec),
            use_compound_file: false,
            index_sort: None,
            soft_deletes_field: None,
        })
    }

    fn doc(id: &str, body: &str) -> Document {
        Document::builder()
            .add_string("id", id)
            .add_text("body", body)
            .build()
    }

    fn new_dwpt(queue: &Arc<DeleteQueue>) -> Dwpt {
        Dwpt::new(
            0,
            "_0".to_string(),
            settings(),
            Arc::new(FieldNumbers::new(None)),
            Arc::clone(queue),
        )
    }

    #[test]
    fn test_update_deletes_only_earlier_docs() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let queue = Arc::new(DeleteQueue::new(0, 1));
        let mut dwpt = new_dwpt(&queue);

        let a = dwpt.update_documents(&[doc("1", "first version")], None).unwrap();
        let b = dwpt
            .update_documents(
                &[doc("1", "second version")],
                Some(DeleteNode::Term(Term::text("id", "1"))),
            )
            .unwrap();
        assert!(b > a);
        assert_eq!(dwpt.num_docs(), 2);

        dwpt.prepare_flush();
        let flushed = dwpt.flush(&storage).unwrap().unwrap();
        assert_eq!(flushed.commit_info.max_doc(), 2);
        assert_eq!(flushed.commit_info.del_count(), 1);
        let live = flushed.live_docs.unwrap();
        assert!(!live.is_live(0));
        assert!(live.is_live(1));
        assert!(storage.file_exists("_0_1.liv"));
        assert_eq!(flushed.core.doc_freq(&Term::text("body", "version")), 2);

        assert!(dwpt.flush(&storage).is_err());
    }

    #[test]
    fn test_invalid_document_leaves_buffer_intact() {
        let queue = Arc::new(DeleteQueue::new(0, 1));
        let mut dwpt = new_dwpt(&queue);
        dwpt.update_documents(&[doc("1", "ok")], None).unwrap();

        let bad = Document::builder()
            .add_field(Field::numeric_doc_values("price", 1))
            .add_field(Field::numeric_doc_values("price", 2))
            .build();
        let err = dwpt
            .update_documents(&[doc("2", "fine"), bad], None)
            .unwrap_err();
        assert!(err.is_document_local());
        // the whole block is rejected
        assert_eq!(dwpt.num_docs(), 1);

        let huge = "x".repeat(MAX_TERM_LENGTH + 1);
        let doc = Document::builder().add_string("id", huge).build();
        assert!(dwpt.update_documents(&[doc], None).is_err());
        assert_eq!(dwpt.num_docs(), 1);
    }

    #[test]
    fn test_concurrent_delete_misses_later_docs() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let queue = Arc::new(DeleteQueue::new(0, 1));
        let mut dwpt = new_dwpt(&queue);
        dwpt.update_documents(&[doc("1", "a")], None).unwrap();
        queue.add(DeleteNode::Term(Term::text("id", "1"))).unwrap();
        // absorbed with doc_id_upto = 1, so the second copy survives
        dwpt.update_documents(&[doc("1", "b")], None).unwrap();

        dwpt.prepare_flush();
        let flushed = dwpt.flush(&storage).unwrap().unwrap();
        let live = flushed.live_docs.unwrap();
        assert!(!live.is_live(0));
        assert!(live.is_live(1));
    }

    #[test]
    fn test_index_sort_applied_at_flush() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let queue = Arc::new(DeleteQueue::new(0, 1));
        let mut settings = (*settings()).clone();
        settings.index_sort = Some(IndexSort::new("rank"));
        let mut dwpt = Dwpt::new(
            0,
            "_0".to_string(),
            Arc::new(settings),
            Arc::new(FieldNumbers::new(None)),
            Arc::clone(&queue),
        );
        for (id, rank) in [("a", 3), ("b", 1), ("c", 2)] {
            let doc = Document::builder()
                .add_string("id", id)
                .add_numeric_doc_value("rank", rank)
                .build();
            dwpt.update_documents(&[doc], None).unwrap();
        }
        dwpt.prepare_flush();
        let flushed = dwpt.flush(&storage).unwrap().unwrap();
        assert_eq!(
            flushed.core.numeric_values("rank"),
            vec![Some(1), Some(2), Some(3)]
        );
        let postings = flushed.core.postings(&Term::text("id", "a")).unwrap();
        assert_eq!(postings[0].doc, 2);
    }
}
