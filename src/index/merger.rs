//! Merging segments into one.
//!
//! A merge reads point-in-time snapshots of its source segments, drops
//! every deleted document (hard or soft) and writes the survivors, in source
//! order, as a new segment. Deletes and doc values updates that land on the
//! sources while the merge runs are carried over when the merge commits.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use log::debug;

use crate::error::{QuireError, Result};
use crate::index::buffered_updates::DocValuesUpdate;
use crate::index::dwpt::{DwptSettings, FlushedSegment, sort_map, write_new_segment};
use crate::index::field_info::{DocValuesType, FieldInfosBuilder, FieldNumbers};
use crate::index::live_docs::LiveDocs;
use crate::index::segment_core::{
    DocValuesColumn, FieldTerms, Posting, SegmentCore, StoredFields,
};
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::term::Term;
use crate::storage::Storage;

/// One source segment as it looked when the merge started.
#[derive(Debug, Clone)]
pub struct MergeInput {
    pub commit_info: SegmentCommitInfo,
    pub core: Arc<SegmentCore>,
    /// Hard deletes at merge start.
    pub live_docs: LiveDocs,
}

/// Runtime state of a registered merge.
#[derive(Debug, Default)]
pub struct MergeState {
    pub inputs: Vec<MergeInput>,
    /// Doc values updates applied to the sources after the snapshot.
    pub dv_updates: Vec<(Term, DocValuesUpdate)>,
    pub merged_name: Option<String>,
    /// Set once the merged segment replaced its sources.
    pub committed: bool,
}

/// Result of [`merge_segments`].
#[derive(Debug)]
pub struct MergedSegment {
    pub segment: FlushedSegment,
    /// For each input, the merged doc id of every source doc that survived.
    pub doc_maps: Vec<Vec<Option<u32>>>,
}

/// Source documents that survive the merge.
fn kept_docs(input: &MergeInput, soft_deletes_field: Option<&str>) -> Vec<u32> {
    let soft_column = soft_deletes_field
        .and_then(|name| input.core.field_infos().by_name(name))
        .and_then(|info| input.core.doc_values(info.number));
    (0..input.core.max_doc())
        .filter(|doc| input.live_docs.is_live(*doc))
        .filter(|doc| soft_column.map(|c| !c.has_value(*doc)).unwrap_or(true))
        .collect()
}

/// Merge `inputs` into a new segment called `name`.
///
/// Returns `None` when no document survives. `is_aborted` is polled between
/// phases; an aborted merge fails with [`QuireError::MergeAborted`] and
/// writes nothing.
pub fn merge_segments(
    storage: &dyn Storage,
    name: &str,
    inputs: &[MergeInput],
    settings: &DwptSettings,
    field_numbers: Arc<FieldNumbers>,
    is_aborted: &dyn Fn() -> bool,
) -> Result<Option<MergedSegment>> {
    let check_abort = |phase: &str| {
        if is_aborted() {
            Err(QuireError::merge_aborted(format!(
                "merge into {name} aborted during {phase}"
            )))
        } else {
            Ok(())
        }
    };
    let soft = settings.soft_deletes_field.as_deref();

    let kept: Vec<Vec<u32>> = inputs.iter().map(|i| kept_docs(i, soft)).collect();
    let mut doc_maps = Vec::with_capacity(inputs.len());
    let mut doc_base = 0u32;
    for (input, docs) in inputs.iter().zip(&kept) {
        let mut map = vec![None; input.core.max_doc() as usize];
        for (i, doc) in docs.iter().enumerate() {
            map[*doc as usize] = Some(doc_base + i as u32);
        }
        doc_base += docs.len() as u32;
        doc_maps.push(map);
    }
    let max_doc = doc_base;
    if max_doc == 0 {
        debug!("merge into {name}: every document is deleted");
        return Ok(None);
    }

    // field infos, plus old to new field numbers per input
    let mut builder = FieldInfosBuilder::new(field_numbers);
    let mut field_maps: Vec<AHashMap<u32, u32>> = Vec::with_capacity(inputs.len());
    for input in inputs {
        let mut map = AHashMap::new();
        for info in input.core.field_infos().iter() {
            map.insert(info.number, builder.absorb(info)?);
        }
        field_maps.push(map);
    }
    let field_infos = builder.finish()?;
    check_abort("field infos")?;

    let mut postings: BTreeMap<u32, BTreeMap<Vec<u8>, Vec<Posting>>> = BTreeMap::new();
    for ((input, fields), docs) in inputs.iter().zip(&field_maps).zip(&doc_maps) {
        for (old_number, field_terms) in input.core.all_field_terms() {
            let Some(number) = fields.get(old_number) else {
                continue;
            };
            let target = postings.entry(*number).or_default();
            for (term, ord) in field_terms.terms() {
                let list = target.entry(term).or_default();
                for posting in field_terms.postings_by_ord(ord) {
                    if let Some(doc) = docs[posting.doc as usize] {
                        list.push(Posting {
                            doc,
                            ..posting.clone()
                        });
                    }
                }
            }
        }
    }
    let mut terms = BTreeMap::new();
    for (number, mut field) in postings {
        field.retain(|_, list| !list.is_empty());
        if !field.is_empty() {
            terms.insert(number, FieldTerms::build(field)?);
        }
    }
    check_abort("postings")?;

    let mut stored: Vec<StoredFields> = Vec::with_capacity(max_doc as usize);
    for ((input, fields), docs) in inputs.iter().zip(&field_maps).zip(&kept) {
        for doc in docs {
            stored.push(
                input
                    .core
                    .stored(*doc)
                    .iter()
                    .filter_map(|(n, v)| fields.get(n).map(|n| (*n, v.clone())))
                    .collect(),
            );
        }
    }
    check_abort("stored fields")?;

    let mut norms: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for info in field_infos.iter().filter(|f| f.has_norms()) {
        let mut merged = Vec::with_capacity(max_doc as usize);
        for ((input, fields), docs) in inputs.iter().zip(&field_maps).zip(&kept) {
            let old = fields
                .iter()
                .find(|(_, new)| **new == info.number)
                .map(|(old, _)| *old);
            for doc in docs {
                merged.push(old.and_then(|o| input.core.norm(o, *doc)).unwrap_or(0));
            }
        }
        norms.insert(info.number, merged);
    }

    let mut doc_values: BTreeMap<u32, DocValuesColumn> = BTreeMap::new();
    for info in field_infos
        .iter()
        .filter(|f| f.doc_values_type != DocValuesType::None)
    {
        let mut merged = DocValuesColumn::empty(info.doc_values_type, 0)?;
        for ((input, fields), docs) in inputs.iter().zip(&field_maps).zip(&kept) {
            let column = fields
                .iter()
                .find(|(_, new)| **new == info.number)
                .and_then(|(old, _)| input.core.doc_values(*old));
            match column {
                Some(column) => merged.extend(column.select(docs))?,
                None => merged.extend(DocValuesColumn::empty(
                    info.doc_values_type,
                    docs.len() as u32,
                )?)?,
            }
        }
        doc_values.insert(info.number, merged);
    }
    check_abort("doc values")?;

    let mut core = SegmentCore::new(max_doc, field_infos, terms, stored, norms, doc_values)?;
    if let Some(sort) = &settings.index_sort {
        if let Some(map) = sort_map(&core, sort) {
            core = core.sorted(&map);
            for doc_map in doc_maps.iter_mut() {
                for slot in doc_map.iter_mut() {
                    *slot = slot.map(|d| map.old_to_new(d));
                }
            }
        }
    }
    check_abort("sorting")?;

    let segment = write_new_segment(
        storage,
        name,
        core,
        settings,
        LiveDocs::all_live(max_doc),
        0,
        "merge",
    )?;
    debug!(
        "merged {} segments into {name} ({max_doc} docs)",
        inputs.len()
    );
    Ok(Some(MergedSegment { segment, doc_maps }))
}
