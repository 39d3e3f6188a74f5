//! Segment file formats.
//!
//! A [`Codec`] turns a [`SegmentCore`] into files and back. Segment infos
//! record the codec name of every segment and look the codec up with
//! [`codec_for_name`] when reading a commit.
//!
//! Files written by [`StandardCodec`]:
//!
//! ```text
//! _N.si            segment info (never inside a compound file)
//! _N.fnm           field infos
//! _N.pst           per field: fst term dictionary + posting lists
//! _N.fdt           stored fields
//! _N.nrm           field lengths
//! _N.dvd           doc values
//! _N_<gen>.liv     live docs
//! _N_<gen>.fnm     field infos after doc values updates
//! _N_<gen>.dvu     updated doc values columns
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::io::Read;
use std::sync::Arc;

use log::warn;

use crate::document::FieldValue;
use crate::error::{QuireError, Result};
use crate::index::field_info::{
    DocValuesType, FieldInfo, FieldInfos, IndexOptions, VectorSimilarity,
};
use crate::index::file_names::{
    self, DOC_VALUES_EXTENSION, DOC_VALUES_UPDATE_EXTENSION, FIELD_INFOS_EXTENSION,
    LIVE_DOCS_EXTENSION, NORMS_EXTENSION, POSTINGS_EXTENSION, SEGMENT_INFO_EXTENSION,
    STORED_FIELDS_EXTENSION,
};
use crate::index::live_docs::LiveDocs;
use crate::index::segment_core::{
    DocValuesColumn, FieldTerms, PositionEntry, Posting, SegmentCore, StoredFields,
};
use crate::index::segment_info::{ID_LENGTH, SegmentInfo};
use crate::index::sorter::IndexSort;
use crate::storage::compound::{self, CompoundStorage};
use crate::storage::structured::{StructReader, StructWriter, create_writer, open_verified};
use crate::storage::{Storage, StorageOutput};

const SEGMENT_INFO_MAGIC: u32 = 0x5153_4946; // "QSIF"
const FIELD_INFOS_MAGIC: u32 = 0x5146_4e4d; // "QFNM"
const POSTINGS_MAGIC: u32 = 0x5150_5354; // "QPST"
const STORED_MAGIC: u32 = 0x5146_4454; // "QFDT"
const NORMS_MAGIC: u32 = 0x514e_524d; // "QNRM"
const DOC_VALUES_MAGIC: u32 = 0x5144_5644; // "QDVD"
const LIVE_DOCS_MAGIC: u32 = 0x514c_4956; // "QLIV"
const FORMAT_VERSION: u32 = 1;

/// Name of the default codec.
pub const STANDARD_CODEC_NAME: &str = "Quire10";

/// Pluggable serializer for segment files.
pub trait Codec: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Write the files of a new segment and record them in `info`.
    ///
    /// On failure every file written so far is deleted again.
    fn write_segment(
        &self,
        storage: &dyn Storage,
        info: &mut SegmentInfo,
        core: &SegmentCore,
        use_compound_file: bool,
    ) -> Result<()>;

    /// Load the files of a segment written by [`Codec::write_segment`].
    fn read_segment(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<SegmentCore>;

    fn write_segment_info(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<String>;

    fn read_segment_info(
        &self,
        storage: &dyn Storage,
        segment: &str,
        id: &[u8; ID_LENGTH],
    ) -> Result<SegmentInfo>;

    /// Write a field infos generation; returns the file name.
    fn write_field_infos(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
        infos: &FieldInfos,
    ) -> Result<String>;

    fn read_field_infos(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
    ) -> Result<FieldInfos>;

    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
        live_docs: &LiveDocs,
    ) -> Result<String>;

    fn read_live_docs(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
        max_doc: u32,
    ) -> Result<LiveDocs>;

    /// Write updated doc values columns; returns the file name.
    fn write_doc_values_updates(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
        columns: &BTreeMap<u32, DocValuesColumn>,
    ) -> Result<String>;

    fn read_doc_values_updates(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
        max_doc: u32,
    ) -> Result<BTreeMap<u32, DocValuesColumn>>;
}

/// Look up a codec by the name recorded in a segment.
pub fn codec_for_name(name: &str) -> Result<Arc<dyn Codec>> {
    match name {
        STANDARD_CODEC_NAME => Ok(Arc::new(StandardCodec)),
        other => Err(QuireError::corrupt(format!("unknown codec \"{other}\""))),
    }
}

/// The default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec;

fn generation_file(segment: &str, extension: &str, generation: i64) -> Result<String> {
    file_names::file_name_from_generation(segment, extension, generation).ok_or_else(|| {
        QuireError::invalid_argument(format!(
            "invalid generation {generation} for {segment}.{extension}"
        ))
    })
}

fn delete_quietly(storage: &dyn Storage, files: &[String]) {
    for file in files {
        if storage.file_exists(file) {
            if let Err(e) = storage.delete_file(file) {
                warn!("failed to delete {file} after aborted write: {e}");
            }
        }
    }
}

type Writer = StructWriter<Box<dyn StorageOutput>>;

fn write_field_info(out: &mut Writer, info: &FieldInfo) -> Result<()> {
    out.write_string(&info.name)?;
    out.write_varint(info.number as u64)?;
    out.write_u8(info.index_options.to_u8())?;
    out.write_u8(info.doc_values_type.to_u8())?;
    out.write_bool(info.store_term_vectors)?;
    out.write_bool(info.omit_norms)?;
    out.write_bool(info.store_payloads)?;
    out.write_varint(info.point_dimension_count as u64)?;
    out.write_varint(info.point_index_dimension_count as u64)?;
    out.write_varint(info.point_num_bytes as u64)?;
    out.write_varint(info.vector_dimension as u64)?;
    out.write_u8(info.vector_similarity.to_u8())?;
    out.write_bool(info.soft_deletes_field)?;
    out.write_zvarint(info.dv_gen)?;
    out.write_string_map(&info.attributes)
}

fn read_field_info<R: Read>(input: &mut StructReader<R>) -> Result<FieldInfo> {
    let name = input.read_string()?;
    let number = input.read_varint_u32()?;
    let mut info = FieldInfo::new(name, number);
    info.index_options = IndexOptions::from_u8(input.read_u8()?)?;
    info.doc_values_type = DocValuesType::from_u8(input.read_u8()?)?;
    info.store_term_vectors = input.read_bool()?;
    info.omit_norms = input.read_bool()?;
    info.store_payloads = input.read_bool()?;
    info.point_dimension_count = input.read_varint_u32()?;
    info.point_index_dimension_count = input.read_varint_u32()?;
    info.point_num_bytes = input.read_varint_u32()?;
    info.vector_dimension = input.read_varint_u32()?;
    info.vector_similarity = VectorSimilarity::from_u8(input.read_u8()?)?;
    info.soft_deletes_field = input.read_bool()?;
    info.dv_gen = input.read_zvarint()?;
    info.attributes = input.read_string_map()?;
    Ok(info)
}

fn write_postings(out: &mut Writer, core: &SegmentCore) -> Result<()> {
    let fields = core.all_field_terms();
    out.write_varint(fields.len() as u64)?;
    for (number, terms) in fields {
        let info = core.field_infos().by_number(*number).ok_or_else(|| {
            QuireError::internal(format!("postings for unknown field number {number}"))
        })?;
        let options = info.index_options;
        out.write_varint(*number as u64)?;
        out.write_bytes(terms.fst_bytes())?;
        out.write_varint(terms.len() as u64)?;
        for ord in 0..terms.len() {
            let list = terms.postings_by_ord(ord);
            out.write_varint(list.len() as u64)?;
            let mut last_doc = 0u32;
            for posting in list {
                out.write_varint((posting.doc - last_doc) as u64)?;
                last_doc = posting.doc;
                if options.has_freqs() {
                    out.write_varint(posting.freq as u64)?;
                }
                if options.has_positions() {
                    let mut last_position = 0u32;
                    let mut last_offset = 0u32;
                    for entry in &posting.positions {
                        out.write_varint((entry.position - last_position) as u64)?;
                        last_position = entry.position;
                        if options.has_offsets() {
                            out.write_varint((entry.start_offset - last_offset) as u64)?;
                            out.write_varint((entry.end_offset - entry.start_offset) as u64)?;
                            last_offset = entry.start_offset;
                        }
                        if info.store_payloads {
                            match &entry.payload {
                                Some(payload) => {
                                    out.write_bool(true)?;
                                    out.write_bytes(payload)?;
                                }
                                None => out.write_bool(false)?,
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn read_postings<R: Read>(
    input: &mut StructReader<R>,
    field_infos: &FieldInfos,
    max_doc: u32,
) -> Result<BTreeMap<u32, FieldTerms>> {
    let field_count = input.read_varint()?;
    let mut fields = BTreeMap::new();
    for _ in 0..field_count {
        let number = input.read_varint_u32()?;
        let info = field_infos.by_number(number).ok_or_else(|| {
            QuireError::corrupt(format!("postings for unknown field number {number}"))
        })?;
        let options = info.index_options;
        let fst_bytes = input.read_bytes()?;
        let term_count = input.read_varint()?;
        let mut lists = Vec::with_capacity(term_count as usize);
        for _ in 0..term_count {
            let doc_count = input.read_varint()?;
            let mut list = Vec::with_capacity(doc_count as usize);
            let mut doc = 0u32;
            for _ in 0..doc_count {
                doc += input.read_varint_u32()?;
                if doc >= max_doc {
                    return Err(QuireError::corrupt(format!(
                        "posting doc {doc} out of range for maxDoc={max_doc}"
                    )));
                }
                let freq = if options.has_freqs() {
                    input.read_varint_u32()?
                } else {
                    1
                };
                let mut positions = Vec::new();
                if options.has_positions() {
                    let mut position = 0u32;
                    let mut offset = 0u32;
                    for _ in 0..freq {
                        position += input.read_varint_u32()?;
                        let (start_offset, end_offset) = if options.has_offsets() {
                            offset += input.read_varint_u32()?;
                            (offset, offset + input.read_varint_u32()?)
                        } else {
                            (0, 0)
                        };
                        let payload = if info.store_payloads && input.read_bool()? {
                            Some(input.read_bytes()?)
                        } else {
                            None
                        };
                        positions.push(PositionEntry {
                            position,
                            start_offset,
                            end_offset,
                            payload,
                        });
                    }
                }
                list.push(Posting {
                    doc,
                    freq,
                    positions,
                });
            }
            lists.push(list);
        }
        fields.insert(number, FieldTerms::from_parts(fst_bytes, lists)?);
    }
    Ok(fields)
}

fn write_field_value(out: &mut Writer, value: &FieldValue) -> Result<()> {
    match value {
        FieldValue::Text(s) => {
            out.write_u8(0)?;
            out.write_string(s)
        }
        FieldValue::Binary(b) => {
            out.write_u8(1)?;
            out.write_bytes(b)
        }
        FieldValue::Int(v) => {
            out.write_u8(2)?;
            out.write_zvarint(*v as i64)
        }
        FieldValue::Long(v) => {
            out.write_u8(3)?;
            out.write_zvarint(*v)
        }
        FieldValue::Float(v) => {
            out.write_u8(4)?;
            out.write_u32(v.to_bits())
        }
        FieldValue::Double(v) => {
            out.write_u8(5)?;
            out.write_f64(*v)
        }
    }
}

fn read_field_value<R: Read>(input: &mut StructReader<R>) -> Result<FieldValue> {
    Ok(match input.read_u8()? {
        0 => FieldValue::Text(input.read_string()?),
        1 => FieldValue::Binary(input.read_bytes()?),
        2 => {
            let v = input.read_zvarint()?;
            FieldValue::Int(
                i32::try_from(v).map_err(|_| QuireError::corrupt(format!("int {v} overflows")))?,
            )
        }
        3 => FieldValue::Long(input.read_zvarint()?),
        4 => FieldValue::Float(f32::from_bits(input.read_u32()?)),
        5 => FieldValue::Double(input.read_f64()?),
        tag => return Err(QuireError::corrupt(format!("unknown stored value tag {tag}"))),
    })
}

fn write_doc_values(out: &mut Writer, columns: &BTreeMap<u32, DocValuesColumn>) -> Result<()> {
    out.write_varint(columns.len() as u64)?;
    for (number, column) in columns {
        out.write_varint(*number as u64)?;
        out.write_u8(column.dv_type().to_u8())?;
        out.write_varint(column.len() as u64)?;
        match column {
            DocValuesColumn::Numeric(values) => {
                for value in values {
                    out.write_bool(value.is_some())?;
                    if let Some(v) = value {
                        out.write_zvarint(*v)?;
                    }
                }
            }
            DocValuesColumn::Binary(values) | DocValuesColumn::Sorted(values) => {
                for value in values {
                    out.write_bool(value.is_some())?;
                    if let Some(v) = value {
                        out.write_bytes(v)?;
                    }
                }
            }
            DocValuesColumn::SortedNumeric(values) => {
                for doc_values in values {
                    out.write_varint(doc_values.len() as u64)?;
                    for v in doc_values {
                        out.write_zvarint(*v)?;
                    }
                }
            }
            DocValuesColumn::SortedSet(values) => {
                for doc_values in values {
                    out.write_varint(doc_values.len() as u64)?;
                    for v in doc_values {
                        out.write_bytes(v)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn read_doc_values<R: Read>(
    input: &mut StructReader<R>,
    max_doc: u32,
) -> Result<BTreeMap<u32, DocValuesColumn>> {
    let count = input.read_varint()?;
    let mut columns = BTreeMap::new();
    for _ in 0..count {
        let number = input.read_varint_u32()?;
        let dv_type = DocValuesType::from_u8(input.read_u8()?)?;
        let len = input.read_varint_u32()?;
        if len != max_doc {
            return Err(QuireError::corrupt(format!(
                "doc values of field {number} hold {len} documents, maxDoc={max_doc}"
            )));
        }
        let n = len as usize;
        let column = match dv_type {
            DocValuesType::Numeric => {
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    values.push(if input.read_bool()? {
                        Some(input.read_zvarint()?)
                    } else {
                        None
                    });
                }
                DocValuesColumn::Numeric(values)
            }
            DocValuesType::Binary | DocValuesType::Sorted => {
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    values.push(if input.read_bool()? {
                        Some(input.read_bytes()?)
                    } else {
                        None
                    });
                }
                if dv_type == DocValuesType::Binary {
                    DocValuesColumn::Binary(values)
                } else {
                    DocValuesColumn::Sorted(values)
                }
            }
            DocValuesType::SortedNumeric => {
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    let count = input.read_varint()?;
                    let mut doc_values = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        doc_values.push(input.read_zvarint()?);
                    }
                    values.push(doc_values);
                }
                DocValuesColumn::SortedNumeric(values)
            }
            DocValuesType::SortedSet => {
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    let count = input.read_varint()?;
                    let mut doc_values = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        doc_values.push(input.read_bytes()?);
                    }
                    values.push(doc_values);
                }
                DocValuesColumn::SortedSet(values)
            }
            DocValuesType::None => {
                return Err(QuireError::corrupt(format!(
                    "doc values column of field {number} has type None"
                )));
            }
        };
        columns.insert(number, column);
    }
    Ok(columns)
}

impl StandardCodec {
    fn write_core_files(
        &self,
        storage: &dyn Storage,
        segment: &str,
        core: &SegmentCore,
        written: &mut Vec<String>,
    ) -> Result<()> {
        let name = file_names::segment_file_name(segment, FIELD_INFOS_EXTENSION);
        written.push(name.clone());
        let mut out = create_writer(storage, &name)?;
        out.write_header(FIELD_INFOS_MAGIC, FORMAT_VERSION)?;
        out.write_varint(core.field_infos().len() as u64)?;
        for info in core.field_infos().iter() {
            write_field_info(&mut out, info)?;
        }
        out.finish()?;

        let name = file_names::segment_file_name(segment, POSTINGS_EXTENSION);
        written.push(name.clone());
        let mut out = create_writer(storage, &name)?;
        out.write_header(POSTINGS_MAGIC, FORMAT_VERSION)?;
        write_postings(&mut out, core)?;
        out.finish()?;

        let name = file_names::segment_file_name(segment, STORED_FIELDS_EXTENSION);
        written.push(name.clone());
        let mut out = create_writer(storage, &name)?;
        out.write_header(STORED_MAGIC, FORMAT_VERSION)?;
        out.write_varint(core.max_doc() as u64)?;
        for doc in core.all_stored() {
            out.write_varint(doc.len() as u64)?;
            for (number, value) in doc {
                out.write_varint(*number as u64)?;
                write_field_value(&mut out, value)?;
            }
        }
        out.finish()?;

        let name = file_names::segment_file_name(segment, NORMS_EXTENSION);
        written.push(name.clone());
        let mut out = create_writer(storage, &name)?;
        out.write_header(NORMS_MAGIC, FORMAT_VERSION)?;
        out.write_varint(core.all_norms().len() as u64)?;
        for (number, lengths) in core.all_norms() {
            out.write_varint(*number as u64)?;
            for doc in 0..core.max_doc() as usize {
                out.write_varint(lengths.get(doc).copied().unwrap_or(0) as u64)?;
            }
        }
        out.finish()?;

        let name = file_names::segment_file_name(segment, DOC_VALUES_EXTENSION);
        written.push(name.clone());
        let mut out = create_writer(storage, &name)?;
        out.write_header(DOC_VALUES_MAGIC, FORMAT_VERSION)?;
        write_doc_values(&mut out, core.all_doc_values())?;
        out.finish()
    }
}

impl Codec for StandardCodec {
    fn name(&self) -> &str {
        STANDARD_CODEC_NAME
    }

    fn write_segment(
        &self,
        storage: &dyn Storage,
        info: &mut SegmentInfo,
        core: &SegmentCore,
        use_compound_file: bool,
    ) -> Result<()> {
        let segment = info.name.clone();
        let mut written = Vec::new();
        let result = (|| -> Result<()> {
            self.write_core_files(storage, &segment, core, &mut written)?;
            let mut files: BTreeSet<String> = written.iter().cloned().collect();
            if use_compound_file {
                let core_files = written.clone();
                let compound_files = compound::write_compound(storage, &segment, &core_files)?;
                written.extend(compound_files.iter().cloned());
                for file in &core_files {
                    storage.delete_file(file)?;
                }
                files = compound_files.into_iter().collect();
            }
            let si = file_names::segment_file_name(&segment, SEGMENT_INFO_EXTENSION);
            files.insert(si.clone());
            info.is_compound_file = use_compound_file;
            info.set_files(files)?;
            written.push(si);
            self.write_segment_info(storage, info)?;
            Ok(())
        })();
        if result.is_err() {
            delete_quietly(storage, &written);
        }
        result
    }

    fn read_segment(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<SegmentCore> {
        let compound;
        let source: &dyn Storage = if info.is_compound_file {
            compound = CompoundStorage::open(storage, &info.name)?;
            &compound
        } else {
            storage
        };
        let segment = info.name.as_str();
        let max_doc = info.max_doc;

        let field_infos = read_field_infos_file(
            source,
            &file_names::segment_file_name(segment, FIELD_INFOS_EXTENSION),
        )?;

        let mut input = open_verified(
            source,
            &file_names::segment_file_name(segment, POSTINGS_EXTENSION),
        )?;
        input.check_header(POSTINGS_MAGIC, FORMAT_VERSION, FORMAT_VERSION)?;
        let terms = read_postings(&mut input, &field_infos, max_doc)?;

        let mut input = open_verified(
            source,
            &file_names::segment_file_name(segment, STORED_FIELDS_EXTENSION),
        )?;
        input.check_header(STORED_MAGIC, FORMAT_VERSION, FORMAT_VERSION)?;
        let stored_docs = input.read_varint_u32()?;
        if stored_docs != max_doc {
            return Err(QuireError::corrupt(format!(
                "{segment}: {stored_docs} stored documents for maxDoc={max_doc}"
            )));
        }
        let mut stored: Vec<StoredFields> = Vec::with_capacity(max_doc as usize);
        for _ in 0..max_doc {
            let count = input.read_varint()?;
            let mut doc = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let number = input.read_varint_u32()?;
                doc.push((number, read_field_value(&mut input)?));
            }
            stored.push(doc);
        }

        let mut input = open_verified(
            source,
            &file_names::segment_file_name(segment, NORMS_EXTENSION),
        )?;
        input.check_header(NORMS_MAGIC, FORMAT_VERSION, FORMAT_VERSION)?;
        let norm_fields = input.read_varint()?;
        let mut norms = BTreeMap::new();
        for _ in 0..norm_fields {
            let number = input.read_varint_u32()?;
            let mut lengths = Vec::with_capacity(max_doc as usize);
            for _ in 0..max_doc {
                lengths.push(input.read_varint_u32()?);
            }
            norms.insert(number, lengths);
        }

        let mut input = open_verified(
            source,
            &file_names::segment_file_name(segment, DOC_VALUES_EXTENSION),
        )?;
        input.check_header(DOC_VALUES_MAGIC, FORMAT_VERSION, FORMAT_VERSION)?;
        let doc_values = read_doc_values(&mut input, max_doc)?;

        SegmentCore::new(max_doc, field_infos, terms, stored, norms, doc_values)
    }

    fn write_segment_info(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<String> {
        let name = file_names::segment_file_name(&info.name, SEGMENT_INFO_EXTENSION);
        let mut out = create_writer(storage, &name)?;
        out.write_header(SEGMENT_INFO_MAGIC, FORMAT_VERSION)?;
        out.write_raw(&info.id)?;
        out.write_string(&info.version)?;
        out.write_bool(info.min_version.is_some())?;
        if let Some(min_version) = &info.min_version {
            out.write_string(min_version)?;
        }
        out.write_varint(info.max_doc as u64)?;
        out.write_bool(info.is_compound_file)?;
        out.write_string_map(&info.diagnostics)?;
        out.write_string_map(&info.attributes)?;
        out.write_string_set(info.files())?;
        out.write_bool(info.index_sort.is_some())?;
        if let Some(sort) = &info.index_sort {
            out.write_string(&sort.field)?;
            out.write_bool(sort.reverse)?;
            out.write_zvarint(sort.missing_value)?;
        }
        out.finish()?;
        Ok(name)
    }

    fn read_segment_info(
        &self,
        storage: &dyn Storage,
        segment: &str,
        id: &[u8; ID_LENGTH],
    ) -> Result<SegmentInfo> {
        let name = file_names::segment_file_name(segment, SEGMENT_INFO_EXTENSION);
        let mut input = open_verified(storage, &name)?;
        input.check_header(SEGMENT_INFO_MAGIC, FORMAT_VERSION, FORMAT_VERSION)?;
        let found = input.read_raw(ID_LENGTH)?;
        if found.as_slice() != id.as_slice() {
            return Err(QuireError::corrupt(format!(
                "{name}: segment id does not match the commit"
            )));
        }
        let version = input.read_string()?;
        let min_version = if input.read_bool()? {
            Some(input.read_string()?)
        } else {
            None
        };
        let max_doc = input.read_varint_u32()?;
        let is_compound_file = input.read_bool()?;
        let diagnostics = input.read_string_map()?;
        let attributes = input.read_string_map()?;
        let files = input.read_string_set()?;
        let index_sort = if input.read_bool()? {
            let field = input.read_string()?;
            let reverse = input.read_bool()?;
            let missing_value = input.read_zvarint()?;
            Some(IndexSort {
                field,
                reverse,
                missing_value,
            })
        } else {
            None
        };

        let mut info = SegmentInfo::new(segment, max_doc, self.name(), diagnostics, index_sort);
        info.id = *id;
        info.version = version;
        info.min_version = min_version;
        info.is_compound_file = is_compound_file;
        info.attributes = attributes;
        info.set_files(files)?;
        Ok(info)
    }

    fn write_field_infos(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
        infos: &FieldInfos,
    ) -> Result<String> {
        let name = generation_file(segment, FIELD_INFOS_EXTENSION, generation)?;
        let result = (|| -> Result<()> {
            let mut out = create_writer(storage, &name)?;
            out.write_header(FIELD_INFOS_MAGIC, FORMAT_VERSION)?;
            out.write_varint(infos.len() as u64)?;
            for info in infos.iter() {
                write_field_info(&mut out, info)?;
            }
            out.finish()
        })();
        if let Err(e) = result {
            delete_quietly(storage, std::slice::from_ref(&name));
            return Err(e);
        }
        Ok(name)
    }

    fn read_field_infos(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
    ) -> Result<FieldInfos> {
        let name = generation_file(segment, FIELD_INFOS_EXTENSION, generation)?;
        read_field_infos_file(storage, &name)
    }

    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
        live_docs: &LiveDocs,
    ) -> Result<String> {
        let name = generation_file(segment, LIVE_DOCS_EXTENSION, generation)?;
        let result = (|| -> Result<()> {
            let mut out = create_writer(storage, &name)?;
            out.write_header(LIVE_DOCS_MAGIC, FORMAT_VERSION)?;
            out.write_varint(live_docs.max_doc() as u64)?;
            out.write_varint(live_docs.deleted_count() as u64)?;
            out.write_bytes(&live_docs.to_bytes())?;
            out.finish()
        })();
        if let Err(e) = result {
            delete_quietly(storage, std::slice::from_ref(&name));
            return Err(e);
        }
        Ok(name)
    }

    fn read_live_docs(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
        max_doc: u32,
    ) -> Result<LiveDocs> {
        let name = generation_file(segment, LIVE_DOCS_EXTENSION, generation)?;
        let mut input = open_verified(storage, &name)?;
        input.check_header(LIVE_DOCS_MAGIC, FORMAT_VERSION, FORMAT_VERSION)?;
        let stored_max_doc = input.read_varint_u32()?;
        if stored_max_doc != max_doc {
            return Err(QuireError::corrupt(format!(
                "{name}: written for maxDoc={stored_max_doc}, segment has {max_doc}"
            )));
        }
        let deleted = input.read_varint_u32()?;
        let live_docs = LiveDocs::from_bytes(&input.read_bytes()?, max_doc)?;
        if live_docs.deleted_count() != deleted {
            return Err(QuireError::corrupt(format!(
                "{name}: header says {deleted} deletions, bitmap has {}",
                live_docs.deleted_count()
            )));
        }
        Ok(live_docs)
    }

    fn write_doc_values_updates(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
        columns: &BTreeMap<u32, DocValuesColumn>,
    ) -> Result<String> {
        let name = generation_file(segment, DOC_VALUES_UPDATE_EXTENSION, generation)?;
        let result = (|| -> Result<()> {
            let mut out = create_writer(storage, &name)?;
            out.write_header(DOC_VALUES_MAGIC, FORMAT_VERSION)?;
            write_doc_values(&mut out, columns)?;
            out.finish()
        })();
        if let Err(e) = result {
            delete_quietly(storage, std::slice::from_ref(&name));
            return Err(e);
        }
        Ok(name)
    }

    fn read_doc_values_updates(
        &self,
        storage: &dyn Storage,
        segment: &str,
        generation: i64,
        max_doc: u32,
    ) -> Result<BTreeMap<u32, DocValuesColumn>> {
        let name = generation_file(segment, DOC_VALUES_UPDATE_EXTENSION, generation)?;
        let mut input = open_verified(storage, &name)?;
        input.check_header(DOC_VALUES_MAGIC, FORMAT_VERSION, FORMAT_VERSION)?;
        read_doc_values(&mut input, max_doc)
    }
}

fn read_field_infos_file(storage: &dyn Storage, name: &str) -> Result<FieldInfos> {
    let mut input = open_verified(storage, name)?;
    input.check_header(FIELD_INFOS_MAGIC, FORMAT_VERSION, FORMAT_VERSION)?;
    let count = input.read_varint()?;
    let mut infos = Vec::with_capacity(count as usize);
    for _ in 0..count {
        infos.push(read_field_info(&mut input)?);
    }
    FieldInfos::new(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::field_info::FieldInfo;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    fn sample_core() -> SegmentCore {
        let mut body = FieldInfo::new("body", 0);
        body.index_options = IndexOptions::DocsAndFreqsAndPositionsAndOffsets;
        body.store_payloads = true;
        let mut price = FieldInfo::new("price", 1);
        price.doc_values_type = DocValuesType::Numeric;
        let field_infos = FieldInfos::new(vec![body, price]).unwrap();

        let mut terms = BTreeMap::new();
        terms.insert(
            b"quick".to_vec(),
            vec![Posting {
                doc: 1,
                freq: 2,
                positions: vec![
                    PositionEntry {
                        position: 0,
                        start_offset: 0,
                        end_offset: 5,
                        payload: None,
                    },
                    PositionEntry {
                        position: 3,
                        start_offset: 16,
                        end_offset: 21,
                        payload: Some(vec![7]),
                    },
                ],
            }],
        );
        let mut field_terms = BTreeMap::new();
        field_terms.insert(0, FieldTerms::build(terms).unwrap());

        let stored = vec![
            vec![(0, FieldValue::Text("first".into()))],
            vec![(0, FieldValue::Double(1.5)), (1, FieldValue::Int(-3))],
        ];
        let mut norms = BTreeMap::new();
        norms.insert(0, vec![0, 4]);
        let mut doc_values = BTreeMap::new();
        doc_values.insert(1, DocValuesColumn::Numeric(vec![Some(10), None]));

        SegmentCore::new(2, field_infos, field_terms, stored, norms, doc_values).unwrap()
    }

    fn round_trip(compound: bool) {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let codec = StandardCodec;
        let core = sample_core();
        let mut info = SegmentInfo::new("_0", 2, codec.name(), BTreeMap::new(), None);
        codec.write_segment(&storage, &mut info, &core, compound).unwrap();

        assert!(info.files().contains("_0.si"));
        assert_eq!(info.files().contains("_0.cfs"), compound);
        assert_eq!(storage.file_exists("_0.pst"), !compound);

        let read_info = codec.read_segment_info(&storage, "_0", &info.id).unwrap();
        assert_eq!(read_info, info);

        let loaded = codec.read_segment(&storage, &read_info).unwrap();
        assert_eq!(loaded.field_infos(), core.field_infos());
        assert_eq!(loaded.all_stored(), core.all_stored());
        assert_eq!(loaded.all_norms(), core.all_norms());
        assert_eq!(loaded.all_doc_values(), core.all_doc_values());
        let postings = loaded.field_terms(0).unwrap().postings(b"quick").unwrap();
        assert_eq!(postings, core.field_terms(0).unwrap().postings(b"quick").unwrap());
    }

    #[test]
    fn test_segment_round_trip() {
        round_trip(false);
    }

    #[test]
    fn test_compound_segment_round_trip() {
        round_trip(true);
    }

    #[test]
    fn test_segment_id_checked() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let codec = StandardCodec;
        let mut info = SegmentInfo::new("_0", 2, codec.name(), BTreeMap::new(), None);
        codec
            .write_segment(&storage, &mut info, &sample_core(), false)
            .unwrap();
        let other = [0u8; ID_LENGTH];
        assert!(matches!(
            codec.read_segment_info(&storage, "_0", &other),
            Err(QuireError::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_generational_files() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let codec = StandardCodec;

        let mut live = LiveDocs::all_live(20);
        live.delete(3);
        let name = codec.write_live_docs(&storage, "_4", 2, &live).unwrap();
        assert_eq!(name, "_4_2.liv");
        assert_eq!(codec.read_live_docs(&storage, "_4", 2, 20).unwrap(), live);
        assert!(codec.read_live_docs(&storage, "_4", 2, 21).is_err());

        let mut columns = BTreeMap::new();
        columns.insert(5, DocValuesColumn::Binary(vec![None, Some(b"x".to_vec())]));
        let name = codec
            .write_doc_values_updates(&storage, "_4", 1, &columns)
            .unwrap();
        assert_eq!(name, "_4_1.dvu");
        assert_eq!(
            codec.read_doc_values_updates(&storage, "_4", 1, 2).unwrap(),
            columns
        );

        assert_eq!(codec_for_name("Quire10").unwrap().name(), "Quire10");
        assert!(codec_for_name("Other").is_err());
    }
}
