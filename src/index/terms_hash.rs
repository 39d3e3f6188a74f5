//! In-memory term dictionary of a DWPT.
//!
//! Terms are deduplicated per field into a term id. Each term owns a growable
//! byte stream of varint encoded postings:
//!
//! ```text
//! doc_stream: (doc delta, freq, prox bytes of that doc)*
//! prox bytes: (position delta, [start delta, length], [has payload, payload])*
//! ```
//!
//! The last document of a term is kept open in `current_*` until another
//! document for the same term arrives or the buffer is sealed, because its
//! frequency is only known then.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::error::{QuireError, Result};
use crate::index::field_info::{FieldInfos, IndexOptions};
use crate::index::segment_core::{FieldTerms, PositionEntry, Posting};
use crate::util::varint::{self, VarIntCursor};

const BYTES_PER_TERM: usize = 96;

#[derive(Debug, Default)]
struct PostingsBuffer {
    doc_stream: Vec<u8>,
    last_doc: Option<u32>,
    current_doc: Option<u32>,
    current_freq: u32,
    current_prox: Vec<u8>,
    last_position: u32,
    last_start_offset: u32,
}

impl PostingsBuffer {
    /// Close the open document, writing it to the doc stream. Returns the
    /// number of bytes added.
    fn close_doc(&mut self) -> usize {
        let Some(doc) = self.current_doc.take() else {
            return 0;
        };
        let before = self.doc_stream.len();
        let delta = doc - self.last_doc.map_or(0, |d| d);
        varint::write_u64(&mut self.doc_stream, delta as u64);
        varint::write_u64(&mut self.doc_stream, self.current_freq as u64);
        varint::write_u64(&mut self.doc_stream, self.current_prox.len() as u64);
        self.doc_stream.extend_from_slice(&self.current_prox);
        self.current_prox.clear();
        self.last_doc = Some(doc);
        self.current_freq = 0;
        self.doc_stream.len() - before
    }
}

#[derive(Debug, Default)]
struct FieldBuffer {
    term_ids: AHashMap<Vec<u8>, usize>,
    postings: Vec<PostingsBuffer>,
}

/// Position data of one token occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOccurrence {
    pub position: u32,
    pub start_offset: u32,
    pub end_offset: u32,
    pub payload: Option<Vec<u8>>,
}

/// Per-field term buffers of one segment under construction.
#[derive(Debug, Default)]
pub struct TermsHash {
    fields: AHashMap<u32, FieldBuffer>,
    bytes_used: usize,
}

impl TermsHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn num_terms(&self) -> usize {
        self.fields.values().map(|f| f.postings.len()).sum()
    }

    /// Record one occurrence of `term` in `doc`.
    ///
    /// Documents must arrive in increasing order per term.
    pub fn add(&mut self, field: u32, term: &[u8], doc: u32, occurrence: &TokenOccurrence) {
        let buffer = self.fields.entry(field).or_default();
        let id = match buffer.term_ids.get(term) {
            Some(id) => *id,
            None => {
                let id = buffer.postings.len();
                buffer.term_ids.insert(term.to_vec(), id);
                buffer.postings.push(PostingsBuffer::default());
                self.bytes_used += BYTES_PER_TERM + term.len();
                id
            }
        };
        let postings = &mut buffer.postings[id];
        if postings.current_doc != Some(doc) {
            self.bytes_used += postings.close_doc();
            postings.current_doc = Some(doc);
            postings.last_position = 0;
            postings.last_start_offset = 0;
        }
        postings.current_freq += 1;
        let before = postings.current_prox.len();
        let prox = &mut postings.current_prox;
        varint::write_u64(prox, (occurrence.position - postings.last_position) as u64);
        varint::write_u64(
            prox,
            (occurrence.start_offset - postings.last_start_offset) as u64,
        );
        varint::write_u64(
            prox,
            (occurrence.end_offset - occurrence.start_offset) as u64,
        );
        match &occurrence.payload {
            Some(payload) => {
                prox.push(1);
                varint::write_u64(prox, payload.len() as u64);
                prox.extend_from_slice(payload);
            }
            None => prox.push(0),
        }
        postings.last_position = occurrence.position;
        postings.last_start_offset = occurrence.start_offset;
        self.bytes_used += postings.current_prox.len() - before;
    }

    /// Seal the buffers into per-field term dictionaries.
    ///
    /// Positions, offsets and payloads are kept only as far as each field's
    /// index options ask for.
    pub fn finish(mut self, field_infos: &FieldInfos) -> Result<BTreeMap<u32, FieldTerms>> {
        let mut out = BTreeMap::new();
        for (number, mut buffer) in self.fields.drain() {
            let info = field_infos.by_number(number).ok_or_else(|| {
                QuireError::internal(format!("terms buffered for unknown field {number}"))
            })?;
            let options = info.index_options;
            let mut terms = BTreeMap::new();
            for (term, id) in buffer.term_ids.drain() {
                let postings = &mut buffer.postings[id];
                postings.close_doc();
                terms.insert(term, decode(&postings.doc_stream, options, info.store_payloads)?);
            }
            out.insert(number, FieldTerms::build(terms)?);
        }
        Ok(out)
    }
}

fn decode(stream: &[u8], options: IndexOptions, keep_payloads: bool) -> Result<Vec<Posting>> {
    let mut cursor = VarIntCursor::new(stream);
    let mut list = Vec::new();
    let mut doc = 0u32;
    while !cursor.is_empty() {
        doc += cursor.read_u32()?;
        let freq = cursor.read_u32()?;
        let prox_len = cursor.read_u64()? as usize;
        let mut prox = VarIntCursor::new(cursor.read_bytes(prox_len)?);
        let mut positions = Vec::new();
        let mut position = 0u32;
        let mut start_offset = 0u32;
        while !prox.is_empty() {
            position += prox.read_u32()?;
            start_offset += prox.read_u32()?;
            let end_offset = start_offset + prox.read_u32()?;
            let payload = match prox.read_bytes(1)?[0] {
                0 => None,
                _ => {
                    let len = prox.read_u64()? as usize;
                    Some(prox.read_bytes(len)?.to_vec())
                }
            };
            if options.has_positions() {
                positions.push(PositionEntry {
                    position,
                    start_offset: if options.has_offsets() { start_offset } else { 0 },
                    end_offset: if options.has_offsets() { end_offset } else { 0 },
                    payload: if keep_payloads { payload } else { None },
                });
            }
        }
        list.push(Posting {
            doc,
            freq: if options.has_freqs() { freq } else { 1 },
            positions,
        });
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::field_info::FieldInfo;

    fn occurrence(position: u32, start: u32) -> TokenOccurrence {
        TokenOccurrence {
            position,
            start_offset: start,
            end_offset: start + 3,
            payload: None,
        }
    }

    #[test]
    fn test_postings_decoded_per_options() {
        let mut body = FieldInfo::new("body", 0);
        body.index_options = IndexOptions::DocsAndFreqsAndPositions;
        let mut id = FieldInfo::new("id", 1);
        id.index_options = IndexOptions::Docs;
        let infos = FieldInfos::new(vec![body, id]).unwrap();

        let mut hash = TermsHash::new();
        hash.add(0, b"fox", 0, &occurrence(1, 4));
        hash.add(0, b"fox", 0, &occurrence(5, 20));
        hash.add(0, b"fox", 2, &occurrence(0, 0));
        hash.add(1, b"7", 2, &occurrence(0, 0));
        assert!(hash.bytes_used() > 0);
        assert_eq!(hash.num_terms(), 2);

        let fields = hash.finish(&infos).unwrap();
        let fox = fields[&0].postings(b"fox").unwrap();
        assert_eq!(fox.len(), 2);
        assert_eq!(fox[0].doc, 0);
        assert_eq!(fox[0].freq, 2);
        assert_eq!(
            fox[0].positions.iter().map(|p| p.position).collect::<Vec<_>>(),
            vec![1, 5]
        );
        // offsets are not indexed for this field
        assert_eq!(fox[0].positions[1].start_offset, 0);
        assert_eq!(fox[1].doc, 2);

        let seven = fields[&1].postings(b"7").unwrap();
        assert_eq!(seven[0].doc, 2);
        assert!(seven[0].positions.is_empty());
    }
}
