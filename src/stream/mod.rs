//! Line-delimited staleness stream: one JSON record per line.
//!
//! A stream is a `header`, then for every file a `file_header` followed by
//! its `chunk`s. Consumers may stop at any point; whatever they already
//! applied stays valid.

mod decoder;
mod encoder;

pub use decoder::{decode_line, spawn_decoder, NdjsonDecoder, RecordStream};
pub use encoder::{encode_line, StoreEncoder};

use crate::model::{MergedTranslation, StoreEntry};
use crate::reconcile::apply_store_entries;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
pub const DEFAULT_CHUNK_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRecord {
    #[serde(rename_all = "camelCase")]
    Header {
        language: String,
        total_files: usize,
        total_keys: usize,
    },
    #[serde(rename_all = "camelCase")]
    FileHeader { filepath: String, total_keys: usize },
    #[serde(rename_all = "camelCase")]
    Chunk {
        filepath: String,
        chunk_index: usize,
        entries: BTreeMap<String, StoreEntry>,
    },
}

impl StreamRecord {
    pub fn filepath(&self) -> Option<&str> {
        match self {
            StreamRecord::Header { .. } => None,
            StreamRecord::FileHeader { filepath, .. } | StreamRecord::Chunk { filepath, .. } => {
                Some(filepath)
            }
        }
    }
}

/// Patch rows of `filepath` with a chunk record. Other records are ignored.
/// Returns the number of rows whose validity changed.
pub fn apply_record(rows: &mut [MergedTranslation], filepath: &str, record: &StreamRecord) -> usize {
    match record {
        StreamRecord::Chunk {
            filepath: chunk_file,
            entries,
            ..
        } if chunk_file == filepath => apply_store_entries(rows, entries),
        _ => 0,
    }
}
