use super::{StreamRecord, DEFAULT_CHUNK_SIZE};
use crate::model::StoreEntry;
use std::collections::BTreeMap;

/// Serialize one record as a single NDJSON line, newline included.
pub fn encode_line(record: &StreamRecord) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

/// Builds the records of one language's stream.
#[derive(Debug, Clone)]
pub struct StoreEncoder {
    language: String,
    chunk_size: usize,
}

impl StoreEncoder {
    pub fn new(language: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            language: language.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// The opening record, from `(filepath, key count)` pairs.
    pub fn header(&self, files: &[(String, usize)]) -> StreamRecord {
        StreamRecord::Header {
            language: self.language.clone(),
            total_files: files.len(),
            total_keys: files.iter().map(|(_, n)| n).sum(),
        }
    }

    /// `file_header` followed by the file's chunks. A file without entries
    /// gets only its header.
    pub fn file_records(&self, filepath: &str, entries: Vec<StoreEntry>) -> Vec<StreamRecord> {
        let mut records = Vec::with_capacity(1 + entries.len().div_ceil(self.chunk_size));
        records.push(StreamRecord::FileHeader {
            filepath: filepath.to_string(),
            total_keys: entries.len(),
        });

        let mut entries = entries.into_iter().peekable();
        let mut chunk_index = 0;
        while entries.peek().is_some() {
            let batch: BTreeMap<String, StoreEntry> = entries
                .by_ref()
                .take(self.chunk_size)
                .map(|e| (e.key.clone(), e))
                .collect();
            records.push(StreamRecord::Chunk {
                filepath: filepath.to_string(),
                chunk_index,
                entries: batch,
            });
            chunk_index += 1;
        }
        records
    }
}

impl Default for StoreEncoder {
    fn default() -> Self {
        Self::new("", DEFAULT_CHUNK_SIZE)
    }
}
