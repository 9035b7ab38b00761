use super::StreamRecord;
use crate::error::{AppError, AppResult};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Parse one complete line.
pub fn decode_line(line: &str) -> AppResult<StreamRecord> {
    serde_json::from_str(line).map_err(|e| {
        let preview: String = line.chars().take(80).collect();
        AppError::MalformedStreamLine(format!("{} in {:?}", e, preview))
    })
}

/// Incremental NDJSON decoder. Bytes may arrive split anywhere, including
/// inside a multi-byte character; only complete lines are parsed.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
    /// Leading bytes of `buffer` already searched for a newline.
    scanned: usize,
    skipped: usize,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines dropped because they failed to parse.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Feed bytes, returning the records of every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamRecord> {
        self.buffer.extend_from_slice(bytes);

        let mut records = Vec::new();
        let mut consumed = 0;
        let mut from = self.scanned;
        while let Some(pos) = self.buffer[from..].iter().position(|&b| b == b'\n') {
            let end = from + pos;
            if let Some(record) = self.parse(consumed, end) {
                records.push(record);
            }
            consumed = end + 1;
            from = consumed;
        }
        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();
        records
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<StreamRecord> {
        let len = self.buffer.len();
        let record = self.parse(0, len);
        self.buffer.clear();
        self.scanned = 0;
        record
    }

    fn parse(&mut self, start: usize, end: usize) -> Option<StreamRecord> {
        let raw = &self.buffer[start..end];
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim(),
            Err(e) => {
                warn!("Skipping stream line that is not UTF-8: {}", e);
                self.skipped += 1;
                return None;
            }
        };
        if line.is_empty() {
            return None;
        }
        match decode_line(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping stream line: {}", e);
                self.skipped += 1;
                None
            }
        }
    }
}

/// Records decoded by a background task, pulled through a bounded channel.
pub struct RecordStream {
    rx: mpsc::Receiver<StreamRecord>,
    task: JoinHandle<()>,
}

impl RecordStream {
    /// Next record, or `None` once the transport ended or the stream was cancelled.
    pub async fn recv(&mut self) -> Option<StreamRecord> {
        self.rx.recv().await
    }

    /// Stop decoding. Records already received stay with the caller.
    pub fn cancel(&mut self) {
        self.task.abort();
        self.rx.close();
    }

    pub async fn collect(mut self) -> Vec<StreamRecord> {
        let mut records = Vec::new();
        while let Some(record) = self.recv().await {
            records.push(record);
        }
        records
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Decode a byte stream on its own task.
///
/// A transport error ends the stream after whatever was decoded so far.
pub fn spawn_decoder<S, B, E>(body: S, capacity: usize) -> RecordStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let task = tokio::spawn(async move {
        let mut decoder = NdjsonDecoder::new();
        let mut body = Box::pin(body);

        while let Some(item) = body.next().await {
            match item {
                Ok(bytes) => {
                    for record in decoder.push(bytes.as_ref()) {
                        if tx.send(record).await.is_err() {
                            debug!("Record consumer went away, stopping decoder");
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("Stream transport failed: {}", e);
                    return;
                }
            }
        }

        if let Some(record) = decoder.finish() {
            let _ = tx.send(record).await;
        }
        if decoder.skipped() > 0 {
            warn!("Stream finished with {} malformed line(s) skipped", decoder.skipped());
        }
    });

    RecordStream { rx, task }
}
