//! Line-delimited record reader for blob tasks
//!
//! Input blobs hold one JSON array per line; the first element of each array
//! is the record. Lines are NFKD-normalized before parsing. Chunks arrive in arbitrary sizes, so partial lines are
//! buffered until their newline shows up.

use std::collections::VecDeque;

use futures::StreamExt;
use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

use crate::persistence::{ChunkStream, StoreError};

/// Error reading records from a blob
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    /// Downloading a chunk failed
    #[error("blob download failed: {0}")]
    Blob(#[from] StoreError),

    /// A complete line was not valid UTF-8
    #[error("line {line} is not valid UTF-8: {source}")]
    Encoding {
        line: usize,
        #[source]
        source: std::str::Utf8Error,
    },

    /// A complete line was not a JSON array starting with a string
    #[error("line {line} is malformed: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Lazily yields records from a chunk stream
///
/// Malformed complete lines are errors. The final unterminated piece of the
/// blob is parsed best-effort: if it is not a well-formed record, or the
/// record is empty, it is silently dropped.
pub struct SegmentReader {
    chunks: ChunkStream,
    buffer: Vec<u8>,
    ready: VecDeque<String>,
    lines_read: usize,
    exhausted: bool,
}

impl SegmentReader {
    /// Wrap a chunk stream
    pub fn new(chunks: ChunkStream) -> Self {
        Self {
            chunks,
            buffer: Vec::new(),
            ready: VecDeque::new(),
            lines_read: 0,
            exhausted: false,
        }
    }

    /// Next record, or `None` once the blob is exhausted
    pub async fn next_record(&mut self) -> Result<Option<String>, SegmentError> {
        self.fill().await?;
        Ok(self.ready.pop_front())
    }

    /// Look at the next record without consuming it
    pub async fn peek(&mut self) -> Result<Option<&str>, SegmentError> {
        self.fill().await?;
        Ok(self.ready.front().map(String::as_str))
    }

    /// Number of complete lines consumed so far
    pub fn lines_read(&self) -> usize {
        self.lines_read
    }

    async fn fill(&mut self) -> Result<(), SegmentError> {
        while self.ready.is_empty() && !self.exhausted {
            match self.chunks.next().await {
                Some(chunk) => {
                    self.buffer.extend_from_slice(&chunk?);
                    self.split_complete_lines()?;
                }
                None => {
                    self.exhausted = true;
                    let tail = std::mem::take(&mut self.buffer);
                    if let Some(record) = parse_trailing_piece(&tail) {
                        self.ready.push_back(record);
                    }
                }
            }
        }
        Ok(())
    }

    fn split_complete_lines(&mut self) -> Result<(), SegmentError> {
        let Some(last_newline) = self.buffer.iter().rposition(|b| *b == b'\n') else {
            return Ok(());
        };
        let complete: Vec<u8> = self.buffer.drain(..=last_newline).collect();

        for raw in complete[..last_newline].split(|b| *b == b'\n') {
            self.lines_read += 1;
            let line = std::str::from_utf8(raw).map_err(|source| SegmentError::Encoding {
                line: self.lines_read,
                source,
            })?;
            let line: String = line.nfkd().collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record = parse_line(line).map_err(|reason| SegmentError::Malformed {
                line: self.lines_read,
                reason,
            })?;
            self.ready.push_back(record);
        }
        Ok(())
    }
}

/// Extract the trimmed first element of a JSON array line
fn parse_line(line: &str) -> Result<String, String> {
    match serde_json::from_str::<Value>(line).map_err(|e| e.to_string())? {
        Value::Array(items) => match items.into_iter().next() {
            Some(Value::String(record)) => Ok(record.trim().to_string()),
            Some(other) => Err(format!("first element is not a string: {other}")),
            None => Err("empty array".to_string()),
        },
        _ => Err("expected a JSON array".to_string()),
    }
}

fn parse_trailing_piece(tail: &[u8]) -> Option<String> {
    let line: String = std::str::from_utf8(tail).ok()?.nfkd().collect();
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    parse_line(line).ok().filter(|record| !record.is_empty())
}

/// Serialize a record as one input line
pub fn encode_record(record: &str) -> String {
    let mut line = Value::Array(vec![Value::String(record.to_string())]).to_string();
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_over(chunks: Vec<&str>) -> SegmentReader {
        let chunks: Vec<Result<Vec<u8>, StoreError>> = chunks
            .into_iter()
            .map(|c| Ok(c.as_bytes().to_vec()))
            .collect();
        SegmentReader::new(futures::stream::iter(chunks).boxed())
    }

    async fn collect(mut reader: SegmentReader) -> Result<Vec<String>, SegmentError> {
        let mut records = vec![];
        while let Some(record) = reader.next_record().await? {
            records.push(record);
        }
        Ok(records)
    }

    #[tokio::test]
    async fn test_reads_first_elements_trimmed() {
        let reader = reader_over(vec!["[\" a \", 1]\r\n[\"b\"]\n"]);
        assert_eq!(collect(reader).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_lines_are_nfkd_normalized() {
        let reader = reader_over(vec!["[\"\u{fb01}le caf\u{e9}\"]\n[\"\u{fb00}"]);
        assert_eq!(
            collect(reader).await.unwrap(),
            vec!["file cafe\u{301}"]
        );

        let tail = reader_over(vec!["[\"a\"]\n[\"\u{2460} \u{fb00}\"]"]);
        assert_eq!(collect(tail).await.unwrap(), vec!["a", "1 ff"]);
    }

    #[tokio::test]
    async fn test_lines_spanning_chunks() {
        let reader = reader_over(vec!["[\"fi", "rst\"]\n[\"sec", "ond\"]\n"]);
        assert_eq!(collect(reader).await.unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_multibyte_character_split_across_chunks() {
        let text = "[\"caf\u{e9}\"]\n";
        let bytes = text.as_bytes();
        let split = text.find('\u{e9}').unwrap() + 1;
        let chunks: Vec<Result<Vec<u8>, StoreError>> =
            vec![Ok(bytes[..split].to_vec()), Ok(bytes[split..].to_vec())];

        let reader = SegmentReader::new(futures::stream::iter(chunks).boxed());
        assert_eq!(collect(reader).await.unwrap(), vec!["caf\u{e9}"]);
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let reader = reader_over(vec!["\n[\"a\"]\n\n  \n[\"b\"]\n"]);
        assert_eq!(collect(reader).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_kept() {
        let reader = reader_over(vec!["[\"a\"]\n[\"b\"]"]);
        assert_eq!(collect(reader).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_truncated_last_line_is_dropped() {
        let reader = reader_over(vec!["[\"a\"]\n[\"trunc"]);
        assert_eq!(collect(reader).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_malformed_inner_line_fails() {
        let reader = reader_over(vec!["[\"a\"]\n{oops}\n[\"c\"]\n"]);
        let error = collect(reader).await.unwrap_err();
        assert!(matches!(error, SegmentError::Malformed { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_non_string_first_element_fails() {
        let reader = reader_over(vec!["[1]\n"]);
        assert!(matches!(
            collect(reader).await,
            Err(SegmentError::Malformed { line: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_peek_detects_exhaustion() {
        let mut reader = reader_over(vec!["[\"a\"]\n"]);
        assert_eq!(reader.peek().await.unwrap(), Some("a"));
        assert_eq!(reader.next_record().await.unwrap().as_deref(), Some("a"));
        assert_eq!(reader.peek().await.unwrap(), None);
        assert_eq!(reader.lines_read(), 1);
    }

    #[tokio::test]
    async fn test_download_error_propagates() {
        let chunks: Vec<Result<Vec<u8>, StoreError>> =
            vec![Err(StoreError::Backend("connection reset".to_string()))];
        let reader = SegmentReader::new(futures::stream::iter(chunks).boxed());
        assert!(matches!(collect(reader).await, Err(SegmentError::Blob(_))));
    }

    #[tokio::test]
    async fn test_encode_record_round_trip() {
        let line = encode_record("he said \"hi\"");
        assert!(line.ends_with('\n'));

        let reader = reader_over(vec![line.as_str()]);
        assert_eq!(collect(reader).await.unwrap(), vec!["he said \"hi\""]);
    }
}
