//! Bounded word streams and capacity validation.
//!
//! Input files hold one 64-bit word per line as bare hexadecimal digits
//! (`ab00000000030000`). Surrounding whitespace is trimmed and blank lines
//! are skipped; anything else that is not a hex word aborts the read with
//! the file name and the 1-indexed line number.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::config::PipelineConfig;
use crate::error::{ClusterFlowError, Result};
use crate::lane::{Lane, LaneKind};

/// Ordered, immutable sequence of 64-bit words read from one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WordStream {
    words: Vec<u64>,
    source: Option<PathBuf>,
}

impl WordStream {
    /// Wraps words that did not come from a file.
    #[must_use]
    pub fn from_words(words: Vec<u64>) -> Self {
        Self {
            words,
            source: None,
        }
    }

    /// Reads and decodes a hex word file.
    pub fn read_hex_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| ClusterFlowError::InputIo {
            path: path.to_path_buf(),
            source,
        })?;
        let words = decode_hex_lines(std::io::BufReader::new(file), path)?;
        Ok(Self {
            words,
            source: Some(path.to_path_buf()),
        })
    }

    /// Decodes hex words from an in-memory document, attributing errors to `label`.
    pub fn parse_hex(text: &str, label: impl AsRef<Path>) -> Result<Self> {
        let words = decode_hex_lines(text.as_bytes(), label.as_ref())?;
        Ok(Self::from_words(words))
    }

    /// Decoded words.
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Number of words.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether the stream is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Size of the stream in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of_val(self.words.as_slice())
    }

    /// File the stream was read from, if any.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

fn decode_hex_lines<R: BufRead>(reader: R, path: &Path) -> Result<Vec<u64>> {
    let mut words = Vec::new();

    // Split on raw bytes so a line that is not UTF-8 is reported as a format
    // error on that line instead of an I/O failure of the whole file.
    for (idx, line) in reader.split(b'\n').enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|source| ClusterFlowError::InputIo {
            path: path.to_path_buf(),
            source,
        })?;
        let trimmed = trim_ascii(&line);
        if trimmed.is_empty() {
            continue;
        }

        let format_error = |reason: &str| ClusterFlowError::InputFormat {
            path: path.to_path_buf(),
            line: line_no,
            content: String::from_utf8_lossy(trimmed).into_owned(),
            reason: reason.to_string(),
        };

        if !trimmed.iter().all(u8::is_ascii_hexdigit) {
            return Err(format_error("Non-hex character"));
        }
        // All bytes are hex digits, so the only failure left is overflow past 64 bits.
        let value = std::str::from_utf8(trimmed)
            .ok()
            .and_then(|digits| u64::from_str_radix(digits, 16).ok())
            .ok_or_else(|| format_error("Failed to parse hex word"))?;
        words.push(value);
    }

    Ok(words)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Rejects a stream longer than the lane's input buffer.
///
/// Performs no device interaction and has no side effects on success.
pub fn validate(stream: &WordStream, lane: &Lane) -> Result<()> {
    check_capacity(stream, lane.kind(), lane.input_capacity())
}

/// Configuration-only form of [`validate`], usable before a session exists.
pub fn validate_against(stream: &WordStream, kind: LaneKind, config: &PipelineConfig) -> Result<()> {
    check_capacity(stream, kind, config.input_capacity(kind))
}

fn check_capacity(stream: &WordStream, kind: LaneKind, capacity: usize) -> Result<()> {
    if stream.len() > capacity {
        return Err(ClusterFlowError::CapacityExceeded {
            lane: kind,
            len: stream.len(),
            capacity,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaneGeometry, PipelineConfigBuilder};
    use std::io::Write;

    #[test]
    fn test_parse_hex_words() {
        let stream = WordStream::parse_hex("ab00000000030000\n1\nffffffffffffffff\n", "x").unwrap();
        assert_eq!(
            stream.words(),
            &[0xab00_0000_0003_0000, 1, u64::MAX]
        );
        assert_eq!(stream.size_bytes(), 24);
    }

    #[test]
    fn test_blank_lines_and_whitespace_are_ignored() {
        let stream = WordStream::parse_hex("\n  0a  \r\n\t\n0B\n\n", "x").unwrap();
        assert_eq!(stream.words(), &[0x0a, 0x0b]);
    }

    #[test]
    fn test_non_hex_line_reports_one_indexed_line() {
        let err = WordStream::parse_hex("00\n\nZZZZ\n01\n", "pixel.txt").unwrap_err();
        match err {
            ClusterFlowError::InputFormat {
                path,
                line,
                content,
                reason,
            } => {
                assert_eq!(path, PathBuf::from("pixel.txt"));
                assert_eq!(line, 3);
                assert_eq!(content, "ZZZZ");
                assert_eq!(reason, "Non-hex character");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_prefixed_value_is_rejected() {
        let err = WordStream::parse_hex("0x10\n", "x").unwrap_err();
        assert!(matches!(err, ClusterFlowError::InputFormat { line: 1, .. }));
    }

    #[test]
    fn test_overlong_word_is_rejected() {
        let err = WordStream::parse_hex("1ffffffffffffffff\n", "x").unwrap_err();
        match err {
            ClusterFlowError::InputFormat { reason, .. } => {
                assert_eq!(reason, "Failed to parse hex word")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_read_hex_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0000000000000001").unwrap();
        writeln!(file, "0000000000000002").unwrap();
        let stream = WordStream::read_hex_file(file.path()).unwrap();
        assert_eq!(stream.words(), &[1, 2]);
        assert_eq!(stream.source(), Some(file.path()));
    }

    #[test]
    fn test_invalid_utf8_line_is_format_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"01\n02\n0\xff3\n04\n").unwrap();
        let err = WordStream::read_hex_file(file.path()).unwrap_err();
        match err {
            ClusterFlowError::InputFormat {
                line,
                content,
                reason,
                ..
            } => {
                assert_eq!(line, 3);
                assert_eq!(content, "0\u{fffd}3");
                assert_eq!(reason, "Non-hex character");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_crlf_line_endings_are_trimmed() {
        let stream = WordStream::parse_hex("0a\r\n  0b \r\n\r\n", "x").unwrap();
        assert_eq!(stream.words(), &[0x0a, 0x0b]);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = WordStream::read_hex_file("/nonexistent/clusterflow/pixel.txt").unwrap_err();
        assert!(matches!(err, ClusterFlowError::InputIo { .. }));
    }

    #[test]
    fn test_validate_against_boundary() {
        let config = PipelineConfigBuilder::new()
            .with_geometry(
                LaneKind::Strip,
                LaneGeometry {
                    input_rows: 0,
                    ..LaneGeometry::strip()
                },
            )
            .build()
            .unwrap();
        let capacity = config.input_capacity(LaneKind::Strip);
        assert_eq!(capacity, 4096);

        let exact = WordStream::from_words(vec![0; capacity]);
        assert!(validate_against(&exact, LaneKind::Strip, &config).is_ok());

        let over = WordStream::from_words(vec![0; capacity + 1]);
        let err = validate_against(&over, LaneKind::Strip, &config).unwrap_err();
        assert!(matches!(
            err,
            ClusterFlowError::CapacityExceeded {
                lane: LaneKind::Strip,
                len,
                capacity: c,
            } if len == capacity + 1 && c == capacity
        ));
    }

    #[test]
    fn test_empty_stream_is_valid() {
        let config = PipelineConfig::default();
        assert!(validate_against(&WordStream::default(), LaneKind::Pixel, &config).is_ok());
    }
}
