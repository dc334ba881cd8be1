//! JSON object framing layer
//!
//! Locates complete top-level JSON objects inside a continuously appended
//! byte buffer. The CLI writes one object per line, but objects may also be
//! comma-joined or split at arbitrary byte boundaries across reads, so the
//! framer tracks brace depth and string-literal state instead of relying on
//! newlines.
//!
//! The framer never parses JSON into values; it only hands back the raw text
//! of each object together with the line it started on. Errors are reported
//! in stream order next to the objects, and the framer keeps going after
//! them: a bad object is skipped, and after an overflow the rest of the
//! offending line is discarded.

use tracing::{trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Default upper bound for unconsumed bytes held by the framer (10 MiB)
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

/// Error types for JSON object framing
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    #[error(
        "Buffer size exceeded: {size} bytes buffered (max: {max}) at line {line}, column {column}"
    )]
    BufferOverflow {
        size: usize,
        max: usize,
        line: usize,
        column: usize,
    },

    #[error("Invalid UTF-8 in JSON object at line {line}, column {column}")]
    InvalidUtf8 { line: usize, column: usize },
}

// ============================================================================
// Framed Output
// ============================================================================

/// A complete JSON object extracted from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedObject {
    /// Raw object text, starting with `{` and ending with the matching `}`
    pub raw: String,

    /// 1-based line on which the object started
    pub line: usize,
}

/// One result of a feed: an object or the error that replaced it
pub type FramedItem = Result<FramedObject, FramingError>;

/// Scanner state for the object currently being assembled
///
/// Kept across feeds so a large object arriving in many small chunks is
/// scanned once rather than from the start on every feed.
#[derive(Debug, Default, Clone, Copy)]
struct ScanState {
    /// An object start (`{`) has been seen at buffer offset 0
    active: bool,
    /// Next byte offset to examine
    pos: usize,
    /// Current brace depth
    depth: usize,
    /// Inside a string literal
    in_string: bool,
    /// Previous byte was a backslash inside a string literal
    escaped: bool,
}

// ============================================================================
// Framer
// ============================================================================

/// Incremental extractor of top-level JSON objects
#[derive(Debug)]
pub struct JsonObjectFramer {
    buffer: Vec<u8>,
    max_buffer_size: usize,
    scan: ScanState,
    /// Line of the first byte in `buffer`
    line: usize,
    /// Column of the first byte in `buffer`
    column: usize,
    /// Discard input up to the next newline before scanning again
    resync: bool,
}

impl Default for JsonObjectFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_SIZE)
    }
}

impl JsonObjectFramer {
    /// Create a framer that fails once more than `max_buffer_size` bytes
    /// remain unconsumed
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_size,
            scan: ScanState::default(),
            line: 1,
            column: 1,
            resync: false,
        }
    }

    /// Append bytes and extract every object that is now complete
    ///
    /// Items come back in stream order. On `BufferOverflow` the buffered
    /// bytes are discarded, and so is the rest of their line when it arrives;
    /// objects on later lines are extracted as usual.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FramedItem> {
        self.buffer.extend_from_slice(bytes);
        let mut items = self.extract();

        if self.buffer.len() > self.max_buffer_size {
            items.push(Err(FramingError::BufferOverflow {
                size: self.buffer.len(),
                max: self.max_buffer_size,
                line: self.line,
                column: self.column,
            }));
            self.resync = self.buffer.last() != Some(&b'\n');
            let len = self.buffer.len();
            self.advance_position(0, len);
            self.buffer.clear();
            self.scan = ScanState::default();
        }

        items
    }

    /// Bytes not yet consumed by an extracted object
    pub fn remainder(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of unconsumed bytes
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether anything other than separators is waiting for more input
    pub fn has_partial(&self) -> bool {
        self.buffer
            .iter()
            .any(|b| !b.is_ascii_whitespace() && *b != b',')
    }

    /// Drop all buffered bytes and scanner state
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan = ScanState::default();
        self.resync = false;
    }

    fn extract(&mut self) -> Vec<FramedItem> {
        let mut items = Vec::new();
        let mut start = 0;

        loop {
            if !self.scan.active {
                if self.resync {
                    let newline = self.buffer[start..].iter().position(|b| *b == b'\n');
                    let end = newline.map_or(self.buffer.len(), |offset| start + offset + 1);
                    trace!(
                        "JsonObjectFramer: skipped {} bytes while resyncing",
                        end - start
                    );
                    self.advance_position(start, end);
                    start = end;
                    if newline.is_none() {
                        break;
                    }
                    self.resync = false;
                }

                let skip = self.buffer[start..]
                    .iter()
                    .take_while(|b| b.is_ascii_whitespace() || **b == b',')
                    .count();
                self.advance_position(start, start + skip);
                start += skip;

                // Anything other than `{` means the writer is mid-line or
                // emitted noise; wait for more input rather than guessing.
                if self.buffer.get(start) != Some(&b'{') {
                    break;
                }

                self.scan = ScanState {
                    active: true,
                    pos: start,
                    ..ScanState::default()
                };
            }

            match self.scan_to_object_end() {
                Some(end) => {
                    let (line, column) = (self.line, self.column);
                    match std::str::from_utf8(&self.buffer[start..end]) {
                        Ok(raw) => {
                            trace!("JsonObjectFramer: extracted object ({} bytes)", raw.len());
                            items.push(Ok(FramedObject {
                                raw: raw.to_string(),
                                line,
                            }));
                        }
                        Err(_) => {
                            warn!(
                                "JsonObjectFramer: skipping invalid UTF-8 object at {line}:{column}"
                            );
                            items.push(Err(FramingError::InvalidUtf8 { line, column }));
                        }
                    }

                    self.advance_position(start, end);
                    start = end;
                    self.scan = ScanState::default();
                }
                None => break,
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
            if self.scan.active {
                self.scan.pos -= start;
            }
        }

        items
    }

    /// Continue scanning the active object; returns the exclusive end offset
    /// once the closing brace of the top-level object is found
    fn scan_to_object_end(&mut self) -> Option<usize> {
        let scan = &mut self.scan;

        while scan.pos < self.buffer.len() {
            let byte = self.buffer[scan.pos];
            scan.pos += 1;

            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if byte == b'\\' {
                    scan.escaped = true;
                } else if byte == b'"' {
                    scan.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => scan.in_string = true,
                b'{' => scan.depth += 1,
                b'}' => {
                    scan.depth = scan.depth.saturating_sub(1);
                    if scan.depth == 0 {
                        return Some(scan.pos);
                    }
                }
                _ => {}
            }
        }

        None
    }

    /// Move the line/column cursor over `buffer[from..to]`
    fn advance_position(&mut self, from: usize, to: usize) {
        for byte in &self.buffer[from..to] {
            if *byte == b'\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn raws(objects: &[FramedObject]) -> Vec<&str> {
        objects.iter().map(|o| o.raw.as_str()).collect()
    }

    /// Feed bytes that are expected to frame without errors
    fn feed_ok(framer: &mut JsonObjectFramer, bytes: &[u8]) -> Vec<FramedObject> {
        framer
            .feed(bytes)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_single_complete_object() {
        let mut framer = JsonObjectFramer::default();
        let objects = feed_ok(&mut framer, br#"{"type":"user","content":"hi"}"#);

        assert_eq!(raws(&objects), vec![r#"{"type":"user","content":"hi"}"#]);
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn test_split_across_feeds() {
        let mut framer = JsonObjectFramer::default();

        let first = feed_ok(&mut framer, br#"{"type":"user","content":"hi"}{"typ"#);
        assert_eq!(raws(&first), vec![r#"{"type":"user","content":"hi"}"#]);
        assert_eq!(framer.remainder(), br#"{"typ"#);

        let second = feed_ok(&mut framer, br#"e":"result","result":"ok"}"#);
        assert_eq!(raws(&second), vec![r#"{"type":"result","result":"ok"}"#]);
        assert!(!framer.has_partial());
    }

    #[test]
    fn test_comma_and_whitespace_separators() {
        let mut framer = JsonObjectFramer::default();
        let objects = feed_ok(&mut framer, b"{\"a\":1} ,\n{\"b\":2},{\"c\":3}\n");

        assert_eq!(
            raws(&objects),
            vec![r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#]
        );
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let mut framer = JsonObjectFramer::default();
        let input = r#"{"text":"a } brace { and \" quote \\","n":{"x":"}"}}"#;
        let objects = feed_ok(&mut framer, input.as_bytes());

        assert_eq!(raws(&objects), vec![input]);
    }

    #[test]
    fn test_escape_split_across_feeds() {
        let mut framer = JsonObjectFramer::default();

        assert!(feed_ok(&mut framer, br#"{"s":"x\"#).is_empty());
        assert!(feed_ok(&mut framer, br#""}"#).is_empty());
        let objects = feed_ok(&mut framer, br#""}"#);

        assert_eq!(raws(&objects), vec![r#"{"s":"x\"}"}"#]);
    }

    #[test]
    fn test_every_split_point_yields_same_objects() {
        let stream = concat!(
            "{\"type\":\"user\",\"x\":\"{}\"}\n",
            "{\"type\":\"result\"},{\"k\":[1,{\"z\":2}]}\n"
        );
        let expected = vec![
            r#"{"type":"user","x":"{}"}"#,
            r#"{"type":"result"}"#,
            r#"{"k":[1,{"z":2}]}"#,
        ];

        for split in 0..=stream.len() {
            let mut framer = JsonObjectFramer::default();
            let mut collected = feed_ok(&mut framer, &stream.as_bytes()[..split]);
            collected.extend(feed_ok(&mut framer, &stream.as_bytes()[split..]));
            assert_eq!(raws(&collected), expected, "split at {split}");
        }
    }

    #[test]
    fn test_chunked_feeds_yield_same_objects() {
        let stream = concat!(
            "{\"type\":\"user\",\"x\":\"{\\\"}\"}\n",
            "{\"t\":\"世界\"},{\"k\":[1,{\"z\":2}]}\n"
        );
        let expected = vec![
            r#"{"type":"user","x":"{\"}"}"#,
            "{\"t\":\"世界\"}",
            r#"{"k":[1,{"z":2}]}"#,
        ];

        for size in [1, 2, 3, 5, 7, 16] {
            let mut framer = JsonObjectFramer::default();
            let mut collected = Vec::new();
            for chunk in stream.as_bytes().chunks(size) {
                collected.extend(feed_ok(&mut framer, chunk));
            }
            assert_eq!(raws(&collected), expected, "chunk size {size}");
            assert_eq!(framer.buffered_len(), 0, "chunk size {size}");
        }
    }

    #[test]
    fn test_non_object_prefix_halts_without_error() {
        let mut framer = JsonObjectFramer::default();
        let objects = feed_ok(&mut framer, b"not json {\"a\":1}");

        assert!(objects.is_empty());
        assert_eq!(framer.buffered_len(), b"not json {\"a\":1}".len());
    }

    #[test]
    fn test_buffer_overflow_is_fatal() {
        let mut framer = JsonObjectFramer::new(16);

        assert!(feed_ok(&mut framer, b"{\"a\":\"0123").is_empty());
        let items = framer.feed(b"456789abcdef");

        assert_eq!(
            items,
            vec![Err(FramingError::BufferOverflow {
                size: 22,
                max: 16,
                line: 1,
                column: 1,
            })]
        );
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn test_overflow_discards_rest_of_line_then_recovers() {
        let mut framer = JsonObjectFramer::new(64);
        let oversized = format!("{{\"type\":\"assistant\",\"text\":\"{}", "x".repeat(60));

        let items = framer.feed(oversized.as_bytes());
        assert!(matches!(
            items.as_slice(),
            [Err(FramingError::BufferOverflow { max: 64, .. })]
        ));

        let tail = b"tail\"}\n{\"type\":\"result\",\"result\":\"ok\"}\n";
        let objects = feed_ok(&mut framer, tail);
        assert_eq!(raws(&objects), vec![r#"{"type":"result","result":"ok"}"#]);
        assert_eq!(objects[0].line, 2);
        assert!(!framer.has_partial());
    }

    #[test]
    fn test_overflow_resync_spans_several_feeds() {
        let mut framer = JsonObjectFramer::new(8);

        assert_eq!(framer.feed(b"{\"a\":\"0123456789").len(), 1);
        assert!(feed_ok(&mut framer, b"still the same line").is_empty());
        assert_eq!(framer.buffered_len(), 0);

        let objects = feed_ok(&mut framer, b"\"}\n{\"b\":1}");
        assert_eq!(raws(&objects), vec![r#"{"b":1}"#]);
    }

    #[test]
    fn test_invalid_utf8_object_is_skipped() {
        let mut framer = JsonObjectFramer::default();
        let mut input = br#"{"type":"control_response","ok":1}{"s":""#.to_vec();
        input.extend_from_slice(b"\xff\"}");

        let items = framer.feed(&input);
        match items.as_slice() {
            [Ok(first), Err(FramingError::InvalidUtf8 { line, column })] => {
                assert_eq!(first.raw, r#"{"type":"control_response","ok":1}"#);
                assert_eq!((*line, *column), (1, 35));
            }
            other => panic!("Expected object then InvalidUtf8, got: {other:?}"),
        }
        assert_eq!(framer.buffered_len(), 0);

        let objects = feed_ok(&mut framer, br#"{"type":"user"}"#);
        assert_eq!(raws(&objects), vec![r#"{"type":"user"}"#]);
    }

    #[test]
    fn test_completed_objects_do_not_count_towards_cap() {
        let mut framer = JsonObjectFramer::new(16);
        let objects = feed_ok(&mut framer, b"{\"a\":\"0123456789abcdef\"}");

        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn test_line_numbers_track_newlines() {
        let mut framer = JsonObjectFramer::default();
        let objects = feed_ok(&mut framer, b"{\"a\":1}\n\n{\"b\":\n2}\n{\"c\":3}");

        let lines: Vec<usize> = objects.iter().map(|o| o.line).collect();
        assert_eq!(lines, vec![1, 3, 5]);
    }

    #[test]
    fn test_reset_clears_partial_state() {
        let mut framer = JsonObjectFramer::default();
        feed_ok(&mut framer, b"{\"a\":\"unterminated");
        assert!(framer.has_partial());

        framer.reset();
        let objects = feed_ok(&mut framer, b"{\"b\":1}");
        assert_eq!(raws(&objects), vec![r#"{"b":1}"#]);
    }

    #[test]
    fn test_multibyte_utf8_split() {
        let mut framer = JsonObjectFramer::default();
        let input = "{\"t\":\"世界\"}".as_bytes();

        assert!(feed_ok(&mut framer, &input[..8]).is_empty());
        let objects = feed_ok(&mut framer, &input[8..]);
        assert_eq!(raws(&objects), vec!["{\"t\":\"世界\"}"]);
    }
}
