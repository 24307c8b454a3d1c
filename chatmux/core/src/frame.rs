//! Event Frame Parser
//!
//! Turns an incrementally delivered response body into discrete
//! `(event, data)` frames. Knows nothing about conversations.
//!
//! # Wire Format
//!
//! ```text
//! event: status
//! data: {"stage":"正在检索","conversationId":42}
//!
//! event: content
//! data: Hel
//!
//! ```
//!
//! - A blank line ends a frame
//! - `event:` sets the frame type, `data:` appends one payload line
//! - Multiple `data:` lines are joined with `\n`
//! - Lines starting with `:` are comments; `id:` and `retry:` are ignored
//!
//! Only complete lines are ever interpreted. A partial trailing line stays in
//! the buffer until the chunk containing its newline arrives, so the frames
//! produced never depend on where the transport split the bytes (including
//! splits inside a multi-byte UTF-8 sequence).

use tracing::debug;

/// Event type used when a frame carries no `event:` line
pub const DEFAULT_EVENT: &str = "message";

/// Minimum buffer capacity for the parser
const MIN_BUFFER_CAPACITY: usize = 4096;

/// One parsed frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    /// Event type (`status`, `content`, ...)
    pub event: String,
    /// Payload, data lines joined with `\n`
    pub data: String,
}

impl RawFrame {
    /// Create a frame
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// Incremental frame parser
///
/// Feed byte chunks in arrival order; each call returns the frames those bytes
/// completed, in order.
#[derive(Debug)]
pub struct EventFrameParser {
    /// Bytes of the incomplete trailing line
    buffer: Vec<u8>,
    /// Event type of the frame being assembled
    event: Option<String>,
    /// Data lines of the frame being assembled
    data: Vec<String>,
}

impl Default for EventFrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFrameParser {
    /// Create a parser with an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            event: None,
            data: Vec::new(),
        }
    }

    /// Consume one chunk and return every frame it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;

        while let Some(pos) = self.buffer[consumed..].iter().position(|&b| b == b'\n') {
            let end = consumed + pos;
            let mut line = &self.buffer[consumed..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            consumed = end + 1;

            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        self.buffer.drain(..consumed);
        frames
    }

    /// Flush at end of stream
    ///
    /// Interprets a final unterminated line and emits the frame in progress, if
    /// any. The parser is empty afterwards.
    pub fn finish(&mut self) -> Option<RawFrame> {
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.take_frame()
    }

    /// Number of buffered bytes not yet forming a complete line
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn process_line(&mut self, line: &str) -> Option<RawFrame> {
        if line.is_empty() {
            return self.take_frame();
        }

        if line.starts_with(':') {
            return None;
        }

        if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            let value = rest.strip_prefix(' ').unwrap_or(rest);
            self.data.push(value.to_string());
        } else {
            debug!(line = %line, "Ignoring unsupported SSE field");
        }

        None
    }

    fn take_frame(&mut self) -> Option<RawFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            // `event:` with no data carries nothing to dispatch
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(RawFrame {
            event: event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const STREAM: &str = "event: status\ndata: \"检索中\"\n\nevent: content\ndata: Hel\n\nevent: content\ndata: lo\n\nevent: done\ndata: {}\n\n";

    fn parse_all(chunks: &[&[u8]]) -> Vec<RawFrame> {
        let mut parser = EventFrameParser::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(parser.feed(chunk));
        }
        frames.extend(parser.finish());
        frames
    }

    #[test]
    fn test_parse_single_chunk() {
        let frames = parse_all(&[STREAM.as_bytes()]);
        assert_eq!(
            frames,
            vec![
                RawFrame::new("status", "\"检索中\""),
                RawFrame::new("content", "Hel"),
                RawFrame::new("content", "lo"),
                RawFrame::new("done", "{}"),
            ]
        );
    }

    #[test]
    fn test_chunk_boundary_independence() {
        let bytes = STREAM.as_bytes();
        let expected = parse_all(&[bytes]);

        // Every split point, including ones inside multi-byte characters
        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(parse_all(&[a, b]), expected, "split at {split}");
        }

        // Byte-at-a-time
        let singles: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(parse_all(&singles), expected);

        // Uneven chunk sizes
        for size in [2, 3, 5, 7, 11] {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(parse_all(&chunks), expected, "chunk size {size}");
        }
    }

    #[test]
    fn test_partial_line_not_emitted() {
        let mut parser = EventFrameParser::new();
        assert!(parser.feed(b"event: content\nda").is_empty());
        assert_eq!(parser.pending_bytes(), 2);
        assert!(parser.feed(b"ta: Hi\n").is_empty());
        assert_eq!(parser.feed(b"\n"), vec![RawFrame::new("content", "Hi")]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let frames = parse_all(&[b"event: content\r\ndata: x\r\n\r\n"]);
        assert_eq!(frames, vec![RawFrame::new("content", "x")]);
    }

    #[test]
    fn test_multiple_data_lines_joined() {
        let frames = parse_all(&[b"event: content\ndata: line one\ndata: line two\n\n"]);
        assert_eq!(frames, vec![RawFrame::new("content", "line one\nline two")]);
    }

    #[test]
    fn test_data_without_space_after_colon() {
        let frames = parse_all(&[b"event:content\ndata:{\"content\":\"a\"}\n\n"]);
        assert_eq!(frames, vec![RawFrame::new("content", "{\"content\":\"a\"}")]);
    }

    #[test]
    fn test_comments_and_ignored_fields() {
        let frames = parse_all(&[b": keepalive\nid: 7\nretry: 1000\nevent: done\ndata: {}\n\n"]);
        assert_eq!(frames, vec![RawFrame::new("done", "{}")]);
    }

    #[test]
    fn test_unknown_event_forwarded_verbatim() {
        let frames = parse_all(&[b"event: heartbeat\ndata: ping\n\n"]);
        assert_eq!(frames, vec![RawFrame::new("heartbeat", "ping")]);
    }

    #[test]
    fn test_missing_event_uses_default() {
        let frames = parse_all(&[b"data: hello\n\n"]);
        assert_eq!(frames, vec![RawFrame::new(DEFAULT_EVENT, "hello")]);
    }

    #[test]
    fn test_event_without_data_dropped() {
        let frames = parse_all(&[b"event: status\n\nevent: content\ndata: a\n\n"]);
        assert_eq!(frames, vec![RawFrame::new("content", "a")]);
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut parser = EventFrameParser::new();
        assert!(parser.feed(b"event: done\ndata: {}").is_empty());
        assert_eq!(parser.finish(), Some(RawFrame::new("done", "{}")));
        assert_eq!(parser.finish(), None);
    }
}
