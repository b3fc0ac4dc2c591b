//! Delimiter-terminated text protocol.
//!
//! ```text
//! Request: <KEY> [body]\r\n
//!
//! ECHO hello world\r\n  -> key "ECHO", body "hello world", parameters ["hello", "world"]
//! QUIT\r\n              -> key "QUIT", empty body
//! ```
//!
//! Blank lines are skipped. The delimiter defaults to `\r\n`.

use super::{DecodeResult, FrameDecoder, RequestInfo};
use crate::error::FramingError;

/// A request decoded from one text line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringRequest {
    key: String,
    body: String,
    parameters: Vec<String>,
}

impl StringRequest {
    pub fn new(key: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        let parameters = body.split_whitespace().map(str::to_string).collect();
        Self {
            key: key.into(),
            body,
            parameters,
        }
    }

    /// Split a line into key and body at the first whitespace.
    fn parse(line: &str) -> Self {
        match line.split_once(|c: char| c.is_ascii_whitespace()) {
            Some((key, body)) => Self::new(key, body.trim_start()),
            None => Self::new(line, ""),
        }
    }

    /// Everything after the key.
    pub fn body_str(&self) -> &str {
        &self.body
    }

    /// Whitespace-separated words of the body.
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }
}

impl RequestInfo for StringRequest {
    fn key(&self) -> &str {
        &self.key
    }

    fn body(&self) -> &[u8] {
        self.body.as_bytes()
    }
}

/// Decoder for delimiter-terminated lines.
pub struct LineDecoder {
    delimiter: Vec<u8>,
    max_line_length: usize,
    /// Bytes of the current partial line already searched for the delimiter.
    scanned: usize,
}

impl LineDecoder {
    /// Decoder for `\r\n` terminated lines of at most `max_line_length` bytes.
    pub fn new(max_line_length: usize) -> Self {
        Self::with_delimiter(b"\r\n", max_line_length)
    }

    /// Decoder for lines ending in `delimiter`.
    ///
    /// # Panics
    /// Panics if `delimiter` is empty.
    pub fn with_delimiter(delimiter: &[u8], max_line_length: usize) -> Self {
        assert!(!delimiter.is_empty(), "line delimiter must not be empty");
        Self {
            delimiter: delimiter.to_vec(),
            max_line_length,
            scanned: 0,
        }
    }

    fn find_delimiter(&self, input: &[u8]) -> Option<usize> {
        // Back off so a delimiter split across reads is still found.
        let start = self
            .scanned
            .saturating_sub(self.delimiter.len() - 1)
            .min(input.len());
        input[start..]
            .windows(self.delimiter.len())
            .position(|w| w == self.delimiter.as_slice())
            .map(|pos| start + pos)
    }
}

impl FrameDecoder for LineDecoder {
    type Request = StringRequest;

    fn decode(&mut self, input: &[u8]) -> DecodeResult<StringRequest> {
        let line_end = match self.find_delimiter(input) {
            Some(pos) => pos,
            None => {
                self.scanned = input.len();
                // The tail may hold all but the last byte of a delimiter.
                if input.len() > self.max_line_length + self.delimiter.len() - 1 {
                    return DecodeResult::Error(FramingError::FrameTooLarge {
                        len: input.len(),
                        max: self.max_line_length,
                    });
                }
                return DecodeResult::Incomplete;
            }
        };

        self.scanned = 0;
        let consumed = line_end + self.delimiter.len();

        if line_end > self.max_line_length {
            return DecodeResult::Error(FramingError::FrameTooLarge {
                len: line_end,
                max: self.max_line_length,
            });
        }

        let line = match std::str::from_utf8(&input[..line_end]) {
            Ok(s) => s.trim(),
            Err(_) => return DecodeResult::Error(FramingError::InvalidEncoding),
        };

        if line.is_empty() {
            return DecodeResult::Skip(consumed);
        }

        DecodeResult::Complete(StringRequest::parse(line), consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Framer;

    fn decode(input: &[u8]) -> DecodeResult<StringRequest> {
        LineDecoder::new(64).decode(input)
    }

    #[test]
    fn test_parse_key_and_body() {
        match decode(b"ECHO hello  world\r\n") {
            DecodeResult::Complete(request, 19) => {
                assert_eq!(request.key(), "ECHO");
                assert_eq!(request.body_str(), "hello  world");
                assert_eq!(request.parameters(), ["hello", "world"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_key_only() {
        match decode(b"QUIT\r\n") {
            DecodeResult::Complete(request, 6) => {
                assert_eq!(request.key(), "QUIT");
                assert!(request.body().is_empty());
                assert!(request.parameters().is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete() {
        assert!(matches!(decode(b"ECHO"), DecodeResult::Incomplete));
        assert!(matches!(decode(b"ECHO\r"), DecodeResult::Incomplete));
    }

    #[test]
    fn test_blank_line_skipped() {
        assert!(matches!(decode(b"\r\nECHO\r\n"), DecodeResult::Skip(2)));
        assert!(matches!(decode(b"   \r\n"), DecodeResult::Skip(5)));
    }

    #[test]
    fn test_invalid_utf8() {
        assert!(matches!(
            decode(b"ECHO \xff\xfe\r\n"),
            DecodeResult::Error(FramingError::InvalidEncoding)
        ));
    }

    #[test]
    fn test_parse_tab_separated_key() {
        match decode(b"ECHO\thi there\r\n") {
            DecodeResult::Complete(request, _) => {
                assert_eq!(request.key(), "ECHO");
                assert_eq!(request.body_str(), "hi there");
                assert_eq!(request.parameters(), ["hi", "there"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_line_too_long() {
        let mut decoder = LineDecoder::new(4);
        assert!(matches!(
            decoder.decode(b"TOOLONG"),
            DecodeResult::Error(FramingError::FrameTooLarge { len: 7, max: 4 })
        ));
    }

    #[test]
    fn test_max_length_line_at_every_split() {
        let input = b"ABCD\r\n";
        for split in 1..input.len() {
            let mut framer = Framer::new(LineDecoder::new(4));
            let mut requests = Vec::new();
            for chunk in [&input[..split], &input[split..]] {
                for frame in framer.feed(chunk) {
                    requests.push(frame.unwrap());
                }
            }
            assert_eq!(requests.len(), 1, "split at {}", split);
            assert_eq!(requests[0].key(), "ABCD");
            assert!(!framer.is_failed());
        }

        // One byte over the limit still fails once the tail cannot be a delimiter
        let mut framer = Framer::new(LineDecoder::new(4));
        let frames: Vec<_> = framer.feed(b"ABCDEF").collect();
        assert!(matches!(
            frames[..],
            [Err(FramingError::FrameTooLarge { len: 6, max: 4 })]
        ));
    }

    #[test]
    fn test_delimiter_split_across_reads() {
        let mut decoder = LineDecoder::new(64);
        assert!(matches!(decoder.decode(b"PING\r"), DecodeResult::Incomplete));

        match decoder.decode(b"PING\r\n") {
            DecodeResult::Complete(request, 6) => assert_eq!(request.key(), "PING"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_custom_delimiter() {
        let mut decoder = LineDecoder::with_delimiter(b"#", 64);
        match decoder.decode(b"ADD 1 2#ADD") {
            DecodeResult::Complete(request, 8) => {
                assert_eq!(request.key(), "ADD");
                assert_eq!(request.parameters(), ["1", "2"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
