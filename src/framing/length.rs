//! Fixed header + length-prefixed body protocol.
//!
//! ```text
//! +----------------------+------------------+----------------+
//! | key (key_width bytes)| body length (u32)| body           |
//! | ASCII, space/NUL pad | big-endian       | length bytes   |
//! +----------------------+------------------+----------------+
//! ```
//!
//! The declared body length is checked against the limit as soon as the
//! header is complete, before any body bytes are buffered.

use super::{DecodeResult, FrameDecoder, RequestInfo};
use crate::error::FramingError;
use bytes::{BufMut, Bytes, BytesMut};

const LENGTH_FIELD: usize = 4;

/// A request decoded from one binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRequest {
    key: String,
    body: Bytes,
}

impl BinaryRequest {
    pub fn new(key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            body: body.into(),
        }
    }

    /// The body as a shared buffer.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }
}

impl RequestInfo for BinaryRequest {
    fn key(&self) -> &str {
        &self.key
    }

    fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Decoder for `[key][u32 length][body]` frames.
pub struct LengthPrefixedDecoder {
    key_width: usize,
    max_body_length: usize,
}

impl LengthPrefixedDecoder {
    pub fn new(key_width: usize, max_body_length: usize) -> Self {
        Self {
            key_width,
            max_body_length,
        }
    }

    fn header_len(&self) -> usize {
        self.key_width + LENGTH_FIELD
    }

    /// Encode a frame in the format this decoder accepts.
    pub fn encode(&self, key: &str, body: &[u8]) -> Result<BytesMut, FramingError> {
        if key.is_empty() || key.len() > self.key_width || !key.bytes().all(is_key_byte) {
            return Err(FramingError::InvalidHeader(format!("invalid key '{key}'")));
        }
        let too_large = FramingError::FrameTooLarge {
            len: body.len(),
            max: self.max_body_length,
        };
        if body.len() > self.max_body_length {
            return Err(too_large);
        }
        let body_len = u32::try_from(body.len()).map_err(|_| too_large)?;

        let mut frame = BytesMut::with_capacity(self.header_len() + body.len());
        frame.put_slice(key.as_bytes());
        frame.put_bytes(b' ', self.key_width - key.len());
        frame.put_u32(body_len);
        frame.put_slice(body);
        Ok(frame)
    }
}

fn is_key_byte(b: u8) -> bool {
    b.is_ascii_graphic()
}

impl FrameDecoder for LengthPrefixedDecoder {
    type Request = BinaryRequest;

    fn decode(&mut self, input: &[u8]) -> DecodeResult<BinaryRequest> {
        let header_len = self.header_len();
        if input.len() < header_len {
            return DecodeResult::Incomplete;
        }

        let key_field = &input[..self.key_width];
        let key_len = key_field
            .iter()
            .rposition(|&b| b != b' ' && b != 0)
            .map_or(0, |pos| pos + 1);
        let key = &key_field[..key_len];

        if key.is_empty() {
            return DecodeResult::Error(FramingError::InvalidHeader("empty key".into()));
        }
        if !key.iter().copied().all(is_key_byte) {
            return DecodeResult::Error(FramingError::InvalidHeader(
                "key is not printable ASCII".into(),
            ));
        }

        let mut length_field = [0u8; LENGTH_FIELD];
        length_field.copy_from_slice(&input[self.key_width..header_len]);
        let body_len = u32::from_be_bytes(length_field) as usize;

        if body_len > self.max_body_length {
            return DecodeResult::Error(FramingError::FrameTooLarge {
                len: body_len,
                max: self.max_body_length,
            });
        }

        let total = header_len + body_len;
        if input.len() < total {
            return DecodeResult::Incomplete;
        }

        // Checked above to be printable ASCII.
        let key = String::from_utf8_lossy(key).into_owned();
        let body = Bytes::copy_from_slice(&input[header_len..total]);

        DecodeResult::Complete(BinaryRequest::new(key, body), total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Framer;

    #[test]
    fn test_parse_frame() {
        let mut decoder = LengthPrefixedDecoder::new(4, 1024);
        let frame = decoder.encode("ECHO", b"hello").unwrap();
        assert_eq!(frame.len(), 4 + 4 + 5);

        match decoder.decode(&frame) {
            DecodeResult::Complete(request, 13) => {
                assert_eq!(request.key(), "ECHO");
                assert_eq!(request.body(), b"hello");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_padded_key() {
        let mut decoder = LengthPrefixedDecoder::new(8, 1024);
        let mut input = b"ADD\0\0\0\0\0".to_vec();
        input.extend_from_slice(&3u32.to_be_bytes());
        input.extend_from_slice(b"1 2");

        match decoder.decode(&input) {
            DecodeResult::Complete(request, 15) => {
                assert_eq!(request.key(), "ADD");
                assert_eq!(request.body(), b"1 2");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_body() {
        let mut decoder = LengthPrefixedDecoder::new(4, 1024);
        let frame = decoder.encode("QUIT", b"").unwrap();

        match decoder.decode(&frame) {
            DecodeResult::Complete(request, 8) => assert!(request.body().is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_header_and_body() {
        let mut decoder = LengthPrefixedDecoder::new(4, 1024);
        let frame = decoder.encode("ECHO", b"0123456789").unwrap();

        assert!(matches!(decoder.decode(&frame[..6]), DecodeResult::Incomplete));
        assert!(matches!(decoder.decode(&frame[..12]), DecodeResult::Incomplete));
    }

    #[test]
    fn test_body_too_large() {
        let mut decoder = LengthPrefixedDecoder::new(4, 8);
        let mut input = b"ECHO".to_vec();
        input.extend_from_slice(&1000u32.to_be_bytes());

        // Rejected from the header alone
        assert!(matches!(
            decoder.decode(&input),
            DecodeResult::Error(FramingError::FrameTooLarge { len: 1000, max: 8 })
        ));
    }

    #[test]
    fn test_invalid_key() {
        let mut decoder = LengthPrefixedDecoder::new(4, 8);

        let mut input = b"    ".to_vec();
        input.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            decoder.decode(&input),
            DecodeResult::Error(FramingError::InvalidHeader(_))
        ));

        let mut input = b"E\xffHO".to_vec();
        input.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            decoder.decode(&input),
            DecodeResult::Error(FramingError::InvalidHeader(_))
        ));

        assert!(decoder.encode("TOOLONG", b"").is_err());
    }

    #[test]
    fn test_framer_with_split_binary_frames() {
        let encoder = LengthPrefixedDecoder::new(4, 1024);
        let mut stream = encoder.encode("ECHO", b"first").unwrap();
        stream.extend_from_slice(&encoder.encode("ECHO", b"second").unwrap());

        let mut framer = Framer::new(LengthPrefixedDecoder::new(4, 1024));
        let mut requests = Vec::new();
        for byte in stream.chunks(1) {
            for request in framer.feed(byte) {
                requests.push(request.unwrap());
            }
        }

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].body(), b"first");
        assert_eq!(requests[1].body(), b"second");
    }
}
