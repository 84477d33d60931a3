//! Codec for the courier frame grammar.
//!
//! The encoded form is a flat byte sequence of `0x1b`-delimited fields:
//! the kind, zero or more `key:value` meta entries, the sentinel, and
//! finally the content, which runs to the end of the buffer and may
//! itself contain delimiter bytes.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frame::Frame;

/// Field delimiter.
pub const DELIMITER: u8 = 0x1b;

/// Literal separating the meta section from the content.
pub const SENTINEL: &str = "----------2918136232";

/// Errors produced while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer ended before the meta/content sentinel.
    #[error("frame truncated before sentinel")]
    MissingSentinel,

    /// A meta field lacked the `key:value` shape.
    #[error("malformed meta entry: {0:?}")]
    MalformedMeta(String),

    /// A field was not valid UTF-8.
    #[error("frame field is not valid UTF-8")]
    InvalidUtf8,
}

/// Encode a frame to bytes.
///
/// Meta entries are always emitted, one delimited `key:value` field per
/// entry, in key order.
#[must_use]
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        frame.kind.len() + SENTINEL.len() + frame.content.len() + 16 * frame.meta.len() + 3,
    );

    buf.put_slice(frame.kind.as_bytes());
    buf.put_u8(DELIMITER);

    for (key, value) in &frame.meta {
        buf.put_slice(key.as_bytes());
        buf.put_u8(b':');
        buf.put_slice(value.as_bytes());
        buf.put_u8(DELIMITER);
    }

    buf.put_slice(SENTINEL.as_bytes());
    buf.put_u8(DELIMITER);
    buf.put_slice(frame.content.as_bytes());

    buf.freeze()
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the sentinel is missing, a meta entry is not
/// `key:value` shaped, or a field is not UTF-8.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let mut fields = data.split(|&b| b == DELIMITER);

    let kind = field_str(fields.next().ok_or(ProtocolError::MissingSentinel)?)?;

    let mut frame = Frame::new(kind, "");

    // Fields up to the sentinel are meta entries; everything after the
    // sentinel's delimiter is content, delimiter bytes included.
    let mut consumed = kind.len() + 1;
    loop {
        let field = fields.next().ok_or(ProtocolError::MissingSentinel)?;
        let text = field_str(field)?;
        consumed += field.len() + 1;

        if text == SENTINEL {
            break;
        }

        let (key, value) = text
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedMeta(text.to_owned()))?;
        frame.add_meta(key, value);
    }

    // Malformed input may end exactly at the sentinel.
    let content_start = consumed.min(data.len());
    frame.content = field_str(&data[content_start..])?.to_owned();
    Ok(frame)
}

fn field_str(field: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(field).map_err(|_| ProtocolError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::meta;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::new("TextMessage", "hi").with_meta(meta::SENDER, "alice"),
            Frame::new("PictureMessage", "http://h/IM_TEMP_FILE/ab/ab.png")
                .with_meta(meta::SENDER, "bob")
                .with_meta(meta::GROUP, "team"),
            Frame::new("FileMessage", ""),
        ];

        for frame in frames {
            let encoded = encode(&frame);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_encode_shape() {
        let frame = Frame::new("TextMessage", "hello").with_meta(meta::SENDER, "a");
        let encoded = encode(&frame);
        let expected = format!("TextMessage\x1bSender:a\x1b{SENTINEL}\x1bhello");
        assert_eq!(&encoded[..], expected.as_bytes());
    }

    #[test]
    fn test_content_may_contain_delimiter() {
        let frame = Frame::new("TextMessage", "a\x1bb");
        let decoded = decode(&encode(&frame)).unwrap();
        assert_eq!(decoded.content, "a\x1bb");
    }

    #[test]
    fn test_decode_missing_sentinel() {
        assert_eq!(
            decode(b"TextMessage\x1bSender:a"),
            Err(ProtocolError::MissingSentinel)
        );
        assert_eq!(decode(b""), Err(ProtocolError::MissingSentinel));
    }

    #[test]
    fn test_decode_malformed_meta() {
        let data = format!("TextMessage\x1bnot-a-pair\x1b{SENTINEL}\x1bhello");
        assert!(matches!(
            decode(data.as_bytes()),
            Err(ProtocolError::MalformedMeta(_))
        ));
    }

    #[test]
    fn test_empty_meta_and_content() {
        let frame = Frame::new("TextMessage", "");
        let decoded = decode(&encode(&frame)).unwrap();
        assert!(decoded.meta.is_empty());
        assert_eq!(decoded.content, "");
    }
}
