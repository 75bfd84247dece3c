//! Message framing for the two transfer formats.
//!
//! Text payloads terminate every message with [`RECORD_SEPARATOR`]; binary
//! payloads prefix every message with its length as a little-endian base-128
//! varint (at most 5 bytes, so lengths up to 2^31 - 1).

use crate::ProtocolError;
use crate::constants::RECORD_SEPARATOR;

/// Record-separator framing for text payloads.
pub struct TextFraming;

impl TextFraming {
    /// Appends the record separator to an encoded message.
    pub fn write(mut message: Vec<u8>) -> Vec<u8> {
        message.push(RECORD_SEPARATOR);
        message
    }

    /// Splits a payload into messages. The payload must end with a separator.
    pub fn split(payload: &[u8]) -> Result<Vec<&[u8]>, ProtocolError> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        if payload.last() != Some(&RECORD_SEPARATOR) {
            return Err(ProtocolError::IncompleteMessage);
        }
        Ok(payload[..payload.len() - 1]
            .split(|b| *b == RECORD_SEPARATOR)
            .collect())
    }
}

/// Varint length-prefix framing for binary payloads.
pub struct BinaryFraming;

const MAX_VARINT_BYTES: usize = 5;

impl BinaryFraming {
    pub fn write(message: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(message.len() + MAX_VARINT_BYTES);
        let mut len = message.len();
        loop {
            let mut byte = (len & 0x7f) as u8;
            len >>= 7;
            if len > 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if len == 0 {
                break;
            }
        }
        out.extend_from_slice(message);
        out
    }

    pub fn split(mut payload: &[u8]) -> Result<Vec<&[u8]>, ProtocolError> {
        let mut messages = Vec::new();
        while !payload.is_empty() {
            let mut len: usize = 0;
            let mut consumed = 0;
            loop {
                if consumed == MAX_VARINT_BYTES {
                    return Err(ProtocolError::InvalidLengthPrefix);
                }
                let byte = *payload
                    .get(consumed)
                    .ok_or(ProtocolError::IncompleteMessage)?;
                len |= ((byte & 0x7f) as usize) << (7 * consumed);
                consumed += 1;
                if byte & 0x80 == 0 {
                    break;
                }
            }
            let rest = &payload[consumed..];
            if rest.len() < len {
                return Err(ProtocolError::IncompleteMessage);
            }
            messages.push(&rest[..len]);
            payload = &rest[len..];
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_split_multiple_messages() {
        let payload = b"{\"type\":6}\x1e{\"type\":6}\x1e";
        let parts = TextFraming::split(payload).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], b"{\"type\":6}");
    }

    #[test]
    fn text_split_requires_trailing_separator() {
        let err = TextFraming::split(b"{\"type\":6}").unwrap_err();
        assert!(matches!(err, ProtocolError::IncompleteMessage));
    }

    #[test]
    fn binary_prefix_single_byte() {
        let framed = BinaryFraming::write(&[0x91, 0x06]);
        assert_eq!(framed, vec![0x02, 0x91, 0x06]);
    }

    #[test]
    fn binary_prefix_multi_byte() {
        // 300 = 0b1_0010_1100 -> 0xAC 0x02
        let message = vec![0u8; 300];
        let framed = BinaryFraming::write(&message);
        assert_eq!(&framed[..2], &[0xac, 0x02]);
        let parts = BinaryFraming::split(&framed).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len(), 300);
    }

    #[test]
    fn binary_split_truncated_payload() {
        let err = BinaryFraming::split(&[0x05, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, ProtocolError::IncompleteMessage));
    }

    #[test]
    fn binary_split_rejects_oversized_prefix() {
        let err = BinaryFraming::split(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLengthPrefix));
    }
}
