//! Zabbix sender wire format
//!
//! Every frame, request or response, starts with the same 13-byte header:
//!
//! ```text
//! +------+------+-------------------------------+----------------+
//! | ZBXD | 0x01 | body length (u64, little end.) | JSON body ...  |
//! +------+------+-------------------------------+----------------+
//!   4 B    1 B               8 B
//! ```
//!
//! Encoding is pure and deterministic: the same batch always yields the same
//! bytes, with the body fields in the order `request`, `data[host, key, value]`.

use super::messages::TelemetryBatch;
use serde::Serialize;
use thiserror::Error;

pub const HEADER_MAGIC: &[u8; 4] = b"ZBXD";
pub const PROTOCOL_VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 13;
pub const SENDER_REQUEST: &str = "sender data";

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("Cannot encode an empty batch")]
    EmptyBatch,
    #[error("Item {key:?} cannot be represented on the wire: {reason}")]
    InvalidItem { key: String, reason: &'static str },
    #[error("Failed to serialize sender request: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame shorter than the {HEADER_LEN}-byte header ({0} bytes)")]
    TooShort(usize),
    #[error("Frame does not start with ZBXD")]
    BadMagic,
    #[error("Declared body length {declared} does not match actual {actual}")]
    LengthMismatch { declared: u64, actual: usize },
}

#[derive(Serialize)]
struct SenderRequest<'a> {
    request: &'static str,
    data: Vec<SenderItem<'a>>,
}

#[derive(Serialize)]
struct SenderItem<'a> {
    host: &'a str,
    key: &'a str,
    value: &'a str,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub body: Vec<u8>,
}

/// Build the JSON body for a batch
pub fn encode_body(batch: &TelemetryBatch) -> Result<String, EncodingError> {
    if batch.is_empty() {
        return Err(EncodingError::EmptyBatch);
    }

    let host = batch.host_name();
    if host.contains('\0') {
        return Err(EncodingError::InvalidItem {
            key: String::new(),
            reason: "host name contains a NUL byte",
        });
    }

    let mut data = Vec::with_capacity(batch.len());
    for item in batch.items() {
        if item.key().contains('\0') || item.value().contains('\0') {
            return Err(EncodingError::InvalidItem {
                key: item.key().to_string(),
                reason: "contains a NUL byte",
            });
        }
        data.push(SenderItem {
            host,
            key: item.key(),
            value: item.value(),
        });
    }

    let request = SenderRequest {
        request: SENDER_REQUEST,
        data,
    };
    Ok(serde_json::to_string(&request)?)
}

/// Encode a batch into a complete trapper packet
pub fn encode(batch: &TelemetryBatch) -> Result<Vec<u8>, EncodingError> {
    let body = encode_body(batch)?;
    Ok(frame(body.as_bytes()))
}

/// Prefix a body with the protocol header
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + body.len());
    packet.extend_from_slice(HEADER_MAGIC);
    packet.push(PROTOCOL_VERSION);
    packet.extend_from_slice(&(body.len() as u64).to_le_bytes());
    packet.extend_from_slice(body);
    packet
}

/// Parse a complete frame, checking the declared length against the body
pub fn decode_frame(raw: &[u8]) -> Result<Frame, DecodeError> {
    if raw.len() < HEADER_LEN {
        return Err(DecodeError::TooShort(raw.len()));
    }
    if &raw[..4] != HEADER_MAGIC {
        return Err(DecodeError::BadMagic);
    }

    let mut length = [0u8; 8];
    length.copy_from_slice(&raw[5..HEADER_LEN]);
    let declared = u64::from_le_bytes(length);
    let body = &raw[HEADER_LEN..];
    if declared != body.len() as u64 {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }

    Ok(Frame {
        flags: raw[4],
        body: body.to_vec(),
    })
}

/// Drop the fixed header prefix if present; anything else passes through
pub fn strip_header(raw: &[u8]) -> &[u8] {
    if raw.len() >= HEADER_LEN && raw.starts_with(HEADER_MAGIC) {
        &raw[HEADER_LEN..]
    } else {
        raw
    }
}

/// Header-stripped response as text, with literal `\uXXXX` sequences decoded
pub fn decode_response(raw: &[u8]) -> String {
    decode_unicode_escapes(&String::from_utf8_lossy(strip_header(raw)))
}

/// Replace literal `\uXXXX` escapes with the characters they name.
///
/// Malformed sequences and lone surrogates are left untouched.
pub fn decode_unicode_escapes(input: &str) -> String {
    let mut decoded = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find("\\u") {
        decoded.push_str(&rest[..pos]);
        let candidate = &rest[pos + 2..];
        let escaped = candidate
            .get(..4)
            .filter(|hex| hex.chars().all(|c| c.is_ascii_hexdigit()))
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .and_then(char::from_u32);

        match escaped {
            Some(c) => {
                decoded.push(c);
                rest = &candidate[4..];
            }
            None => {
                decoded.push_str("\\u");
                rest = candidate;
            }
        }
    }

    decoded.push_str(rest);
    decoded
}
