//! Telemetry model and Zabbix sender wire format

pub mod codec;
pub mod messages;

pub use codec::{
    decode_frame, decode_response, decode_unicode_escapes, encode, encode_body, DecodeError,
    EncodingError, Frame,
};
pub use messages::{
    ServerAddress, TelemetryBatch, TelemetryItem, ValidationError, DEFAULT_TRAPPER_PORT,
};
