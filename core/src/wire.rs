//! Wire format: JSON and opaque byte payloads embedded in stanza payload
//! tags, plus the typed stanza extensions built on top of them.

mod payload;
pub mod stanzas;

pub use payload::{
	decode_json, decode_payload, encode_json, encode_payload, parse_json_strict, PayloadError,
	MAX_DECODED_SIZE,
};
