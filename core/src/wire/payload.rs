//! Embedding of byte strings and JSON values inside payload tags.
//!
//! A payload tag holds one or more child tags, each carrying a chunk of the
//! payload in one of three encodings:
//!
//! - `raw`: literal text, usable when the bytes are printable ASCII or
//!   newlines (serialised JSON in particular),
//! - `base64`: base64 over arbitrary bytes,
//! - `zlib`: a `size` attribute with the uncompressed byte count and a
//!   nested payload (normally a single `base64` child) holding the
//!   compressed bytes.
//!
//! Decoding concatenates the decoded chunks in order.  A cumulative ceiling
//! guards against decompression bombs.

use std::io::Read;

use base64::{engine::general_purpose, Engine};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use std::io::Write;

use crate::messaging::Tag;

/// Hard ceiling on the total decoded payload size (cumulative across all
/// child tags of one payload).
pub const MAX_DECODED_SIZE: usize = 64 << 20;

/// Minimum size at which compression is attempted.
const COMPRESSION_THRESHOLD: usize = 128;

/// Compression is used only if it shrinks the payload to at most this
/// share (in percent) of the original.
const COMPRESSION_MAX_PERCENT: usize = 70;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
	#[error("unknown payload child tag: {0}")]
	UnknownTag(String),
	#[error("invalid base64 data: {0}")]
	Base64(#[from] base64::DecodeError),
	#[error("invalid zlib tag: {0}")]
	InvalidZlib(String),
	#[error("zlib decompression failed: {0}")]
	Zlib(#[from] std::io::Error),
	#[error("declared size {declared} does not match decompressed size {actual}")]
	SizeMismatch { declared: usize, actual: usize },
	#[error("payload exceeds the {MAX_DECODED_SIZE} byte decoding ceiling")]
	TooLarge,
	#[error("payload is not valid UTF-8")]
	Utf8(#[from] std::string::FromUtf8Error),
	#[error("invalid JSON payload: {0}")]
	Json(String),
}

/// Returns true if the bytes consist only of printable ASCII characters
/// and newlines, so that they can be embedded literally in a `raw` tag.
fn can_store_raw(payload: &[u8]) -> bool {
	payload.iter().all(|&b| b == b'\n' || (b' '..0x7f).contains(&b))
}

fn compress(payload: &[u8]) -> Vec<u8> {
	let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
	encoder
		.write_all(payload)
		.and_then(|_| encoder.finish())
		.expect("writing to an in-memory zlib encoder cannot fail")
}

fn base64_tag(payload: &[u8]) -> Tag {
	Tag::with_text("base64", general_purpose::STANDARD.encode(payload))
}

/// Encodes the payload bytes into a new tag with the given name.
pub fn encode_payload(name: &str, payload: &[u8]) -> Tag {
	let mut result = Tag::new(name);
	if payload.is_empty() {
		return result;
	}

	if payload.len() >= COMPRESSION_THRESHOLD {
		let compressed = compress(payload);
		if compressed.len() * 100 <= payload.len() * COMPRESSION_MAX_PERCENT {
			let mut zlib = Tag::new("zlib");
			zlib.set_attr("size", payload.len());
			zlib.push_child(base64_tag(&compressed));
			result.push_child(zlib);
			return result;
		}
	}

	if can_store_raw(payload) {
		let text = std::str::from_utf8(payload).expect("raw payloads are ASCII");
		result.push_child(Tag::with_text("raw", text));
	} else {
		result.push_child(base64_tag(payload));
	}

	result
}

fn decode_child(tag: &Tag, budget: &mut usize) -> Result<Vec<u8>, PayloadError> {
	let charge = |budget: &mut usize, n: usize| {
		if *budget < n {
			return Err(PayloadError::TooLarge);
		}
		*budget -= n;
		Ok(())
	};

	match tag.name() {
		"raw" => {
			let bytes = tag.text().as_bytes().to_vec();
			charge(budget, bytes.len())?;
			Ok(bytes)
		},
		"base64" => {
			let bytes = general_purpose::STANDARD.decode(tag.text())?;
			charge(budget, bytes.len())?;
			Ok(bytes)
		},
		"zlib" => {
			let declared: usize = tag
				.attr("size")
				.ok_or_else(|| PayloadError::InvalidZlib("missing size attribute".to_string()))?
				.parse()
				.map_err(|_| PayloadError::InvalidZlib("unparsable size attribute".to_string()))?;
			charge(budget, declared)?;

			// the compressed bytes are carried in plain child tags; nested
			// compression is not a thing and would defeat the size ceiling
			let mut compressed = Vec::new();
			for child in tag.children() {
				match child.name() {
					"raw" => compressed.extend_from_slice(child.text().as_bytes()),
					"base64" => {
						compressed.extend(general_purpose::STANDARD.decode(child.text())?)
					},
					other => {
						return Err(PayloadError::InvalidZlib(format!(
							"unexpected child tag: {other}",
						)))
					},
				}
			}

			// pre-size from the declared count; read one byte beyond it so
			// an oversized stream is detected rather than truncated
			let mut decoder = ZlibDecoder::new(compressed.as_slice());
			let mut decompressed = Vec::with_capacity(declared);
			decoder
				.by_ref()
				.take(declared as u64 + 1)
				.read_to_end(&mut decompressed)?;
			if decompressed.len() != declared {
				return Err(PayloadError::SizeMismatch {
					declared,
					actual: decompressed.len(),
				});
			}
			Ok(decompressed)
		},
		other => Err(PayloadError::UnknownTag(other.to_string())),
	}
}

/// Decodes the payload carried by the given tag's children.
pub fn decode_payload(tag: &Tag) -> Result<Vec<u8>, PayloadError> {
	let mut budget = MAX_DECODED_SIZE;
	let mut result = Vec::new();
	for child in tag.children() {
		result.extend(decode_child(child, &mut budget)?);
	}
	Ok(result)
}

/// Encodes a JSON value (compact serialisation) into a payload tag.
pub fn encode_json(name: &str, value: &Value) -> Tag {
	let serialised = serde_json::to_string(value).expect("JSON values always serialise");
	encode_payload(name, serialised.as_bytes())
}

/// Decodes a payload tag into a JSON value, applying the strict parse
/// rules of [`parse_json_strict`].
pub fn decode_json(tag: &Tag) -> Result<Value, PayloadError> {
	let bytes = decode_payload(tag)?;
	let serialised = String::from_utf8(bytes)?;
	parse_json_strict(&serialised)
}

/// Parses JSON, rejecting comments, duplicate object keys and trailing
/// data.
pub fn parse_json_strict(s: &str) -> Result<Value, PayloadError> {
	struct StrictValue(Value);

	struct StrictVisitor;

	impl<'de> Visitor<'de> for StrictVisitor {
		type Value = StrictValue;

		fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
			f.write_str("a JSON value")
		}

		fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
			Ok(StrictValue(Value::Bool(v)))
		}

		fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
			Ok(StrictValue(Value::Number(v.into())))
		}

		fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
			Ok(StrictValue(Value::Number(v.into())))
		}

		fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
			Number::from_f64(v)
				.map(|n| StrictValue(Value::Number(n)))
				.ok_or_else(|| de::Error::custom("non-finite number"))
		}

		fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
			Ok(StrictValue(Value::String(v.to_string())))
		}

		fn visit_unit<E>(self) -> Result<Self::Value, E> {
			Ok(StrictValue(Value::Null))
		}

		fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
			let mut values = Vec::new();
			while let Some(StrictValue(value)) = seq.next_element()? {
				values.push(value);
			}
			Ok(StrictValue(Value::Array(values)))
		}

		fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
			let mut object = Map::new();
			while let Some((key, StrictValue(value))) = map.next_entry::<String, _>()? {
				if object.insert(key.clone(), value).is_some() {
					return Err(de::Error::custom(format!("duplicate object key: {key}")));
				}
			}
			Ok(StrictValue(Value::Object(object)))
		}
	}

	impl<'de> Deserialize<'de> for StrictValue {
		fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
			deserializer.deserialize_any(StrictVisitor)
		}
	}

	let mut deserializer = serde_json::Deserializer::from_str(s);
	let StrictValue(value) = StrictValue::deserialize(&mut deserializer)
		.map_err(|e| PayloadError::Json(e.to_string()))?;
	deserializer
		.end()
		.map_err(|e| PayloadError::Json(format!("trailing data: {e}")))?;
	Ok(value)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use test_case::test_case;

	fn roundtrip(payload: &[u8]) -> Vec<u8> {
		let tag = encode_payload("payload", payload);
		decode_payload(&tag).unwrap()
	}

	#[test]
	fn empty_payload_has_no_children() {
		let tag = encode_payload("payload", b"");
		assert!(tag.children().is_empty());
		assert_eq!(decode_payload(&tag).unwrap(), b"");
	}

	#[test]
	fn raw_for_printable_ascii() {
		let payload = b"{\"foo\": 42}\nsecond line";
		let tag = encode_payload("payload", payload);
		assert_eq!(tag.children().len(), 1);
		assert_eq!(tag.children()[0].name(), "raw");
		assert_eq!(roundtrip(payload), payload);
	}

	#[test]
	fn base64_for_binary() {
		let payload = b"\x00\x01\xff binary";
		let tag = encode_payload("payload", payload);
		assert_eq!(tag.children()[0].name(), "base64");
		assert_eq!(roundtrip(payload), payload);
	}

	#[test]
	fn zlib_for_large_compressible() {
		let payload = vec![b'x'; 4096];
		let tag = encode_payload("payload", &payload);
		let zlib = &tag.children()[0];
		assert_eq!(zlib.name(), "zlib");
		assert_eq!(zlib.attr("size"), Some("4096"));
		assert_eq!(zlib.children()[0].name(), "base64");
		assert_eq!(roundtrip(&payload), payload);
	}

	#[test]
	fn compression_gate_respects_threshold() {
		// well compressible but below the size threshold
		let payload = vec![b'x'; COMPRESSION_THRESHOLD - 1];
		let tag = encode_payload("payload", &payload);
		assert_eq!(tag.children()[0].name(), "raw");
	}

	#[test]
	fn compression_gate_respects_ratio() {
		// random bytes do not compress to 70%
		use rand::RngCore;
		let mut payload = vec![0u8; 1024];
		rand::thread_rng().fill_bytes(&mut payload);
		let tag = encode_payload("payload", &payload);
		assert_eq!(tag.children()[0].name(), "base64");
		assert_eq!(roundtrip(&payload), payload);
	}

	#[test]
	fn multiple_children_concatenate() {
		let mut tag = Tag::new("payload");
		tag.push_child(Tag::with_text("raw", "hello "));
		tag.push_child(Tag::with_text(
			"base64",
			general_purpose::STANDARD.encode("world"),
		));
		assert_eq!(decode_payload(&tag).unwrap(), b"hello world");
	}

	#[test]
	fn unknown_child_is_rejected() {
		let mut tag = Tag::new("payload");
		tag.push_child(Tag::with_text("hex", "00ff"));
		assert!(matches!(
			decode_payload(&tag),
			Err(PayloadError::UnknownTag(_))
		));
	}

	#[test]
	fn zlib_size_mismatch_is_rejected() {
		let payload = vec![b'x'; 4096];
		let compressed = compress(&payload);
		let mut zlib = Tag::new("zlib");
		zlib.set_attr("size", 17);
		zlib.push_child(base64_tag(&compressed));
		let mut tag = Tag::new("payload");
		tag.push_child(zlib);
		assert!(matches!(
			decode_payload(&tag),
			Err(PayloadError::SizeMismatch { .. })
		));
	}

	#[test]
	fn declared_size_beyond_ceiling_is_rejected() {
		let mut zlib = Tag::new("zlib");
		zlib.set_attr("size", MAX_DECODED_SIZE + 1);
		zlib.push_child(base64_tag(&compress(b"tiny")));
		let mut tag = Tag::new("payload");
		tag.push_child(zlib);
		assert!(matches!(decode_payload(&tag), Err(PayloadError::TooLarge)));
	}

	#[test_case(json!(null))]
	#[test_case(json!(42))]
	#[test_case(json!(-1.5))]
	#[test_case(json!("stringy"))]
	#[test_case(json!(["foo", {"bar": [1, 2, 3]}]))]
	#[test_case(json!({"nested": {"deeply": true}, "other": null}))]
	fn json_roundtrip(value: Value) {
		let tag = encode_json("params", &value);
		assert_eq!(decode_json(&tag).unwrap(), value);
	}

	#[test]
	fn json_serialisation_is_compact() {
		let tag = encode_json("params", &json!({"a": 1, "b": [true, null]}));
		assert_eq!(decode_payload(&tag).unwrap(), br#"{"a":1,"b":[true,null]}"#);
	}

	#[test_case(r#"{"a": 1, "a": 2}"# ; "duplicate keys")]
	#[test_case(r#"{"a": 1} trailing"# ; "trailing data")]
	#[test_case(r#"{"a": 1 // comment"# ; "comment")]
	#[test_case("" ; "empty input")]
	fn strict_json_rejections(input: &str) {
		assert!(parse_json_strict(input).is_err());
	}

	#[test]
	fn strict_json_accepts_nested_repeated_keys() {
		// the same key in different objects is fine
		let value = parse_json_strict(r#"{"a": {"a": 1}, "b": {"a": 2}}"#).unwrap();
		assert_eq!(value["a"]["a"], 1);
	}
}
