//! Value encoding and decoding.
//!
//! Values in the native set travel as a one-byte marker followed by a
//! fixed-width payload, except strings, which travel as bare UTF-8 so they
//! stay readable by other memcached clients. Everything else goes through
//! bincode and is marked with the serialized flag bit. Payloads at or above
//! the compression threshold are gzip-compressed on write; the compressed
//! bit is always honored on read, even when compression is disabled.

use std::fmt;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ClientError, ClientResult};

/// Flags bit: payload is gzip-compressed.
pub const F_COMPRESSED: u32 = 0x02;
/// Flags bit: payload is an opaque serialized object.
pub const F_SERIALIZED: u32 = 0x08;

/// Default compression threshold in bytes (30 KiB).
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 30 * 1024;

const MARKER_BYTE: u8 = 1;
const MARKER_BOOL: u8 = 2;
const MARKER_INT: u8 = 3;
const MARKER_LONG: u8 = 4;
const MARKER_CHAR: u8 = 5;
const MARKER_STRING: u8 = 6;
const MARKER_STRING_BUILDER: u8 = 7;
const MARKER_FLOAT: u8 = 8;
const MARKER_SHORT: u8 = 9;
const MARKER_DOUBLE: u8 = 10;
const MARKER_DATE: u8 = 11;

/// A value in the native set.
///
/// `Date` carries 100-nanosecond ticks since the Unix epoch.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(i8),
    Bool(bool),
    Int(i32),
    Long(i64),
    Char(char),
    Str(String),
    Float(f32),
    Short(i16),
    Double(f64),
    Date(i64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Char(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Short(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

/// Encoder/decoder configured with the client's compression policy.
#[derive(Debug, Clone)]
pub struct Codec {
    pub compress_enable: bool,
    pub compress_threshold: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Codec {
            compress_enable: true,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        }
    }
}

impl Codec {
    /// Encode a native value for storage, returning the payload and flags.
    ///
    /// With `as_string` the value is stored as its textual representation,
    /// with no marker byte, no flags, and no compression. That is the form
    /// the server-side `incr`/`decr` arithmetic requires.
    pub fn encode(&self, value: &Value, as_string: bool) -> ClientResult<(Vec<u8>, u32)> {
        if as_string {
            return Ok((value.to_string().into_bytes(), 0));
        }
        self.finish(encode_native(value), 0)
    }

    /// Encode an arbitrary value through the opaque serialization path.
    pub fn encode_serialized<T: Serialize>(&self, value: &T) -> ClientResult<(Vec<u8>, u32)> {
        let raw = bincode::serialize(value).map_err(|err| ClientError::Codec(err.to_string()))?;
        self.finish(raw, F_SERIALIZED)
    }

    fn finish(&self, raw: Vec<u8>, flags: u32) -> ClientResult<(Vec<u8>, u32)> {
        if self.compress_enable && raw.len() >= self.compress_threshold {
            Ok((gzip(&raw)?, flags | F_COMPRESSED))
        } else {
            Ok((raw, flags))
        }
    }

    /// Decode a fetched payload into a native value.
    ///
    /// The compressed bit is honored regardless of `compress_enable`.
    /// Payloads carrying the serialized bit cannot be decoded here.
    pub fn decode(&self, data: Vec<u8>, flags: u32, as_string: bool) -> ClientResult<Value> {
        let data = if flags & F_COMPRESSED != 0 {
            gunzip(&data)?
        } else {
            data
        };
        if flags & F_SERIALIZED != 0 {
            return Err(ClientError::Codec(
                "value was stored serialized; fetch it with fetch_serialized".to_string(),
            ));
        }
        if as_string {
            return Ok(Value::Str(utf8(data)?));
        }
        decode_native(data)
    }

    /// Decode a fetched payload through the opaque serialization path.
    pub fn decode_serialized<T: DeserializeOwned>(
        &self,
        data: Vec<u8>,
        flags: u32,
    ) -> ClientResult<T> {
        let data = if flags & F_COMPRESSED != 0 {
            gunzip(&data)?
        } else {
            data
        };
        if flags & F_SERIALIZED == 0 {
            return Err(ClientError::Codec(
                "value was not stored serialized".to_string(),
            ));
        }
        bincode::deserialize(&data).map_err(|err| ClientError::Codec(err.to_string()))
    }
}

/// Encode a native value as `[marker | payload]`, or bare UTF-8 for strings.
fn encode_native(value: &Value) -> Vec<u8> {
    match value {
        Value::Str(s) => s.as_bytes().to_vec(),
        Value::Byte(v) => vec![MARKER_BYTE, *v as u8],
        Value::Bool(v) => vec![MARKER_BOOL, *v as u8],
        Value::Int(v) => tagged(MARKER_INT, &v.to_be_bytes()),
        Value::Long(v) => tagged(MARKER_LONG, &v.to_be_bytes()),
        Value::Char(v) => tagged(MARKER_CHAR, &(*v as u32).to_be_bytes()),
        Value::Float(v) => tagged(MARKER_FLOAT, &v.to_le_bytes()),
        Value::Short(v) => tagged(MARKER_SHORT, &(*v as i32).to_be_bytes()),
        Value::Double(v) => tagged(MARKER_DOUBLE, &v.to_le_bytes()),
        Value::Date(v) => tagged(MARKER_DATE, &v.to_be_bytes()),
    }
}

fn tagged(marker: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(marker);
    buf.extend_from_slice(payload);
    buf
}

/// Decode a payload, interpreting it as tagged only when the marker byte is
/// recognized and the payload length is exactly what that marker requires.
/// Anything else is a string.
fn decode_native(data: Vec<u8>) -> ClientResult<Value> {
    if data.is_empty() {
        return Ok(Value::Str(String::new()));
    }
    match (data[0], data.len()) {
        (MARKER_BYTE, 2) => Ok(Value::Byte(data[1] as i8)),
        (MARKER_BOOL, 2) if data[1] <= 1 => Ok(Value::Bool(data[1] == 1)),
        (MARKER_INT, 5) => Ok(Value::Int(i32::from_be_bytes(fixed(&data[1..])))),
        (MARKER_LONG, 9) => Ok(Value::Long(i64::from_be_bytes(fixed(&data[1..])))),
        (MARKER_CHAR, 5) => {
            let code = u32::from_be_bytes(fixed(&data[1..]));
            match char::from_u32(code) {
                Some(c) => Ok(Value::Char(c)),
                None => Err(ClientError::Codec(format!(
                    "invalid char code point {code:#x}"
                ))),
            }
        }
        (MARKER_STRING, _) | (MARKER_STRING_BUILDER, _) => {
            Ok(Value::Str(utf8(data[1..].to_vec())?))
        }
        (MARKER_FLOAT, 5) => Ok(Value::Float(f32::from_le_bytes(fixed(&data[1..])))),
        (MARKER_SHORT, 5) => {
            let wide = i32::from_be_bytes(fixed(&data[1..]));
            i16::try_from(wide)
                .map(Value::Short)
                .map_err(|_| ClientError::Codec(format!("short value {wide} out of range")))
        }
        (MARKER_DOUBLE, 9) => Ok(Value::Double(f64::from_le_bytes(fixed(&data[1..])))),
        (MARKER_DATE, 9) => Ok(Value::Date(i64::from_be_bytes(fixed(&data[1..])))),
        _ => Ok(Value::Str(utf8(data)?)),
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(bytes);
    buf
}

fn utf8(data: Vec<u8>) -> ClientResult<String> {
    String::from_utf8(data).map_err(|err| ClientError::Codec(err.to_string()))
}

fn gzip(data: &[u8]) -> ClientResult<Vec<u8>> {
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|err| ClientError::Codec(format!("gzip failed: {err}")))?;
    encoder
        .finish()
        .map_err(|err| ClientError::Codec(format!("gzip failed: {err}")))
}

fn gunzip(data: &[u8]) -> ClientResult<Vec<u8>> {
    use std::io::Read;
    let mut out = Vec::with_capacity(data.len().saturating_mul(2));
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|err| ClientError::Codec(format!("gunzip failed: {err}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let codec = Codec::default();
        let (data, flags) = codec.encode(&value, false).unwrap();
        assert_eq!(flags, 0);
        assert_eq!(codec.decode(data, flags, false).unwrap(), value);
    }

    #[test]
    fn native_roundtrips() {
        roundtrip(Value::Byte(-5));
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(i32::MIN));
        roundtrip(Value::Long(i64::MAX));
        roundtrip(Value::Char('\u{00e9}'));
        roundtrip(Value::Str("hello".to_string()));
        roundtrip(Value::Str(String::new()));
        roundtrip(Value::Float(3.5));
        roundtrip(Value::Short(-300));
        roundtrip(Value::Double(std::f64::consts::PI));
        roundtrip(Value::Date(638_000_000_000_000_000));
    }

    #[test]
    fn string_is_bare_utf8() {
        let codec = Codec::default();
        let (data, flags) = codec
            .encode(&Value::Str("hello".to_string()), false)
            .unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(flags, 0);
    }

    #[test]
    fn int_layout_is_tagged_big_endian() {
        let codec = Codec::default();
        let (data, _) = codec.encode(&Value::Int(0x0102_0304), false).unwrap();
        assert_eq!(data, [3, 1, 2, 3, 4]);
    }

    #[test]
    fn tag_requires_exact_length() {
        // First byte is a marker value but the length does not match any
        // tagged layout, so this decodes as a string.
        let data = vec![MARKER_INT, b'a', b'b'];
        let decoded = decode_native(data).unwrap();
        assert_eq!(decoded, Value::Str("\u{3}ab".to_string()));
    }

    #[test]
    fn string_builder_marker_accepted() {
        let mut data = vec![MARKER_STRING_BUILDER];
        data.extend_from_slice(b"mutable");
        assert_eq!(
            decode_native(data).unwrap(),
            Value::Str("mutable".to_string())
        );
    }

    #[test]
    fn text_encoding_has_no_tag_or_flags() {
        let codec = Codec {
            compress_enable: true,
            compress_threshold: 1,
        };
        let (data, flags) = codec.encode(&Value::Long(12345), true).unwrap();
        assert_eq!(data, b"12345");
        assert_eq!(flags, 0);

        let decoded = codec.decode(data, flags, true).unwrap();
        assert_eq!(decoded, Value::Str("12345".to_string()));
    }

    #[test]
    fn compression_threshold() {
        let codec = Codec {
            compress_enable: true,
            compress_threshold: 100,
        };
        let big = "x".repeat(200);
        let (data, flags) = codec.encode(&Value::Str(big.clone()), false).unwrap();
        assert_ne!(flags & F_COMPRESSED, 0);
        assert_ne!(data, big.as_bytes());

        // Reads decompress even when compression is disabled for writes.
        let reader = Codec {
            compress_enable: false,
            ..Codec::default()
        };
        assert_eq!(reader.decode(data, flags, false).unwrap(), Value::Str(big));
    }

    #[test]
    fn below_threshold_not_compressed() {
        let codec = Codec {
            compress_enable: true,
            compress_threshold: 100,
        };
        let (data, flags) = codec
            .encode(&Value::Str("small".to_string()), false)
            .unwrap();
        assert_eq!(flags, 0);
        assert_eq!(data, b"small");
    }

    #[test]
    fn compress_disabled_never_compresses() {
        let codec = Codec {
            compress_enable: false,
            compress_threshold: 1,
        };
        let (_, flags) = codec
            .encode(&Value::Str("data".to_string()), false)
            .unwrap();
        assert_eq!(flags & F_COMPRESSED, 0);
    }

    #[test]
    fn serialized_roundtrip() {
        #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
        struct Session {
            user: String,
            hits: u64,
        }
        let value = Session {
            user: "alice".to_string(),
            hits: 42,
        };
        let codec = Codec::default();
        let (data, flags) = codec.encode_serialized(&value).unwrap();
        assert_ne!(flags & F_SERIALIZED, 0);
        let back: Session = codec.decode_serialized(data, flags).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn serialized_with_compression() {
        #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
        struct Blob(Vec<u8>);
        let value = Blob(vec![7u8; 4096]);
        let codec = Codec {
            compress_enable: true,
            compress_threshold: 64,
        };
        let (data, flags) = codec.encode_serialized(&value).unwrap();
        assert_eq!(flags, F_SERIALIZED | F_COMPRESSED);
        let back: Blob = codec.decode_serialized(data, flags).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn decode_rejects_serialized_as_native() {
        let codec = Codec::default();
        let (data, flags) = codec.encode_serialized(&vec![1u8, 2, 3]).unwrap();
        assert!(matches!(
            codec.decode(data, flags, false),
            Err(ClientError::Codec(_))
        ));
    }

    #[test]
    fn empty_payload_is_empty_string() {
        let codec = Codec::default();
        assert_eq!(
            codec.decode(Vec::new(), 0, false).unwrap(),
            Value::Str(String::new())
        );
    }
}
