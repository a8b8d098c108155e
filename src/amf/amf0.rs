//! AMF0 codec
//!
//! Command and data message payloads are sequences of AMF0 values. The
//! decoder here walks a borrowed slice through an explicit cursor and a
//! pair of recursive functions (one for values, one for property lists),
//! so a malformed payload costs nothing but an error: the caller's buffer
//! is never consumed and there is no codec state to reset between
//! messages. Encoding is a single pass appending to a `BytesMut`.
//!
//! Only the markers that occur on a live connection are modeled:
//!
//! ```text
//! 0x00 Number    0x01 Boolean   0x02 String       0x03 Object
//! 0x05 Null      0x06 Undefined 0x08 ECMA Array   0x09 Object End
//! 0x0A Strict Array   0x0B Date   0x0C Long String
//! ```
//!
//! Everything else fails decoding with [`AmfError::UnknownMarker`]. The
//! one wire quirk that gets tolerated is an object end marker missing at
//! the very end of a payload, which some encoder builds produce on the
//! last pair of `onMetaData`.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::value::AmfValue;
use crate::error::AmfError;

const M_NUMBER: u8 = 0x00;
const M_BOOLEAN: u8 = 0x01;
const M_STRING: u8 = 0x02;
const M_OBJECT: u8 = 0x03;
const M_NULL: u8 = 0x05;
const M_UNDEFINED: u8 = 0x06;
const M_ECMA_ARRAY: u8 = 0x08;
const M_OBJECT_END: u8 = 0x09;
const M_STRICT_ARRAY: u8 = 0x0A;
const M_DATE: u8 = 0x0B;
const M_LONG_STRING: u8 = 0x0C;

/// Recursion allowance for nested containers
const DEPTH_LIMIT: u32 = 64;

/// Decode every value in a payload, in order.
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut reader = Reader::new(data);
    let mut values = Vec::new();
    while !reader.at_end() {
        values.push(read_value(&mut reader, DEPTH_LIMIT)?);
    }
    Ok(values)
}

/// Encode values back-to-back into one payload.
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut out = BytesMut::with_capacity(128);
    for value in values {
        write_value(&mut out, value);
    }
    out.freeze()
}

/// Cursor over the raw payload; every read is bounds-checked against the
/// slice, so truncation surfaces as `UnexpectedEof` exactly where the
/// data ran out.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], AmfError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(AmfError::UnexpectedEof)?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, AmfError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, AmfError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, AmfError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn f64(&mut self) -> Result<f64, AmfError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(f64::from_be_bytes(bytes))
    }

    fn utf8(&mut self, len: usize) -> Result<String, AmfError> {
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| AmfError::InvalidUtf8)
    }

    /// 16-bit-length-prefixed string: short string values and all keys
    fn short_string(&mut self) -> Result<String, AmfError> {
        let len = usize::from(self.u16()?);
        self.utf8(len)
    }
}

fn read_value(reader: &mut Reader<'_>, depth: u32) -> Result<AmfValue, AmfError> {
    if depth == 0 {
        return Err(AmfError::NestingTooDeep);
    }

    let value = match reader.u8()? {
        M_NUMBER => AmfValue::Number(reader.f64()?),
        M_BOOLEAN => AmfValue::Boolean(reader.u8()? != 0),
        M_STRING => AmfValue::String(reader.short_string()?),
        M_OBJECT => AmfValue::Object(read_pairs(reader, depth - 1)?),
        M_NULL => AmfValue::Null,
        M_UNDEFINED => AmfValue::Undefined,
        M_ECMA_ARRAY => {
            // The leading count is a hint at best; the end marker is what
            // actually terminates the list
            let _hint = reader.u32()?;
            AmfValue::EcmaArray(read_pairs(reader, depth - 1)?)
        }
        M_STRICT_ARRAY => {
            let count = reader.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(read_value(reader, depth - 1)?);
            }
            AmfValue::Array(items)
        }
        M_DATE => {
            // Millisecond timestamp plus a long-dead timezone field;
            // nothing downstream treats dates as anything but numbers
            let millis = reader.f64()?;
            reader.take(2)?;
            AmfValue::Number(millis)
        }
        M_LONG_STRING => {
            let len = reader.u32()? as usize;
            AmfValue::String(reader.utf8(len)?)
        }
        other => return Err(AmfError::UnknownMarker(other)),
    };

    Ok(value)
}

/// Key-value list shared by objects and ECMA arrays.
///
/// A zero-length key ends the list. The `0x09` end marker should follow
/// it; a payload that stops right at the empty key is accepted anyway,
/// any other byte in the marker's place is an error.
fn read_pairs(
    reader: &mut Reader<'_>,
    depth: u32,
) -> Result<HashMap<String, AmfValue>, AmfError> {
    let mut pairs = HashMap::new();

    loop {
        let key = reader.short_string()?;
        if key.is_empty() {
            if reader.at_end() {
                break;
            }
            if reader.u8()? != M_OBJECT_END {
                return Err(AmfError::InvalidObjectEnd);
            }
            break;
        }

        pairs.insert(key, read_value(reader, depth)?);
    }

    Ok(pairs)
}

fn write_value(out: &mut BytesMut, value: &AmfValue) {
    match value {
        AmfValue::Number(n) => {
            out.put_u8(M_NUMBER);
            out.put_f64(*n);
        }
        AmfValue::Boolean(b) => {
            out.put_u8(M_BOOLEAN);
            out.put_u8(u8::from(*b));
        }
        AmfValue::String(s) if s.len() <= usize::from(u16::MAX) => {
            out.put_u8(M_STRING);
            write_key(out, s);
        }
        AmfValue::String(s) => {
            out.put_u8(M_LONG_STRING);
            out.put_u32(s.len() as u32);
            out.put_slice(s.as_bytes());
        }
        AmfValue::Null => out.put_u8(M_NULL),
        AmfValue::Undefined => out.put_u8(M_UNDEFINED),
        AmfValue::Object(pairs) => {
            out.put_u8(M_OBJECT);
            write_pairs(out, pairs);
        }
        AmfValue::EcmaArray(pairs) => {
            out.put_u8(M_ECMA_ARRAY);
            out.put_u32(pairs.len() as u32);
            write_pairs(out, pairs);
        }
        AmfValue::Array(items) => {
            out.put_u8(M_STRICT_ARRAY);
            out.put_u32(items.len() as u32);
            for item in items {
                write_value(out, item);
            }
        }
    }
}

fn write_pairs(out: &mut BytesMut, pairs: &HashMap<String, AmfValue>) {
    for (key, value) in pairs {
        write_key(out, key);
        write_value(out, value);
    }
    // Empty key, then the end marker
    write_key(out, "");
    out.put_u8(M_OBJECT_END);
}

/// Length-prefixed UTF-8 without a type marker
fn write_key(out: &mut BytesMut, s: &str) {
    let len = s.len().min(usize::from(u16::MAX));
    out.put_u16(len as u16);
    out.put_slice(&s.as_bytes()[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &AmfValue) -> AmfValue {
        let encoded = encode_all(std::slice::from_ref(value));
        let mut decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded.len(), 1);
        decoded.pop().unwrap()
    }

    #[test]
    fn test_scalar_roundtrips() {
        assert_eq!(roundtrip(&AmfValue::Number(42.5)), AmfValue::Number(42.5));
        assert_eq!(roundtrip(&AmfValue::Boolean(true)), AmfValue::Boolean(true));
        assert_eq!(
            roundtrip(&AmfValue::Boolean(false)),
            AmfValue::Boolean(false)
        );
        assert_eq!(roundtrip(&AmfValue::Null), AmfValue::Null);
        assert_eq!(roundtrip(&AmfValue::Undefined), AmfValue::Undefined);

        let value = AmfValue::String("hello world".into());
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_long_string_uses_wide_length() {
        let long = "x".repeat(70_000);
        let encoded = encode_all(&[AmfValue::String(long.clone())]);
        assert_eq!(encoded[0], M_LONG_STRING);
        assert_eq!(roundtrip(&AmfValue::String(long.clone())), AmfValue::String(long));
    }

    #[test]
    fn test_object_roundtrip() {
        let mut pairs = HashMap::new();
        pairs.insert("name".to_string(), AmfValue::String("test".into()));
        pairs.insert("value".to_string(), AmfValue::Number(123.0));

        match roundtrip(&AmfValue::Object(pairs.clone())) {
            AmfValue::Object(decoded) => assert_eq!(decoded, pairs),
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_ecma_array_roundtrip() {
        let mut pairs = HashMap::new();
        pairs.insert("width".to_string(), AmfValue::Number(1920.0));
        pairs.insert("height".to_string(), AmfValue::Number(1080.0));

        let decoded = roundtrip(&AmfValue::EcmaArray(pairs));
        assert_eq!(decoded.get_number("width"), Some(1920.0));
        assert_eq!(decoded.get_number("height"), Some(1080.0));
    }

    #[test]
    fn test_array_roundtrip() {
        let value = AmfValue::Array(vec![
            AmfValue::Number(1.0),
            AmfValue::String("two".into()),
            AmfValue::Boolean(true),
        ]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_nested_object() {
        let mut inner = HashMap::new();
        inner.insert("key".to_string(), AmfValue::String("value".into()));
        let mut outer = HashMap::new();
        outer.insert("inner".to_string(), AmfValue::Object(inner));

        let decoded = roundtrip(&AmfValue::Object(outer));
        let inner = decoded.as_object().unwrap().get("inner").unwrap();
        assert_eq!(inner.get_str("key"), Some("value"));
    }

    #[test]
    fn test_date_reads_as_number() {
        let mut raw = BytesMut::new();
        raw.put_u8(M_DATE);
        raw.put_f64(1_700_000_000_000.0);
        raw.put_i16(0);

        let decoded = decode_all(&raw).unwrap();
        assert_eq!(decoded, vec![AmfValue::Number(1_700_000_000_000.0)]);
    }

    #[test]
    fn test_truncation_is_eof() {
        // Marker alone
        assert!(matches!(decode_all(&[M_NUMBER]), Err(AmfError::UnexpectedEof)));
        // Number cut mid-double
        assert!(matches!(
            decode_all(&[M_NUMBER, 0x40, 0x45]),
            Err(AmfError::UnexpectedEof)
        ));
        // String whose length outruns the payload
        assert!(matches!(
            decode_all(&[M_STRING, 0x00, 0x10, b'x']),
            Err(AmfError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_missing_end_marker_at_eof_accepted() {
        // Object cut off right after the terminating empty key
        let mut raw = BytesMut::new();
        raw.put_u8(M_OBJECT);
        raw.put_u16(3);
        raw.put_slice(b"app");
        raw.put_u8(M_STRING);
        raw.put_u16(4);
        raw.put_slice(b"live");
        raw.put_u16(0); // empty key, then nothing

        let decoded = decode_all(&raw).unwrap();
        assert_eq!(decoded[0].get_str("app"), Some("live"));
    }

    #[test]
    fn test_wrong_end_marker_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u8(M_OBJECT);
        raw.put_u16(0); // empty key
        raw.put_u8(M_NULL); // not the end marker

        assert!(matches!(
            decode_all(&raw),
            Err(AmfError::InvalidObjectEnd)
        ));
    }

    #[test]
    fn test_unknown_marker_rejected() {
        assert!(matches!(
            decode_all(&[0x11]),
            Err(AmfError::UnknownMarker(0x11))
        ));
        assert!(matches!(
            decode_all(&[0xFF]),
            Err(AmfError::UnknownMarker(0xFF))
        ));
    }

    #[test]
    fn test_depth_limit() {
        let mut nested = AmfValue::Object(HashMap::new());
        for _ in 0..70 {
            let mut wrapper = HashMap::new();
            wrapper.insert("inner".to_string(), nested);
            nested = AmfValue::Object(wrapper);
        }

        let encoded = encode_all(&[nested]);
        assert!(matches!(
            decode_all(&encoded),
            Err(AmfError::NestingTooDeep)
        ));
    }

    #[test]
    fn test_decoder_consumes_values_in_order() {
        let values = vec![
            AmfValue::String("connect".into()),
            AmfValue::Number(1.0),
            AmfValue::Null,
        ];
        assert_eq!(decode_all(&encode_all(&values)).unwrap(), values);
    }

    #[test]
    fn test_connect_command_shape() {
        let mut object = HashMap::new();
        object.insert("app".to_string(), AmfValue::String("live".into()));
        object.insert("flashVer".to_string(), AmfValue::String("FMLE/3.0".into()));
        object.insert(
            "tcUrl".to_string(),
            AmfValue::String("rtmp://localhost/live".into()),
        );
        object.insert("objectEncoding".to_string(), AmfValue::Number(0.0));

        let payload = encode_all(&[
            AmfValue::String("connect".into()),
            AmfValue::Number(1.0),
            AmfValue::Object(object),
        ]);
        let decoded = decode_all(&payload).unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].as_str(), Some("connect"));
        assert_eq!(decoded[1].as_number(), Some(1.0));
        assert_eq!(decoded[2].get_str("app"), Some("live"));
    }
}
