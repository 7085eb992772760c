//! Self-describing value codec.
//!
//! Serializes the recursive [`Value`] domain into a tagged byte stream, with
//! file descriptors carried out-of-band in a side list and referenced from
//! the byte stream only by index. Grounded on `ipc/codecs.py`'s
//! `_serialize`/`_deserialize`; the marker-tag enum follows the teacher's
//! `num_enum`-derived `#[repr(u32)]` style (`OptType`, `Cmd`, `ErrorType`).

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::{Cursor, Read, Write};

use crate::error::{DecoderError, EncoderError};
use crate::fd::Fd;

/// Wire tags. The set is closed and versionless.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
enum Markers {
    False = 0,
    True = 1,
    None = 2,
    Int64 = 3,
    Double = 4,
    String = 5,
    Bytes = 6,
    ArrayStart = 7,
    ArrayEnd = 8,
    DictStart = 9,
    DictEnd = 10,
    Fd = 11,
}

/// An insertion-ordered association list, used as the map representation in
/// [`Value`]. A plain `HashMap`/`BTreeMap` cannot host this type directly
/// because keys are themselves arbitrary `Value`s (`f64` has no total order,
/// `Fd` has no useful hash), so the native order of the wire format -
/// insertion order - is kept explicitly instead.
#[derive(Debug, Default)]
pub struct OrderedMap(pub Vec<(Value, Value)>);

impl OrderedMap {
    pub fn new() -> Self {
        OrderedMap(Vec::new())
    }

    pub fn push(&mut self, key: Value, value: Value) {
        self.0.push((key, value));
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (Value, Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for OrderedMap {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl FromIterator<(Value, Value)> for OrderedMap {
    fn from_iter<I: IntoIterator<Item = (Value, Value)>>(iter: I) -> Self {
        OrderedMap(iter.into_iter().collect())
    }
}

/// The native recursive value domain exchanged between peers.
#[derive(Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(OrderedMap),
    Fd(Fd),
}

// `Fd` has no meaningful `PartialEq` contract beyond raw value comparison,
// which it already implements; derive(PartialEq) above needs `Fd: PartialEq`
// which is satisfied in src/fd.rs.

impl Value {
    pub fn array(values: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(values.into_iter().collect())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

/// Encode `value` into a payload byte string plus the list of FDs it
/// referenced, in the order they were encountered. Takes `value` by value
/// because each `Fd` it contains is moved into the returned FD list rather
/// than duplicated. Does not fail for any well-formed `Value` tree; the
/// error variant exists for overflow of the 32-bit FD-index field, which
/// requires an unrealistic number of FDs in a single message.
pub fn encode(value: Value) -> Result<(Vec<u8>, Vec<Fd>), EncoderError> {
    let mut buf = Vec::new();
    let mut fds = Vec::new();
    encode_value(value, &mut buf, &mut fds)?;
    Ok((buf, fds))
}

fn encode_value(value: Value, buf: &mut Vec<u8>, fds: &mut Vec<Fd>) -> Result<(), EncoderError> {
    match value {
        // Bool must be matched before Int: in a dynamically typed source
        // language booleans satisfy integer predicates, so the teacher's
        // original had to check `isinstance(value, bool)` ahead of `int`.
        // Here that invariant is preserved structurally by matching the
        // distinct `Bool` variant before `Int` ever comes into play.
        Value::Bool(b) => {
            write_marker(buf, if b { Markers::True } else { Markers::False });
        }
        Value::Null => write_marker(buf, Markers::None),
        Value::Int(i) => {
            write_marker(buf, Markers::Int64);
            buf.write_i64::<LE>(i).unwrap();
        }
        Value::Double(d) => {
            write_marker(buf, Markers::Double);
            buf.write_f64::<LE>(d).unwrap();
        }
        Value::Str(s) => {
            write_marker(buf, Markers::String);
            let bytes = s.as_bytes();
            buf.write_u32::<LE>(bytes.len() as u32).unwrap();
            buf.extend_from_slice(bytes);
        }
        Value::Bytes(b) => {
            write_marker(buf, Markers::Bytes);
            buf.write_u32::<LE>(b.len() as u32).unwrap();
            buf.extend_from_slice(&b);
        }
        Value::Array(items) => {
            write_marker(buf, Markers::ArrayStart);
            for item in items {
                encode_value(item, buf, fds)?;
            }
            write_marker(buf, Markers::ArrayEnd);
        }
        Value::Map(map) => {
            write_marker(buf, Markers::DictStart);
            for (k, v) in map.0 {
                encode_value(k, buf, fds)?;
                encode_value(v, buf, fds)?;
            }
            write_marker(buf, Markers::DictEnd);
        }
        Value::Fd(fd) => {
            write_marker(buf, Markers::Fd);
            let index: u32 = fds.len().try_into().map_err(|_| {
                EncoderError("too many file descriptors in one message".to_string())
            })?;
            buf.write_u32::<LE>(index).unwrap();
            fds.push(fd);
        }
    }
    Ok(())
}

fn write_marker(buf: &mut Vec<u8>, marker: Markers) {
    buf.write_u32::<LE>(marker.into()).unwrap();
}

/// Decode a payload back into a `Value`, resolving `Fd` markers against
/// `fds` (consumed in the order referenced; each FD must be referenced
/// exactly once or the leftover FDs are simply dropped - ownership that was
/// never claimed by the message is released when the caller drops the
/// remaining handles).
pub fn decode(payload: &[u8], fds: Vec<Fd>) -> Result<Value, DecoderError> {
    let mut cursor = Cursor::new(payload);
    let mut fds: Vec<Option<Fd>> = fds.into_iter().map(Some).collect();
    let value = decode_value(&mut cursor, &mut fds)?;
    if (cursor.position() as usize) != payload.len() {
        return Err(DecoderError("trailing bytes after top-level value".into()));
    }
    Ok(value)
}

fn read_marker(cursor: &mut Cursor<&[u8]>) -> Result<Markers, DecoderError> {
    let raw = cursor
        .read_u32::<LE>()
        .map_err(|_| DecoderError("truncated marker".into()))?;
    Markers::try_from(raw).map_err(|_| DecoderError(format!("unknown marker {raw}")))
}

fn decode_value(
    cursor: &mut Cursor<&[u8]>,
    fds: &mut Vec<Option<Fd>>,
) -> Result<Value, DecoderError> {
    match read_marker(cursor)? {
        Markers::False => Ok(Value::Bool(false)),
        Markers::True => Ok(Value::Bool(true)),
        Markers::None => Ok(Value::Null),
        Markers::Int64 => {
            let i = cursor
                .read_i64::<LE>()
                .map_err(|_| DecoderError("truncated int64".into()))?;
            Ok(Value::Int(i))
        }
        Markers::Double => {
            let d = cursor
                .read_f64::<LE>()
                .map_err(|_| DecoderError("truncated double".into()))?;
            Ok(Value::Double(d))
        }
        Markers::String => {
            let bytes = read_length_prefixed(cursor)?;
            let s = String::from_utf8(bytes).map_err(|_| DecoderError("non-UTF8 string".into()))?;
            Ok(Value::Str(s))
        }
        Markers::Bytes => {
            let bytes = read_length_prefixed(cursor)?;
            Ok(Value::Bytes(bytes))
        }
        Markers::ArrayStart => {
            let mut items = Vec::new();
            loop {
                let save = cursor.position();
                match read_marker(cursor)? {
                    Markers::ArrayEnd => break,
                    _ => {
                        cursor.set_position(save);
                        items.push(decode_value(cursor, fds)?);
                    }
                }
            }
            Ok(Value::Array(items))
        }
        Markers::DictStart => {
            let mut map = OrderedMap::new();
            loop {
                let save = cursor.position();
                match read_marker(cursor)? {
                    Markers::DictEnd => break,
                    _ => {
                        cursor.set_position(save);
                        let key = decode_value(cursor, fds)?;
                        let value = decode_value(cursor, fds)?;
                        map.push(key, value);
                    }
                }
            }
            Ok(Value::Map(map))
        }
        Markers::ArrayEnd | Markers::DictEnd => {
            Err(DecoderError("unexpected closing marker".into()))
        }
        Markers::Fd => {
            let index = cursor
                .read_u32::<LE>()
                .map_err(|_| DecoderError("truncated fd index".into()))? as usize;
            let slot = fds
                .get_mut(index)
                .ok_or_else(|| DecoderError(format!("fd index {index} out of range")))?;
            let fd = slot
                .take()
                .ok_or_else(|| DecoderError(format!("fd index {index} referenced twice")))?;
            Ok(Value::Fd(fd))
        }
    }
}

fn read_length_prefixed(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, DecoderError> {
    let len = cursor
        .read_u32::<LE>()
        .map_err(|_| DecoderError("truncated length prefix".into()))? as usize;
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| DecoderError("truncated length-prefixed data".into()))?;
    Ok(buf)
}
