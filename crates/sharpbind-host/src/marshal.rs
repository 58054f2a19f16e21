//! Value marshaling.
//!
//! Two encodings live here. [`Frame`] is the packed argument buffer a
//! trampoline reads, laid out by [`FrameLayout`] in native byte order. The
//! tagged encoding ([`Encoder`]/[`Decoder`]) is self-describing and always
//! little-endian; it carries native → managed calls, whose argument types
//! only the managed side knows.

use crate::error::HostError;
use crate::value::Value;
use sharpbind_core::layout::{NativeCategory, NativeRepr};

/// Zeroed, 8-byte aligned argument buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    words: Vec<u64>,
    len: usize,
}

impl Frame {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(8).max(1)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `words` holds at least `len` initialized bytes and u8 has no alignment.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and the borrow is unique.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }

    pub fn write(&mut self, offset: usize, repr: &NativeRepr, value: &Value) -> Result<(), HostError> {
        write_value(self.bytes_mut(), offset, repr, value)
    }

    pub fn read(&self, offset: usize, repr: &NativeRepr) -> Result<Value, HostError> {
        read_value(self.bytes(), offset, repr)
    }
}

fn region(len: usize, offset: usize, size: usize) -> Result<std::ops::Range<usize>, HostError> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(HostError::marshal(format!(
            "{size} bytes at offset {offset} overrun a {len}-byte buffer"
        ))),
    }
}

fn mismatch(repr: &NativeRepr, value: &Value) -> HostError {
    HostError::marshal(format!("cannot store {} as {}", value.type_name(), repr.native_type))
}

/// Store `value` at `offset` using the native representation `repr`.
pub fn write_value(buf: &mut [u8], offset: usize, repr: &NativeRepr, value: &Value) -> Result<(), HostError> {
    let range = region(buf.len(), offset, repr.size)?;
    match &repr.category {
        NativeCategory::Bool => match value {
            Value::Bool(b) => buf[range.start] = u8::from(*b),
            other => return Err(mismatch(repr, other)),
        },
        NativeCategory::Integer { signed } | NativeCategory::Enum { signed, .. } => {
            let v = match value {
                Value::Bool(_) | Value::Handle(_) => None,
                other => other.as_integer(),
            }
            .ok_or_else(|| mismatch(repr, value))?;
            write_integer(&mut buf[range], *signed, v)
                .map_err(|_| HostError::marshal(format!("{v} does not fit in {}", repr.native_type)))?;
        }
        NativeCategory::Float => {
            let v = value.as_float().ok_or_else(|| mismatch(repr, value))?;
            match repr.size {
                4 => buf[range].copy_from_slice(&(v as f32).to_ne_bytes()),
                8 => buf[range].copy_from_slice(&v.to_ne_bytes()),
                n => return Err(HostError::marshal(format!("unsupported float width {n}"))),
            }
        }
        NativeCategory::ObjectHandle => match value {
            Value::Handle(h) => write_integer(&mut buf[range], false, *h as i128)
                .map_err(|_| HostError::marshal("handle exceeds pointer width"))?,
            other => return Err(mismatch(repr, other)),
        },
        NativeCategory::Name => match value {
            Value::Name { index, number } => {
                buf[range.start..range.start + 4].copy_from_slice(&index.to_ne_bytes());
                buf[range.start + 4..range.end].copy_from_slice(&number.to_ne_bytes());
            }
            other => return Err(mismatch(repr, other)),
        },
        NativeCategory::Aggregate { name, fields } => {
            let Value::Struct(values) = value else {
                return Err(mismatch(repr, value));
            };
            if values.len() != fields.len() {
                return Err(HostError::marshal(format!(
                    "{name} has {} fields, got {}",
                    fields.len(),
                    values.len()
                )));
            }
            for (field, v) in fields.iter().zip(values) {
                write_value(buf, offset + field.offset, &field.repr, v)?;
            }
        }
    }
    Ok(())
}

/// Load the value stored at `offset` under `repr`.
pub fn read_value(buf: &[u8], offset: usize, repr: &NativeRepr) -> Result<Value, HostError> {
    let range = region(buf.len(), offset, repr.size)?;
    let bytes = &buf[range];
    let value = match &repr.category {
        NativeCategory::Bool => Value::Bool(bytes[0] != 0),
        NativeCategory::Integer { signed } => read_integer(bytes, *signed)?,
        NativeCategory::Enum { signed, .. } => {
            let raw = read_integer(bytes, *signed)?;
            Value::Enum(raw.as_integer().unwrap_or_default() as i64)
        }
        NativeCategory::Float => match bytes.len() {
            4 => Value::F32(f32::from_ne_bytes(array(bytes)?)),
            8 => Value::F64(f64::from_ne_bytes(array(bytes)?)),
            n => return Err(HostError::marshal(format!("unsupported float width {n}"))),
        },
        NativeCategory::ObjectHandle => {
            let raw = read_integer(bytes, false)?;
            Value::Handle(raw.as_integer().unwrap_or_default() as usize)
        }
        NativeCategory::Name => Value::Name {
            index: u32::from_ne_bytes(array(&bytes[..4])?),
            number: u32::from_ne_bytes(array(&bytes[4..])?),
        },
        NativeCategory::Aggregate { fields, .. } => Value::Struct(
            fields
                .iter()
                .map(|f| read_value(buf, offset + f.offset, &f.repr))
                .collect::<Result<_, _>>()?,
        ),
    };
    Ok(value)
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], HostError> {
    bytes
        .try_into()
        .map_err(|_| HostError::marshal(format!("expected {N} bytes, found {}", bytes.len())))
}

fn write_integer(dst: &mut [u8], signed: bool, v: i128) -> Result<(), ()> {
    if !matches!(dst.len(), 1 | 2 | 4 | 8) {
        return Err(());
    }
    let bits = dst.len() as u32 * 8;
    let (min, max) = if signed {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    };
    if v < min || v > max {
        return Err(());
    }
    match dst.len() {
        1 => dst.copy_from_slice(&(v as u8).to_ne_bytes()),
        2 => dst.copy_from_slice(&(v as u16).to_ne_bytes()),
        4 => dst.copy_from_slice(&(v as u32).to_ne_bytes()),
        _ => dst.copy_from_slice(&(v as u64).to_ne_bytes()),
    }
    Ok(())
}

fn read_integer(bytes: &[u8], signed: bool) -> Result<Value, HostError> {
    Ok(match (bytes.len(), signed) {
        (1, true) => Value::I8(i8::from_ne_bytes(array(bytes)?)),
        (2, true) => Value::I16(i16::from_ne_bytes(array(bytes)?)),
        (4, true) => Value::I32(i32::from_ne_bytes(array(bytes)?)),
        (8, true) => Value::I64(i64::from_ne_bytes(array(bytes)?)),
        (1, false) => Value::U8(u8::from_ne_bytes(array(bytes)?)),
        (2, false) => Value::U16(u16::from_ne_bytes(array(bytes)?)),
        (4, false) => Value::U32(u32::from_ne_bytes(array(bytes)?)),
        (8, false) => Value::U64(u64::from_ne_bytes(array(bytes)?)),
        (n, _) => return Err(HostError::marshal(format!("unsupported integer width {n}"))),
    })
}

mod tag {
    pub const VOID: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const I8: u8 = 2;
    pub const I16: u8 = 3;
    pub const I32: u8 = 4;
    pub const I64: u8 = 5;
    pub const U8: u8 = 6;
    pub const U16: u8 = 7;
    pub const U32: u8 = 8;
    pub const U64: u8 = 9;
    pub const F32: u8 = 10;
    pub const F64: u8 = 11;
    pub const NAME: u8 = 12;
    pub const HANDLE: u8 = 13;
    pub const ENUM: u8 = 14;
    pub const STRING: u8 = 15;
    pub const TEXT: u8 = 16;
    pub const STRUCT: u8 = 17;
    pub const ARRAY: u8 = 18;
    pub const MAP: u8 = 19;
}

const MAX_DEPTH: usize = 32;

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `method`, then the argument count and each argument.
    pub fn request(method: &str, args: &[Value]) -> Vec<u8> {
        let mut enc = Self::new();
        enc.str(method);
        enc.values(args);
        enc.finish()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn len(&mut self, n: usize) {
        self.buf.extend_from_slice(&(n as u32).to_le_bytes());
    }

    pub fn str(&mut self, s: &str) {
        self.len(s.len());
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn values(&mut self, values: &[Value]) {
        self.len(values.len());
        for v in values {
            self.value(v);
        }
    }

    pub fn value(&mut self, value: &Value) {
        let b = &mut self.buf;
        match value {
            Value::Void => b.push(tag::VOID),
            Value::Bool(v) => b.extend_from_slice(&[tag::BOOL, u8::from(*v)]),
            Value::I8(v) => {
                b.push(tag::I8);
                b.extend_from_slice(&v.to_le_bytes());
            }
            Value::I16(v) => {
                b.push(tag::I16);
                b.extend_from_slice(&v.to_le_bytes());
            }
            Value::I32(v) => {
                b.push(tag::I32);
                b.extend_from_slice(&v.to_le_bytes());
            }
            Value::I64(v) => {
                b.push(tag::I64);
                b.extend_from_slice(&v.to_le_bytes());
            }
            Value::U8(v) => b.extend_from_slice(&[tag::U8, *v]),
            Value::U16(v) => {
                b.push(tag::U16);
                b.extend_from_slice(&v.to_le_bytes());
            }
            Value::U32(v) => {
                b.push(tag::U32);
                b.extend_from_slice(&v.to_le_bytes());
            }
            Value::U64(v) => {
                b.push(tag::U64);
                b.extend_from_slice(&v.to_le_bytes());
            }
            Value::F32(v) => {
                b.push(tag::F32);
                b.extend_from_slice(&v.to_le_bytes());
            }
            Value::F64(v) => {
                b.push(tag::F64);
                b.extend_from_slice(&v.to_le_bytes());
            }
            Value::Name { index, number } => {
                b.push(tag::NAME);
                b.extend_from_slice(&index.to_le_bytes());
                b.extend_from_slice(&number.to_le_bytes());
            }
            Value::Handle(h) => {
                b.push(tag::HANDLE);
                b.extend_from_slice(&(*h as u64).to_le_bytes());
            }
            Value::Enum(v) => {
                b.push(tag::ENUM);
                b.extend_from_slice(&v.to_le_bytes());
            }
            Value::String(s) => {
                b.push(tag::STRING);
                self.str(s);
            }
            Value::Text(s) => {
                b.push(tag::TEXT);
                self.str(s);
            }
            Value::Struct(fields) => {
                b.push(tag::STRUCT);
                self.values(fields);
            }
            Value::Array(items) => {
                b.push(tag::ARRAY);
                self.values(items);
            }
            Value::Map(pairs) => {
                b.push(tag::MAP);
                self.len(pairs.len());
                for (k, v) in pairs {
                    self.value(k);
                    self.value(v);
                }
            }
        }
    }
}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Inverse of [`Encoder::request`].
    pub fn request(bytes: &'a [u8]) -> Result<(String, Vec<Value>), HostError> {
        let mut dec = Self::new(bytes);
        let method = dec.string()?;
        let args = dec.values()?;
        dec.end()?;
        Ok((method, args))
    }

    pub fn end(&self) -> Result<(), HostError> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(HostError::marshal(format!(
                "{} trailing bytes after payload",
                self.bytes.len() - self.pos
            )))
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], HostError> {
        let range = region(self.bytes.len(), self.pos, n)
            .map_err(|_| HostError::marshal(format!("payload truncated at byte {}", self.pos)))?;
        self.pos = range.end;
        Ok(&self.bytes[range])
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], HostError> {
        array(self.take(N)?)
    }

    fn len(&mut self) -> Result<usize, HostError> {
        let n = u32::from_le_bytes(self.fixed()?) as usize;
        // Every element takes at least one byte.
        if n > self.bytes.len() - self.pos {
            return Err(HostError::marshal(format!("length {n} exceeds payload")));
        }
        Ok(n)
    }

    pub fn string(&mut self) -> Result<String, HostError> {
        let n = self.len()?;
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec()).map_err(|e| HostError::marshal(e.to_string()))
    }

    pub fn values(&mut self) -> Result<Vec<Value>, HostError> {
        self.values_at(0)
    }

    pub fn value(&mut self) -> Result<Value, HostError> {
        self.value_at(0)
    }

    fn values_at(&mut self, depth: usize) -> Result<Vec<Value>, HostError> {
        let n = self.len()?;
        (0..n).map(|_| self.value_at(depth)).collect()
    }

    fn value_at(&mut self, depth: usize) -> Result<Value, HostError> {
        if depth > MAX_DEPTH {
            return Err(HostError::marshal("value nesting too deep"));
        }
        let [t] = self.fixed::<1>()?;
        Ok(match t {
            tag::VOID => Value::Void,
            tag::BOOL => Value::Bool(self.fixed::<1>()?[0] != 0),
            tag::I8 => Value::I8(i8::from_le_bytes(self.fixed()?)),
            tag::I16 => Value::I16(i16::from_le_bytes(self.fixed()?)),
            tag::I32 => Value::I32(i32::from_le_bytes(self.fixed()?)),
            tag::I64 => Value::I64(i64::from_le_bytes(self.fixed()?)),
            tag::U8 => Value::U8(self.fixed::<1>()?[0]),
            tag::U16 => Value::U16(u16::from_le_bytes(self.fixed()?)),
            tag::U32 => Value::U32(u32::from_le_bytes(self.fixed()?)),
            tag::U64 => Value::U64(u64::from_le_bytes(self.fixed()?)),
            tag::F32 => Value::F32(f32::from_le_bytes(self.fixed()?)),
            tag::F64 => Value::F64(f64::from_le_bytes(self.fixed()?)),
            tag::NAME => Value::Name {
                index: u32::from_le_bytes(self.fixed()?),
                number: u32::from_le_bytes(self.fixed()?),
            },
            tag::HANDLE => {
                let raw = u64::from_le_bytes(self.fixed()?);
                Value::Handle(
                    usize::try_from(raw).map_err(|_| HostError::marshal("handle exceeds pointer width"))?,
                )
            }
            tag::ENUM => Value::Enum(i64::from_le_bytes(self.fixed()?)),
            tag::STRING => Value::String(self.string()?),
            tag::TEXT => Value::Text(self.string()?),
            tag::STRUCT => Value::Struct(self.values_at(depth + 1)?),
            tag::ARRAY => Value::Array(self.values_at(depth + 1)?),
            tag::MAP => {
                let n = self.len()?;
                let mut pairs = Vec::with_capacity(n);
                for _ in 0..n {
                    let k = self.value_at(depth + 1)?;
                    let v = self.value_at(depth + 1)?;
                    pairs.push((k, v));
                }
                Value::Map(pairs)
            }
            other => return Err(HostError::marshal(format!("unknown value tag {other}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharpbind_core::layout::AggregateField;

    fn scalar(category: NativeCategory, size: usize, native_type: &str) -> NativeRepr {
        NativeRepr {
            category,
            size,
            align: size,
            native_type: native_type.into(),
        }
    }

    fn int32() -> NativeRepr {
        scalar(NativeCategory::Integer { signed: true }, 4, "int32")
    }

    #[test]
    fn test_frame_is_aligned_and_zeroed() {
        let mut frame = Frame::new(13);
        assert_eq!(frame.len(), 13);
        assert!(frame.bytes().iter().all(|b| *b == 0));
        assert_eq!(frame.as_mut_ptr() as usize % 8, 0);
    }

    #[test]
    fn test_scalar_slots() {
        let mut frame = Frame::new(16);
        let handle = scalar(NativeCategory::ObjectHandle, 8, "UActor*");
        frame.write(0, &handle, &Value::Handle(0xdead)).unwrap();
        frame.write(8, &int32(), &Value::I64(-7)).unwrap();
        assert_eq!(frame.read(0, &handle).unwrap(), Value::Handle(0xdead));
        assert_eq!(frame.read(8, &int32()).unwrap(), Value::I32(-7));
    }

    #[test]
    fn test_integer_range_is_checked() {
        let mut frame = Frame::new(1);
        let byte = scalar(NativeCategory::Integer { signed: false }, 1, "uint8");
        assert!(frame.write(0, &byte, &Value::I32(255)).is_ok());
        assert!(matches!(frame.write(0, &byte, &Value::I32(256)), Err(HostError::Marshal(_))));
        assert!(matches!(frame.write(0, &byte, &Value::I32(-1)), Err(HostError::Marshal(_))));
    }

    #[test]
    fn test_type_mismatch_and_overrun() {
        let mut frame = Frame::new(4);
        let err = frame.write(0, &int32(), &Value::from("text")).unwrap_err();
        assert_eq!(err, HostError::Marshal("cannot store string as int32".into()));
        assert!(frame.write(2, &int32(), &Value::I32(1)).is_err());
    }

    #[test]
    fn test_aggregate_fields() {
        let point = NativeRepr {
            category: NativeCategory::Aggregate {
                name: "Point".into(),
                fields: vec![
                    AggregateField {
                        name: "Valid".into(),
                        offset: 0,
                        repr: scalar(NativeCategory::Bool, 1, "bool"),
                    },
                    AggregateField {
                        name: "X".into(),
                        offset: 8,
                        repr: scalar(NativeCategory::Float, 8, "double"),
                    },
                ],
            },
            size: 16,
            align: 8,
            native_type: "FPoint".into(),
        };
        let mut frame = Frame::new(24);
        let value = Value::Struct(vec![Value::Bool(true), Value::F64(2.5)]);
        frame.write(8, &point, &value).unwrap();
        assert_eq!(frame.read(8, &point).unwrap(), value);
        assert!(frame.write(8, &point, &Value::Struct(vec![Value::Bool(true)])).is_err());
    }

    #[test]
    fn test_request_encoding() {
        let args = vec![
            Value::Handle(42),
            Value::Map(vec![(Value::from("hp"), Value::F32(1.5))]),
            Value::Array(vec![Value::Name { index: 3, number: 0 }, Value::Text("t".into())]),
        ];
        let bytes = Encoder::request("Game.Actor:OnHit", &args);
        let (method, decoded) = Decoder::request(&bytes).unwrap();
        assert_eq!(method, "Game.Actor:OnHit");
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_decoder_rejects_malformed_input() {
        let mut bytes = Encoder::request("M", &[Value::I32(1)]);
        bytes.pop();
        assert!(Decoder::request(&bytes).is_err());

        let mut bytes = Encoder::request("M", &[]);
        bytes.push(0);
        assert!(Decoder::request(&bytes).is_err());

        // Count claims more elements than bytes remain.
        let bytes = [0, 0, 0, 0, 0xff, 0xff, 0xff, 0x0f];
        assert!(Decoder::request(&bytes).is_err());
    }
}
