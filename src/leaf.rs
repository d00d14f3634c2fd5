//! Payload encodings for leaf nodes.

use byteorder::{LittleEndian, ReadBytesExt};
use serde_bytes::ByteBuf;

use crate::error::Result;

/// A value stored directly in a leaf node's payload.
pub trait Leaf: Sized {
    /// Payload size for fixed-width types, `None` for variable-length payloads.
    const SIZE: Option<usize>;

    /// Payload size of this particular value.
    fn payload_len(&self) -> usize {
        Self::SIZE.unwrap_or(0)
    }

    /// Append the payload onto a byte vector.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Decode from a payload whose length is already known to fit. Fails with a description of
    /// the problem if the bytes aren't a valid value of this type.
    fn decode(payload: &[u8]) -> Result<Self, String>;
}

macro_rules! fixed_leaf {
    ($t:ty, $size:expr, $read:ident) => {
        impl Leaf for $t {
            const SIZE: Option<usize> = Some($size);

            fn encode(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_le_bytes());
            }

            fn decode(mut payload: &[u8]) -> Result<Self, String> {
                payload
                    .$read::<LittleEndian>()
                    .map_err(|e| e.to_string())
            }
        }
    };
}

fixed_leaf!(i16, 2, read_i16);
fixed_leaf!(u16, 2, read_u16);
fixed_leaf!(i32, 4, read_i32);
fixed_leaf!(u32, 4, read_u32);
fixed_leaf!(i64, 8, read_i64);
fixed_leaf!(u64, 8, read_u64);
fixed_leaf!(f32, 4, read_f32);
fixed_leaf!(f64, 8, read_f64);

impl Leaf for i8 {
    const SIZE: Option<usize> = Some(1);

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }

    fn decode(mut payload: &[u8]) -> Result<Self, String> {
        payload.read_i8().map_err(|e| e.to_string())
    }
}

impl Leaf for u8 {
    const SIZE: Option<usize> = Some(1);

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self);
    }

    fn decode(mut payload: &[u8]) -> Result<Self, String> {
        payload.read_u8().map_err(|e| e.to_string())
    }
}

impl Leaf for bool {
    const SIZE: Option<usize> = Some(1);

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }

    fn decode(mut payload: &[u8]) -> Result<Self, String> {
        payload
            .read_u8()
            .map(|v| v != 0)
            .map_err(|e| e.to_string())
    }
}

impl Leaf for char {
    const SIZE: Option<usize> = Some(4);

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(*self as u32).to_le_bytes());
    }

    fn decode(mut payload: &[u8]) -> Result<Self, String> {
        let v = payload
            .read_u32::<LittleEndian>()
            .map_err(|e| e.to_string())?;
        char::from_u32(v).ok_or_else(|| format!("0x{:x} is not a unicode scalar value", v))
    }
}

/// Text is stored as UTF-8 followed by a single zero terminator byte.
impl Leaf for String {
    const SIZE: Option<usize> = None;

    fn payload_len(&self) -> usize {
        self.len() + 1
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.as_bytes());
        buf.push(0);
    }

    fn decode(payload: &[u8]) -> Result<Self, String> {
        decode_text(payload).map(|s| s.to_string())
    }
}

impl Leaf for ByteBuf {
    const SIZE: Option<usize> = None;

    fn payload_len(&self) -> usize {
        self.len()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }

    fn decode(payload: &[u8]) -> Result<Self, String> {
        Ok(ByteBuf::from(payload))
    }
}

/// Borrow the text held in a text payload.
pub fn decode_text(payload: &[u8]) -> Result<&str, String> {
    match payload.split_last() {
        Some((0, text)) => std::str::from_utf8(text).map_err(|e| e.to_string()),
        Some(_) => Err("text is missing its terminator".to_string()),
        None => Err("text payload is empty".to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn enc<T: Leaf>(v: T) -> Vec<u8> {
        let mut buf = Vec::new();
        v.encode(&mut buf);
        assert_eq!(buf.len(), v.payload_len());
        buf
    }

    #[test]
    fn payload_layout() {
        assert_eq!(enc(6i32), &[6, 0, 0, 0]);
        assert_eq!(enc(-2i16), &[0xfe, 0xff]);
        assert_eq!(enc(true), &[1]);
        assert_eq!(enc('A'), &[0x41, 0, 0, 0]);
        assert_eq!(enc(1.0f32), &[0, 0, 0x80, 0x3f]);
        assert_eq!(enc("hi".to_string()), &[b'h', b'i', 0]);
        assert_eq!(enc(String::new()), &[0]);
    }

    #[test]
    fn text() {
        let s = "ä\0ü China".to_string();
        assert_eq!(String::decode(&enc(s.clone())).unwrap(), s);
        assert!(String::decode(&[]).is_err());
        assert!(String::decode(b"abc").is_err());
        assert!(String::decode(&[0xff, 0]).is_err());
    }

    #[test]
    fn bad_char() {
        assert!(char::decode(&0xD800u32.to_le_bytes()).is_err());
        assert_eq!(char::decode(&0x21FFu32.to_le_bytes()).unwrap(), '\u{21FF}');
    }

    #[test]
    fn short_payload() {
        assert!(i32::decode(&[1, 2]).is_err());
        assert!(f64::decode(&[1, 2, 3, 4]).is_err());
    }
}
