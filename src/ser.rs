//! Serialization of any `serde::Serialize` value into a document.
//!
//! Every value is written under a tag chosen by its container:
//! - Primitives are leaves. Text is UTF-8 with a zero terminator, `char` is a 32-bit scalar.
//! - `None` and unit values are zero-payload leaves; `Some(v)` is just `v`. A `Some` whose value is
//!   itself a zero-payload leaf (`()`, a unit struct, an empty byte buffer) loads back as `None`.
//! - Newtype structs are transparent.
//! - Sequences and tuples are parents holding an `_ElemCount` leaf and one `_Elem` per item.
//! - Maps are parents holding an `_ElemCount` leaf and alternating `_Key`/`_Value` entries.
//! - Structs are parents with one child per field, tagged with the field name.
//!
//! Enum variants, when mapped, are:
//! - Unit - Just the variant name as a text leaf
//! - Newtype - Parent holding the variant name under `_Variant` and the content under `_Value`
//! - Tuple - Same, with the tuple as a sequence under `_Value`
//! - Struct - Same, with the struct under `_Value`

use serde::ser::*;

use crate::error::{Error, Result};
use crate::object::{ELEM_COUNT_TAG, ELEM_TAG};
use crate::serializer::TreeSerializer;

/// Tag of the top-level value in a document written by [`to_bytes`].
pub const ROOT_TAG: &str = "Value";
pub(crate) const KEY_TAG: &str = "_Key";
pub(crate) const VALUE_TAG: &str = "_Value";
pub(crate) const VARIANT_TAG: &str = "_Variant";

/// Serialize a value into a complete document.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut se = TreeSerializer::new();
    se.begin_saving()?;
    value.serialize(ValueSerializer::new(&mut se, ROOT_TAG))?;
    se.end_saving()
}

/// Serializes one value under a fixed tag.
struct ValueSerializer<'a> {
    se: &'a mut TreeSerializer,
    tag: &'static str,
}

impl<'a> ValueSerializer<'a> {
    fn new(se: &'a mut TreeSerializer, tag: &'static str) -> Self {
        Self { se, tag }
    }

    fn leaf(self, len: usize, encode: impl FnOnce(&mut Vec<u8>)) -> Result<()> {
        self.se.save_leaf_with(self.tag, len, encode).map(|_| ())
    }

    fn text(self, v: &str) -> Result<()> {
        self.leaf(v.len() + 1, |buf| {
            buf.extend_from_slice(v.as_bytes());
            buf.push(0);
        })
    }

    /// Open a parent holding the variant name, returning the serializer for its content.
    fn open_variant(self, variant: &'static str) -> Result<&'a mut TreeSerializer> {
        let se = self.se;
        se.open_parent(self.tag)?;
        ValueSerializer::new(&mut *se, VARIANT_TAG).text(variant)?;
        Ok(se)
    }
}

impl<'a> Serializer for ValueSerializer<'a> {
    type Ok = ();
    type Error = Error;
    type SerializeSeq = SeqSerializer<'a>;
    type SerializeTuple = SeqSerializer<'a>;
    type SerializeTupleStruct = SeqSerializer<'a>;
    type SerializeTupleVariant = SeqSerializer<'a>;
    type SerializeMap = MapSerializer<'a>;
    type SerializeStruct = StructSerializer<'a>;
    type SerializeStructVariant = StructSerializer<'a>;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.leaf(1, |buf| buf.push(v as u8))
    }

    fn serialize_i8(self, v: i8) -> Result<()> {
        self.leaf(1, |buf| buf.push(v as u8))
    }

    fn serialize_i16(self, v: i16) -> Result<()> {
        self.leaf(2, |buf| buf.extend_from_slice(&v.to_le_bytes()))
    }

    fn serialize_i32(self, v: i32) -> Result<()> {
        self.leaf(4, |buf| buf.extend_from_slice(&v.to_le_bytes()))
    }

    fn serialize_i64(self, v: i64) -> Result<()> {
        self.leaf(8, |buf| buf.extend_from_slice(&v.to_le_bytes()))
    }

    fn serialize_u8(self, v: u8) -> Result<()> {
        self.leaf(1, |buf| buf.push(v))
    }

    fn serialize_u16(self, v: u16) -> Result<()> {
        self.leaf(2, |buf| buf.extend_from_slice(&v.to_le_bytes()))
    }

    fn serialize_u32(self, v: u32) -> Result<()> {
        self.leaf(4, |buf| buf.extend_from_slice(&v.to_le_bytes()))
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.leaf(8, |buf| buf.extend_from_slice(&v.to_le_bytes()))
    }

    fn serialize_f32(self, v: f32) -> Result<()> {
        self.leaf(4, |buf| buf.extend_from_slice(&v.to_le_bytes()))
    }

    fn serialize_f64(self, v: f64) -> Result<()> {
        self.leaf(8, |buf| buf.extend_from_slice(&v.to_le_bytes()))
    }

    fn serialize_char(self, v: char) -> Result<()> {
        self.serialize_u32(v as u32)
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        self.text(v)
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        self.leaf(v.len(), |buf| buf.extend_from_slice(v))
    }

    fn serialize_none(self) -> Result<()> {
        self.serialize_unit()
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<()> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<()> {
        self.leaf(0, |_| ())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<()> {
        self.text(variant)
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<()> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<()> {
        let se = self.open_variant(variant)?;
        value.serialize(ValueSerializer::new(&mut *se, VALUE_TAG))?;
        se.close_parent()
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        SeqSerializer::new(self.se, self.tag, false)
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        let se = self.open_variant(variant)?;
        SeqSerializer::new(se, VALUE_TAG, true)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        MapSerializer::new(self.se, self.tag)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct> {
        StructSerializer::new(self.se, self.tag, false)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        let se = self.open_variant(variant)?;
        StructSerializer::new(se, VALUE_TAG, true)
    }
}

/// Open a parent with a placeholder element count, returning the count's payload position.
fn open_counted(se: &mut TreeSerializer, tag: &'static str) -> Result<usize> {
    se.open_parent(tag)?;
    se.save_leaf_with(ELEM_COUNT_TAG, 4, |buf| {
        buf.extend_from_slice(&0i32.to_le_bytes())
    })
}

fn close_counted(se: &mut TreeSerializer, count_pos: usize, count: usize) -> Result<()> {
    let count = i32::try_from(count).map_err(|_| Error::LengthTooLong {
        max: i32::MAX as usize,
        actual: count,
    })?;
    se.patch_i32(count_pos, count);
    se.close_parent()
}

/// Sequences don't need their length up front: the count leaf is patched once the sequence ends.
struct SeqSerializer<'a> {
    se: &'a mut TreeSerializer,
    count_pos: usize,
    count: usize,
    in_variant: bool,
}

impl<'a> SeqSerializer<'a> {
    fn new(se: &'a mut TreeSerializer, tag: &'static str, in_variant: bool) -> Result<Self> {
        let count_pos = open_counted(se, tag)?;
        Ok(Self {
            se,
            count_pos,
            count: 0,
            in_variant,
        })
    }

    fn element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.count += 1;
        value.serialize(ValueSerializer::new(&mut *self.se, ELEM_TAG))
    }

    fn finish(self) -> Result<()> {
        close_counted(self.se, self.count_pos, self.count)?;
        if self.in_variant {
            self.se.close_parent()?;
        }
        Ok(())
    }
}

impl<'a> SerializeSeq for SeqSerializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.finish()
    }
}

impl<'a> SerializeTuple for SeqSerializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.finish()
    }
}

impl<'a> SerializeTupleStruct for SeqSerializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.finish()
    }
}

impl<'a> SerializeTupleVariant for SeqSerializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.finish()
    }
}

struct MapSerializer<'a> {
    se: &'a mut TreeSerializer,
    count_pos: usize,
    count: usize,
}

impl<'a> MapSerializer<'a> {
    fn new(se: &'a mut TreeSerializer, tag: &'static str) -> Result<Self> {
        let count_pos = open_counted(se, tag)?;
        Ok(Self {
            se,
            count_pos,
            count: 0,
        })
    }
}

impl<'a> SerializeMap for MapSerializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<()> {
        self.count += 1;
        key.serialize(ValueSerializer::new(&mut *self.se, KEY_TAG))
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(ValueSerializer::new(&mut *self.se, VALUE_TAG))
    }

    fn end(self) -> Result<()> {
        close_counted(self.se, self.count_pos, self.count)
    }
}

struct StructSerializer<'a> {
    se: &'a mut TreeSerializer,
    in_variant: bool,
}

impl<'a> StructSerializer<'a> {
    fn new(se: &'a mut TreeSerializer, tag: &'static str, in_variant: bool) -> Result<Self> {
        se.open_parent(tag)?;
        Ok(Self { se, in_variant })
    }

    fn field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()> {
        value.serialize(ValueSerializer::new(&mut *self.se, key))
    }

    fn end_inner(self) -> Result<()> {
        self.se.close_parent()?;
        if self.in_variant {
            self.se.close_parent()?;
        }
        Ok(())
    }
}

impl<'a> SerializeStruct for StructSerializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<()> {
        self.field(key, value)
    }

    fn end(self) -> Result<()> {
        self.end_inner()
    }
}

impl<'a> SerializeStructVariant for StructSerializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<()> {
        self.field(key, value)
    }

    fn end(self) -> Result<()> {
        self.end_inner()
    }
}
