//! Deserialization of any `serde::Deserialize` value from a document.
//!
//! Mirrors the layout written by [`crate::to_bytes`]. Documents don't record value types, so
//! `deserialize_any` isn't supported and a value's type must be known up front. Struct fields
//! missing from the document are simply never offered to the visitor, so fields marked
//! `#[serde(default)]` or of `Option` type can be added without breaking older documents.

use serde::de::*;

use crate::error::{Error, Result};
use crate::leaf::{decode_text, Leaf};
use crate::node::{NodeHeader, NodeKind, HEADER_SIZE};
use crate::object::{ELEM_COUNT_TAG, ELEM_TAG};
use crate::ser::{KEY_TAG, ROOT_TAG, VALUE_TAG, VARIANT_TAG};
use crate::serializer::TreeSerializer;

/// Deserialize a value from a complete document.
pub fn from_bytes<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let mut de = TreeSerializer::new();
    de.begin_loading(data)?;
    let value = T::deserialize(ValueDeserializer::new(&mut de, ROOT_TAG))?;
    de.end_loading()?;
    Ok(value)
}

fn missing(tag: &str) -> Error {
    Error::SerdeFail(format!("missing value for tag \"{}\"", tag))
}

/// Decode a fixed-width leaf, requiring its payload to have exactly the right size.
fn decode_exact<T: Leaf>(tag: &str, payload: &[u8]) -> Result<T> {
    if let Some(size) = T::SIZE {
        if size != payload.len() {
            return Err(Error::SerdeFail(format!(
                "value for tag \"{}\" has {} bytes, expected {}",
                tag,
                payload.len(),
                size
            )));
        }
    }
    T::decode(payload).map_err(|e| Error::SerdeFail(format!("tag \"{}\": {}", tag, e)))
}

/// Deserializes the value stored under a fixed tag in the current scope.
struct ValueDeserializer<'a> {
    de: &'a mut TreeSerializer,
    tag: &'static str,
}

impl<'a> ValueDeserializer<'a> {
    fn new(de: &'a mut TreeSerializer, tag: &'static str) -> Self {
        Self { de, tag }
    }

    fn leaf<T: Leaf>(&mut self) -> Result<T> {
        let tag = self.tag;
        self.de
            .load_payload(tag, |payload| decode_exact(tag, payload))?
            .ok_or_else(|| missing(tag))
    }

    fn text(&mut self) -> Result<String> {
        let tag = self.tag;
        self.de
            .load_payload(tag, |payload| {
                decode_text(payload)
                    .map(|s| s.to_string())
                    .map_err(|e| Error::SerdeFail(format!("tag \"{}\": {}", tag, e)))
            })?
            .ok_or_else(|| missing(tag))
    }

    fn open(&mut self) -> Result<()> {
        if self.de.open_parent(self.tag)? {
            Ok(())
        } else {
            Err(missing(self.tag))
        }
    }

    /// Open a counted container and read its element count.
    fn open_counted(&mut self) -> Result<usize> {
        self.open()?;
        let count: i32 = ValueDeserializer::new(&mut *self.de, ELEM_COUNT_TAG).leaf()?;
        let count = usize::try_from(count)
            .map_err(|_| Error::SerdeFail(format!("negative element count {}", count)))?;
        // Every element takes at least one header
        let room = self.de.scope_len()? / HEADER_SIZE;
        if count > room {
            return Err(Error::BadEncode(format!(
                "element count {} can't fit in {} bytes",
                count,
                self.de.scope_len()?
            )));
        }
        Ok(count)
    }

    fn peek(&mut self) -> Result<Option<NodeHeader>> {
        self.de.peek(self.tag)
    }
}

impl<'de, 'a> Deserializer<'de> for ValueDeserializer<'a> {
    type Error = Error;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value> {
        Err(Error::SerdeFail(
            "documents aren't self-describing, the value type must be known".to_string(),
        ))
    }

    fn deserialize_bool<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_bool(self.leaf()?)
    }

    fn deserialize_i8<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_i8(self.leaf()?)
    }

    fn deserialize_i16<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_i16(self.leaf()?)
    }

    fn deserialize_i32<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_i32(self.leaf()?)
    }

    fn deserialize_i64<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_i64(self.leaf()?)
    }

    fn deserialize_u8<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_u8(self.leaf()?)
    }

    fn deserialize_u16<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_u16(self.leaf()?)
    }

    fn deserialize_u32<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_u32(self.leaf()?)
    }

    fn deserialize_u64<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_u64(self.leaf()?)
    }

    fn deserialize_f32<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_f32(self.leaf()?)
    }

    fn deserialize_f64<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_f64(self.leaf()?)
    }

    fn deserialize_char<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_char(self.leaf()?)
    }

    fn deserialize_str<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        visitor.visit_string(self.text()?)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        let tag = self.tag;
        let bytes = self
            .de
            .load_payload(tag, |payload| Ok(payload.to_vec()))?
            .ok_or_else(|| missing(tag))?;
        visitor.visit_byte_buf(bytes)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_bytes(visitor)
    }

    /// A missing tag or a zero-payload leaf is `None`.
    fn deserialize_option<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        match self.peek()? {
            None => visitor.visit_none(),
            Some(header) if header.kind == NodeKind::Leaf && header.payload_len() == 0 => {
                self.de.take_node(self.tag)?;
                visitor.visit_none()
            }
            Some(_) => visitor.visit_some(self),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.de.take_node(self.tag)? {
            Some((header, _, _)) if header.kind == NodeKind::Leaf => visitor.visit_unit(),
            Some(_) => Err(Error::SerdeFail(format!(
                "expected a unit leaf for tag \"{}\"",
                self.tag
            ))),
            None => Err(missing(self.tag)),
        }
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        let count = self.open_counted()?;
        let value = visitor.visit_seq(SeqAccess::new(&mut *self.de, count))?;
        self.de.close_parent()?;
        Ok(value)
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(mut self, visitor: V) -> Result<V::Value> {
        let count = self.open_counted()?;
        let value = visitor.visit_map(MapAccess::new(&mut *self.de, count))?;
        self.de.close_parent()?;
        Ok(value)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        mut self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        self.open()?;
        let value = visitor.visit_map(StructAccess::new(&mut *self.de, fields))?;
        self.de.close_parent()?;
        Ok(value)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        mut self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        match self.peek()? {
            None => Err(missing(self.tag)),
            Some(header) if header.kind == NodeKind::Leaf => {
                let variant = self.text()?;
                visitor.visit_enum(variant.into_deserializer())
            }
            Some(_) => {
                self.open()?;
                let variant = ValueDeserializer::new(&mut *self.de, VARIANT_TAG).text()?;
                let value = visitor.visit_enum(EnumAccess::new(&mut *self.de, variant))?;
                self.de.close_parent()?;
                Ok(value)
            }
        }
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.de.take_node(self.tag)?;
        visitor.visit_unit()
    }
}

struct SeqAccess<'a> {
    de: &'a mut TreeSerializer,
    remaining: usize,
}

impl<'a> SeqAccess<'a> {
    fn new(de: &'a mut TreeSerializer, count: usize) -> Self {
        Self {
            de,
            remaining: count,
        }
    }
}

impl<'de, 'a> serde::de::SeqAccess<'de> for SeqAccess<'a> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: DeserializeSeed<'de>,
    {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(ValueDeserializer::new(&mut *self.de, ELEM_TAG))
            .map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

struct MapAccess<'a> {
    de: &'a mut TreeSerializer,
    remaining: usize,
}

impl<'a> MapAccess<'a> {
    fn new(de: &'a mut TreeSerializer, count: usize) -> Self {
        Self {
            de,
            remaining: count,
        }
    }
}

impl<'de, 'a> serde::de::MapAccess<'de> for MapAccess<'a> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: DeserializeSeed<'de>,
    {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(ValueDeserializer::new(&mut *self.de, KEY_TAG))
            .map(Some)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: DeserializeSeed<'de>,
    {
        seed.deserialize(ValueDeserializer::new(&mut *self.de, VALUE_TAG))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

/// Offers each declared field that is present in the document, in declaration order.
struct StructAccess<'a> {
    de: &'a mut TreeSerializer,
    fields: &'static [&'static str],
    next: usize,
    current: &'static str,
}

impl<'a> StructAccess<'a> {
    fn new(de: &'a mut TreeSerializer, fields: &'static [&'static str]) -> Self {
        Self {
            de,
            fields,
            next: 0,
            current: "",
        }
    }
}

impl<'de, 'a> serde::de::MapAccess<'de> for StructAccess<'a> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: DeserializeSeed<'de>,
    {
        while let Some(&field) = self.fields.get(self.next) {
            self.next += 1;
            if self.de.peek(field)?.is_some() {
                self.current = field;
                return seed.deserialize(field.into_deserializer()).map(Some);
            }
        }
        Ok(None)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: DeserializeSeed<'de>,
    {
        seed.deserialize(ValueDeserializer::new(&mut *self.de, self.current))
    }
}

struct EnumAccess<'a> {
    de: &'a mut TreeSerializer,
    variant: String,
}

impl<'a> EnumAccess<'a> {
    fn new(de: &'a mut TreeSerializer, variant: String) -> Self {
        Self { de, variant }
    }
}

impl<'de, 'a> serde::de::EnumAccess<'de> for EnumAccess<'a> {
    type Error = Error;
    type Variant = Self;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Self)>
    where
        V: DeserializeSeed<'de>,
    {
        let variant: value::StrDeserializer<Error> = self.variant.as_str().into_deserializer();
        let value = seed.deserialize(variant)?;
        Ok((value, self))
    }
}

impl<'de, 'a> VariantAccess<'de> for EnumAccess<'a> {
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        Ok(())
    }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value>
    where
        T: DeserializeSeed<'de>,
    {
        seed.deserialize(ValueDeserializer::new(self.de, VALUE_TAG))
    }

    fn tuple_variant<V>(self, _len: usize, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        ValueDeserializer::new(self.de, VALUE_TAG).deserialize_seq(visitor)
    }

    fn struct_variant<V>(self, fields: &'static [&'static str], visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        ValueDeserializer::new(self.de, VALUE_TAG).deserialize_struct("", fields, visitor)
    }
}
