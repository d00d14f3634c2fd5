//! Composite values: user objects, polymorphic objects built through a factory, and lists.
//!
//! An object is stored as a parent node holding whatever its [`TreeSerializable::serialize`]
//! writes. An absent object (`None`) is stored as a zero-payload leaf under the same tag, so a
//! load can tell "stored as absent" apart from "never stored".
//!
//! Lists are parent nodes holding an `_ElemCount` leaf followed by one `_Elem` node per element.

use std::collections::BTreeMap;
use std::fmt;

use crate::{
    error::{Error, Result, Warning},
    node::{NodeKind, HEADER_SIZE},
    serializer::{Field, TreeEnum, TreeSerializer},
};

/// Tag of the type discriminant written first inside every polymorphic object.
pub const TYPE_ID_TAG: &str = "_TypeID";
/// Tag of the element count leaf inside a list.
pub const ELEM_COUNT_TAG: &str = "_ElemCount";
/// Tag shared by every element of a list.
pub const ELEM_TAG: &str = "_Elem";

/// A type that describes its own contents to a [`TreeSerializer`].
///
/// The same method is used for saving and loading. When loading, `self` starts out as
/// `Default::default()` and each call to the serializer fills in one field, so fields that
/// aren't present in the document keep the fallback passed for them.
pub trait TreeSerializable {
    fn serialize(&mut self, ser: &mut TreeSerializer) -> Result<()>;
}

/// A [`TreeSerializable`] type whose concrete variant is picked at load time from a stored
/// discriminant.
pub trait Polymorphic: TreeSerializable {
    /// Discriminant identifying the concrete variant of this value.
    fn type_tag(&self) -> i32;
}

/// Builds default instances of a polymorphic type from a stored discriminant.
pub trait Factory<T> {
    /// Create a default instance for `type_tag`, or `None` if this factory can't produce one.
    fn create(&self, type_tag: i32) -> Option<T>;
}

impl<T, F> Factory<T> for F
where
    F: Fn(i32) -> Option<T>,
{
    fn create(&self, type_tag: i32) -> Option<T> {
        self(type_tag)
    }
}

/// A [`Factory`] assembled from per-discriminant constructors.
///
/// ```
/// # use tagtree::Registry;
/// #[derive(Debug, PartialEq)]
/// enum Shape { Circle(f32), Square(f32) }
///
/// let shapes = Registry::new()
///     .register(1, || Shape::Circle(1.0))
///     .register(2, || Shape::Square(1.0));
/// assert_eq!(shapes.build(2), Some(Shape::Square(1.0)));
/// assert_eq!(shapes.build(3), None);
/// ```
pub struct Registry<T> {
    constructors: BTreeMap<i32, fn() -> T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registry")
            .field("type_tags", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Add a constructor. A later registration for the same discriminant replaces the earlier one.
    pub fn register(mut self, type_tag: i32, constructor: fn() -> T) -> Self {
        self.constructors.insert(type_tag, constructor);
        self
    }

    pub fn build(&self, type_tag: i32) -> Option<T> {
        self.constructors.get(&type_tag).map(|f| f())
    }
}

impl<T> Factory<T> for Registry<T> {
    fn create(&self, type_tag: i32) -> Option<T> {
        self.build(type_tag)
    }
}

/// What an object slot becomes when its tag isn't in the document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ObjectFallback {
    /// Leave the slot empty.
    #[default]
    Absent,
    /// Fill the slot with a default-constructed object.
    Default,
}

impl TreeSerializer {
    /// Save or load an optional object. `None` is stored as an explicit null marker.
    ///
    /// Returns `false` only if the tag is missing when loading; the slot is then set according
    /// to `fallback`.
    pub fn serialize_object<T>(
        &mut self,
        name: &str,
        value: &mut Option<T>,
        fallback: ObjectFallback,
    ) -> Result<bool>
    where
        T: TreeSerializable + Default,
    {
        let id = self.tag_id(name).map_err(|e| self.fail_with(e))?;
        if self.is_saving() {
            match value {
                None => self.write_null(id).map_err(|e| self.fail_with(e))?,
                Some(obj) => {
                    self.write_begin_parent(id).map_err(|e| self.fail_with(e))?;
                    obj.serialize(self).map_err(|e| self.fail_with(e))?;
                    self.write_end_parent().map_err(|e| self.fail_with(e))?;
                }
            }
            return Ok(true);
        }

        let found = self.find_node_pos(id).map_err(|e| self.fail_with(e))?;
        let (pos, header) = match found {
            None => {
                *value = match fallback {
                    ObjectFallback::Absent => None,
                    ObjectFallback::Default => Some(T::default()),
                };
                return Ok(false);
            }
            Some(found) => found,
        };
        if header.kind == NodeKind::Leaf {
            *value = None;
            self.skip_found_node(pos, header)
                .map_err(|e| self.fail_with(e))?;
            return Ok(true);
        }

        self.open_found_parent(pos, header)
            .map_err(|e| self.fail_with(e))?;
        let mut obj = T::default();
        obj.serialize(self).map_err(|e| self.fail_with(e))?;
        self.close_parent()?;
        *value = Some(obj);
        Ok(true)
    }

    /// Save or load an optional polymorphic object. The variant's discriminant is stored under
    /// `_TypeID` ahead of its fields, and on load `factory` builds the instance that then reads
    /// them.
    ///
    /// A factory that can't build the stored discriminant, or builds a value reporting a
    /// different one, fails the session. A stored object without a discriminant loads as `None`
    /// and returns `false`.
    pub fn serialize_polymorphic<T, F>(
        &mut self,
        name: &str,
        value: &mut Option<T>,
        factory: &F,
    ) -> Result<bool>
    where
        T: Polymorphic,
        F: Factory<T> + ?Sized,
    {
        let id = self.tag_id(name).map_err(|e| self.fail_with(e))?;
        if self.is_saving() {
            match value {
                None => self.write_null(id).map_err(|e| self.fail_with(e))?,
                Some(obj) => {
                    self.write_begin_parent(id).map_err(|e| self.fail_with(e))?;
                    let mut type_tag = obj.type_tag();
                    self.serialize(TYPE_ID_TAG, &mut type_tag, -1)?;
                    obj.serialize(self).map_err(|e| self.fail_with(e))?;
                    self.write_end_parent().map_err(|e| self.fail_with(e))?;
                }
            }
            return Ok(true);
        }

        let found = self.find_node_pos(id).map_err(|e| self.fail_with(e))?;
        let (pos, header) = match found {
            None => {
                *value = None;
                return Ok(false);
            }
            Some(found) => found,
        };
        if header.kind == NodeKind::Leaf {
            *value = None;
            self.skip_found_node(pos, header)
                .map_err(|e| self.fail_with(e))?;
            return Ok(true);
        }

        self.open_found_parent(pos, header)
            .map_err(|e| self.fail_with(e))?;
        let mut type_tag = -1;
        if !self.serialize(TYPE_ID_TAG, &mut type_tag, -1)? {
            self.record_warning(Warning::InvalidValue {
                tag: name.to_string(),
                reason: format!("object has no {} leaf", TYPE_ID_TAG),
            });
            self.close_parent()?;
            *value = None;
            return Ok(false);
        }

        let mut obj = match factory.create(type_tag) {
            Some(obj) => obj,
            None => {
                return Err(self.fail_with(Error::Construction {
                    type_id: type_tag,
                    reason: format!(
                        "factory has no {} variant for this type id",
                        std::any::type_name::<T>()
                    ),
                }))
            }
        };
        if obj.type_tag() != type_tag {
            return Err(self.fail_with(Error::Construction {
                type_id: type_tag,
                reason: format!("factory built a value with type id {}", obj.type_tag()),
            }));
        }
        obj.serialize(self).map_err(|e| self.fail_with(e))?;
        self.close_parent()?;
        *value = Some(obj);
        Ok(true)
    }

    /// Shared list layout. `element` saves or loads one element under [`ELEM_TAG`].
    fn serialize_list_with<T>(
        &mut self,
        name: &str,
        value: &mut Vec<T>,
        new_element: impl Fn() -> T,
        mut element: impl FnMut(&mut Self, &mut T) -> Result<bool>,
    ) -> Result<bool> {
        if self.is_saving() {
            let mut count = i32::try_from(value.len()).map_err(|_| {
                self.fail_with(Error::LengthTooLong {
                    max: i32::MAX as usize,
                    actual: value.len(),
                })
            })?;
            self.open_parent(name)?;
            self.serialize(ELEM_COUNT_TAG, &mut count, 0)?;
            for elem in value.iter_mut() {
                element(self, elem)?;
            }
            self.close_parent()?;
            return Ok(true);
        }

        value.clear();
        if !self.open_parent(name)? {
            return Ok(false);
        }
        let mut count = 0i32;
        self.serialize(ELEM_COUNT_TAG, &mut count, 0)?;
        // Every element needs at least a node header
        let room = self.scope_len().map_err(|e| self.fail_with(e))? / HEADER_SIZE;
        let count = match usize::try_from(count) {
            Ok(count) if count <= room => count,
            _ => {
                return Err(self.fail_with(Error::BadEncode(format!(
                    "List \"{}\" claims {} elements",
                    name, count
                ))))
            }
        };
        value.reserve(count);
        for _ in 0..count {
            let mut elem = new_element();
            element(self, &mut elem)?;
            value.push(elem);
        }
        self.close_parent()?;
        Ok(true)
    }

    /// Save or load a list of plain values. Elements missing on load are replaced with
    /// `T::default()`.
    pub fn serialize_list<T>(&mut self, name: &str, value: &mut Vec<T>) -> Result<bool>
    where
        T: Field + Default,
    {
        self.serialize_list_with(name, value, T::default, |ser, elem| {
            ser.serialize(ELEM_TAG, elem, T::default())
        })
    }

    /// Save or load a list of enumeration values. Missing or unknown elements become `fallback`.
    pub fn serialize_enum_list<E>(
        &mut self,
        name: &str,
        value: &mut Vec<E>,
        fallback: E,
    ) -> Result<bool>
    where
        E: TreeEnum,
    {
        self.serialize_list_with(
            name,
            value,
            || fallback,
            |ser, elem| ser.serialize_enum(ELEM_TAG, elem, fallback),
        )
    }

    /// Save or load a list of optional objects. `fallback` applies to each missing element.
    pub fn serialize_object_list<T>(
        &mut self,
        name: &str,
        value: &mut Vec<Option<T>>,
        fallback: ObjectFallback,
    ) -> Result<bool>
    where
        T: TreeSerializable + Default,
    {
        self.serialize_list_with(
            name,
            value,
            || None,
            |ser, elem| ser.serialize_object(ELEM_TAG, elem, fallback),
        )
    }

    /// Save or load a list of optional polymorphic objects, each carrying its own discriminant.
    pub fn serialize_polymorphic_list<T, F>(
        &mut self,
        name: &str,
        value: &mut Vec<Option<T>>,
        factory: &F,
    ) -> Result<bool>
    where
        T: Polymorphic,
        F: Factory<T> + ?Sized,
    {
        self.serialize_list_with(
            name,
            value,
            || None,
            |ser, elem| ser.serialize_polymorphic(ELEM_TAG, elem, factory),
        )
    }
}
