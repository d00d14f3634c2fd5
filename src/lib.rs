//! tagtree is a compact binary format for tree-shaped data where every value is stored under a
//! name. Names are mapped to small integer ids through a dictionary stored at the end of each
//! document, so readers can find fields by name regardless of their position.
//!
//! This makes stored data tolerant of program changes:
//!
//! - Fields can be added. Loading an older document leaves the new field at its fallback.
//! - Fields can be removed. Loading a newer document skips nodes nobody asks for.
//! - Fields can be reordered. Lookups scan the enclosing node, starting where the previous read
//! 	stopped, and wrap around to its beginning.
//! - Objects can be polymorphic. A type id is stored with the object and a factory builds the
//! 	matching concrete type when loading.
//!
//! Values are written and read through the same code path: a [`TreeSerializer`] is either saving
//! or loading, and `serialize` calls either store the value or overwrite it with what the
//! document holds. Anything implementing `serde::Serialize`/`Deserialize` can also be stored with
//! [`to_bytes`] and [`from_bytes`].
//!
//! Problems a newer program version should be able to live with (missing fields, changed field
//! sizes, a different file version) are reported as [`Warning`]s and logged through the `log`
//! crate. Structural corruption is an [`Error`] and ends the session.
//!
//! See the [`format`] module for the exact byte layout.

mod dictionary;
mod error;
mod leaf;
mod node;
mod object;
mod scope;
mod serializer;
mod walk;

pub mod de;
pub mod dump;
pub mod format;
pub mod ser;
pub mod verify;

pub use dictionary::{NameDictionary, FILE_VERSION_TAG};
pub use error::{Error, Result, Warning};
pub use leaf::Leaf;
pub use node::{NodeHeader, NodeId, NodeKind, ReservedId, BEGIN_RESERVED, HEADER_SIZE};
pub use object::{
    Factory, ObjectFallback, Polymorphic, Registry, TreeSerializable, ELEM_COUNT_TAG, ELEM_TAG,
    TYPE_ID_TAG,
};
pub use serializer::{Field, LoadMode, State, TreeEnum, TreeSerializer};
pub use walk::{NodeWalker, WalkedNode};

pub use de::from_bytes;
pub use dump::to_debug_string;
pub use ser::to_bytes;
pub use verify::{check_structure, compare_debug_strings, verify_round_trip, Mismatch, RoundTrip};

/// The file version written into every document's `Meta` section. Loading a document with a
/// different version only produces a warning.
pub const FILE_VERSION: i32 = 0;

/// The maximum nesting depth of parent nodes, counting the implicit root scope.
pub const MAX_DEPTH: usize = 100;

/// The maximum size of a document. Node sizes are stored as 32-bit signed integers, so nothing
/// larger can be represented.
pub const MAX_DOC_SIZE: usize = i32::MAX as usize;
