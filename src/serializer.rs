//! The save/load cursor over a document buffer.
//!
//! A [`TreeSerializer`] runs one session at a time. While saving, every node is appended to the
//! end of the buffer and parent sizes are patched in once the parent closes. While loading, each
//! request looks up a child of the current scope by id, starting from where the previous lookup
//! left off and wrapping around to the first child.
//!
//! The same calls drive both directions, so a type's serialization code is written once:
//!
//! ```
//! use tagtree::{TreeSerializer, Result};
//!
//! fn shape(ser: &mut TreeSerializer, height: &mut i32, width: &mut f32) -> Result<bool> {
//!     let mut found = ser.serialize("Height", height, 1)?;
//!     found &= ser.serialize("Width", width, 1.0)?;
//!     Ok(found)
//! }
//!
//! let mut ser = TreeSerializer::new();
//! ser.begin_saving().unwrap();
//! shape(&mut ser, &mut 6, &mut 2.3).unwrap();
//! let bytes = ser.end_saving().unwrap();
//!
//! let (mut height, mut width) = (0, 0.0);
//! ser.begin_loading(&bytes).unwrap();
//! assert!(shape(&mut ser, &mut height, &mut width).unwrap());
//! ser.end_loading().unwrap();
//! assert_eq!((height, width), (6, 2.3));
//! ```

use std::mem;

use byteorder::{ByteOrder, LittleEndian};
use glam::{Vec2, Vec3};

use crate::{
    dictionary::{NameDictionary, FILE_VERSION_TAG},
    error::{Error, Result, Warning},
    leaf::Leaf,
    node::{patch_size, NodeHeader, NodeId, NodeKind, ReservedId, HEADER_SIZE},
    scope::{Scope, ScopeStack},
    FILE_VERSION, MAX_DOC_SIZE,
};

/// Session state of a [`TreeSerializer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Saving,
    Loading,
    /// A fatal error ended the session. Only `begin_saving`/`begin_loading` are accepted.
    Failed,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Saving => "saving",
            State::Loading => "loading",
            State::Failed => "failed",
        }
    }
}

/// How [`TreeSerializer::begin_loading_with`] treats the predefined document structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Open the root and meta sections, read the dictionary, then open the data section.
    #[default]
    Normal,
    /// Leave the buffer untouched and expose the raw node stream at offset 0. Meant for
    /// debugging tools only.
    Raw,
}

/// Outcome of looking up a leaf while loading.
enum LeafSlot {
    /// Found with an acceptable size: payload lies at `[start, end)`.
    Ready { start: usize, end: usize },
    /// Not present in the current scope.
    Missing,
    /// Present, but its size didn't match and it was skipped.
    Skipped,
}

/// Values that can be stored under a single tag with a fallback: every [`Leaf`] type plus
/// vectors, which are split into one leaf per axis.
pub trait Field: Sized {
    fn serialize_field(
        &mut self,
        ser: &mut TreeSerializer,
        name: &str,
        fallback: Self,
    ) -> Result<bool>;
}

impl<T: Leaf> Field for T {
    fn serialize_field(
        &mut self,
        ser: &mut TreeSerializer,
        name: &str,
        fallback: Self,
    ) -> Result<bool> {
        ser.serialize_leaf(name, self, fallback)
    }
}

impl Field for Vec2 {
    fn serialize_field(
        &mut self,
        ser: &mut TreeSerializer,
        name: &str,
        fallback: Self,
    ) -> Result<bool> {
        let mut found = ser.serialize(&format!("{}_x", name), &mut self.x, fallback.x)?;
        found &= ser.serialize(&format!("{}_y", name), &mut self.y, fallback.y)?;
        Ok(found)
    }
}

impl Field for Vec3 {
    fn serialize_field(
        &mut self,
        ser: &mut TreeSerializer,
        name: &str,
        fallback: Self,
    ) -> Result<bool> {
        let mut found = ser.serialize(&format!("{}_x", name), &mut self.x, fallback.x)?;
        found &= ser.serialize(&format!("{}_y", name), &mut self.y, fallback.y)?;
        found &= ser.serialize(&format!("{}_z", name), &mut self.z, fallback.z)?;
        Ok(found)
    }
}

/// Enumerations stored through their 32-bit discriminant.
pub trait TreeEnum: Copy {
    fn to_i32(self) -> i32;
    /// Convert a stored discriminant back. `None` means the value isn't a known variant.
    fn from_i32(v: i32) -> Option<Self>;
}

/// Save/load cursor over an in-memory document.
#[derive(Debug)]
pub struct TreeSerializer {
    state: State,
    mode: LoadMode,
    buf: Vec<u8>,
    scopes: ScopeStack,
    names: NameDictionary,
    version: i32,
    warnings: Vec<Warning>,
}

impl Default for TreeSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeSerializer {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            mode: LoadMode::Normal,
            buf: Vec::new(),
            scopes: ScopeStack::new(),
            names: NameDictionary::new(),
            version: -1,
            warnings: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_saving(&self) -> bool {
        self.state == State::Saving
    }

    pub fn is_loading(&self) -> bool {
        self.state == State::Loading
    }

    /// File version of the document being loaded, or the current version while saving.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Recoverable problems recorded since the session began.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Tag dictionary of the current or most recent session.
    pub fn dictionary(&self) -> &NameDictionary {
        &self.names
    }

    /// Number of open scopes, the implicit root included.
    pub fn depth(&self) -> usize {
        self.scopes.depth()
    }

    ///////////////////////////////////////////////////////////////////////////
    // Session lifecycle
    ///////////////////////////////////////////////////////////////////////////

    /// Start a save session. Writes the document root, the meta section with the file version,
    /// and opens the data section for the caller.
    pub fn begin_saving(&mut self) -> Result<()> {
        self.begin(State::Saving)?;
        self.version = FILE_VERSION;
        self.buf = Vec::new();
        self.scopes.push(Scope::root(None))?;
        log::trace!("begin saving");

        let result = (|| {
            self.write_begin_parent(ReservedId::DocumentRoot.id())?;
            self.write_begin_parent(ReservedId::MetaSection.id())?;
            self.serialize_meta()?;
            self.write_end_parent()?;
            self.write_begin_parent(ReservedId::DataSection.id())
        })();
        result.map_err(|e| self.fail(e))
    }

    /// Finish a save session: close the data section, write the dictionary, close the root, and
    /// return the finished document.
    pub fn end_saving(&mut self) -> Result<Vec<u8>> {
        self.expect_state(State::Saving).map_err(|e| self.fail(e))?;
        let result = (|| {
            // Implicit root, document root, data section
            if self.scopes.depth() != 3 {
                return Err(Error::ScopeImbalance {
                    depth: self.scopes.depth(),
                });
            }
            self.write_end_parent()?;
            self.write_begin_parent(ReservedId::Dictionary.id())?;
            self.write_dictionary()?;
            self.write_end_parent()?;
            self.write_end_parent()?;
            if self.buf.len() > MAX_DOC_SIZE {
                return Err(Error::LengthTooLong {
                    max: MAX_DOC_SIZE,
                    actual: self.buf.len(),
                });
            }
            Ok(())
        })();
        result.map_err(|e| self.fail(e))?;

        self.state = State::Idle;
        self.scopes.clear();
        let mut doc = mem::take(&mut self.buf);
        doc.shrink_to_fit();
        log::debug!(
            "saved document: {} bytes, {} tags",
            doc.len(),
            self.names.len()
        );
        Ok(doc)
    }

    /// Start a load session over a complete document.
    pub fn begin_loading(&mut self, data: &[u8]) -> Result<()> {
        self.begin_loading_with(data, LoadMode::Normal)
    }

    /// Start a load session. See [`LoadMode`] for how the predefined sections are handled.
    pub fn begin_loading_with(&mut self, data: &[u8], mode: LoadMode) -> Result<()> {
        self.begin(State::Loading)?;
        if data.len() > MAX_DOC_SIZE {
            return Err(self.fail(Error::LengthTooLong {
                max: MAX_DOC_SIZE,
                actual: data.len(),
            }));
        }
        self.mode = mode;
        self.version = -1;
        self.buf = data.to_vec();
        self.scopes.push(Scope::root(Some(data.len())))?;
        log::trace!("begin loading {} bytes ({:?})", data.len(), mode);
        if mode == LoadMode::Raw {
            return Ok(());
        }

        let result = (|| {
            self.require_parent(ReservedId::DocumentRoot)?;
            self.require_parent(ReservedId::MetaSection)?;
            self.serialize_meta()?;
            self.read_end_parent()?;
            self.require_parent(ReservedId::Dictionary)?;
            self.read_dictionary()?;
            self.read_end_parent()?;
            self.require_parent(ReservedId::DataSection)
        })();
        result.map_err(|e| self.fail(e))
    }

    /// Finish a load session. Fails if the caller left any parent node open.
    pub fn end_loading(&mut self) -> Result<()> {
        self.expect_state(State::Loading).map_err(|e| self.fail(e))?;
        let result = (|| {
            if self.mode == LoadMode::Normal {
                // Implicit root, document root, data section
                if self.scopes.depth() != 3 {
                    return Err(Error::ScopeImbalance {
                        depth: self.scopes.depth(),
                    });
                }
                self.read_end_parent()?;
                self.read_end_parent()?;
            }
            if self.scopes.depth() != 1 {
                return Err(Error::ScopeImbalance {
                    depth: self.scopes.depth(),
                });
            }
            Ok(())
        })();
        result.map_err(|e| self.fail(e))?;

        self.state = State::Idle;
        self.scopes.clear();
        self.buf = Vec::new();
        Ok(())
    }

    fn begin(&mut self, next: State) -> Result<()> {
        if self.state == State::Saving || self.state == State::Loading {
            return Err(Error::InvalidState {
                expected: State::Idle.name(),
                actual: self.state.name(),
            });
        }
        self.state = next;
        self.mode = LoadMode::Normal;
        self.scopes.clear();
        self.names = NameDictionary::new();
        self.warnings.clear();
        Ok(())
    }

    fn serialize_meta(&mut self) -> Result<()> {
        let mut version = self.version;
        let warned = self.warnings.len();
        let found = self.serialize_leaf(FILE_VERSION_TAG, &mut version, -1)?;
        self.version = version;
        if !found {
            // A leaf of the wrong size already has its own warning
            if self.warnings.len() == warned {
                self.warn(Warning::MissingVersion);
            }
        } else if version != FILE_VERSION {
            self.warn(Warning::VersionMismatch {
                found: version,
                current: FILE_VERSION,
            });
        }
        Ok(())
    }

    fn write_dictionary(&mut self) -> Result<()> {
        let entries: Vec<(String, NodeId)> = self
            .names
            .stored_entries()
            .map(|(name, id)| (name.to_string(), id))
            .collect();
        for (name, id) in entries {
            self.write_leaf(ReservedId::DictionaryKey.id(), &name)?;
            self.write_leaf(ReservedId::DictionaryValue.id(), &id)?;
        }
        Ok(())
    }

    fn read_dictionary(&mut self) -> Result<()> {
        let scope = *self.scopes.top()?;
        let end = scope.end.unwrap_or(scope.start);
        let mut pos = scope.start;
        while pos < end {
            let (key_start, key_end) = self.read_dictionary_leaf(pos, ReservedId::DictionaryKey)?;
            let key = String::decode(&self.buf[key_start..key_end])
                .map_err(|e| Error::BadEncode(format!("Dictionary key at {}: {}", pos, e)))?;
            pos = key_end;

            let value = self.read_dictionary_leaf(pos, ReservedId::DictionaryValue)?;
            if value.1 - value.0 != 2 {
                return Err(Error::BadEncode(format!(
                    "Dictionary value at {} has {} bytes",
                    pos,
                    value.1 - value.0
                )));
            }
            let id = i16::decode(&self.buf[value.0..value.1]).map_err(Error::BadEncode)?;
            pos = value.1;
            self.names.insert(key, id)?;
        }
        Ok(())
    }

    fn read_dictionary_leaf(&self, pos: usize, expected: ReservedId) -> Result<(usize, usize)> {
        let header = self.read_header_in_scope(pos)?;
        if header.id != expected.id() || header.kind != NodeKind::Leaf {
            return Err(Error::BadEncode(format!(
                "Expected dictionary {} leaf at {}, found node {}",
                expected.name(),
                pos,
                header.id
            )));
        }
        Ok((pos + HEADER_SIZE, pos + header.size as usize))
    }

    ///////////////////////////////////////////////////////////////////////////
    // State handling
    ///////////////////////////////////////////////////////////////////////////

    /// Mark the session as failed and hand the error back.
    fn fail(&mut self, err: Error) -> Error {
        if self.state != State::Failed {
            log::debug!("serializer session failed: {}", err);
        }
        self.state = State::Failed;
        err
    }

    fn warn(&mut self, warning: Warning) {
        log::warn!("{}", warning);
        self.warnings.push(warning);
    }

    fn expect_state(&self, expected: State) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    fn expect_active(&self) -> Result<()> {
        match self.state {
            State::Saving | State::Loading => Ok(()),
            _ => Err(Error::InvalidState {
                expected: "saving or loading",
                actual: self.state.name(),
            }),
        }
    }

    /// Map a tag name to its id. Saving assigns new ids, loading returns
    /// [`ReservedId::Invalid`] for names the document doesn't know.
    fn resolve_tag(&mut self, name: &str) -> Result<NodeId> {
        match self.state {
            State::Saving => self.names.get_or_assign(name),
            _ => Ok(self.names.get(name).unwrap_or(ReservedId::Invalid.id())),
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Writing
    ///////////////////////////////////////////////////////////////////////////

    fn node_size(len: usize) -> Result<i32> {
        let size = HEADER_SIZE + len;
        i32::try_from(size).map_err(|_| Error::LengthTooLong {
            max: i32::MAX as usize,
            actual: size,
        })
    }

    pub(crate) fn write_begin_parent(&mut self, id: NodeId) -> Result<()> {
        let header_pos = self.buf.len();
        self.scopes.top_mut()?.current = header_pos;
        NodeHeader::new(id, -1, NodeKind::Parent).encode_vec(&mut self.buf);
        let start = self.buf.len();
        self.scopes.push(Scope {
            start,
            end: None,
            current: start,
            header: Some(header_pos),
        })
    }

    /// Pop the open scope and patch its header with the now-known size.
    pub(crate) fn write_end_parent(&mut self) -> Result<()> {
        let scope = self.scopes.pop()?;
        let header_pos = scope.header.ok_or(Error::ScopeImbalance { depth: 1 })?;
        let end = self.buf.len();
        let size = Self::node_size(end - header_pos - HEADER_SIZE)?;
        patch_size(&mut self.buf, header_pos, size);
        self.scopes.top_mut()?.current = end;
        Ok(())
    }

    /// Append a leaf whose payload is produced by `encode`. Returns the payload position.
    pub(crate) fn write_leaf_with(
        &mut self,
        id: NodeId,
        len: usize,
        encode: impl FnOnce(&mut Vec<u8>),
    ) -> Result<usize> {
        let size = Self::node_size(len)?;
        self.scopes.top_mut()?.current = self.buf.len();
        NodeHeader::new(id, size, NodeKind::Leaf).encode_vec(&mut self.buf);
        let payload = self.buf.len();
        encode(&mut self.buf);
        debug_assert_eq!(self.buf.len() - payload, len);
        self.scopes.top_mut()?.current = self.buf.len();
        Ok(payload)
    }

    fn write_leaf<T: Leaf>(&mut self, id: NodeId, value: &T) -> Result<usize> {
        self.write_leaf_with(id, value.payload_len(), |buf| value.encode(buf))
    }

    /// Write a leaf by tag name while saving. Returns the payload position.
    pub(crate) fn save_leaf_with(
        &mut self,
        name: &str,
        len: usize,
        encode: impl FnOnce(&mut Vec<u8>),
    ) -> Result<usize> {
        self.expect_state(State::Saving)?;
        let id = self.resolve_tag(name)?;
        self.write_leaf_with(id, len, encode)
    }

    /// Overwrite a 32-bit value already written at `pos`.
    pub(crate) fn patch_i32(&mut self, pos: usize, value: i32) {
        LittleEndian::write_i32(&mut self.buf[pos..pos + 4], value);
    }

    ///////////////////////////////////////////////////////////////////////////
    // Reading
    ///////////////////////////////////////////////////////////////////////////

    /// Decode the header at `pos`, checking that the whole node lies inside the current scope.
    fn read_header_in_scope(&self, pos: usize) -> Result<NodeHeader> {
        let scope = self.scopes.top()?;
        scope.check("read node header", pos, false)?;
        let header = NodeHeader::decode(&self.buf, pos)?;
        let node_end = pos + header.size as usize;
        scope.check("read node body", node_end, true)?;
        if node_end > self.buf.len() {
            return Err(Error::OutOfScope {
                step: "read node body",
                pos: node_end,
                start: 0,
                end: self.buf.len(),
            });
        }
        Ok(header)
    }

    /// Wrap a scan position that reached the end of the scope back to its start.
    fn wrap_to_start(scope: &Scope, pos: usize) -> Result<usize> {
        let end = scope.end.unwrap_or(scope.start);
        if pos < end {
            return Ok(pos);
        }
        if pos == end && scope.start != end {
            return Ok(scope.start);
        }
        Err(Error::OutOfScope {
            step: "wrap scan to scope start",
            pos,
            start: scope.start,
            end,
        })
    }

    /// Find the child of the current scope with the given id. The scan starts at the scope's
    /// cursor and wraps around to its first child, so lookups made in write order only step over
    /// one node each. Returns the header position and header, or `None` after visiting every
    /// child once.
    pub(crate) fn find_node_pos(&self, id: NodeId) -> Result<Option<(usize, NodeHeader)>> {
        let scope = *self.scopes.top()?;
        if scope.end.is_none() {
            return Err(Error::InvalidState {
                expected: State::Loading.name(),
                actual: self.state.name(),
            });
        }
        if scope.is_empty() || id == ReservedId::Invalid.id() {
            return Ok(None);
        }

        let first = Self::wrap_to_start(&scope, scope.current)?;
        let mut pos = first;
        let mut wrapped = false;
        loop {
            let header = self.read_header_in_scope(pos)?;
            if header.id == id {
                return Ok(Some((pos, header)));
            }
            let next = pos + header.size as usize;
            pos = Self::wrap_to_start(&scope, next)?;
            if pos != next {
                wrapped = true;
            }
            if pos == first || (wrapped && pos > first) {
                return Ok(None);
            }
        }
    }

    /// Open the parent at `pos` and make it the current scope.
    fn read_begin_parent_at(&mut self, pos: usize, header: NodeHeader) -> Result<()> {
        let end = pos + header.size as usize;
        self.scopes.top_mut()?.current = pos;
        let start = pos + HEADER_SIZE;
        self.scopes.push(Scope {
            start,
            end: Some(end),
            current: start,
            header: Some(pos),
        })
    }

    fn read_begin_parent(&mut self, id: NodeId) -> Result<bool> {
        match self.find_node_pos(id)? {
            None => Ok(false),
            Some((pos, header)) => {
                if header.kind != NodeKind::Parent {
                    return Err(Error::KindMismatch {
                        id,
                        expected: NodeKind::Parent,
                        actual: header.kind,
                    });
                }
                self.read_begin_parent_at(pos, header)?;
                Ok(true)
            }
        }
    }

    fn require_parent(&mut self, id: ReservedId) -> Result<()> {
        if self.read_begin_parent(id.id())? {
            Ok(())
        } else {
            Err(Error::BadEncode(format!(
                "Document has no {} section",
                id.name()
            )))
        }
    }

    /// Pop the current scope and move the parent's cursor past the closed node.
    fn read_end_parent(&mut self) -> Result<()> {
        let scope = self.scopes.pop()?;
        let end = scope.end.ok_or(Error::ScopeImbalance {
            depth: self.scopes.depth(),
        })?;
        self.move_cursor(end)
    }

    /// Set the current scope's cursor, which must stay within `[start, end]`.
    fn move_cursor(&mut self, pos: usize) -> Result<()> {
        let scope = self.scopes.top_mut()?;
        scope.check("move cursor", pos, true)?;
        scope.current = pos;
        Ok(())
    }

    /// Look up a leaf while loading. Size mismatches on fixed-width types are recorded, skipped
    /// over, and reported as [`LeafSlot::Skipped`].
    fn prepare_leaf(&mut self, name: &str, expected: Option<usize>) -> Result<LeafSlot> {
        let id = self.resolve_tag(name)?;
        let (pos, header) = match self.find_node_pos(id)? {
            None => return Ok(LeafSlot::Missing),
            Some(found) => found,
        };
        if header.kind != NodeKind::Leaf {
            return Err(Error::KindMismatch {
                id,
                expected: NodeKind::Leaf,
                actual: header.kind,
            });
        }
        let end = pos + header.size as usize;
        if let Some(expected) = expected {
            if expected != header.payload_len() {
                self.warn(Warning::SizeMismatch {
                    tag: name.to_string(),
                    expected,
                    actual: header.payload_len(),
                });
                self.move_cursor(end)?;
                return Ok(LeafSlot::Skipped);
            }
        }
        Ok(LeafSlot::Ready {
            start: pos + HEADER_SIZE,
            end,
        })
    }

    fn serialize_leaf<T: Leaf>(&mut self, name: &str, value: &mut T, fallback: T) -> Result<bool> {
        self.expect_active()?;
        if self.state == State::Saving {
            let id = self.resolve_tag(name)?;
            self.write_leaf(id, value)?;
            return Ok(true);
        }

        let (start, end) = match self.prepare_leaf(name, T::SIZE)? {
            LeafSlot::Ready { start, end } => (start, end),
            LeafSlot::Missing | LeafSlot::Skipped => {
                *value = fallback;
                return Ok(false);
            }
        };
        let decoded = T::decode(&self.buf[start..end]);
        self.move_cursor(end)?;
        match decoded {
            Ok(v) => {
                *value = v;
                Ok(true)
            }
            Err(reason) => {
                self.warn(Warning::InvalidValue {
                    tag: name.to_string(),
                    reason,
                });
                *value = fallback;
                Ok(false)
            }
        }
    }

    /// Look up a node by tag while loading without moving the cursor.
    pub(crate) fn peek(&mut self, name: &str) -> Result<Option<NodeHeader>> {
        self.expect_state(State::Loading)?;
        let id = self.resolve_tag(name)?;
        Ok(self.find_node_pos(id)?.map(|(_, header)| header))
    }

    /// Look up a node by tag while loading and move the cursor past it. Returns its header and
    /// payload range, or `None` if it isn't present.
    pub(crate) fn take_node(&mut self, name: &str) -> Result<Option<(NodeHeader, usize, usize)>> {
        self.expect_state(State::Loading)?;
        let id = self.resolve_tag(name)?;
        match self.find_node_pos(id)? {
            None => Ok(None),
            Some((pos, header)) => {
                let end = pos + header.size as usize;
                self.move_cursor(end)?;
                Ok(Some((header, pos + HEADER_SIZE, end)))
            }
        }
    }

    /// Run `f` over the payload of the leaf stored under `name`, moving the cursor past it.
    pub(crate) fn load_payload<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&[u8]) -> Result<R>,
    ) -> Result<Option<R>> {
        match self.take_node(name)? {
            None => Ok(None),
            Some((header, start, end)) => {
                if header.kind != NodeKind::Leaf {
                    return Err(Error::KindMismatch {
                        id: header.id,
                        expected: NodeKind::Leaf,
                        actual: header.kind,
                    });
                }
                f(&self.buf[start..end]).map(Some)
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Public serialization interface
    ///////////////////////////////////////////////////////////////////////////

    /// Open a parent node. While saving this always succeeds; while loading it returns `false`
    /// if no node with this tag exists in the current scope. Every successful open must be
    /// matched by a [`close_parent`][Self::close_parent].
    pub fn open_parent(&mut self, name: &str) -> Result<bool> {
        let result = (|| {
            self.expect_active()?;
            let id = self.resolve_tag(name)?;
            if self.state == State::Saving {
                self.write_begin_parent(id)?;
                Ok(true)
            } else {
                self.read_begin_parent(id)
            }
        })();
        result.map_err(|e| self.fail(e))
    }

    /// Close the parent node most recently opened. Outside of [`LoadMode::Raw`] the data section
    /// and document root can't be closed this way.
    pub fn close_parent(&mut self) -> Result<()> {
        let result = (|| {
            self.expect_active()?;
            // Implicit root, document root, data section
            if self.mode == LoadMode::Normal && self.scopes.depth() <= 3 {
                return Err(Error::ScopeImbalance {
                    depth: self.scopes.depth(),
                });
            }
            if self.state == State::Saving {
                self.write_end_parent()
            } else {
                self.read_end_parent()
            }
        })();
        result.map_err(|e| self.fail(e))
    }

    /// Save or load a value under `name`. When loading, a missing tag, a payload of the wrong
    /// size, or an unrepresentable value leaves `fallback` in `value` and returns `false`.
    pub fn serialize<T: Field>(&mut self, name: &str, value: &mut T, fallback: T) -> Result<bool> {
        value
            .serialize_field(self, name, fallback)
            .map_err(|e| self.fail(e))
    }

    /// Save or load an enumeration through its 32-bit discriminant.
    pub fn serialize_enum<E: TreeEnum>(
        &mut self,
        name: &str,
        value: &mut E,
        fallback: E,
    ) -> Result<bool> {
        let mut raw = value.to_i32();
        let found = self.serialize(name, &mut raw, fallback.to_i32())?;
        if self.state == State::Loading {
            match E::from_i32(raw) {
                Some(v) => *value = v,
                None => {
                    self.warn(Warning::InvalidValue {
                        tag: name.to_string(),
                        reason: format!("{} is not a known variant", raw),
                    });
                    *value = fallback;
                    return Ok(false);
                }
            }
        }
        Ok(found)
    }

    /// Write a zero-payload leaf, the encoding of an absent object.
    pub(crate) fn write_null(&mut self, id: NodeId) -> Result<()> {
        self.write_leaf_with(id, 0, |_| ()).map(|_| ())
    }

    pub(crate) fn open_found_parent(&mut self, pos: usize, header: NodeHeader) -> Result<()> {
        self.read_begin_parent_at(pos, header)
    }

    pub(crate) fn skip_found_node(&mut self, pos: usize, header: NodeHeader) -> Result<()> {
        self.move_cursor(pos + header.size as usize)
    }

    pub(crate) fn tag_id(&mut self, name: &str) -> Result<NodeId> {
        self.expect_active()?;
        self.resolve_tag(name)
    }

    pub(crate) fn fail_with(&mut self, err: Error) -> Error {
        self.fail(err)
    }

    /// Length of the current scope while loading.
    pub(crate) fn scope_len(&self) -> Result<usize> {
        let scope = self.scopes.top()?;
        Ok(scope
            .end
            .map_or(usize::MAX, |end| end.saturating_sub(scope.start)))
    }

    pub(crate) fn record_warning(&mut self, warning: Warning) {
        self.warn(warning)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::ReservedId;

    fn save(f: impl FnOnce(&mut TreeSerializer)) -> Vec<u8> {
        let mut ser = TreeSerializer::new();
        ser.begin_saving().unwrap();
        f(&mut ser);
        ser.end_saving().unwrap()
    }

    fn load(bytes: &[u8], f: impl FnOnce(&mut TreeSerializer)) -> TreeSerializer {
        let mut ser = TreeSerializer::new();
        ser.begin_loading(bytes).unwrap();
        f(&mut ser);
        ser.end_loading().unwrap();
        ser
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Mood {
        Calm,
        Angry,
    }

    impl TreeEnum for Mood {
        fn to_i32(self) -> i32 {
            self as i32
        }

        fn from_i32(v: i32) -> Option<Self> {
            match v {
                0 => Some(Mood::Calm),
                1 => Some(Mood::Angry),
                _ => None,
            }
        }
    }

    mod session {
        use super::*;

        #[test]
        fn empty_document_layout() {
            let bytes = save(|_| ());
            // Root{ Meta{ FileVersion }, Data{}, Dictionary{} }
            let root = NodeHeader::decode(&bytes, 0).unwrap();
            assert_eq!(root.id, ReservedId::DocumentRoot.id());
            assert_eq!(root.size as usize, bytes.len());
            let meta = NodeHeader::decode(&bytes, HEADER_SIZE).unwrap();
            assert_eq!(meta.id, ReservedId::MetaSection.id());
            assert_eq!(meta.size as usize, 2 * HEADER_SIZE + 4);
            let version = NodeHeader::decode(&bytes, 2 * HEADER_SIZE).unwrap();
            assert_eq!(version.id, ReservedId::FileVersion.id());
            assert_eq!(version.kind, NodeKind::Leaf);
            let data_pos = HEADER_SIZE + meta.size as usize;
            let data = NodeHeader::decode(&bytes, data_pos).unwrap();
            assert_eq!(data.id, ReservedId::DataSection.id());
            assert_eq!(data.size as usize, HEADER_SIZE);
            let dict = NodeHeader::decode(&bytes, data_pos + HEADER_SIZE).unwrap();
            assert_eq!(dict.id, ReservedId::Dictionary.id());
            assert_eq!(bytes.len(), 5 * HEADER_SIZE + 4);
        }

        #[test]
        fn no_nested_sessions() {
            let mut ser = TreeSerializer::new();
            ser.begin_saving().unwrap();
            assert!(matches!(
                ser.begin_saving(),
                Err(Error::InvalidState { .. })
            ));
            assert!(matches!(
                ser.begin_loading(&[]),
                Err(Error::InvalidState { .. })
            ));
            assert!(ser.end_loading().is_err());
        }

        #[test]
        fn reusable_after_session() {
            let mut ser = TreeSerializer::new();
            ser.begin_saving().unwrap();
            ser.serialize("a", &mut 1i32, 0).unwrap();
            let bytes = ser.end_saving().unwrap();
            assert_eq!(ser.state(), State::Idle);
            ser.begin_loading(&bytes).unwrap();
            let mut a = 0i32;
            assert!(ser.serialize("a", &mut a, 0).unwrap());
            ser.end_loading().unwrap();
            assert_eq!(a, 1);
            assert_eq!(ser.version(), FILE_VERSION);
            assert!(ser.warnings().is_empty());
        }

        #[test]
        fn exact_length() {
            let bytes = save(|ser| {
                ser.serialize("text", &mut "some text".to_string(), String::new())
                    .unwrap();
            });
            let root = NodeHeader::decode(&bytes, 0).unwrap();
            assert_eq!(root.size as usize, bytes.len());
        }

        #[test]
        fn serialize_outside_session() {
            let mut ser = TreeSerializer::new();
            assert!(matches!(
                ser.serialize("a", &mut 1i32, 0),
                Err(Error::InvalidState { .. })
            ));
            assert!(ser.open_parent("a").is_err());
        }

        #[test]
        fn garbage_is_fatal() {
            let mut ser = TreeSerializer::new();
            assert!(ser.begin_loading(&[1, 2, 3]).is_err());
            assert_eq!(ser.state(), State::Failed);
            assert!(ser.serialize("a", &mut 1i32, 0).is_err());
            // A failed session can be replaced by a new one
            ser.begin_saving().unwrap();
        }

        #[test]
        fn raw_mode() {
            let bytes = save(|ser| {
                ser.serialize("a", &mut 1i32, 0).unwrap();
            });
            let mut ser = TreeSerializer::new();
            ser.begin_loading_with(&bytes, LoadMode::Raw).unwrap();
            assert_eq!(ser.depth(), 1);
            assert!(ser.dictionary().get("a").is_none());
            assert!(!ser.open_parent("anything").unwrap());
            ser.end_loading().unwrap();
        }
    }

    mod version {
        use super::*;

        /// Rewrite the file version payload of a saved document.
        fn set_version(bytes: &mut [u8], version: i32) {
            let pos = 3 * HEADER_SIZE;
            bytes[pos..pos + 4].copy_from_slice(&version.to_le_bytes());
        }

        #[test]
        fn mismatch_is_warning() {
            let mut bytes = save(|ser| {
                ser.serialize("a", &mut 5i32, 0).unwrap();
            });
            set_version(&mut bytes, 7);
            let mut a = 0;
            let ser = load(&bytes, |ser| {
                assert!(ser.serialize("a", &mut a, 0).unwrap());
            });
            assert_eq!(a, 5);
            assert_eq!(ser.version(), 7);
            assert_eq!(
                ser.warnings(),
                &[Warning::VersionMismatch {
                    found: 7,
                    current: FILE_VERSION
                }]
            );
        }

        #[test]
        fn missing_is_warning() {
            let mut bytes = save(|_| ());
            // Rename the version leaf to an unknown id
            bytes[2 * HEADER_SIZE..2 * HEADER_SIZE + 2].copy_from_slice(&5i16.to_le_bytes());
            let ser = load(&bytes, |_| ());
            assert_eq!(ser.warnings(), &[Warning::MissingVersion]);
        }

        #[test]
        fn wrong_size_warns_once() {
            let mut bytes = save(|_| ());
            // Shrink the version payload to two bytes and fix up the enclosing sizes
            let leaf = 2 * HEADER_SIZE;
            bytes.drain(leaf + HEADER_SIZE + 2..leaf + HEADER_SIZE + 4);
            let root_size = bytes.len() as i32;
            patch_size(&mut bytes, 0, root_size);
            patch_size(&mut bytes, HEADER_SIZE, 18);
            patch_size(&mut bytes, leaf, 10);
            let ser = load(&bytes, |_| ());
            assert_eq!(ser.version(), -1);
            assert_eq!(
                ser.warnings(),
                &[Warning::SizeMismatch {
                    tag: FILE_VERSION_TAG.to_string(),
                    expected: 4,
                    actual: 2,
                }]
            );
        }
    }

    mod leaves {
        use super::*;

        #[test]
        fn every_type() {
            let bytes = save(|ser| {
                ser.serialize("i16", &mut -3i16, 0).unwrap();
                ser.serialize("i32", &mut 123456i32, 0).unwrap();
                ser.serialize("f32", &mut 2.5f32, 0.0).unwrap();
                ser.serialize("f64", &mut -0.13f64, 0.0).unwrap();
                ser.serialize("bool", &mut true, false).unwrap();
                ser.serialize("char", &mut 'ä', 'a').unwrap();
                ser.serialize("text", &mut "äüösChina".to_string(), String::new())
                    .unwrap();
                ser.serialize("empty", &mut String::new(), "x".to_string())
                    .unwrap();
                ser.serialize_enum("mood", &mut Mood::Angry, Mood::Calm)
                    .unwrap();
                ser.serialize("v2", &mut Vec2::new(1.0, 2.0), Vec2::ZERO)
                    .unwrap();
                ser.serialize("v3", &mut Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO)
                    .unwrap();
            });

            load(&bytes, |ser| {
                let mut i16v = 0i16;
                let mut i32v = 0i32;
                let mut f32v = 0f32;
                let mut f64v = 0f64;
                let mut boolv = false;
                let mut charv = ' ';
                let mut text = String::new();
                let mut empty = String::from("not empty");
                let mut mood = Mood::Calm;
                let mut v2 = Vec2::ZERO;
                let mut v3 = Vec3::ZERO;
                assert!(ser.serialize("i16", &mut i16v, 0).unwrap());
                assert!(ser.serialize("i32", &mut i32v, 0).unwrap());
                assert!(ser.serialize("f32", &mut f32v, 0.0).unwrap());
                assert!(ser.serialize("f64", &mut f64v, 0.0).unwrap());
                assert!(ser.serialize("bool", &mut boolv, false).unwrap());
                assert!(ser.serialize("char", &mut charv, 'a').unwrap());
                assert!(ser.serialize("text", &mut text, String::new()).unwrap());
                assert!(ser.serialize("empty", &mut empty, "x".to_string()).unwrap());
                assert!(ser.serialize_enum("mood", &mut mood, Mood::Calm).unwrap());
                assert!(ser.serialize("v2", &mut v2, Vec2::ZERO).unwrap());
                assert!(ser.serialize("v3", &mut v3, Vec3::ZERO).unwrap());
                assert_eq!(i16v, -3);
                assert_eq!(i32v, 123456);
                assert_eq!(f32v, 2.5);
                assert_eq!(f64v, -0.13);
                assert!(boolv);
                assert_eq!(charv, 'ä');
                assert_eq!(text, "äüösChina");
                assert_eq!(empty, "");
                assert_eq!(mood, Mood::Angry);
                assert_eq!(v2, Vec2::new(1.0, 2.0));
                assert_eq!(v3, Vec3::new(1.0, 2.0, 3.0));
            });
        }

        #[test]
        fn missing_uses_fallback() {
            let bytes = save(|ser| {
                ser.serialize("a", &mut 1i32, 0).unwrap();
                ser.serialize("c", &mut 3i32, 0).unwrap();
            });
            load(&bytes, |ser| {
                let (mut a, mut b, mut c) = (0, 0, 0);
                let mut v = Vec2::ONE;
                assert!(ser.serialize("a", &mut a, -1).unwrap());
                assert!(!ser.serialize("b", &mut b, -2).unwrap());
                assert!(ser.serialize("c", &mut c, -3).unwrap());
                assert!(!ser.serialize("pos", &mut v, Vec2::new(7.0, 8.0)).unwrap());
                assert_eq!((a, b, c), (1, -2, 3));
                assert_eq!(v, Vec2::new(7.0, 8.0));
            });
        }

        #[test]
        fn size_mismatch_uses_fallback() {
            let bytes = save(|ser| {
                ser.serialize("a", &mut 1i16, 0).unwrap();
                ser.serialize("b", &mut 2i32, 0).unwrap();
            });
            let ser = load(&bytes, |ser| {
                let (mut a, mut b) = (0i32, 0i32);
                assert!(!ser.serialize("a", &mut a, 99).unwrap());
                assert!(ser.serialize("b", &mut b, 0).unwrap());
                assert_eq!((a, b), (99, 2));
            });
            assert_eq!(
                ser.warnings(),
                &[Warning::SizeMismatch {
                    tag: "a".to_string(),
                    expected: 4,
                    actual: 2
                }]
            );
        }

        #[test]
        fn unknown_enum_value() {
            let bytes = save(|ser| {
                ser.serialize("mood", &mut 17i32, 0).unwrap();
            });
            let ser = load(&bytes, |ser| {
                let mut mood = Mood::Angry;
                assert!(!ser.serialize_enum("mood", &mut mood, Mood::Calm).unwrap());
                assert_eq!(mood, Mood::Calm);
            });
            assert_eq!(ser.warnings().len(), 1);
        }

        #[test]
        fn repeated_tag_reads_in_order() {
            let bytes = save(|ser| {
                for i in 0..4i32 {
                    ser.serialize("same", &mut (i * 10), 0).unwrap();
                }
            });
            load(&bytes, |ser| {
                for i in 0..4i32 {
                    let mut v = -1;
                    assert!(ser.serialize("same", &mut v, -1).unwrap());
                    assert_eq!(v, i * 10);
                }
            });
        }

        #[test]
        fn reordered_reads() {
            let bytes = save(|ser| {
                ser.serialize("a", &mut 1i32, 0).unwrap();
                ser.serialize("b", &mut 2.0f64, 0.0).unwrap();
                ser.serialize("c", &mut "three".to_string(), String::new())
                    .unwrap();
            });
            load(&bytes, |ser| {
                let mut c = String::new();
                let mut a = 0i32;
                let mut b = 0f64;
                assert!(ser.serialize("c", &mut c, String::new()).unwrap());
                assert!(ser.serialize("a", &mut a, 0).unwrap());
                assert!(ser.serialize("b", &mut b, 0.0).unwrap());
                assert_eq!((a, b, c.as_str()), (1, 2.0, "three"));
            });
        }
    }

    mod parents {
        use super::*;

        #[test]
        fn nested_roundtrip() {
            let bytes = save(|ser| {
                assert!(ser.open_parent("outer").unwrap());
                ser.serialize("x", &mut 1i32, 0).unwrap();
                assert!(ser.open_parent("inner").unwrap());
                ser.serialize("x", &mut 2i32, 0).unwrap();
                ser.close_parent().unwrap();
                ser.serialize("y", &mut 3i32, 0).unwrap();
                ser.close_parent().unwrap();
            });
            load(&bytes, |ser| {
                assert!(ser.open_parent("outer").unwrap());
                assert!(ser.open_parent("inner").unwrap());
                let mut x = 0;
                ser.serialize("x", &mut x, 0).unwrap();
                assert_eq!(x, 2);
                ser.close_parent().unwrap();
                let (mut x, mut y) = (0, 0);
                ser.serialize("y", &mut y, 0).unwrap();
                ser.serialize("x", &mut x, 0).unwrap();
                assert_eq!((x, y), (1, 3));
                assert!(!ser.open_parent("missing").unwrap());
                ser.close_parent().unwrap();
            });
        }

        #[test]
        fn skipped_parent_is_ignored() {
            let bytes = save(|ser| {
                ser.open_parent("unknown").unwrap();
                ser.serialize("deep", &mut 1i32, 0).unwrap();
                ser.close_parent().unwrap();
                ser.serialize("after", &mut 2i32, 0).unwrap();
            });
            load(&bytes, |ser| {
                let mut after = 0;
                assert!(ser.serialize("after", &mut after, 0).unwrap());
                assert_eq!(after, 2);
                let mut deep = 0;
                assert!(!ser.serialize("deep", &mut deep, -1).unwrap());
            });
        }

        #[test]
        fn unbalanced_load_is_fatal() {
            let bytes = save(|ser| {
                ser.open_parent("p").unwrap();
                ser.close_parent().unwrap();
            });
            let mut ser = TreeSerializer::new();
            ser.begin_loading(&bytes).unwrap();
            assert!(ser.open_parent("p").unwrap());
            assert_eq!(ser.end_loading(), Err(Error::ScopeImbalance { depth: 4 }));
            assert_eq!(ser.state(), State::Failed);
        }

        #[test]
        fn unbalanced_save_is_fatal() {
            let mut ser = TreeSerializer::new();
            ser.begin_saving().unwrap();
            ser.open_parent("p").unwrap();
            assert!(matches!(
                ser.end_saving(),
                Err(Error::ScopeImbalance { depth: 4 })
            ));
        }

        #[test]
        fn kind_mismatch_is_fatal() {
            let bytes = save(|ser| {
                ser.serialize("a", &mut 1i32, 0).unwrap();
                ser.open_parent("p").unwrap();
                ser.close_parent().unwrap();
            });
            let mut ser = TreeSerializer::new();
            ser.begin_loading(&bytes).unwrap();
            assert!(matches!(
                ser.open_parent("a"),
                Err(Error::KindMismatch {
                    expected: NodeKind::Parent,
                    ..
                })
            ));
            assert_eq!(ser.state(), State::Failed);

            ser.begin_loading(&bytes).unwrap();
            assert!(matches!(
                ser.serialize("p", &mut 0i32, 0),
                Err(Error::KindMismatch {
                    expected: NodeKind::Leaf,
                    ..
                })
            ));
        }

        #[test]
        fn close_data_section_is_fatal() {
            let mut ser = TreeSerializer::new();
            ser.begin_saving().unwrap();
            assert_eq!(ser.close_parent(), Err(Error::ScopeImbalance { depth: 3 }));
            assert_eq!(ser.state(), State::Failed);
            assert!(ser.open_parent("p").is_err());
            assert!(ser.end_saving().is_err());

            let bytes = save(|ser| {
                ser.open_parent("p").unwrap();
                ser.close_parent().unwrap();
            });
            let mut ser = TreeSerializer::new();
            ser.begin_loading(&bytes).unwrap();
            assert!(ser.open_parent("p").unwrap());
            ser.close_parent().unwrap();
            assert_eq!(ser.close_parent(), Err(Error::ScopeImbalance { depth: 3 }));
            assert_eq!(ser.state(), State::Failed);
        }
    }

    mod corruption {
        use super::*;

        #[test]
        fn oversized_child() {
            let mut bytes = save(|ser| {
                ser.serialize("a", &mut 1i32, 0).unwrap();
            });
            let data = HEADER_SIZE + 2 * HEADER_SIZE + 4;
            let leaf = data + HEADER_SIZE;
            // Leaf claims to run past the end of the data section
            bytes[leaf + 2..leaf + 6].copy_from_slice(&100i32.to_le_bytes());
            let mut ser = TreeSerializer::new();
            // Dictionary is found before the data section is scanned
            let result = ser
                .begin_loading(&bytes)
                .and_then(|_| ser.serialize("a", &mut 0i32, 0));
            assert!(matches!(result, Err(Error::OutOfScope { .. })));
        }

        #[test]
        fn truncated() {
            let bytes = save(|ser| {
                ser.serialize("a", &mut 1i32, 0).unwrap();
            });
            for len in 0..bytes.len() {
                let mut ser = TreeSerializer::new();
                assert!(ser.begin_loading(&bytes[..len]).is_err(), "length {}", len);
            }
        }
    }
}
