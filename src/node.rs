//! Node headers: the fixed 8-byte prefix of every record in a document.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// Numeric id of a node. User tags get small ids from the dictionary; the top of the range is
/// reserved for structural nodes.
pub type NodeId = i16;

pub const ID_SIZE: usize = 2;
pub const SIZE_SIZE: usize = 4;
pub const KIND_SIZE: usize = 2;
/// Total size of a node header.
pub const HEADER_SIZE: usize = ID_SIZE + SIZE_SIZE + KIND_SIZE;

/// Node kinds. Parents hold a nested scope of child nodes, leaves hold a raw payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Parent,
    Leaf,
}

impl NodeKind {
    pub fn from_u16(n: u16) -> Option<NodeKind> {
        match n {
            0 => Some(NodeKind::Parent),
            1 => Some(NodeKind::Leaf),
            _ => None,
        }
    }
}

impl From<NodeKind> for u16 {
    fn from(kind: NodeKind) -> u16 {
        match kind {
            NodeKind::Parent => 0,
            NodeKind::Leaf => 1,
        }
    }
}

/// Structural ids living at the top of the id space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i16)]
pub enum ReservedId {
    Invalid = i16::MAX,
    DocumentRoot = i16::MAX - 1,
    MetaSection = i16::MAX - 2,
    FileVersion = i16::MAX - 3,
    DataSection = i16::MAX - 4,
    Dictionary = i16::MAX - 5,
    DictionaryKey = i16::MAX - 6,
    DictionaryValue = i16::MAX - 7,
    IsNull = i16::MAX - 20,
}

/// First id of the reserved block. Dictionary-assigned ids must stay below this.
pub const BEGIN_RESERVED: NodeId = i16::MAX - 100;

impl ReservedId {
    pub fn id(self) -> NodeId {
        self as NodeId
    }

    pub fn from_id(id: NodeId) -> Option<ReservedId> {
        use self::ReservedId::*;
        [
            Invalid,
            DocumentRoot,
            MetaSection,
            FileVersion,
            DataSection,
            Dictionary,
            DictionaryKey,
            DictionaryValue,
            IsNull,
        ]
        .into_iter()
        .find(|r| r.id() == id)
    }

    /// Name used for this node in debug dumps.
    pub fn name(self) -> &'static str {
        use self::ReservedId::*;
        match self {
            Invalid => "Invalid",
            DocumentRoot => "Root",
            MetaSection => "Meta",
            FileVersion => "FileVersion",
            DataSection => "Data",
            Dictionary => "Dictionary",
            DictionaryKey => "Key",
            DictionaryValue => "Value",
            IsNull => "IsNull",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHeader {
    pub id: NodeId,
    /// Total node length, header included.
    pub size: i32,
    pub kind: NodeKind,
}

impl NodeHeader {
    pub fn new(id: NodeId, size: i32, kind: NodeKind) -> Self {
        Self { id, size, kind }
    }

    /// Length of the payload following the header.
    pub fn payload_len(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }

    /// Append the header onto a byte vector.
    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&u16::from(self.kind).to_le_bytes());
    }

    /// Decode the header starting at `pos`. Fails if the header is truncated, has an unknown kind
    /// code, or a size field too small to hold its own header.
    pub fn decode(buf: &[u8], pos: usize) -> Result<NodeHeader> {
        let truncated = || Error::OutOfScope {
            step: "decode node header",
            pos,
            start: 0,
            end: buf.len(),
        };
        let mut data = buf.get(pos..).ok_or_else(truncated)?;
        let id = data.read_i16::<LittleEndian>().map_err(|_| truncated())?;
        let size = data.read_i32::<LittleEndian>().map_err(|_| truncated())?;
        let kind = data.read_u16::<LittleEndian>().map_err(|_| truncated())?;
        let kind = NodeKind::from_u16(kind).ok_or_else(|| {
            Error::BadEncode(format!("Node {} at {} has unknown kind {}", id, pos, kind))
        })?;
        if size < HEADER_SIZE as i32 {
            return Err(Error::BadEncode(format!(
                "Node {} at {} has size {}, smaller than its header",
                id, pos, size
            )));
        }
        Ok(NodeHeader { id, size, kind })
    }
}

/// Overwrite the size field of the header starting at `header_pos`.
pub fn patch_size(buf: &mut [u8], header_pos: usize, size: i32) {
    let start = header_pos + ID_SIZE;
    LittleEndian::write_i32(&mut buf[start..start + SIZE_SIZE], size);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout() {
        let mut enc = Vec::new();
        NodeHeader::new(3, 12, NodeKind::Leaf).encode_vec(&mut enc);
        assert_eq!(enc, &[3, 0, 12, 0, 0, 0, 1, 0]);
        let mut enc = Vec::new();
        NodeHeader::new(ReservedId::DocumentRoot.id(), 8, NodeKind::Parent).encode_vec(&mut enc);
        assert_eq!(enc, &[0xfe, 0x7f, 8, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn roundtrip() {
        let header = NodeHeader::new(-5, 1234, NodeKind::Parent);
        let mut enc = vec![0xAA];
        header.encode_vec(&mut enc);
        assert_eq!(NodeHeader::decode(&enc, 1).unwrap(), header);
    }

    #[test]
    fn truncated() {
        let mut enc = Vec::new();
        NodeHeader::new(1, 8, NodeKind::Leaf).encode_vec(&mut enc);
        enc.pop();
        assert!(matches!(
            NodeHeader::decode(&enc, 0),
            Err(Error::OutOfScope { .. })
        ));
        assert!(NodeHeader::decode(&enc, 100).is_err());
    }

    #[test]
    fn bad_kind_and_size() {
        let enc = [1, 0, 8, 0, 0, 0, 2, 0];
        assert!(matches!(NodeHeader::decode(&enc, 0), Err(Error::BadEncode(_))));
        let enc = [1, 0, 7, 0, 0, 0, 1, 0];
        assert!(matches!(NodeHeader::decode(&enc, 0), Err(Error::BadEncode(_))));
    }

    #[test]
    fn patch() {
        let mut enc = Vec::new();
        NodeHeader::new(1, -1, NodeKind::Parent).encode_vec(&mut enc);
        patch_size(&mut enc, 0, 40);
        assert_eq!(NodeHeader::decode(&enc, 0).unwrap().size, 40);
    }

    #[test]
    fn reserved_block() {
        for id in [
            ReservedId::Invalid,
            ReservedId::DocumentRoot,
            ReservedId::IsNull,
            ReservedId::DictionaryValue,
        ] {
            assert!(id.id() > BEGIN_RESERVED);
            assert_eq!(ReservedId::from_id(id.id()), Some(id));
        }
        assert_eq!(ReservedId::from_id(1), None);
    }
}
