use std::collections::HashMap;

use crate::node::{NodeId, ReservedId, BEGIN_RESERVED};
use crate::error::{Error, Result};

/// Name of the pre-seeded pseudo-tag for the file version leaf.
pub const FILE_VERSION_TAG: &str = "FileVersion";

/// Maps tag names to the per-document ids they're stored under.
///
/// Ids are handed out in first-seen order and are only meaningful within a single document: the
/// dictionary is written into each document, and on load names are matched against whatever ids
/// that document assigned.
#[derive(Clone, Debug)]
pub struct NameDictionary {
    ids: HashMap<String, NodeId>,
    order: Vec<String>,
}

impl Default for NameDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl NameDictionary {
    /// Create a dictionary holding only the file version pseudo-tag.
    pub fn new() -> Self {
        let mut dict = Self {
            ids: HashMap::new(),
            order: Vec::new(),
        };
        dict.ids
            .insert(FILE_VERSION_TAG.to_string(), ReservedId::FileVersion.id());
        dict.order.push(FILE_VERSION_TAG.to_string());
        dict
    }

    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.ids.get(name).copied()
    }

    /// Look up a name, assigning it the next sequential id if it hasn't been seen yet.
    pub fn get_or_assign(&mut self, name: &str) -> Result<NodeId> {
        if let Some(id) = self.get(name) {
            return Ok(id);
        }
        let next = self.ids.len();
        if next >= BEGIN_RESERVED as usize {
            return Err(Error::BadEncode(format!(
                "Too many distinct tags: \"{}\" would need id {}",
                name, next
            )));
        }
        let id = next as NodeId;
        self.ids.insert(name.to_string(), id);
        self.order.push(name.to_string());
        Ok(id)
    }

    /// Record a name/id pair read from a stored dictionary.
    pub fn insert(&mut self, name: String, id: NodeId) -> Result<()> {
        if self.ids.contains_key(&name) {
            return Err(Error::BadEncode(format!(
                "Dictionary contains \"{}\" twice",
                name
            )));
        }
        self.order.push(name.clone());
        self.ids.insert(name, id);
        Ok(())
    }

    /// Reverse lookup, used by the debug dump.
    pub fn name_of(&self, id: NodeId) -> Option<&str> {
        self.order
            .iter()
            .find(|name| self.ids.get(name.as_str()) == Some(&id))
            .map(|s| s.as_str())
    }

    /// Iterate over every pair that gets written into a document, in assignment order. The file
    /// version pseudo-tag lives at a reserved id and is skipped.
    pub fn stored_entries(&self) -> impl Iterator<Item = (&str, NodeId)> + '_ {
        self.order
            .iter()
            .filter_map(move |name| self.ids.get(name).map(|id| (name.as_str(), *id)))
            .filter(|(_, id)| *id != ReservedId::FileVersion.id())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
