//! Checks for stored documents and for types implementing [`TreeSerializable`].

use std::fmt;

use crate::{
    dump::to_debug_string,
    error::{Error, Result},
    node::NodeKind,
    object::{ObjectFallback, TreeSerializable},
    serializer::TreeSerializer,
    walk::NodeWalker,
};

/// Characters of context kept on each side of a deviation.
const CONTEXT_CHARS: usize = 100;

/// First point where two debug renderings of a value differ.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    /// Character index of the first difference.
    pub at: usize,
    /// Up to 100 characters leading up to the difference.
    pub equal_until: String,
    /// Up to 100 characters starting at the difference, taken from the longer rendering.
    pub deviation: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Error at debug string char {}. First deviation at:\n\n{} >>>>>>>>> {}",
            self.at, self.equal_until, self.deviation
        )
    }
}

/// Compare two renderings of a value, returning where they first differ.
pub fn compare_debug_strings(before: &str, after: &str) -> Option<Mismatch> {
    let before: Vec<char> = before.chars().collect();
    let after: Vec<char> = after.chars().collect();
    let shared = before.len().min(after.len());
    let at = match before.iter().zip(after.iter()).position(|(a, b)| a != b) {
        Some(at) => at,
        None if before.len() == after.len() => return None,
        None => shared,
    };

    let longer = if before.len() > after.len() {
        &before
    } else {
        &after
    };
    let context_start = at.saturating_sub(CONTEXT_CHARS);
    let context_end = (at + CONTEXT_CHARS).min(longer.len());
    Some(Mismatch {
        at,
        equal_until: longer[context_start..at].iter().collect(),
        deviation: longer[at..context_end].iter().collect(),
    })
}

/// Outcome of [`verify_round_trip`].
#[derive(Clone, Debug)]
pub struct RoundTrip {
    /// The saved document.
    pub bytes: Vec<u8>,
    /// Where the reloaded value's `Debug` output first differs from the original's.
    pub mismatch: Option<Mismatch>,
}

impl RoundTrip {
    pub fn is_ok(&self) -> bool {
        self.mismatch.is_none()
    }
}

/// Save `value` under `tag`, load it back into a fresh default instance, and compare the `Debug`
/// renderings of the two. A mismatch is logged together with a dump of the saved document.
pub fn verify_round_trip<T>(value: T, tag: &str) -> Result<RoundTrip>
where
    T: TreeSerializable + Default + fmt::Debug,
{
    let mut original = Some(value);
    let before = format!("{:?}", original);

    let mut ser = TreeSerializer::new();
    ser.begin_saving()?;
    ser.serialize_object(tag, &mut original, ObjectFallback::Absent)?;
    let bytes = ser.end_saving()?;

    let mut loaded: Option<T> = None;
    let loaded_ok = ser
        .begin_loading(&bytes)
        .and_then(|_| ser.serialize_object(tag, &mut loaded, ObjectFallback::Absent))
        .and_then(|_| ser.end_loading());
    if let Err(e) = loaded_ok {
        log::error!(
            "Reloading a saved value failed: {}\n\n{}",
            e,
            to_debug_string(&bytes)
        );
        return Err(e);
    }

    let after = format!("{:?}", loaded);
    let mismatch = compare_debug_strings(&before, &after);
    match mismatch {
        Some(ref mismatch) => log::error!(
            "Serialization debug string mismatch:\n{}\n\nBefore serialization:\n\n{}\n\nAfter serialization:\n\n{}\n\n{}",
            mismatch,
            before,
            after,
            to_debug_string(&bytes)
        ),
        None => log::debug!("Serialization verified: {}", before),
    }
    Ok(RoundTrip { bytes, mismatch })
}

/// Walk an entire document and check that every node's size field exactly covers its contents.
/// A document must consist of a single parent node spanning the whole buffer. Returns the total
/// number of nodes.
pub fn check_structure(data: &[u8]) -> Result<usize> {
    let mut count = 0;
    for node in NodeWalker::new(data) {
        let node = node?;
        if node.depth == 0
            && (node.offset != 0
                || node.header.kind != NodeKind::Parent
                || node.header.size as usize != data.len())
        {
            return Err(Error::BadEncode(format!(
                "Node at {} is outside the document root",
                node.offset
            )));
        }
        count += 1;
    }
    if count == 0 {
        return Err(Error::BadEncode("Document is empty".to_string()));
    }
    Ok(count)
}
