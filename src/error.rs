use std::fmt;

use serde::{de, ser};

use crate::node::{NodeId, NodeKind};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Occurs when an operation is called in the wrong session state: starting a session while
    /// one is open, reading while saving, or using a session after it failed.
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    /// The scope stack didn't unwind to the implicit root when the session ended. Usually means a
    /// caller opened a parent node and never closed it.
    ScopeImbalance { depth: usize },
    /// A read or seek would leave the bounds of the currently open scope, or the buffer itself.
    OutOfScope {
        step: &'static str,
        pos: usize,
        start: usize,
        end: usize,
    },
    /// A node with the requested id was found, but it was a leaf where a parent was expected (or
    /// the reverse).
    KindMismatch {
        id: NodeId,
        expected: NodeKind,
        actual: NodeKind,
    },
    /// A polymorphic factory couldn't build an instance for a stored type id.
    Construction { type_id: i32, reason: String },
    /// Scope nesting went past [`MAX_DEPTH`][crate::MAX_DEPTH].
    DepthLimit,
    /// Data was greater than the maximum allowed size.
    LengthTooLong { max: usize, actual: usize },
    /// Basic node encoding failure: bad kind code, bad size field, malformed dictionary.
    BadEncode(String),
    /// Occurs when serde serialization or deserialization fails
    SerdeFail(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::InvalidState { expected, actual } => write!(
                f,
                "Invalid serializer state: expected {}, but was {}",
                expected, actual
            ),
            Error::ScopeImbalance { depth } => write!(
                f,
                "Scope stack not balanced at end of session: depth is {}, expected 1",
                depth
            ),
            Error::OutOfScope {
                step,
                pos,
                start,
                end,
            } => write!(
                f,
                "Position {} is outside of scope [{}, {}] on step [{}]",
                pos, start, end, step
            ),
            Error::KindMismatch {
                id,
                expected,
                actual,
            } => write!(
                f,
                "Node {} should be a {:?}, but is a {:?}",
                id, expected, actual
            ),
            Error::Construction {
                type_id,
                ref reason,
            } => write!(f, "Could not construct type id {}: {}", type_id, reason),
            Error::DepthLimit => f.write_str("Scope depth limit exceeded"),
            Error::LengthTooLong { max, actual } => write!(
                f,
                "Data too long: was {} bytes, maximum allowed is {}",
                actual, max
            ),
            Error::BadEncode(ref err) => write!(f, "Basic data encoding failure: {}", err),
            Error::SerdeFail(ref msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {}

impl ser::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::SerdeFail(msg.to_string())
    }
}

impl de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::SerdeFail(msg.to_string())
    }
}

/// A recoverable event recorded during a load. The serializer substitutes a fallback value and
/// keeps going; callers can inspect these afterwards through
/// [`TreeSerializer::warnings`][crate::TreeSerializer::warnings].
#[derive(Clone, Debug, PartialEq)]
pub enum Warning {
    /// The meta section had no file version leaf.
    MissingVersion,
    /// The file was written with a different format version.
    VersionMismatch { found: i32, current: i32 },
    /// A fixed-width leaf had a different payload size than its type needs.
    SizeMismatch {
        tag: String,
        expected: usize,
        actual: usize,
    },
    /// A leaf had the right size but held a value the target type can't represent.
    InvalidValue { tag: String, reason: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Warning::MissingVersion => f.write_str("Did not find file version in serialized data"),
            Warning::VersionMismatch { found, current } => write!(
                f,
                "Loading old file version {} (current is {})",
                found, current
            ),
            Warning::SizeMismatch {
                ref tag,
                expected,
                actual,
            } => write!(
                f,
                "Size of attribute \"{}\" changed: expected {} payload bytes, found {}",
                tag, expected, actual
            ),
            Warning::InvalidValue { ref tag, ref reason } => {
                write!(f, "Invalid value for attribute \"{}\": {}", tag, reason)
            }
        }
    }
}
