// Core ID types for the sync protocol.
//
// Lightweight newtypes shared by `envelope.rs`, `message.rs`, and both sides
// of the relay (`metaroom_relay::session` and `metaroom_relay::lock`). The
// relay assigns compact integer connection ids; object ids come from the
// clients and may be either numbers or names.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Relay-assigned connection id. Unique for the lifetime of a relay process,
/// allocated from a monotonically increasing counter and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-chosen identifier of a shared object. Browsers send both integer
/// and string ids, so the wire form is untagged.
///
/// Browsers key objects by property name, which makes `7` and `"7"` the same
/// object. A `Name` never holds a string that parses as an `i64`: every
/// constructor (including deserialization) folds those into `Number`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum ObjectId {
    Number(i64),
    Name(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawObjectId {
    Number(i64),
    Name(String),
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawObjectId::deserialize(deserializer)? {
            RawObjectId::Number(n) => ObjectId::Number(n),
            RawObjectId::Name(name) => ObjectId::from(name),
        })
    }
}

impl ObjectId {
    /// Recover an id from a JSON object key. Object snapshots are keyed by
    /// the id's display form, so numeric-looking keys map back to `Number`.
    pub fn from_key(key: &str) -> Self {
        match key.parse::<i64>() {
            Ok(n) => ObjectId::Number(n),
            Err(_) => ObjectId::Name(key.to_string()),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Number(n) => write!(f, "{n}"),
            ObjectId::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for ObjectId {
    fn from(n: i64) -> Self {
        ObjectId::Number(n)
    }
}

impl From<&str> for ObjectId {
    fn from(name: &str) -> Self {
        ObjectId::from_key(name)
    }
}

impl From<String> for ObjectId {
    fn from(name: String) -> Self {
        match name.parse::<i64>() {
            Ok(n) => ObjectId::Number(n),
            Err(_) => ObjectId::Name(name),
        }
    }
}

/// Index of the world currently loaded by the room. Starts at 0 and changes
/// whenever any client sends `Load_World`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldIndex(pub i64);
