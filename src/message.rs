//! The message data model (§3 of the design document).

use std::collections::BTreeMap;

/// A hierarchical topic path, e.g. `/a/b/c`.
///
/// The first non-empty segment is the partition name; the whole path is the
/// matching key used by the subscription tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(String);

impl Path {
    pub fn new(raw: impl Into<String>) -> Self {
        Path(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }

    /// The first non-empty path segment, or empty for `/` and `""`.
    pub fn partition(&self) -> &str {
        self.segments().next().unwrap_or("")
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A filters map, serialized as a JSON object on the wire (order-irrelevant).
pub type Filters = BTreeMap<String, String>;

/// A single message as published to a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u64,
    pub path: Path,
    pub user_id: String,
    pub application_id: String,
    pub filters: Filters,
    pub expires: u64,
    pub time: u64,
    pub node_id: u8,
    pub header_json: Vec<u8>,
    pub body: Vec<u8>,
}

impl Message {
    /// Whether this message has expired relative to `now` (unix seconds).
    ///
    /// `Expires == 0` means "never expires".
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires > 0 && self.expires < now
    }
}
