use serde::{Deserialize, Serialize};

/// Opaque, monotonically-refreshed revision token for optimistic concurrency control.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    pub const INITIAL: Revision = Revision(1);

    pub fn next(self) -> Self {
        Revision(self.0 + 1)
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope wrapping every persisted document with its collection-unique key
/// and revision, mirroring the `_key`/`_rev` pair of the entity store this
/// crate treats as opaque.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EntityDocument<T> {
    #[serde(rename = "_key")]
    pub key: String,
    #[serde(rename = "_rev")]
    pub rev: Revision,
    #[serde(flatten)]
    pub value: T,
}

impl<T> EntityDocument<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            rev: Revision::INITIAL,
            value,
        }
    }
}
