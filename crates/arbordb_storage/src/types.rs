//! Identifiers and persisted record types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Object identifier.
///
/// Oids are 128-bit UUIDs that are:
/// - Assigned once, when the object is created
/// - Globally unique within a store
/// - Never reused
///
/// Two values are reserved: [`Oid::ROOT`], the entry point of the object
/// graph, and [`Oid::TRASH`], the sentinel parent of objects that were
/// logically deleted but not yet purged.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid(Uuid);

impl Oid {
    /// The root of the object graph.
    pub const ROOT: Oid = Oid(Uuid::nil());

    /// Sentinel parent for trashed objects.
    pub const TRASH: Oid = Oid(Uuid::from_bytes([0xdd; 16]));

    /// Creates a new random oid.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an oid from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns true for [`Oid::ROOT`] and [`Oid::TRASH`].
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        *self == Self::ROOT || *self == Self::TRASH
    }
}

impl Default for Oid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.0.simple())
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for Oid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for Oid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Transaction id.
///
/// Tids are assigned by the backend when a transaction is published. They
/// totally order commits and are never reused.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tid(pub u64);

impl Tid {
    /// The tid of the bootstrap state.
    pub const ZERO: Tid = Tid(0);

    /// Creates a new tid.
    #[must_use]
    pub const fn new(tid: u64) -> Self {
        Self(tid)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next tid.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Blob identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobId(Uuid);

impl BlobId {
    /// Creates a new random blob id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BlobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0.simple())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Whether an object lives in the tree or hangs off another object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Tree-resident object with a parent.
    Resource,
    /// Value owned by a resource but not positioned in the tree (annotations).
    SubValue,
}

/// The state an object is written with.
///
/// This is what a transaction stages; the backend turns it into an
/// [`ObjectRecord`] by stamping the commit tid as serial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectWrite {
    /// Identity of the object.
    pub oid: Oid,
    /// Resource or sub-value.
    pub kind: ObjectKind,
    /// Parent in the tree (resources).
    pub parent_oid: Option<Oid>,
    /// Owning object (sub-values).
    pub owner_oid: Option<Oid>,
    /// Key under the parent or owner.
    pub name: Option<String>,
    /// Type of the stored value.
    pub type_name: String,
    /// Serialized state, opaque to the storage layer.
    pub state: Bytes,
}

impl ObjectWrite {
    /// A resource named `name` under `parent`.
    pub fn resource(
        oid: Oid,
        parent: Oid,
        name: impl Into<String>,
        type_name: impl Into<String>,
        state: impl Into<Bytes>,
    ) -> Self {
        Self {
            oid,
            kind: ObjectKind::Resource,
            parent_oid: Some(parent),
            owner_oid: None,
            name: Some(name.into()),
            type_name: type_name.into(),
            state: state.into(),
        }
    }

    /// A sub-value (annotation) named `name` owned by `owner`.
    pub fn sub_value(
        oid: Oid,
        owner: Oid,
        name: impl Into<String>,
        type_name: impl Into<String>,
        state: impl Into<Bytes>,
    ) -> Self {
        Self {
            oid,
            kind: ObjectKind::SubValue,
            parent_oid: None,
            owner_oid: Some(owner),
            name: Some(name.into()),
            type_name: type_name.into(),
            state: state.into(),
        }
    }

    /// Replaces the serialized state.
    #[must_use]
    pub fn with_state(mut self, state: impl Into<Bytes>) -> Self {
        self.state = state.into();
        self
    }

    /// Moves the object under another parent.
    #[must_use]
    pub fn with_parent(mut self, parent: Option<Oid>) -> Self {
        self.parent_oid = parent;
        self
    }

    /// Stamps a serial, producing the persisted record.
    #[must_use]
    pub fn into_record(self, serial: Tid) -> ObjectRecord {
        ObjectRecord {
            oid: self.oid,
            serial,
            kind: self.kind,
            parent_oid: self.parent_oid,
            owner_oid: self.owner_oid,
            name: self.name,
            type_name: self.type_name,
            state: self.state,
        }
    }
}

/// A persisted object.
///
/// `serial` is the tid of the last committed transaction that changed
/// the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Identity of the object.
    pub oid: Oid,
    /// Tid of the last committed write.
    pub serial: Tid,
    /// Resource or sub-value.
    pub kind: ObjectKind,
    /// Parent in the tree (resources).
    pub parent_oid: Option<Oid>,
    /// Owning object (sub-values).
    pub owner_oid: Option<Oid>,
    /// Key under the parent or owner.
    pub name: Option<String>,
    /// Type of the stored value.
    pub type_name: String,
    /// Serialized state.
    pub state: Bytes,
}

impl ObjectRecord {
    /// The bootstrap root record.
    #[must_use]
    pub fn root() -> Self {
        Self {
            oid: Oid::ROOT,
            serial: Tid::ZERO,
            kind: ObjectKind::Resource,
            parent_oid: None,
            owner_oid: None,
            name: None,
            type_name: "Root".to_string(),
            state: Bytes::new(),
        }
    }

    /// Returns true for tree-resident objects.
    #[must_use]
    pub fn is_resource(&self) -> bool {
        self.kind == ObjectKind::Resource
    }

    /// The write that reproduces this record, for staging an update.
    #[must_use]
    pub fn to_write(&self) -> ObjectWrite {
        ObjectWrite {
            oid: self.oid,
            kind: self.kind,
            parent_oid: self.parent_oid,
            owner_oid: self.owner_oid,
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            state: self.state.clone(),
        }
    }

    /// Identity and placement only, as gathered by vacuum.
    #[must_use]
    pub fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            oid: self.oid,
            is_resource: self.is_resource(),
            parent_oid: self.parent_oid,
            owner_oid: self.owner_oid,
        }
    }
}

/// Identity and placement of an object without its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Identity of the object.
    pub oid: Oid,
    /// Resource or sub-value.
    pub is_resource: bool,
    /// Parent in the tree.
    pub parent_oid: Option<Oid>,
    /// Owning object.
    pub owner_oid: Option<Oid>,
}

/// A single stored blob chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobChunk {
    /// Object the blob belongs to.
    pub oid: Oid,
    /// Chunk bytes.
    pub data: Bytes,
}
