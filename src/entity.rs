//! Capabilities shared by persisted domain objects.
//!
//! Entities opt into indexing by implementing [`Indexable`]; the persistence
//! layer only sees [`Persistent`] and asks it whether an indexable view
//! exists.

use std::{any::Any, fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a persisted entity. Unique within one entity kind only.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A small closed enumeration exposed as a property (status, priority...).
pub trait Style {
    fn name(&self) -> &'static str;
}

/// A scalar property value read from an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Style(&'static str),
}

impl PropertyValue {
    pub fn style(value: impl Style) -> Self {
        Self::Style(value.name())
    }

    /// The string form stored in an index document.
    pub fn encode(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Integer(n) => n.to_string(),
            Self::Float(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Timestamp(t) => t.to_rfc3339(),
            Self::Style(name) => (*name).to_string(),
        }
    }
}

/// How a property is indexed. `Text` is analyzed; the others are typed
/// fields that support exact matches and ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FieldKind {
    #[default]
    Text,
    Integer,
    Float,
    Date,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Date => "date",
        })
    }
}

/// Rust types a mapping rule can return, with the field kind they index as.
pub trait FieldValue: Into<PropertyValue> {
    const KIND: FieldKind;
}

macro_rules! field_value {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl FieldValue for $ty {
            const KIND: FieldKind = FieldKind::$kind;
        })*
    };
}

field_value! {
    String => Text,
    &str => Text,
    bool => Text,
    EntityId => Text,
    PropertyValue => Text,
    i64 => Integer,
    f64 => Float,
    DateTime<Utc> => Date,
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<EntityId> for PropertyValue {
    fn from(value: EntityId) -> Self {
        Self::Text(value.to_string())
    }
}

/// An entity that can be projected into an index document.
pub trait Indexable: Any + Send + Sync + fmt::Debug {
    /// `None` while the entity has not been saved yet.
    fn entity_id(&self) -> Option<EntityId>;

    /// Lowercase kind name, used as the `class` field of the document.
    fn class_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

/// Soft deletion support for entities that go to the trash first.
pub trait Trashable {
    fn is_deleted(&self) -> bool;

    fn set_deleted(&mut self, deleted: bool);

    /// Detach the entity from whatever references it before it is trashed.
    fn prepare_for_deletion(&mut self) {}
}

/// Anything the persistence layer stores and reports lifecycle events for.
pub trait Persistent: Any + Send + Sync + fmt::Debug {
    /// The indexable view of this object, if it has one.
    fn into_indexable(self: Arc<Self>) -> Option<Arc<dyn Indexable>> {
        None
    }
}
