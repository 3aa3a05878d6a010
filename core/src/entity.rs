//! Entity identity and the opaque `meta` payload.
//!
//! Entities themselves are embedder types: anything [`Filterable`] (the
//! trait impl is the field getter), cloneable, and shareable. Published
//! entities travel as `Arc<E>`, shared immutable ownership, so cached state
//! can never be edited in place; the mutable draft is a separate deep clone.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use chimera_ql::{Filterable, Value};

use crate::error::ChimeraError;

pub type EntityName = Arc<str>;

/// Blanket trait for records the cache can manage.
pub trait EntityRecord: Filterable + Clone + std::fmt::Debug + Send + Sync + 'static {}

impl<T: Filterable + Clone + std::fmt::Debug + Send + Sync + 'static> EntityRecord for T {}

/// Primary key of an entity: string or integer, total equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    String(String),
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Int(i) => write!(f, "{i}"),
            EntityId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for EntityId {
    fn from(i: i64) -> Self { EntityId::Int(i) }
}
impl From<i32> for EntityId {
    fn from(i: i32) -> Self { EntityId::Int(i as i64) }
}
impl From<&str> for EntityId {
    fn from(s: &str) -> Self { EntityId::String(s.to_owned()) }
}
impl From<String> for EntityId {
    fn from(s: String) -> Self { EntityId::String(s) }
}

impl TryFrom<Value> for EntityId {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Value> {
        match value {
            Value::String(s) => Ok(EntityId::String(s)),
            Value::I64(i) => Ok(EntityId::Int(i)),
            other => Err(other),
        }
    }
}

/// Resolves the identity of an entity: either a field key looked up through
/// [`Filterable`], or an embedder-supplied function.
pub enum IdGetter<E> {
    Field(String),
    Func(Arc<dyn Fn(&E) -> EntityId + Send + Sync>),
}

impl<E> Clone for IdGetter<E> {
    fn clone(&self) -> Self {
        match self {
            IdGetter::Field(key) => IdGetter::Field(key.clone()),
            IdGetter::Func(f) => IdGetter::Func(f.clone()),
        }
    }
}

impl<E> Default for IdGetter<E> {
    fn default() -> Self { IdGetter::Field("id".to_owned()) }
}

impl<E> std::fmt::Debug for IdGetter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdGetter::Field(key) => f.debug_tuple("Field").field(key).finish(),
            IdGetter::Func(_) => f.write_str("Func(..)"),
        }
    }
}

impl<E: EntityRecord> IdGetter<E> {
    pub fn extract(&self, entity: &E, name: &EntityName) -> Result<EntityId, ChimeraError> {
        match self {
            IdGetter::Func(f) => Ok((**f)(entity)),
            IdGetter::Field(key) => {
                let value = entity
                    .value(key)
                    .ok_or_else(|| ChimeraError::internal(name, format!("entity has no value for id field `{key}`")))?;
                value.try_into().map_err(|v| ChimeraError::internal(name, format!("id field `{key}` holds non-identifier value {v:?}")))
            }
        }
    }
}

/// Opaque embedder data carried verbatim to fetch callbacks. Compared by
/// identity for cache keying, so reuse the same `Meta` for repeated queries.
#[derive(Clone, Default)]
pub struct Meta(Option<Arc<dyn Any + Send + Sync>>);

impl Meta {
    pub fn none() -> Self { Self(None) }

    pub fn new(value: impl Any + Send + Sync) -> Self { Self(Some(Arc::new(value))) }

    pub fn get<T: Any>(&self) -> Option<&T> { self.0.as_ref().and_then(|any| any.downcast_ref()) }

    pub fn is_none(&self) -> bool { self.0.is_none() }

    /// Identity of the payload, used as a cache key component.
    pub(crate) fn identity(&self) -> usize {
        match &self.0 {
            None => 0,
            Some(any) => Arc::as_ptr(any) as *const () as usize,
        }
    }
}

impl std::fmt::Debug for Meta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            None => f.write_str("Meta(None)"),
            Some(_) => write!(f, "Meta(@{:x})", self.identity()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_from_value() {
        assert_eq!(EntityId::try_from(Value::String("x".into())), Ok(EntityId::String("x".into())));
        assert_eq!(EntityId::try_from(Value::I64(7)), Ok(EntityId::Int(7)));
        assert!(EntityId::try_from(Value::Bool(true)).is_err());
    }

    #[test]
    fn meta_identity_is_per_allocation() {
        let a = Meta::new(42u32);
        let b = a.clone();
        let c = Meta::new(42u32);
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
        assert_eq!(Meta::none().identity(), 0);
        assert_eq!(a.get::<u32>(), Some(&42));
    }
}
