//! Read-only snapshot of a collection's current sequence.

use std::sync::Arc;

use serde::Serialize;

use crate::entity::{EntityId, EntityRecord};

/// An ordered snapshot of entities. Derefs to `[Arc<E>]`, so the whole std
/// slice and iterator toolbox (`iter`, `first`, `last`, `windows`, `map`,
/// `filter`, folds, ...) applies directly; the methods here add the
/// semantics slices don't have: negative indexing, by-id lookup, and
/// deep-cloned mutable accessors.
#[derive(Debug, Clone)]
pub struct Items<E> {
    pub(crate) ids: Vec<EntityId>,
    pub(crate) items: Vec<Arc<E>>,
}

impl<E> std::ops::Deref for Items<E> {
    type Target = [Arc<E>];

    fn deref(&self) -> &Self::Target { &self.items }
}

impl<E> Items<E> {
    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Indexed access; negative indices wrap from the end.
    pub fn at(&self, index: isize) -> Option<&Arc<E>> {
        let len = self.items.len() as isize;
        let index = if index < 0 { index + len } else { index };
        if (0..len).contains(&index) {
            self.items.get(index as usize)
        } else {
            None
        }
    }

    pub fn ids(&self) -> &[EntityId] { &self.ids }

    pub fn index_of(&self, id: &EntityId) -> Option<usize> { self.ids.iter().position(|i| i == id) }

    pub fn get_by_id(&self, id: &EntityId) -> Option<&Arc<E>> { self.index_of(id).and_then(|i| self.items.get(i)) }

    pub fn to_vec(&self) -> Vec<Arc<E>> { self.items.clone() }
}

impl<E: EntityRecord> Items<E> {
    /// A deep clone of the entity at `index`, free to edit.
    pub fn mutable_at(&self, index: isize) -> Option<E> { self.at(index).map(|e| (**e).clone()) }

    /// A deep clone of the entity with this id, free to edit.
    pub fn mutable_by_id(&self, id: &EntityId) -> Option<E> { self.get_by_id(id).map(|e| (**e).clone()) }
}

impl<E: Serialize> Items<E> {
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self.items.iter().map(|e| &**e).collect::<Vec<_>>())
    }
}

impl<'a, E> IntoIterator for &'a Items<E> {
    type Item = &'a Arc<E>;
    type IntoIter = std::slice::Iter<'a, Arc<E>>;

    fn into_iter(self) -> Self::IntoIter { self.items.iter() }
}
