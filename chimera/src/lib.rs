//! # Chimera
//!
//! A client-side reactive entity cache and query layer that sits between a
//! typed domain model and a remote data provider.
//!
//! Applications declare entity kinds on a [`Store`] (an identity getter plus
//! a set of fetch/mutate callbacks) and obtain two kinds of live views from
//! the per-kind [`Repository`]:
//!
//! - [`ItemQuery`] - a handle to a single entity by id, tracking fetch,
//!   update, and delete lifecycles, with a mutable draft for staged edits.
//! - [`CollectionQuery`] - a handle to an ordered, filtered multiset of
//!   entities of one kind, kept consistent locally as items mutate anywhere
//!   in the same repository.
//!
//! Filter and order descriptors live in [`ql`]: tagged descriptor trees,
//! predicate compilation against an open operator set, canonical cache keys,
//! and a conservative subset check used to seed new collections from
//! already-loaded ones.

pub use chimera_core::*;
pub use chimera_ql as ql;
