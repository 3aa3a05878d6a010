//! Changes propagated between the live queries of a repository.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::entity::EntityId;

/// Identifies the query that originated a change so propagation can skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct QueryToken(u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

impl QueryToken {
    pub fn next() -> Self { Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)) }
}

/// One entity-level change flowing through a repository.
#[derive(Debug, Clone)]
pub enum EntityChange<E> {
    /// The entity was created or replaced by a newer record.
    Upsert { id: EntityId, entity: Arc<E> },
    /// The entity was deleted.
    Remove { id: EntityId },
}

impl<E> EntityChange<E> {
    pub fn id(&self) -> &EntityId {
        match self {
            EntityChange::Upsert { id, .. } | EntityChange::Remove { id } => id,
        }
    }
}

/// Called by a query after it publishes new state, before it emits its own
/// events. The repository installs this to run index updates and cross-view
/// fan-out; the token identifies the originator so it is skipped.
pub(crate) type PublishHook<E> = Arc<dyn Fn(QueryToken, &[EntityChange<E>]) + Send + Sync>;
