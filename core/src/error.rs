//! Public error type for chimera. Every variant is tagged with the entity
//! kind it concerns; errors raised during asynchronous operations are also
//! stashed on the query (`last_error`) and emitted on its event bus.

use std::sync::Arc;

use thiserror::Error;

use crate::entity::{EntityId, EntityName};

#[derive(Debug, Error, Clone)]
pub enum ChimeraError {
    /// Reading data from a query before its first publication.
    #[error("[{entity}] query has no data yet")]
    NotReady { entity: EntityName },

    /// Updating or mutating an item query in state `Deleted`.
    #[error("[{entity}] item {id} was deleted")]
    DeletedItem { entity: EntityName, id: EntityId },

    /// Any operation other than waiting on a query that is still creating.
    #[error("[{entity}] item has not been created yet")]
    NotCreated { entity: EntityName },

    /// The operation would cancel a running fetch/update/delete without `force`.
    #[error("[{entity}] another operation is already running")]
    AlreadyRunning { entity: EntityName },

    /// A local update supplied an entity whose id differs from the current one.
    #[error("[{entity}] update id {given} does not match current id {current}")]
    IdMismatch { entity: EntityName, current: EntityId, given: EntityId },

    /// The server returned an entity with a different id than requested.
    #[error("[{entity}] server returned id {returned}, expected {expected}")]
    TrustIdMismatch { entity: EntityName, expected: EntityId, returned: EntityId },

    /// A delete response reported `success = false`.
    #[error("[{entity}] server reported deletion of {id} as unsuccessful")]
    UnsuccessfulDeletion { entity: EntityName, id: EntityId },

    /// An underlying fetch/update/create callback rejected.
    #[error("[{entity}] fetch failed: {cause}")]
    FetchingError { entity: EntityName, cause: Arc<anyhow::Error> },

    /// An underlying delete callback rejected.
    #[error("[{entity}] delete failed: {cause}")]
    DeletingError { entity: EntityName, cause: Arc<anyhow::Error> },

    /// A trusted server collection diverges from the local filter/order.
    /// Only constructed on the dev-mode warning path.
    #[error("[{entity}] trusted server collection diverges from local filter/order at index {index}")]
    TrustFetchedCollection { entity: EntityName, index: usize },

    /// A filter referenced an operator missing from the operator set.
    #[error("[{entity}] {cause}")]
    UnknownOperator { entity: EntityName, cause: chimera_ql::QlError },

    /// The entity configuration lacks the requested callback.
    #[error("[{entity}] no `{operation}` callback configured")]
    NotSpecified { entity: EntityName, operation: &'static str },

    /// The operation was abandoned because a newer one replaced it.
    #[error("[{entity}] operation cancelled by a newer one")]
    Cancelled { entity: EntityName },

    /// Invariant violation.
    #[error("[{entity}] internal: {message}")]
    Internal { entity: EntityName, message: String },
}

impl ChimeraError {
    pub(crate) fn internal(entity: &EntityName, message: impl Into<String>) -> Self {
        Self::Internal { entity: entity.clone(), message: message.into() }
    }

    pub(crate) fn cancelled(entity: &EntityName) -> Self { Self::Cancelled { entity: entity.clone() } }

    pub(crate) fn not_ready(entity: &EntityName) -> Self { Self::NotReady { entity: entity.clone() } }

    /// The entity kind this error concerns.
    pub fn entity(&self) -> &str {
        match self {
            Self::NotReady { entity }
            | Self::DeletedItem { entity, .. }
            | Self::NotCreated { entity }
            | Self::AlreadyRunning { entity }
            | Self::IdMismatch { entity, .. }
            | Self::TrustIdMismatch { entity, .. }
            | Self::UnsuccessfulDeletion { entity, .. }
            | Self::FetchingError { entity, .. }
            | Self::DeletingError { entity, .. }
            | Self::TrustFetchedCollection { entity, .. }
            | Self::UnknownOperator { entity, .. }
            | Self::NotSpecified { entity, .. }
            | Self::Cancelled { entity }
            | Self::Internal { entity, .. } => entity,
        }
    }
}
