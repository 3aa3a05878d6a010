//! The data-source seam between the cache and the embedder's remote provider.
//!
//! [`DataSource`] is the typed per-entity surface; every method has a default
//! body failing with [`SourceError::NotSpecified`], so embedders implement
//! only what they use. [`SharedSource`] is the store-wide fallback working in
//! `serde_json::Value`; per-entity sources that omit a callback are routed to
//! it with the entity name (carried by the request context).

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use chimera_ql::{Filter, OrderBy};

use crate::entity::{EntityId, EntityName, EntityRecord, Meta};
use crate::task::AbortSignal;

/// Handed to every data-source call: the abort signal for the wrapped
/// operation and the entity kind being served.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub signal: AbortSignal,
    pub entity: EntityName,
}

/// Parameters of a single-item fetch.
#[derive(Debug, Clone)]
pub struct ItemParams {
    pub id: EntityId,
    pub meta: Meta,
}

/// Parameters of a collection query: filter, order, and opaque meta.
#[derive(Debug, Clone, Default)]
pub struct CollectionParams {
    pub filter: Option<Filter>,
    pub order: OrderBy,
    pub meta: Meta,
}

impl CollectionParams {
    pub fn all() -> Self { Self::default() }

    pub fn new(filter: Option<Filter>, order: OrderBy) -> Self { Self { filter, order, meta: Meta::none() } }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    /// Canonical cache key: filter and order keys plus the meta identity.
    pub(crate) fn cache_key(&self) -> String {
        format!("{}|{}|{:x}", chimera_ql::canonical_key(self.filter.as_ref()), self.order.canonical_key(), self.meta.identity())
    }
}

#[derive(Debug, Clone)]
pub struct ItemResponse<E> {
    pub data: E,
    pub meta: Option<serde_json::Value>,
}

impl<E> From<E> for ItemResponse<E> {
    fn from(data: E) -> Self { Self { data, meta: None } }
}

#[derive(Debug, Clone)]
pub struct CollectionResponse<E> {
    pub data: Vec<E>,
    pub meta: Option<serde_json::Value>,
}

impl<E> From<Vec<E>> for CollectionResponse<E> {
    fn from(data: Vec<E>) -> Self { Self { data, meta: None } }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteResult {
    pub id: EntityId,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct DeleteResponse {
    pub result: DeleteResult,
    pub meta: Option<serde_json::Value>,
}

impl From<DeleteResult> for DeleteResponse {
    fn from(result: DeleteResult) -> Self { Self { result, meta: None } }
}

#[derive(Debug, Clone)]
pub struct BatchDeleteResponse {
    pub result: Vec<DeleteResult>,
    pub meta: Option<serde_json::Value>,
}

impl From<Vec<DeleteResult>> for BatchDeleteResponse {
    fn from(result: Vec<DeleteResult>) -> Self { Self { result, meta: None } }
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// The callback is not implemented by this source.
    #[error("callback not implemented")]
    NotSpecified,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Typed per-entity callbacks. All default bodies fail with `NotSpecified`.
#[async_trait]
pub trait DataSource<E: EntityRecord>: Send + Sync {
    async fn fetch_collection(&self, params: CollectionParams, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        let _ = (params, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn fetch_item(&self, params: ItemParams, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        let _ = (params, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn update_item(&self, entity: E, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        let _ = (entity, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn update_many(&self, entities: Vec<E>, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        let _ = (entities, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn delete_item(&self, id: EntityId, ctx: RequestContext) -> Result<DeleteResponse, SourceError> {
        let _ = (id, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn delete_many(&self, ids: Vec<EntityId>, ctx: RequestContext) -> Result<BatchDeleteResponse, SourceError> {
        let _ = (ids, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn create_item(&self, draft: E, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        let _ = (draft, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn create_many(&self, drafts: Vec<E>, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        let _ = (drafts, ctx);
        Err(SourceError::NotSpecified)
    }
}

#[async_trait]
impl<E: EntityRecord, S: DataSource<E> + ?Sized> DataSource<E> for Arc<S> {
    async fn fetch_collection(&self, params: CollectionParams, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        (**self).fetch_collection(params, ctx).await
    }

    async fn fetch_item(&self, params: ItemParams, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        (**self).fetch_item(params, ctx).await
    }

    async fn update_item(&self, entity: E, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        (**self).update_item(entity, ctx).await
    }

    async fn update_many(&self, entities: Vec<E>, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        (**self).update_many(entities, ctx).await
    }

    async fn delete_item(&self, id: EntityId, ctx: RequestContext) -> Result<DeleteResponse, SourceError> {
        (**self).delete_item(id, ctx).await
    }

    async fn delete_many(&self, ids: Vec<EntityId>, ctx: RequestContext) -> Result<BatchDeleteResponse, SourceError> {
        (**self).delete_many(ids, ctx).await
    }

    async fn create_item(&self, draft: E, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        (**self).create_item(draft, ctx).await
    }

    async fn create_many(&self, drafts: Vec<E>, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        (**self).create_many(drafts, ctx).await
    }
}

/// Store-wide fallback source, routed by entity name and speaking JSON.
#[async_trait]
pub trait SharedSource: Send + Sync {
    async fn fetch_collection(
        &self,
        entity: &str,
        params: CollectionParams,
        ctx: RequestContext,
    ) -> Result<CollectionResponse<serde_json::Value>, SourceError> {
        let _ = (entity, params, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn fetch_item(&self, entity: &str, params: ItemParams, ctx: RequestContext) -> Result<ItemResponse<serde_json::Value>, SourceError> {
        let _ = (entity, params, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn update_item(
        &self,
        entity: &str,
        value: serde_json::Value,
        ctx: RequestContext,
    ) -> Result<ItemResponse<serde_json::Value>, SourceError> {
        let _ = (entity, value, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn update_many(
        &self,
        entity: &str,
        values: Vec<serde_json::Value>,
        ctx: RequestContext,
    ) -> Result<CollectionResponse<serde_json::Value>, SourceError> {
        let _ = (entity, values, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn delete_item(&self, entity: &str, id: EntityId, ctx: RequestContext) -> Result<DeleteResponse, SourceError> {
        let _ = (entity, id, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn delete_many(&self, entity: &str, ids: Vec<EntityId>, ctx: RequestContext) -> Result<BatchDeleteResponse, SourceError> {
        let _ = (entity, ids, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn create_item(
        &self,
        entity: &str,
        draft: serde_json::Value,
        ctx: RequestContext,
    ) -> Result<ItemResponse<serde_json::Value>, SourceError> {
        let _ = (entity, draft, ctx);
        Err(SourceError::NotSpecified)
    }

    async fn create_many(
        &self,
        entity: &str,
        drafts: Vec<serde_json::Value>,
        ctx: RequestContext,
    ) -> Result<CollectionResponse<serde_json::Value>, SourceError> {
        let _ = (entity, drafts, ctx);
        Err(SourceError::NotSpecified)
    }
}

/// A source with nothing implemented; every operation reports `NotSpecified`.
pub(crate) struct UnspecifiedSource;

impl<E: EntityRecord> DataSource<E> for UnspecifiedSource {}

fn decode<E: DeserializeOwned>(value: serde_json::Value) -> Result<E, SourceError> {
    serde_json::from_value(value).map_err(|e| SourceError::Other(anyhow::Error::new(e).context("decoding shared source response")))
}

fn encode<E: Serialize>(entity: &E) -> Result<serde_json::Value, SourceError> {
    serde_json::to_value(entity).map_err(|e| SourceError::Other(anyhow::Error::new(e).context("encoding entity for shared source")))
}

/// Adapts the store-wide [`SharedSource`] into a typed [`DataSource`] for one
/// entity kind. The entity name is taken from the request context.
pub(crate) struct SharedSourceAdapter<E> {
    shared: Arc<dyn SharedSource>,
    _marker: PhantomData<fn() -> E>,
}

impl<E> SharedSourceAdapter<E> {
    pub fn new(shared: Arc<dyn SharedSource>) -> Self { Self { shared, _marker: PhantomData } }
}

#[async_trait]
impl<E> DataSource<E> for SharedSourceAdapter<E>
where E: EntityRecord + Serialize + DeserializeOwned
{
    async fn fetch_collection(&self, params: CollectionParams, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        let entity = ctx.entity.clone();
        let resp = self.shared.fetch_collection(&entity, params, ctx).await?;
        let data = resp.data.into_iter().map(decode).collect::<Result<Vec<E>, _>>()?;
        Ok(CollectionResponse { data, meta: resp.meta })
    }

    async fn fetch_item(&self, params: ItemParams, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        let entity = ctx.entity.clone();
        let resp = self.shared.fetch_item(&entity, params, ctx).await?;
        Ok(ItemResponse { data: decode(resp.data)?, meta: resp.meta })
    }

    async fn update_item(&self, value: E, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        let entity = ctx.entity.clone();
        let resp = self.shared.update_item(&entity, encode(&value)?, ctx).await?;
        Ok(ItemResponse { data: decode(resp.data)?, meta: resp.meta })
    }

    async fn update_many(&self, values: Vec<E>, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        let entity = ctx.entity.clone();
        let encoded = values.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
        let resp = self.shared.update_many(&entity, encoded, ctx).await?;
        let data = resp.data.into_iter().map(decode).collect::<Result<Vec<E>, _>>()?;
        Ok(CollectionResponse { data, meta: resp.meta })
    }

    async fn delete_item(&self, id: EntityId, ctx: RequestContext) -> Result<DeleteResponse, SourceError> {
        let entity = ctx.entity.clone();
        self.shared.delete_item(&entity, id, ctx).await
    }

    async fn delete_many(&self, ids: Vec<EntityId>, ctx: RequestContext) -> Result<BatchDeleteResponse, SourceError> {
        let entity = ctx.entity.clone();
        self.shared.delete_many(&entity, ids, ctx).await
    }

    async fn create_item(&self, draft: E, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        let entity = ctx.entity.clone();
        let resp = self.shared.create_item(&entity, encode(&draft)?, ctx).await?;
        Ok(ItemResponse { data: decode(resp.data)?, meta: resp.meta })
    }

    async fn create_many(&self, drafts: Vec<E>, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        let entity = ctx.entity.clone();
        let encoded = drafts.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
        let resp = self.shared.create_many(&entity, encoded, ctx).await?;
        let data = resp.data.into_iter().map(decode).collect::<Result<Vec<E>, _>>()?;
        Ok(CollectionResponse { data, meta: resp.meta })
    }
}

/// Tries the per-entity source first and falls back to the shared adapter
/// whenever a callback is not implemented.
pub(crate) struct FallbackSource<E> {
    pub primary: Arc<dyn DataSource<E>>,
    pub fallback: Arc<dyn DataSource<E>>,
}

macro_rules! with_fallback {
    ($self:ident, $method:ident, $arg:expr, $ctx:expr) => {{
        let ctx = $ctx;
        match $self.primary.$method($arg.clone(), ctx.clone()).await {
            Err(SourceError::NotSpecified) => $self.fallback.$method($arg, ctx).await,
            other => other,
        }
    }};
}

#[async_trait]
impl<E: EntityRecord> DataSource<E> for FallbackSource<E> {
    async fn fetch_collection(&self, params: CollectionParams, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        with_fallback!(self, fetch_collection, params, ctx)
    }

    async fn fetch_item(&self, params: ItemParams, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        with_fallback!(self, fetch_item, params, ctx)
    }

    async fn update_item(&self, entity: E, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        with_fallback!(self, update_item, entity, ctx)
    }

    async fn update_many(&self, entities: Vec<E>, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        with_fallback!(self, update_many, entities, ctx)
    }

    async fn delete_item(&self, id: EntityId, ctx: RequestContext) -> Result<DeleteResponse, SourceError> {
        with_fallback!(self, delete_item, id, ctx)
    }

    async fn delete_many(&self, ids: Vec<EntityId>, ctx: RequestContext) -> Result<BatchDeleteResponse, SourceError> {
        with_fallback!(self, delete_many, ids, ctx)
    }

    async fn create_item(&self, draft: E, ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        with_fallback!(self, create_item, draft, ctx)
    }

    async fn create_many(&self, drafts: Vec<E>, ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        with_fallback!(self, create_many, drafts, ctx)
    }
}
