//! Collection query: an ordered, filtered multiset of entities, kept
//! consistent locally as items mutate anywhere in the repository.
//!
//! Every mutation path funnels through the same membership protocol: decide
//! whether the affected item belongs (predicate), whether it moved
//! (comparator), and patch the sequence in place, emitting item-level events
//! for exactly what changed.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tracing::warn;

use chimera_ql::{Comparator, Predicate};

use crate::changes::{EntityChange, PublishHook, QueryToken};
use crate::config::EntityConfig;
use crate::entity::{EntityId, EntityName, EntityRecord};
use crate::error::ChimeraError;
use crate::event::{EventBus, Events};
use crate::resultset::Items;
use crate::source::{CollectionParams, RequestContext, SourceError};
use crate::state::QueryState;
use crate::task::{self, Operation};

#[derive(Debug, Clone)]
pub enum CollectionEvent<E> {
    Initialized,
    Ready,
    Updated,
    SelfUpdated,
    SelfItemCreated { item: Arc<E> },
    ItemAdded { item: Arc<E> },
    ItemUpdated { item: Arc<E> },
    SelfItemUpdated { item: Arc<E> },
    ItemDeleted { id: EntityId },
    SelfItemDeleted { id: EntityId },
    Error { error: ChimeraError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionEventKind {
    Initialized,
    Ready,
    Updated,
    SelfUpdated,
    SelfItemCreated,
    ItemAdded,
    ItemUpdated,
    SelfItemUpdated,
    ItemDeleted,
    SelfItemDeleted,
    Error,
}

impl<E> CollectionEvent<E> {
    pub fn kind(&self) -> CollectionEventKind {
        match self {
            CollectionEvent::Initialized => CollectionEventKind::Initialized,
            CollectionEvent::Ready => CollectionEventKind::Ready,
            CollectionEvent::Updated => CollectionEventKind::Updated,
            CollectionEvent::SelfUpdated => CollectionEventKind::SelfUpdated,
            CollectionEvent::SelfItemCreated { .. } => CollectionEventKind::SelfItemCreated,
            CollectionEvent::ItemAdded { .. } => CollectionEventKind::ItemAdded,
            CollectionEvent::ItemUpdated { .. } => CollectionEventKind::ItemUpdated,
            CollectionEvent::SelfItemUpdated { .. } => CollectionEventKind::SelfItemUpdated,
            CollectionEvent::ItemDeleted { .. } => CollectionEventKind::ItemDeleted,
            CollectionEvent::SelfItemDeleted { .. } => CollectionEventKind::SelfItemDeleted,
            CollectionEvent::Error { .. } => CollectionEventKind::Error,
        }
    }
}

/// The current sequence: ids and entities kept in lockstep.
struct Seq<E> {
    ids: Vec<EntityId>,
    items: Vec<Arc<E>>,
}

impl<E> Seq<E> {
    fn position(&self, id: &EntityId) -> Option<usize> { self.ids.iter().position(|i| i == id) }
}

struct CollectionCell<E> {
    state: QueryState,
    seq: Option<Seq<E>>,
    op: Option<Arc<Operation>>,
    last_error: Option<ChimeraError>,
}

pub(crate) struct CollectionInner<E: EntityRecord> {
    config: Arc<EntityConfig<E>>,
    params: CollectionParams,
    predicate: Predicate,
    comparator: Comparator,
    token: QueryToken,
    cell: Mutex<CollectionCell<E>>,
    events: EventBus<CollectionEvent<E>>,
    hook: Option<PublishHook<E>>,
    settled: Notify,
}

pub struct CollectionQuery<E: EntityRecord>(Arc<CollectionInner<E>>);

impl<E: EntityRecord> Clone for CollectionQuery<E> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<E: EntityRecord> std::fmt::Debug for CollectionQuery<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionQuery").field("entity_name", &self.0.config.name).finish()
    }
}

pub struct WeakCollectionQuery<E: EntityRecord>(Weak<CollectionInner<E>>);

impl<E: EntityRecord> Clone for WeakCollectionQuery<E> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<E: EntityRecord> WeakCollectionQuery<E> {
    pub fn upgrade(&self) -> Option<CollectionQuery<E>> { self.0.upgrade().map(CollectionQuery) }
}

impl<E: EntityRecord> CollectionQuery<E> {
    /// Construct with optional seed. A seed with `already_valid = false` (or
    /// trust mode off) is filtered and sorted locally; in trust+dev mode a
    /// pre-validated seed is verified against the local configuration and
    /// kept verbatim, warning on the first divergence. Without a seed the
    /// fetch starts immediately.
    pub(crate) fn new(
        config: Arc<EntityConfig<E>>,
        params: CollectionParams,
        seed: Option<Vec<Arc<E>>>,
        already_valid: bool,
        hook: Option<PublishHook<E>>,
    ) -> Result<Self, ChimeraError> {
        let predicate = Predicate::compile(params.filter.as_ref(), &config.operators)
            .map_err(|cause| ChimeraError::UnknownOperator { entity: config.name.clone(), cause })?;
        let comparator = Comparator::compile(&params.order);

        let (cell, op) = if seed.is_some() {
            (CollectionCell { state: QueryState::Prefetched, seq: None, op: None, last_error: None }, None)
        } else {
            let op = Operation::new();
            (CollectionCell { state: QueryState::Fetching, seq: None, op: Some(op.clone()), last_error: None }, Some(op))
        };

        let query = Self(Arc::new(CollectionInner {
            config,
            params,
            predicate,
            comparator,
            token: QueryToken::next(),
            cell: Mutex::new(cell),
            events: EventBus::new(),
            hook,
            settled: Notify::new(),
        }));
        query.0.events.emit(CollectionEvent::Initialized);
        seed_or_fetch(&query, seed, already_valid, op)?;
        Ok(query)
    }

    // --- public operations ---

    /// Cancel any pending work and fetch the whole collection afresh.
    pub async fn refetch(&self, force: bool) -> Result<Items<E>, ChimeraError> {
        let name = self.name().clone();
        let (op, prev) = {
            let mut cell = self.0.cell.lock().expect("collection query lock");
            if cell.op.is_some() && !force {
                return Err(ChimeraError::AlreadyRunning { entity: name });
            }
            let state = if cell.seq.is_some() { QueryState::Refetching } else { QueryState::Fetching };
            install_op(&mut cell, state)
        };
        if let Some(prev) = prev {
            prev.cancel();
        }

        let me = self.clone();
        let params = self.0.params.clone();
        self.run(async move {
            let ctx = me.request_context(&op);
            match task::abortable(&op.signal(), me.0.config.source.fetch_collection(params, ctx)).await {
                None => Err(ChimeraError::cancelled(me.name())),
                Some(Ok(resp)) => me.publish_fetched(op.id(), resp.data),
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "fetch_collection", false);
                    Err(me.fail(op.id(), err))
                }
            }
        })
        .await
    }

    /// Update one member through the data source and re-evaluate its
    /// membership and position from the response.
    pub async fn update(&self, item: E) -> Result<(), ChimeraError> {
        let requested = self.0.config.id_getter.extract(&item, self.name())?;
        let op = self.begin_mutation(QueryState::Updating)?;

        let me = self.clone();
        self.run(async move {
            let ctx = me.request_context(&op);
            match task::abortable(&op.signal(), me.0.config.source.update_item(item, ctx)).await {
                None => Err(ChimeraError::cancelled(me.name())),
                Some(Ok(resp)) => me.publish_upserts(op.id(), vec![resp.data], Some(requested), SelfCause::Updated),
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "update_item", false);
                    Err(me.fail(op.id(), err))
                }
            }
        })
        .await
    }

    /// Update many members in one round trip.
    pub async fn batched_update(&self, items: Vec<E>) -> Result<(), ChimeraError> {
        let op = self.begin_mutation(QueryState::Updating)?;

        let me = self.clone();
        self.run(async move {
            let ctx = me.request_context(&op);
            match task::abortable(&op.signal(), me.0.config.source.update_many(items, ctx)).await {
                None => Err(ChimeraError::cancelled(me.name())),
                Some(Ok(resp)) => me.publish_upserts(op.id(), resp.data, None, SelfCause::Updated),
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "update_many", false);
                    Err(me.fail(op.id(), err))
                }
            }
        })
        .await
    }

    /// Create a new member; the server response decides identity, membership
    /// and position.
    pub async fn create(&self, draft: E) -> Result<(), ChimeraError> {
        let op = self.begin_mutation(QueryState::Updating)?;

        let me = self.clone();
        self.run(async move {
            let ctx = me.request_context(&op);
            match task::abortable(&op.signal(), me.0.config.source.create_item(draft, ctx)).await {
                None => Err(ChimeraError::cancelled(me.name())),
                Some(Ok(resp)) => me.publish_upserts(op.id(), vec![resp.data], None, SelfCause::Created),
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "create_item", false);
                    Err(me.fail(op.id(), err))
                }
            }
        })
        .await
    }

    /// Create many members in one round trip.
    pub async fn batched_create(&self, drafts: Vec<E>) -> Result<(), ChimeraError> {
        let op = self.begin_mutation(QueryState::Updating)?;

        let me = self.clone();
        self.run(async move {
            let ctx = me.request_context(&op);
            match task::abortable(&op.signal(), me.0.config.source.create_many(drafts, ctx)).await {
                None => Err(ChimeraError::cancelled(me.name())),
                Some(Ok(resp)) => me.publish_upserts(op.id(), resp.data, None, SelfCause::Created),
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "create_many", false);
                    Err(me.fail(op.id(), err))
                }
            }
        })
        .await
    }

    /// Delete one member through the data source.
    pub async fn delete(&self, id: EntityId) -> Result<(), ChimeraError> {
        let op = self.begin_mutation(QueryState::Deleting)?;

        let me = self.clone();
        self.run(async move {
            let ctx = me.request_context(&op);
            let requested = id.clone();
            match task::abortable(&op.signal(), me.0.config.source.delete_item(id, ctx)).await {
                None => Err(ChimeraError::cancelled(me.name())),
                Some(Ok(resp)) => {
                    let result = resp.result;
                    if !result.success {
                        let err = ChimeraError::UnsuccessfulDeletion { entity: me.name().clone(), id: result.id };
                        return Err(me.fail(op.id(), err));
                    }
                    if let Err(err) = me.validate_returned_id(&requested, &result.id) {
                        return Err(me.fail(op.id(), err));
                    }
                    me.publish_deletions(op.id(), vec![result.id], None)
                }
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "delete_item", true);
                    Err(me.fail(op.id(), err))
                }
            }
        })
        .await
    }

    /// Delete many members. Every id the server confirms is removed; any
    /// `success = false` then moves the collection to `ReErrored` and fails
    /// the call.
    pub async fn batched_delete(&self, ids: Vec<EntityId>) -> Result<(), ChimeraError> {
        let op = self.begin_mutation(QueryState::Deleting)?;

        let me = self.clone();
        self.run(async move {
            let ctx = me.request_context(&op);
            match task::abortable(&op.signal(), me.0.config.source.delete_many(ids, ctx)).await {
                None => Err(ChimeraError::cancelled(me.name())),
                Some(Ok(resp)) => {
                    let mut deleted = Vec::new();
                    let mut failed = None;
                    for result in resp.result {
                        if result.success {
                            deleted.push(result.id);
                        } else if failed.is_none() {
                            failed = Some(result.id);
                        }
                    }
                    me.publish_deletions(op.id(), deleted, failed)
                }
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "delete_many", true);
                    Err(me.fail(op.id(), err))
                }
            }
        })
        .await
    }

    // --- inbound from the repository (no network calls) ---

    pub(crate) fn apply_changes(&self, changes: &[EntityChange<E>]) -> Result<(), ChimeraError> {
        let events = {
            let mut cell = self.0.cell.lock().expect("collection query lock");
            let Some(seq) = cell.seq.as_mut() else {
                return Err(ChimeraError::internal(self.name(), "external change applied to a collection with no data"));
            };
            let mut events = Vec::new();
            for change in changes {
                match change {
                    EntityChange::Upsert { entity, .. } => self.upsert_into(seq, entity.clone(), &mut events),
                    EntityChange::Remove { id } => self.remove_from(seq, id, &mut events),
                }
            }
            events
        };
        if !events.is_empty() {
            for event in events {
                self.0.events.emit(event);
            }
            self.0.events.emit(CollectionEvent::Updated);
        }
        Ok(())
    }

    // --- read surface; every accessor fails with `NotReady` before the
    //     first publication ---

    pub fn read(&self) -> Result<Items<E>, ChimeraError> {
        let cell = self.0.cell.lock().expect("collection query lock");
        match &cell.seq {
            Some(seq) => Ok(Items { ids: seq.ids.clone(), items: seq.items.clone() }),
            None => Err(ChimeraError::not_ready(self.name())),
        }
    }

    pub fn len(&self) -> Result<usize, ChimeraError> { Ok(self.read()?.len()) }

    pub fn is_empty(&self) -> Result<bool, ChimeraError> { Ok(self.read()?.is_empty()) }

    /// Indexed access; negative indices wrap from the end.
    pub fn at(&self, index: isize) -> Result<Option<Arc<E>>, ChimeraError> { Ok(self.read()?.at(index).cloned()) }

    pub fn get_by_id(&self, id: &EntityId) -> Result<Option<Arc<E>>, ChimeraError> { Ok(self.read()?.get_by_id(id).cloned()) }

    /// Deep-cloned copy by index, free to edit and pass to [`Self::update`].
    pub fn mutable_at(&self, index: isize) -> Result<Option<E>, ChimeraError> { Ok(self.read()?.mutable_at(index)) }

    /// Deep-cloned copy by id.
    pub fn mutable_by_id(&self, id: &EntityId) -> Result<Option<E>, ChimeraError> { Ok(self.read()?.mutable_by_id(id)) }

    pub fn state(&self) -> QueryState { self.0.cell.lock().expect("collection query lock").state }

    pub fn ready(&self) -> bool { self.0.cell.lock().expect("collection query lock").seq.is_some() }

    pub fn params(&self) -> &CollectionParams { &self.0.params }

    pub fn entity_name(&self) -> &str { &self.0.config.name }

    pub fn last_error(&self) -> Option<ChimeraError> { self.0.cell.lock().expect("collection query lock").last_error.clone() }

    pub fn events(&self) -> Events<CollectionEvent<E>> { self.0.events.handle() }

    /// Resolves when the current operation, if any, has settled.
    pub async fn progress(&self) {
        loop {
            let notified = self.0.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.0.cell.lock().expect("collection query lock").op.is_none() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for the first publication (or the failure that prevented it).
    pub async fn wait_ready(&self) -> Result<Items<E>, ChimeraError> {
        loop {
            let notified = self.0.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let cell = self.0.cell.lock().expect("collection query lock");
                if let Some(seq) = &cell.seq {
                    return Ok(Items { ids: seq.ids.clone(), items: seq.items.clone() });
                }
                if cell.op.is_none() {
                    return Err(cell.last_error.clone().unwrap_or_else(|| ChimeraError::not_ready(self.name())));
                }
            }
            notified.await;
        }
    }

    /// Register a hook on the pending operation, fired once if it is
    /// cancelled. Returns false when nothing is pending.
    pub fn on_cancelled(&self, f: impl FnOnce() + Send + 'static) -> bool {
        let op = self.0.cell.lock().expect("collection query lock").op.clone();
        match op {
            Some(op) => {
                op.on_cancelled(f);
                true
            }
            None => false,
        }
    }

    pub(crate) fn token(&self) -> QueryToken { self.0.token }

    pub(crate) fn downgrade(&self) -> WeakCollectionQuery<E> { WeakCollectionQuery(Arc::downgrade(&self.0)) }

    // --- internals ---

    fn name(&self) -> &EntityName { &self.0.config.name }

    fn request_context(&self, op: &Operation) -> RequestContext {
        RequestContext { signal: op.signal(), entity: self.0.config.name.clone() }
    }

    fn begin_mutation(&self, state: QueryState) -> Result<Arc<Operation>, ChimeraError> {
        let mut cell = self.0.cell.lock().expect("collection query lock");
        if cell.op.is_some() {
            return Err(ChimeraError::AlreadyRunning { entity: self.name().clone() });
        }
        if cell.seq.is_none() {
            return Err(ChimeraError::not_ready(self.name()));
        }
        let (op, _prev) = install_op(&mut cell, state);
        Ok(op)
    }

    fn wrap_source_error(&self, err: SourceError, operation: &'static str, deleting: bool) -> ChimeraError {
        let entity = self.name().clone();
        match err {
            SourceError::NotSpecified => ChimeraError::NotSpecified { entity, operation },
            SourceError::Other(cause) if deleting => ChimeraError::DeletingError { entity, cause: Arc::new(cause) },
            SourceError::Other(cause) => ChimeraError::FetchingError { entity, cause: Arc::new(cause) },
        }
    }

    async fn run<T: Send + 'static>(
        &self,
        driver: impl std::future::Future<Output = Result<T, ChimeraError>> + Send + 'static,
    ) -> Result<T, ChimeraError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        task::spawn(async move {
            let _ = tx.send(driver.await);
        });
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ChimeraError::cancelled(self.name())),
        }
    }

    fn validate_returned_id(&self, expected: &EntityId, returned: &EntityId) -> Result<(), ChimeraError> {
        let config = &self.0.config;
        if config.trust_query && !config.dev_mode {
            return Ok(());
        }
        if expected == returned {
            return Ok(());
        }
        if config.trust_query && config.dev_mode {
            warn!(entity = %config.name, %expected, %returned, "trusted response returned a different id; accepting it");
            return Ok(());
        }
        Err(ChimeraError::TrustIdMismatch { entity: config.name.clone(), expected: expected.clone(), returned: returned.clone() })
    }

    fn fail(&self, op_id: u64, error: ChimeraError) -> ChimeraError {
        {
            let mut cell = self.0.cell.lock().expect("collection query lock");
            if cell.op.as_ref().map(|o| o.id()) != Some(op_id) {
                return ChimeraError::cancelled(self.name());
            }
            cell.op = None;
            cell.state = if cell.seq.is_some() { QueryState::ReErrored } else { QueryState::Errored };
            cell.last_error = Some(error.clone());
        }
        self.0.settled.notify_waiters();
        self.0.events.emit(CollectionEvent::Error { error: error.clone() });
        error
    }

    /// Filter and sort a batch of entities into a fresh sequence.
    fn normalize(&self, entities: Vec<Arc<E>>) -> Result<Seq<E>, ChimeraError> {
        let mut kept: Vec<(EntityId, Arc<E>)> = Vec::with_capacity(entities.len());
        for entity in entities {
            if self.0.predicate.matches(&*entity) {
                let id = self.0.config.id_getter.extract(&entity, self.name())?;
                kept.push((id, entity));
            }
        }
        // Stable sort: equal elements keep arrival order.
        kept.sort_by(|a, b| self.0.comparator.compare(&*a.1, &*b.1));
        let mut seq = Seq { ids: Vec::with_capacity(kept.len()), items: Vec::with_capacity(kept.len()) };
        for (id, item) in kept {
            seq.ids.push(id);
            seq.items.push(item);
        }
        Ok(seq)
    }

    /// Extract ids without filtering or reordering, for trusted sequences.
    fn verbatim(&self, entities: Vec<Arc<E>>) -> Result<Seq<E>, ChimeraError> {
        let mut seq = Seq { ids: Vec::with_capacity(entities.len()), items: Vec::with_capacity(entities.len()) };
        for entity in entities {
            seq.ids.push(self.0.config.id_getter.extract(&entity, self.name())?);
            seq.items.push(entity);
        }
        Ok(seq)
    }

    /// Build the sequence for a server-returned (or pre-validated) batch per
    /// the trust policy: verify-and-warn in dev mode, verbatim otherwise;
    /// full local filter+sort when trust is off.
    fn adopt_sequence(&self, entities: Vec<Arc<E>>) -> Result<Seq<E>, ChimeraError> {
        let config = &self.0.config;
        if !config.trust_query {
            return self.normalize(entities);
        }
        if config.dev_mode {
            let local = self.normalize(entities.clone())?;
            let server = self.verbatim(entities)?;
            let divergence = if local.ids.len() != server.ids.len() {
                Some(local.ids.len().min(server.ids.len()))
            } else {
                local.ids.iter().zip(server.ids.iter()).position(|(a, b)| a != b)
            };
            if let Some(index) = divergence {
                let error = ChimeraError::TrustFetchedCollection { entity: config.name.clone(), index };
                warn!(entity = %config.name, index, "{error}");
            }
            return Ok(server);
        }
        self.verbatim(entities)
    }

    fn publish_fetched(&self, op_id: u64, entities: Vec<E>) -> Result<Items<E>, ChimeraError> {
        let entities: Vec<Arc<E>> = entities.into_iter().map(Arc::new).collect();
        let seq = match self.adopt_sequence(entities) {
            Ok(seq) => seq,
            Err(err) => return Err(self.fail(op_id, err)),
        };

        let upserts: Vec<EntityChange<E>> = seq
            .ids
            .iter()
            .zip(seq.items.iter())
            .map(|(id, item)| EntityChange::Upsert { id: id.clone(), entity: item.clone() })
            .collect();

        let (items, first) = {
            let mut cell = self.0.cell.lock().expect("collection query lock");
            if cell.op.as_ref().map(|o| o.id()) != Some(op_id) {
                return Err(ChimeraError::cancelled(self.name()));
            }
            cell.op = None;
            let first = cell.seq.is_none();
            let items = Items { ids: seq.ids.clone(), items: seq.items.clone() };
            cell.seq = Some(seq);
            cell.state = QueryState::Fetched;
            cell.last_error = None;
            (items, first)
        };
        self.0.settled.notify_waiters();

        if let Some(hook) = &self.0.hook {
            (**hook)(self.0.token, &upserts);
        }
        if first {
            self.0.events.emit(CollectionEvent::Ready);
        }
        self.0.events.emit(CollectionEvent::Updated);
        self.0.events.emit(CollectionEvent::SelfUpdated);
        Ok(items)
    }

    /// Commit a batch of self-caused upserts: run the membership protocol,
    /// fan out, emit the per-item and self events.
    fn publish_upserts(
        &self,
        op_id: u64,
        entities: Vec<E>,
        expected_id: Option<EntityId>,
        cause: SelfCause,
    ) -> Result<(), ChimeraError> {
        let mut changes = Vec::with_capacity(entities.len());
        for entity in entities {
            let entity = Arc::new(entity);
            let id = match self.0.config.id_getter.extract(&entity, self.name()) {
                Ok(id) => id,
                Err(err) => return Err(self.fail(op_id, err)),
            };
            changes.push(EntityChange::Upsert { id, entity });
        }
        if let Some(expected) = expected_id {
            if let [EntityChange::Upsert { id, .. }] = changes.as_slice() {
                if let Err(err) = self.validate_returned_id(&expected, id) {
                    return Err(self.fail(op_id, err));
                }
            }
        }

        let events = {
            let mut cell = self.0.cell.lock().expect("collection query lock");
            if cell.op.as_ref().map(|o| o.id()) != Some(op_id) {
                return Err(ChimeraError::cancelled(self.name()));
            }
            cell.op = None;
            cell.state = QueryState::Fetched;
            cell.last_error = None;
            let seq = cell.seq.as_mut().expect("mutation requires data");
            let mut events = Vec::new();
            for change in &changes {
                if let EntityChange::Upsert { entity, .. } = change {
                    self.upsert_into(seq, entity.clone(), &mut events);
                }
            }
            events
        };
        self.0.settled.notify_waiters();

        if let Some(hook) = &self.0.hook {
            (**hook)(self.0.token, &changes);
        }
        for event in events {
            self.0.events.emit(event);
        }
        for change in &changes {
            if let EntityChange::Upsert { entity, .. } = change {
                match cause {
                    SelfCause::Created => self.0.events.emit(CollectionEvent::SelfItemCreated { item: entity.clone() }),
                    SelfCause::Updated => self.0.events.emit(CollectionEvent::SelfItemUpdated { item: entity.clone() }),
                }
            }
        }
        self.0.events.emit(CollectionEvent::Updated);
        Ok(())
    }

    /// Commit confirmed deletions; a failed id then moves the collection to
    /// `ReErrored` and fails the call.
    fn publish_deletions(&self, op_id: u64, deleted: Vec<EntityId>, failed: Option<EntityId>) -> Result<(), ChimeraError> {
        let (events, changes) = {
            let mut cell = self.0.cell.lock().expect("collection query lock");
            if cell.op.as_ref().map(|o| o.id()) != Some(op_id) {
                return Err(ChimeraError::cancelled(self.name()));
            }
            let seq = cell.seq.as_mut().expect("mutation requires data");
            let mut events = Vec::new();
            let mut changes = Vec::new();
            for id in deleted {
                self.remove_from(seq, &id, &mut events);
                changes.push(EntityChange::Remove { id });
            }
            if failed.is_none() {
                cell.op = None;
                cell.state = QueryState::Fetched;
                cell.last_error = None;
            }
            (events, changes)
        };

        if !changes.is_empty() {
            if let Some(hook) = &self.0.hook {
                (**hook)(self.0.token, &changes);
            }
        }
        let emitted_any = !events.is_empty();
        for event in events {
            self.0.events.emit(event);
        }
        for change in &changes {
            if let EntityChange::Remove { id } = change {
                self.0.events.emit(CollectionEvent::SelfItemDeleted { id: id.clone() });
            }
        }
        if emitted_any {
            self.0.events.emit(CollectionEvent::Updated);
        }

        match failed {
            None => {
                self.0.settled.notify_waiters();
                Ok(())
            }
            Some(id) => {
                let err = ChimeraError::UnsuccessfulDeletion { entity: self.name().clone(), id };
                Err(self.fail(op_id, err))
            }
        }
    }

    /// The membership protocol for one affected item.
    fn upsert_into(&self, seq: &mut Seq<E>, entity: Arc<E>, events: &mut Vec<CollectionEvent<E>>) {
        let id = match self.0.config.id_getter.extract(&entity, self.name()) {
            Ok(id) => id,
            Err(err) => {
                // An entity we cannot identify cannot be placed; surface and skip.
                events.push(CollectionEvent::Error { error: err });
                return;
            }
        };
        let existing = seq.position(&id);
        let matches = self.0.predicate.matches(&*entity);

        match (existing, matches) {
            (None, false) => {}
            (Some(index), true) if self.0.comparator.compare(&*seq.items[index], &*entity) == Ordering::Equal => {
                // Same position: collapse to in-place replacement.
                seq.items[index] = entity.clone();
                events.push(CollectionEvent::ItemUpdated { item: entity });
            }
            (Some(index), true) => {
                seq.ids.remove(index);
                seq.items.remove(index);
                events.push(CollectionEvent::ItemDeleted { id: id.clone() });
                self.insert_sorted(seq, id, entity.clone());
                events.push(CollectionEvent::ItemAdded { item: entity });
            }
            (Some(index), false) => {
                seq.ids.remove(index);
                seq.items.remove(index);
                events.push(CollectionEvent::ItemDeleted { id });
            }
            (None, true) => {
                self.insert_sorted(seq, id, entity.clone());
                events.push(CollectionEvent::ItemAdded { item: entity });
            }
        }
    }

    fn remove_from(&self, seq: &mut Seq<E>, id: &EntityId, events: &mut Vec<CollectionEvent<E>>) {
        if let Some(index) = seq.position(id) {
            seq.ids.remove(index);
            seq.items.remove(index);
            events.push(CollectionEvent::ItemDeleted { id: id.clone() });
        }
    }

    /// Insert before the first element that sorts strictly after the new one,
    /// so equal elements keep insertion order.
    fn insert_sorted(&self, seq: &mut Seq<E>, id: EntityId, entity: Arc<E>) {
        let position = seq.items.iter().position(|existing| self.0.comparator.compare(&**existing, &*entity) == Ordering::Greater);
        match position {
            Some(index) => {
                seq.ids.insert(index, id);
                seq.items.insert(index, entity);
            }
            None => {
                seq.ids.push(id);
                seq.items.push(entity);
            }
        }
    }
}

enum SelfCause {
    Created,
    Updated,
}

fn install_op<E>(cell: &mut CollectionCell<E>, state: QueryState) -> (Arc<Operation>, Option<Arc<Operation>>) {
    let prev = cell.op.take();
    let op = Operation::new();
    cell.op = Some(op.clone());
    cell.state = state;
    (op, prev)
}

/// Finish construction: seed the sequence locally or kick off the fetch.
fn seed_or_fetch<E: EntityRecord>(
    query: &CollectionQuery<E>,
    seed: Option<Vec<Arc<E>>>,
    already_valid: bool,
    op: Option<Arc<Operation>>,
) -> Result<(), ChimeraError> {
    match seed {
        Some(entities) => {
            let seq = if already_valid { query.adopt_sequence(entities)? } else { query.normalize(entities)? };
            {
                let mut cell = query.0.cell.lock().expect("collection query lock");
                cell.seq = Some(seq);
            }
            query.0.events.emit(CollectionEvent::Ready);
            Ok(())
        }
        None => {
            let op = op.expect("fetch path installs an operation");
            let me = query.clone();
            let params = query.0.params.clone();
            task::spawn(async move {
                let ctx = me.request_context(&op);
                match task::abortable(&op.signal(), me.0.config.source.fetch_collection(params, ctx)).await {
                    None => {}
                    Some(Ok(resp)) => {
                        let _ = me.publish_fetched(op.id(), resp.data);
                    }
                    Some(Err(err)) => {
                        let err = me.wrap_source_error(err, "fetch_collection", false);
                        me.fail(op.id(), err);
                    }
                }
            });
            Ok(())
        }
    }
}
