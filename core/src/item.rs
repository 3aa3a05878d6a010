//! Item query: the lifecycle state machine for a single entity.
//!
//! A query is a cheaply-cloneable handle; the repository caches it weakly, so
//! it lives exactly as long as the embedder holds one. At most one
//! asynchronous operation is pending at a time - starting a new one cancels
//! the previous, whose driver then discards its eventual result.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tracing::warn;

use crate::changes::{EntityChange, PublishHook, QueryToken};
use crate::config::EntityConfig;
use crate::entity::{EntityId, EntityName, EntityRecord, Meta};
use crate::error::ChimeraError;
use crate::event::{EventBus, Events};
use crate::source::{DeleteResponse, ItemParams, RequestContext, SourceError};
use crate::state::QueryState;
use crate::task::{self, Operation};

#[derive(Debug, Clone)]
pub enum ItemEvent<E> {
    Initialized,
    SelfCreated { item: Arc<E> },
    Ready { item: Arc<E> },
    Updated { item: Arc<E> },
    SelfUpdated { item: Arc<E> },
    Deleted { id: EntityId },
    SelfDeleted { id: EntityId },
    Error { error: ChimeraError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemEventKind {
    Initialized,
    SelfCreated,
    Ready,
    Updated,
    SelfUpdated,
    Deleted,
    SelfDeleted,
    Error,
}

impl<E> ItemEvent<E> {
    pub fn kind(&self) -> ItemEventKind {
        match self {
            ItemEvent::Initialized => ItemEventKind::Initialized,
            ItemEvent::SelfCreated { .. } => ItemEventKind::SelfCreated,
            ItemEvent::Ready { .. } => ItemEventKind::Ready,
            ItemEvent::Updated { .. } => ItemEventKind::Updated,
            ItemEvent::SelfUpdated { .. } => ItemEventKind::SelfUpdated,
            ItemEvent::Deleted { .. } => ItemEventKind::Deleted,
            ItemEvent::SelfDeleted { .. } => ItemEventKind::SelfDeleted,
            ItemEvent::Error { .. } => ItemEventKind::Error,
        }
    }
}

struct ItemCell<E> {
    state: QueryState,
    /// Unknown only while creating, before the server assigns one.
    id: Option<EntityId>,
    item: Option<Arc<E>>,
    /// Deep clone of `item`, reset on every publication.
    draft: Option<E>,
    op: Option<Arc<Operation>>,
    last_error: Option<ChimeraError>,
}

pub(crate) struct ItemInner<E: EntityRecord> {
    config: Arc<EntityConfig<E>>,
    meta: Meta,
    token: QueryToken,
    cell: Mutex<ItemCell<E>>,
    events: EventBus<ItemEvent<E>>,
    hook: Option<PublishHook<E>>,
    /// Notified whenever a pending operation settles or is cleared.
    settled: Notify,
}

pub struct ItemQuery<E: EntityRecord>(Arc<ItemInner<E>>);

impl<E: EntityRecord> Clone for ItemQuery<E> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

pub struct WeakItemQuery<E: EntityRecord>(Weak<ItemInner<E>>);

impl<E: EntityRecord> Clone for WeakItemQuery<E> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<E: EntityRecord> WeakItemQuery<E> {
    pub fn upgrade(&self) -> Option<ItemQuery<E>> { self.0.upgrade().map(ItemQuery) }
}

impl<E: EntityRecord> ItemQuery<E> {
    fn build(config: Arc<EntityConfig<E>>, meta: Meta, cell: ItemCell<E>, hook: Option<PublishHook<E>>) -> Self {
        Self(Arc::new(ItemInner {
            config,
            meta,
            token: QueryToken::next(),
            cell: Mutex::new(cell),
            events: EventBus::new(),
            hook,
            settled: Notify::new(),
        }))
    }

    /// Prefetched mode: the caller already has the entity.
    pub(crate) fn prefetched(
        config: Arc<EntityConfig<E>>,
        id: EntityId,
        meta: Meta,
        entity: Arc<E>,
        hook: Option<PublishHook<E>>,
    ) -> Result<Self, ChimeraError> {
        if config.dev_mode {
            let extracted = config.id_getter.extract(&entity, &config.name)?;
            if extracted != id {
                return Err(ChimeraError::internal(&config.name, format!("prefetched entity has id {extracted}, expected {id}")));
            }
        }
        let query = Self::build(
            config,
            meta,
            ItemCell {
                state: QueryState::Prefetched,
                id: Some(id),
                item: Some(entity.clone()),
                draft: Some((*entity).clone()),
                op: None,
                last_error: None,
            },
            hook,
        );
        query.0.events.emit(ItemEvent::Initialized);
        query.0.events.emit(ItemEvent::Ready { item: entity });
        Ok(query)
    }

    /// Fetching mode: no seed, the fetch starts immediately.
    pub(crate) fn fetching(config: Arc<EntityConfig<E>>, id: EntityId, meta: Meta, hook: Option<PublishHook<E>>) -> Self {
        let op = Operation::new();
        let query = Self::build(
            config,
            meta.clone(),
            ItemCell { state: QueryState::Fetching, id: Some(id.clone()), item: None, draft: None, op: Some(op.clone()), last_error: None },
            hook,
        );
        query.0.events.emit(ItemEvent::Initialized);

        let me = query.clone();
        task::spawn(async move {
            let ctx = me.request_context(&op);
            let params = ItemParams { id, meta };
            match task::abortable(&op.signal(), me.0.config.source.fetch_item(params, ctx)).await {
                None => {}
                Some(Ok(resp)) => {
                    let _ = me.publish(op.id(), resp.data, false);
                }
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "fetch_item", false);
                    me.fail(op.id(), err);
                }
            }
        });
        query
    }

    /// Creating mode: the server assigns the identity; the query adopts it
    /// from the response.
    pub(crate) fn creating(config: Arc<EntityConfig<E>>, draft: E, meta: Meta, hook: Option<PublishHook<E>>) -> Self {
        let op = Operation::new();
        let query = Self::build(
            config,
            meta,
            ItemCell { state: QueryState::Creating, id: None, item: None, draft: None, op: Some(op.clone()), last_error: None },
            hook,
        );
        query.0.events.emit(ItemEvent::Initialized);

        let me = query.clone();
        task::spawn(async move {
            let ctx = me.request_context(&op);
            match task::abortable(&op.signal(), me.0.config.source.create_item(draft, ctx)).await {
                None => {}
                Some(Ok(resp)) => {
                    let _ = me.publish(op.id(), resp.data, true);
                }
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "create_item", false);
                    me.fail(op.id(), err);
                }
            }
        });
        query
    }

    // --- public operations ---

    /// Cancel any pending work and fetch afresh. Allowed in `Deleted` as the
    /// recovery path.
    pub async fn refetch(&self, force: bool) -> Result<Arc<E>, ChimeraError> {
        let name = self.name().clone();
        let (op, prev, id) = {
            let mut cell = self.0.cell.lock().expect("item query lock");
            let Some(id) = cell.id.clone() else {
                return Err(ChimeraError::NotCreated { entity: name });
            };
            if cell.op.is_some() && !force {
                return Err(ChimeraError::AlreadyRunning { entity: name });
            }
            let state = if cell.item.is_some() { QueryState::Refetching } else { QueryState::Fetching };
            let (op, prev) = install_op(&mut cell, state);
            (op, prev, id)
        };
        if let Some(prev) = prev {
            prev.cancel();
        }

        let me = self.clone();
        let meta = self.0.meta.clone();
        self.run(async move {
            let ctx = me.request_context(&op);
            match task::abortable(&op.signal(), me.0.config.source.fetch_item(ItemParams { id, meta }, ctx)).await {
                None => Err(ChimeraError::cancelled(me.name())),
                Some(Ok(resp)) => me.publish(op.id(), resp.data, false),
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "fetch_item", false);
                    Err(me.fail(op.id(), err))
                }
            }
        })
        .await
    }

    /// Push a replacement entity through the updater and adopt the response.
    pub async fn update(&self, new_item: E, force: bool) -> Result<Arc<E>, ChimeraError> {
        let name = self.name().clone();
        let (op, prev) = {
            let mut cell = self.0.cell.lock().expect("item query lock");
            self.check_mutable(&cell)?;
            if cell.op.is_some() && !force {
                return Err(ChimeraError::AlreadyRunning { entity: name });
            }
            if cell.item.is_none() {
                return Err(ChimeraError::not_ready(&name));
            }
            if !self.0.config.trust_query {
                let current = cell.id.clone().expect("ready query has an id");
                let given = self.0.config.id_getter.extract(&new_item, &name)?;
                if given != current {
                    return Err(ChimeraError::IdMismatch { entity: name, current, given });
                }
            }
            install_op(&mut cell, QueryState::Updating)
        };
        if let Some(prev) = prev {
            prev.cancel();
        }

        let me = self.clone();
        self.run(async move {
            let ctx = me.request_context(&op);
            match task::abortable(&op.signal(), me.0.config.source.update_item(new_item, ctx)).await {
                None => Err(ChimeraError::cancelled(me.name())),
                Some(Ok(resp)) => me.publish(op.id(), resp.data, false),
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "update_item", false);
                    Err(me.fail(op.id(), err))
                }
            }
        })
        .await
    }

    /// Clone the current item, let `f` edit the clone, push the result.
    pub async fn mutate(&self, f: impl FnOnce(&mut E), force: bool) -> Result<Arc<E>, ChimeraError> {
        let mut clone = {
            let cell = self.0.cell.lock().expect("item query lock");
            self.check_mutable(&cell)?;
            match &cell.item {
                Some(item) => (**item).clone(),
                None => return Err(ChimeraError::not_ready(self.name())),
            }
        };
        f(&mut clone);
        self.update(clone, force).await
    }

    /// Push the current draft.
    pub async fn commit(&self, force: bool) -> Result<Arc<E>, ChimeraError> {
        let draft = {
            let cell = self.0.cell.lock().expect("item query lock");
            self.check_mutable(&cell)?;
            match &cell.draft {
                Some(draft) => draft.clone(),
                None => return Err(ChimeraError::not_ready(self.name())),
            }
        };
        self.update(draft, force).await
    }

    /// Delete through the data source; `Deleted` on confirmed success.
    pub async fn delete(&self, force: bool) -> Result<(), ChimeraError> {
        let name = self.name().clone();
        let (op, prev, id) = {
            let mut cell = self.0.cell.lock().expect("item query lock");
            self.check_mutable(&cell)?;
            if cell.op.is_some() && !force {
                return Err(ChimeraError::AlreadyRunning { entity: name });
            }
            if cell.item.is_none() {
                return Err(ChimeraError::not_ready(&name));
            }
            let id = cell.id.clone().expect("ready query has an id");
            let (op, prev) = install_op(&mut cell, QueryState::Deleting);
            (op, prev, id)
        };
        if let Some(prev) = prev {
            prev.cancel();
        }

        let me = self.clone();
        self.run(async move {
            let ctx = me.request_context(&op);
            match task::abortable(&op.signal(), me.0.config.source.delete_item(id, ctx)).await {
                None => Err(ChimeraError::cancelled(me.name())),
                Some(Ok(resp)) => me.publish_deletion(op.id(), resp),
                Some(Err(err)) => {
                    let err = me.wrap_source_error(err, "delete_item", true);
                    Err(me.fail(op.id(), err))
                }
            }
        })
        .await
    }

    // --- inbound from the repository (no network calls) ---

    /// Adopt a newer record published elsewhere in the repository.
    pub(crate) fn apply_set(&self, entity: Arc<E>) {
        let first = {
            let mut cell = self.0.cell.lock().expect("item query lock");
            let first = cell.item.is_none();
            cell.item = Some(entity.clone());
            cell.draft = Some((*entity).clone());
            if cell.op.is_none() {
                cell.state = QueryState::Actualized;
            }
            first
        };
        if first {
            self.0.events.emit(ItemEvent::Ready { item: entity.clone() });
        }
        self.0.events.emit(ItemEvent::Updated { item: entity });
    }

    /// Observe a deletion published elsewhere. A non-matching id is ignored.
    pub(crate) fn apply_delete(&self, id: &EntityId) {
        let cancelled = {
            let mut cell = self.0.cell.lock().expect("item query lock");
            if cell.id.as_ref() != Some(id) {
                return;
            }
            cell.state = QueryState::Deleted;
            cell.item = None;
            cell.draft = None;
            cell.op.take()
        };
        if let Some(op) = cancelled {
            op.cancel();
        }
        self.0.settled.notify_waiters();
        self.0.events.emit(ItemEvent::Deleted { id: id.clone() });
    }

    // --- read surface ---

    pub fn state(&self) -> QueryState { self.0.cell.lock().expect("item query lock").state }

    pub fn ready(&self) -> bool { self.0.cell.lock().expect("item query lock").item.is_some() }

    pub fn data(&self) -> Result<Arc<E>, ChimeraError> {
        self.0.cell.lock().expect("item query lock").item.clone().ok_or_else(|| ChimeraError::not_ready(self.name()))
    }

    pub fn id(&self) -> Option<EntityId> { self.0.cell.lock().expect("item query lock").id.clone() }

    pub fn meta(&self) -> &Meta { &self.0.meta }

    pub fn entity_name(&self) -> &str { &self.0.config.name }

    pub fn last_error(&self) -> Option<ChimeraError> { self.0.cell.lock().expect("item query lock").last_error.clone() }

    pub fn events(&self) -> Events<ItemEvent<E>> { self.0.events.handle() }

    /// Edit the draft in place. The closure runs under the query lock and
    /// must not call back into the query.
    pub fn draft<R>(&self, f: impl FnOnce(&mut E) -> R) -> Result<R, ChimeraError> {
        let mut cell = self.0.cell.lock().expect("item query lock");
        self.check_mutable(&cell)?;
        match cell.draft.as_mut() {
            Some(draft) => Ok(f(draft)),
            None => Err(ChimeraError::not_ready(self.name())),
        }
    }

    /// A copy of the current draft.
    pub fn draft_value(&self) -> Result<E, ChimeraError> {
        self.0.cell.lock().expect("item query lock").draft.clone().ok_or_else(|| ChimeraError::not_ready(self.name()))
    }

    /// Resolves when the current operation, if any, has settled.
    pub async fn progress(&self) {
        loop {
            let notified = self.0.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.0.cell.lock().expect("item query lock").op.is_none() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for the first publication (or the failure that prevented it).
    pub async fn wait_ready(&self) -> Result<Arc<E>, ChimeraError> {
        loop {
            let notified = self.0.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let cell = self.0.cell.lock().expect("item query lock");
                if let Some(item) = &cell.item {
                    return Ok(item.clone());
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
        let op = self.0.cell.lock().expect("item query lock").op.clone();
        match op {
            Some(op) => {
                op.on_cancelled(f);
                true
            }
            None => false,
        }
    }

    pub(crate) fn token(&self) -> QueryToken { self.0.token }

    pub(crate) fn downgrade(&self) -> WeakItemQuery<E> { WeakItemQuery(Arc::downgrade(&self.0)) }

    // --- internals ---

    fn name(&self) -> &EntityName { &self.0.config.name }

    fn request_context(&self, op: &Operation) -> RequestContext {
        RequestContext { signal: op.signal(), entity: self.0.config.name.clone() }
    }

    /// `Deleted` and `Creating` refuse mutation outright.
    fn check_mutable(&self, cell: &ItemCell<E>) -> Result<(), ChimeraError> {
        match cell.state {
            QueryState::Deleted => {
                Err(ChimeraError::DeletedItem { entity: self.name().clone(), id: cell.id.clone().expect("deleted query retains its id") })
            }
            QueryState::Creating => Err(ChimeraError::NotCreated { entity: self.name().clone() }),
            _ => Ok(()),
        }
    }

    fn wrap_source_error(&self, err: SourceError, operation: &'static str, deleting: bool) -> ChimeraError {
        let entity = self.name().clone();
        match err {
            SourceError::NotSpecified => ChimeraError::NotSpecified { entity, operation },
            SourceError::Other(cause) if deleting => ChimeraError::DeletingError { entity, cause: Arc::new(cause) },
            SourceError::Other(cause) => ChimeraError::FetchingError { entity, cause: Arc::new(cause) },
        }
    }

    /// Spawn the driver and await its outcome. The driver owns the actual
    /// work; if this caller is superseded it observes `Cancelled`.
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

    /// Accept or reject a server-returned id per the trust policy.
    fn validate_returned_id(&self, expected: &EntityId, returned: &EntityId) -> Result<(), ChimeraError> {
        let config = &self.0.config;
        if config.trust_query && !config.dev_mode {
            return Ok(());
        }
        if expected == returned {
            return Ok(());
        }
        if config.trust_query && config.dev_mode {
            warn!(entity = %config.name, %expected, %returned, "trusted response returned a different id; adopting it");
            return Ok(());
        }
        Err(ChimeraError::TrustIdMismatch { entity: config.name.clone(), expected: expected.clone(), returned: returned.clone() })
    }

    /// Record a failed operation: `Errored` without prior data, `ReErrored`
    /// with it. Returns the error actually recorded (`Cancelled` when this
    /// operation was superseded meanwhile).
    fn fail(&self, op_id: u64, error: ChimeraError) -> ChimeraError {
        {
            let mut cell = self.0.cell.lock().expect("item query lock");
            if cell.op.as_ref().map(|o| o.id()) != Some(op_id) {
                return ChimeraError::cancelled(self.name());
            }
            cell.op = None;
            cell.state = if cell.item.is_some() { QueryState::ReErrored } else { QueryState::Errored };
            cell.last_error = Some(error.clone());
        }
        self.0.settled.notify_waiters();
        self.0.events.emit(ItemEvent::Error { error: error.clone() });
        error
    }

    /// Publish a server-returned entity: validate identity, commit state,
    /// reset the draft, fan out through the repository, then emit events.
    fn publish(&self, op_id: u64, entity: E, created: bool) -> Result<Arc<E>, ChimeraError> {
        let rid = match self.0.config.id_getter.extract(&entity, self.name()) {
            Ok(rid) => rid,
            Err(err) => return Err(self.fail(op_id, err)),
        };
        if !created {
            let current = self.0.cell.lock().expect("item query lock").id.clone();
            if let Some(current) = current {
                if let Err(err) = self.validate_returned_id(&current, &rid) {
                    return Err(self.fail(op_id, err));
                }
            }
        }

        let published = Arc::new(entity);
        let first = {
            let mut cell = self.0.cell.lock().expect("item query lock");
            if cell.op.as_ref().map(|o| o.id()) != Some(op_id) {
                return Err(ChimeraError::cancelled(self.name()));
            }
            cell.op = None;
            let first = cell.item.is_none();
            cell.item = Some(published.clone());
            cell.draft = Some((*published).clone());
            cell.id = Some(rid.clone());
            cell.state = QueryState::Fetched;
            cell.last_error = None;
            first
        };
        self.0.settled.notify_waiters();

        if let Some(hook) = &self.0.hook {
            (**hook)(self.0.token, &[EntityChange::Upsert { id: rid, entity: published.clone() }]);
        }

        if first {
            self.0.events.emit(ItemEvent::Ready { item: published.clone() });
        }
        self.0.events.emit(ItemEvent::Updated { item: published.clone() });
        if created {
            self.0.events.emit(ItemEvent::SelfCreated { item: published.clone() });
        } else {
            self.0.events.emit(ItemEvent::SelfUpdated { item: published.clone() });
        }
        Ok(published)
    }

    /// Apply a delete response: trust-check the returned id, transition to
    /// `Deleted`, fan out, emit.
    fn publish_deletion(&self, op_id: u64, resp: DeleteResponse) -> Result<(), ChimeraError> {
        let result = resp.result;
        if !result.success {
            let err = ChimeraError::UnsuccessfulDeletion { entity: self.name().clone(), id: result.id };
            return Err(self.fail(op_id, err));
        }
        let current = self.0.cell.lock().expect("item query lock").id.clone();
        let id = match current {
            Some(current) => {
                if let Err(err) = self.validate_returned_id(&current, &result.id) {
                    return Err(self.fail(op_id, err));
                }
                current
            }
            None => result.id,
        };

        {
            let mut cell = self.0.cell.lock().expect("item query lock");
            if cell.op.as_ref().map(|o| o.id()) != Some(op_id) {
                return Err(ChimeraError::cancelled(self.name()));
            }
            cell.op = None;
            cell.state = QueryState::Deleted;
            cell.item = None;
            cell.draft = None;
        }
        self.0.settled.notify_waiters();

        if let Some(hook) = &self.0.hook {
            (**hook)(self.0.token, &[EntityChange::Remove { id: id.clone() }]);
        }
        self.0.events.emit(ItemEvent::Deleted { id: id.clone() });
        self.0.events.emit(ItemEvent::SelfDeleted { id });
        Ok(())
    }
}

fn install_op<E>(cell: &mut ItemCell<E>, state: QueryState) -> (Arc<Operation>, Option<Arc<Operation>>) {
    let prev = cell.op.take();
    let op = Operation::new();
    cell.op = Some(op.clone());
    cell.state = state;
    (op, prev)
}
