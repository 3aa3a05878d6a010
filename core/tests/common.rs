#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::Level;

use chimera_core::collection::{CollectionEventKind, CollectionQuery};
use chimera_core::entity::{EntityId, EntityRecord};
use chimera_core::event::ListenerGuard;
use chimera_core::item::{ItemEventKind, ItemQuery};
use chimera_core::source::{
    BatchDeleteResponse, CollectionParams, CollectionResponse, DataSource, DeleteResponse, ItemParams, ItemResponse, RequestContext,
    SourceError,
};
use chimera_core::ql::{Filterable, Value};

/// A record with a string id, for the single-item scenarios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub name: String,
    pub value: i64,
}

impl Note {
    pub fn new(id: &str, name: &str, value: i64) -> Self { Self { id: id.to_owned(), name: name.to_owned(), value } }
}

impl Filterable for Note {
    fn value(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::String(self.id.clone())),
            "name" => Some(Value::String(self.name.clone())),
            "value" => Some(Value::I64(self.value)),
            _ => None,
        }
    }
}

/// A record with an integer id, for the collection scenarios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub status: String,
    pub prio: i64,
    pub value: i64,
}

impl Task {
    pub fn new(id: i64, status: &str, prio: i64, value: i64) -> Self { Self { id, status: status.to_owned(), prio, value } }
}

impl Filterable for Task {
    fn value(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::I64(self.id)),
            "status" => Some(Value::String(self.status.clone())),
            "prio" => Some(Value::I64(self.prio)),
            "value" => Some(Value::I64(self.value)),
            _ => None,
        }
    }
}

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().try_init();
}

/// Let spawned drivers and event dispatchers catch up.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

type Handler<A, R> = Box<dyn Fn(A) -> Result<R, SourceError> + Send + Sync>;

/// A programmable data source. Handlers left unset report `NotSpecified`,
/// like an embedder that never declared the callback.
pub struct MockSource<E: EntityRecord> {
    calls: Mutex<Vec<&'static str>>,
    hang_updates: AtomicBool,
    fetch_item: Option<Handler<ItemParams, ItemResponse<E>>>,
    fetch_collection: Option<Handler<CollectionParams, CollectionResponse<E>>>,
    update_item: Option<Handler<E, ItemResponse<E>>>,
    update_many: Option<Handler<Vec<E>, CollectionResponse<E>>>,
    delete_item: Option<Handler<EntityId, DeleteResponse>>,
    delete_many: Option<Handler<Vec<EntityId>, BatchDeleteResponse>>,
    create_item: Option<Handler<E, ItemResponse<E>>>,
    create_many: Option<Handler<Vec<E>, CollectionResponse<E>>>,
}

impl<E: EntityRecord> MockSource<E> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            hang_updates: AtomicBool::new(false),
            fetch_item: None,
            fetch_collection: None,
            update_item: None,
            update_many: None,
            delete_item: None,
            delete_many: None,
            create_item: None,
            create_many: None,
        }
    }

    pub fn with_fetch_item(mut self, f: impl Fn(ItemParams) -> Result<ItemResponse<E>, SourceError> + Send + Sync + 'static) -> Self {
        self.fetch_item = Some(Box::new(f));
        self
    }

    pub fn with_fetch_collection(
        mut self,
        f: impl Fn(CollectionParams) -> Result<CollectionResponse<E>, SourceError> + Send + Sync + 'static,
    ) -> Self {
        self.fetch_collection = Some(Box::new(f));
        self
    }

    pub fn with_update_item(mut self, f: impl Fn(E) -> Result<ItemResponse<E>, SourceError> + Send + Sync + 'static) -> Self {
        self.update_item = Some(Box::new(f));
        self
    }

    pub fn with_update_many(mut self, f: impl Fn(Vec<E>) -> Result<CollectionResponse<E>, SourceError> + Send + Sync + 'static) -> Self {
        self.update_many = Some(Box::new(f));
        self
    }

    pub fn with_delete_item(mut self, f: impl Fn(EntityId) -> Result<DeleteResponse, SourceError> + Send + Sync + 'static) -> Self {
        self.delete_item = Some(Box::new(f));
        self
    }

    pub fn with_delete_many(
        mut self,
        f: impl Fn(Vec<EntityId>) -> Result<BatchDeleteResponse, SourceError> + Send + Sync + 'static,
    ) -> Self {
        self.delete_many = Some(Box::new(f));
        self
    }

    pub fn with_create_item(mut self, f: impl Fn(E) -> Result<ItemResponse<E>, SourceError> + Send + Sync + 'static) -> Self {
        self.create_item = Some(Box::new(f));
        self
    }

    pub fn with_create_many(mut self, f: impl Fn(Vec<E>) -> Result<CollectionResponse<E>, SourceError> + Send + Sync + 'static) -> Self {
        self.create_many = Some(Box::new(f));
        self
    }

    /// Make `update_item` block until its operation is aborted.
    pub fn with_hanging_updates(self) -> Self {
        self.hang_updates.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> { self.calls.lock().unwrap().clone() }

    pub fn count(&self, name: &str) -> usize { self.calls.lock().unwrap().iter().filter(|c| **c == name).count() }

    fn log(&self, name: &'static str) { self.calls.lock().unwrap().push(name); }
}

#[async_trait]
impl<E: EntityRecord> DataSource<E> for MockSource<E> {
    async fn fetch_collection(&self, params: CollectionParams, _ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        self.log("fetch_collection");
        match &self.fetch_collection {
            Some(f) => f(params),
            None => Err(SourceError::NotSpecified),
        }
    }

    async fn fetch_item(&self, params: ItemParams, _ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        self.log("fetch_item");
        match &self.fetch_item {
            Some(f) => f(params),
            None => Err(SourceError::NotSpecified),
        }
    }

    async fn update_item(&self, entity: E, _ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        self.log("update_item");
        if self.hang_updates.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        match &self.update_item {
            Some(f) => f(entity),
            None => Err(SourceError::NotSpecified),
        }
    }

    async fn update_many(&self, entities: Vec<E>, _ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        self.log("update_many");
        match &self.update_many {
            Some(f) => f(entities),
            None => Err(SourceError::NotSpecified),
        }
    }

    async fn delete_item(&self, id: EntityId, _ctx: RequestContext) -> Result<DeleteResponse, SourceError> {
        self.log("delete_item");
        match &self.delete_item {
            Some(f) => f(id),
            None => Err(SourceError::NotSpecified),
        }
    }

    async fn delete_many(&self, ids: Vec<EntityId>, _ctx: RequestContext) -> Result<BatchDeleteResponse, SourceError> {
        self.log("delete_many");
        match &self.delete_many {
            Some(f) => f(ids),
            None => Err(SourceError::NotSpecified),
        }
    }

    async fn create_item(&self, draft: E, _ctx: RequestContext) -> Result<ItemResponse<E>, SourceError> {
        self.log("create_item");
        match &self.create_item {
            Some(f) => f(draft),
            None => Err(SourceError::NotSpecified),
        }
    }

    async fn create_many(&self, drafts: Vec<E>, _ctx: RequestContext) -> Result<CollectionResponse<E>, SourceError> {
        self.log("create_many");
        match &self.create_many {
            Some(f) => f(drafts),
            None => Err(SourceError::NotSpecified),
        }
    }
}

/// Collect an item query's event kinds as they are dispatched.
pub fn item_event_watcher<E: EntityRecord>(query: &ItemQuery<E>) -> (ListenerGuard, Box<dyn Fn() -> Vec<ItemEventKind>>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let guard = query.events().on(move |event: &chimera_core::item::ItemEvent<E>| {
        let _ = tx.send(event.kind());
    });
    (guard, Box::new(move || rx.try_iter().collect()))
}

/// Collect a collection query's event kinds as they are dispatched.
pub fn collection_event_watcher<E: EntityRecord>(query: &CollectionQuery<E>) -> (ListenerGuard, Box<dyn Fn() -> Vec<CollectionEventKind>>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let guard = query.events().on(move |event: &chimera_core::collection::CollectionEvent<E>| {
        let _ = tx.send(event.kind());
    });
    (guard, Box::new(move || rx.try_iter().collect()))
}
