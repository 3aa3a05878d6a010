//! Per-entity-kind registry: caches live item and collection queries weakly,
//! maintains the weak entity index, and fans every published change out to
//! all other live views of the same kind.

use std::sync::{Arc, Weak};

use chimera_ql::is_subset;

use crate::changes::{EntityChange, PublishHook, QueryToken};
use crate::collection::{CollectionQuery, WeakCollectionQuery};
use crate::config::EntityConfig;
use crate::entity::{EntityId, EntityRecord, Meta};
use crate::error::ChimeraError;
use crate::event::{EventBus, Events};
use crate::item::{ItemEvent, ItemQuery, WeakItemQuery};
use crate::source::CollectionParams;
use crate::store::StoreChange;
use crate::util::weakcache::{WeakCache, WeakHandle};

#[derive(Debug, Clone)]
pub enum RepositoryEvent<E> {
    ItemAdded { id: EntityId, item: Arc<E> },
    ItemUpdated { id: EntityId, item: Arc<E> },
    ItemDeleted { id: EntityId },
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryEventKind {
    ItemAdded,
    ItemUpdated,
    ItemDeleted,
    Updated,
}

impl<E> RepositoryEvent<E> {
    pub fn kind(&self) -> RepositoryEventKind {
        match self {
            RepositoryEvent::ItemAdded { .. } => RepositoryEventKind::ItemAdded,
            RepositoryEvent::ItemUpdated { .. } => RepositoryEventKind::ItemUpdated,
            RepositoryEvent::ItemDeleted { .. } => RepositoryEventKind::ItemDeleted,
            RepositoryEvent::Updated => RepositoryEventKind::Updated,
        }
    }
}

impl<E: EntityRecord> WeakHandle for WeakItemQuery<E> {
    type Strong = ItemQuery<E>;
    fn upgrade(&self) -> Option<ItemQuery<E>> { WeakItemQuery::upgrade(self) }
}

impl<E: EntityRecord> WeakHandle for WeakCollectionQuery<E> {
    type Strong = CollectionQuery<E>;
    fn upgrade(&self) -> Option<CollectionQuery<E>> { WeakCollectionQuery::upgrade(self) }
}

pub(crate) type StoreHook = Arc<dyn Fn(StoreChange) + Send + Sync>;

struct RepoInner<E: EntityRecord> {
    config: Arc<EntityConfig<E>>,
    /// Most recent record published by any query of this kind, held weakly.
    entities: WeakCache<EntityId, Weak<E>>,
    items: WeakCache<EntityId, WeakItemQuery<E>>,
    /// Keyed by the canonical collection-params key.
    collections: WeakCache<String, WeakCollectionQuery<E>>,
    events: EventBus<RepositoryEvent<E>>,
    store_hook: Option<StoreHook>,
}

pub struct Repository<E: EntityRecord>(Arc<RepoInner<E>>);

impl<E: EntityRecord> Clone for Repository<E> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<E: EntityRecord> std::fmt::Debug for Repository<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").field("entity_name", &self.0.config.name).finish()
    }
}

impl<E: EntityRecord> Repository<E> {
    pub(crate) fn new(config: Arc<EntityConfig<E>>, store_hook: Option<StoreHook>) -> Self {
        Self(Arc::new(RepoInner {
            config,
            entities: WeakCache::new(),
            items: WeakCache::new(),
            collections: WeakCache::new(),
            events: EventBus::new(),
            store_hook,
        }))
    }

    pub fn entity_name(&self) -> &str { &self.0.config.name }

    pub fn events(&self) -> Events<RepositoryEvent<E>> { self.0.events.handle() }

    /// The entity index entry for this id, if some live query still holds
    /// the record. Every ready view of the id returns this same allocation.
    pub fn cached_entity(&self, id: &EntityId) -> Option<Arc<E>> { self.0.entities.get(id) }

    // --- query factories ---

    /// The live query for this id, or a new one seeded from the entity index
    /// when possible and fetching otherwise.
    pub fn get_item(&self, id: impl Into<EntityId>) -> Result<ItemQuery<E>, ChimeraError> {
        self.get_item_with(id.into(), Meta::none())
    }

    pub fn get_item_with(&self, id: EntityId, meta: Meta) -> Result<ItemQuery<E>, ChimeraError> {
        if let Some(existing) = self.0.items.get(&id) {
            return Ok(existing);
        }
        let hook = Some(self.publish_hook());
        let query = match self.0.entities.get(&id) {
            Some(entity) => ItemQuery::prefetched(self.0.config.clone(), id.clone(), meta, entity, hook)?,
            None => ItemQuery::fetching(self.0.config.clone(), id.clone(), meta, hook),
        };
        self.0.items.insert(id, query.downgrade());
        Ok(query)
    }

    /// A query constructed directly from an entity the caller already has.
    /// The record is published to the index and to every live view.
    pub fn prefetch_item(&self, entity: E) -> Result<ItemQuery<E>, ChimeraError> { self.prefetch_item_with(entity, Meta::none()) }

    pub fn prefetch_item_with(&self, entity: E, meta: Meta) -> Result<ItemQuery<E>, ChimeraError> {
        let entity = Arc::new(entity);
        let id = self.0.config.id_getter.extract(&entity, &self.0.config.name)?;
        let query = ItemQuery::prefetched(self.0.config.clone(), id.clone(), meta, entity.clone(), Some(self.publish_hook()))?;
        self.0.items.insert(id.clone(), query.downgrade());
        self.propagate(Some(query.token()), &[EntityChange::Upsert { id, entity }]);
        Ok(query)
    }

    /// A query in creating mode. Once the server assigns the identity the
    /// query registers itself in the item cache under the adopted id.
    pub fn create_item(&self, draft: E) -> ItemQuery<E> { self.create_item_with(draft, Meta::none()) }

    pub fn create_item_with(&self, draft: E, meta: Meta) -> ItemQuery<E> {
        let query = ItemQuery::creating(self.0.config.clone(), draft, meta, Some(self.publish_hook()));

        let weak_inner = Arc::downgrade(&self.0);
        let weak_query = query.downgrade();
        // The subscription dies with the query's bus; SelfCreated fires at
        // most once per query.
        query
            .events()
            .on(move |event| {
                if let ItemEvent::SelfCreated { .. } = event {
                    if let (Some(inner), Some(query)) = (weak_inner.upgrade(), weak_query.upgrade()) {
                        if let Some(id) = query.id() {
                            inner.items.insert(id, query.downgrade());
                        }
                    }
                }
            })
            .forget();
        query
    }

    /// The live collection for these params, or a new one - seeded from the
    /// first ready collection whose filter provably contains the requested
    /// one, fetching otherwise.
    pub fn get_collection(&self, params: CollectionParams) -> Result<CollectionQuery<E>, ChimeraError> {
        let key = params.cache_key();
        if let Some(existing) = self.0.collections.get(&key) {
            return Ok(existing);
        }

        let mut seed = None;
        for (_, collection) in self.0.collections.live() {
            if !collection.ready() {
                continue;
            }
            if is_subset(params.filter.as_ref(), collection.params().filter.as_ref()) {
                if let Ok(items) = collection.read() {
                    seed = Some(items.to_vec());
                    break;
                }
            }
        }

        let query = CollectionQuery::new(self.0.config.clone(), params, seed, false, Some(self.publish_hook()))?;
        self.0.collections.insert(key, query.downgrade());
        Ok(query)
    }

    // --- external mutation hooks (no originator to skip) ---

    pub fn set_one(&self, entity: E) -> Result<(), ChimeraError> { self.set_many(vec![entity]) }

    pub fn set_many(&self, entities: Vec<E>) -> Result<(), ChimeraError> { self.update_mixed(entities, Vec::new()) }

    pub fn delete_one(&self, id: impl Into<EntityId>) { self.delete_many(vec![id.into()]) }

    pub fn delete_many(&self, ids: Vec<EntityId>) {
        let changes: Vec<EntityChange<E>> = ids.into_iter().map(|id| EntityChange::Remove { id }).collect();
        self.propagate(None, &changes);
    }

    pub fn update_mixed(&self, to_set: Vec<E>, to_delete: Vec<EntityId>) -> Result<(), ChimeraError> {
        let mut changes = Vec::with_capacity(to_set.len() + to_delete.len());
        for entity in to_set {
            let entity = Arc::new(entity);
            let id = self.0.config.id_getter.extract(&entity, &self.0.config.name)?;
            changes.push(EntityChange::Upsert { id, entity });
        }
        changes.extend(to_delete.into_iter().map(|id| EntityChange::Remove { id }));
        self.propagate(None, &changes);
        Ok(())
    }

    // --- propagation ---

    fn publish_hook(&self) -> PublishHook<E> {
        let weak = Arc::downgrade(&self.0);
        Arc::new(move |token, changes| {
            if let Some(inner) = weak.upgrade() {
                Repository(inner).propagate(Some(token), changes);
            }
        })
    }

    /// The consistency protocol: index first, then the other item queries,
    /// then the collections, then repository/store events. The originator is
    /// skipped (it already holds the new state); its own events follow after
    /// this returns.
    fn propagate(&self, origin: Option<QueryToken>, changes: &[EntityChange<E>]) {
        if changes.is_empty() {
            return;
        }
        let mut repo_events = Vec::with_capacity(changes.len());
        for change in changes {
            match change {
                EntityChange::Upsert { id, entity } => {
                    let known = self.0.entities.get(id).is_some();
                    self.0.entities.insert(id.clone(), Arc::downgrade(entity));
                    repo_events.push(if known {
                        RepositoryEvent::ItemUpdated { id: id.clone(), item: entity.clone() }
                    } else {
                        RepositoryEvent::ItemAdded { id: id.clone(), item: entity.clone() }
                    });
                }
                EntityChange::Remove { id } => {
                    self.0.entities.remove(id);
                    repo_events.push(RepositoryEvent::ItemDeleted { id: id.clone() });
                }
            }
        }

        for change in changes {
            if let Some(query) = self.0.items.get(change.id()) {
                if Some(query.token()) == origin {
                    continue;
                }
                match change {
                    EntityChange::Upsert { entity, .. } => query.apply_set(entity.clone()),
                    EntityChange::Remove { id } => query.apply_delete(id),
                }
            }
        }

        for (_, collection) in self.0.collections.live() {
            if Some(collection.token()) == origin || !collection.ready() {
                continue;
            }
            if let Err(error) = collection.apply_changes(changes) {
                tracing::error!(entity = self.entity_name(), %error, "forwarding changes to a live collection failed");
            }
        }

        for event in repo_events {
            if let Some(store_hook) = &self.0.store_hook {
                (**store_hook)(match &event {
                    RepositoryEvent::ItemAdded { id, .. } => StoreChange::ItemAdded { id: id.clone() },
                    RepositoryEvent::ItemUpdated { id, .. } => StoreChange::ItemUpdated { id: id.clone() },
                    RepositoryEvent::ItemDeleted { id } => StoreChange::ItemDeleted { id: id.clone() },
                    RepositoryEvent::Updated => StoreChange::Updated,
                });
            }
            self.0.events.emit(event);
        }
        if let Some(store_hook) = &self.0.store_hook {
            (**store_hook)(StoreChange::Updated);
        }
        self.0.events.emit(RepositoryEvent::Updated);
    }
}
