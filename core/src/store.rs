//! Top-level façade: one repository per declared entity kind, created lazily
//! on first access. Entity kinds are registered with a typed configuration
//! and stored type-erased; `from::<E>` recovers the typed repository.

use std::any::Any;
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use chimera_ql::OperatorSet;

use crate::config::{EntityConfig, EntityOptions, StoreConfig};
use crate::entity::{EntityId, EntityName, EntityRecord};
use crate::error::ChimeraError;
use crate::event::{EventBus, Events};
use crate::repository::{Repository, StoreHook};
use crate::source::{DataSource, FallbackSource, SharedSource, SharedSourceAdapter, UnspecifiedSource};

/// Aggregate, type-erased view of repository activity, annotated with the
/// entity kind. The fully typed payloads live on the repository buses.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub entity: EntityName,
    pub change: StoreChange,
}

#[derive(Debug, Clone)]
pub enum StoreChange {
    ItemAdded { id: EntityId },
    ItemUpdated { id: EntityId },
    ItemDeleted { id: EntityId },
    Updated,
}

struct EntitySlot {
    /// `Arc<EntityConfig<E>>` behind `Any`.
    config: Box<dyn Any + Send + Sync>,
    /// `Repository<E>` behind `Any`, built on first `from`.
    repo: OnceLock<Box<dyn Any + Send + Sync>>,
}

struct StoreInner {
    entities: DashMap<String, EntitySlot>,
    events: EventBus<StoreEvent>,
}

#[derive(Clone)]
pub struct Store(Arc<StoreInner>);

impl Store {
    pub fn builder() -> StoreBuilder { StoreBuilder::new() }

    /// The repository for a declared entity kind. `E` must be the type the
    /// kind was registered with.
    pub fn from<E: EntityRecord>(&self, name: &str) -> Result<Repository<E>, ChimeraError> {
        let entity_name: EntityName = name.into();
        let slot = self
            .0
            .entities
            .get(name)
            .ok_or_else(|| ChimeraError::internal(&entity_name, "entity kind not registered with this store"))?;

        let mismatch = || ChimeraError::internal(&entity_name, "entity kind registered with a different record type");
        if let Some(repo) = slot.repo.get() {
            return repo.downcast_ref::<Repository<E>>().cloned().ok_or_else(mismatch);
        }

        let config = slot.config.downcast_ref::<Arc<EntityConfig<E>>>().cloned().ok_or_else(mismatch)?;
        let repo = Repository::new(config, Some(self.store_hook(entity_name.clone())));
        // Lost races fall through to whatever got stored first.
        let _ = slot.repo.set(Box::new(repo));
        slot.repo.get().expect("repository just stored").downcast_ref::<Repository<E>>().cloned().ok_or_else(mismatch)
    }

    pub fn events(&self) -> Events<StoreEvent> { self.0.events.handle() }

    // --- external mutation hooks, routed by entity name ---

    pub fn update_one<E: EntityRecord>(&self, name: &str, entity: E) -> Result<(), ChimeraError> {
        self.from::<E>(name)?.set_one(entity)
    }

    pub fn update_many<E: EntityRecord>(&self, name: &str, entities: Vec<E>) -> Result<(), ChimeraError> {
        self.from::<E>(name)?.set_many(entities)
    }

    pub fn delete_one<E: EntityRecord>(&self, name: &str, id: impl Into<EntityId>) -> Result<(), ChimeraError> {
        self.from::<E>(name)?.delete_one(id);
        Ok(())
    }

    pub fn delete_many<E: EntityRecord>(&self, name: &str, ids: Vec<EntityId>) -> Result<(), ChimeraError> {
        self.from::<E>(name)?.delete_many(ids);
        Ok(())
    }

    pub fn update_mixed<E: EntityRecord>(&self, name: &str, to_set: Vec<E>, to_delete: Vec<EntityId>) -> Result<(), ChimeraError> {
        self.from::<E>(name)?.update_mixed(to_set, to_delete)
    }

    fn store_hook(&self, entity: EntityName) -> StoreHook {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.0);
        Arc::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.events.emit(StoreEvent { entity: entity.clone(), change });
            }
        })
    }
}

type Registration = Box<dyn FnOnce(&StoreConfig, Option<&Arc<dyn SharedSource>>) -> (String, EntitySlot) + Send>;

/// Declares entity kinds and store-wide defaults, then builds the store.
/// Configuration resolves in three levels: built-in defaults, the store
/// defaults set here, and per-entity [`EntityOptions`] overrides.
pub struct StoreBuilder {
    config: StoreConfig,
    shared: Option<Arc<dyn SharedSource>>,
    registrations: Vec<Registration>,
}

impl Default for StoreBuilder {
    fn default() -> Self { Self::new() }
}

impl StoreBuilder {
    pub fn new() -> Self { Self { config: StoreConfig::default(), shared: None, registrations: Vec::new() } }

    pub fn dev_mode(mut self, on: bool) -> Self {
        self.config.dev_mode = on;
        self
    }

    pub fn trust_query(mut self, on: bool) -> Self {
        self.config.trust_query = on;
        self
    }

    pub fn operators(mut self, operators: OperatorSet) -> Self {
        self.config.operators = operators;
        self
    }

    /// The store-wide fallback source; entity kinds that omit a callback
    /// route it here, with the entity name as the first argument.
    pub fn shared_source(mut self, source: impl SharedSource + 'static) -> Self {
        self.shared = Some(Arc::new(source));
        self
    }

    /// Declare an entity kind. Registration is deferred so that store-wide
    /// settings apply regardless of call order.
    pub fn entity<E>(mut self, name: impl Into<String>, options: EntityOptions<E>) -> Self
    where E: EntityRecord + Serialize + DeserializeOwned {
        let name = name.into();
        self.registrations.push(Box::new(move |config, shared| {
            let entity_name: EntityName = name.as_str().into();
            let source: Arc<dyn DataSource<E>> = match (options.source, shared) {
                (Some(primary), Some(shared)) => {
                    Arc::new(FallbackSource { primary, fallback: Arc::new(SharedSourceAdapter::<E>::new(shared.clone())) })
                }
                (Some(primary), None) => primary,
                (None, Some(shared)) => Arc::new(SharedSourceAdapter::<E>::new(shared.clone())),
                (None, None) => Arc::new(UnspecifiedSource),
            };
            let entity_config = Arc::new(EntityConfig {
                name: entity_name,
                source,
                id_getter: options.id_getter.unwrap_or_default(),
                trust_query: options.trust_query.unwrap_or(config.trust_query),
                dev_mode: config.dev_mode,
                operators: config.operators.clone(),
            });
            (name, EntitySlot { config: Box::new(entity_config), repo: OnceLock::new() })
        }));
        self
    }

    pub fn build(self) -> Store {
        let inner = StoreInner { entities: DashMap::new(), events: EventBus::new() };
        for registration in self.registrations {
            let (name, slot) = registration(&self.config, self.shared.as_ref());
            inner.entities.insert(name, slot);
        }
        Store(Arc::new(inner))
    }
}
