//! Configuration. Query behavior is declared at three levels: built-in
//! defaults, per-store defaults, and per-entity overrides; resolution is
//! field-by-field, an entity option left unset inherits the store value.

use std::sync::Arc;

use chimera_ql::OperatorSet;

use crate::entity::{EntityName, IdGetter};
use crate::source::DataSource;

/// Store-wide defaults.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Enables identity and consistency verification of trusted responses,
    /// downgrading some rejections to warnings. See the trust policy on the
    /// query operations.
    pub dev_mode: bool,
    /// Accept server responses without local verification.
    pub trust_query: bool,
    /// Operators available to filter descriptors.
    pub operators: OperatorSet,
}

impl Default for StoreConfig {
    fn default() -> Self { Self { dev_mode: false, trust_query: false, operators: OperatorSet::default() } }
}

/// Per-entity overrides, merged over [`StoreConfig`] at store build time.
pub struct EntityOptions<E> {
    pub(crate) source: Option<Arc<dyn DataSource<E>>>,
    pub(crate) id_getter: Option<IdGetter<E>>,
    pub(crate) trust_query: Option<bool>,
}

impl<E> Default for EntityOptions<E> {
    fn default() -> Self { Self { source: None, id_getter: None, trust_query: None } }
}

impl<E> Clone for EntityOptions<E> {
    fn clone(&self) -> Self {
        Self { source: self.source.clone(), id_getter: self.id_getter.clone(), trust_query: self.trust_query }
    }
}

impl<E> EntityOptions<E> {
    pub fn new() -> Self { Self::default() }

    pub fn source(mut self, source: impl DataSource<E> + 'static) -> Self
    where E: crate::entity::EntityRecord {
        self.source = Some(Arc::new(source));
        self
    }

    /// Identity comes from this field key (the default is `"id"`).
    pub fn id_field(mut self, key: impl Into<String>) -> Self {
        self.id_getter = Some(IdGetter::Field(key.into()));
        self
    }

    /// Identity comes from this function.
    pub fn id_with(mut self, f: impl Fn(&E) -> crate::entity::EntityId + Send + Sync + 'static) -> Self {
        self.id_getter = Some(IdGetter::Func(Arc::new(f)));
        self
    }

    pub fn trust_query(mut self, trust: bool) -> Self {
        self.trust_query = Some(trust);
        self
    }
}

/// Fully resolved configuration for one entity kind, shared by its
/// repository and every query it creates.
pub(crate) struct EntityConfig<E> {
    pub name: EntityName,
    pub source: Arc<dyn DataSource<E>>,
    pub id_getter: IdGetter<E>,
    pub trust_query: bool,
    pub dev_mode: bool,
    pub operators: OperatorSet,
}
