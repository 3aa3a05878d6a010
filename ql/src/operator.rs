//! The operator map: an explicit, open-set registry from operator name to a
//! binary predicate over `(field value, test operand)`. No reflection; filter
//! compilation resolves names against this map exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{Operand, Value};
use crate::collation;

/// A binary operator predicate. The field value is `None` when the entity has
/// no value for the field (null semantics).
pub type OperatorFn = dyn Fn(Option<&Value>, &Operand) -> bool + Send + Sync;

/// Registry of named operators. Cheap to clone; extend with [`OperatorSet::with`].
#[derive(Clone)]
pub struct OperatorSet {
    ops: HashMap<String, Arc<OperatorFn>>,
}

impl OperatorSet {
    /// An empty set with no operators registered.
    pub fn empty() -> Self { Self { ops: HashMap::new() } }

    /// Register an operator under `name`, replacing any previous registration.
    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where F: Fn(Option<&Value>, &Operand) -> bool + Send + Sync + 'static {
        self.ops.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<OperatorFn>> { self.ops.get(name).cloned() }

    pub fn contains(&self, name: &str) -> bool { self.ops.contains_key(name) }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ops.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

fn ordered(value: Option<&Value>, operand: &Operand, accept: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    match (value, operand.as_value()) {
        (Some(v), Some(t)) => accept(collation::compare(v, t)),
        _ => false,
    }
}

fn string_pair(value: Option<&Value>, operand: &Operand, accept: impl Fn(&str, &str) -> bool) -> bool {
    match (value, operand.as_value()) {
        (Some(Value::String(v)), Some(Value::String(t))) => accept(v, t),
        _ => false,
    }
}

fn member_of(value: Option<&Value>, operand: &Operand) -> bool {
    match (value, operand.as_list()) {
        (Some(v), Some(list)) => list.iter().any(|t| collation::equal(v, t)),
        _ => false,
    }
}

impl Default for OperatorSet {
    /// The built-in operators: comparison (`eq`, `neq`, `gt`, `gte`, `lt`,
    /// `lte`), string match (`contains`, `startsWith`, `endsWith`), and
    /// membership (`in`, `notIn`). Null field values fail every test except
    /// the negative ones (`neq`, `notIn`).
    fn default() -> Self {
        use std::cmp::Ordering::*;
        Self::empty()
            .with("eq", |v, t| ordered(v, t, |o| o == Equal))
            .with("neq", |v, t| match v {
                None => true,
                Some(_) => t.as_value().is_some() && !ordered(v, t, |o| o == Equal),
            })
            .with("gt", |v, t| ordered(v, t, |o| o == Greater))
            .with("gte", |v, t| ordered(v, t, |o| o != Less))
            .with("lt", |v, t| ordered(v, t, |o| o == Less))
            .with("lte", |v, t| ordered(v, t, |o| o != Greater))
            .with("contains", |v, t| string_pair(v, t, |s, needle| s.contains(needle)))
            .with("startsWith", |v, t| string_pair(v, t, |s, prefix| s.starts_with(prefix)))
            .with("endsWith", |v, t| string_pair(v, t, |s, suffix| s.ends_with(suffix)))
            .with("in", member_of)
            .with("notIn", |v, t| match v {
                None => true,
                Some(_) => !member_of(v, t),
            })
    }
}

impl std::fmt::Debug for OperatorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OperatorSet").field(&self.names()).finish()
    }
}
