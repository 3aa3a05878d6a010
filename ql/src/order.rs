//! The order engine: compile an order descriptor into a comparator and give
//! it a canonical key for cache indexing.

use std::cmp::Ordering;

use crate::ast::{Nulls, OrderBy, Priority};
use crate::collation;
use crate::selection::filter::Filterable;

/// A compiled comparator. Priorities are evaluated in descriptor order;
/// earlier priorities dominate and ties fall through to the next. An empty
/// descriptor compares everything equal.
#[derive(Debug, Clone)]
pub struct Comparator {
    priorities: Vec<Priority>,
}

impl Comparator {
    pub fn compile(order: &OrderBy) -> Self { Self { priorities: order.0.clone() } }

    pub fn compare<F: Filterable>(&self, a: &F, b: &F) -> Ordering {
        for priority in &self.priorities {
            let ord = compare_priority(priority, a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// When a priority carries no explicit null policy: nulls last ascending,
/// first descending, so nulls land at the tail either way.
fn effective_nulls(priority: &Priority) -> Nulls {
    match (priority.nulls, priority.descending) {
        (Some(n), _) => n,
        (None, false) => Nulls::Last,
        (None, true) => Nulls::First,
    }
}

fn compare_priority<F: Filterable>(priority: &Priority, a: &F, b: &F) -> Ordering {
    let va = a.value(&priority.field);
    let vb = b.value(&priority.field);
    match (va, vb) {
        (None, None) => Ordering::Equal,
        // Null placement is absolute: it is not inverted by `descending`.
        (None, Some(_)) => match effective_nulls(priority) {
            Nulls::First => Ordering::Less,
            Nulls::Last => Ordering::Greater,
        },
        (Some(_), None) => match effective_nulls(priority) {
            Nulls::First => Ordering::Greater,
            Nulls::Last => Ordering::Less,
        },
        (Some(va), Some(vb)) => {
            let ord = collation::compare(&va, &vb);
            if priority.descending {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

impl OrderBy {
    /// Deterministic serialization of the priority list, used as a cache key
    /// component. Structurally equal descriptors produce identical keys.
    pub fn canonical_key(&self) -> String {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|p| {
                let dir = if p.descending { "desc" } else { "asc" };
                let nulls = match p.nulls {
                    Some(Nulls::First) => ":nf",
                    Some(Nulls::Last) => ":nl",
                    None => "",
                };
                format!("{}:{}{}", p.field, dir, nulls)
            })
            .collect();
        parts.join(",")
    }
}
