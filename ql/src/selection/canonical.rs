//! Canonicalization of filter descriptors: a normal form that erases source
//! ordering, a deterministic key for cache indexing, and a conservative
//! implication check used to seed new collections from loaded ones.

use crate::ast::{Comparison, Filter};

fn comparison_key(cmp: &Comparison) -> String {
    // serde_json keeps scalar serialization deterministic, and quoting makes
    // the parts unambiguous for fields or operator names with delimiters.
    format!(
        "cmp[{},{},{}]",
        serde_json::to_string(&cmp.field).expect("string serializes"),
        serde_json::to_string(&cmp.op).expect("string serializes"),
        serde_json::to_string(&cmp.operand).expect("operand serializes"),
    )
}

fn node_key(filter: &Filter) -> String {
    match filter {
        Filter::Cmp(cmp) => comparison_key(cmp),
        Filter::And { and } => format!("and[{}]", and.iter().map(node_key).collect::<Vec<_>>().join(",")),
        Filter::Or { or } => format!("or[{}]", or.iter().map(node_key).collect::<Vec<_>>().join(",")),
        Filter::Not { not } => format!("not[{}]", node_key(not)),
    }
}

/// Normal form: children of every conjunction are recursively simplified,
/// comparisons come before nested conjunctions, and each group is sorted by
/// its canonical serialization, so structurally equivalent filters compare
/// equal regardless of source order.
pub fn simplify(filter: &Filter) -> Filter {
    match filter {
        Filter::Cmp(_) => filter.clone(),
        Filter::And { and } => Filter::And { and: simplify_children(and) },
        Filter::Or { or } => Filter::Or { or: simplify_children(or) },
        Filter::Not { not } => Filter::not(simplify(not)),
    }
}

fn simplify_children(children: &[Filter]) -> Vec<Filter> {
    let mut comparisons = Vec::new();
    let mut nested = Vec::new();
    for child in children {
        let child = simplify(child);
        match child {
            Filter::Cmp(_) => comparisons.push(child),
            _ => nested.push(child),
        }
    }
    comparisons.sort_by_cached_key(node_key);
    nested.sort_by_cached_key(node_key);
    comparisons.extend(nested);
    comparisons
}

/// Deterministic cache key of a descriptor. `None` (match-all) has its own
/// distinguished key.
pub fn canonical_key(filter: Option<&Filter>) -> String {
    match filter {
        None => "*".to_owned(),
        Some(f) => node_key(&simplify(f)),
    }
}

/// Conservative implication check: when this returns true, every entity
/// matching `candidate` also matches `target`. False negatives are allowed
/// and expected; false positives are not.
pub fn is_subset(candidate: Option<&Filter>, target: Option<&Filter>) -> bool {
    match (candidate, target) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(c), Some(t)) => implies(&simplify(c), &simplify(t)),
    }
}

/// Both arguments must be in simplified form. Each arm is sound:
/// - `not` children must be canonically identical.
/// - Implying an `and` means implying every branch.
/// - An `or` candidate implies `t` only if every disjunct does.
/// - An `and` candidate implies `t` if any single conjunct does.
/// - Implying an `or` means implying some branch.
fn implies(c: &Filter, t: &Filter) -> bool {
    match (c, t) {
        (Filter::Not { not: a }, Filter::Not { not: b }) => node_key(a) == node_key(b),
        (Filter::Not { .. }, _) | (_, Filter::Not { .. }) => false,
        (c, Filter::And { and }) => and.iter().all(|branch| implies(c, branch)),
        (Filter::Or { or }, t) => or.iter().all(|disjunct| implies(disjunct, t)),
        (Filter::And { and }, t) => and.iter().any(|conjunct| implies(conjunct, t)),
        (c, Filter::Or { or }) => or.iter().any(|branch| implies(c, branch)),
        (Filter::Cmp(a), Filter::Cmp(b)) => comparison_key(a) == comparison_key(b),
    }
}
