//! Filter items based on a compiled predicate. Compilation resolves every
//! operator name and field reference up front so evaluation is a pure tree
//! walk with no lookups and no failure paths.

use std::sync::Arc;

use crate::ast::{Filter, Operand};
use crate::error::QlError;
use crate::operator::{OperatorFn, OperatorSet};

/// Field access for filter evaluation and ordering. The implementation is the
/// field getter: a typed domain model resolves key strings however it likes,
/// including computed values.
pub trait Filterable {
    fn value(&self, field: &str) -> Option<crate::ast::Value>;
}

#[derive(Clone)]
enum Node {
    /// Absent descriptor: matches everything.
    All,
    Test { field: String, test: Arc<OperatorFn>, operand: Operand },
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

/// A compiled filter predicate.
#[derive(Clone)]
pub struct Predicate(Node);

impl Predicate {
    /// Compile a descriptor against an operator set. An operator name missing
    /// from the set fails here with [`QlError::UnknownOperator`], never later
    /// during evaluation.
    pub fn compile(filter: Option<&Filter>, operators: &OperatorSet) -> Result<Self, QlError> {
        match filter {
            None => Ok(Self(Node::All)),
            Some(f) => Ok(Self(compile_node(f, operators)?)),
        }
    }

    pub fn matches<F: Filterable>(&self, item: &F) -> bool { eval(&self.0, item) }
}

fn compile_node(filter: &Filter, operators: &OperatorSet) -> Result<Node, QlError> {
    match filter {
        Filter::Cmp(cmp) => {
            let test = operators.get(&cmp.op).ok_or_else(|| QlError::UnknownOperator(cmp.op.clone()))?;
            Ok(Node::Test { field: cmp.field.clone(), test, operand: cmp.operand.clone() })
        }
        Filter::And { and } => Ok(Node::And(and.iter().map(|c| compile_node(c, operators)).collect::<Result<_, _>>()?)),
        Filter::Or { or } => Ok(Node::Or(or.iter().map(|c| compile_node(c, operators)).collect::<Result<_, _>>()?)),
        Filter::Not { not } => Ok(Node::Not(Box::new(compile_node(not, operators)?))),
    }
}

fn eval<F: Filterable>(node: &Node, item: &F) -> bool {
    match node {
        Node::All => true,
        Node::Test { field, test, operand } => (&**test)(item.value(field).as_ref(), operand),
        Node::And(children) => children.iter().all(|c| eval(c, item)),
        Node::Or(children) => children.iter().any(|c| eval(c, item)),
        Node::Not(child) => !eval(child, item),
    }
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "Predicate(..)") }
}
