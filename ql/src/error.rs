use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QlError {
    /// A filter references an operator name absent from the operator set.
    /// Raised eagerly at predicate compile time, never during evaluation.
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
}
