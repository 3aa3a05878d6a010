pub mod ast;
pub mod collation;
pub mod error;
pub mod operator;
pub mod order;
pub mod selection;

pub use ast::{Comparison, Filter, Nulls, Operand, OrderBy, Priority, Value};
pub use error::QlError;
pub use operator::OperatorSet;
pub use order::Comparator;
pub use selection::canonical::{canonical_key, is_subset, simplify};
pub use selection::filter::{Filterable, Predicate};
