use serde::{Deserialize, Serialize};

/// A scalar field value. An absent field (`None` from [`crate::Filterable::value`])
/// plays the role of SQL null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    I64(i64),
    F64(f64),
    Bool(bool),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_owned()) }
}
impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::I64(i) }
}
impl From<i32> for Value {
    fn from(i: i32) -> Self { Value::I64(i as i64) }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self { Value::F64(f) }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}

/// The right-hand side of a comparison: a single value, or a list for
/// membership operators (`in`, `notIn`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Value(Value),
    List(Vec<Value>),
}

impl Operand {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Operand::Value(v) => Some(v),
            Operand::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Operand::List(l) => Some(l),
            Operand::Value(_) => None,
        }
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self { Operand::Value(v) }
}
impl From<Vec<Value>> for Operand {
    fn from(values: Vec<Value>) -> Self { Operand::List(values) }
}
impl From<&str> for Operand {
    fn from(s: &str) -> Self { Operand::Value(s.into()) }
}
impl From<String> for Operand {
    fn from(s: String) -> Self { Operand::Value(s.into()) }
}
impl From<i64> for Operand {
    fn from(i: i64) -> Self { Operand::Value(i.into()) }
}
impl From<i32> for Operand {
    fn from(i: i32) -> Self { Operand::Value(i.into()) }
}
impl From<f64> for Operand {
    fn from(f: f64) -> Self { Operand::Value(f.into()) }
}
impl From<bool> for Operand {
    fn from(b: bool) -> Self { Operand::Value(b.into()) }
}

/// A single `field op value` test against an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub field: String,
    pub op: String,
    #[serde(rename = "value")]
    pub operand: Operand,
}

/// A filter descriptor tree. `Option<Filter>` is used at API boundaries;
/// an absent filter matches everything.
///
/// The serde representation is the wire shape used by descriptor payloads:
/// `{"field","op","value"}`, `{"and":[..]}`, `{"or":[..]}`, `{"not":{..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Cmp(Comparison),
    And { and: Vec<Filter> },
    Or { or: Vec<Filter> },
    Not { not: Box<Filter> },
}

impl Filter {
    pub fn cmp(field: impl Into<String>, op: impl Into<String>, operand: impl Into<Operand>) -> Self {
        Filter::Cmp(Comparison { field: field.into(), op: op.into(), operand: operand.into() })
    }

    pub fn and(children: impl IntoIterator<Item = Filter>) -> Self { Filter::And { and: children.into_iter().collect() } }

    pub fn or(children: impl IntoIterator<Item = Filter>) -> Self { Filter::Or { or: children.into_iter().collect() } }

    pub fn not(child: Filter) -> Self { Filter::Not { not: Box::new(child) } }
}

/// Null placement for one order priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nulls {
    First,
    Last,
}

/// One priority of an order descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Priority {
    pub field: String,
    #[serde(rename = "desc", default, skip_serializing_if = "std::ops::Not::not")]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nulls: Option<Nulls>,
}

impl Priority {
    pub fn asc(field: impl Into<String>) -> Self { Self { field: field.into(), descending: false, nulls: None } }

    pub fn desc(field: impl Into<String>) -> Self { Self { field: field.into(), descending: true, nulls: None } }

    pub fn nulls(mut self, nulls: Nulls) -> Self {
        self.nulls = Some(nulls);
        self
    }
}

/// An order descriptor: priorities in decreasing significance. Empty means
/// unordered; the compiled comparator then reports every pair as equal and
/// insertion order acts as the stable tiebreak.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderBy(pub Vec<Priority>);

impl OrderBy {
    pub fn unordered() -> Self { Self(Vec::new()) }

    pub fn asc(field: impl Into<String>) -> Self { Self(vec![Priority::asc(field)]) }

    pub fn desc(field: impl Into<String>) -> Self { Self(vec![Priority::desc(field)]) }

    pub fn then(mut self, priority: Priority) -> Self {
        self.0.push(priority);
        self
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl From<Vec<Priority>> for OrderBy {
    fn from(priorities: Vec<Priority>) -> Self { Self(priorities) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_wire_roundtrip() {
        let filter = Filter::and([
            Filter::cmp("status", "eq", "open"),
            Filter::or([Filter::cmp("prio", "lte", 2), Filter::not(Filter::cmp("name", "startsWith", "tmp"))]),
        ]);

        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "and": [
                    {"field": "status", "op": "eq", "value": "open"},
                    {"or": [
                        {"field": "prio", "op": "lte", "value": 2},
                        {"not": {"field": "name", "op": "startsWith", "value": "tmp"}},
                    ]},
                ]
            })
        );

        let back: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn operand_list_wire_shape() {
        let filter = Filter::cmp("status", "in", Operand::List(vec!["open".into(), "stale".into()]));
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json, serde_json::json!({"field": "status", "op": "in", "value": ["open", "stale"]}));
    }

    #[test]
    fn order_wire_defaults() {
        let order = OrderBy::asc("prio").then(Priority::desc("created").nulls(Nulls::Last));
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json, serde_json::json!([{"field": "prio"}, {"field": "created", "desc": true, "nulls": "last"}]));

        let back: OrderBy = serde_json::from_value(json).unwrap();
        assert_eq!(back, order);
    }
}
