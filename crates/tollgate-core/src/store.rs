use crate::error::{TollgateError, TollgateResult};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Durable document store. Every Tollgate entity lives here.
///
/// Documents are JSON objects addressed by `(collection, id)`. Implementations
/// only need to move raw JSON; typing happens once in [`DocumentStoreExt`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, `None` if it does not exist.
    async fn get(&self, collection: &str, id: &str) -> TollgateResult<Option<Value>>;

    /// Insert or replace a document.
    async fn set(&self, collection: &str, id: &str, doc: Value) -> TollgateResult<()>;

    /// Shallow-merge `partial` (a JSON object) into an existing document.
    ///
    /// Fails with [`TollgateError::NotFound`] if the document does not exist.
    async fn update(&self, collection: &str, id: &str, partial: Value) -> TollgateResult<()>;

    /// Run a filtered, ordered, limited query over a collection.
    async fn query(&self, collection: &str, query: &Query) -> TollgateResult<Vec<Value>>;
}

/// Typed access to a [`DocumentStore`].
///
/// This is the single serde boundary between domain types and stored JSON.
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    /// Fetch and deserialize a document.
    async fn get_as<T>(&self, collection: &str, id: &str) -> TollgateResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(collection, id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    /// Serialize and upsert a document.
    async fn set_as<T>(&self, collection: &str, id: &str, value: &T) -> TollgateResult<()>
    where
        T: Serialize + Sync,
    {
        let doc = serde_json::to_value(value)?;
        if !doc.is_object() {
            return Err(TollgateError::Validation(format!(
                "documents must be JSON objects ({collection}/{id})"
            )));
        }
        self.set(collection, id, doc).await
    }

    /// Query and deserialize every matching document.
    async fn query_as<T>(&self, collection: &str, query: &Query) -> TollgateResult<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.query(collection, query)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(TollgateError::from))
            .collect()
    }
}

impl<S: DocumentStore + ?Sized> DocumentStoreExt for S {}

/// Comparison operator in a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    /// Field equals value.
    Eq,
    /// Field differs from value.
    Ne,
    /// Field is less than value.
    Lt,
    /// Field is less than or equal to value.
    Lte,
    /// Field is greater than value.
    Gt,
    /// Field is greater than or equal to value.
    Gte,
    /// Field equals one of the values in an array.
    In,
}

/// A single `field op value` predicate. Fields may be dotted paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field path, e.g. `status` or `metadata.delegated_from`.
    pub field: String,
    /// Operator.
    pub op: FilterOp,
    /// Operand.
    pub value: Value,
}

/// Sort direction for [`OrderBy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// One ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field path.
    pub field: String,
    /// Direction.
    pub direction: SortDirection,
}

/// A document query: all filters must match; ordering keys apply in turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Conjunctive filters.
    #[serde(default)]
    pub filters: Vec<Filter>,
    /// Ordering keys, most significant first.
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    /// Maximum number of documents to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    /// An unfiltered query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter.
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Shorthand for an equality filter.
    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    /// Add an ordering key.
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document satisfies every filter.
    pub fn matches(&self, doc: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Filter, sort and truncate a set of candidate documents.
    ///
    /// Backends without native query support call this over a full scan.
    pub fn apply(&self, docs: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut matched: Vec<Value> = docs.into_iter().filter(|d| self.matches(d)).collect();
        if !self.order_by.is_empty() {
            matched.sort_by(|a, b| self.compare_docs(a, b));
        }
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }

    fn compare_docs(&self, a: &Value, b: &Value) -> Ordering {
        for key in &self.order_by {
            let ord = match (lookup(a, &key.field), lookup(b, &key.field)) {
                (Some(x), Some(y)) => {
                    let ord = compare_values(x, y).unwrap_or(Ordering::Equal);
                    match key.direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    }
                }
                // Missing fields sort last in either direction.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl Filter {
    /// Whether a document satisfies this predicate. Missing fields never match.
    pub fn matches(&self, doc: &Value) -> bool {
        let Some(actual) = lookup(doc, &self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => values_equal(actual, &self.value),
            FilterOp::Ne => !values_equal(actual, &self.value),
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::In => match &self.value {
                Value::Array(options) => options.iter().any(|o| values_equal(actual, o)),
                _ => false,
            },
        }
    }
}

/// Resolve a dotted field path inside a JSON document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_)) => {
            compare_values(a, b) == Some(Ordering::Equal)
        }
        _ => a == b,
    }
}

/// Order two JSON scalars. RFC 3339 strings compare as instants.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_instant(x), parse_instant(y)) {
            (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn parse_instant(s: &str) -> Option<DateTime<FixedOffset>> {
    // Cheap guard so ordinary strings skip the parser.
    if s.len() < 20 || s.as_bytes().get(4) != Some(&b'-') {
        return None;
    }
    DateTime::parse_from_rfc3339(s).ok()
}

/// Shallow-merge the keys of `partial` into `doc`.
pub fn merge_partial(doc: &mut Value, partial: Value) -> TollgateResult<()> {
    let Value::Object(fields) = partial else {
        return Err(TollgateError::Validation(
            "partial update must be a JSON object".into(),
        ));
    };
    let Some(target) = doc.as_object_mut() else {
        return Err(TollgateError::Validation(
            "stored document is not a JSON object".into(),
        ));
    };
    for (key, value) in fields {
        target.insert(key, value);
    }
    Ok(())
}
