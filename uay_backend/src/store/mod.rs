//! Document store collaborator: JSON documents grouped in collections, with
//! field-level update primitives, atomic batches, cursor queries and live
//! listeners.

mod listeners;
mod sqlite;

pub use listeners::{ListenEvent, ListenSink, ListenerId};
pub use sqlite::SqliteDocumentStore;

use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Maximum operand count accepted by [`Filter::In`].
pub const MAX_IN_VALUES: usize = 10;

pub type Fields = Map<String, Value>;

pub type SharedStore = Arc<dyn DocumentStore>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("document {collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },
    #[error("document {collection}/{id} changed: expected version {expected}, found {found}")]
    VersionConflict {
        collection: String,
        id: String,
        expected: u64,
        found: u64,
    },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid update on field {field}: {reason}")]
    InvalidUpdate { field: String, reason: String },
    #[error("document store lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    /// Bumped by every committed write touching the document.
    pub version: u64,
    pub fields: Fields,
}

impl Document {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Position of a document in a `(timestamp DESC, id DESC)` ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub timestamp: i64,
    pub id: String,
}

impl Cursor {
    pub fn new(timestamp: i64, id: impl Into<String>) -> Self {
        Self {
            timestamp,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    /// Field value is one of the listed values (1..=[`MAX_IN_VALUES`]).
    In(String, Vec<Value>),
    /// String field starts with the given prefix.
    Prefix(String, String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    /// Timestamp field ordered descending, ties broken by id descending.
    pub order_by: Option<String>,
    pub limit: Option<usize>,
    /// Exclusive lower bound in descending order.
    pub start_after: Option<Cursor>,
    /// Inclusive upper bound in descending order.
    pub end_at: Option<Cursor>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
            start_after: None,
            end_at: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Eq(field.into(), value.into()))
    }

    pub fn where_in(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.filter(Filter::In(field.into(), values))
    }

    pub fn where_prefix(self, field: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.filter(Filter::Prefix(field.into(), prefix.into()))
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Cursor) -> Self {
        self.start_after = Some(cursor);
        self
    }

    pub fn end_at(mut self, cursor: Cursor) -> Self {
        self.end_at = Some(cursor);
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        for filter in &self.filters {
            let field = match filter {
                Filter::Eq(field, _) | Filter::Prefix(field, _) => field,
                Filter::In(field, values) => {
                    if values.is_empty() {
                        return Err(StoreError::InvalidQuery(format!(
                            "membership filter on {field} needs at least one value"
                        )));
                    }
                    if values.len() > MAX_IN_VALUES {
                        return Err(StoreError::InvalidQuery(format!(
                            "membership filter on {field} accepts at most {MAX_IN_VALUES} values, got {}",
                            values.len()
                        )));
                    }
                    field
                }
            };
            validate_field_name(field)?;
        }
        match &self.order_by {
            Some(field) => validate_field_name(field)?,
            None if self.start_after.is_some() || self.end_at.is_some() => {
                return Err(StoreError::InvalidQuery(
                    "cursors require an order_by field".into(),
                ));
            }
            None => {}
        }
        Ok(())
    }
}

pub(crate) fn validate_field_name(field: &str) -> StoreResult<()> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidQuery(format!("unsupported field name {field:?}")))
    }
}

/// A single field mutation applied server side.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Set(Value),
    Increment(i64),
    /// Appends the value to an array field unless already present.
    ArrayUnion(Value),
    /// Removes every occurrence of the value from an array field.
    ArrayRemove(Value),
    /// Sets the field to the store's monotonic clock, in milliseconds.
    ServerTimestamp,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    None,
    Version(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Create {
        collection: String,
        id: String,
        fields: Vec<(String, FieldUpdate)>,
    },
    Set {
        collection: String,
        id: String,
        fields: Vec<(String, FieldUpdate)>,
    },
    Update {
        collection: String,
        id: String,
        fields: Vec<(String, FieldUpdate)>,
        precondition: Precondition,
    },
}

impl WriteOp {
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Create { collection, .. }
            | WriteOp::Set { collection, .. }
            | WriteOp::Update { collection, .. } => collection,
        }
    }
}

/// Writes committed together: either every operation applies or none does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a new document and returns its generated id.
    pub fn create(
        &mut self,
        collection: impl Into<String>,
        fields: Vec<(String, FieldUpdate)>,
    ) -> String {
        let id = crate::utils::new_document_id();
        self.create_with_id(collection, id.clone(), fields);
        id
    }

    /// Queues a new document under a caller-chosen id. The commit fails with
    /// `AlreadyExists` if the id is taken.
    pub fn create_with_id(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        fields: Vec<(String, FieldUpdate)>,
    ) -> &mut Self {
        self.ops.push(WriteOp::Create {
            collection: collection.into(),
            id: id.into(),
            fields,
        });
        self
    }

    /// Queues a whole-document write, replacing any existing content.
    pub fn set(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        fields: Vec<(String, FieldUpdate)>,
    ) -> &mut Self {
        self.ops.push(WriteOp::Set {
            collection: collection.into(),
            id: id.into(),
            fields,
        });
        self
    }

    pub fn update(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        fields: Vec<(String, FieldUpdate)>,
    ) -> &mut Self {
        self.update_if(collection, id, fields, Precondition::None)
    }

    pub fn update_if(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        fields: Vec<(String, FieldUpdate)>,
        precondition: Precondition,
    ) -> &mut Self {
        self.ops.push(WriteOp::Update {
            collection: collection.into(),
            id: id.into(),
            fields,
            precondition,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// One entry of an update list, e.g. `field("likeCount", FieldUpdate::Increment(1))`.
pub fn field(name: &str, update: FieldUpdate) -> (String, FieldUpdate) {
    (name.to_string(), update)
}

pub trait DocumentStore: Send + Sync {
    /// Applies every operation atomically. Listeners on touched collections
    /// are notified after the commit.
    fn commit(&self, batch: WriteBatch) -> StoreResult<()>;

    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>>;

    fn query(&self, query: &Query) -> StoreResult<Vec<Document>>;

    /// Registers a live query. The current result set is delivered to `sink`
    /// before this returns, then again after every change to the collection.
    fn listen(&self, query: Query, sink: ListenSink) -> StoreResult<ListenerId>;

    /// Removes a listener. Returns false if it was already gone.
    fn unlisten(&self, id: ListenerId) -> bool;

    fn create(&self, collection: &str, fields: Vec<(String, FieldUpdate)>) -> StoreResult<String> {
        let mut batch = WriteBatch::new();
        let id = batch.create(collection, fields);
        self.commit(batch)?;
        Ok(id)
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Vec<(String, FieldUpdate)>,
        precondition: Precondition,
    ) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.update_if(collection, id, fields, precondition);
        self.commit(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn membership_filter_is_capped() {
        let values: Vec<Value> = (0..11).map(|i| json!(format!("user-{i}"))).collect();
        let query = Query::collection("posts").where_in("authorId", values);
        assert!(matches!(
            query.validate(),
            Err(StoreError::InvalidQuery(_))
        ));

        let empty = Query::collection("posts").where_in("authorId", vec![]);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn cursors_need_ordering() {
        let query = Query::collection("posts").start_after(Cursor::new(1, "a"));
        assert!(query.validate().is_err());
        let ordered = Query::collection("posts")
            .order_by_desc("createdAt")
            .start_after(Cursor::new(1, "a"));
        assert!(ordered.validate().is_ok());
    }

    #[test]
    fn rejects_field_paths() {
        let query = Query::collection("posts").where_eq("author.id", "x");
        assert!(query.validate().is_err());
    }
}
