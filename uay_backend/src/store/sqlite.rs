use super::listeners::ListenerRegistry;
use super::{
    validate_field_name, Document, DocumentStore, FieldUpdate, Fields, ListenSink, ListenerId,
    Precondition, Query, StoreError, StoreResult, WriteBatch, WriteOp,
};
use crate::database::repositories::{ClockRepository, DocumentRepository, SqliteRepositories};
use crate::database::Database;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// [`DocumentStore`] persisted as JSON rows in SQLite. Listeners live in
/// process and are re-evaluated after every commit touching their collection.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    database: Database,
    listeners: Arc<Mutex<ListenerRegistry>>,
}

impl SqliteDocumentStore {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
        }
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .map(|registry| registry.len())
            .unwrap_or_default()
    }

    fn notify(&self, collections: &HashSet<String>) {
        let Ok(mut registry) = self.listeners.lock() else {
            tracing::error!("listener registry poisoned; dropping notifications");
            return;
        };
        let mut closed = Vec::new();
        for (id, query, sink) in registry.watching(collections) {
            let result = self.query(query);
            if let Err(err) = &result {
                tracing::warn!(error = %err, collection = %query.collection, "live query failed");
            }
            if !sink.deliver(result) {
                closed.push(id);
            }
        }
        for id in closed {
            registry.remove(id);
            tracing::debug!(listener = ?id, "removed listener with closed receiver");
        }
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let collections: HashSet<String> = batch
            .ops()
            .iter()
            .map(|op| op.collection().to_string())
            .collect();
        let op_count = batch.ops().len();

        self.database.with_transaction(|repos| {
            let mut commit_time = None;
            for op in batch.into_ops() {
                apply_op(&repos, op, &mut commit_time)?;
            }
            Ok(())
        })?;
        tracing::debug!(ops = op_count, collections = ?collections, "committed write batch");

        self.notify(&collections);
        Ok(())
    }

    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        self.database
            .with_repositories(|repos| repos.documents().get(collection, id))
    }

    fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        self.database
            .with_repositories(|repos| repos.documents().query(query))
    }

    fn listen(&self, query: Query, sink: ListenSink) -> StoreResult<ListenerId> {
        query.validate()?;
        // Registry stays locked across the initial read so no commit can
        // slip between the first snapshot and registration.
        let mut registry = self.listeners.lock().map_err(|_| StoreError::Poisoned)?;
        let documents = self.query(&query)?;
        sink.deliver(Ok(documents));
        let id = registry.insert(query, sink);
        tracing::debug!(listener = ?id, "registered live query");
        Ok(id)
    }

    fn unlisten(&self, id: ListenerId) -> bool {
        match self.listeners.lock() {
            Ok(mut registry) => registry.remove(id),
            Err(_) => false,
        }
    }
}

fn apply_op(
    repos: &SqliteRepositories<'_>,
    op: WriteOp,
    commit_time: &mut Option<i64>,
) -> StoreResult<()> {
    let documents = repos.documents();
    match op {
        WriteOp::Create {
            collection,
            id,
            fields,
        } => {
            let mut body = Fields::new();
            apply_fields(repos, &mut body, fields, commit_time)?;
            documents.insert(
                &collection,
                &Document {
                    id,
                    version: 1,
                    fields: body,
                },
            )
        }
        WriteOp::Set {
            collection,
            id,
            fields,
        } => {
            let version = documents
                .get(&collection, &id)?
                .map(|existing| existing.version + 1)
                .unwrap_or(1);
            let mut body = Fields::new();
            apply_fields(repos, &mut body, fields, commit_time)?;
            documents.replace(
                &collection,
                &Document {
                    id,
                    version,
                    fields: body,
                },
            )
        }
        WriteOp::Update {
            collection,
            id,
            fields,
            precondition,
        } => {
            let Some(mut document) = documents.get(&collection, &id)? else {
                return Err(StoreError::NotFound { collection, id });
            };
            if let Precondition::Version(expected) = precondition {
                if document.version != expected {
                    return Err(StoreError::VersionConflict {
                        collection,
                        id,
                        expected,
                        found: document.version,
                    });
                }
            }
            apply_fields(repos, &mut document.fields, fields, commit_time)?;
            document.version += 1;
            documents.replace(&collection, &document)
        }
    }
}

fn apply_fields(
    repos: &SqliteRepositories<'_>,
    body: &mut Fields,
    updates: Vec<(String, FieldUpdate)>,
    commit_time: &mut Option<i64>,
) -> StoreResult<()> {
    for (name, update) in updates {
        validate_field_name(&name).map_err(|_| StoreError::InvalidUpdate {
            field: name.clone(),
            reason: "unsupported field name".into(),
        })?;
        match update {
            FieldUpdate::Set(value) => {
                body.insert(name, value);
            }
            FieldUpdate::Increment(delta) => {
                let current = match body.get(&name) {
                    None | Some(Value::Null) => 0,
                    Some(Value::Number(number)) => number
                        .as_i64()
                        .or_else(|| number.as_f64().map(|float| float as i64))
                        .unwrap_or_default(),
                    Some(_) => {
                        return Err(StoreError::InvalidUpdate {
                            field: name,
                            reason: "increment on a non-numeric value".into(),
                        })
                    }
                };
                body.insert(name, Value::from(current.saturating_add(delta)));
            }
            FieldUpdate::ArrayUnion(value) => {
                let mut items = take_array(body, &name)?;
                if !items.contains(&value) {
                    items.push(value);
                }
                body.insert(name, Value::Array(items));
            }
            FieldUpdate::ArrayRemove(value) => {
                let mut items = take_array(body, &name)?;
                items.retain(|item| item != &value);
                body.insert(name, Value::Array(items));
            }
            FieldUpdate::ServerTimestamp => {
                let timestamp = match commit_time {
                    Some(timestamp) => *timestamp,
                    None => {
                        let timestamp = repos.clock().next_timestamp()?;
                        *commit_time = Some(timestamp);
                        timestamp
                    }
                };
                body.insert(name, Value::from(timestamp));
            }
            FieldUpdate::Delete => {
                body.remove(&name);
            }
        }
    }
    Ok(())
}

fn take_array(body: &mut Fields, name: &str) -> StoreResult<Vec<Value>> {
    match body.remove(name) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => {
            body.insert(name.to_string(), other);
            Err(StoreError::InvalidUpdate {
                field: name.to_string(),
                reason: "array operation on a non-array value".into(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{field, ListenEvent};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn store() -> SqliteDocumentStore {
        SqliteDocumentStore::open_in_memory().expect("store")
    }

    #[test]
    fn create_assigns_monotonic_server_timestamps() {
        let store = store();
        let mut stamps = Vec::new();
        for i in 0..5 {
            let id = store
                .create(
                    "posts",
                    vec![
                        field("body", FieldUpdate::Set(json!(format!("post {i}")))),
                        field("createdAt", FieldUpdate::ServerTimestamp),
                    ],
                )
                .unwrap();
            let doc = store.get("posts", &id).unwrap().unwrap();
            assert_eq!(doc.version, 1);
            stamps.push(doc.field("createdAt").and_then(Value::as_i64).unwrap());
        }
        assert!(stamps.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[test]
    fn field_primitives_apply_server_side() {
        let store = store();
        let id = store
            .create(
                "posts",
                vec![field("likedBy", FieldUpdate::Set(json!(["a"])))],
            )
            .unwrap();

        store
            .update(
                "posts",
                &id,
                vec![
                    field("likeCount", FieldUpdate::Increment(2)),
                    field("likedBy", FieldUpdate::ArrayUnion(json!("b"))),
                    field("repostedBy", FieldUpdate::ArrayRemove(json!("x"))),
                ],
                Precondition::None,
            )
            .unwrap();
        store
            .update(
                "posts",
                &id,
                vec![
                    field("likeCount", FieldUpdate::Increment(-1)),
                    field("likedBy", FieldUpdate::ArrayUnion(json!("b"))),
                    field("likedBy", FieldUpdate::ArrayRemove(json!("a"))),
                ],
                Precondition::None,
            )
            .unwrap();

        let doc = store.get("posts", &id).unwrap().unwrap();
        assert_eq!(doc.version, 3);
        assert_eq!(doc.field("likeCount"), Some(&json!(1)));
        assert_eq!(doc.field("likedBy"), Some(&json!(["b"])));
        assert_eq!(doc.field("repostedBy"), Some(&json!([])));
    }

    #[test]
    fn version_precondition_detects_conflicts() {
        let store = store();
        let id = store
            .create("posts", vec![field("body", FieldUpdate::Set(json!("x")))])
            .unwrap();
        store
            .update(
                "posts",
                &id,
                vec![field("body", FieldUpdate::Set(json!("y")))],
                Precondition::Version(1),
            )
            .unwrap();
        let err = store
            .update(
                "posts",
                &id,
                vec![field("body", FieldUpdate::Set(json!("z")))],
                Precondition::Version(1),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
        let doc = store.get("posts", &id).unwrap().unwrap();
        assert_eq!(doc.field("body"), Some(&json!("y")));
    }

    #[test]
    fn failed_batch_rolls_back_every_write() {
        let store = store();
        store
            .commit({
                let mut batch = WriteBatch::new();
                batch.set("users", "alice", vec![field("following", FieldUpdate::Set(json!([])))]);
                batch
            })
            .unwrap();

        let mut batch = WriteBatch::new();
        batch.update(
            "users",
            "alice",
            vec![field("following", FieldUpdate::ArrayUnion(json!("ghost")))],
        );
        batch.update(
            "users",
            "ghost",
            vec![field("followers", FieldUpdate::ArrayUnion(json!("alice")))],
        );
        let err = store.commit(batch).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        let alice = store.get("users", "alice").unwrap().unwrap();
        assert_eq!(alice.field("following"), Some(&json!([])));
        assert_eq!(alice.version, 1);
    }

    #[test]
    fn listeners_receive_initial_and_updated_snapshots() {
        let store = store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = store
            .listen(
                Query::collection("posts").order_by_desc("createdAt"),
                ListenSink::new(7, tx),
            )
            .unwrap();

        match rx.try_recv().unwrap() {
            ListenEvent::Snapshot { tag, documents } => {
                assert_eq!(tag, 7);
                assert!(documents.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }

        store
            .create("posts", vec![field("createdAt", FieldUpdate::ServerTimestamp)])
            .unwrap();
        match rx.try_recv().unwrap() {
            ListenEvent::Snapshot { documents, .. } => assert_eq!(documents.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }

        store
            .create("users", vec![field("username", FieldUpdate::Set(json!("@x")))])
            .unwrap();
        assert!(rx.try_recv().is_err(), "other collections do not notify");

        assert!(store.unlisten(listener));
        store
            .create("posts", vec![field("createdAt", FieldUpdate::ServerTimestamp)])
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let store = store();
        let (tx, rx) = mpsc::unbounded_channel();
        store
            .listen(Query::collection("posts"), ListenSink::new(1, tx))
            .unwrap();
        drop(rx);
        store
            .create("posts", vec![field("body", FieldUpdate::Set(json!("x")))])
            .unwrap();
        assert_eq!(store.listener_count(), 0);
    }
}
