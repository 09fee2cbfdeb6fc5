//! Version-guarded read-modify-write with bounded retry.

use crate::error::{UayError, UayResult};
use crate::models::{POSTS, USERS};
use crate::store::{Document, DocumentStore, StoreError, WriteBatch};

pub(crate) enum Step<T> {
    /// Nothing to write; the document already has the desired state.
    Done(T),
    /// Commit the batch, then return the value. The batch should carry a
    /// version precondition taken from the document handed to the planner.
    Write(WriteBatch, T),
}

pub(crate) fn guarded_write<T, F>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    max_attempts: usize,
    mut plan: F,
) -> UayResult<T>
where
    F: FnMut(&Document) -> UayResult<Step<T>>,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(document) = store.get(collection, id)? else {
            return Err(not_found(collection, id));
        };
        match plan(&document)? {
            Step::Done(value) => return Ok(value),
            Step::Write(batch, value) => match store.commit(batch) {
                Ok(()) => return Ok(value),
                Err(StoreError::VersionConflict { found, .. }) => {
                    tracing::debug!(
                        collection,
                        id,
                        attempt,
                        read_version = document.version,
                        found,
                        "write lost a version race; retrying"
                    );
                }
                Err(err) => return Err(err.into()),
            },
        }
    }
    tracing::warn!(collection, id, attempts, "giving up on contended document");
    Err(UayError::Contention {
        collection: collection.to_string(),
        id: id.to_string(),
        attempts,
    })
}

fn not_found(collection: &str, id: &str) -> UayError {
    match collection {
        POSTS => UayError::post_not_found(id),
        USERS => UayError::user_not_found(id),
        _ => UayError::Store(StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }),
    }
}
