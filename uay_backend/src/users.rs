use crate::error::{UayError, UayResult, ValidationError};
use crate::media::{ObjectStore, PendingFile, ProgressFn};
use crate::models::{Author, UserProfile, USERS};
use crate::store::{field, FieldUpdate, Precondition, Query, SharedStore, StoreError, WriteBatch};
use serde_json::{json, Value};
use std::sync::Arc;

/// Reservation documents keyed by username; creating one is what makes a
/// username unique.
pub const USERNAMES: &str = "usernames";

const SEARCH_MIN_CHARS: usize = 2;
const SEARCH_LIMIT: usize = 10;

#[derive(Clone)]
pub struct UserDirectory {
    store: SharedStore,
    objects: Arc<dyn ObjectStore>,
}

impl UserDirectory {
    pub fn new(store: SharedStore, objects: Arc<dyn ObjectStore>) -> Self {
        Self { store, objects }
    }

    pub fn register(&self, user_id: &str, username: &str, email: &str) -> UayResult<UserProfile> {
        let username = normalize_username(username)?;

        let mut batch = WriteBatch::new();
        batch
            .create_with_id(
                USERNAMES,
                username.clone(),
                vec![field("userId", FieldUpdate::Set(json!(user_id)))],
            )
            .create_with_id(
                USERS,
                user_id,
                vec![
                    field("username", FieldUpdate::Set(json!(username))),
                    field("email", FieldUpdate::Set(json!(email.trim()))),
                    field("photoUrl", FieldUpdate::Set(Value::Null)),
                    field("following", FieldUpdate::Set(json!([]))),
                    field("followers", FieldUpdate::Set(json!([]))),
                    field("createdAt", FieldUpdate::ServerTimestamp),
                ],
            );
        match self.store.commit(batch) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { collection, .. }) if collection == USERNAMES => {
                return Err(ValidationError::UsernameTaken(username).into());
            }
            Err(err) => return Err(err.into()),
        }

        tracing::info!(user_id, username = %username, "user registered");
        self.profile(user_id)
    }

    pub fn profile(&self, user_id: &str) -> UayResult<UserProfile> {
        let document = self
            .store
            .get(USERS, user_id)?
            .ok_or_else(|| UayError::user_not_found(user_id))?;
        Ok(UserProfile::from_document(&document))
    }

    /// Display details stamped onto posts and comments the user writes.
    pub fn author_for(&self, user_id: &str) -> UayResult<Author> {
        Ok(self.profile(user_id)?.as_author())
    }

    /// Usernames starting with `term`. Terms shorter than two characters
    /// match nothing.
    pub fn search(&self, term: &str) -> UayResult<Vec<UserProfile>> {
        let term = term.trim();
        if term.chars().count() < SEARCH_MIN_CHARS {
            return Ok(Vec::new());
        }
        let documents = self.store.query(
            &Query::collection(USERS)
                .where_prefix("username", term)
                .limit(SEARCH_LIMIT),
        )?;
        Ok(documents.iter().map(UserProfile::from_document).collect())
    }

    pub fn set_avatar(&self, user_id: &str, uri: &str) -> UayResult<()> {
        match self.store.update(
            USERS,
            user_id,
            vec![field("photoUrl", FieldUpdate::Set(json!(uri)))],
            Precondition::None,
        ) {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound { .. }) => Err(UayError::user_not_found(user_id)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn upload_avatar(&self, user_id: &str, file: PendingFile) -> UayResult<String> {
        self.profile(user_id)?;
        let progress: ProgressFn = Arc::new(|_, _| {});
        let uri = self
            .objects
            .upload(user_id, &file.name, file.data, progress)
            .await
            .map_err(UayError::Upload)?;
        self.set_avatar(user_id, &uri)?;
        Ok(uri)
    }
}

fn normalize_username(raw: &str) -> Result<String, ValidationError> {
    let username = raw.trim();
    match username.strip_prefix('@') {
        Some(rest) if !rest.is_empty() => Ok(username.to_string()),
        _ => Err(ValidationError::InvalidUsername),
    }
}
