use crate::store::StoreError;
use thiserror::Error;

/// Input rejected before any write reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("post needs a body or at least one attachment")]
    EmptyPost,
    #[error("comment body may not be empty")]
    EmptyComment,
    #[error("username must start with '@' and contain at least one more character")]
    InvalidUsername,
    #[error("username {0} is already taken")]
    UsernameTaken(String),
    #[error("users cannot follow themselves")]
    SelfFollow,
}

#[derive(Debug, Error)]
pub enum UayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("comment {parent_id} not found on post {post_id}")]
    CommentNotFound { post_id: String, parent_id: String },
    #[error("{0} upload(s) still in flight")]
    UploadsPending(usize),
    #[error("gave up on {collection}/{id} after {attempts} conflicting writes")]
    Contention {
        collection: String,
        id: String,
        attempts: usize,
    },
    #[error("no signed-in user")]
    Unauthenticated,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("upload failed: {0:#}")]
    Upload(anyhow::Error),
}

impl UayError {
    pub fn post_not_found(id: impl Into<String>) -> Self {
        UayError::NotFound {
            kind: "post",
            id: id.into(),
        }
    }

    pub fn user_not_found(id: impl Into<String>) -> Self {
        UayError::NotFound {
            kind: "user",
            id: id.into(),
        }
    }
}

pub type UayResult<T> = Result<T, UayError>;
