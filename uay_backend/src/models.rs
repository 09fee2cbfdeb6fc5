//! Domain records read from and written to the document store.
//!
//! Stored documents may come from older clients with missing or malformed
//! fields. `from_document` is the only place those gaps are filled in; the
//! types it returns carry no optional engagement state.

use crate::store::{field, Cursor, Document, FieldUpdate, Fields};
use crate::utils::{new_comment_id, now_utc};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;

pub const POSTS: &str = "posts";
pub const USERS: &str = "users";

/// Who is writing a post or comment, as shown next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Author {
    pub id: String,
    pub display_name: String,
    pub avatar: Option<String>,
}

/// Back-reference carried by a repost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lineage {
    pub original_post_id: String,
    pub original_author_id: String,
    pub original_author_name: String,
    pub original_body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EngagementKind {
    Like,
    Repost,
}

impl EngagementKind {
    pub fn members_field(self) -> &'static str {
        match self {
            EngagementKind::Like => "likedBy",
            EngagementKind::Repost => "repostedBy",
        }
    }

    pub fn count_field(self) -> &'static str {
        match self {
            EngagementKind::Like => "likeCount",
            EngagementKind::Repost => "repostCount",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Post {
    pub id: String,
    /// Store version the post was read at.
    pub version: u64,
    pub author_id: String,
    pub author_name: String,
    pub author_avatar: Option<String>,
    pub body: String,
    pub media_urls: Vec<String>,
    /// `None` while the server timestamp of a fresh write is pending.
    pub created_at: Option<DateTime<Utc>>,
    pub like_count: u64,
    pub liked_by: BTreeSet<String>,
    pub repost_count: u64,
    pub reposted_by: BTreeSet<String>,
    pub comments: Vec<Comment>,
    pub lineage: Option<Lineage>,
}

impl Post {
    pub fn from_document(document: &Document) -> Self {
        let fields = &document.fields;
        let lineage = string_field(fields, "originalPostId").map(|original_post_id| Lineage {
            original_post_id,
            original_author_id: string_field(fields, "originalAuthorId").unwrap_or_default(),
            original_author_name: string_field(fields, "originalAuthorName").unwrap_or_default(),
            original_body: string_field(fields, "originalBody").unwrap_or_default(),
        });
        let mut skipped = 0;
        let comments = comment_list(fields.get("comments"), &mut skipped);
        if skipped > 0 {
            tracing::warn!(post_id = %document.id, skipped, "skipping unreadable comments");
        }

        Self {
            id: document.id.clone(),
            version: document.version,
            author_id: string_field(fields, "authorId").unwrap_or_default(),
            author_name: string_field(fields, "authorName").unwrap_or_default(),
            author_avatar: string_field(fields, "authorAvatar"),
            body: string_field(fields, "body").unwrap_or_default(),
            media_urls: string_list(fields, "mediaUrls"),
            created_at: timestamp_field(fields, "createdAt"),
            like_count: count_field(fields, "likeCount"),
            liked_by: string_list(fields, "likedBy").into_iter().collect(),
            repost_count: count_field(fields, "repostCount"),
            reposted_by: string_list(fields, "repostedBy").into_iter().collect(),
            comments,
            lineage,
        }
    }

    pub fn engaged_by(&self, kind: EngagementKind) -> &BTreeSet<String> {
        match kind {
            EngagementKind::Like => &self.liked_by,
            EngagementKind::Repost => &self.reposted_by,
        }
    }

    /// Feed position, once the server timestamp is known.
    pub fn cursor(&self) -> Option<Cursor> {
        self.created_at
            .map(|created_at| Cursor::new(created_at.timestamp_millis(), self.id.clone()))
    }

    pub fn is_repost(&self) -> bool {
        self.lineage.is_some()
    }
}

/// Content of a post about to be created. Engagement starts at zero and the
/// timestamp is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub author: Author,
    pub body: String,
    pub media_urls: Vec<String>,
    pub lineage: Option<Lineage>,
}

impl NewPost {
    pub fn into_fields(self) -> Vec<(String, FieldUpdate)> {
        let mut fields = vec![
            field("authorId", FieldUpdate::Set(json!(self.author.id))),
            field("authorName", FieldUpdate::Set(json!(self.author.display_name))),
            field("authorAvatar", FieldUpdate::Set(json!(self.author.avatar))),
            field("body", FieldUpdate::Set(json!(self.body))),
            field("mediaUrls", FieldUpdate::Set(json!(self.media_urls))),
            field("createdAt", FieldUpdate::ServerTimestamp),
            field("likeCount", FieldUpdate::Set(json!(0))),
            field("likedBy", FieldUpdate::Set(json!([]))),
            field("repostCount", FieldUpdate::Set(json!(0))),
            field("repostedBy", FieldUpdate::Set(json!([]))),
            field("comments", FieldUpdate::Set(json!([]))),
        ];
        if let Some(lineage) = self.lineage {
            fields.extend([
                field("originalPostId", FieldUpdate::Set(json!(lineage.original_post_id))),
                field("originalAuthorId", FieldUpdate::Set(json!(lineage.original_author_id))),
                field(
                    "originalAuthorName",
                    FieldUpdate::Set(json!(lineage.original_author_name)),
                ),
                field("originalBody", FieldUpdate::Set(json!(lineage.original_body))),
            ]);
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub comment_id: String,
    pub author_id: String,
    pub author_name: String,
    pub author_avatar: Option<String>,
    pub body: String,
    #[serde(serialize_with = "chrono::serde::ts_milliseconds::serialize")]
    pub created_at: DateTime<Utc>,
    pub sub_comments: Vec<Comment>,
}

impl Comment {
    pub fn new(author: &Author, body: impl Into<String>) -> Self {
        Self {
            comment_id: new_comment_id(),
            author_id: author.id.clone(),
            author_name: author.display_name.clone(),
            author_avatar: author.avatar.clone(),
            body: body.into(),
            created_at: now_utc(),
            sub_comments: Vec::new(),
        }
    }

    /// Reads a stored comment field by field. Only a missing `commentId`
    /// makes the node unreadable; anything else falls back to a default.
    fn from_value(value: &Value, skipped: &mut usize) -> Option<Self> {
        let fields = value.as_object()?;
        Some(Self {
            comment_id: string_field(fields, "commentId")?,
            author_id: string_field(fields, "authorId").unwrap_or_default(),
            author_name: string_field(fields, "authorName").unwrap_or_default(),
            author_avatar: string_field(fields, "authorAvatar"),
            body: string_field(fields, "body").unwrap_or_default(),
            created_at: comment_timestamp(fields.get("createdAt")).unwrap_or_default(),
            sub_comments: comment_list(fields.get("subComments"), skipped),
        })
    }
}

fn comment_list(value: Option<&Value>, skipped: &mut usize) -> Vec<Comment> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    let mut comments = Vec::with_capacity(items.len());
    for item in items {
        match Comment::from_value(item, skipped) {
            Some(comment) => comments.push(comment),
            None => *skipped += 1,
        }
    }
    comments
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub email: String,
    pub photo_url: Option<String>,
    pub following: BTreeSet<String>,
    pub followers: BTreeSet<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn from_document(document: &Document) -> Self {
        let fields = &document.fields;
        Self {
            id: document.id.clone(),
            username: string_field(fields, "username").unwrap_or_default(),
            email: string_field(fields, "email").unwrap_or_default(),
            photo_url: string_field(fields, "photoUrl"),
            following: string_list(fields, "following").into_iter().collect(),
            followers: string_list(fields, "followers").into_iter().collect(),
            created_at: timestamp_field(fields, "createdAt"),
        }
    }

    pub fn as_author(&self) -> Author {
        Author {
            id: self.id.clone(),
            display_name: self.username.clone(),
            avatar: self.photo_url.clone(),
        }
    }
}

fn string_field(fields: &Fields, name: &str) -> Option<String> {
    fields.get(name).and_then(Value::as_str).map(str::to_string)
}

fn string_list(fields: &Fields, name: &str) -> Vec<String> {
    match fields.get(name) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn count_field(fields: &Fields, name: &str) -> u64 {
    match fields.get(name).and_then(Value::as_f64) {
        Some(count) if count > 0.0 => count as u64,
        _ => 0,
    }
}

/// Store-ordered timestamps are numeric milliseconds only. The store never
/// ranks a non-numeric `createdAt`, so such a post reads as pending here too.
fn timestamp_field(fields: &Fields, name: &str) -> Option<DateTime<Utc>> {
    fields.get(name).and_then(millis)
}

/// Comment timestamps are never queried on, so RFC 3339 text from older
/// clients is accepted as well.
fn comment_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        other => millis(other),
    }
}

fn millis(value: &Value) -> Option<DateTime<Utc>> {
    let Value::Number(number) = value else {
        return None;
    };
    let millis = match number.as_i64() {
        Some(millis) => millis,
        None => number.as_f64()? as i64,
    };
    DateTime::from_timestamp_millis(millis)
}
