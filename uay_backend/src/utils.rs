//! Shared helpers and constants.

use chrono::{DateTime, Utc};
use std::path::Path;
use uuid::Uuid;

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn new_document_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Client-side comment id; unique enough within a single post's tree.
pub fn new_comment_id() -> String {
    format!("comment-{}", Uuid::new_v4().simple())
}

/// Reduces a user supplied name to a single safe path segment.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = Path::new(name)
        .file_name()
        .and_then(|file| file.to_str())
        .unwrap_or("upload")
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "upload".to_string()
    } else {
        cleaned
    }
}
