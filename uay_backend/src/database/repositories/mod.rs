mod clock;
mod documents;

use crate::store::{Document, Query, StoreResult};
use rusqlite::Connection;

pub trait DocumentRepository {
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>>;
    /// Fails with `AlreadyExists` if the id is taken.
    fn insert(&self, collection: &str, document: &Document) -> StoreResult<()>;
    fn replace(&self, collection: &str, document: &Document) -> StoreResult<()>;
    fn query(&self, query: &Query) -> StoreResult<Vec<Document>>;
}

pub trait ClockRepository {
    /// Next server timestamp in milliseconds; strictly greater than every
    /// value handed out before.
    fn next_timestamp(&self) -> StoreResult<i64>;
}

pub struct SqliteRepositories<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRepositories<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn documents(&self) -> impl DocumentRepository + '_ {
        documents::SqliteDocumentRepository { conn: self.conn }
    }

    pub fn clock(&self) -> impl ClockRepository + '_ {
        clock::SqliteClockRepository { conn: self.conn }
    }
}
