use crate::store::StoreResult;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

pub(super) struct SqliteClockRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

impl<'conn> super::ClockRepository for SqliteClockRepository<'conn> {
    fn next_timestamp(&self) -> StoreResult<i64> {
        let last: Option<i64> = self
            .conn
            .query_row("SELECT last_ms FROM store_clock WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        let now = Utc::now().timestamp_millis();
        let next = match last {
            Some(last) if last >= now => last + 1,
            _ => now,
        };
        self.conn.execute(
            r#"
            INSERT INTO store_clock (id, last_ms) VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET last_ms = excluded.last_ms
            "#,
            params![next],
        )?;
        Ok(next)
    }
}
