use crate::store::{Document, Fields, Filter, Query, StoreError, StoreResult};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

pub(super) struct SqliteDocumentRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

impl<'conn> super::DocumentRepository for SqliteDocumentRepository<'conn> {
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, version, body
                FROM documents
                WHERE collection = ?1 AND id = ?2
                "#,
                params![collection, id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(decode_row).transpose()
    }

    fn insert(&self, collection: &str, document: &Document) -> StoreResult<()> {
        let body = serde_json::to_string(&document.fields)?;
        let inserted = self.conn.execute(
            r#"
            INSERT INTO documents (collection, id, version, body)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(collection, id) DO NOTHING
            "#,
            params![collection, document.id, document.version as i64, body],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                id: document.id.clone(),
            });
        }
        Ok(())
    }

    fn replace(&self, collection: &str, document: &Document) -> StoreResult<()> {
        let body = serde_json::to_string(&document.fields)?;
        self.conn.execute(
            r#"
            INSERT INTO documents (collection, id, version, body)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(collection, id) DO UPDATE SET
                version = excluded.version,
                body = excluded.body
            "#,
            params![collection, document.id, document.version as i64, body],
        )?;
        Ok(())
    }

    fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        query.validate()?;
        let (sql, values) = build_select(query)?;
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(decode_row(row?)?);
        }
        Ok(documents)
    }
}

fn decode_row((id, version, body): (String, i64, String)) -> StoreResult<Document> {
    let fields: Fields = serde_json::from_str(&body)?;
    Ok(Document {
        id,
        version: version.max(0) as u64,
        fields,
    })
}

fn json_path(field: &str) -> SqlValue {
    SqlValue::Text(format!("$.{field}"))
}

fn to_sql(field: &str, value: &Value) -> StoreResult<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(flag) => Ok(SqlValue::Integer(i64::from(*flag))),
        Value::Number(number) => match number.as_i64() {
            Some(int) => Ok(SqlValue::Integer(int)),
            None => Ok(SqlValue::Real(number.as_f64().unwrap_or_default())),
        },
        Value::String(text) => Ok(SqlValue::Text(text.clone())),
        Value::Array(_) | Value::Object(_) => Err(StoreError::InvalidQuery(format!(
            "cannot compare field {field} against a composite value"
        ))),
    }
}

/// Builds the SELECT for a validated query. Field paths are bound as
/// parameters; only the clause shape is formatted into the SQL text.
fn build_select(query: &Query) -> StoreResult<(String, Vec<SqlValue>)> {
    let mut sql = String::from("SELECT id, version, body FROM documents WHERE collection = ?");
    let mut values = vec![SqlValue::Text(query.collection.clone())];

    for filter in &query.filters {
        match filter {
            Filter::Eq(field, Value::Null) => {
                sql.push_str(" AND json_extract(body, ?) IS NULL");
                values.push(json_path(field));
            }
            Filter::Eq(field, value) => {
                sql.push_str(" AND json_extract(body, ?) = ?");
                values.push(json_path(field));
                values.push(to_sql(field, value)?);
            }
            Filter::In(field, candidates) => {
                let placeholders = vec!["?"; candidates.len()].join(", ");
                sql.push_str(&format!(" AND json_extract(body, ?) IN ({placeholders})"));
                values.push(json_path(field));
                for candidate in candidates {
                    values.push(to_sql(field, candidate)?);
                }
            }
            Filter::Prefix(field, prefix) => {
                sql.push_str(" AND substr(json_extract(body, ?), 1, ?) = ?");
                values.push(json_path(field));
                values.push(SqlValue::Integer(prefix.chars().count() as i64));
                values.push(SqlValue::Text(prefix.clone()));
            }
        }
    }

    match &query.order_by {
        Some(order_field) => {
            // Only numeric values are ordered; SQLite would rank any text above
            // every integer and break cursor ranges.
            sql.push_str(" AND json_type(body, ?) IN ('integer', 'real')");
            values.push(json_path(order_field));

            if let Some(cursor) = &query.start_after {
                sql.push_str(
                    " AND (json_extract(body, ?) < ? OR (json_extract(body, ?) = ? AND id < ?))",
                );
                values.push(json_path(order_field));
                values.push(SqlValue::Integer(cursor.timestamp));
                values.push(json_path(order_field));
                values.push(SqlValue::Integer(cursor.timestamp));
                values.push(SqlValue::Text(cursor.id.clone()));
            }
            if let Some(cursor) = &query.end_at {
                sql.push_str(
                    " AND (json_extract(body, ?) > ? OR (json_extract(body, ?) = ? AND id >= ?))",
                );
                values.push(json_path(order_field));
                values.push(SqlValue::Integer(cursor.timestamp));
                values.push(json_path(order_field));
                values.push(SqlValue::Integer(cursor.timestamp));
                values.push(SqlValue::Text(cursor.id.clone()));
            }

            sql.push_str(" ORDER BY json_extract(body, ?) DESC, id DESC");
            values.push(json_path(order_field));
        }
        None => sql.push_str(" ORDER BY id ASC"),
    }

    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        values.push(SqlValue::Integer(limit as i64));
    }

    Ok((sql, values))
}
