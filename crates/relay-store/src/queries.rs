use tracing::instrument;

use relay_core::{ContactQuery, QueryId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Contact-form submissions.
pub struct QueryRepo {
    db: Database,
}

impl QueryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, query), fields(query_id = %query.id))]
    pub fn insert(&self, query: &ContactQuery) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queries (id, name, email, query, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    query.id.as_str(),
                    query.name,
                    query.email,
                    query.query,
                    row_helpers::format_timestamp(&query.created_at),
                ],
            )?;
            Ok(())
        })
    }

    /// All submissions in arrival order.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<ContactQuery>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, email, query, created_at FROM queries ORDER BY created_at, id",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let created_at: String = row_helpers::get(row, 4, "queries", "created_at")?;
                results.push(ContactQuery {
                    id: QueryId::from_raw(row_helpers::get::<String>(row, 0, "queries", "id")?),
                    name: row_helpers::get(row, 1, "queries", "name")?,
                    email: row_helpers::get(row, 2, "queries", "email")?,
                    query: row_helpers::get(row, 3, "queries", "query")?,
                    created_at: row_helpers::parse_timestamp(&created_at, "queries", "created_at")?,
                });
            }
            Ok(results)
        })
    }
}
