use pg_escape::quote_literal;
use tokio_postgres::SimpleQueryRow;

use crate::client::{self, PgControlConnection};
use crate::error::LinkResult;

/// A destination-side marker of replay progress, independent of the slot.
#[derive(Debug, Clone)]
pub struct ReplicationOrigin {
    pub name: String,
}

/// Read-only registry over `pg_replication_origin`.
#[derive(Debug, Clone)]
pub struct OriginRegistry {
    conn: PgControlConnection,
}

impl OriginRegistry {
    pub fn new(conn: PgControlConnection) -> Self {
        Self { conn }
    }

    /// Reads every origin, current truth, in catalog identity order.
    pub async fn list(&self) -> LinkResult<Vec<ReplicationOrigin>> {
        let rows = self
            .conn
            .query("SELECT roname FROM pg_replication_origin ORDER BY roident")
            .await?;

        rows.iter().map(origin_from_row).collect()
    }

    /// Current-truth lookup; always re-queries, nothing is cached.
    pub async fn get(&self, name: &str) -> LinkResult<Option<ReplicationOrigin>> {
        let query = format!(
            "SELECT roname FROM pg_replication_origin WHERE roname = {}",
            quote_literal(name)
        );
        let rows = self.conn.query(&query).await?;

        rows.first().map(origin_from_row).transpose()
    }

    /// The most recently created origin, when any exists.
    pub async fn last(&self) -> LinkResult<Option<ReplicationOrigin>> {
        Ok(self.list().await?.pop())
    }
}

fn origin_from_row(row: &SimpleQueryRow) -> LinkResult<ReplicationOrigin> {
    Ok(ReplicationOrigin {
        name: client::row_text(row, "roname", "pg_replication_origin")?,
    })
}
