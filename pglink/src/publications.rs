use pg_escape::{quote_identifier, quote_literal};
use tokio_postgres::SimpleQueryRow;
use tracing::info;

use crate::client::{self, PgControlConnection};
use crate::error::LinkResult;

/// A named definition of which data changes are exposed for replication.
///
/// Publications this tool creates always cover all tables; table-scoped
/// publications are an extension point, not currently supported.
#[derive(Debug, Clone)]
pub struct Publication {
    pub name: String,
    pub all_tables: bool,
    pub exists: bool,
}

/// Idempotent CRUD over publications on the source instance.
#[derive(Debug, Clone)]
pub struct PublicationRegistry {
    conn: PgControlConnection,
}

impl PublicationRegistry {
    pub fn new(conn: PgControlConnection) -> Self {
        Self { conn }
    }

    /// Reads every publication from `pg_publication`, current truth.
    pub async fn list(&self) -> LinkResult<Vec<Publication>> {
        let rows = self
            .conn
            .query("SELECT pubname, puballtables FROM pg_publication")
            .await?;

        rows.iter().map(publication_from_row).collect()
    }

    /// Current-truth lookup; always re-queries, nothing is cached.
    pub async fn get(&self, name: &str) -> LinkResult<Option<Publication>> {
        let query = format!(
            "SELECT pubname, puballtables FROM pg_publication WHERE pubname = {}",
            quote_literal(name)
        );
        let rows = self.conn.query(&query).await?;

        rows.first().map(publication_from_row).transpose()
    }

    /// Creates an all-tables publication, returning the existing one when present.
    pub async fn create(&self, name: &str) -> LinkResult<Publication> {
        if let Some(publication) = self.get(name).await? {
            info!("publication '{name}' already exists");
            return Ok(publication);
        }

        let query = format!(
            "CREATE PUBLICATION {} FOR ALL TABLES",
            quote_identifier(name)
        );
        self.conn.execute(&query).await?;
        self.conn.commit().await?;

        info!("created publication '{name}'");

        Ok(Publication {
            name: name.to_owned(),
            all_tables: true,
            exists: true,
        })
    }

    /// Drops the publication; a no-op when it does not exist. Returns whether
    /// a publication was actually removed.
    pub async fn drop(&self, name: &str) -> LinkResult<bool> {
        if self.get(name).await?.is_none() {
            info!("publication '{name}' does not exist");
            return Ok(false);
        }

        let query = format!("DROP PUBLICATION {}", quote_identifier(name));
        self.conn.execute(&query).await?;
        self.conn.commit().await?;

        info!("dropped publication '{name}'");

        Ok(true)
    }
}

fn publication_from_row(row: &SimpleQueryRow) -> LinkResult<Publication> {
    Ok(Publication {
        name: client::row_text(row, "pubname", "pg_publication")?,
        all_tables: client::row_bool(row, "puballtables", "pg_publication")?,
        exists: true,
    })
}
