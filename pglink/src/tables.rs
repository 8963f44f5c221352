use pg_escape::quote_literal;
use tokio_postgres::SimpleQueryRow;

use crate::client::{self, PgControlConnection};
use crate::error::LinkResult;

/// A user table in the public schema.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub owner: String,
}

/// A column of a user table.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

/// Read-only catalog browsing over either instance, for eyeballing whether
/// the two sides are in sync.
#[derive(Debug, Clone)]
pub struct TableCatalog {
    conn: PgControlConnection,
}

impl TableCatalog {
    pub fn new(conn: PgControlConnection) -> Self {
        Self { conn }
    }

    /// Public-schema tables with their owners, current truth.
    pub async fn tables(&self) -> LinkResult<Vec<Table>> {
        let rows = self
            .conn
            .query("SELECT tablename, tableowner FROM pg_tables WHERE schemaname = 'public'")
            .await?;

        rows.iter().map(table_from_row).collect()
    }

    /// Current-truth lookup of one table.
    pub async fn get(&self, name: &str) -> LinkResult<Option<Table>> {
        let query = format!(
            "SELECT tablename, tableowner FROM pg_tables \
             WHERE schemaname = 'public' AND tablename = {}",
            quote_literal(name)
        );
        let rows = self.conn.query(&query).await?;

        rows.first().map(table_from_row).transpose()
    }

    /// Columns of `table`, ordered by column name.
    pub async fn columns(&self, table: &str) -> LinkResult<Vec<Column>> {
        let query = format!(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = {} ORDER BY column_name",
            quote_literal(table)
        );
        let rows = self.conn.query(&query).await?;

        rows.iter().map(column_from_row).collect()
    }
}

fn table_from_row(row: &SimpleQueryRow) -> LinkResult<Table> {
    Ok(Table {
        name: client::row_text(row, "tablename", "pg_tables")?,
        owner: client::row_text(row, "tableowner", "pg_tables")?,
    })
}

fn column_from_row(row: &SimpleQueryRow) -> LinkResult<Column> {
    Ok(Column {
        name: client::row_text(row, "column_name", "information_schema.columns")?,
        data_type: client::row_text(row, "data_type", "information_schema.columns")?,
    })
}
