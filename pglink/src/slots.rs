use pg_escape::quote_literal;
use tokio_postgres::SimpleQueryRow;
use tokio_postgres::types::PgLsn;
use tracing::info;

use crate::bail;
use crate::client::{self, PgControlConnection};
use crate::error::{ErrorKind, LinkError, LinkResult};

/// Maximum length for a Postgres replication slot name in bytes.
pub const MAX_SLOT_NAME_LENGTH: usize = 63;

/// Output plugin used for every slot this tool creates.
pub const SLOT_PLUGIN: &str = "pgoutput";

/// A named, persistent marker on the source that retains change history
/// until consumed.
#[derive(Debug, Clone)]
pub struct ReplicationSlot {
    pub name: String,
    pub plugin: String,
    pub slot_type: String,
    /// Monotonically advancing flush position; absent until the consumer
    /// confirms anything.
    pub confirmed_flush_lsn: Option<PgLsn>,
    pub exists: bool,
}

impl ReplicationSlot {
    /// Handle for a slot the catalog references but which no longer exists.
    pub fn absent(name: String) -> Self {
        Self {
            name,
            plugin: String::new(),
            slot_type: String::new(),
            confirmed_flush_lsn: None,
            exists: false,
        }
    }
}

/// Idempotent CRUD over replication slots on the source instance.
#[derive(Debug, Clone)]
pub struct SlotRegistry {
    conn: PgControlConnection,
}

impl SlotRegistry {
    pub fn new(conn: PgControlConnection) -> Self {
        Self { conn }
    }

    /// Reads every slot from `pg_replication_slots`, current truth.
    pub async fn list(&self) -> LinkResult<Vec<ReplicationSlot>> {
        let rows = self
            .conn
            .query(
                "SELECT slot_name, plugin, slot_type, confirmed_flush_lsn \
                 FROM pg_replication_slots",
            )
            .await?;

        rows.iter().map(slot_from_row).collect()
    }

    /// Current-truth lookup; always re-queries, nothing is cached.
    pub async fn get(&self, name: &str) -> LinkResult<Option<ReplicationSlot>> {
        let query = format!(
            "SELECT slot_name, plugin, slot_type, confirmed_flush_lsn \
             FROM pg_replication_slots WHERE slot_name = {}",
            quote_literal(name)
        );
        let rows = self.conn.query(&query).await?;

        rows.first().map(slot_from_row).transpose()
    }

    /// Creates a logical slot, returning the existing one when present.
    pub async fn create(&self, name: &str) -> LinkResult<ReplicationSlot> {
        validate_slot_name(name)?;

        if let Some(slot) = self.get(name).await? {
            info!("replication slot '{name}' already exists");
            return Ok(slot);
        }

        let query = format!(
            "SELECT pg_create_logical_replication_slot({}, {})",
            quote_literal(name),
            quote_literal(SLOT_PLUGIN)
        );
        self.conn.execute(&query).await?;
        self.conn.commit().await?;

        info!("created replication slot '{name}'");

        Ok(ReplicationSlot {
            name: name.to_owned(),
            plugin: SLOT_PLUGIN.to_owned(),
            slot_type: "logical".to_owned(),
            confirmed_flush_lsn: None,
            exists: true,
        })
    }

    /// Drops the slot; a no-op when it does not exist. Returns whether a slot
    /// was actually removed.
    pub async fn drop(&self, name: &str) -> LinkResult<bool> {
        if self.get(name).await?.is_none() {
            info!("replication slot '{name}' does not exist");
            return Ok(false);
        }

        let query = format!("SELECT pg_drop_replication_slot({})", quote_literal(name));
        self.conn.execute(&query).await?;
        self.conn.commit().await?;

        info!("dropped replication slot '{name}'");

        Ok(true)
    }
}

fn validate_slot_name(name: &str) -> LinkResult<()> {
    if name.is_empty() || name.len() > MAX_SLOT_NAME_LENGTH {
        bail!(
            ErrorKind::ValidationError,
            "invalid replication slot name length",
            format!("'{name}' must be 1..={MAX_SLOT_NAME_LENGTH} bytes")
        );
    }

    Ok(())
}

fn slot_from_row(row: &SimpleQueryRow) -> LinkResult<ReplicationSlot> {
    Ok(ReplicationSlot {
        name: client::row_text(row, "slot_name", "pg_replication_slots")?,
        plugin: client::row_text(row, "plugin", "pg_replication_slots")?,
        slot_type: client::row_text(row, "slot_type", "pg_replication_slots")?,
        confirmed_flush_lsn: client::opt_row_value(
            row,
            "confirmed_flush_lsn",
            "pg_replication_slots",
        )?,
        exists: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_names_up_to_the_limit_are_accepted() {
        assert!(validate_slot_name("sub1_slot").is_ok());
        assert!(validate_slot_name(&"a".repeat(MAX_SLOT_NAME_LENGTH)).is_ok());
    }

    #[test]
    fn oversized_and_empty_slot_names_are_rejected() {
        let too_long = "a".repeat(MAX_SLOT_NAME_LENGTH + 1);

        let err = validate_slot_name(&too_long).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        assert!(validate_slot_name("").is_err());
    }

    #[test]
    fn absent_slot_handles_carry_the_name_only() {
        let slot = ReplicationSlot::absent("ghost".to_owned());

        assert_eq!(slot.name, "ghost");
        assert!(!slot.exists);
        assert!(slot.confirmed_flush_lsn.is_none());
    }
}
