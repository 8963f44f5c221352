use pg_escape::{quote_identifier, quote_literal};
use tokio_postgres::SimpleQueryRow;
use tokio_postgres::types::PgLsn;
use tracing::info;

use crate::bail;
use crate::client::{self, ConnectionPair, PgControlConnection};
use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::link_error;
use crate::publications::{Publication, PublicationRegistry};
use crate::slots::{ReplicationSlot, SlotRegistry};

const SLOT_SUFFIX: &str = "_slot";
const PUBLICATION_SUFFIX: &str = "_publication";
const REVERSED_SUFFIX: &str = "_reversed";

/// Derived slot name for a subscription, used unless the caller overrides it.
pub fn slot_name_for(subscription: &str) -> String {
    format!("{subscription}{SLOT_SUFFIX}")
}

/// Derived publication name for a subscription.
pub fn publication_name_for(subscription: &str) -> String {
    format!("{subscription}{PUBLICATION_SUFFIX}")
}

/// Name the reversal protocol gives the replacement subscription.
pub fn reversed_name_for(subscription: &str) -> String {
    format!("{subscription}{REVERSED_SUFFIX}")
}

/// The destination-side object that consumes a publication through a slot.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub name: String,
    pub enabled: bool,
    /// Connection string the destination uses to reach the source.
    pub conninfo: String,
    /// The referenced slot, `None` when the row is detached from its slot.
    /// A referenced slot that no longer exists hydrates with `exists: false`.
    pub slot: Option<ReplicationSlot>,
    pub publication: Publication,
}

impl Subscription {
    pub fn slot_name(&self) -> Option<&str> {
        self.slot.as_ref().map(|slot| slot.name.as_str())
    }
}

/// What a teardown actually removed; best-effort cleanup stays observable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropReport {
    pub subscription: bool,
    pub slot: bool,
    pub publication: bool,
}

/// Composes slot + publication into a subscription on the destination and
/// owns the subscription lifecycle.
#[derive(Debug, Clone)]
pub struct SubscriptionRegistry {
    source: PgControlConnection,
    destination: PgControlConnection,
    slots: SlotRegistry,
    publications: PublicationRegistry,
}

impl SubscriptionRegistry {
    pub fn new(pair: &ConnectionPair) -> Self {
        Self {
            source: pair.source.clone(),
            destination: pair.destination.clone(),
            slots: SlotRegistry::new(pair.source.clone()),
            publications: PublicationRegistry::new(pair.source.clone()),
        }
    }

    pub fn slots(&self) -> &SlotRegistry {
        &self.slots
    }

    pub fn publications(&self) -> &PublicationRegistry {
        &self.publications
    }

    /// Reads every subscription from the destination's `pg_subscription` and
    /// hydrates each against the source's current slot and publication state.
    pub async fn list(&self) -> LinkResult<Vec<Subscription>> {
        let rows = self
            .destination
            .query(
                "SELECT subname, subenabled, subconninfo, subslotname, subpublications \
                 FROM pg_subscription",
            )
            .await?;

        let mut subscriptions = Vec::with_capacity(rows.len());
        for row in &rows {
            subscriptions.push(self.hydrate(row).await?);
        }

        Ok(subscriptions)
    }

    /// Refresh-then-scan lookup against the current catalog truth.
    pub async fn get(&self, name: &str) -> LinkResult<Option<Subscription>> {
        let subscriptions = self.list().await?;

        Ok(subscriptions.into_iter().find(|s| s.name == name))
    }

    /// Creates the slot + publication + subscription triad.
    ///
    /// Slot and publication are ensured first (idempotently) so both exist
    /// before the subscription references them. An existing subscription of
    /// this name is returned unchanged.
    pub async fn create(
        &self,
        name: &str,
        copy_data: bool,
        enabled: bool,
        slot_name_override: Option<&str>,
    ) -> LinkResult<Subscription> {
        let slot_name = slot_name_override
            .map(str::to_owned)
            .unwrap_or_else(|| slot_name_for(name));
        let publication_name = publication_name_for(name);

        self.slots.create(&slot_name).await?;
        self.publications.create(&publication_name).await?;

        if let Some(existing) = self.get(name).await? {
            info!("subscription '{name}' already exists");
            return Ok(existing);
        }

        // The slot is externally managed (create_slot = false): letting the
        // statement allocate its own slot would race the one just created.
        // The statement opens its own replication connection and refuses to
        // run inside a transaction block, hence the detached execution.
        let query = format!(
            "CREATE SUBSCRIPTION {} CONNECTION {} PUBLICATION {} \
             WITH (copy_data = {copy_data}, create_slot = false, slot_name = {}, enabled = {enabled})",
            quote_identifier(name),
            quote_literal(&self.source.conninfo()),
            quote_identifier(&publication_name),
            quote_literal(&slot_name),
        );
        self.destination.execute_detached(&query).await?;

        info!("created subscription '{name}' consuming '{publication_name}' via '{slot_name}'");

        self.get(name).await?.ok_or_else(|| {
            link_error!(
                ErrorKind::StateInconsistency,
                "subscription vanished right after creation",
                name
            )
        })
    }

    /// Tears down the triad. Idempotent and tolerant of partial prior state:
    /// the slot and publication are removed even when no subscription row
    /// exists (a previous failed creation may have left them behind). The
    /// report records exactly what was removed; cleanup failures are
    /// aggregated rather than cut short at the first one.
    pub async fn drop(&self, name: &str) -> LinkResult<DropReport> {
        let mut report = DropReport::default();
        let existing = self.get(name).await?;

        let slot_name = existing
            .as_ref()
            .and_then(|s| s.slot_name().map(str::to_owned))
            .unwrap_or_else(|| slot_name_for(name));
        let publication_name = existing
            .as_ref()
            .map(|s| s.publication.name.clone())
            .unwrap_or_else(|| publication_name_for(name));

        if existing.is_some() {
            // The subscription must let go of its slot before the row is
            // dropped; the engine rejects dropping one that still holds it.
            self.destination
                .execute(&format!(
                    "ALTER SUBSCRIPTION {} DISABLE",
                    quote_identifier(name)
                ))
                .await?;
            self.destination
                .execute(&format!(
                    "ALTER SUBSCRIPTION {} SET (slot_name = NONE)",
                    quote_identifier(name)
                ))
                .await?;
            self.destination
                .execute(&format!("DROP SUBSCRIPTION {}", quote_identifier(name)))
                .await?;
            self.destination.commit().await?;

            report.subscription = true;
            info!("dropped subscription '{name}'");
        } else {
            info!("no subscription named '{name}'; cleaning up derived objects anyway");
        }

        let mut failures = Vec::new();
        match self.slots.drop(&slot_name).await {
            Ok(removed) => report.slot = removed,
            Err(e) => failures.push(e),
        }
        match self.publications.drop(&publication_name).await {
            Ok(removed) => report.publication = removed,
            Err(e) => failures.push(e),
        }

        if !failures.is_empty() {
            return Err(LinkError::many(failures));
        }

        Ok(report)
    }

    /// Starts the subscription worker; a no-op when the subscription is absent.
    pub async fn enable(&self, name: &str) -> LinkResult<()> {
        if self.get(name).await?.is_none() {
            info!("no subscription named '{name}' to enable");
            return Ok(());
        }

        self.destination
            .execute(&format!(
                "ALTER SUBSCRIPTION {} ENABLE",
                quote_identifier(name)
            ))
            .await?;
        self.destination.commit().await?;

        info!("enabled subscription '{name}'");

        Ok(())
    }

    /// Stops the subscription worker; a no-op when the subscription is absent.
    pub async fn disable(&self, name: &str) -> LinkResult<()> {
        if self.get(name).await?.is_none() {
            info!("no subscription named '{name}' to disable");
            return Ok(());
        }

        self.destination
            .execute(&format!(
                "ALTER SUBSCRIPTION {} DISABLE",
                quote_identifier(name)
            ))
            .await?;
        self.destination.commit().await?;

        info!("disabled subscription '{name}'");

        Ok(())
    }

    /// Displacement in bytes between the source's current write position and
    /// the slot's confirmed flush position; zero when fully caught up.
    ///
    /// The slot is refreshed immediately before the computation so the
    /// displacement never mixes a fresh write position with a stale flush
    /// position read earlier.
    pub async fn replication_lag(&self, subscription: &Subscription) -> LinkResult<u64> {
        let Some(slot_name) = subscription.slot_name() else {
            bail!(
                ErrorKind::StateInconsistency,
                "subscription is detached from its slot, lag is unmeasurable",
                subscription.name.clone()
            );
        };

        let current = self.current_write_position().await?;
        let slot = self.slots.get(slot_name).await?.ok_or_else(|| {
            link_error!(
                ErrorKind::StateInconsistency,
                "subscription references a slot that no longer exists",
                format!("{} -> {slot_name}", subscription.name)
            )
        })?;
        let flushed = slot.confirmed_flush_lsn.ok_or_else(|| {
            link_error!(
                ErrorKind::StateInconsistency,
                "slot reports no confirmed flush position",
                slot_name
            )
        })?;

        Ok(lag_bytes(current, flushed))
    }

    /// Reads the source's current write position.
    pub async fn current_write_position(&self) -> LinkResult<PgLsn> {
        let rows = self.source.query("SELECT pg_current_wal_lsn()").await?;
        let row = rows.first().ok_or_else(|| {
            link_error!(ErrorKind::QueryFailed, "write position query returned no row")
        })?;

        client::row_value(row, "pg_current_wal_lsn", "pg_current_wal_lsn()")
    }

    async fn hydrate(&self, row: &SimpleQueryRow) -> LinkResult<Subscription> {
        let name = client::row_text(row, "subname", "pg_subscription")?;
        let enabled = client::row_bool(row, "subenabled", "pg_subscription")?;
        let conninfo = client::row_text(row, "subconninfo", "pg_subscription")?;
        let slot_name = client::opt_row_text(row, "subslotname")?;
        let publications_raw = client::row_text(row, "subpublications", "pg_subscription")?;

        let publication_name = first_array_element(&publications_raw).ok_or_else(|| {
            link_error!(
                ErrorKind::StateInconsistency,
                "subscription references no publication",
                name.clone()
            )
        })?;

        let slot = match slot_name {
            Some(slot_name) => Some(
                self.slots
                    .get(&slot_name)
                    .await?
                    .unwrap_or_else(|| ReplicationSlot::absent(slot_name)),
            ),
            None => None,
        };

        // A missing publication means the topology was mutated outside this
        // tool; surfaced, never papered over.
        let publication = self
            .publications
            .get(&publication_name)
            .await?
            .ok_or_else(|| {
                link_error!(
                    ErrorKind::StateInconsistency,
                    "subscription references a publication that no longer exists",
                    format!("{name} -> {publication_name}")
                )
            })?;

        Ok(Subscription {
            name,
            enabled,
            conninfo,
            slot,
            publication,
        })
    }
}

/// Non-negative displacement between two log-sequence positions.
pub fn lag_bytes(current: PgLsn, flushed: PgLsn) -> u64 {
    u64::from(current).saturating_sub(u64::from(flushed))
}

/// First element of a text-array literal as the simple-query protocol renders
/// it (`{a,b}`, elements quoted when they contain specials).
fn first_array_element(raw: &str) -> Option<String> {
    let inner = raw.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() {
        return None;
    }

    let first = inner.split(',').next()?.trim();
    let unquoted = first
        .strip_prefix('"')
        .and_then(|f| f.strip_suffix('"'))
        .unwrap_or(first);

    if unquoted.is_empty() {
        None
    } else {
        Some(unquoted.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_names_share_the_subscription_stem() {
        assert_eq!(slot_name_for("sub1"), "sub1_slot");
        assert_eq!(publication_name_for("sub1"), "sub1_publication");
        assert_eq!(reversed_name_for("sub1"), "sub1_reversed");
    }

    #[test]
    fn lag_is_the_byte_displacement() {
        let current = PgLsn::from(0x1_0000_2000);
        let flushed = PgLsn::from(0x1_0000_0000);

        assert_eq!(lag_bytes(current, flushed), 0x2000);
    }

    #[test]
    fn lag_is_zero_when_caught_up() {
        let position = PgLsn::from(0x2_0000_0000);

        assert_eq!(lag_bytes(position, position), 0);
    }

    #[test]
    fn lag_saturates_when_flush_runs_ahead() {
        // The two positions are read at different instants; a flush arriving
        // in between must not underflow.
        let current = PgLsn::from(0x1_0000_0000);
        let flushed = PgLsn::from(0x1_0000_0500);

        assert_eq!(lag_bytes(current, flushed), 0);
    }

    #[test]
    fn publication_array_parsing_takes_the_first_element() {
        assert_eq!(
            first_array_element("{sub1_publication}").as_deref(),
            Some("sub1_publication")
        );
        assert_eq!(
            first_array_element("{first,second}").as_deref(),
            Some("first")
        );
        assert_eq!(
            first_array_element("{\"quoted name\",second}").as_deref(),
            Some("quoted name")
        );
    }

    #[test]
    fn empty_publication_arrays_hydrate_to_none() {
        assert_eq!(first_array_element("{}"), None);
        assert_eq!(first_array_element(""), None);
    }
}
