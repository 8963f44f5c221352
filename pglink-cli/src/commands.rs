use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_postgres::types::PgLsn;
use tracing::info;

use pglink::client::{ConnectionPair, PgControlConnection};
use pglink::confirm::Confirmation;
use pglink::origins::OriginRegistry;
use pglink::reverse::{ReversalOutcome, TopologyReversalProtocol};
use pglink::rewind::{OriginController, RewindOutcome};
use pglink::slots::{ReplicationSlot, SlotRegistry};
use pglink::subscriptions::{Subscription, SubscriptionRegistry};
use pglink::tables::TableCatalog;
use pglink_config::{
    DEFAULT_CONFIG_FILE, LinkConfig, PgConnectionConfig, TomlPairStore, load_config,
};

use crate::render::{Render, TextRenderer};

#[derive(Debug, Parser)]
#[command(
    name = "pglink",
    version,
    about = "Manage the topology of a PostgreSQL logical replication link",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Path to the connection pair configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write the source and destination connection pair to the config file.
    Configure {
        /// DSN for the source database, i.e. the primary.
        #[arg(long)]
        source: String,
        /// DSN for the destination database, i.e. the replica.
        #[arg(long)]
        destination: String,
    },
    /// Swap source and destination in the config file.
    ReverseConfiguration,
    /// Manually create a replication slot on the source database.
    CreateReplicationSlot { name: String },
    /// Manually drop a replication slot on the source database.
    DropReplicationSlot { name: String },
    /// List replication slots on the source database.
    ListReplicationSlots,
    /// Create a logical replication subscription.
    CreateSubscription {
        name: String,
        /// Leave the subscription disabled after creation.
        #[arg(long)]
        disabled: bool,
        /// Copy all existing data from publisher to subscriber.
        #[arg(long)]
        copy_data: bool,
        /// Use this slot name instead of the derived `<name>_slot`.
        #[arg(long)]
        slot_name: Option<String>,
    },
    /// Drop a subscription. This stops replication immediately.
    DropSubscription { name: String },
    /// Enable a subscription.
    EnableSubscription { name: String },
    /// Disable a subscription.
    DisableSubscription { name: String },
    /// List all current subscriptions.
    ListSubscriptions,
    /// Reverse a subscription: source becomes destination and vice versa.
    ///
    /// Useful when the replica is promoted to primary.
    ReverseSubscription { name: String },
    /// Show all replication origins.
    ListReplicationOrigins,
    /// Rewind a replication origin to a position. Very dangerous.
    RewindReplicationOrigin {
        origin: String,
        /// The subscription consuming this origin.
        #[arg(long, short = 's')]
        subscription: String,
        /// The position to rewind to, e.g. 0/16EDE8A0.
        #[arg(long, short = 'l')]
        lsn: String,
    },
    /// List the tables on one side of the link.
    ListTables {
        #[arg(long, value_enum, default_value_t = Side::Source)]
        on: Side,
    },
    /// List the columns of a table on one side of the link.
    ListColumns {
        table: String,
        #[arg(long, value_enum, default_value_t = Side::Source)]
        on: Side,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Side {
    Source,
    Destination,
}

const SLOT_HEADERS: &[&str] = &["Slot name", "Plugin", "Slot type", "Flushed LSN"];
const SUBSCRIPTION_HEADERS: &[&str] = &[
    "Subscription",
    "Enabled",
    "Connection",
    "Slot",
    "Publication",
    "Lag (bytes)",
    "Flushed LSN",
];

/// Interactive confirmation; destructive protocols receive this as their
/// injected decision capability.
struct PromptConfirmation;

impl Confirmation for PromptConfirmation {
    fn confirm(&mut self, prompt: &str) -> bool {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut renderer = TextRenderer::new(std::io::stdout());

    match cli.command {
        Command::Configure {
            source,
            destination,
        } => configure(&cli.config, &source, &destination, &mut renderer),
        Command::ReverseConfiguration => reverse_configuration(&cli.config, &mut renderer),
        Command::CreateReplicationSlot { name } => {
            let pair = establish(&cli.config).await?;
            let slot = SlotRegistry::new(pair.source.clone()).create(&name).await?;
            renderer.table("Replication Slots", SLOT_HEADERS, &slot_rows(&[slot]));
            Ok(())
        }
        Command::DropReplicationSlot { name } => {
            let pair = establish(&cli.config).await?;
            let removed = SlotRegistry::new(pair.source.clone()).drop(&name).await?;
            renderer.message(match removed {
                true => "Replication slot dropped.",
                false => "Replication slot does not exist.",
            });
            Ok(())
        }
        Command::ListReplicationSlots => {
            let pair = establish(&cli.config).await?;
            let slots = SlotRegistry::new(pair.source.clone()).list().await?;
            renderer.table("Replication Slots", SLOT_HEADERS, &slot_rows(&slots));
            Ok(())
        }
        Command::CreateSubscription {
            name,
            disabled,
            copy_data,
            slot_name,
        } => {
            let pair = establish(&cli.config).await?;
            let registry = SubscriptionRegistry::new(&pair);
            let subscription = registry
                .create(&name, copy_data, !disabled, slot_name.as_deref())
                .await?;
            let rows = subscription_rows(&registry, std::slice::from_ref(&subscription)).await?;
            renderer.table("Subscriptions", SUBSCRIPTION_HEADERS, &rows);
            Ok(())
        }
        Command::DropSubscription { name } => {
            let pair = establish(&cli.config).await?;
            let report = SubscriptionRegistry::new(&pair).drop(&name).await?;
            let mut removed = Vec::new();
            if report.subscription {
                removed.push("subscription");
            }
            if report.slot {
                removed.push("slot");
            }
            if report.publication {
                removed.push("publication");
            }
            renderer.message(&match removed.is_empty() {
                true => format!("Nothing to remove for '{name}'."),
                false => format!("Removed for '{name}': {}.", removed.join(", ")),
            });
            Ok(())
        }
        Command::EnableSubscription { name } => {
            let pair = establish(&cli.config).await?;
            SubscriptionRegistry::new(&pair).enable(&name).await?;
            Ok(())
        }
        Command::DisableSubscription { name } => {
            let pair = establish(&cli.config).await?;
            SubscriptionRegistry::new(&pair).disable(&name).await?;
            Ok(())
        }
        Command::ListSubscriptions => {
            let pair = establish(&cli.config).await?;
            let registry = SubscriptionRegistry::new(&pair);
            let subscriptions = registry.list().await?;
            let rows = subscription_rows(&registry, &subscriptions).await?;
            renderer.table("Subscriptions", SUBSCRIPTION_HEADERS, &rows);
            Ok(())
        }
        Command::ReverseSubscription { name } => {
            reverse_subscription(&cli.config, &name, &mut renderer).await
        }
        Command::ListReplicationOrigins => {
            let pair = establish(&cli.config).await?;
            let origins = OriginRegistry::new(pair.source.clone()).list().await?;
            let rows: Vec<Vec<String>> = origins.into_iter().map(|o| vec![o.name]).collect();
            renderer.table("Replication Origins", &["Name"], &rows);
            Ok(())
        }
        Command::RewindReplicationOrigin {
            origin,
            subscription,
            lsn,
        } => rewind_replication_origin(&cli.config, &origin, &subscription, &lsn, &mut renderer).await,
        Command::ListTables { on } => {
            let pair = establish(&cli.config).await?;
            let tables = TableCatalog::new(side_conn(&pair, on).clone()).tables().await?;
            let rows: Vec<Vec<String>> =
                tables.into_iter().map(|t| vec![t.name, t.owner]).collect();
            renderer.table("Tables", &["Table name", "Owner"], &rows);
            Ok(())
        }
        Command::ListColumns { table, on } => {
            let pair = establish(&cli.config).await?;
            let catalog = TableCatalog::new(side_conn(&pair, on).clone());
            if catalog.get(&table).await?.is_none() {
                renderer.message(&format!("No table named '{table}' exists."));
                return Ok(());
            }
            let columns = catalog.columns(&table).await?;
            let rows: Vec<Vec<String>> = columns
                .into_iter()
                .map(|c| vec![c.name, c.data_type])
                .collect();
            renderer.table(
                &format!("Columns in \"{table}\""),
                &["Column name", "Data type"],
                &rows,
            );
            Ok(())
        }
    }
}

fn configure(
    path: &Path,
    source: &str,
    destination: &str,
    renderer: &mut dyn Render,
) -> anyhow::Result<()> {
    let link = LinkConfig {
        source: PgConnectionConfig::from_dsn(source).context("invalid source DSN")?,
        destination: PgConnectionConfig::from_dsn(destination)
            .context("invalid destination DSN")?,
    };
    TomlPairStore::new(path).save(&link)?;

    renderer.message(&format!("Wrote connection pair to {}.", path.display()));

    Ok(())
}

fn reverse_configuration(path: &Path, renderer: &mut dyn Render) -> anyhow::Result<()> {
    let store = TomlPairStore::new(path);
    let link = store.load().context("no connection pair configured yet")?;
    store.save(&link.swapped())?;

    renderer.message("Swapped source and destination in the configuration.");

    Ok(())
}

async fn reverse_subscription(
    config: &Path,
    name: &str,
    renderer: &mut dyn Render,
) -> anyhow::Result<()> {
    let pair = establish(config).await?;

    if SubscriptionRegistry::new(&pair).get(name).await?.is_none() {
        renderer.message(&format!("No subscription named '{name}' exists."));
        return Ok(());
    }

    let protocol = TopologyReversalProtocol::new(pair);
    let mut confirm = PromptConfirmation;
    let mut sink = TomlPairStore::new(config);

    match protocol.reverse(name, &mut confirm, &mut sink).await? {
        ReversalOutcome::Reversed(subscription) => {
            renderer.message(&format!(
                "Replication direction reversed; subscription '{}' is now active.",
                subscription.name
            ));
        }
        ReversalOutcome::Declined => renderer.message("Aborting. Topology unchanged."),
    }

    Ok(())
}

async fn rewind_replication_origin(
    config: &Path,
    origin: &str,
    subscription: &str,
    lsn: &str,
    renderer: &mut dyn Render,
) -> anyhow::Result<()> {
    let pair = establish(config).await?;

    if OriginRegistry::new(pair.source.clone())
        .get(origin)
        .await?
        .is_none()
    {
        renderer.message(&format!("No origin named '{origin}' exists."));
        return Ok(());
    }
    if SubscriptionRegistry::new(&pair)
        .get(subscription)
        .await?
        .is_none()
    {
        renderer.message(&format!("No subscription named '{subscription}' exists."));
        return Ok(());
    }

    let target = Some(
        lsn.parse::<PgLsn>()
            .map_err(|_| anyhow::anyhow!("invalid LSN '{lsn}', expected the X/X form"))?,
    );

    let controller = OriginController::new(pair);
    let mut confirm = PromptConfirmation;

    match controller
        .rewind(origin, subscription, target, &mut confirm)
        .await?
    {
        RewindOutcome::Applied => {
            renderer.message(&format!("Origin '{origin}' rewound to {lsn}."));
        }
        RewindOutcome::Declined => renderer.message("Aborting. Nothing was touched."),
    }

    Ok(())
}

async fn establish(path: &Path) -> anyhow::Result<ConnectionPair> {
    let link: LinkConfig =
        load_config(Some(path)).context("failed to load connection configuration")?;
    let pair = ConnectionPair::establish(&link).await?;

    info!(
        source = %pair.source.display_name(),
        destination = %pair.destination.display_name(),
        "connection pair established"
    );

    Ok(pair)
}

fn side_conn(pair: &ConnectionPair, side: Side) -> &PgControlConnection {
    match side {
        Side::Source => &pair.source,
        Side::Destination => &pair.destination,
    }
}

fn slot_rows(slots: &[ReplicationSlot]) -> Vec<Vec<String>> {
    slots
        .iter()
        .map(|slot| {
            vec![
                slot.name.clone(),
                slot.plugin.clone(),
                slot.slot_type.clone(),
                slot.confirmed_flush_lsn
                    .map(|lsn| lsn.to_string())
                    .unwrap_or_else(|| "-".to_owned()),
            ]
        })
        .collect()
}

async fn subscription_rows(
    registry: &SubscriptionRegistry,
    subscriptions: &[Subscription],
) -> anyhow::Result<Vec<Vec<String>>> {
    let mut rows = Vec::with_capacity(subscriptions.len());

    for subscription in subscriptions {
        let (lag, flushed) = match &subscription.slot {
            Some(slot) if slot.exists && slot.confirmed_flush_lsn.is_some() => {
                let lag = registry.replication_lag(subscription).await?;
                let flushed = slot
                    .confirmed_flush_lsn
                    .map(|lsn| lsn.to_string())
                    .unwrap_or_else(|| "-".to_owned());
                (lag.to_string(), flushed)
            }
            _ => ("-".to_owned(), "-".to_owned()),
        };

        rows.push(vec![
            subscription.name.clone(),
            subscription.enabled.to_string(),
            subscription.conninfo.clone(),
            subscription.slot_name().unwrap_or("-").to_owned(),
            subscription.publication.name.clone(),
            lag,
            flushed,
        ]);
    }

    Ok(rows)
}
