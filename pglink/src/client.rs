use std::fmt;
use std::io::BufReader;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pglink_config::{LinkConfig, PgConnectionConfig};
use rustls::ClientConfig;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, Connection, NoTls, SimpleQueryMessage, SimpleQueryRow, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, error, info};

use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::link_error;
use crate::preflight;

/// Spawns a background task to drive a PostgreSQL connection until it terminates.
///
/// The task logs when the connection terminates, either successfully or with an error.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        if let Err(e) = connection.await {
            error!("an error occurred during the Postgres connection: {}", e);
            return;
        }

        info!("postgres connection terminated successfully")
    }
    .instrument(span);

    tokio::spawn(task);
}

/// A control-plane connection to one Postgres instance of the replication pair.
///
/// The handle is cheaply clonable and exclusively owned by one invocation; it
/// is never pooled. Ambient transaction state is tracked explicitly: metadata
/// reads share a lazily opened transaction, mutations commit it immediately,
/// and statements the engine refuses inside a transaction block go through
/// [`PgControlConnection::execute_detached`].
#[derive(Clone)]
pub struct PgControlConnection {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    config: PgConnectionConfig,
    open_transaction: AtomicBool,
}

impl fmt::Debug for PgControlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgControlConnection")
            .field("endpoint", &self.inner.config.display_name())
            .finish()
    }
}

impl PgControlConnection {
    /// Establishes a connection. Uses TLS when enabled in the supplied config.
    ///
    /// Establishment is bounded by the configured connect timeout; statement
    /// execution afterwards is not bounded.
    pub async fn connect(config: PgConnectionConfig) -> LinkResult<Self> {
        match config.tls.enabled {
            true => PgControlConnection::connect_tls(config).await,
            false => PgControlConnection::connect_no_tls(config).await,
        }
    }

    async fn connect_no_tls(config: PgConnectionConfig) -> LinkResult<Self> {
        let (client, connection) = config
            .with_db()
            .connect(NoTls)
            .await
            .map_err(|e| connect_error(&config, e))?;
        spawn_postgres_connection::<NoTls>(connection);

        info!("connected to {} without tls", config.display_name());

        Ok(Self::new(client, config))
    }

    async fn connect_tls(config: PgConnectionConfig) -> LinkResult<Self> {
        config
            .tls
            .validate()
            .map_err(|e| link_error!(ErrorKind::ConfigError, "invalid TLS config", e))?;

        let mut root_store = rustls::RootCertStore::empty();
        let mut root_certs_reader = BufReader::new(config.tls.trusted_root_certs.as_bytes());
        for cert in rustls_pemfile::certs(&mut root_certs_reader) {
            let cert = cert?;
            root_store.add(cert).map_err(|e| {
                link_error!(ErrorKind::ConfigError, "invalid trusted root certificate", e)
            })?;
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let (client, connection) = config
            .with_db()
            .connect(MakeRustlsConnect::new(tls_config))
            .await
            .map_err(|e| connect_error(&config, e))?;
        spawn_postgres_connection::<MakeRustlsConnect>(connection);

        info!("connected to {} with tls", config.display_name());

        Ok(Self::new(client, config))
    }

    fn new(client: Client, config: PgConnectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                open_transaction: AtomicBool::new(false),
            }),
        }
    }

    /// The config this connection was built from.
    pub fn config(&self) -> &PgConnectionConfig {
        &self.inner.config
    }

    /// The keyword/value connection string for this instance, as handed to
    /// `CREATE SUBSCRIPTION .. CONNECTION`.
    pub fn conninfo(&self) -> String {
        self.inner.config.conninfo()
    }

    /// `host:port/name`, for log lines.
    pub fn display_name(&self) -> String {
        self.inner.config.display_name()
    }

    /// Runs a metadata query inside the ambient transaction, lazily opening one.
    pub async fn query(&self, sql: &str) -> LinkResult<Vec<SimpleQueryRow>> {
        self.ensure_ambient_transaction().await?;
        let messages = self.inner.client.simple_query(sql).await?;

        Ok(rows_of(messages))
    }

    /// Runs a mutating statement inside the ambient transaction.
    ///
    /// Callers commit explicitly right after the mutation.
    pub async fn execute(&self, sql: &str) -> LinkResult<()> {
        self.ensure_ambient_transaction().await?;
        self.inner.client.simple_query(sql).await?;

        Ok(())
    }

    /// Commits the ambient transaction, if one is open.
    pub async fn commit(&self) -> LinkResult<()> {
        if self.inner.open_transaction.load(Ordering::SeqCst) {
            let result = self.inner.client.batch_execute("COMMIT").await;
            self.inner.open_transaction.store(false, Ordering::SeqCst);
            result?;
        }

        Ok(())
    }

    /// Rolls back the ambient transaction, if one is open.
    pub async fn rollback(&self) -> LinkResult<()> {
        if self.inner.open_transaction.load(Ordering::SeqCst) {
            let result = self.inner.client.batch_execute("ROLLBACK").await;
            self.inner.open_transaction.store(false, Ordering::SeqCst);
            result?;
        }

        Ok(())
    }

    /// Runs exactly one statement outside any transaction block.
    ///
    /// `CREATE SUBSCRIPTION` and `pg_replication_origin_advance` refuse to run
    /// inside a multi-statement transaction, so any open ambient transaction
    /// is rolled back first (pending work on a control connection is metadata
    /// reads only). The transaction flag is already clear when the statement
    /// runs, so the ambient mode is restored on success and failure alike: the
    /// next ambient statement re-begins.
    pub async fn execute_detached(&self, sql: &str) -> LinkResult<Vec<SimpleQueryRow>> {
        self.rollback().await?;
        let messages = self.inner.client.simple_query(sql).await?;

        Ok(rows_of(messages))
    }

    async fn ensure_ambient_transaction(&self) -> LinkResult<()> {
        if !self.inner.open_transaction.load(Ordering::SeqCst) {
            self.inner.client.batch_execute("BEGIN").await?;
            self.inner.open_transaction.store(true, Ordering::SeqCst);
        }

        Ok(())
    }
}

fn connect_error(config: &PgConnectionConfig, err: tokio_postgres::Error) -> LinkError {
    link_error!(
        ErrorKind::ConnectionFailed,
        "could not connect to Postgres instance",
        format!("{}: {}", config.display_name(), err)
    )
}

fn rows_of(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|message| match message {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// Extracts a non-null text column from a simple-query row.
pub fn row_text(row: &SimpleQueryRow, column: &str, relation: &str) -> LinkResult<String> {
    match row.try_get(column) {
        Ok(Some(value)) => Ok(value.to_owned()),
        Ok(None) => Err(link_error!(
            ErrorKind::ConversionError,
            "unexpected null column value",
            format!("{relation}.{column}")
        )),
        Err(e) => Err(e.into()),
    }
}

/// Extracts a nullable text column from a simple-query row.
pub fn opt_row_text(
    row: &SimpleQueryRow,
    column: &str,
) -> LinkResult<Option<String>> {
    Ok(row.try_get(column)?.map(str::to_owned))
}

/// Extracts and parses a non-null column value.
pub fn row_value<T>(row: &SimpleQueryRow, column: &str, relation: &str) -> LinkResult<T>
where
    T: FromStr,
    T::Err: fmt::Debug,
{
    let raw = row_text(row, column, relation)?;

    raw.parse().map_err(|e| {
        link_error!(
            ErrorKind::ConversionError,
            "failed to parse column value",
            format!("{relation}.{column}={raw}: {e:?}")
        )
    })
}

/// Extracts and parses a nullable column value.
pub fn opt_row_value<T>(row: &SimpleQueryRow, column: &str, relation: &str) -> LinkResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Debug,
{
    let Some(raw) = opt_row_text(row, column)? else {
        return Ok(None);
    };

    let parsed = raw.parse().map_err(|e| {
        link_error!(
            ErrorKind::ConversionError,
            "failed to parse column value",
            format!("{relation}.{column}={raw}: {e:?}")
        )
    })?;

    Ok(Some(parsed))
}

/// Extracts a boolean column from a simple-query row (`t`/`f` wire text).
pub fn row_bool(row: &SimpleQueryRow, column: &str, relation: &str) -> LinkResult<bool> {
    match row_text(row, column, relation)?.as_str() {
        "t" | "true" => Ok(true),
        "f" | "false" => Ok(false),
        other => Err(link_error!(
            ErrorKind::ConversionError,
            "expected boolean column value",
            format!("{relation}.{column}={other}")
        )),
    }
}

/// The two long-lived connections one invocation operates on.
#[derive(Debug, Clone)]
pub struct ConnectionPair {
    pub source: PgControlConnection,
    pub destination: PgControlConnection,
}

impl ConnectionPair {
    /// Connects source and destination and runs the fatal preflight checks on
    /// both, in that order. Checked once, never retried.
    pub async fn establish(config: &LinkConfig) -> LinkResult<Self> {
        let source = PgControlConnection::connect(config.source.clone()).await?;
        let destination = PgControlConnection::connect(config.destination.clone()).await?;

        preflight::ensure_manageable(&source).await?;
        preflight::ensure_manageable(&destination).await?;

        Ok(Self {
            source,
            destination,
        })
    }

    /// Returns the pair with source and destination roles exchanged.
    pub fn swapped(&self) -> ConnectionPair {
        ConnectionPair {
            source: self.destination.clone(),
            destination: self.source.clone(),
        }
    }
}
