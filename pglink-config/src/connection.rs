use std::time::Duration;

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_postgres::Config;
use tokio_postgres::config::Host;

use crate::SerializableSecretString;

/// Upper bound on connection establishment. Statement execution is not bounded.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while validating or parsing connection configuration.
#[derive(Debug, Error)]
pub enum ConnectionConfigError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,

    /// The connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    InvalidDsn(String),

    /// The connection string names no host.
    #[error("connection string names no host")]
    MissingHost,

    /// The connection string names no user.
    #[error("connection string names no user")]
    MissingUser,
}

/// Connection parameters for one Postgres instance of the replication pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    /// Hostname or IP address of the Postgres server.
    pub host: String,
    /// Port number on which the Postgres server is listening.
    pub port: u16,
    /// Name of the Postgres database to connect to.
    pub name: String,
    /// Username for authenticating with the Postgres server.
    pub username: String,
    /// Password for the specified user. Redacted in debug output.
    pub password: Option<SerializableSecretString>,
    /// TLS configuration for the connection.
    #[serde(default)]
    pub tls: TlsConfig,
}

/// TLS settings for a Postgres connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TlsConfig {
    /// PEM-encoded trusted root certificates.
    #[serde(default)]
    pub trusted_root_certs: String,
    /// Whether TLS is enabled for the connection.
    #[serde(default)]
    pub enabled: bool,
}

impl TlsConfig {
    /// Checks that trusted roots are present whenever TLS is enabled.
    pub fn validate(&self) -> Result<(), ConnectionConfigError> {
        if self.enabled && self.trusted_root_certs.is_empty() {
            return Err(ConnectionConfigError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

impl PgConnectionConfig {
    /// Builds [`Config`] connect options for this instance, database included,
    /// with the connect timeout applied.
    pub fn with_db(&self) -> Config {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.name)
            .user(&self.username)
            .connect_timeout(CONNECT_TIMEOUT);

        if let Some(password) = &self.password {
            config.password(password.expose_secret());
        }

        config
    }

    /// Parses a libpq keyword/value or URL connection string into a config.
    ///
    /// TLS is never derived from the string since trusted roots cannot travel
    /// in a DSN; enable it in the config file instead.
    pub fn from_dsn(dsn: &str) -> Result<Self, ConnectionConfigError> {
        let parsed: Config = dsn
            .parse()
            .map_err(|e: tokio_postgres::Error| ConnectionConfigError::InvalidDsn(e.to_string()))?;

        let host = match parsed.get_hosts().first() {
            Some(Host::Tcp(host)) => host.clone(),
            #[cfg(unix)]
            Some(Host::Unix(path)) => path.display().to_string(),
            None => return Err(ConnectionConfigError::MissingHost),
        };
        let port = parsed.get_ports().first().copied().unwrap_or(5432);
        let username = parsed
            .get_user()
            .ok_or(ConnectionConfigError::MissingUser)?
            .to_owned();
        // Postgres defaults the database to the user when unspecified.
        let name = parsed.get_dbname().unwrap_or(&username).to_owned();
        let password = parsed
            .get_password()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned().into());

        Ok(Self {
            host,
            port,
            name,
            username,
            password,
            tls: TlsConfig::default(),
        })
    }

    /// Renders the keyword/value connection string handed to the destination's
    /// `CREATE SUBSCRIPTION .. CONNECTION` clause.
    pub fn conninfo(&self) -> String {
        let mut parts = vec![
            format!("host={}", quote_conninfo_value(&self.host)),
            format!("port={}", self.port),
            format!("dbname={}", quote_conninfo_value(&self.name)),
            format!("user={}", quote_conninfo_value(&self.username)),
        ];

        if let Some(password) = &self.password {
            parts.push(format!(
                "password={}",
                quote_conninfo_value(password.expose_secret())
            ));
        }

        if self.tls.enabled {
            parts.push("sslmode=require".to_owned());
        }

        parts.join(" ")
    }

    /// The `host:port/name` form used in log lines, with no credentials.
    pub fn display_name(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.name)
    }
}

/// Quotes a conninfo value per libpq rules: single quotes around values that
/// contain spaces, quotes or backslashes (or are empty), with `\` escapes.
fn quote_conninfo_value(value: &str) -> String {
    let needs_quoting =
        value.is_empty() || value.contains([' ', '\'', '\\']);

    if !needs_quoting {
        return value.to_owned();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');

    quoted
}

/// The source/destination pair this tool operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LinkConfig {
    /// The publishing side (primary).
    pub source: PgConnectionConfig,
    /// The subscribing side (replica).
    pub destination: PgConnectionConfig,
}

impl LinkConfig {
    /// Returns the pair with source and destination roles exchanged.
    pub fn swapped(self) -> Self {
        Self {
            source: self.destination,
            destination: self.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PgConnectionConfig {
        PgConnectionConfig {
            host: "db.internal".to_owned(),
            port: 5433,
            name: "orders".to_owned(),
            username: "replicator".to_owned(),
            password: Some("hunter 2".into()),
            tls: TlsConfig::default(),
        }
    }

    #[test]
    fn dsn_parsing_extracts_all_fields() {
        let config =
            PgConnectionConfig::from_dsn("host=db.internal port=5433 dbname=orders user=replicator password=secret")
                .unwrap();

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 5433);
        assert_eq!(config.name, "orders");
        assert_eq!(config.username, "replicator");
        assert!(config.password.is_some());
        assert!(!config.tls.enabled);
    }

    #[test]
    fn dsn_parsing_defaults_database_to_user() {
        let config = PgConnectionConfig::from_dsn("host=localhost user=postgres").unwrap();

        assert_eq!(config.name, "postgres");
        assert_eq!(config.port, 5432);
    }

    #[test]
    fn dsn_parsing_rejects_garbage() {
        assert!(PgConnectionConfig::from_dsn("not a = valid == dsn").is_err());
        assert!(matches!(
            PgConnectionConfig::from_dsn("port=5432 dbname=x user=u"),
            Err(ConnectionConfigError::MissingHost)
        ));
        assert!(matches!(
            PgConnectionConfig::from_dsn("host=localhost dbname=x"),
            Err(ConnectionConfigError::MissingUser)
        ));
    }

    #[test]
    fn conninfo_quotes_values_with_spaces() {
        let conninfo = sample().conninfo();

        assert_eq!(
            conninfo,
            "host=db.internal port=5433 dbname=orders user=replicator password='hunter 2'"
        );
    }

    #[test]
    fn conninfo_marks_tls_connections() {
        let mut config = sample();
        config.password = None;
        config.tls.enabled = true;

        assert!(config.conninfo().ends_with("sslmode=require"));
    }

    #[test]
    fn tls_validation_requires_roots() {
        let tls = TlsConfig {
            trusted_root_certs: String::new(),
            enabled: true,
        };

        assert!(tls.validate().is_err());
        assert!(TlsConfig::default().validate().is_ok());
    }

    #[test]
    fn swapped_exchanges_roles() {
        let mut destination = sample();
        destination.host = "replica.internal".to_owned();
        let link = LinkConfig {
            source: sample(),
            destination,
        };

        let swapped = link.swapped();

        assert_eq!(swapped.source.host, "replica.internal");
        assert_eq!(swapped.destination.host, "db.internal");
    }
}
