use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::LinkConfig;

/// Errors raised while persisting the connection pair.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to serialize connection pair: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to parse connection pair file: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("failed to access connection pair file: {0}")]
    Io(#[from] std::io::Error),
}

/// File-backed storage for the source/destination pair.
///
/// The reversal protocol persists the swapped pair through this store so the
/// next invocation picks up the new topology.
#[derive(Debug, Clone)]
pub struct TomlPairStore {
    path: PathBuf,
}

impl TomlPairStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the pair, replacing any previous contents.
    pub fn save(&self, link: &LinkConfig) -> Result<(), StoreError> {
        let rendered = toml::to_string_pretty(link)?;
        fs::write(&self.path, rendered)?;

        Ok(())
    }

    /// Reads the pair back from the file.
    pub fn load(&self) -> Result<LinkConfig, StoreError> {
        let raw = fs::read_to_string(&self.path)?;

        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PgConnectionConfig, TlsConfig};

    fn endpoint(host: &str) -> PgConnectionConfig {
        PgConnectionConfig {
            host: host.to_owned(),
            port: 5432,
            name: "app".to_owned(),
            username: "postgres".to_owned(),
            password: Some("secret".into()),
            tls: TlsConfig::default(),
        }
    }

    #[test]
    fn save_then_load_round_trips_the_pair() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlPairStore::new(dir.path().join("pglink.toml"));
        let link = LinkConfig {
            source: endpoint("primary.internal"),
            destination: endpoint("replica.internal"),
        };

        store.save(&link).unwrap();
        let reloaded = store.load().unwrap();

        assert_eq!(reloaded.source.host, "primary.internal");
        assert_eq!(reloaded.destination.host, "replica.internal");
        assert_eq!(reloaded.source.username, "postgres");
    }

    #[test]
    fn save_overwrites_previous_pair() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlPairStore::new(dir.path().join("pglink.toml"));
        let link = LinkConfig {
            source: endpoint("primary.internal"),
            destination: endpoint("replica.internal"),
        };

        store.save(&link).unwrap();
        store.save(&link.clone().swapped()).unwrap();
        let reloaded = store.load().unwrap();

        assert_eq!(reloaded.source.host, "replica.internal");
        assert_eq!(reloaded.destination.host, "primary.internal");
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlPairStore::new(dir.path().join("absent.toml"));

        assert!(matches!(store.load(), Err(StoreError::Io(_))));
    }
}
