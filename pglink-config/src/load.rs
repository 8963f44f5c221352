use std::path::Path;

use serde::de::DeserializeOwned;

/// Default configuration file, kept next to wherever the tool is run.
pub const DEFAULT_CONFIG_FILE: &str = "pglink.toml";

/// Prefix for environment variable configuration overrides.
const ENV_PREFIX: &str = "PGLINK";

/// Separator between environment variable prefix and key segments.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested configuration keys in environment variables.
///
/// Example: `PGLINK_SOURCE__HOST` sets the `source.host` field.
const ENV_SEPARATOR: &str = "__";

/// Loads configuration from the TOML file and environment variables.
///
/// Sources are layered in this order:
/// 1. The TOML file (`pglink.toml` by default; missing file is not an error).
/// 2. Environment variable overrides prefixed with `PGLINK`, nested keys
///    separated by double underscores.
pub fn load_config<T>(path: Option<&Path>) -> Result<T, config::ConfigError>
where
    T: DeserializeOwned,
{
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

    let settings = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_PREFIX_SEPARATOR)
                .separator(ENV_SEPARATOR),
        )
        .build()?;

    settings.try_deserialize::<T>()
}
