//! Server settings for the API binary.
//!
//! Read from the same `STOREFRONT__*` environment as the service settings,
//! under the `server` section (e.g. `STOREFRONT__SERVER__BIND_ADDRESS`).

use std::collections::HashMap;

use config::{Config, Environment};
use serde::Deserialize;

use storefront_observability::LogSettings;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    pub log: LogSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            log: LogSettings::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Root {
    server: ServerSettings,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, config::ConfigError> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> Result<Self, config::ConfigError> {
        let root: Root = Config::builder()
            .add_source(
                Environment::with_prefix(storefront_infra::config::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .source(vars),
            )
            .build()?
            .try_deserialize()?;
        Ok(root.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storefront_observability::LogFormat;

    #[test]
    fn defaults() {
        let settings = ServerSettings::from_vars(HashMap::new()).unwrap();
        assert_eq!(settings.bind_address, "0.0.0.0:8080");
        assert_eq!(settings.log.format, LogFormat::Json);
    }

    #[test]
    fn overrides() {
        let vars = HashMap::from([
            ("STOREFRONT__SERVER__BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string()),
            ("STOREFRONT__SERVER__LOG__FORMAT".to_string(), "pretty".to_string()),
        ]);
        let settings = ServerSettings::from_vars(vars).unwrap();
        assert_eq!(settings.bind_address, "127.0.0.1:9000");
        assert_eq!(settings.log.format, LogFormat::Pretty);
    }
}
