use serde::Deserialize;

/// Top-level configuration settings for the broker.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub store: StoreSettings,
}

/// Host and port the server binds to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Operational parameters of the broker core.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub max_connections: usize,
}

/// Persistence layer location.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub path: String,
}

/// Partial settings loaded from files or environment; missing values fall
/// back to defaults during the merge.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub store: Option<PartialStoreSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 1883,
            },
            broker: BrokerSettings {
                max_connections: 1000,
            },
            store: StoreSettings {
                path: "stormq_db".to_string(),
            },
        }
    }
}
