mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{BrokerSettings, ServerSettings, Settings, StoreSettings};

/// Loads configuration from the default file (if present) and environment
/// variables, merged over built-in defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("_"));

    let config = builder.build()?;

    // Deserialize whatever is available, then fill the gaps with defaults.
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    Ok(Settings {
        server: ServerSettings {
            host: partial
                .server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: partial
                .server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        broker: BrokerSettings {
            max_connections: partial
                .broker
                .as_ref()
                .and_then(|b| b.max_connections)
                .unwrap_or(default.broker.max_connections),
        },
        store: StoreSettings {
            path: partial
                .store
                .as_ref()
                .and_then(|s| s.path.clone())
                .unwrap_or(default.store.path),
        },
    })
}
