mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{LogSettings, MessagingSettings, ServerSettings, Settings};

/// Prefix of the environment variables read by `load_config`, e.g.
/// `SALESBUS_MESSAGING__URI` or `SALESBUS_SERVER__PORT`.
pub const ENV_PREFIX: &str = "SALESBUS";

/// Loads the configuration from `config/default` and the environment.
///
/// A `.env` file in the working directory is loaded first, so its entries
/// behave like ordinary environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();
    load_config_from("config/default")
}

/// Loads the configuration from the given file (any format the `config`
/// crate understands, extension optional) and merges it with defaults.
/// The file is optional; environment variables take precedence over it.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}

#[cfg(test)]
mod tests;
