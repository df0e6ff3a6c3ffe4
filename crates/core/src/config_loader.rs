use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use std::path::Path;

/// Prefix for environment overrides, e.g. `MARKETFEED_RATE_LIMIT__WEIGHT_PER_MINUTE`.
pub const ENV_PREFIX: &str = "MARKETFEED_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from `config/Config.toml`, `MARKETFEED_*` variables,
    /// the conventional `DATABASE_URL`/`HTTP_PROXY`, and `config/Config.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load() -> Result<AppConfig> {
        Self::load_from(Path::new("config/Config.toml"))
    }

    /// Loads configuration with a specific TOML file as the base layer.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<AppConfig> {
        let config: AppConfig = Self::figment(Figment::new().merge(Toml::file(path)))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        Ok(config)
    }

    /// Loads configuration with a specific profile layered over the base file.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_with_profile(profile: &str) -> Result<AppConfig> {
        let files = Figment::new()
            .merge(Toml::file("config/Config.toml"))
            .merge(Toml::file(format!("config/Config.{profile}.toml")));
        let config: AppConfig = Self::figment(files)
            .extract()
            .with_context(|| format!("Failed to load configuration profile '{profile}'"))?;

        Ok(config)
    }

    fn figment(files: Figment) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(files)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(
                Env::raw()
                    .only(&["DATABASE_URL"])
                    .map(|_| "database.url".into()),
            )
            .merge(Env::raw().only(&["HTTP_PROXY"]).map(|_| "exchange.proxy".into()))
            .join(Json::file("config/Config.json"))
    }
}
