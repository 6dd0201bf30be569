use crate::config::EngineConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use std::path::Path;

/// Environment variable prefix; `FX_PORTFOLIO__EMERGENCY_STOP=true` overrides `portfolio.emergency_stop`.
pub const ENV_PREFIX: &str = "FX_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads and validates the engine configuration.
    ///
    /// Built-in defaults are merged with the file (TOML, or JSON when the
    /// extension is `.json`) and then with `FX_`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, cannot be parsed, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        if !path.is_file() {
            anyhow::bail!("Config file not found: {}", path.display());
        }

        let figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        let figment = if path.extension().is_some_and(|ext| ext == "json") {
            figment.merge(Json::file(path))
        } else {
            figment.merge(Toml::file(path))
        };

        let config: EngineConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }
}
