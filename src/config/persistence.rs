use crate::error::{BlockcowError, Result};
use std::path::Path;

use crate::config::paths::*;
use crate::config::schema::*;

/// Load the config from `explicit` if given, otherwise from the default location.
///
/// An explicit path must exist. A missing default config yields `Config::default()`.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let config_path = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(BlockcowError::Config(format!(
                    "Config file {} does not exist",
                    path.display()
                )));
            }
            path.to_path_buf()
        }
        None => get_config_path()?,
    };

    let config = if config_path.exists() {
        tracing::debug!("Loading config from {}", config_path.display());
        let toml_content = std::fs::read_to_string(&config_path)
            .map_err(|e| BlockcowError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&toml_content)
            .map_err(|e| BlockcowError::Config(format!("Failed to parse config: {}", e)))?
    } else {
        tracing::debug!(
            "No config file at {}, using defaults",
            config_path.display()
        );
        Config::default()
    };

    validate_config(&config)?;
    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            BlockcowError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| BlockcowError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, toml_str)
        .map_err(|e| BlockcowError::Config(format!("Failed to write config file: {}", e)))?;
    Ok(())
}
