use crate::error::{BlockcowError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// Largest block size accepted without a warning.
const MAX_RECOMMENDED_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u64>,
}

impl CacheConfig {
    pub fn get_block_size(&self) -> u64 {
        self.block_size.unwrap_or_else(super::default_block_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackingConfig {
    /// One image serving every cached object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Directory holding one backing file per object, at the same relative path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathsConfig {
    /// Glob patterns selecting files served through the block cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<Vec<String>>,
}

impl PathsConfig {
    pub fn get_cached(&self) -> Vec<String> {
        self.cached
            .clone()
            .unwrap_or_else(super::default_cached_patterns)
    }
}

/// A Virtual Object provisioned at mount time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub name: String,
    /// Size of the sparse local file. Defaults to the backing object's length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl std::str::FromStr for ObjectConfig {
    type Err = String;

    /// Parses `NAME` or `NAME:SIZE`. A suffix that is not a number is part of
    /// the name.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("Object name cannot be empty".to_string());
        }
        let object = match s.rsplit_once(':') {
            Some((name, size)) if !name.is_empty() => match size.parse::<u64>() {
                Ok(size) => ObjectConfig {
                    name: name.to_string(),
                    size: Some(size),
                },
                Err(_) => ObjectConfig {
                    name: s.to_string(),
                    size: None,
                },
            },
            _ => ObjectConfig {
                name: s.to_string(),
                size: None,
            },
        };
        Ok(object)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub backing: BackingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ObjectConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuse_ttl_secs: Option<u64>,
}

impl Config {
    pub fn get_fuse_ttl_secs(&self) -> u64 {
        self.fuse_ttl_secs
            .unwrap_or_else(super::default_fuse_ttl_secs)
    }
}

/// Object names are relative paths below the mounted root.
pub fn validate_object_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BlockcowError::Config(
            "Object name cannot be empty".to_string(),
        ));
    }

    let path = Path::new(name);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::RootDir => {
                return Err(BlockcowError::Config(format!(
                    "Object name '{}' must be relative to the mounted root",
                    name
                )));
            }
            _ => {
                return Err(BlockcowError::Config(format!(
                    "Object name '{}' cannot contain '.' or '..' components",
                    name
                )));
            }
        }
    }

    Ok(())
}

pub fn validate_config(config: &Config) -> Result<()> {
    let block_size = config.cache.get_block_size();

    if block_size == 0 {
        return Err(BlockcowError::Config(
            "cache.block_size must be greater than zero".to_string(),
        ));
    }

    if !block_size.is_power_of_two() {
        tracing::warn!(
            "cache.block_size ({}) is not a power of two; most requests will straddle blocks",
            block_size
        );
    }

    if block_size > MAX_RECOMMENDED_BLOCK_SIZE {
        tracing::warn!(
            "cache.block_size ({}) is above {} bytes; every miss fetches a whole block",
            block_size,
            MAX_RECOMMENDED_BLOCK_SIZE
        );
    }

    if config.backing.image.is_some() && config.backing.dir.is_some() {
        return Err(BlockcowError::Config(
            "backing.image and backing.dir are mutually exclusive".to_string(),
        ));
    }

    for pattern in config.paths.get_cached() {
        glob::Pattern::new(&pattern).map_err(|e| {
            BlockcowError::Config(format!("Invalid cached glob pattern '{}': {}", pattern, e))
        })?;
    }

    for object in &config.objects {
        validate_object_name(&object.name)?;
    }

    Ok(())
}
