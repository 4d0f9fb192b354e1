pub mod config;
pub mod mount;
pub mod provision;

pub use config::handle_config_command;
pub use mount::run_mount;
pub use provision::run_provision;

use std::path::Path;
use std::sync::Arc;

use crate::cache::{BackingStore, FileBackingStore, OverlayCache};
use crate::cli::BackingArgs;
use crate::config::{expand_tilde, validate_config, Config, ObjectConfig};
use crate::error::{BlockcowError, Result};

/// Fold command-line flags into the loaded config. Flags win; a backing
/// source given on the command line replaces both configured sources.
pub fn apply_overrides(
    config: &mut Config,
    backing: &BackingArgs,
    block_size: Option<u64>,
    objects: &[ObjectConfig],
) -> Result<()> {
    if let Some(image) = &backing.backing_image {
        config.backing.image = Some(image.to_string_lossy().into_owned());
        config.backing.dir = None;
    }
    if let Some(dir) = &backing.backing_dir {
        config.backing.dir = Some(dir.to_string_lossy().into_owned());
        config.backing.image = None;
    }
    if block_size.is_some() {
        config.cache.block_size = block_size;
    }

    for object in objects {
        match config.objects.iter_mut().find(|o| o.name == object.name) {
            Some(existing) => existing.size = object.size.or(existing.size),
            None => config.objects.push(object.clone()),
        }
    }

    validate_config(config)
}

pub fn build_backing_store(config: &Config) -> Result<Arc<dyn BackingStore>> {
    match (&config.backing.image, &config.backing.dir) {
        (Some(image), None) => Ok(Arc::new(FileBackingStore::image(expand_tilde(image))?)),
        (None, Some(dir)) => Ok(Arc::new(FileBackingStore::dir(expand_tilde(dir))?)),
        (Some(_), Some(_)) => Err(BlockcowError::Config(
            "backing.image and backing.dir are mutually exclusive".to_string(),
        )),
        (None, None) => Err(BlockcowError::Config(
            "No backing store configured. Pass --backing-image or --backing-dir, \
             or set [backing] in the config file"
                .to_string(),
        )),
    }
}

pub fn build_cache(config: &Config, root: &Path) -> Result<Arc<OverlayCache>> {
    let backing = build_backing_store(config)?;
    Ok(Arc::new(OverlayCache::new(
        root,
        config.cache.get_block_size(),
        backing,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_cli_backing_replaces_config_source() {
        let mut config = Config::default();
        config.backing.dir = Some("/srv/images".to_string());

        let backing = BackingArgs {
            backing_image: Some(PathBuf::from("/srv/disk-flat.vmdk")),
            backing_dir: None,
        };
        apply_overrides(&mut config, &backing, Some(4096), &[]).unwrap();

        assert_eq!(config.backing.image.as_deref(), Some("/srv/disk-flat.vmdk"));
        assert_eq!(config.backing.dir, None);
        assert_eq!(config.cache.get_block_size(), 4096);
    }

    #[test]
    fn test_cli_objects_merge_by_name() {
        let mut config = Config::default();
        config.objects.push("a-flat:100".parse().unwrap());

        let objects: Vec<ObjectConfig> =
            vec!["a-flat:200".parse().unwrap(), "b-flat".parse().unwrap()];
        apply_overrides(&mut config, &BackingArgs::default(), None, &objects).unwrap();

        assert_eq!(config.objects.len(), 2);
        assert_eq!(config.objects[0].size, Some(200));
        assert_eq!(config.objects[1].name, "b-flat");
    }

    #[test]
    fn test_override_rejects_zero_block_size() {
        let mut config = Config::default();
        let result = apply_overrides(&mut config, &BackingArgs::default(), Some(0), &[]);
        assert!(matches!(result, Err(BlockcowError::Config(_))));
    }

    #[test]
    fn test_build_backing_store_requires_a_source() {
        let result = build_backing_store(&Config::default());
        assert!(matches!(result, Err(BlockcowError::Config(_))));
    }
}
