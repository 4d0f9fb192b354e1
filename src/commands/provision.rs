use std::fs;
use std::path::Path;

use crate::cli::validate_objects;
use crate::config::Config;
use crate::error::{BlockcowError, Result};
use crate::overlay::mount::provision_objects;

/// Create the sparse local files for every configured object and report them.
pub fn run_provision(config: &Config, root: &Path, json: bool) -> Result<()> {
    validate_objects(&config.objects)?;
    if config.objects.is_empty() {
        return Err(BlockcowError::Config(
            "Nothing to provision: pass at least one --object".to_string(),
        ));
    }

    fs::create_dir_all(root).map_err(|e| {
        BlockcowError::Config(format!(
            "Failed to create root directory {}: {}",
            root.display(),
            e
        ))
    })?;

    let cache = super::build_cache(config, root)?;
    provision_objects(&cache, &config.objects)?;

    let stats = config
        .objects
        .iter()
        .map(|object| cache.stats(Path::new(&object.name)))
        .collect::<Result<Vec<_>>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        for s in &stats {
            println!("{}\t{}", s.local_path.display(), s.object_len);
        }
    }
    Ok(())
}
