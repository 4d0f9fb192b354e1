use std::path::Path;

use crate::cli::validate_mount_paths;
use crate::config::Config;
use crate::error::Result;
use crate::overlay::mount_filesystem;

/// Mount `root` at `mount_point` and block until Ctrl-C.
pub async fn run_mount(
    config: &Config,
    root: &Path,
    mount_point: &Path,
    allow_other: bool,
) -> Result<()> {
    validate_mount_paths(root, mount_point)?;

    let cache = super::build_cache(config, root)?;
    let mounted = mount_filesystem(
        root,
        mount_point,
        cache,
        &config.objects,
        config.get_fuse_ttl_secs(),
        config.paths.get_cached(),
        allow_other,
    )?;

    println!(
        "Mounted {} at {} (block size {} bytes)",
        root.display(),
        mounted.mount_point().display(),
        config.cache.get_block_size()
    );
    println!("[press Ctrl-C to unmount]");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
    }

    mounted.unmount();
    println!("Unmounted {}", mount_point.display());
    Ok(())
}
