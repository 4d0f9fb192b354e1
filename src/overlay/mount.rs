use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::OverlayCache;
use crate::config::ObjectConfig;
use crate::error::{BlockcowError, Result};
use crate::overlay::BlockcowFs;

/// Provision every configured object in the local root.
///
/// Objects with an explicit size are created at that size; the rest take
/// their size from the backing store. Existing local files are left intact.
pub fn provision_objects(cache: &OverlayCache, objects: &[ObjectConfig]) -> Result<()> {
    for object in objects {
        let path = Path::new(&object.name);
        let size = match object.size {
            Some(size) => {
                cache.ensure_created(path, size)?;
                size
            }
            None => cache.ensure_created_from_backing(path)?,
        };
        tracing::debug!("Provisioned {} ({} bytes)", object.name, size);
    }
    Ok(())
}

/// A running FUSE session. Dropping it unmounts the filesystem.
pub struct MountedFs {
    session: fuser::BackgroundSession,
    shutdown: CancellationToken,
    mount_point: PathBuf,
}

impl MountedFs {
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Abort in-flight fetches, then unmount.
    pub fn unmount(self) {
        self.shutdown.cancel();
        tracing::info!("Unmounting {}", self.mount_point.display());
        drop(self.session);
    }
}

/// Mount `root` at `mount_point` in a background thread.
///
/// # Arguments
/// * `cache` - Engine serving the Virtual Objects under `root`
/// * `objects` - Objects to provision before the mount becomes visible
/// * `ttl_secs` - Cache TTL in seconds for FUSE attributes and entries
/// * `cached_patterns` - Globs selecting which relative paths are Virtual Objects
pub fn mount_filesystem(
    root: &Path,
    mount_point: &Path,
    cache: Arc<OverlayCache>,
    objects: &[ObjectConfig],
    ttl_secs: u64,
    cached_patterns: Vec<String>,
    allow_other: bool,
) -> Result<MountedFs> {
    fs::create_dir_all(mount_point).map_err(|e| {
        BlockcowError::Config(format!(
            "Failed to create mount directory {}: {}",
            mount_point.display(),
            e
        ))
    })?;

    provision_objects(&cache, objects)?;

    let shutdown = CancellationToken::new();
    let fs = BlockcowFs::new(
        root.to_path_buf(),
        cache,
        ttl_secs,
        cached_patterns,
        shutdown.clone(),
    )?;

    let mut mount_options = vec![
        fuser::MountOption::FSName("blockcow".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];
    if allow_other {
        mount_options.push(fuser::MountOption::AllowOther);
    }

    tracing::info!(
        "Mounting FUSE filesystem at {} (root {})",
        mount_point.display(),
        root.display()
    );

    let session = fuser::spawn_mount2(fs, mount_point, &mount_options)
        .map_err(|e| BlockcowError::Fuse(format!("FUSE mount failed: {}", e)))?;

    Ok(MountedFs {
        session,
        shutdown,
        mount_point: mount_point.to_path_buf(),
    })
}
