use crate::config::{validate_object_name, ObjectConfig};
use crate::error::{BlockcowError, Result};
use std::path::Path;

/// The root must be an existing directory and the mount point must not sit
/// inside it, or lookups through the mount would recurse into itself.
pub fn validate_mount_paths(root: &Path, mount_point: &Path) -> Result<()> {
    if !root.is_dir() {
        return Err(BlockcowError::Config(format!(
            "Root {} is not a directory",
            root.display()
        )));
    }

    let canonical_root = root.canonicalize().map_err(|e| {
        BlockcowError::Config(format!("Failed to resolve root {}: {}", root.display(), e))
    })?;

    // The mount point may not exist yet; resolve what does
    let canonical_mount = match mount_point.canonicalize() {
        Ok(path) => path,
        Err(_) => match (mount_point.parent(), mount_point.file_name()) {
            (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent
                .canonicalize()
                .map(|p| p.join(name))
                .unwrap_or_else(|_| mount_point.to_path_buf()),
            _ => mount_point.to_path_buf(),
        },
    };

    if canonical_mount.starts_with(&canonical_root) {
        return Err(BlockcowError::Config(format!(
            "Mount point {} cannot be inside root {}",
            canonical_mount.display(),
            canonical_root.display()
        )));
    }

    Ok(())
}

pub fn validate_objects(objects: &[ObjectConfig]) -> Result<()> {
    for object in objects {
        validate_object_name(&object.name)?;
    }
    Ok(())
}
