use fs2::FileExt;
use fxhash::FxHashSet;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};

use crate::error::{BlockcowError, Result};

/// Create the sparse local file for an object if it does not exist yet.
///
/// The file is extended with `set_len`, which leaves the whole range as a hole
/// instead of allocating it. An existing file is left untouched whatever its
/// size. Returns whether a file was created.
pub fn ensure_created(path: &Path, target_size: u64) -> Result<bool> {
    if path.exists() {
        tracing::debug!("ensure_created: {} already present", path.display());
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        // Lost a race with another creator, which is as good as existing already
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    file.set_len(target_size)?;

    tracing::info!(
        "Created sparse file {} ({} bytes)",
        path.display(),
        target_size
    );
    Ok(true)
}

/// Durable state for one Virtual Object: the local sparse file and the index
/// of blocks whose local bytes are authoritative.
///
/// The store does no locking of its own; the engine wraps it in a mutex.
#[derive(Debug)]
pub struct LocalBlockStore {
    path: PathBuf,
    file: File,
    present: FxHashSet<u64>,
}

impl LocalBlockStore {
    /// Open an already provisioned local file. Takes an exclusive advisory lock
    /// so two processes never cache into the same file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.try_lock_exclusive().map_err(|e| {
            BlockcowError::Config(format!(
                "Local cache file {} is in use by another process: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            present: FxHashSet::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_present(&self, block_offset: u64) -> bool {
        self.present.contains(&block_offset)
    }

    pub fn mark_present(&mut self, block_offset: u64) {
        if self.present.insert(block_offset) {
            tracing::trace!("{}: block {} now present", self.path.display(), block_offset);
        }
    }

    pub fn present_count(&self) -> usize {
        self.present.len()
    }

    /// Read exactly `block_size` bytes at `block_offset`.
    pub fn read_block(&self, block_offset: u64, block_size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; block_size];
        self.read_into(block_offset, &mut buf)?;
        Ok(buf)
    }

    /// Fill `buf` from `offset`. A short read is an error.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Positional write; the file grows if `block_offset + bytes.len()` is past its end.
    pub fn write_block(&self, block_offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.write_all_at(bytes, block_offset)?;
        tracing::trace!(
            "{}: wrote {} bytes at {}",
            self.path.display(),
            bytes.len(),
            block_offset
        );
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for LocalBlockStore {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_ensure_created_is_sparse() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("disk-flat.vmdk");

        assert!(ensure_created(&path, 1 << 30).unwrap());

        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 1 << 30);
        // A fully allocated 1 GiB file would need 2M 512-byte sectors
        assert!(meta.blocks() < 1024, "file should be sparse");
    }

    #[test]
    fn test_ensure_created_leaves_existing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("existing");
        fs::write(&path, b"keep me").unwrap();

        assert!(!ensure_created(&path, 4096).unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn test_ensure_created_makes_parent_dirs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("a/b/disk-flat");

        assert!(ensure_created(&path, 8192).unwrap());
        assert_eq!(fs::metadata(&path).unwrap().len(), 8192);
    }

    #[test]
    fn test_presence_index() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("obj");
        ensure_created(&path, 8192).unwrap();

        let mut store = LocalBlockStore::open(&path).unwrap();
        assert!(!store.is_present(4096));

        store.mark_present(4096);
        store.mark_present(4096);
        assert!(store.is_present(4096));
        assert!(!store.is_present(0));
        assert_eq!(store.present_count(), 1);
    }

    #[test]
    fn test_write_then_read_block() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("obj");
        ensure_created(&path, 8192).unwrap();
        let store = LocalBlockStore::open(&path).unwrap();

        let block = vec![7u8; 4096];
        store.write_block(4096, &block).unwrap();
        assert_eq!(store.read_block(4096, 4096).unwrap(), block);
        assert_eq!(store.read_block(0, 4096).unwrap(), vec![0u8; 4096]);
    }

    #[test]
    fn test_write_extends_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("obj");
        ensure_created(&path, 4096).unwrap();
        let store = LocalBlockStore::open(&path).unwrap();

        store.write_block(8192, &[1u8; 4096]).unwrap();
        assert_eq!(store.len().unwrap(), 12288);
    }

    #[test]
    fn test_short_read_is_io_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("obj");
        ensure_created(&path, 100).unwrap();
        let store = LocalBlockStore::open(&path).unwrap();

        let err = store.read_block(0, 4096).unwrap_err();
        assert!(matches!(err, BlockcowError::Io(_)));
    }

    #[test]
    fn test_second_open_is_refused() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("obj");
        ensure_created(&path, 4096).unwrap();

        let _first = LocalBlockStore::open(&path).unwrap();
        assert!(matches!(
            LocalBlockStore::open(&path),
            Err(BlockcowError::Config(_))
        ));
    }
}
