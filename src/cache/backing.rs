use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::error::{BlockcowError, Result};

/// Source of truth for block contents, consulted only on a cache miss.
///
/// `fetch` fills `buf` (one block long) with the bytes at `block_offset` of the
/// object identified by `path` and returns how many bytes were produced. Fewer
/// than `buf.len()` bytes means the object ends inside this block. Any error is
/// fatal for the request that triggered the fetch. Implementations that block
/// for a long time should poll `cancel` and return `BlockcowError::Cancelled`.
pub trait BackingStore: Send + Sync {
    fn fetch(
        &self,
        path: &Path,
        buf: &mut [u8],
        block_offset: u64,
        cancel: &CancellationToken,
    ) -> Result<usize>;

    /// Length of the backing object, if the store knows it.
    fn object_len(&self, _path: &Path) -> Result<Option<u64>> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
enum Source {
    /// Every object is served from the same image.
    Image(PathBuf),
    /// Objects resolve to `<dir>/<path>`.
    Dir(PathBuf),
}

/// Backing store reading from files reachable on the host, such as an NFS
/// export or a locally staged disk image.
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    source: Source,
}

impl FileBackingStore {
    pub fn image(image: impl Into<PathBuf>) -> Result<Self> {
        let image = image.into();
        if !image.is_file() {
            return Err(BlockcowError::Config(format!(
                "Backing image {} is not a readable file",
                image.display()
            )));
        }
        Ok(Self {
            source: Source::Image(image),
        })
    }

    pub fn dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(BlockcowError::Config(format!(
                "Backing directory {} does not exist",
                dir.display()
            )));
        }
        Ok(Self {
            source: Source::Dir(dir),
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.source {
            Source::Image(image) => image.clone(),
            Source::Dir(dir) => dir.join(path.strip_prefix("/").unwrap_or(path)),
        }
    }

    fn backing_error(path: &Path, offset: u64, e: impl ToString) -> BlockcowError {
        BlockcowError::BackingStore {
            path: path.to_path_buf(),
            offset,
            reason: e.to_string(),
        }
    }
}

impl BackingStore for FileBackingStore {
    fn fetch(
        &self,
        path: &Path,
        buf: &mut [u8],
        block_offset: u64,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let source = self.resolve(path);
        tracing::trace!(
            "fetch {:?} from {} at {} ({} bytes)",
            path,
            source.display(),
            block_offset,
            buf.len()
        );

        let file = File::open(&source).map_err(|e| Self::backing_error(path, block_offset, e))?;

        // Read until the block is full or the backing object ends.
        let mut filled = 0;
        while filled < buf.len() {
            if cancel.is_cancelled() {
                return Err(BlockcowError::Cancelled);
            }
            match file.read_at(&mut buf[filled..], block_offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Self::backing_error(path, block_offset, e)),
            }
        }
        buf[filled..].fill(0);

        Ok(filled)
    }

    fn object_len(&self, path: &Path) -> Result<Option<u64>> {
        let source = self.resolve(path);
        let meta = std::fs::metadata(&source).map_err(|e| Self::backing_error(path, 0, e))?;
        Ok(Some(meta.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_image_store_serves_any_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let image = temp_dir.path().join("disk-flat.vmdk");
        fs::write(&image, b"0123456789abcdef").unwrap();

        let store = FileBackingStore::image(&image).unwrap();
        let cancel = CancellationToken::new();
        let mut buf = vec![0u8; 4];

        let n = store
            .fetch(Path::new("/whatever-flat"), &mut buf, 4, &cancel)
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"4567");
        assert_eq!(
            store.object_len(Path::new("other")).unwrap(),
            Some(16)
        );
    }

    #[test]
    fn test_short_fetch_zero_fills_tail() {
        let temp_dir = tempfile::tempdir().unwrap();
        let image = temp_dir.path().join("img");
        fs::write(&image, b"abcdef").unwrap();

        let store = FileBackingStore::image(&image).unwrap();
        let mut buf = vec![0xffu8; 8];
        let n = store
            .fetch(Path::new("img"), &mut buf, 4, &CancellationToken::new())
            .unwrap();

        assert_eq!(n, 2);
        assert_eq!(&buf, b"ef\0\0\0\0\0\0");
    }

    #[test]
    fn test_dir_store_resolves_relative_paths() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp_dir.path().join("vm")).unwrap();
        fs::write(temp_dir.path().join("vm/disk-flat.vmdk"), b"hello").unwrap();

        let store = FileBackingStore::dir(temp_dir.path()).unwrap();
        let mut buf = vec![0u8; 5];
        store
            .fetch(
                Path::new("/vm/disk-flat.vmdk"),
                &mut buf,
                0,
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_missing_object_is_backing_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileBackingStore::dir(temp_dir.path()).unwrap();
        let mut buf = vec![0u8; 5];

        let err = store
            .fetch(Path::new("absent"), &mut buf, 0, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, BlockcowError::BackingStore { offset: 0, .. }));
    }

    #[test]
    fn test_cancelled_fetch() {
        let temp_dir = tempfile::tempdir().unwrap();
        let image = temp_dir.path().join("img");
        fs::write(&image, b"abcdef").unwrap();

        let store = FileBackingStore::image(&image).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut buf = vec![0u8; 4];
        let err = store
            .fetch(Path::new("img"), &mut buf, 0, &cancel)
            .unwrap_err();
        assert!(matches!(err, BlockcowError::Cancelled));
    }

    #[test]
    fn test_constructors_validate_source() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(FileBackingStore::image(temp_dir.path()).is_err());
        assert!(FileBackingStore::dir(temp_dir.path().join("nope")).is_err());
    }
}
