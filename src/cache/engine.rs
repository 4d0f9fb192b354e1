use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cache::backing::BackingStore;
use crate::cache::geometry::{align, patch};
use crate::cache::store::{self, LocalBlockStore};
use crate::error::{BlockcowError, Result};

pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;

/// A provisioned Virtual Object. The mutex is the per-object lock guarding
/// the sparse file and its Presence Index.
#[derive(Debug)]
struct CachedObject {
    store: Mutex<LocalBlockStore>,
    /// Size of the local file when it was registered. Fixed for the object's lifetime.
    len: u64,
}

impl CachedObject {
    /// Bytes of the block at `block_offset` that lie inside the object.
    fn valid_len(&self, block_offset: u64, span: usize) -> usize {
        (self.len.saturating_sub(block_offset)).min(span as u64) as usize
    }

    fn check_range(&self, offset: u64, length: usize) -> Result<()> {
        let in_range = match offset.checked_add(length as u64) {
            Some(end) => end <= self.len,
            None => false,
        };
        if !in_range {
            return Err(BlockcowError::OutOfRange {
                offset,
                length: length as u64,
                size: self.len,
            });
        }
        Ok(())
    }
}

/// Snapshot of one object's cache state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ObjectStats {
    pub local_path: PathBuf,
    pub present_blocks: usize,
    pub local_len: u64,
    pub object_len: u64,
}

/// Read/write entry points over block-aligned, fetch-on-miss storage.
///
/// Objects are keyed by their path relative to `local_root`; the sparse file
/// for `disk-flat.vmdk` lives at `<local_root>/disk-flat.vmdk`.
pub struct OverlayCache {
    local_root: PathBuf,
    block_size: u64,
    backing: Arc<dyn BackingStore>,
    objects: DashMap<PathBuf, Arc<CachedObject>>,
}

impl OverlayCache {
    pub fn new(
        local_root: impl Into<PathBuf>,
        block_size: u64,
        backing: Arc<dyn BackingStore>,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(BlockcowError::Config(
                "block_size must be greater than zero".to_string(),
            ));
        }
        if usize::try_from(block_size).is_err() {
            return Err(BlockcowError::Config(format!(
                "block_size {} does not fit in memory",
                block_size
            )));
        }

        Ok(Self {
            local_root: local_root.into(),
            block_size,
            backing,
            objects: DashMap::new(),
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Key used for `path`: relative, without a leading slash.
    fn object_key(path: &Path) -> PathBuf {
        path.strip_prefix("/").unwrap_or(path).to_path_buf()
    }

    pub fn local_path(&self, path: &Path) -> PathBuf {
        self.local_root.join(Self::object_key(path))
    }

    /// Provision `path`: create its sparse local file if missing and register
    /// it with the engine. Idempotent; a second call changes neither the file
    /// nor the Presence Index.
    pub fn ensure_created(&self, path: &Path, target_size: u64) -> Result<()> {
        let key = Self::object_key(path);
        if self.objects.contains_key(&key) {
            tracing::debug!("ensure_created: {:?} already registered", key);
            return Ok(());
        }

        let local_path = self.local_root.join(&key);
        store::ensure_created(&local_path, target_size)?;

        // entry() holds the shard lock, so concurrent provisioning opens the file once
        match self.objects.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let store = LocalBlockStore::open(&local_path)?;
                let len = store.len()?;
                tracing::info!(
                    "Registered {} ({} bytes, block size {})",
                    local_path.display(),
                    len,
                    self.block_size
                );
                slot.insert(Arc::new(CachedObject {
                    store: Mutex::new(store),
                    len,
                }));
                Ok(())
            }
        }
    }

    /// Provision `path` sized after the backing object.
    pub fn ensure_created_from_backing(&self, path: &Path) -> Result<u64> {
        let size = self.backing.object_len(path)?.ok_or_else(|| {
            BlockcowError::Config(format!(
                "No size configured for {} and the backing store does not report one",
                path.display()
            ))
        })?;
        self.ensure_created(path, size)?;
        Ok(size)
    }

    pub fn is_provisioned(&self, path: &Path) -> bool {
        self.objects.contains_key(&Self::object_key(path))
    }

    /// True if `path` is a provisioned object or a directory containing one.
    pub fn has_provisioned_under(&self, path: &Path) -> bool {
        let prefix = Self::object_key(path);
        self.objects.iter().any(|entry| entry.key().starts_with(&prefix))
    }

    fn object(&self, path: &Path) -> Result<Arc<CachedObject>> {
        let key = Self::object_key(path);
        self.objects
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(BlockcowError::NotProvisioned(key))
    }

    /// Declared size of a provisioned object.
    pub fn object_len(&self, path: &Path) -> Result<u64> {
        Ok(self.object(path)?.len)
    }

    pub fn is_present(&self, path: &Path, block_offset: u64) -> Result<bool> {
        Ok(self.object(path)?.store.lock().is_present(block_offset))
    }

    pub fn stats(&self, path: &Path) -> Result<ObjectStats> {
        let object = self.object(path)?;
        let store = object.store.lock();
        Ok(ObjectStats {
            local_path: store.path().to_path_buf(),
            present_blocks: store.present_count(),
            local_len: store.len()?,
            object_len: object.len,
        })
    }

    /// Flush the local sparse file of `path` to stable storage.
    pub fn sync(&self, path: &Path) -> Result<()> {
        self.object(path)?.store.lock().sync()
    }

    /// Read `output.len()` bytes at `offset`. All-or-nothing: on error the
    /// caller gets no data, though blocks resolved before the failure stay cached.
    ///
    /// The range must lie within the object.
    pub fn read(
        &self,
        path: &Path,
        output: &mut [u8],
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let length = output.len();
        if length == 0 {
            return Ok(0);
        }

        let object = self.object(path)?;
        object.check_range(offset, length)?;
        let blocks = align(offset, length as u64, self.block_size)?;
        tracing::debug!(
            "read {:?} offset={} len={} blocks={}",
            path,
            offset,
            length,
            blocks.len()
        );

        let mut assembled = Vec::with_capacity(blocks.len() * self.block_size as usize);
        self.resolve_blocks(path, &object, &blocks, cancel, |block| {
            assembled.extend_from_slice(block)
        })?;

        let index = (offset - blocks[0]) as usize;
        output.copy_from_slice(&assembled[index..index + length]);
        Ok(length)
    }

    /// Write `input` at `offset` and return `input.len()`.
    pub fn write(
        &self,
        path: &Path,
        input: &[u8],
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let length = input.len();
        if length == 0 {
            return Ok(0);
        }

        let object = self.object(path)?;
        object.check_range(offset, length)?;
        let blocks = align(offset, length as u64, self.block_size)?;
        tracing::debug!(
            "write {:?} offset={} len={} blocks={}",
            path,
            offset,
            length,
            blocks.len()
        );

        // Materialize the span so every block is present before the commit.
        self.resolve_blocks(path, &object, &blocks, cancel, |_| {})?;

        let write_offset = blocks[0];
        let index = (offset - write_offset) as usize;
        let aligned_span = blocks.len() * self.block_size as usize;
        let span = object.valid_len(write_offset, aligned_span);

        // Re-read under the commit lock: another writer may have committed to
        // the edge blocks since they were materialized.
        let store = object.store.lock();
        let mut write_buf = vec![0u8; span];
        store.read_into(write_offset, &mut write_buf)?;
        patch(&mut write_buf, input, index);
        store.write_block(write_offset, &write_buf)?;

        tracing::trace!(
            "committed {:?} write_offset={} span={}",
            path,
            write_offset,
            span
        );
        Ok(length)
    }

    /// Resolve each block in order, fetching and persisting misses, and hand
    /// its bytes to `sink`.
    ///
    /// Only the part of a block inside the object is persisted or read back;
    /// the remainder of a trailing partial block is zero.
    fn resolve_blocks(
        &self,
        path: &Path,
        object: &CachedObject,
        blocks: &[u64],
        cancel: &CancellationToken,
        mut sink: impl FnMut(&[u8]),
    ) -> Result<()> {
        let block_size = self.block_size as usize;

        for &block_offset in blocks {
            if cancel.is_cancelled() {
                return Err(BlockcowError::Cancelled);
            }

            let valid = object.valid_len(block_offset, block_size);

            let mut store = object.store.lock();
            let block = if store.is_present(block_offset) {
                tracing::trace!("cache hit {:?} block={}", path, block_offset);
                let mut block = store.read_block(block_offset, valid)?;
                block.resize(block_size, 0);
                block
            } else {
                tracing::debug!("cache miss {:?} block={}", path, block_offset);
                let block = self.fetch_block(path, block_offset, cancel)?;
                // Durable first, then present
                store.write_block(block_offset, &block[..valid])?;
                store.mark_present(block_offset);
                block
            };
            drop(store);

            sink(&block);
        }

        Ok(())
    }

    fn fetch_block(
        &self,
        path: &Path,
        block_offset: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut block = vec![0u8; self.block_size as usize];
        let fetched = self
            .backing
            .fetch(path, &mut block, block_offset, cancel)
            .map_err(|e| match e {
                BlockcowError::Cancelled => e,
                e => {
                    tracing::error!(
                        "error reading {:?} block {} from storage: {}",
                        path,
                        block_offset,
                        e
                    );
                    match e {
                        BlockcowError::BackingStore { .. } => e,
                        other => BlockcowError::BackingStore {
                            path: path.to_path_buf(),
                            offset: block_offset,
                            reason: other.to_string(),
                        },
                    }
                }
            })?;

        if cancel.is_cancelled() {
            return Err(BlockcowError::Cancelled);
        }
        if fetched > block.len() {
            return Err(BlockcowError::BackingStore {
                path: path.to_path_buf(),
                offset: block_offset,
                reason: format!(
                    "fetch reported {} bytes for a {} byte block",
                    fetched,
                    block.len()
                ),
            });
        }
        if fetched < block.len() {
            tracing::debug!(
                "short fetch {:?} block={} ({} of {} bytes)",
                path,
                block_offset,
                fetched,
                block.len()
            );
            block[fetched..].fill(0);
        }

        Ok(block)
    }
}
