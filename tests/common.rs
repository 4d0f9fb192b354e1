use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use blockcow::{BackingStore, BlockcowError, OverlayCache, Result};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// In-memory backing store with fetch counting and failure injection.
#[allow(dead_code)]
#[derive(Default)]
pub struct FakeBackingStore {
    objects: Mutex<HashMap<PathBuf, Vec<u8>>>,
    failing_offsets: Mutex<Vec<u64>>,
    /// Cancel this token once the fetch at the given offset completes.
    cancel_after: Mutex<Option<(u64, CancellationToken)>>,
    fetches: AtomicUsize,
}

#[allow(dead_code)]
impl FakeBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, path: &str, bytes: Vec<u8>) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), bytes);
        self
    }

    pub fn fail_at(&self, block_offset: u64) {
        self.failing_offsets.lock().unwrap().push(block_offset);
    }

    pub fn cancel_after(&self, block_offset: u64, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((block_offset, token));
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl BackingStore for FakeBackingStore {
    fn fetch(
        &self,
        path: &Path,
        buf: &mut [u8],
        block_offset: u64,
        _cancel: &CancellationToken,
    ) -> Result<usize> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if self.failing_offsets.lock().unwrap().contains(&block_offset) {
            return Err(BlockcowError::BackingStore {
                path: path.to_path_buf(),
                offset: block_offset,
                reason: "injected failure".to_string(),
            });
        }

        let objects = self.objects.lock().unwrap();
        let data = objects.get(path).map(Vec::as_slice).unwrap_or(&[]);
        let start = (block_offset as usize).min(data.len());
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);

        if let Some((offset, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if *offset == block_offset {
                token.cancel();
            }
        }
        Ok(n)
    }

    fn object_len(&self, path: &Path) -> Result<Option<u64>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(path)
            .map(|d| d.len() as u64))
    }
}

/// Deterministic, non-repeating-per-block test content.
#[allow(dead_code)]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Engine over a temporary local root.
#[allow(dead_code)]
pub struct TestCache {
    pub temp_dir: TempDir,
    pub cache: OverlayCache,
    pub backing: Arc<FakeBackingStore>,
}

#[allow(dead_code)]
impl TestCache {
    pub fn new(block_size: u64, backing: FakeBackingStore) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let backing = Arc::new(backing);
        let cache = OverlayCache::new(temp_dir.path().join("local"), block_size, backing.clone())
            .expect("Failed to build cache");
        Self {
            temp_dir,
            cache,
            backing,
        }
    }

    pub fn local_file(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join("local").join(name)
    }
}
