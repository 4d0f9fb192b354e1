use std::cell::RefCell;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

thread_local! {
    pub(crate) static READ_BUFFER: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(128 * 1024));
}

#[derive(Debug)]
pub(crate) struct FileHandle {
    /// Positional I/O only, so the handle needs no lock of its own.
    pub file: Arc<File>,
    /// Object key when reads and writes go through the block cache.
    pub cached: Option<PathBuf>,
}
