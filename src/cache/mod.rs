pub mod backing;
pub mod engine;
pub mod geometry;
pub mod store;

pub use backing::{BackingStore, FileBackingStore};
pub use engine::{ObjectStats, OverlayCache, DEFAULT_BLOCK_SIZE};
pub use store::LocalBlockStore;
