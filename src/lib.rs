pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod overlay;

pub use cache::{
    BackingStore, FileBackingStore, LocalBlockStore, ObjectStats, OverlayCache,
    DEFAULT_BLOCK_SIZE,
};

pub use config::expand_tilde;
pub use config::get_config_path;
pub use config::load_config;
pub use config::save_config;
pub use config::Config;
pub use config::ObjectConfig;

pub use error::{BlockcowError, Result};

pub use overlay::{mount_filesystem, BlockcowFs, MountedFs};
