pub mod paths;
pub mod persistence;
pub mod schema;

pub use paths::*;
pub use persistence::*;
pub use schema::*;

fn default_block_size() -> u64 {
    crate::cache::DEFAULT_BLOCK_SIZE
}

fn default_cached_patterns() -> Vec<String> {
    vec!["*-flat*".to_string()]
}

fn default_fuse_ttl_secs() -> u64 {
    1
}
