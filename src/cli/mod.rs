pub mod args;
pub mod validation;

pub use args::{Args, BackingArgs, Commands, ConfigAction};
pub use validation::{validate_mount_paths, validate_objects};
