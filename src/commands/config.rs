use std::path::Path;

use crate::cli::ConfigAction;
use crate::config::{get_config_path, load_config, save_config, Config};
use crate::error::Result;

pub fn handle_config_command(action: Option<ConfigAction>, explicit: Option<&Path>) -> Result<()> {
    let config_path = match explicit {
        Some(path) => path.to_path_buf(),
        None => get_config_path()?,
    };

    match action {
        Some(ConfigAction::Path) => {
            println!("Config location: {}", config_path.display());
        }
        Some(ConfigAction::Init) => {
            if config_path.exists() {
                println!("Config already exists at {}", config_path.display());
            } else {
                save_config(&Config::default(), &config_path)?;
                println!("Created default config at {}", config_path.display());
            }
        }
        None | Some(ConfigAction::Show) => {
            let config = load_config(explicit)?;
            println!("Config file: {}", config_path.display());
            println!();
            println!("Current configuration:");
            println!("  Cache:");
            println!("    block_size: {}", config.cache.get_block_size());
            println!("  Backing:");
            println!(
                "    image: {}",
                config.backing.image.as_deref().unwrap_or("(unset)")
            );
            println!(
                "    dir: {}",
                config.backing.dir.as_deref().unwrap_or("(unset)")
            );
            println!("  Paths:");
            println!("    cached: {:?}", config.paths.get_cached());
            if !config.objects.is_empty() {
                println!("  Objects:");
                for object in &config.objects {
                    match object.size {
                        Some(size) => println!("    {} ({} bytes)", object.name, size),
                        None => println!("    {} (size from backing store)", object.name),
                    }
                }
            }
            println!("  Other:");
            println!("    fuse_ttl_secs: {}", config.get_fuse_ttl_secs());
        }
    }
    Ok(())
}
