use clap::Parser;
use std::fs::OpenOptions;
use std::path::Path;

use blockcow::cli::{Args, Commands};
use blockcow::{commands, error, load_config};

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => {
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> error::Result<()> {
    let filter = std::env::var("BLOCKCOW_LOG").unwrap_or_else(|_| "info".to_string());

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    error::BlockcowError::Config(format!(
                        "Failed to open log file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

async fn run() -> error::Result<i32> {
    let args = Args::parse();

    init_logging(args.log_file.as_deref())?;

    let explicit_config = args.config.as_deref();

    match args.command {
        Commands::Mount {
            root,
            mount_point,
            backing,
            block_size,
            objects,
            allow_other,
        } => {
            let mut config = load_config(explicit_config)?;
            commands::apply_overrides(&mut config, &backing, block_size, &objects)?;
            commands::run_mount(&config, &root, &mount_point, allow_other).await?;
            Ok(0)
        }
        Commands::Provision {
            root,
            backing,
            block_size,
            objects,
            json,
        } => {
            let mut config = load_config(explicit_config)?;
            // Only the objects named on the command line
            config.objects.clear();
            commands::apply_overrides(&mut config, &backing, block_size, &objects)?;
            commands::run_provision(&config, &root, json)?;
            Ok(0)
        }
        Commands::Config { action } => {
            commands::handle_config_command(action, explicit_config)?;
            Ok(0)
        }
    }
}
