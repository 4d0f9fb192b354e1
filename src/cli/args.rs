use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ObjectConfig;

#[derive(Parser, Debug)]
#[command(name = "blockcow")]
#[command(
    about = "Mount a directory with large files served through a block-level copy-on-write cache"
)]
pub struct Args {
    #[arg(long, global = true, help = "Path to the config file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Write logs to this file instead of stderr")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where cache misses are fetched from. Overrides `[backing]` in the config.
#[derive(ClapArgs, Debug, Default, Clone)]
pub struct BackingArgs {
    #[arg(
        long,
        conflicts_with = "backing_dir",
        help = "Single image backing every cached object"
    )]
    pub backing_image: Option<PathBuf>,

    #[arg(long, help = "Directory with one backing file per cached object")]
    pub backing_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Mount ROOT at MOUNTPOINT until interrupted")]
    Mount {
        #[arg(help = "Local directory to mirror")]
        root: PathBuf,

        #[arg(help = "Where to mount the filesystem")]
        mount_point: PathBuf,

        #[command(flatten)]
        backing: BackingArgs,

        #[arg(long, help = "Block size in bytes")]
        block_size: Option<u64>,

        #[arg(
            long = "object",
            value_name = "NAME[:SIZE]",
            help = "Provision a cached object before mounting (repeatable)"
        )]
        objects: Vec<ObjectConfig>,

        #[arg(long, help = "Allow other users to access the mount")]
        allow_other: bool,
    },
    #[command(about = "Create sparse local files for cached objects without mounting")]
    Provision {
        #[arg(help = "Local directory holding the sparse files")]
        root: PathBuf,

        #[command(flatten)]
        backing: BackingArgs,

        #[arg(long, help = "Block size in bytes")]
        block_size: Option<u64>,

        #[arg(long = "object", value_name = "NAME[:SIZE]", required = true)]
        objects: Vec<ObjectConfig>,

        #[arg(long, help = "JSON output")]
        json: bool,
    },
    #[command(about = "Manage configuration")]
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    #[command(about = "Show current configuration values")]
    Show,
    #[command(about = "Show config file path")]
    Path,
    #[command(about = "Write a default config file if none exists")]
    Init,
}
