use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "rzpaq",
    version,
    about = "Journaling, deduplicating archiver (ZPAQ level 2 format)"
)]
pub struct Cli {
    /// Sets a custom config file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long, default_value = "pretty")]
    pub log_format: LogFormat,

    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct ArchiveArgs {
    /// The archive file
    #[arg(short, long)]
    pub archive: PathBuf,

    /// Password for an encrypted archive
    #[arg(short, long)]
    pub key: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Append files or directories as a new version
    Add {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Files or directories to store
        paths: Vec<PathBuf>,

        /// Compression method 0..5
        #[arg(short, long)]
        method: Option<u8>,

        /// Worker threads
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Record deletions as a new version
    Remove {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Archived paths to delete
        paths: Vec<String>,
    },

    /// Restore files at a version (default: newest)
    Extract {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Archived paths to restore; all when empty
        paths: Vec<String>,

        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        #[arg(long)]
        version: Option<u32>,
    },

    /// List files at a version (default: newest)
    List {
        #[command(flatten)]
        archive: ArchiveArgs,

        #[arg(long)]
        version: Option<u32>,

        /// Show the version history instead of files
        #[arg(long)]
        versions: bool,
    },

    /// Re-check every stored block and fragment digest
    Verify {
        #[command(flatten)]
        archive: ArchiveArgs,

        #[arg(long)]
        threads: Option<usize>,
    },

    /// Rewrite only the live data into a new archive
    Compact {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Destination archive file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// One-shot stream compression of a single file
    Compress {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=5))]
        method: Option<u8>,

        #[arg(short, long)]
        key: Option<String>,
    },

    /// One-shot stream decompression of a single file
    Decompress {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long)]
        key: Option<String>,
    },
}

/// Optional TOML configuration; flags override file values.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub method: Option<u8>,
    pub threads: Option<usize>,
    pub vm_step_limit: Option<u64>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        match path {
            None => Ok(Config::default()),
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                Ok(toml::from_str(&raw)?)
            }
        }
    }
}
