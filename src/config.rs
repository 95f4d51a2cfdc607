//! Command-line and file-based configuration for an embedder wiring up a
//! [`crate::dispatcher::Dispatcher`].
//!
//! Grounded on the `clap`-derive CLI pattern used elsewhere in the example
//! pack (`AharonR-downloader`'s `cli::Args`): a `#[derive(Parser)]` struct
//! with documented fields and range-checked numeric arguments, plus a
//! `serde`+`toml` file for settings better suited to a config file than a
//! flag (the NFS server address and export path don't change run to run).

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "fs-nfs-core")]
#[command(author, version, about)]
pub struct Args {
    /// Path to a TOML config file providing the NFS server/export and queue
    /// sizing. Command-line flags below override it where both are given.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Capacity of the command and completion rings (must be equal — the
    /// back-pressure invariant assumes a matched pair).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=65536))]
    pub queue_capacity: Option<u32>,

    /// Capacity of the descriptor table (maximum concurrently open files
    /// plus directories).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=65536))]
    pub max_descriptors: Option<u32>,
}

/// Settings loaded from a TOML file, merged with [`Args`] by the embedder.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub nfs: NfsConfig,
    #[serde(default)]
    pub queues: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NfsConfig {
    pub server: String,
    pub export: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: u32,
    #[serde(default = "default_max_descriptors")]
    pub max_descriptors: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: default_queue_capacity(), max_descriptors: default_max_descriptors() }
    }
}

fn default_queue_capacity() -> u32 {
    128
}

fn default_max_descriptors() -> u32 {
    128
}

impl FileConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Fully resolved settings an embedder hands to the dispatcher: CLI flags
/// win over file values, file values win over built-in defaults.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub nfs_server: String,
    pub nfs_export: String,
    pub queue_capacity: usize,
    pub max_descriptors: usize,
}

impl Resolved {
    pub fn new(args: &Args, file: &FileConfig) -> Self {
        Self {
            nfs_server: file.nfs.server.clone(),
            nfs_export: file.nfs.export.clone(),
            queue_capacity: args.queue_capacity.map(|v| v as usize).unwrap_or(file.queues.capacity as usize),
            max_descriptors: args.max_descriptors.map(|v| v as usize).unwrap_or(file.queues.max_descriptors as usize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_parse() {
        let args = Args::try_parse_from(["fs-nfs-core"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(args.queue_capacity.is_none());
    }

    #[test]
    fn cli_flags_override_file_values() {
        let args = Args::try_parse_from(["fs-nfs-core", "--queue-capacity", "256"]).unwrap();
        let file = FileConfig::from_toml(
            r#"
            [nfs]
            server = "10.0.0.1"
            export = "/export/data"
            "#,
        )
        .unwrap();

        let resolved = Resolved::new(&args, &file);
        assert_eq!(resolved.queue_capacity, 256);
        assert_eq!(resolved.max_descriptors, 128);
        assert_eq!(resolved.nfs_server, "10.0.0.1");
    }

    #[test]
    fn file_values_fill_in_when_no_flag_given() {
        let args = Args::try_parse_from(["fs-nfs-core"]).unwrap();
        let file = FileConfig::from_toml(
            r#"
            [nfs]
            server = "nfs.example.com"
            export = "/srv/export"

            [queues]
            capacity = 64
            max_descriptors = 32
            "#,
        )
        .unwrap();

        let resolved = Resolved::new(&args, &file);
        assert_eq!(resolved.queue_capacity, 64);
        assert_eq!(resolved.max_descriptors, 32);
    }

    #[test]
    fn rejects_out_of_range_queue_capacity() {
        assert!(Args::try_parse_from(["fs-nfs-core", "--queue-capacity", "0"]).is_err());
    }
}
