// file: src/cli/args.rs
// version: 2.0.0
// guid: f6g7h8i9-j0k1-2345-6789-012345fghijk

//! Command line argument definitions

use crate::config::intent::DEFAULT_LABEL;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "syntropy")]
#[command(about = "Provision Syntropy grid nodes onto bootable USB media")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[arg(long, global = true, help = "Structured JSON log lines on stderr")]
    pub log_json: bool,

    #[arg(long, global = true, help = "Machine-readable output and failure reports")]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision a node onto a USB device
    Create(CreateArgs),

    /// List block devices and whether they can be provisioned
    List,

    /// Wipe a device and leave a single FAT32 partition
    Format {
        device: String,

        #[arg(long, default_value = DEFAULT_LABEL)]
        label: String,

        #[arg(short = 'y', long, alias = "yes", help = "Do not ask for confirmation")]
        force: bool,
    },

    /// Show host detection, tool availability and effective settings
    Debug,

    /// Manage stored node identities
    Keys {
        #[command(subcommand)]
        action: KeysCommand,
    },

    /// Write the node record again from the stored identity
    RecordNode {
        #[arg(short = 'n', long)]
        node_name: String,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(long)]
        created_by: Option<String>,
    },

    /// Inspect the install image cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Target device (`/dev/sdb`, `\\.\PHYSICALDRIVE2`)
    #[arg(conflicts_with = "auto_detect", required_unless_present = "auto_detect")]
    pub device: Option<String>,

    #[arg(short, long, help = "Pick the single eligible removable device")]
    pub auto_detect: bool,

    #[arg(short = 'n', long)]
    pub node_name: String,

    #[arg(short, long)]
    pub description: Option<String>,

    #[arg(long, help = "Free text or \"lat,lon\"")]
    pub coordinates: Option<String>,

    #[arg(long, help = "Existing owner private key to import")]
    pub owner_key: Option<String>,

    #[arg(long, default_value = DEFAULT_LABEL)]
    pub label: String,

    #[arg(long)]
    pub work_dir: Option<String>,

    #[arg(long, help = "Directory for cached install images")]
    pub cache_dir: Option<String>,

    #[arg(long, help = "Use this install image instead of the cache")]
    pub iso: Option<String>,

    #[arg(long)]
    pub discovery_server: Option<String>,

    #[arg(long)]
    pub created_by: Option<String>,

    #[arg(short = 'y', long, alias = "yes", help = "Do not ask before erasing the device")]
    pub force: bool,

    #[arg(long)]
    pub keep_work_dir: bool,

    #[arg(long, help = "Replace an existing node record")]
    pub overwrite_record: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum KeysCommand {
    /// Nodes with stored keys and their fingerprints
    List,

    /// Remove every key of a node
    Delete {
        node: String,

        #[arg(short = 'y', long, alias = "yes")]
        force: bool,
    },

    /// Replace the owner key of a node
    RotateOwner { node: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheCommand {
    /// Cached install images
    List,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_create_requires_device_or_auto_detect() {
        assert!(Cli::try_parse_from(["syntropy", "create", "-n", "node-01"]).is_err());
        assert!(Cli::try_parse_from(["syntropy", "create", "-n", "node-01", "--auto-detect"]).is_ok());
        assert!(
            Cli::try_parse_from(["syntropy", "create", "/dev/sdb", "-n", "node-01", "--auto-detect"])
                .is_err()
        );
    }

    #[test]
    fn test_create_defaults() {
        let cli = Cli::try_parse_from(["syntropy", "create", "/dev/sdb", "--node-name", "node-01"]).unwrap();
        let Commands::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.device.as_deref(), Some("/dev/sdb"));
        assert_eq!(args.label, "SYNTROPY");
        assert!(!args.force);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["syntropy", "keys", "list", "--json", "-v"]).unwrap();
        assert!(cli.json);
        assert!(cli.verbose);
    }
}
