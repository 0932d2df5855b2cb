//! CLI argument definitions using clap
//!
//! Commands:
//! - vstore init --config <path>
//! - vstore stores --config <path>
//! - vstore inspect --config <path> --store <name>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// vstore - an embedded, versioned object store
#[derive(Parser, Debug)]
#[command(name = "vstore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create the data directory layout
    Init {
        /// Path to configuration file
        #[arg(long, default_value = "./vstore.json")]
        config: PathBuf,
    },

    /// List stores and their persisted versions
    Stores {
        /// Path to configuration file
        #[arg(long, default_value = "./vstore.json")]
        config: PathBuf,
    },

    /// Show one store's version and record count
    Inspect {
        /// Path to configuration file
        #[arg(long, default_value = "./vstore.json")]
        config: PathBuf,

        /// Store name
        #[arg(long)]
        store: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect() {
        let cli = Cli::try_parse_from([
            "vstore", "inspect", "--config", "c.json", "--store", "notes",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Command::Inspect {
                config: PathBuf::from("c.json"),
                store: "notes".to_string(),
            }
        );
    }

    #[test]
    fn test_config_has_default() {
        let cli = Cli::try_parse_from(["vstore", "stores"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Stores {
                config: PathBuf::from("./vstore.json"),
            }
        );
    }

    #[test]
    fn test_inspect_requires_store() {
        assert!(Cli::try_parse_from(["vstore", "inspect"]).is_err());
    }
}
