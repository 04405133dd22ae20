//! Command-line interface for vpcctl
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::manifest::DEFAULT_CONFIG_PATH;
use crate::vpc::SubnetKind;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// vpcctl - virtual private clouds on a single Linux host
#[derive(Parser)]
#[command(name = "vpcctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Directory holding VPC descriptors (overrides the config file)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create a VPC with its switch and gateway
    Create {
        /// VPC name
        name: String,

        /// VPC network, e.g. 10.0.0.0/16
        cidr: String,
    },

    /// Add a subnet to a VPC
    AddSubnet {
        /// VPC name
        vpc: String,

        /// Subnet name
        name: String,

        /// Subnet network, contained in the VPC network
        cidr: String,

        /// Whether the subnet may reach beyond its VPC
        #[arg(value_enum, default_value_t = SubnetKind::Private)]
        kind: SubnetKind,
    },

    /// Enable outbound NAT for a VPC
    EnableNat {
        /// VPC name
        vpc: String,

        /// Uplink interface (defaults to the configured uplink)
        uplink: Option<String>,
    },

    /// Apply an ingress policy document to a subnet
    ApplyPolicy {
        /// VPC name
        vpc: String,

        /// Policy file (JSON)
        file: PathBuf,
    },

    /// Connect two VPCs
    Peer {
        /// First VPC
        vpc_a: String,

        /// Second VPC
        vpc_b: String,
    },

    /// Show a VPC and any drift from the live host
    Show {
        /// VPC name
        vpc: String,
    },

    /// List VPCs
    List,

    /// Delete a VPC and everything it owns
    Delete {
        /// VPC name
        vpc: String,
    },

    /// Check every VPC against the host and show recent failures
    Diagnose {
        /// Number of recent failed steps to show
        #[arg(long, default_value_t = 10)]
        failures: usize,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Commands {
    /// Whether the command changes host or stored state
    pub fn mutates(&self) -> bool {
        matches!(
            self,
            Commands::Create { .. }
                | Commands::AddSubnet { .. }
                | Commands::EnableNat { .. }
                | Commands::ApplyPolicy { .. }
                | Commands::Peer { .. }
                | Commands::Delete { .. }
        )
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "vpcctl", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_add_subnet_kind_defaults_to_private() {
        let cli = Cli::try_parse_from(["vpcctl", "add-subnet", "prod", "db", "10.0.2.0/24"]).unwrap();
        match cli.command {
            Commands::AddSubnet { kind, .. } => assert_eq!(kind, SubnetKind::Private),
            _ => panic!("expected add-subnet"),
        }

        let cli = Cli::try_parse_from(["vpcctl", "add-subnet", "prod", "web", "10.0.1.0/24", "public"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::AddSubnet {
                kind: SubnetKind::Public,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["vpcctl", "add-subnet", "prod", "x", "10.0.3.0/24", "dmz"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["vpcctl", "list", "--json", "--state-dir", "/tmp/vpcs"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/vpcs")));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!cli.command.mutates());
    }

    #[test]
    fn test_enable_nat_uplink_optional() {
        let cli = Cli::try_parse_from(["vpcctl", "enable-nat", "prod"]).unwrap();
        assert!(matches!(cli.command, Commands::EnableNat { uplink: None, .. }));
        assert!(cli.command.mutates());
    }
}
