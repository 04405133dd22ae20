//! vpcctl - single-host VPC emulator
//!
//! Builds isolated virtual networks out of Linux bridges, network
//! namespaces, veth pairs and iptables rules, with a state machine-controlled
//! lifecycle and compensation on failure.

mod bulkhead;
mod cli;
mod control;
mod error;
mod manifest;
mod network;
mod orchestrator;
mod policy;
mod sickbay;
mod store;
mod vpc;

use cli::{Cli, Commands};
use control::ShellControl;
use error::{Error, Result};
use orchestrator::Orchestrator;
use policy::PolicyDocument;
use serde::Serialize;
use sickbay::{Diagnosis, Inspector, VpcSummary, VpcView};
use store::ConfigStore;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    if let Err(e) = run(&cli) {
        if cli.json {
            let body = serde_json::json!({ "error": e.kind(), "message": e.to_string() });
            println!("{}", body);
        } else {
            eprintln!("Error [{}]: {}", e.kind(), e);
        }
        std::process::exit(1);
    }
}

/// Logs go to stderr; stdout carries command output only
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("vpcctl=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    if let Commands::Completion { shell } = &cli.command {
        Cli::generate_completion(*shell);
        return Ok(());
    }

    let config = manifest::load(&cli.config)?.with_state_dir(cli.state_dir.clone());
    let store = ConfigStore::open(config.state.dir.clone(), config.state.journal_limit)?;
    let ctl = ShellControl::new(&config.commands);

    let is_root = nix::unistd::Uid::effective().is_root();
    let _lock = if cli.command.mutates() {
        if !is_root {
            return Err(Error::PermissionDenied(
                "this command changes host networking".to_string(),
            ));
        }
        Some(store.lock()?)
    } else {
        if !is_root {
            tracing::warn!("not running as root; live checks may be incomplete");
        }
        None
    };

    let mut orch = Orchestrator::new(&ctl, &store)
        .with_host_offset(config.network.subnet_host_offset)
        .with_default_uplink(config.network.default_uplink.clone());

    match &cli.command {
        Commands::Create { name, cidr } => {
            let vpc = orch.create_vpc(name, cidr)?;
            if cli.json {
                print_json(&vpc)?;
            } else {
                println!(
                    "Created VPC '{}' ({}, gateway {}, switch {})",
                    vpc.name, vpc.cidr, vpc.gateway, vpc.switch
                );
            }
        }
        Commands::AddSubnet {
            vpc,
            name,
            cidr,
            kind,
        } => {
            let subnet = orch.add_subnet(vpc, name, cidr, *kind)?;
            if cli.json {
                print_json(&subnet)?;
            } else {
                println!(
                    "Added {} subnet '{}' ({}) to VPC '{}'",
                    subnet.kind, subnet.name, subnet.cidr, vpc
                );
                println!("  address:   {}", subnet.address);
                println!("  namespace: {}", subnet.namespace_id);
            }
        }
        Commands::EnableNat { vpc, uplink } => {
            let updated = orch.enable_nat(vpc, uplink.as_deref())?;
            if cli.json {
                print_json(&updated.nat)?;
            } else {
                println!(
                    "NAT enabled for VPC '{}' via {}",
                    updated.name,
                    updated.nat.uplink.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::ApplyPolicy { vpc, file } => {
            let doc = PolicyDocument::from_file(file)?;
            let stamp = orch.apply_policy(vpc, &doc)?;
            if cli.json {
                print_json(&stamp)?;
            } else {
                println!(
                    "Applied {} ingress rule(s) to subnet {} of VPC '{}'",
                    stamp.rules, doc.subnet_cidr, vpc
                );
            }
        }
        Commands::Peer { vpc_a, vpc_b } => {
            orch.peer(vpc_a, vpc_b)?;
            if cli.json {
                print_json(&serde_json::json!({ "peered": [vpc_a, vpc_b] }))?;
            } else {
                println!("Peered VPC '{}' with '{}'", vpc_a, vpc_b);
            }
        }
        Commands::Delete { vpc } => {
            let existed = orch.delete_vpc(vpc)?;
            if cli.json {
                print_json(&serde_json::json!({ "vpc": vpc, "deleted": existed }))?;
            } else if existed {
                println!("Deleted VPC '{}'", vpc);
            } else {
                println!("VPC '{}' not found; nothing recorded to delete", vpc);
            }
        }
        Commands::Show { vpc } => {
            let view = Inspector::new(&ctl, &store).show(vpc)?;
            if cli.json {
                print_json(&view)?;
            } else {
                print_vpc(&view);
            }
        }
        Commands::List => {
            let rows = Inspector::new(&ctl, &store).list()?;
            if cli.json {
                print_json(&rows)?;
            } else {
                print_list(&rows);
            }
        }
        Commands::Diagnose { failures } => {
            let diagnosis = Inspector::new(&ctl, &store)
                .with_failure_limit(*failures)
                .diagnose()?;
            if cli.json {
                print_json(&diagnosis)?;
            } else {
                print_diagnosis(&diagnosis);
            }
        }
        // Already handled above
        Commands::Completion { .. } => unreachable!(),
    }

    Ok(())
}

fn print_vpc(view: &VpcView) {
    let vpc = &view.vpc;
    println!("VPC {} ({})", vpc.name, vpc.cidr);
    println!("  gateway: {}", vpc.gateway);
    println!("  switch:  {}", vpc.switch);
    println!("  state:   {}", vpc.state);
    println!(
        "  nat:     {}",
        vpc.nat
            .active_uplink()
            .map(|u| format!("via {}", u))
            .unwrap_or_else(|| "disabled".to_string())
    );
    println!("  created: {}", vpc.created_at.format("%Y-%m-%d %H:%M:%S UTC"));

    if !vpc.subnets.is_empty() {
        println!();
        println!(
            "  {:<16} {:<18} {:<8} {:<15} {:<28} {:<8}",
            "SUBNET", "CIDR", "KIND", "ADDRESS", "NAMESPACE", "POLICY"
        );
        for subnet in &vpc.subnets {
            let policy = subnet
                .policy
                .as_ref()
                .map(|p| format!("{} rules", p.rules))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<16} {:<18} {:<8} {:<15} {:<28} {:<8}",
                subnet.name,
                subnet.cidr.to_string(),
                subnet.kind.to_string(),
                subnet.address.to_string(),
                subnet.namespace_id,
                policy
            );
        }
    }

    if !vpc.peerings.is_empty() {
        println!();
        for peering in &vpc.peerings {
            println!("  peered with {} ({})", peering.peer, peering.peer_cidr);
        }
    }

    if !view.drift.is_empty() {
        println!();
        println!("  Warnings:");
        for drift in &view.drift {
            println!("    - {}", drift);
        }
    }
}

fn print_list(rows: &[VpcSummary]) {
    if rows.is_empty() {
        println!("No VPCs.");
        return;
    }

    println!(
        "{:<20} {:<18} {:<8} {:<8} {:<10} {:<20} {:<6}",
        "NAME", "CIDR", "STATE", "SUBNETS", "NAT", "PEERS", "DRIFT"
    );
    println!("{}", "-".repeat(94));
    for row in rows {
        let peers = if row.peers.is_empty() {
            "-".to_string()
        } else {
            row.peers.join(",")
        };
        println!(
            "{:<20} {:<18} {:<8} {:<8} {:<10} {:<20} {:<6}",
            row.name,
            row.cidr.to_string(),
            row.state.to_string(),
            row.subnets,
            row.nat_uplink.as_deref().unwrap_or("-"),
            peers,
            row.drift
        );
    }
}

fn print_diagnosis(diagnosis: &Diagnosis) {
    let forwarding = match diagnosis.forwarding {
        Some(true) => "enabled",
        Some(false) => "disabled",
        None => "unknown",
    };
    println!("Host forwarding: {}", forwarding);
    println!();

    for health in &diagnosis.vpcs {
        if health.drift.is_empty() {
            println!("{:<20} ok", health.name);
        } else {
            println!("{:<20} {} warning(s)", health.name, health.drift.len());
            for drift in &health.drift {
                println!("    - {}", drift);
            }
        }
    }

    if !diagnosis.host.is_empty() {
        println!();
        println!("Host:");
        for drift in &diagnosis.host {
            println!("    - {}", drift);
        }
    }

    if !diagnosis.recent_failures.is_empty() {
        println!();
        println!("Recent failures:");
        for entry in &diagnosis.recent_failures {
            let status = entry
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} [{}] {} (status {}): {}",
                entry.at.format("%Y-%m-%d %H:%M:%S"),
                entry.vpc,
                entry.step,
                status,
                entry.output.lines().next().unwrap_or("")
            );
        }
    }

    println!();
    if diagnosis.is_healthy() {
        println!("No drift found.");
    } else {
        println!("{} finding(s).", diagnosis.findings());
    }
}
