//! Network control backed by the `ip`, `iptables` and `sysctl` commands
//!
//! Every call runs one or more external processes with a timeout. Programs
//! are invoked directly with argument vectors, never through a shell.

use super::{Listing, NetworkControl, Outcome, Presence};
use crate::bulkhead::{Chain, FilterRule};
use crate::manifest::CommandsConfig;
use ipnet::Ipv4Net;
use std::io::Read;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const FORWARDING_KEY: &str = "net.ipv4.ip_forward";

/// Messages that mean "already gone" when deleting
const ABSENT_MARKERS: &[&str] = &[
    "Cannot find device",
    "does not exist",
    "No such file or directory",
    "No chain/target/match by that name",
    "does a matching rule exist",
];

/// Host network control through external commands
#[derive(Debug, Clone)]
pub struct ShellControl {
    ip: PathBuf,
    iptables: PathBuf,
    sysctl: PathBuf,
    timeout: Duration,
}

impl ShellControl {
    pub fn new(config: &CommandsConfig) -> Self {
        Self {
            ip: config.ip.clone(),
            iptables: config.iptables.clone(),
            sysctl: config.sysctl.clone(),
            timeout: config.timeout_duration(),
        }
    }

    /// Run a program with a timeout, capturing stdout and stderr
    fn run(&self, program: &Path, args: &[String]) -> Outcome {
        let cmdline = format!("{} {}", program.display(), args.join(" "));
        tracing::debug!(command = %cmdline, "running");

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(command = %cmdline, error = %e, "failed to spawn");
                return Outcome::failed(format!("failed to run {}: {}", program.display(), e), None);
            }
        };

        // Drain pipes concurrently so a chatty child cannot block on a full pipe
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        tracing::warn!(command = %cmdline, "timed out");
                        return Outcome::timed_out(self.timeout.as_secs());
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    return Outcome::failed(format!("failed to wait on process: {}", e), None);
                }
            }
        };

        let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
        let output = combine(stdout.trim(), stderr.trim());

        if status.success() {
            Outcome::ok(output)
        } else {
            tracing::warn!(
                command = %cmdline,
                status = ?status.code(),
                output = %output,
                "command failed"
            );
            Outcome::failed(output, status.code())
        }
    }

    fn ip(&self, ns: Option<&str>, args: &[&str]) -> Outcome {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(ns) = ns {
            full.extend(["-n".to_string(), ns.to_string()]);
        }
        full.extend(args.iter().map(|a| a.to_string()));
        self.run(&self.ip, &full)
    }

    /// Run iptables on the host or inside a namespace
    fn iptables(&self, ns: Option<&str>, args: Vec<String>) -> Outcome {
        match ns {
            None => self.run(&self.iptables, &args),
            Some(ns) => {
                let mut full = vec![
                    "netns".to_string(),
                    "exec".to_string(),
                    ns.to_string(),
                    self.iptables.display().to_string(),
                ];
                full.extend(args);
                self.run(&self.ip, &full)
            }
        }
    }

    fn rule_command(flag: &str, rule: &FilterRule) -> Vec<String> {
        let mut args = vec![flag.to_string(), rule.chain.name().to_string()];
        args.extend(rule.to_iptables_args());
        args
    }

    fn insert_command(rule: &FilterRule) -> Vec<String> {
        let mut args = vec!["-I".to_string(), rule.chain.name().to_string(), "1".to_string()];
        args.extend(rule.to_iptables_args());
        args
    }

    fn masquerade_command(flag: &str, source: Ipv4Net, uplink: &str) -> Vec<String> {
        let source = source.to_string();
        [
            "-t",
            "nat",
            flag,
            "POSTROUTING",
            "-s",
            source.as_str(),
            "-o",
            uplink,
            "-j",
            "MASQUERADE",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = pipe.read_to_string(&mut buf);
        buf
    })
}

fn combine(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{}\n{}", stdout, stderr),
    }
}

/// Treat a failure that only says the target is gone as success
fn tolerate_absent(outcome: Outcome) -> Outcome {
    if !outcome.success
        && outcome.timed_out_after.is_none()
        && ABSENT_MARKERS.iter().any(|m| outcome.output.contains(m))
    {
        Outcome::ok(outcome.output)
    } else {
        outcome
    }
}

/// Map an `iptables -C` result: exit 1 means the rule is not there
fn check_presence(outcome: Outcome) -> Presence {
    match outcome.status {
        Some(0) => Presence::Present,
        Some(1) => Presence::Absent,
        _ if !outcome.success
            && outcome.output.contains("No chain/target/match by that name") =>
        {
            Presence::Absent
        }
        _ => Presence::Unknown(outcome),
    }
}

/// Namespace names from `ip netns list`, e.g. `vpc-prod.web (id: 0)`
fn parse_netns_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Interface names from `ip -o link show`, e.g. `5: vpc1a2b3c4d: <BROADCAST,...>`
fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split(':').nth(1))
        .map(|name| name.trim())
        .map(|name| name.split('@').next().unwrap_or(name).to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Appended rules from `iptables -S <chain>`
fn parse_rule_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("-A "))
        .map(str::to_string)
        .collect()
}

impl NetworkControl for ShellControl {
    fn create_switch(&self, name: &str) -> Outcome {
        if self.probe_link(name, None) == Presence::Present {
            return Outcome::ok("");
        }
        self.ip(None, &["link", "add", "name", name, "type", "bridge"])
    }

    fn delete_switch(&self, name: &str) -> Outcome {
        tolerate_absent(self.ip(None, &["link", "del", "dev", name]))
    }

    fn create_namespace(&self, ns: &str) -> Outcome {
        if self.probe_namespace(ns) == Presence::Present {
            return Outcome::ok("");
        }
        self.ip(None, &["netns", "add", ns])
    }

    fn delete_namespace(&self, ns: &str) -> Outcome {
        tolerate_absent(self.ip(None, &["netns", "del", ns]))
    }

    fn create_cable(&self, end: &str, peer: &str) -> Outcome {
        if self.probe_link(end, None) == Presence::Present {
            return Outcome::ok("");
        }
        self.ip(
            None,
            &["link", "add", end, "type", "veth", "peer", "name", peer],
        )
    }

    fn delete_cable(&self, end: &str) -> Outcome {
        tolerate_absent(self.ip(None, &["link", "del", "dev", end]))
    }

    fn attach_to_switch(&self, iface: &str, switch: &str) -> Outcome {
        self.ip(None, &["link", "set", "dev", iface, "master", switch])
    }

    fn move_to_namespace(&self, iface: &str, ns: &str) -> Outcome {
        if self.probe_link(iface, Some(ns)) == Presence::Present {
            return Outcome::ok("");
        }
        self.ip(None, &["link", "set", "dev", iface, "netns", ns])
    }

    fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix: u8, ns: Option<&str>) -> Outcome {
        let cidr = format!("{}/{}", addr, prefix);
        self.ip(ns, &["addr", "replace", &cidr, "dev", iface])
    }

    fn set_up(&self, iface: &str, ns: Option<&str>) -> Outcome {
        self.ip(ns, &["link", "set", "dev", iface, "up"])
    }

    fn add_default_route(&self, ns: &str, gateway: Ipv4Addr, iface: &str) -> Outcome {
        let gw = gateway.to_string();
        self.ip(
            Some(ns),
            &["route", "replace", "default", "via", &gw, "dev", iface, "onlink"],
        )
    }

    fn add_masquerade(&self, source: Ipv4Net, uplink: &str) -> Outcome {
        match self.probe_masquerade(source, uplink) {
            Presence::Present => Outcome::ok(""),
            Presence::Absent => self.iptables(None, Self::masquerade_command("-A", source, uplink)),
            Presence::Unknown(outcome) => outcome,
        }
    }

    fn delete_masquerade(&self, source: Ipv4Net, uplink: &str) -> Outcome {
        match self.probe_masquerade(source, uplink) {
            Presence::Absent => Outcome::ok(""),
            Presence::Present => tolerate_absent(
                self.iptables(None, Self::masquerade_command("-D", source, uplink)),
            ),
            Presence::Unknown(outcome) => outcome,
        }
    }

    fn enable_forwarding(&self) -> Outcome {
        self.run(
            &self.sysctl,
            &["-w".to_string(), format!("{}=1", FORWARDING_KEY)],
        )
    }

    fn ensure_chain(&self, chain: Chain, ns: Option<&str>) -> Outcome {
        let created = self.iptables(ns, vec!["-N".to_string(), chain.name().to_string()]);
        if !created.success && !created.output.contains("already exists") {
            return created;
        }

        let jump = |flag: &str| {
            vec![
                flag.to_string(),
                chain.hook().to_string(),
                "-j".to_string(),
                chain.name().to_string(),
            ]
        };

        match check_presence(self.iptables(ns, jump("-C"))) {
            Presence::Present => Outcome::ok(""),
            Presence::Absent => self.iptables(ns, jump("-I")),
            Presence::Unknown(outcome) => outcome,
        }
    }

    fn add_filter_rule(&self, rule: &FilterRule, ns: Option<&str>) -> Outcome {
        match check_presence(self.iptables(ns, Self::rule_command("-C", rule))) {
            Presence::Present => Outcome::ok(""),
            Presence::Absent => self.iptables(ns, Self::rule_command("-A", rule)),
            Presence::Unknown(outcome) => outcome,
        }
    }

    fn insert_filter_rule(&self, rule: &FilterRule, ns: Option<&str>) -> Outcome {
        match check_presence(self.iptables(ns, Self::rule_command("-C", rule))) {
            Presence::Present => Outcome::ok(""),
            Presence::Absent => self.iptables(ns, Self::insert_command(rule)),
            Presence::Unknown(outcome) => outcome,
        }
    }

    fn delete_filter_rule(&self, rule: &FilterRule, ns: Option<&str>) -> Outcome {
        match check_presence(self.iptables(ns, Self::rule_command("-C", rule))) {
            Presence::Absent => Outcome::ok(""),
            Presence::Present => {
                tolerate_absent(self.iptables(ns, Self::rule_command("-D", rule)))
            }
            Presence::Unknown(outcome) => outcome,
        }
    }

    fn flush_chain(&self, chain: Chain, ns: Option<&str>) -> Outcome {
        tolerate_absent(self.iptables(ns, vec!["-F".to_string(), chain.name().to_string()]))
    }

    fn probe_link(&self, name: &str, ns: Option<&str>) -> Presence {
        let outcome = self.ip(ns, &["link", "show", "dev", name]);
        if outcome.success {
            Presence::Present
        } else if outcome.timed_out_after.is_none()
            && ABSENT_MARKERS.iter().any(|m| outcome.output.contains(m))
        {
            Presence::Absent
        } else {
            Presence::Unknown(outcome)
        }
    }

    fn probe_namespace(&self, ns: &str) -> Presence {
        match self.list_namespaces() {
            Ok(names) if names.iter().any(|n| n == ns) => Presence::Present,
            Ok(_) => Presence::Absent,
            Err(outcome) => Presence::Unknown(outcome),
        }
    }

    fn probe_masquerade(&self, source: Ipv4Net, uplink: &str) -> Presence {
        check_presence(self.iptables(None, Self::masquerade_command("-C", source, uplink)))
    }

    fn probe_forwarding(&self) -> Presence {
        let outcome = self.run(
            &self.sysctl,
            &["-n".to_string(), FORWARDING_KEY.to_string()],
        );
        if !outcome.success {
            return Presence::Unknown(outcome);
        }
        match outcome.output.trim() {
            "1" => Presence::Present,
            "0" => Presence::Absent,
            _ => Presence::Unknown(outcome),
        }
    }

    fn list_switches(&self) -> Listing {
        let outcome = self.ip(None, &["-o", "link", "show", "type", "bridge"]);
        if outcome.success {
            Ok(parse_link_names(&outcome.output))
        } else {
            Err(outcome)
        }
    }

    fn list_namespaces(&self) -> Listing {
        let outcome = self.ip(None, &["netns", "list"]);
        if outcome.success {
            Ok(parse_netns_list(&outcome.output))
        } else {
            Err(outcome)
        }
    }

    fn list_rules(&self, chain: Chain, ns: Option<&str>) -> Listing {
        let outcome = self.iptables(ns, vec!["-S".to_string(), chain.name().to_string()]);
        if outcome.success {
            Ok(parse_rule_lines(&outcome.output))
        } else if outcome.output.contains("No chain/target/match by that name") {
            Ok(Vec::new())
        } else {
            Err(outcome)
        }
    }
}
