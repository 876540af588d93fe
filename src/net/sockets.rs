//! Listening sockets from `ss -tulnp`, joined against interfaces

use super::model::{InterfacePorts, ListeningPort, NetworkInterface};
use crate::core::firewall::Protocol;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::LazyLock;
use tracing::{debug, warn};

static PROCESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\(\("([^"]+)",pid=(\d+)"#).expect("ss process pattern is valid"));

/// Interface name for wildcard binds
pub const ALL_INTERFACES: &str = "all";
pub const UNKNOWN_INTERFACE: &str = "unknown";

/// One `ss` line before the interface join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socket {
    pub protocol: Protocol,
    pub address: String,
    /// `%iface` suffix of a scoped bind
    pub scope: Option<String>,
    pub port: u16,
    pub process: Option<String>,
    pub pid: Option<u32>,
}

/// Splits `addr:port`, `[v6]:port` and `addr%iface:port`.
fn split_local(local: &str) -> Option<(String, Option<String>, &str)> {
    let (host, port) = if let Some(rest) = local.strip_prefix('[') {
        rest.rsplit_once("]:")?
    } else {
        local.rsplit_once(':')?
    };
    let (host, scope) = match host.split_once('%') {
        Some((h, s)) => (h, Some(s.to_string())),
        None => (host, None),
    };
    Some((host.to_string(), scope, port))
}

/// Parses `ss -tulnp`. Columns: Netid State Recv-Q Send-Q Local Peer Process.
pub fn parse_ss(output: &str) -> Vec<Socket> {
    let mut sockets = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() || parts[0] == "Netid" {
            continue;
        }
        if parts.len() < 5 {
            warn!(line, "Skipping short ss line");
            continue;
        }
        let protocol = match parts[0] {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => {
                debug!(netid = other, "Skipping non-inet socket");
                continue;
            }
        };
        let Some((address, scope, port)) = split_local(parts[4]) else {
            warn!(line, "Skipping ss line with unparseable local address");
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            debug!(line, "Skipping socket without a numeric port");
            continue;
        };

        let (process, pid) = parts
            .get(6..)
            .map(|rest| rest.join(" "))
            .and_then(|users| {
                PROCESS
                    .captures(&users)
                    .map(|c| (c[1].to_string(), c[2].parse::<u32>().ok()))
            })
            .map_or((None, None), |(name, pid)| (Some(name), pid));

        sockets.push(Socket {
            protocol,
            address,
            scope,
            port,
            process,
            pid,
        });
    }
    sockets
}

fn is_wildcard(address: &str) -> bool {
    matches!(address, "0.0.0.0" | "::" | "*" | "")
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

/// Attaches interface and exposure to each socket.
///
/// - a `%iface` scope names the interface, wildcard binds included
/// - other wildcard binds are on `all`; wildcards are always public
/// - loopback addresses are never public
/// - any other address belongs to the interface owning it, or `unknown`,
///   and counts as public
pub fn join(sockets: Vec<Socket>, interfaces: &[NetworkInterface]) -> Vec<ListeningPort> {
    sockets
        .into_iter()
        .map(|s| {
            let (address, interface, is_public) = if is_wildcard(&s.address) {
                let address = if s.address == "::" { "::" } else { "0.0.0.0" };
                let interface = s.scope.unwrap_or_else(|| ALL_INTERFACES.to_string());
                (address.to_string(), interface, true)
            } else {
                let ip = s.address.parse::<IpAddr>().ok();
                let loopback = ip.is_some_and(is_loopback);
                let interface = s
                    .scope
                    .clone()
                    .or_else(|| {
                        let ip = ip?;
                        interfaces
                            .iter()
                            .find(|i| i.owns(ip))
                            .or_else(|| interfaces.iter().find(|i| loopback && i.is_loopback))
                            .map(|i| i.name.clone())
                    })
                    .unwrap_or_else(|| UNKNOWN_INTERFACE.to_string());
                (s.address, interface, !loopback)
            };
            ListeningPort {
                port: s.port,
                protocol: s.protocol,
                address,
                interface,
                process: s.process,
                pid: s.pid,
                is_public,
            }
        })
        .collect()
}

/// Groups ports by interface: `all` first, then by descending count, then
/// by name.
pub fn group_by_interface(ports: Vec<ListeningPort>) -> Vec<InterfacePorts> {
    let mut groups: HashMap<String, Vec<ListeningPort>> = HashMap::new();
    for port in ports {
        groups.entry(port.interface.clone()).or_default().push(port);
    }
    let mut grouped: Vec<InterfacePorts> = groups
        .into_iter()
        .map(|(interface, mut ports)| {
            ports.sort_by_key(|p| (p.port, p.protocol));
            InterfacePorts { interface, ports }
        })
        .collect();
    grouped.sort_by(|a, b| {
        (b.interface == ALL_INTERFACES)
            .cmp(&(a.interface == ALL_INTERFACES))
            .then(b.ports.len().cmp(&a.ports.len()))
            .then_with(|| a.interface.cmp(&b.interface))
    });
    grouped
}
