//! Docker containers through the `docker` CLI's JSON inspection output

use crate::core::backend::NativeTool;
use crate::core::error::{Error, Result};
use crate::core::firewall::Protocol;
use crate::net::model::{ListeningPort, NetworkInterface};
use crate::net::sockets::{self, Socket};
use crate::validators;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_ip: String,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerNetwork {
    pub name: String,
    pub ip: Option<String>,
    pub gateway: Option<String>,
    pub mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Short (12 character) id
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub running: bool,
    /// Init process pid, `None` when stopped
    pub pid: Option<u32>,
    pub ports: Vec<PortMapping>,
    pub networks: Vec<ContainerNetwork>,
    pub created: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspect {
    id: String,
    #[serde(default)]
    name: String,
    created: Option<String>,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    running: bool,
    #[serde(default)]
    pid: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<HostBinding>>>>,
    #[serde(default)]
    networks: Option<BTreeMap<String, InspectNetwork>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct InspectNetwork {
    #[serde(rename = "IPAddress")]
    ip_address: Option<String>,
    #[serde(rename = "Gateway")]
    gateway: Option<String>,
    #[serde(rename = "MacAddress")]
    mac_address: Option<String>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.is_empty())
}

/// Parses `80/tcp` into port and protocol.
fn container_port(key: &str) -> Option<(u16, Protocol)> {
    let (port, proto) = key.split_once('/').unwrap_or((key, "tcp"));
    let protocol = match proto {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        _ => return None,
    };
    Some((port.parse().ok()?, protocol))
}

/// Parses the JSON array printed by `docker inspect`.
///
/// # Errors
///
/// `ParseError` when the output is not a JSON array.
pub fn parse_inspect(json: &str) -> Result<Vec<Container>> {
    let items: Vec<serde_json::Value> =
        serde_json::from_str(json).map_err(|e| Error::parse("docker", e.to_string()))?;

    let mut containers = Vec::with_capacity(items.len());
    for item in items {
        let raw = match serde_json::from_value::<Inspect>(item) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Skipping unrecognized docker inspect entry");
                continue;
            }
        };

        let mut ports: Vec<PortMapping> = raw
            .network_settings
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, bindings)| Some((container_port(&key)?, bindings?)))
            .flat_map(|((container_port, protocol), bindings)| {
                bindings.into_iter().filter_map(move |b| {
                    Some(PortMapping {
                        container_port,
                        protocol,
                        host_ip: if b.host_ip.is_empty() { "0.0.0.0".to_string() } else { b.host_ip },
                        host_port: b.host_port.parse().ok()?,
                    })
                })
            })
            .collect();
        ports.sort_by(|a, b| (a.host_port, a.protocol, &a.host_ip).cmp(&(b.host_port, b.protocol, &b.host_ip)));

        let networks = raw
            .network_settings
            .networks
            .unwrap_or_default()
            .into_iter()
            .map(|(name, net)| ContainerNetwork {
                name,
                ip: non_empty(net.ip_address),
                gateway: non_empty(net.gateway),
                mac: non_empty(net.mac_address),
            })
            .collect();

        containers.push(Container {
            id: raw.id.chars().take(12).collect(),
            name: raw.name.trim_start_matches('/').to_string(),
            image: raw.config.image,
            status: raw.state.status,
            running: raw.state.running,
            pid: (raw.state.pid > 0).then_some(raw.state.pid),
            ports,
            networks,
            created: raw.created,
            labels: raw.config.labels.unwrap_or_default(),
        });
    }
    Ok(containers)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpoint {
    /// Short container id
    pub id: String,
    pub name: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerNetwork {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub scope: String,
    pub internal: bool,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub containers: Vec<NetworkEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInspect {
    id: String,
    name: String,
    #[serde(default)]
    driver: String,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    internal: bool,
    #[serde(rename = "IPAM", default)]
    ipam: Ipam,
    #[serde(default)]
    containers: Option<BTreeMap<String, NetworkInspectEndpoint>>,
}

#[derive(Debug, Default, Deserialize)]
struct Ipam {
    #[serde(rename = "Config", default)]
    config: Option<Vec<IpamConfig>>,
}

#[derive(Debug, Deserialize)]
struct IpamConfig {
    #[serde(rename = "Subnet")]
    subnet: Option<String>,
    #[serde(rename = "Gateway")]
    gateway: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NetworkInspectEndpoint {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "IPv4Address")]
    ipv4: Option<String>,
    #[serde(rename = "IPv6Address")]
    ipv6: Option<String>,
}

/// Parses the JSON array printed by `docker network inspect`. Subnet and
/// gateway come from the first IPAM pool.
///
/// # Errors
///
/// `ParseError` when the output is not a JSON array of networks.
pub fn parse_network_inspect(json: &str) -> Result<Vec<DockerNetwork>> {
    let raw: Vec<NetworkInspect> = serde_json::from_str(json).map_err(|e| Error::parse("docker", e.to_string()))?;
    Ok(raw
        .into_iter()
        .map(|n| {
            let pool = n.ipam.config.and_then(|c| c.into_iter().next());
            let (subnet, gateway) = match pool {
                Some(p) => (non_empty(p.subnet), non_empty(p.gateway)),
                None => (None, None),
            };
            DockerNetwork {
                id: n.id.chars().take(12).collect(),
                name: n.name,
                driver: n.driver,
                scope: n.scope,
                internal: n.internal,
                subnet,
                gateway,
                containers: n
                    .containers
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(id, ep)| NetworkEndpoint {
                        id: id.chars().take(12).collect(),
                        name: ep.name,
                        ipv4: non_empty(ep.ipv4),
                        ipv6: non_empty(ep.ipv6),
                    })
                    .collect(),
            }
        })
        .collect())
}

/// Host ports published by running containers. The container name stands
/// in for the owning process.
pub fn exposed_ports(containers: &[Container], interfaces: &[NetworkInterface]) -> Vec<ListeningPort> {
    let published = containers
        .iter()
        .filter(|c| c.running)
        .flat_map(|c| {
            c.ports.iter().map(|p| Socket {
                protocol: p.protocol,
                address: p.host_ip.clone(),
                scope: None,
                port: p.host_port,
                process: Some(c.name.clone()),
                pid: c.pid,
            })
        })
        .collect();
    sockets::join(published, interfaces)
}

pub struct DockerConnector {
    tool: NativeTool,
}

impl DockerConnector {
    pub fn new(tool: NativeTool) -> Self {
        Self { tool }
    }

    /// Server version, failing when the CLI or the daemon is unreachable
    pub async fn version(&self) -> Result<String> {
        let out = self
            .tool
            .query(&["version", "--format", "{{.Server.Version}}"])
            .await?;
        Ok(out.trim().to_string())
    }

    pub async fn containers(&self) -> Result<Vec<Container>> {
        let ids: Vec<String> = self
            .tool
            .query(&["ps", "-aq"])
            .await?
            .split_whitespace()
            .map(ToString::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect".to_string()];
        args.extend(ids);
        parse_inspect(&self.tool.run(&args).await?)
    }

    pub async fn networks(&self) -> Result<Vec<DockerNetwork>> {
        let ids: Vec<String> = self
            .tool
            .query(&["network", "ls", "-q"])
            .await?
            .split_whitespace()
            .map(ToString::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["network".to_string(), "inspect".to_string()];
        args.extend(ids);
        parse_network_inspect(&self.tool.run(&args).await?)
    }

    /// The last `tail` log lines of a container with timestamps. The
    /// container's stderr stream follows its stdout.
    ///
    /// # Errors
    ///
    /// `InvalidRule` for a malformed container reference, `RuleNotFound`
    /// when Docker knows no such container.
    pub async fn logs(&self, container: &str, tail: u32) -> Result<String> {
        let container = validators::validate_container_ref(container).map_err(Error::InvalidRule)?;
        let args = vec![
            "logs".to_string(),
            "--timestamps".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            container.clone(),
        ];
        let out = self.tool.output(&args).await?;
        if !out.success() {
            if out.stderr.contains("No such container") {
                return Err(Error::RuleNotFound {
                    scope: "docker".to_string(),
                    id: container,
                });
            }
            return Err(Error::from_failure("docker", out.failure_message(), out.exit_code));
        }
        let mut logs = out.stdout;
        logs.push_str(&out.stderr);
        Ok(logs)
    }
}
