//! Neutral shapes for routing, interfaces and socket bindings

use crate::core::coordinator::AuditTarget;
use crate::core::error::{Error, Result};
use crate::core::firewall::Protocol;
use crate::validators;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Table the kernel uses when none is named
pub const MAIN_TABLE: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceAddress {
    pub address: IpAddr,
    pub prefix_len: u8,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub name: String,
    pub index: Option<u32>,
    pub state: String,
    pub mtu: Option<u32>,
    pub mac: Option<String>,
    pub addresses: Vec<InterfaceAddress>,
    pub is_loopback: bool,
}

impl NetworkInterface {
    pub fn owns(&self, ip: IpAddr) -> bool {
        self.addresses.iter().any(|a| a.address == ip)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// CIDR or `default`
    pub destination: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub metric: Option<u32>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Route origin (kernel, boot, static, dhcp)
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default, rename = "type")]
    pub route_type: Option<String>,
}

impl Route {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            gateway: None,
            interface: None,
            metric: None,
            scope: None,
            protocol: None,
            table: None,
            route_type: None,
        }
    }

    pub fn via(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    pub fn dev(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(MAIN_TABLE)
    }

    /// `destination@interface@table`
    pub fn id(&self) -> String {
        format!(
            "{}@{}@{}",
            self.destination,
            self.interface.as_deref().unwrap_or_default(),
            self.table_name()
        )
    }

    fn is_unicast(&self) -> bool {
        self.route_type.as_deref().is_none_or(|t| t == "unicast")
    }

    /// Whether a listed route is the one `wanted` describes. Fields `wanted`
    /// leaves unset match anything.
    pub fn selects(&self, wanted: &Route) -> bool {
        fn opt_eq<T: PartialEq>(wanted: Option<&T>, have: Option<&T>) -> bool {
            wanted.is_none_or(|w| have == Some(w))
        }
        self.destination == wanted.destination
            && self.table_name() == wanted.table_name()
            && opt_eq(wanted.gateway.as_ref(), self.gateway.as_ref())
            && opt_eq(wanted.interface.as_ref(), self.interface.as_ref())
            && opt_eq(wanted.metric.as_ref(), self.metric.as_ref())
    }

    /// # Errors
    ///
    /// `InvalidRule` for a malformed destination, gateway, interface or
    /// table, or a unicast route with neither gateway nor interface.
    pub fn validate(&self) -> Result<()> {
        if self.destination != "default" {
            validators::validate_network(&self.destination).map_err(Error::InvalidRule)?;
        }
        if let Some(gw) = &self.gateway {
            gw.parse::<IpAddr>()
                .map_err(|_| Error::InvalidRule(format!("Invalid gateway address '{gw}'")))?;
        }
        if let Some(dev) = &self.interface {
            validators::validate_interface(dev).map_err(Error::InvalidRule)?;
        }
        if let Some(table) = &self.table {
            validators::validate_table(table).map_err(Error::InvalidRule)?;
        }
        if let Some(kind) = &self.route_type
            && !matches!(
                kind.as_str(),
                "unicast" | "blackhole" | "unreachable" | "prohibit" | "local" | "throw"
            )
        {
            return Err(Error::InvalidRule(format!("Unsupported route type '{kind}'")));
        }
        if self.is_unicast() && self.gateway.is_none() && self.interface.is_none() {
            return Err(Error::InvalidRule(
                "A unicast route needs a gateway or an interface".to_string(),
            ));
        }
        Ok(())
    }

    /// `ip route add|del` arguments after the verb
    pub(crate) fn native_args(&self, verb: &str) -> Vec<String> {
        let mut args = vec!["route".to_string(), verb.to_string()];
        if let Some(kind) = &self.route_type
            && kind != "unicast"
        {
            args.push(kind.clone());
        }
        args.push(self.destination.clone());
        if let Some(gw) = &self.gateway {
            args.extend(["via".to_string(), gw.clone()]);
        }
        if let Some(dev) = &self.interface {
            args.extend(["dev".to_string(), dev.clone()]);
        }
        if let Some(metric) = self.metric {
            args.extend(["metric".to_string(), metric.to_string()]);
        }
        if self.table_name() != MAIN_TABLE {
            args.extend(["table".to_string(), self.table_name().to_string()]);
        }
        args
    }
}

impl AuditTarget for Route {
    fn audit_id(&self) -> Option<String> {
        Some(self.id())
    }
}

/// One `ip rule` entry; `priority` is the key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpPolicyRule {
    pub priority: u32,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub firewall_mark: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    /// `lookup` (implied by a table), `blackhole`, `unreachable`, `prohibit`
    #[serde(default)]
    pub action: Option<String>,
}

impl IpPolicyRule {
    pub fn lookup(priority: u32, table: impl Into<String>) -> Self {
        Self {
            priority,
            source: None,
            destination: None,
            firewall_mark: None,
            table: Some(table.into()),
            action: None,
        }
    }

    fn terminal_action(&self) -> Option<&str> {
        self.action.as_deref().filter(|a| *a != "lookup")
    }

    /// # Errors
    ///
    /// `InvalidRule` for malformed selectors, or when the rule has neither a
    /// table nor a terminal action.
    pub fn validate(&self) -> Result<()> {
        for net in [&self.source, &self.destination].into_iter().flatten() {
            validators::validate_network(net).map_err(Error::InvalidRule)?;
        }
        if let Some(mark) = &self.firewall_mark {
            validators::validate_fwmark(mark).map_err(Error::InvalidRule)?;
        }
        if let Some(table) = &self.table {
            validators::validate_table(table).map_err(Error::InvalidRule)?;
        }
        match self.terminal_action() {
            Some("blackhole" | "unreachable" | "prohibit") => Ok(()),
            Some(other) => Err(Error::InvalidRule(format!("Unsupported rule action '{other}'"))),
            None if self.table.is_none() => Err(Error::InvalidRule(
                "A policy rule needs a table to look up".to_string(),
            )),
            None => Ok(()),
        }
    }

    pub(crate) fn add_args(&self) -> Vec<String> {
        let mut args = vec![
            "rule".to_string(),
            "add".to_string(),
            "priority".to_string(),
            self.priority.to_string(),
        ];
        if let Some(src) = &self.source {
            args.extend(["from".to_string(), src.clone()]);
        }
        if let Some(dst) = &self.destination {
            args.extend(["to".to_string(), dst.clone()]);
        }
        if let Some(mark) = &self.firewall_mark {
            args.extend(["fwmark".to_string(), mark.clone()]);
        }
        match (self.terminal_action(), &self.table) {
            (Some(action), _) => args.push(action.to_string()),
            (None, Some(table)) => args.extend(["table".to_string(), table.clone()]),
            (None, None) => {}
        }
        args
    }
}

impl AuditTarget for IpPolicyRule {
    fn audit_id(&self) -> Option<String> {
        Some(self.priority.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArpEntry {
    pub ip: String,
    pub mac: Option<String>,
    pub interface: Option<String>,
    pub state: Vec<String>,
}

/// A bound socket, recomputed on every request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListeningPort {
    pub port: u16,
    pub protocol: Protocol,
    pub address: String,
    pub interface: String,
    pub process: Option<String>,
    pub pid: Option<u32>,
    pub is_public: bool,
}

/// Listening ports grouped under the interface they bind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfacePorts {
    pub interface: String,
    pub ports: Vec<ListeningPort>,
}
