//! Backend-neutral firewall data structures
//!
//! Every adapter parses its native listing into these types and builds its
//! native argv from them, so the rest of the crate never sees tool syntax.
//!
//! # Rule Structure
//!
//! A [`FirewallRule`] carries:
//! - The verdict ([`Action`]) and [`Direction`]
//! - Protocol and an optional [`PortSpec`] (single, range, or application profile)
//! - A source and a destination [`Address`] (`any` or a CIDR)
//! - An optional interface the rule is bound to
//! - An optional comment
//! - `ipv6_only` / `qualifiers` for native match fragments the neutral fields
//!   cannot express
//!
//! The `id` is backend-native and only valid for the listing that produced it.
//!
//! # Example
//!
//! ```
//! use unifw::core::firewall::{Action, FirewallRule, PortSpec, Protocol};
//!
//! let rule = FirewallRule::new(Action::Allow)
//!     .with_protocol(Protocol::Tcp)
//!     .with_port(PortSpec::Single(443))
//!     .with_source("10.0.0.0/8".parse().unwrap());
//! assert_eq!(rule.to_string(), "allow in tcp 443 from 10.0.0.0/8");
//! ```

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported firewall subsystems, declared in preference order
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackendKind {
    Ufw,
    Firewalld,
    Nftables,
    Iptables,
}

impl BackendKind {
    /// Native binary driven by this backend
    pub const fn binary(self) -> &'static str {
        match self {
            BackendKind::Ufw => "ufw",
            BackendKind::Firewalld => "firewall-cmd",
            BackendKind::Nftables => "nft",
            BackendKind::Iptables => "iptables",
        }
    }

    /// Arguments that print the tool version without touching rules
    pub const fn version_args(self) -> &'static [&'static str] {
        match self {
            BackendKind::Ufw => &["version"],
            BackendKind::Firewalld => &["--version"],
            BackendKind::Nftables => &["--version"],
            BackendKind::Iptables => &["--version"],
        }
    }
}

/// Rule verdict
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Action {
    Allow,
    Deny,
    Reject,
    /// Rate-limited allow (ufw only)
    Limit,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Direction {
    #[default]
    In,
    Out,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    #[default]
    Any,
    Tcp,
    Udp,
}

impl Protocol {
    /// Ports and port ranges are only meaningful for TCP and UDP
    pub const fn supports_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

/// Destination port selector
///
/// Serialized as a plain string: `"22"`, `"1000:2000"` or an application
/// profile name such as `"OpenSSH"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PortSpec {
    Single(u16),
    Range { start: u16, end: u16 },
    /// Named application profile (ufw app, firewalld service)
    App(String),
}

impl PortSpec {
    pub fn is_app(&self) -> bool {
        matches!(self, PortSpec::App(_))
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(p) => write!(f, "{p}"),
            PortSpec::Range { start, end } => write!(f, "{start}:{end}"),
            PortSpec::App(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for PortSpec {
    type Err = String;

    /// Accepts `22`, `1000:2000`, `1000-2000` or a profile name.
    /// Range ordering and port 0 are checked by the validators, not here.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty port".to_string());
        }
        if let Ok(port) = s.parse::<u16>() {
            return Ok(PortSpec::Single(port));
        }
        if let Some((a, b)) = s.split_once([':', '-'])
            && let (Ok(start), Ok(end)) = (a.trim().parse::<u16>(), b.trim().parse::<u16>())
        {
            return Ok(PortSpec::Range { start, end });
        }
        if s.chars().all(|c| c.is_ascii_digit() || matches!(c, ':' | '-')) {
            return Err(format!("Invalid port '{s}'"));
        }
        Ok(PortSpec::App(s.to_string()))
    }
}

impl From<PortSpec> for String {
    fn from(p: PortSpec) -> Self {
        p.to_string()
    }
}

impl TryFrom<String> for PortSpec {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Rule source or destination: any address, or one CIDR
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Address {
    #[default]
    Any,
    Network(IpNetwork),
}

impl Address {
    pub fn is_any(&self) -> bool {
        matches!(self, Address::Any)
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Network(IpNetwork::V6(_)))
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self, Address::Network(IpNetwork::V4(_)))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Any => write!(f, "any"),
            // Host networks print as bare addresses, the way every backend lists them
            Address::Network(net) if net.prefix() == max_prefix(net) => write!(f, "{}", net.ip()),
            Address::Network(net) => write!(f, "{net}"),
        }
    }
}

fn max_prefix(net: &IpNetwork) -> u8 {
    match net {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty()
            || s.eq_ignore_ascii_case("any")
            || s.eq_ignore_ascii_case("anywhere")
            || s == "0.0.0.0/0"
            || s == "::/0"
        {
            return Ok(Address::Any);
        }
        let net = s
            .parse::<IpNetwork>()
            .map_err(|e| format!("Invalid address '{s}': {e}"))?;
        // Backends store networks with host bits cleared, so compare in that form
        IpNetwork::new(net.network(), net.prefix())
            .map(Address::Network)
            .map_err(|e| format!("Invalid address '{s}': {e}"))
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// One backend-neutral firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    /// Backend-native identifier, empty for rules not yet added
    #[serde(default)]
    pub id: String,
    pub action: Action,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub port: Option<PortSpec>,
    #[serde(default)]
    pub source: Address,
    #[serde(default, skip_serializing_if = "Address::is_any")]
    pub destination: Address,
    /// Incoming interface for inbound rules, outgoing for outbound ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Applies to IPv6 only while `source` is any
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ipv6_only: bool,
    /// Native match fragments outside the neutral model
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qualifiers: Vec<String>,
}

impl FirewallRule {
    /// Inbound, any protocol, any port, from anywhere
    pub fn new(action: Action) -> Self {
        Self {
            id: String::new(),
            action,
            direction: Direction::In,
            protocol: Protocol::Any,
            port: None,
            source: Address::Any,
            destination: Address::Any,
            interface: None,
            comment: None,
            ipv6_only: false,
            qualifiers: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_port(mut self, port: PortSpec) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_source(mut self, source: Address) -> Self {
        self.source = source;
        self
    }

    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Neither the source nor the destination names an address
    pub fn is_addressless(&self) -> bool {
        self.source.is_any() && self.destination.is_any()
    }

    /// The IP family pinned by the source or destination, if any
    pub fn address_family(&self) -> Option<IpFamily> {
        [self.source, self.destination].iter().find_map(|a| match a {
            Address::Any => None,
            Address::Network(IpNetwork::V4(_)) => Some(IpFamily::V4),
            Address::Network(IpNetwork::V6(_)) => Some(IpFamily::V6),
        })
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Semantic equality: everything except `id` and `comment`
    pub fn matches(&self, other: &FirewallRule) -> bool {
        self.action == other.action
            && self.direction == other.direction
            && self.protocol == other.protocol
            && self.port == other.port
            && self.source == other.source
            && self.destination == other.destination
            && self.interface == other.interface
            && self.ipv6_only == other.ipv6_only
            && self.qualifiers == other.qualifiers
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.action, self.direction, self.protocol)?;
        if let Some(port) = &self.port {
            write!(f, " {port}")?;
        }
        write!(f, " from {}", self.source)?;
        if !self.destination.is_any() {
            write!(f, " to {}", self.destination)?;
        }
        if let Some(iface) = &self.interface {
            write!(f, " on {iface}")?;
        }
        if self.ipv6_only {
            write!(f, " (v6)")?;
        }
        for q in &self.qualifiers {
            write!(f, " [{q}]")?;
        }
        Ok(())
    }
}

/// Probe result for one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub kind: BackendKind,
    pub available: bool,
    pub active: bool,
    pub preferred: bool,
    pub version: Option<String>,
    /// Why the backend is unavailable or inactive
    pub message: Option<String>,
}

impl BackendInfo {
    pub fn unavailable(kind: BackendKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            available: false,
            active: false,
            preferred: false,
            version: None,
            message: Some(message.into()),
        }
    }
}

/// Snapshot of every backend's availability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub backends: Vec<BackendInfo>,
    pub preferred: Option<BackendKind>,
}

impl Detection {
    /// Builds a detection from per-backend results, marking the
    /// highest-priority available backend as preferred.
    pub fn from_infos(mut backends: Vec<BackendInfo>) -> Self {
        backends.sort_by_key(|b| b.kind);
        let preferred = backends.iter().find(|b| b.available).map(|b| b.kind);
        for b in &mut backends {
            b.preferred = Some(b.kind) == preferred;
        }
        Self {
            backends,
            preferred,
        }
    }

    pub fn available(&self) -> Vec<BackendKind> {
        self.backends
            .iter()
            .filter(|b| b.available)
            .map(|b| b.kind)
            .collect()
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        self.backends.iter().any(|b| b.kind == kind && b.available)
    }

    pub fn info(&self, kind: BackendKind) -> Option<&BackendInfo> {
        self.backends.iter().find(|b| b.kind == kind)
    }
}

/// Native status normalized across backends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub enabled: bool,
    pub default_incoming: Option<Action>,
    pub default_outgoing: Option<Action>,
    pub logging: Option<String>,
}

/// A chain as nftables names it, base chains carrying their hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeChain {
    pub family: String,
    pub table: String,
    pub name: String,
    pub hook: Option<String>,
    pub priority: Option<i64>,
    pub policy: Option<String>,
}

/// The named objects a backend organizes its rules around
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NativeObjects {
    /// ufw application profiles usable as a rule's port
    #[serde(rename_all = "camelCase")]
    Applications { applications: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Zones {
        default_zone: Option<String>,
        zones: Vec<String>,
        services: Vec<String>,
    },
    /// `family name` of every table, and every chain in them
    #[serde(rename_all = "camelCase")]
    Tables { tables: Vec<String>, chains: Vec<NativeChain> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_spec_parse() {
        assert_eq!("22".parse::<PortSpec>().unwrap(), PortSpec::Single(22));
        assert_eq!(
            "1000:2000".parse::<PortSpec>().unwrap(),
            PortSpec::Range {
                start: 1000,
                end: 2000
            }
        );
        assert_eq!(
            "1000-2000".parse::<PortSpec>().unwrap(),
            PortSpec::Range {
                start: 1000,
                end: 2000
            }
        );
        assert_eq!(
            "Nginx Full".parse::<PortSpec>().unwrap(),
            PortSpec::App("Nginx Full".into())
        );
        assert!("70000".parse::<PortSpec>().is_err());
        assert!("".parse::<PortSpec>().is_err());
    }

    #[test]
    fn test_address_host_displays_bare() {
        let a: Address = "10.0.0.1".parse().unwrap();
        assert_eq!(a.to_string(), "10.0.0.1");
        let b: Address = "10.0.0.1/32".parse().unwrap();
        assert_eq!(a, b);
        let net: Address = "192.168.0.0/16".parse().unwrap();
        assert_eq!(net.to_string(), "192.168.0.0/16");
        let loose: Address = "192.168.4.7/16".parse().unwrap();
        assert_eq!(loose, net);
        assert_eq!("Anywhere".parse::<Address>().unwrap(), Address::Any);
        assert!("10.0.0.300".parse::<Address>().is_err());
    }

    #[test]
    fn test_matching_ignores_id_and_comment() {
        let a = FirewallRule::new(Action::Allow)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Single(8080))
            .with_id("3")
            .with_comment("web");
        let b = FirewallRule::new(Action::Allow)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Single(8080));
        assert!(a.matches(&b));

        let mut c = b.clone();
        c.ipv6_only = true;
        assert!(!a.matches(&c));

        let mut d = b.clone();
        d.qualifiers.push("ct state new".into());
        assert!(!a.matches(&d));

        assert!(!a.matches(&b.clone().with_interface("eth0")));
        assert!(!a.matches(&b.clone().with_destination("10.0.0.5".parse().unwrap())));
    }

    #[test]
    fn test_interface_and_destination_shape() {
        let rule = FirewallRule::new(Action::Deny)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Single(3306))
            .with_interface("eth1")
            .with_destination("192.168.1.10".parse().unwrap());
        assert_eq!(rule.to_string(), "deny in tcp 3306 from any to 192.168.1.10 on eth1");
        assert_eq!(rule.address_family(), Some(IpFamily::V4));
        assert!(!rule.is_addressless());

        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["interface"], "eth1");
        assert_eq!(json["destination"], "192.168.1.10");
        let back: FirewallRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);

        assert_eq!(FirewallRule::new(Action::Allow).address_family(), None);
    }

    #[test]
    fn test_rule_json_shape() {
        let rule = FirewallRule::new(Action::Deny)
            .with_protocol(Protocol::Udp)
            .with_port(PortSpec::Range { start: 60000, end: 61000 })
            .with_id("INPUT:2");
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["action"], "deny");
        assert_eq!(json["direction"], "in");
        assert_eq!(json["port"], "60000:61000");
        assert_eq!(json["source"], "any");
        assert!(json.get("ipv6Only").is_none());
        assert!(json.get("destination").is_none());
        assert!(json.get("interface").is_none());
        assert!(json.get("qualifiers").is_none());

        let parsed: FirewallRule = serde_json::from_value(serde_json::json!({
            "action": "allow",
            "protocol": "tcp",
            "port": "22",
            "source": "10.0.0.0/8"
        }))
        .unwrap();
        assert_eq!(parsed.direction, Direction::In);
        assert_eq!(parsed.port, Some(PortSpec::Single(22)));
    }

    #[test]
    fn test_detection_prefers_highest_priority() {
        let mut fw = BackendInfo::unavailable(BackendKind::Firewalld, "");
        fw.available = true;
        let mut ipt = BackendInfo::unavailable(BackendKind::Iptables, "");
        ipt.available = true;
        let d = Detection::from_infos(vec![
            ipt,
            BackendInfo::unavailable(BackendKind::Ufw, "ufw not found in PATH"),
            fw,
        ]);
        assert_eq!(d.preferred, Some(BackendKind::Firewalld));
        assert_eq!(d.available(), vec![BackendKind::Firewalld, BackendKind::Iptables]);
        assert_eq!(d.backends.iter().filter(|b| b.preferred).count(), 1);
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("UFW".parse::<BackendKind>().unwrap(), BackendKind::Ufw);
        assert_eq!(BackendKind::Nftables.to_string(), "nftables");
        assert_eq!(BackendKind::Firewalld.binary(), "firewall-cmd");
    }
}
