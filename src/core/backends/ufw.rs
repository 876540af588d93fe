//! ufw adapter
//!
//! Lists with `ufw status numbered`, reads policies from `ufw status verbose`
//! and deletes by rule number. ufw renders IPv6 twins of `any` rules as
//! separate numbered entries tagged `(v6)`; those surface with `ipv6_only`.

use crate::command::argv;
use crate::core::backend::{FirewallBackend, NativeTool};
use crate::core::error::{Error, Result};
use crate::core::firewall::{
    Action, Address, BackendKind, BackendStatus, Direction, FirewallRule, NativeObjects, PortSpec,
    Protocol,
};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

static NUMBERED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\s*(\d+)\]\s+(.+?)\s+(ALLOW|DENY|REJECT|LIMIT)(?:\s+(IN|OUT|FWD))?\s+(.+)$")
        .expect("numbered line pattern is valid")
});

pub struct UfwBackend {
    tool: NativeTool,
}

impl UfwBackend {
    pub fn new(tool: NativeTool) -> Self {
        Self { tool }
    }

    /// Application profiles from `ufw app list`
    pub async fn app_list(&self) -> Result<Vec<String>> {
        let out = self.tool.query(&["app", "list"]).await?;
        parse_app_list(&out)
    }
}

#[async_trait]
impl FirewallBackend for UfwBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ufw
    }

    async fn status(&self) -> Result<BackendStatus> {
        let out = self.tool.query(&["status", "verbose"]).await?;
        parse_status(&out)
    }

    async fn list_rules(&self) -> Result<Vec<FirewallRule>> {
        let out = self.tool.query(&["status", "numbered"]).await?;
        parse_numbered(&out)
    }

    async fn dispatch_add(&self, rule: &FirewallRule) -> Result<()> {
        self.tool.run(&add_args(rule)).await?;
        Ok(())
    }

    async fn dispatch_delete(&self, rule: &FirewallRule) -> Result<()> {
        self.tool
            .run(&argv(["--force", "delete", rule.id.as_str()]))
            .await?;
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        self.tool.query(&["--force", "enable"]).await?;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.tool.query(&["disable"]).await?;
        Ok(())
    }

    async fn native_objects(&self) -> Result<NativeObjects> {
        Ok(NativeObjects::Applications {
            applications: self.app_list().await?,
        })
    }
}

/// Builds `ufw <action> <in|out> [on IFACE] from <src> to <dst> [...] [comment C]`.
pub fn add_args(rule: &FirewallRule) -> Vec<String> {
    let mut args = argv([rule.action.as_ref(), rule.direction.as_ref()]);
    if let Some(iface) = &rule.interface {
        args.extend(argv(["on", iface.as_str()]));
    }
    args.push("from".to_string());
    args.push(rule.source.to_string());
    args.push("to".to_string());
    args.push(rule.destination.to_string());

    match &rule.port {
        Some(PortSpec::App(name)) => {
            args.extend(argv(["app", name.as_str()]));
        }
        Some(port) => {
            args.extend(argv(["port".to_string(), port.to_string()]));
            if rule.protocol != Protocol::Any {
                args.extend(argv(["proto", rule.protocol.as_ref()]));
            }
        }
        None => {
            if rule.protocol != Protocol::Any {
                args.extend(argv(["proto", rule.protocol.as_ref()]));
            }
        }
    }

    if let Some(comment) = &rule.comment
        && !comment.is_empty()
    {
        args.extend(argv(["comment", comment.as_str()]));
    }
    args
}

/// Parses `ufw status verbose`.
///
/// # Errors
///
/// `ParseError` when the `Status:` line is missing.
pub fn parse_status(output: &str) -> Result<BackendStatus> {
    let mut status = None;
    let mut result = BackendStatus::default();

    for line in output.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("Status:") {
            status = Some(value.trim() == "active");
        } else if let Some(value) = line.strip_prefix("Logging:") {
            result.logging = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Default:") {
            for part in value.split(',') {
                let part = part.trim();
                let Some((policy, scope)) = part.split_once(' ') else {
                    continue;
                };
                let action = policy.parse::<Action>().ok();
                match scope.trim_matches(|c| c == '(' || c == ')') {
                    "incoming" => result.default_incoming = action,
                    "outgoing" => result.default_outgoing = action,
                    _ => {}
                }
            }
        }
    }

    result.enabled =
        status.ok_or_else(|| Error::parse("ufw", "missing 'Status:' line in ufw status output"))?;
    Ok(result)
}

/// Parses `ufw app list`: a header line, then one indented profile name per
/// line.
///
/// # Errors
///
/// `ParseError` when the `Available applications:` header is missing.
pub fn parse_app_list(output: &str) -> Result<Vec<String>> {
    let mut lines = output.lines();
    if !lines.any(|l| l.trim() == "Available applications:") {
        return Err(Error::parse("ufw", "missing 'Available applications:' header"));
    }
    Ok(lines
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect())
}

/// Parses `ufw status numbered`. An inactive firewall lists no rules.
///
/// # Errors
///
/// `ParseError` when the `Status:` line is missing.
pub fn parse_numbered(output: &str) -> Result<Vec<FirewallRule>> {
    let Some(status_line) = output.lines().find(|l| l.trim_start().starts_with("Status:")) else {
        return Err(Error::parse("ufw", "missing 'Status:' line in ufw status output"));
    };
    if status_line.contains("inactive") {
        return Ok(Vec::new());
    }

    let mut rules = Vec::new();
    for line in output.lines().map(str::trim_end) {
        if !line.trim_start().starts_with('[') {
            continue;
        }
        match parse_numbered_line(line) {
            Some(rule) => rules.push(rule),
            None => warn!(line, "Skipping unrecognized ufw rule line"),
        }
    }
    Ok(rules)
}

#[derive(Debug, Default)]
struct Endpoint {
    address: Address,
    port: Option<PortSpec>,
    protocol: Protocol,
    v6: bool,
    interface: Option<String>,
    multiport: Option<String>,
    has_address: bool,
}

fn parse_endpoint(text: &str) -> Option<Endpoint> {
    let mut endpoint = Endpoint::default();
    let mut tokens: Vec<&str> = Vec::new();
    let mut iter = text.split_whitespace().peekable();
    while let Some(tok) = iter.next() {
        match tok {
            "(v6)" => endpoint.v6 = true,
            "(out)" => {}
            "on" if iter.peek().is_some() => endpoint.interface = iter.next().map(str::to_string),
            _ => tokens.push(tok),
        }
    }
    let (first, rest) = tokens.split_first()?;

    // Leading address column: "Anywhere", "Anywhere/tcp", or an IP/CIDR
    let port_tokens: &[&str] = if let Some(suffix) = first.strip_prefix("Anywhere") {
        endpoint.has_address = true;
        if let Some(proto) = suffix.strip_prefix('/') {
            endpoint.protocol = proto.parse().ok()?;
        }
        rest
    } else if is_address_token(first) {
        endpoint.has_address = true;
        // A protocol-only rule to a host renders as `10.0.0.5/tcp`
        let address = match first.rsplit_once('/') {
            Some((addr, proto @ ("tcp" | "udp"))) => {
                endpoint.protocol = proto.parse().ok()?;
                addr
            }
            _ => first,
        };
        endpoint.address = address.parse().ok()?;
        rest
    } else {
        &tokens
    };

    if port_tokens.is_empty() {
        return Some(endpoint);
    }

    let spec = port_tokens.join(" ");
    let (port_part, proto) = match spec.rsplit_once('/') {
        Some((p, proto @ ("tcp" | "udp"))) => (p.to_string(), proto.parse().ok()?),
        _ => (spec.clone(), Protocol::Any),
    };
    endpoint.protocol = proto;
    if port_part.contains(',') {
        endpoint.multiport = Some(spec);
    } else {
        endpoint.port = Some(port_part.parse().ok()?);
    }
    Some(endpoint)
}

/// ufw prints bare ports and app names in the same column as addresses
fn is_address_token(token: &str) -> bool {
    let host = token.split_once('/').map_or(token, |(h, _)| h);
    host.parse::<std::net::IpAddr>().is_ok()
}

fn parse_numbered_line(line: &str) -> Option<FirewallRule> {
    let caps = NUMBERED_LINE.captures(line.trim())?;
    let number = caps.get(1)?.as_str();
    let to_text = caps.get(2)?.as_str();
    let action: Action = caps.get(3)?.as_str().parse().ok()?;
    let direction = match caps.get(4).map(|m| m.as_str()) {
        None | Some("IN") => Direction::In,
        Some("OUT") => Direction::Out,
        Some(_) => {
            warn!(line, "Skipping routed (FWD) ufw rule");
            return None;
        }
    };

    let (from_text, comment) = match caps.get(5)?.as_str().split_once('#') {
        Some((from, comment)) => (from, Some(comment.trim().to_string())),
        None => (caps.get(5)?.as_str(), None),
    };

    let to = parse_endpoint(to_text)?;
    let from = parse_endpoint(from_text)?;
    if from.multiport.is_some() || !from.has_address {
        return None;
    }

    let mut qualifiers = Vec::new();
    if let Some(ports) = &to.multiport {
        qualifiers.push(format!("ports {ports}"));
    }
    if let Some(port) = &from.port {
        qualifiers.push(format!("from port {port}"));
    }
    let protocol = if to.protocol == Protocol::Any {
        from.protocol
    } else {
        to.protocol
    };
    let v6 = to.v6 || from.v6;

    Some(FirewallRule {
        id: number.to_string(),
        action,
        direction,
        protocol,
        port: to.port,
        source: from.address,
        destination: to.address,
        interface: to.interface.or(from.interface),
        comment: comment.filter(|c| !c.is_empty()),
        ipv6_only: v6 && from.address.is_any() && to.address.is_any(),
        qualifiers,
    })
}
