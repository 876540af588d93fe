//! firewalld adapter
//!
//! Rules are read from `firewall-cmd --list-all-zones`, restricted to the
//! default zone, active zones and the configured zone. Plain allows map to
//! `ports` / `services`; anything with an address or a non-allow verdict goes
//! through a rich rule. Changes are made permanent and then reloaded.

use crate::command::argv;
use crate::core::backend::{FirewallBackend, NativeTool};
use crate::core::error::{Error, Result};
use crate::core::firewall::{
    Action, Address, BackendKind, BackendStatus, Direction, FirewallRule, IpFamily, NativeObjects,
    PortSpec, Protocol,
};
use async_trait::async_trait;
use tracing::{info, warn};

/// One zone block from `--list-all-zones`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Zone {
    pub name: String,
    pub default: bool,
    pub active: bool,
    pub target: Option<String>,
    pub services: Vec<String>,
    pub ports: Vec<String>,
    pub rich_rules: Vec<String>,
}

pub struct FirewalldBackend {
    tool: NativeTool,
    systemctl: NativeTool,
    zone: Option<String>,
}

impl FirewalldBackend {
    pub fn new(tool: NativeTool, systemctl: NativeTool, zone: Option<String>) -> Self {
        Self {
            tool,
            systemctl,
            zone,
        }
    }

    async fn zones(&self) -> Result<Vec<Zone>> {
        let out = self.tool.query(&["--list-all-zones"]).await?;
        parse_zones(&out)
    }

    /// Every zone firewalld defines, active or not
    pub async fn zone_names(&self) -> Result<Vec<String>> {
        Ok(split_names(&self.tool.query(&["--get-zones"]).await?))
    }

    /// Predefined and custom service names usable in rules
    pub async fn services(&self) -> Result<Vec<String>> {
        Ok(split_names(&self.tool.query(&["--get-services"]).await?))
    }

    async fn target_zone(&self) -> Result<String> {
        if let Some(zone) = &self.zone {
            return Ok(zone.clone());
        }
        let out = self.tool.query(&["--get-default-zone"]).await?;
        let zone = out.trim();
        if zone.is_empty() {
            return Err(Error::parse("firewall-cmd", "empty default zone"));
        }
        Ok(zone.to_string())
    }

    async fn apply(&self, args: Vec<String>) -> Result<()> {
        self.tool.run(&args).await?;
        self.tool.query(&["--reload"]).await?;
        Ok(())
    }
}

#[async_trait]
impl FirewallBackend for FirewalldBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Firewalld
    }

    async fn status(&self) -> Result<BackendStatus> {
        let state = self.tool.output(&argv(["--state"])).await?;
        if !state.success() || state.stdout.trim() != "running" {
            return Ok(BackendStatus::default());
        }

        let zones = self.zones().await?;
        let default_incoming = zones
            .iter()
            .find(|z| z.default)
            .and_then(|z| z.target.as_deref())
            .and_then(target_action);
        let logging = self
            .tool
            .query(&["--get-log-denied"])
            .await
            .ok()
            .map(|s| s.trim().to_string());

        Ok(BackendStatus {
            enabled: true,
            default_incoming,
            // Zones do not filter outbound traffic
            default_outgoing: Some(Action::Allow),
            logging,
        })
    }

    async fn list_rules(&self) -> Result<Vec<FirewallRule>> {
        let zones = self.zones().await?;
        Ok(rules_from_zones(&zones, self.zone.as_deref()))
    }

    async fn dispatch_add(&self, rule: &FirewallRule) -> Result<()> {
        if rule.comment.as_deref().is_some_and(|c| !c.is_empty()) {
            warn!("firewalld has no rule comments, dropping comment");
        }
        let zone = self.target_zone().await?;
        self.apply(add_args(&zone, rule)).await
    }

    async fn dispatch_delete(&self, rule: &FirewallRule) -> Result<()> {
        let args = remove_args(&rule.id).ok_or_else(|| Error::RuleNotFound {
            scope: BackendKind::Firewalld.to_string(),
            id: rule.id.clone(),
        })?;
        self.apply(args).await
    }

    async fn native_objects(&self) -> Result<NativeObjects> {
        let default_zone = self
            .tool
            .query(&["--get-default-zone"])
            .await?
            .trim()
            .to_string();
        Ok(NativeObjects::Zones {
            default_zone: (!default_zone.is_empty()).then_some(default_zone),
            zones: self.zone_names().await?,
            services: self.services().await?,
        })
    }

    async fn enable(&self) -> Result<()> {
        self.systemctl.query(&["start", "firewalld"]).await?;
        info!("Started firewalld");
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.systemctl.query(&["stop", "firewalld"]).await?;
        info!("Stopped firewalld");
        Ok(())
    }
}

fn target_action(target: &str) -> Option<Action> {
    match target {
        "default" | "REJECT" | "%%REJECT%%" => Some(Action::Reject),
        "DROP" => Some(Action::Deny),
        "ACCEPT" => Some(Action::Allow),
        _ => None,
    }
}

/// firewalld spells ranges with a dash
fn native_port(port: &PortSpec) -> String {
    match port {
        PortSpec::Range { start, end } => format!("{start}-{end}"),
        other => other.to_string(),
    }
}

/// How a rule is stored in a zone
#[derive(Debug, PartialEq, Eq)]
enum Element {
    Port(String),
    Service(String),
    Rich(String),
}

fn element_for(rule: &FirewallRule) -> Element {
    let plain = rule.action == Action::Allow && rule.is_addressless();
    match &rule.port {
        Some(PortSpec::App(name)) if plain => Element::Service(name.clone()),
        Some(port) if plain && rule.protocol.supports_ports() => {
            Element::Port(format!("{}/{}", native_port(port), rule.protocol))
        }
        _ => Element::Rich(rich_rule(rule)),
    }
}

/// Renders a rich rule in the element order firewalld lists them back.
pub fn rich_rule(rule: &FirewallRule) -> String {
    let mut parts = vec!["rule".to_string()];
    if let Some(family) = rule.address_family() {
        let family = match family {
            IpFamily::V4 => "ipv4",
            IpFamily::V6 => "ipv6",
        };
        parts.push(format!("family=\"{family}\""));
    }
    if let Address::Network(_) = rule.source {
        parts.push(format!("source address=\"{}\"", rule.source));
    }
    if let Address::Network(_) = rule.destination {
        parts.push(format!("destination address=\"{}\"", rule.destination));
    }
    match &rule.port {
        Some(PortSpec::App(name)) => parts.push(format!("service name=\"{name}\"")),
        Some(port) => parts.push(format!(
            "port port=\"{}\" protocol=\"{}\"",
            native_port(port),
            rule.protocol
        )),
        None if rule.protocol != Protocol::Any => {
            parts.push(format!("protocol value=\"{}\"", rule.protocol));
        }
        None => {}
    }
    parts.push(
        match rule.action {
            Action::Allow | Action::Limit => "accept",
            Action::Deny => "drop",
            Action::Reject => "reject",
        }
        .to_string(),
    );
    parts.join(" ")
}

pub fn add_args(zone: &str, rule: &FirewallRule) -> Vec<String> {
    let op = match element_for(rule) {
        Element::Port(p) => format!("--add-port={p}"),
        Element::Service(s) => format!("--add-service={s}"),
        Element::Rich(r) => format!("--add-rich-rule={r}"),
    };
    argv(["--permanent".to_string(), format!("--zone={zone}"), op])
}

/// Maps a listing id back to the matching `--remove-*` call
pub fn remove_args(id: &str) -> Option<Vec<String>> {
    let (zone, rest) = id.split_once(':')?;
    let (kind, value) = rest.split_once(':')?;
    let op = match kind {
        "port" => format!("--remove-port={value}"),
        "service" => format!("--remove-service={value}"),
        "rich" => format!("--remove-rich-rule={value}"),
        _ => return None,
    };
    Some(argv(["--permanent".to_string(), format!("--zone={zone}"), op]))
}

/// Parses the block-per-zone output of `firewall-cmd --list-all-zones`.
///
/// # Errors
///
/// `ParseError` when the output contains no zone header.
pub fn parse_zones(output: &str) -> Result<Vec<Zone>> {
    let mut zones: Vec<Zone> = Vec::new();
    let mut in_rich = false;

    for line in output.lines() {
        if line.trim().is_empty() {
            in_rich = false;
            continue;
        }
        if !line.starts_with([' ', '\t']) {
            zones.push(parse_header(line));
            in_rich = false;
            continue;
        }
        let Some(zone) = zones.last_mut() else {
            continue;
        };
        let trimmed = line.trim();

        if trimmed.starts_with("rule ") || trimmed == "rule" {
            if in_rich {
                zone.rich_rules.push(trimmed.to_string());
            }
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim();
        in_rich = key == "rich rules";
        let words = || value.split_whitespace().map(str::to_string).collect::<Vec<_>>();
        match key {
            "target" => zone.target = Some(value.to_string()),
            "services" => zone.services = words(),
            "ports" => zone.ports = words(),
            "rich rules" if !value.is_empty() => zone.rich_rules.push(value.to_string()),
            _ => {}
        }
    }

    if zones.is_empty() {
        return Err(Error::parse("firewall-cmd", "no zones in --list-all-zones output"));
    }
    Ok(zones)
}

fn parse_header(line: &str) -> Zone {
    let (name, flags) = match line.split_once('(') {
        Some((name, flags)) => (name.trim(), flags.trim_end_matches(')')),
        None => (line.trim(), ""),
    };
    Zone {
        name: name.to_string(),
        default: flags.split(',').any(|f| f.trim() == "default"),
        active: flags.split(',').any(|f| f.trim() == "active"),
        ..Zone::default()
    }
}

/// `--get-zones` and `--get-services` print one space-separated line.
fn split_names(output: &str) -> Vec<String> {
    output.split_whitespace().map(ToString::to_string).collect()
}

/// Flattens the relevant zones into rules: ports, then services, then rich rules.
pub fn rules_from_zones(zones: &[Zone], configured: Option<&str>) -> Vec<FirewallRule> {
    let mut rules = Vec::new();
    for zone in zones
        .iter()
        .filter(|z| z.default || z.active || Some(z.name.as_str()) == configured)
    {
        for port in &zone.ports {
            match parse_port_entry(port) {
                Some(rule) => rules.push(rule.with_id(format!("{}:port:{port}", zone.name))),
                None => warn!(zone = %zone.name, %port, "Skipping firewalld port entry"),
            }
        }
        for service in &zone.services {
            rules.push(
                FirewallRule::new(Action::Allow)
                    .with_port(PortSpec::App(service.clone()))
                    .with_id(format!("{}:service:{service}", zone.name)),
            );
        }
        for rich in &zone.rich_rules {
            match parse_rich_rule(rich) {
                Some(rule) => rules.push(rule.with_id(format!("{}:rich:{rich}", zone.name))),
                None => warn!(zone = %zone.name, rule = %rich, "Skipping firewalld rich rule"),
            }
        }
    }
    rules
}

fn parse_protocol(s: &str) -> Option<Protocol> {
    match s {
        "tcp" => Some(Protocol::Tcp),
        "udp" => Some(Protocol::Udp),
        _ => None,
    }
}

/// `8080/tcp` or `60000-61000/udp`
fn parse_port_entry(entry: &str) -> Option<FirewallRule> {
    let (port, proto) = entry.split_once('/')?;
    let protocol = parse_protocol(proto)?;
    let port = match port.parse::<PortSpec>().ok()? {
        PortSpec::App(_) => return None,
        p => p,
    };
    Some(
        FirewallRule::new(Action::Allow)
            .with_protocol(protocol)
            .with_port(port),
    )
}

/// Splits on whitespace outside double quotes
fn rich_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in text.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

/// Parses the subset of the rich rule language with a neutral meaning.
/// Returns `None` for rules outside it (forward-port, masquerade, ...).
pub fn parse_rich_rule(text: &str) -> Option<FirewallRule> {
    let tokens = rich_tokens(text);
    let mut iter = tokens.iter().peekable();
    if iter.next().map(String::as_str) != Some("rule") {
        return None;
    }

    let mut family = None;
    let mut rule = FirewallRule::new(Action::Allow);
    let mut action = None;

    while let Some(word) = iter.next() {
        // Element attributes follow their keyword as key="value" tokens
        let mut attrs = Vec::new();
        let mut negated = false;
        while let Some(next) = iter.peek() {
            if next.as_str() == "NOT" {
                negated = true;
                iter.next();
            } else if let Some((k, v)) = next.split_once('=') {
                attrs.push((k.to_string(), v.trim_matches('"').to_string()));
                iter.next();
            } else {
                break;
            }
        }

        if let Some((k, v)) = word.split_once('=') {
            if k == "family" {
                family = Some(v.trim_matches('"').to_string());
            }
            continue;
        }

        match word.as_str() {
            "source" => match attr(&attrs, "address") {
                Some(addr) if !negated => rule.source = addr.parse().ok()?,
                _ => rule.qualifiers.push(format!("source {}", text_of(negated, &attrs))),
            },
            "destination" => match attr(&attrs, "address") {
                Some(addr) if !negated => rule.destination = addr.parse().ok()?,
                _ => rule.qualifiers.push(format!("destination {}", text_of(negated, &attrs))),
            },
            "service" => rule.port = Some(PortSpec::App(attr(&attrs, "name")?.to_string())),
            "port" => {
                rule.protocol = parse_protocol(attr(&attrs, "protocol")?)?;
                rule.port = match attr(&attrs, "port")?.parse::<PortSpec>().ok()? {
                    PortSpec::App(_) => return None,
                    p => Some(p),
                };
            }
            "protocol" => rule.protocol = parse_protocol(attr(&attrs, "value")?)?,
            "log" | "audit" | "limit" | "nflog" => {
                rule.qualifiers.push(format!("{word} {}", text_of(false, &attrs)).trim().to_string());
            }
            "accept" => action = Some(Action::Allow),
            "drop" => action = Some(Action::Deny),
            "reject" => action = Some(Action::Reject),
            _ => return None,
        }
    }

    rule.action = action?;
    rule.direction = Direction::In;
    match family.as_deref() {
        Some("ipv6") if rule.is_addressless() => rule.ipv6_only = true,
        Some(f) if rule.is_addressless() => rule.qualifiers.insert(0, format!("family {f}")),
        _ => {}
    }
    Some(rule)
}

fn text_of(negated: bool, attrs: &[(String, String)]) -> String {
    let body = attrs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    if negated { format!("NOT {body}") } else { body }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONES: &str = "block
  target: %%REJECT%%
  icmp-block-inversion: no
  interfaces:
  services:
  ports:
  rich rules:

public (default, active)
  target: default
  icmp-block-inversion: no
  interfaces: eth0
  sources:
  services: dhcpv6-client ssh
  ports: 8080/tcp 60000-61000/udp 9000/sctp
  protocols:
  forward: yes
  masquerade: no
  forward-ports:
  source-ports:
  icmp-blocks:
  rich rules:
\trule family=\"ipv4\" source address=\"10.0.0.0/8\" port port=\"5432\" protocol=\"tcp\" accept
\trule family=\"ipv6\" service name=\"http\" drop
\trule family=\"ipv4\" forward-port port=\"80\" protocol=\"tcp\" to-port=\"8080\"

trusted
  target: ACCEPT
  services:
  ports: 1-65535/tcp
  rich rules:
";

    #[tokio::test]
    async fn test_zones_and_services() {
        use crate::core::test_helpers::FakeRunner;
        use std::time::Duration;

        let runner = FakeRunner::new().with_tool("firewall-cmd").into_arc();
        runner
            .ok("firewall-cmd --get-default-zone", "public\n")
            .ok("firewall-cmd --get-zones", "block dmz drop external home internal public trusted work\n")
            .ok("firewall-cmd --get-services", "dhcpv6-client http https ssh\n");
        let backend = FirewalldBackend::new(
            NativeTool::new(runner.clone(), "firewall-cmd", Duration::from_secs(5)),
            NativeTool::new(runner, "systemctl", Duration::from_secs(5)),
            None,
        );

        let NativeObjects::Zones {
            default_zone,
            zones,
            services,
        } = backend.native_objects().await.unwrap()
        else {
            panic!("expected zones");
        };
        assert_eq!(default_zone.as_deref(), Some("public"));
        assert_eq!(zones.len(), 9);
        assert!(zones.contains(&"dmz".to_string()));
        assert_eq!(services, ["dhcpv6-client", "http", "https", "ssh"]);
    }

    #[test]
    fn test_parse_zones() {
        let zones = parse_zones(ZONES).unwrap();
        assert_eq!(zones.len(), 3);
        let public = &zones[1];
        assert_eq!(public.name, "public");
        assert!(public.default && public.active);
        assert_eq!(public.services, vec!["dhcpv6-client", "ssh"]);
        assert_eq!(public.rich_rules.len(), 3);
        assert!(!zones[0].active);
    }

    #[test]
    fn test_rules_from_default_zone_only() {
        let zones = parse_zones(ZONES).unwrap();
        let rules = rules_from_zones(&zones, None);
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "public:port:8080/tcp",
                "public:port:60000-61000/udp",
                "public:service:dhcpv6-client",
                "public:service:ssh",
                "public:rich:rule family=\"ipv4\" source address=\"10.0.0.0/8\" port port=\"5432\" protocol=\"tcp\" accept",
                "public:rich:rule family=\"ipv6\" service name=\"http\" drop",
            ]
        );
        assert_eq!(rules[1].port, Some(PortSpec::Range { start: 60000, end: 61000 }));
        assert_eq!(rules[1].protocol, Protocol::Udp);

        let pg = &rules[4];
        assert_eq!(pg.source.to_string(), "10.0.0.0/8");
        assert_eq!(pg.port, Some(PortSpec::Single(5432)));
        assert!(pg.qualifiers.is_empty());

        let http6 = &rules[5];
        assert_eq!(http6.action, Action::Deny);
        assert!(http6.ipv6_only);

        let with_trusted = rules_from_zones(&zones, Some("trusted"));
        assert_eq!(with_trusted.len(), rules.len() + 1);
    }

    #[test]
    fn test_no_zones_is_parse_error() {
        assert!(parse_zones("").is_err());
    }

    #[test]
    fn test_add_args() {
        let port = FirewallRule::new(Action::Allow)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Single(8080));
        assert_eq!(
            add_args("public", &port),
            vec!["--permanent", "--zone=public", "--add-port=8080/tcp"]
        );

        let service = FirewallRule::new(Action::Allow).with_port(PortSpec::App("https".into()));
        assert_eq!(add_args("public", &service)[2], "--add-service=https");

        let rich = FirewallRule::new(Action::Reject)
            .with_protocol(Protocol::Udp)
            .with_port(PortSpec::Range { start: 5000, end: 5100 })
            .with_source("192.168.1.0/24".parse().unwrap());
        assert_eq!(
            add_args("internal", &rich)[2],
            "--add-rich-rule=rule family=\"ipv4\" source address=\"192.168.1.0/24\" port port=\"5000-5100\" protocol=\"udp\" reject"
        );
    }

    #[test]
    fn test_rich_rule_roundtrip() {
        let rule = FirewallRule::new(Action::Deny)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Single(22))
            .with_source("2001:db8::/32".parse().unwrap());
        let parsed = parse_rich_rule(&rich_rule(&rule)).unwrap();
        assert!(parsed.matches(&rule));
    }

    #[test]
    fn test_destination_goes_through_rich_rule() {
        let rule = FirewallRule::new(Action::Allow)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Single(443))
            .with_destination("192.168.1.10".parse().unwrap());
        assert_eq!(
            add_args("public", &rule)[2],
            "--add-rich-rule=rule family=\"ipv4\" destination address=\"192.168.1.10\" port port=\"443\" protocol=\"tcp\" accept"
        );
        let parsed = parse_rich_rule(&rich_rule(&rule)).unwrap();
        assert!(parsed.matches(&rule));
    }

    #[test]
    fn test_remove_args() {
        assert_eq!(
            remove_args("public:port:8080/tcp").unwrap(),
            vec!["--permanent", "--zone=public", "--remove-port=8080/tcp"]
        );
        assert_eq!(
            remove_args("public:rich:rule family=\"ipv4\" drop").unwrap()[2],
            "--remove-rich-rule=rule family=\"ipv4\" drop"
        );
        assert!(remove_args("public:masquerade:yes").is_none());
        assert!(remove_args("garbage").is_none());
    }

    #[test]
    fn test_negated_source_is_qualifier() {
        let rule = parse_rich_rule("rule family=\"ipv4\" source NOT address=\"10.0.0.0/8\" drop").unwrap();
        assert!(rule.source.is_any());
        assert_eq!(
            rule.qualifiers,
            vec!["family ipv4".to_string(), "source NOT address=10.0.0.0/8".to_string()]
        );
    }
}
