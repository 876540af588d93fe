//! nftables adapter
//!
//! Reads `nft -j list ruleset` and surfaces rules of base chains hooked on
//! `input` / `output` in the ip, ip6 and inet families, ordered by hook then
//! chain priority. Writes target the configured family and table
//! (`inet filter` unless overridden). Ids are `family:table:chain:handle`.
//!
//! A rule read from a table whose family narrows the configured write family
//! carries that narrowing (`ipv6_only`, or a `family ip` qualifier); rules in
//! the write family itself read back neutral.

use crate::command::argv;
use crate::core::backend::{FirewallBackend, NativeTool};
use crate::core::error::{Error, Result};
use crate::core::firewall::{
    Action, Address, BackendKind, BackendStatus, Direction, FirewallRule, IpFamily, NativeChain,
    NativeObjects, PortSpec, Protocol,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NftChain {
    pub family: String,
    pub table: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub chain_type: Option<String>,
    #[serde(default)]
    pub hook: Option<String>,
    #[serde(default)]
    pub prio: i64,
    #[serde(default)]
    pub policy: Option<String>,
}

impl NftChain {
    fn direction(&self) -> Option<Direction> {
        if !matches!(self.family.as_str(), "ip" | "ip6" | "inet") {
            return None;
        }
        match self.hook.as_deref()? {
            "input" => Some(Direction::In),
            "output" => Some(Direction::Out),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NftTable {
    pub family: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NftRule {
    pub family: String,
    pub table: String,
    pub chain: String,
    pub handle: u64,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub expr: Vec<Value>,
}

/// Chains and rules from one ruleset dump
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    pub tables: Vec<NftTable>,
    pub chains: Vec<NftChain>,
    pub rules: Vec<NftRule>,
}

impl Ruleset {
    pub fn chain(&self, family: &str, table: &str, name: &str) -> Option<&NftChain> {
        self.chains
            .iter()
            .find(|c| c.family == family && c.table == table && c.name == name)
    }

    /// Base input/output chains in evaluation order
    fn base_chains(&self) -> Vec<&NftChain> {
        let mut chains: Vec<&NftChain> =
            self.chains.iter().filter(|c| c.direction().is_some()).collect();
        chains.sort_by_key(|c| (c.direction() != Some(Direction::In), c.prio));
        chains
    }
}

pub struct NftablesBackend {
    tool: NativeTool,
    family: String,
    table: String,
}

impl NftablesBackend {
    pub fn new(tool: NativeTool, family: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            tool,
            family: family.into(),
            table: table.into(),
        }
    }

    async fn ruleset(&self) -> Result<Ruleset> {
        let out = self.tool.query(&["-j", "list", "ruleset"]).await?;
        parse_ruleset(&out)
    }

    pub async fn tables(&self) -> Result<Vec<NftTable>> {
        Ok(self.ruleset().await?.tables)
    }

    /// Every chain of every table, base and regular
    pub async fn chains(&self) -> Result<Vec<NftChain>> {
        Ok(self.ruleset().await?.chains)
    }
}

#[async_trait]
impl FirewallBackend for NftablesBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Nftables
    }

    async fn status(&self) -> Result<BackendStatus> {
        Ok(status_from(&self.ruleset().await?, &self.family, &self.table))
    }

    async fn list_rules(&self) -> Result<Vec<FirewallRule>> {
        Ok(rules_from(&self.ruleset().await?, &self.family))
    }

    async fn native_objects(&self) -> Result<NativeObjects> {
        Ok(objects_from(&self.ruleset().await?))
    }

    async fn preflight(&self, rule: &FirewallRule) -> Result<()> {
        match (self.family.as_str(), rule.address_family()) {
            ("ip", Some(IpFamily::V6)) => {
                return Err(Error::InvalidRule(
                    "IPv6 address in an ip family table".to_string(),
                ));
            }
            ("ip6", Some(IpFamily::V4)) => {
                return Err(Error::InvalidRule(
                    "IPv4 address in an ip6 family table".to_string(),
                ));
            }
            _ => {}
        }

        let ruleset = self.ruleset().await?;
        let chain = chain_for(rule.direction);
        if ruleset.chain(&self.family, &self.table, chain).is_none() {
            return Err(Error::InvalidRule(format!(
                "chain '{chain}' does not exist in table {} {}",
                self.family, self.table
            )));
        }
        Ok(())
    }

    async fn dispatch_add(&self, rule: &FirewallRule) -> Result<()> {
        self.tool
            .run(&add_args(&self.family, &self.table, rule))
            .await?;
        Ok(())
    }

    async fn dispatch_delete(&self, rule: &FirewallRule) -> Result<()> {
        let args = delete_args(&rule.id).ok_or_else(|| Error::RuleNotFound {
            scope: BackendKind::Nftables.to_string(),
            id: rule.id.clone(),
        })?;
        self.tool.run(&args).await?;
        Ok(())
    }
}

fn chain_for(direction: Direction) -> &'static str {
    match direction {
        Direction::In => "input",
        Direction::Out => "output",
    }
}

fn native_port(port: &PortSpec) -> String {
    match port {
        PortSpec::Range { start, end } => format!("{start}-{end}"),
        other => other.to_string(),
    }
}

fn interface_key(direction: Direction) -> &'static str {
    match direction {
        Direction::In => "iifname",
        Direction::Out => "oifname",
    }
}

fn push_address(args: &mut Vec<String>, field: &str, address: Address) {
    if let Address::Network(net) = address {
        let selector = if net.is_ipv6() { "ip6" } else { "ip" };
        args.extend(argv([selector, field]));
        args.push(address.to_string());
    }
}

/// Builds `add rule FAMILY TABLE CHAIN [iifname|oifname "I"] [ip|ip6 saddr X] [ip|ip6 daddr Y] [tcp dport P | meta l4proto X] VERDICT [comment "C"]`.
pub fn add_args(family: &str, table: &str, rule: &FirewallRule) -> Vec<String> {
    let mut args = argv(["add", "rule", family, table, chain_for(rule.direction)]);

    if let Some(iface) = &rule.interface {
        args.push(interface_key(rule.direction).to_string());
        args.push(format!("\"{iface}\""));
    }
    push_address(&mut args, "saddr", rule.source);
    push_address(&mut args, "daddr", rule.destination);

    match (&rule.port, rule.protocol) {
        (Some(port), proto) if proto.supports_ports() => {
            args.extend(argv([proto.as_ref(), "dport"]));
            args.push(native_port(port));
        }
        (None, proto) if proto != Protocol::Any => {
            args.extend(argv(["meta", "l4proto", proto.as_ref()]));
        }
        _ => {}
    }

    args.push(
        match rule.action {
            Action::Allow | Action::Limit => "accept",
            Action::Deny => "drop",
            Action::Reject => "reject",
        }
        .to_string(),
    );

    if let Some(comment) = &rule.comment
        && !comment.is_empty()
    {
        // nft re-joins argv before parsing, so the quotes must survive as text
        args.push("comment".to_string());
        args.push(format!("\"{comment}\""));
    }
    args
}

/// `family:table:chain:handle` to `delete rule family table chain handle H`
pub fn delete_args(id: &str) -> Option<Vec<String>> {
    let mut parts = id.split(':');
    let (family, table, chain, handle) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || handle.parse::<u64>().is_err() {
        return None;
    }
    Some(argv(["delete", "rule", family, table, chain, "handle", handle]))
}

/// Splits the JSON dump into chains and rules.
///
/// # Errors
///
/// `ParseError` when the document is not JSON or lacks the `nftables` array.
pub fn parse_ruleset(json: &str) -> Result<Ruleset> {
    let doc: Value = serde_json::from_str(json)
        .map_err(|e| Error::parse("nft", format!("invalid JSON: {e}")))?;
    let items = doc
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::parse("nft", "missing nftables array"))?;

    let mut ruleset = Ruleset::default();
    for item in items {
        if let Some(table) = item.get("table") {
            match serde_json::from_value::<NftTable>(table.clone()) {
                Ok(t) => ruleset.tables.push(t),
                Err(e) => warn!(error = %e, "Skipping malformed nft table object"),
            }
        } else if let Some(chain) = item.get("chain") {
            match serde_json::from_value::<NftChain>(chain.clone()) {
                Ok(c) => ruleset.chains.push(c),
                Err(e) => warn!(error = %e, "Skipping malformed nft chain object"),
            }
        } else if let Some(rule) = item.get("rule") {
            match serde_json::from_value::<NftRule>(rule.clone()) {
                Ok(r) => ruleset.rules.push(r),
                Err(e) => warn!(error = %e, "Skipping malformed nft rule object"),
            }
        }
    }
    Ok(ruleset)
}

pub fn objects_from(ruleset: &Ruleset) -> NativeObjects {
    NativeObjects::Tables {
        tables: ruleset
            .tables
            .iter()
            .map(|t| format!("{} {}", t.family, t.name))
            .collect(),
        chains: ruleset
            .chains
            .iter()
            .map(|c| NativeChain {
                family: c.family.clone(),
                table: c.table.clone(),
                name: c.name.clone(),
                hook: c.hook.clone(),
                priority: c.hook.is_some().then_some(c.prio),
                policy: c.policy.clone(),
            })
            .collect(),
    }
}

pub fn status_from(ruleset: &Ruleset, family: &str, table: &str) -> BackendStatus {
    let policy = |name: &str| {
        ruleset
            .chain(family, table, name)
            .or_else(|| {
                ruleset
                    .base_chains()
                    .into_iter()
                    .find(|c| c.hook.as_deref() == Some(name))
            })
            .and_then(|c| c.policy.as_deref())
            .and_then(|p| match p {
                "accept" => Some(Action::Allow),
                "drop" => Some(Action::Deny),
                _ => None,
            })
    };
    let logging = ruleset
        .rules
        .iter()
        .any(|r| r.expr.iter().any(|e| e.get("log").is_some()));

    BackendStatus {
        enabled: !ruleset.base_chains().is_empty(),
        default_incoming: policy("input"),
        default_outgoing: policy("output"),
        logging: Some(if logging { "on" } else { "off" }.to_string()),
    }
}

/// Neutral rules of every base chain. `write_family` is the family new rules
/// are added to.
pub fn rules_from(ruleset: &Ruleset, write_family: &str) -> Vec<FirewallRule> {
    let mut out = Vec::new();
    for chain in ruleset.base_chains() {
        let Some(direction) = chain.direction() else {
            continue;
        };
        for raw in ruleset
            .rules
            .iter()
            .filter(|r| r.family == chain.family && r.table == chain.table && r.chain == chain.name)
        {
            let id = format!("{}:{}:{}:{}", raw.family, raw.table, raw.chain, raw.handle);
            match convert_rule(raw, direction, write_family) {
                Ok(mut rule) => {
                    rule.id = id;
                    out.push(rule);
                }
                Err(reason) => warn!(%id, %reason, "Skipping nft rule"),
            }
        }
    }
    out
}

fn convert_rule(
    raw: &NftRule,
    direction: Direction,
    write_family: &str,
) -> std::result::Result<FirewallRule, String> {
    let mut rule = FirewallRule::new(Action::Allow).with_direction(direction);
    let mut verdict = None;
    let narrowed = raw.family != write_family;
    let mut v6 = narrowed && raw.family == "ip6";

    for expr in &raw.expr {
        let Some((key, body)) = expr.as_object().and_then(|o| o.iter().next()) else {
            continue;
        };
        match key.as_str() {
            "match" => {
                if let Some(v6_match) = apply_match(&mut rule, body)? {
                    v6 = v6_match;
                }
            }
            "counter" => {}
            "accept" => verdict = Some(Action::Allow),
            "drop" => verdict = Some(Action::Deny),
            "reject" => verdict = Some(Action::Reject),
            "jump" | "goto" | "return" | "queue" => return Err(format!("{key} verdict")),
            // log, limit, quota and friends have no neutral field
            other => rule.qualifiers.push(format_fallback(other, body)),
        }
    }

    rule.action = verdict.ok_or("no verdict")?;
    rule.comment = raw.comment.clone();
    if rule.is_addressless() {
        rule.ipv6_only = v6;
        if narrowed && raw.family == "ip" {
            rule.qualifiers.insert(0, "family ip".to_string());
        }
    }
    Ok(rule)
}

/// Applies one `match` expression. Returns `Some(v6)` for an nfproto match.
fn apply_match(rule: &mut FirewallRule, body: &Value) -> std::result::Result<Option<bool>, String> {
    let op = body.get("op").and_then(Value::as_str).unwrap_or("==");
    let left = body.get("left").ok_or("match without left")?;
    let right = body.get("right").ok_or("match without right")?;
    let positive = op == "==" || op == "in";

    if let Some(payload) = left.get("payload") {
        let proto = payload.get("protocol").and_then(Value::as_str).unwrap_or_default();
        let field = payload.get("field").and_then(Value::as_str).unwrap_or_default();
        match (proto, field) {
            ("tcp" | "udp", "dport") if positive => {
                if let Some(port) = port_of(right) {
                    rule.protocol = proto.parse().map_err(|_| "protocol")?;
                    rule.port = Some(port);
                    return Ok(None);
                }
            }
            ("ip" | "ip6", "saddr") if positive && rule.source.is_any() => {
                if let Some(addr) = address_of(right) {
                    rule.source = addr.parse()?;
                    return Ok(None);
                }
            }
            ("ip" | "ip6", "daddr") if positive && rule.destination.is_any() => {
                if let Some(addr) = address_of(right) {
                    rule.destination = addr.parse()?;
                    return Ok(None);
                }
            }
            _ => {}
        }
        rule.qualifiers
            .push(format!("{proto} {field} {op} {}", render_value(right)));
        return Ok(None);
    }

    if let Some(meta) = left.get("meta").and_then(|m| m.get("key")).and_then(Value::as_str) {
        match (meta, right.as_str()) {
            ("l4proto", Some(p @ ("tcp" | "udp"))) if positive => {
                rule.protocol = p.parse().map_err(|_| "protocol")?;
                return Ok(None);
            }
            ("nfproto", Some("ipv6")) if positive => return Ok(Some(true)),
            (key, Some(iface))
                if op == "==" && key == interface_key(rule.direction) && rule.interface.is_none() =>
            {
                rule.interface = Some(iface.to_string());
                return Ok(None);
            }
            _ => {}
        }
        rule.qualifiers
            .push(format!("{meta} {op} {}", render_value(right)));
        return Ok(None);
    }

    if let Some(ct) = left.get("ct").and_then(|c| c.get("key")).and_then(Value::as_str) {
        rule.qualifiers
            .push(format!("ct {ct} {op} {}", render_value(right)));
        return Ok(None);
    }

    rule.qualifiers.push(format!(
        "{} {op} {}",
        render_value(left),
        render_value(right)
    ));
    Ok(None)
}

fn port_of(v: &Value) -> Option<PortSpec> {
    if let Some(n) = v.as_u64() {
        return u16::try_from(n).ok().map(PortSpec::Single);
    }
    let range = v.get("range")?.as_array()?;
    let start = u16::try_from(range.first()?.as_u64()?).ok()?;
    let end = u16::try_from(range.get(1)?.as_u64()?).ok()?;
    Some(PortSpec::Range { start, end })
}

fn address_of(v: &Value) -> Option<String> {
    if let Some(s) = v.as_str() {
        return Some(s.to_string());
    }
    let prefix = v.get("prefix")?;
    Some(format!(
        "{}/{}",
        prefix.get("addr")?.as_str()?,
        prefix.get("len")?.as_u64()?
    ))
}

fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().map(render_value).collect::<Vec<_>>().join(","),
        Value::Object(o) => {
            if let Some(set) = o.get("set").and_then(Value::as_array) {
                return format!("{{{}}}", set.iter().map(render_value).collect::<Vec<_>>().join(","));
            }
            if let Some(range) = o.get("range").and_then(Value::as_array) {
                return range.iter().map(render_value).collect::<Vec<_>>().join("-");
            }
            if let Some(addr) = address_of(v) {
                return addr;
            }
            v.to_string()
        }
        other => other.to_string(),
    }
}

fn format_fallback(key: &str, body: &Value) -> String {
    match body {
        Value::Null => key.to_string(),
        Value::Object(o) if o.is_empty() => key.to_string(),
        other => format!("{key} {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULESET: &str = r#"{"nftables": [
  {"metainfo": {"version": "1.0.9", "release_name": "Old Doc Yak #3", "json_schema_version": 1}},
  {"table": {"family": "inet", "name": "filter", "handle": 1}},
  {"chain": {"family": "inet", "table": "filter", "name": "output", "handle": 2, "type": "filter", "hook": "output", "prio": 0, "policy": "accept"}},
  {"chain": {"family": "inet", "table": "filter", "name": "input", "handle": 1, "type": "filter", "hook": "input", "prio": 0, "policy": "drop"}},
  {"chain": {"family": "inet", "table": "filter", "name": "forward", "handle": 3, "type": "filter", "hook": "forward", "prio": 0, "policy": "drop"}},
  {"chain": {"family": "inet", "table": "filter", "name": "services", "handle": 9}},
  {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 4, "expr": [
    {"match": {"op": "in", "left": {"ct": {"key": "state"}}, "right": ["established", "related"]}},
    {"accept": null}]}},
  {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 5, "comment": "ssh", "expr": [
    {"match": {"op": "==", "left": {"payload": {"protocol": "tcp", "field": "dport"}}, "right": 22}},
    {"counter": {"packets": 10, "bytes": 600}},
    {"accept": null}]}},
  {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 6, "expr": [
    {"match": {"op": "==", "left": {"payload": {"protocol": "ip", "field": "saddr"}}, "right": {"prefix": {"addr": "10.0.0.0", "len": 8}}}},
    {"match": {"op": "==", "left": {"payload": {"protocol": "udp", "field": "dport"}}, "right": {"range": [60000, 61000]}}},
    {"drop": null}]}},
  {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 7, "expr": [
    {"jump": {"target": "services"}}]}},
  {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 8, "expr": [
    {"match": {"op": "==", "left": {"meta": {"key": "nfproto"}}, "right": "ipv6"}},
    {"match": {"op": "==", "left": {"meta": {"key": "l4proto"}}, "right": "tcp"}},
    {"reject": null}]}},
  {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 10, "expr": [
    {"match": {"op": "==", "left": {"payload": {"protocol": "tcp", "field": "dport"}}, "right": {"set": [80, 443]}}},
    {"accept": null}]}},
  {"rule": {"family": "inet", "table": "filter", "chain": "output", "handle": 11, "expr": [
    {"match": {"op": "==", "left": {"meta": {"key": "oifname"}}, "right": "wg0"}},
    {"log": {"prefix": "wg out "}},
    {"drop": null}]}},
  {"rule": {"family": "inet", "table": "filter", "chain": "forward", "handle": 12, "expr": [{"accept": null}]}},
  {"rule": {"family": "inet", "table": "filter", "chain": "services", "handle": 13, "expr": [{"accept": null}]}}
]}"#;

    #[test]
    fn test_rules_from_ruleset() {
        let rules = rules_from(&parse_ruleset(RULESET).unwrap(), "inet");
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        // input chain (hook order) before output; jump and non-base chains skipped
        assert_eq!(
            ids,
            vec![
                "inet:filter:input:4",
                "inet:filter:input:5",
                "inet:filter:input:6",
                "inet:filter:input:8",
                "inet:filter:input:10",
                "inet:filter:output:11",
            ]
        );

        assert_eq!(rules[0].qualifiers, vec!["ct state in established,related".to_string()]);

        let ssh = &rules[1];
        assert_eq!(ssh.protocol, Protocol::Tcp);
        assert_eq!(ssh.port, Some(PortSpec::Single(22)));
        assert_eq!(ssh.comment.as_deref(), Some("ssh"));
        assert!(ssh.qualifiers.is_empty());

        let range = &rules[2];
        assert_eq!(range.action, Action::Deny);
        assert_eq!(range.source.to_string(), "10.0.0.0/8");
        assert_eq!(range.port, Some(PortSpec::Range { start: 60000, end: 61000 }));

        let v6 = &rules[3];
        assert!(v6.ipv6_only);
        assert_eq!(v6.protocol, Protocol::Tcp);
        assert_eq!(v6.action, Action::Reject);

        assert_eq!(rules[4].port, None);
        assert_eq!(rules[4].qualifiers, vec!["tcp dport == {80,443}".to_string()]);

        let out = &rules[5];
        assert_eq!(out.direction, Direction::Out);
        assert_eq!(out.interface.as_deref(), Some("wg0"));
        assert_eq!(out.qualifiers.len(), 1);
    }

    #[test]
    fn test_status_from_ruleset() {
        let status = status_from(&parse_ruleset(RULESET).unwrap(), "inet", "filter");
        assert!(status.enabled);
        assert_eq!(status.default_incoming, Some(Action::Deny));
        assert_eq!(status.default_outgoing, Some(Action::Allow));
        assert_eq!(status.logging.as_deref(), Some("on"));

        let empty = status_from(&parse_ruleset(r#"{"nftables": []}"#).unwrap(), "inet", "filter");
        assert!(!empty.enabled);
    }

    #[test]
    fn test_tables_and_chains() {
        let ruleset = parse_ruleset(RULESET).unwrap();
        assert_eq!(
            ruleset.tables,
            [NftTable {
                family: "inet".to_string(),
                name: "filter".to_string()
            }]
        );
        let NativeObjects::Tables { tables, chains } = objects_from(&ruleset) else {
            panic!("expected tables");
        };
        assert_eq!(tables, ["inet filter"]);
        assert_eq!(chains.len(), 4);
        let input = chains.iter().find(|c| c.name == "input").unwrap();
        assert_eq!(input.hook.as_deref(), Some("input"));
        assert_eq!(input.priority, Some(0));
        assert_eq!(input.policy.as_deref(), Some("drop"));
        let services = chains.iter().find(|c| c.name == "services").unwrap();
        assert_eq!(services.hook, None);
        assert_eq!(services.priority, None);
    }

    #[tokio::test]
    async fn test_native_objects_through_runner() {
        use crate::core::test_helpers::FakeRunner;
        use std::time::Duration;

        let runner = FakeRunner::new().with_tool("nft").into_arc();
        runner.ok("nft -j list ruleset", RULESET);
        let backend = NftablesBackend::new(NativeTool::new(runner.clone(), "nft", Duration::from_secs(5)), "inet", "filter");
        assert_eq!(backend.tables().await.unwrap().len(), 1);
        assert_eq!(backend.chains().await.unwrap().len(), 4);
        assert!(matches!(backend.native_objects().await.unwrap(), NativeObjects::Tables { .. }));
        assert_eq!(runner.count("nft -j list ruleset"), 3);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_ruleset("not json"), Err(Error::ParseError { .. })));
        assert!(matches!(parse_ruleset(r#"{"tables": []}"#), Err(Error::ParseError { .. })));
    }

    #[test]
    fn test_add_args() {
        let rule = FirewallRule::new(Action::Allow)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Range { start: 8000, end: 8080 })
            .with_source("192.168.0.0/16".parse().unwrap())
            .with_comment("dev servers");
        assert_eq!(
            add_args("inet", "filter", &rule),
            vec![
                "add", "rule", "inet", "filter", "input", "ip", "saddr", "192.168.0.0/16",
                "tcp", "dport", "8000-8080", "accept", "comment", "\"dev servers\""
            ]
        );

        let v6 = FirewallRule::new(Action::Deny)
            .with_direction(Direction::Out)
            .with_protocol(Protocol::Udp)
            .with_source("2001:db8::1".parse().unwrap());
        assert_eq!(
            add_args("inet", "filter", &v6).join(" "),
            "add rule inet filter output ip6 saddr 2001:db8::1 meta l4proto udp drop"
        );

        let scoped = FirewallRule::new(Action::Deny)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Single(3306))
            .with_interface("eth1")
            .with_destination("192.168.1.10".parse().unwrap());
        assert_eq!(
            add_args("inet", "filter", &scoped).join(" "),
            "add rule inet filter input iifname \"eth1\" ip daddr 192.168.1.10 tcp dport 3306 drop"
        );
    }

    #[test]
    fn test_scoped_rule_parses_back() {
        let json = r#"{"nftables": [
  {"chain": {"family": "inet", "table": "filter", "name": "input", "handle": 1, "type": "filter", "hook": "input", "prio": 0, "policy": "drop"}},
  {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 2, "expr": [
    {"match": {"op": "==", "left": {"meta": {"key": "iifname"}}, "right": "eth1"}},
    {"match": {"op": "==", "left": {"payload": {"protocol": "ip", "field": "daddr"}}, "right": "192.168.1.10"}},
    {"match": {"op": "==", "left": {"payload": {"protocol": "tcp", "field": "dport"}}, "right": 3306}},
    {"drop": null}]}}
]}"#;
        let rules = rules_from(&parse_ruleset(json).unwrap(), "inet");
        let wanted = FirewallRule::new(Action::Deny)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Single(3306))
            .with_interface("eth1")
            .with_destination("192.168.1.10".parse().unwrap());
        assert!(rules[0].matches(&wanted));
    }

    fn single_family(family: &str, rules: &str) -> String {
        format!(
            r#"{{"nftables": [
  {{"table": {{"family": "{family}", "name": "filter", "handle": 1}}}},
  {{"chain": {{"family": "{family}", "table": "filter", "name": "input", "handle": 1, "type": "filter", "hook": "input", "prio": 0, "policy": "drop"}}}}{rules}
]}}"#
        )
    }

    fn ssh_rule_json(family: &str) -> String {
        format!(
            r#",
  {{"rule": {{"family": "{family}", "table": "filter", "chain": "input", "handle": 4, "expr": [
    {{"match": {{"op": "==", "left": {{"payload": {{"protocol": "tcp", "field": "dport"}}}}, "right": 22}}}},
    {{"accept": null}}]}}}}"#
        )
    }

    #[test]
    fn test_narrower_family_is_tagged() {
        let ip = parse_ruleset(&single_family("ip", &ssh_rule_json("ip"))).unwrap();
        assert_eq!(rules_from(&ip, "inet")[0].qualifiers, vec!["family ip".to_string()]);
        assert!(rules_from(&ip, "ip")[0].qualifiers.is_empty());

        let ip6 = parse_ruleset(&single_family("ip6", &ssh_rule_json("ip6"))).unwrap();
        assert!(rules_from(&ip6, "inet")[0].ipv6_only);
        assert!(!rules_from(&ip6, "ip6")[0].ipv6_only);
    }

    async fn add_through_runner(family: &str) {
        use crate::core::test_helpers::FakeRunner;
        use std::time::Duration;

        let runner = FakeRunner::new().with_tool("nft").into_arc();
        let before = single_family(family, "");
        let after = single_family(family, &ssh_rule_json(family));
        runner
            .ok("nft -j list ruleset", &before)
            .ok("nft -j list ruleset", &before)
            .ok("nft -j list ruleset", &after);
        let add = format!("nft add rule {family} filter input tcp dport 22 accept");
        runner.ok(&add, "");

        let backend = NftablesBackend::new(
            NativeTool::new(runner.clone(), "nft", Duration::from_secs(5)),
            family,
            "filter",
        );
        let wanted = FirewallRule::new(Action::Allow)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Single(22));

        let added = backend.add_rule(&wanted).await.unwrap();
        assert_eq!(added.id, format!("{family}:filter:input:4"));
        assert!(added.matches(&wanted));

        // a second add finds the rule instead of duplicating it
        let again = backend.add_rule(&wanted).await.unwrap();
        assert_eq!(again.id, added.id);
        assert_eq!(runner.count(&add), 1);
    }

    #[tokio::test]
    async fn test_add_rule_in_ip_table() {
        add_through_runner("ip").await;
    }

    #[tokio::test]
    async fn test_add_rule_in_ip6_table() {
        add_through_runner("ip6").await;
    }

    #[test]
    fn test_delete_args() {
        assert_eq!(
            delete_args("inet:filter:input:5").unwrap().join(" "),
            "delete rule inet filter input handle 5"
        );
        assert!(delete_args("inet:filter:input").is_none());
        assert!(delete_args("inet:filter:input:x").is_none());
    }
}
