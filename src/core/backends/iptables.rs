//! iptables adapter (IPv4 filter table)
//!
//! Rules come from `iptables -S`, tokenized with logos so quoted comments
//! survive intact. Only `INPUT` and `OUTPUT` are surfaced. Ids are
//! `CHAIN:N` with `N` the 1-based position inside the chain, counting every
//! rule including the ones skipped here, so `-D CHAIN N` hits the right entry.

use crate::command::argv;
use crate::core::backend::{FirewallBackend, NativeTool};
use crate::core::error::{Error, Result};
use crate::core::firewall::{
    Action, Address, BackendKind, BackendStatus, Direction, FirewallRule, PortSpec, Protocol,
};
use async_trait::async_trait;
use logos::Logos;
use std::collections::HashMap;
use tracing::warn;

#[derive(Logos, Debug, Clone, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[regex(r#""([^"\\]|\\.)*""#, |lex| unquote(lex.slice()))]
    Quoted(String),

    #[regex(r#"[^ \t\r\n"]+"#, |lex| lex.slice().to_string())]
    Word(String),
}

fn unquote(raw: &str) -> String {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\'
            && let Some(next) = chars.next()
        {
            out.push(next);
        } else {
            out.push(c);
        }
    }
    out
}

fn tokenize(line: &str) -> Option<Vec<String>> {
    Token::lexer(line)
        .map(|t| match t {
            Ok(Token::Quoted(s) | Token::Word(s)) => Some(s),
            Err(()) => None,
        })
        .collect()
}

pub struct IptablesBackend {
    tool: NativeTool,
}

impl IptablesBackend {
    pub fn new(tool: NativeTool) -> Self {
        Self { tool }
    }

    async fn dump(&self) -> Result<String> {
        self.tool.query(&["-S"]).await
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Iptables
    }

    async fn status(&self) -> Result<BackendStatus> {
        parse_status(&self.dump().await?)
    }

    async fn list_rules(&self) -> Result<Vec<FirewallRule>> {
        parse_rules(&self.dump().await?)
    }

    async fn dispatch_add(&self, rule: &FirewallRule) -> Result<()> {
        self.tool.run(&add_args(rule)).await?;
        Ok(())
    }

    async fn dispatch_delete(&self, rule: &FirewallRule) -> Result<()> {
        let Some((chain, position)) = rule.id.split_once(':') else {
            return Err(Error::RuleNotFound {
                scope: BackendKind::Iptables.to_string(),
                id: rule.id.clone(),
            });
        };
        self.tool.run(&argv(["-D", chain, position])).await?;
        Ok(())
    }
}

fn chain_for(direction: Direction) -> &'static str {
    match direction {
        Direction::In => "INPUT",
        Direction::Out => "OUTPUT",
    }
}

fn target_for(action: Action) -> &'static str {
    match action {
        Action::Allow | Action::Limit => "ACCEPT",
        Action::Deny => "DROP",
        Action::Reject => "REJECT",
    }
}

/// `-i` matches the incoming interface, `-o` the outgoing one
fn interface_flag(direction: Direction) -> &'static str {
    match direction {
        Direction::In => "-i",
        Direction::Out => "-o",
    }
}

/// Builds `-A CHAIN [-i|-o IFACE] [-s SRC] [-d DST] [-p P [-m P --dport PORT]] [-m comment --comment C] -j TARGET`.
pub fn add_args(rule: &FirewallRule) -> Vec<String> {
    let mut args = argv(["-A", chain_for(rule.direction)]);
    if let Some(iface) = &rule.interface {
        args.extend(argv([interface_flag(rule.direction), iface.as_str()]));
    }
    if let Address::Network(net) = rule.source {
        args.extend(argv(["-s".to_string(), net.to_string()]));
    }
    if let Address::Network(net) = rule.destination {
        args.extend(argv(["-d".to_string(), net.to_string()]));
    }
    if rule.protocol != Protocol::Any {
        let proto = rule.protocol.as_ref();
        args.extend(argv(["-p", proto]));
        if let Some(port) = &rule.port {
            args.extend(argv(["-m", proto, "--dport"]));
            args.push(port.to_string());
        }
    }
    if let Some(comment) = &rule.comment
        && !comment.is_empty()
    {
        args.extend(argv(["-m", "comment", "--comment", comment.as_str()]));
    }
    args.extend(argv(["-j", target_for(rule.action)]));
    args
}

/// Reads chain policies and LOG targets from `iptables -S`.
///
/// # Errors
///
/// `ParseError` when neither `INPUT` nor `OUTPUT` has a policy line.
pub fn parse_status(dump: &str) -> Result<BackendStatus> {
    let mut status = BackendStatus::default();
    let mut seen = false;
    let mut logging = false;

    for line in dump.lines() {
        let Some(tokens) = tokenize(line) else { continue };
        match tokens.as_slice() {
            [p, chain, policy] if p == "-P" => {
                let action = match policy.as_str() {
                    "ACCEPT" => Some(Action::Allow),
                    "DROP" => Some(Action::Deny),
                    _ => None,
                };
                match chain.as_str() {
                    "INPUT" => {
                        status.default_incoming = action;
                        seen = true;
                    }
                    "OUTPUT" => {
                        status.default_outgoing = action;
                        seen = true;
                    }
                    _ => {}
                }
            }
            [a, ..] if a == "-A" => {
                if tokens.windows(2).any(|w| w[0] == "-j" && w[1] == "LOG") {
                    logging = true;
                }
            }
            _ => {}
        }
    }

    if !seen {
        return Err(Error::parse("iptables", "no INPUT/OUTPUT policy in iptables -S"));
    }
    // The filter table is always in effect once the module is loaded
    status.enabled = true;
    status.logging = Some(if logging { "on" } else { "off" }.to_string());
    Ok(status)
}

/// Parses `iptables -S` into neutral rules.
///
/// # Errors
///
/// `ParseError` when the dump carries no chain declarations at all.
pub fn parse_rules(dump: &str) -> Result<Vec<FirewallRule>> {
    if !dump.lines().any(|l| l.starts_with("-P ") || l.starts_with("-N ")) {
        return Err(Error::parse("iptables", "output has no chain declarations"));
    }

    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut rules = Vec::new();

    for line in dump.lines().map(str::trim) {
        if !line.starts_with("-A ") {
            continue;
        }
        let Some(tokens) = tokenize(line) else {
            warn!(line, "Skipping iptables line with unbalanced quotes");
            continue;
        };
        let Some(chain) = tokens.get(1) else { continue };
        let position = positions.entry(chain.clone()).or_insert(0);
        *position += 1;

        let direction = match chain.as_str() {
            "INPUT" => Direction::In,
            "OUTPUT" => Direction::Out,
            _ => continue,
        };

        match parse_spec(&tokens[2..], direction) {
            Ok(mut rule) => {
                rule.id = format!("{chain}:{position}");
                rules.push(rule);
            }
            Err(reason) => warn!(line, %reason, "Skipping iptables rule"),
        }
    }
    Ok(rules)
}

fn parse_spec(tokens: &[String], direction: Direction) -> std::result::Result<FirewallRule, String> {
    let mut action = None;
    let mut protocol = Protocol::Any;
    let mut port = None;
    let mut source = Address::Any;
    let mut destination = Address::Any;
    let mut interface = None;
    let mut comment = None;
    let mut qualifiers = Vec::new();
    let mut negate = false;

    let mut i = 0;
    let next = |i: usize| tokens.get(i + 1).map(String::as_str).ok_or("missing value");
    while i < tokens.len() {
        let tok = tokens[i].as_str();
        if tok == "!" {
            negate = true;
            i += 1;
            continue;
        }
        let prefix = if negate { "! " } else { "" };
        match tok {
            "-s" if !negate => {
                source = next(i)?.parse()?;
                i += 2;
            }
            "-d" if !negate => {
                destination = next(i)?.parse()?;
                i += 2;
            }
            flag @ ("-i" | "-o") if !negate && flag == interface_flag(direction) && interface.is_none() => {
                interface = Some(next(i)?.to_string());
                i += 2;
            }
            "-p" if !negate => {
                protocol = match next(i)? {
                    "tcp" => Protocol::Tcp,
                    "udp" => Protocol::Udp,
                    "all" => Protocol::Any,
                    other => return Err(format!("protocol {other}")),
                };
                i += 2;
            }
            "--dport" if !negate => {
                port = Some(next(i)?.parse::<PortSpec>()?);
                i += 2;
            }
            "-m" => {
                let module = next(i)?;
                if module == "comment" && tokens.get(i + 2).is_some_and(|t| t == "--comment") {
                    comment = tokens.get(i + 3).cloned();
                    i += 4;
                } else if module == "tcp" || module == "udp" {
                    i += 2;
                } else {
                    // Unknown match module: keep it with its options as one qualifier
                    let mut group = vec![format!("-m {module}")];
                    i += 2;
                    while i < tokens.len() && tokens[i].starts_with("--") && tokens[i] != "--dport" {
                        let mut part = tokens[i].clone();
                        i += 1;
                        while i < tokens.len() && !tokens[i].starts_with('-') && tokens[i] != "!" {
                            part.push(' ');
                            part.push_str(&tokens[i]);
                            i += 1;
                        }
                        group.push(part);
                    }
                    qualifiers.push(group.join(" "));
                }
            }
            "-j" => {
                action = Some(match next(i)? {
                    "ACCEPT" => Action::Allow,
                    "DROP" => Action::Deny,
                    "REJECT" => Action::Reject,
                    other => return Err(format!("target {other}")),
                });
                i += 2;
                // Target options (--reject-with ...) carry no neutral meaning
                while i < tokens.len() && tokens[i].starts_with("--") {
                    i += 2;
                }
            }
            "-d" | "-i" | "-o" | "-s" | "-p" | "--dport" | "--sport" => {
                qualifiers.push(format!("{prefix}{tok} {}", next(i)?));
                i += 2;
            }
            other => return Err(format!("option {other}")),
        }
        negate = false;
    }

    let action = action.ok_or("no jump target")?;
    Ok(FirewallRule {
        id: String::new(),
        action,
        direction,
        protocol,
        port,
        source,
        destination,
        interface,
        comment,
        ipv6_only: false,
        qualifiers,
    })
}
