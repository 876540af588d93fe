//! Parsers for iproute2 JSON output (`ip -j ...`)
//!
//! Each listing is a JSON array of objects. An entry that does not fit the
//! expected shape is skipped with a warning; only output that is not a
//! JSON array at all is an error.

use super::model::{ArpEntry, InterfaceAddress, IpPolicyRule, MAIN_TABLE, NetworkInterface, Route};
use crate::core::error::{Error, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::net::IpAddr;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct RawLink {
    ifname: String,
    ifindex: Option<u32>,
    operstate: Option<String>,
    mtu: Option<u32>,
    address: Option<String>,
    link_type: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    addr_info: Vec<RawAddr>,
}

#[derive(Debug, Deserialize)]
struct RawAddr {
    local: Option<String>,
    prefixlen: Option<u8>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    dst: Option<String>,
    gateway: Option<String>,
    dev: Option<String>,
    metric: Option<u32>,
    scope: Option<String>,
    protocol: Option<String>,
    table: Option<String>,
    #[serde(rename = "type")]
    route_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    priority: u32,
    src: Option<String>,
    srclen: Option<u8>,
    dst: Option<String>,
    dstlen: Option<u8>,
    fwmark: Option<String>,
    table: Option<String>,
    action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNeigh {
    dst: String,
    dev: Option<String>,
    lladdr: Option<String>,
    #[serde(default)]
    state: Vec<String>,
}

/// Deserializes each array element, skipping the ones that do not fit.
fn entries<T: DeserializeOwned>(json: &str, what: &str) -> Result<Vec<T>> {
    // `ip -j` prints nothing at all for an empty listing on some versions
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(json).map_err(|e| Error::parse("ip", e.to_string()))?;
    let Value::Array(items) = value else {
        return Err(Error::parse("ip", format!("{what} listing is not a JSON array")));
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<T>(item.clone()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(kind = what, error = %e, entry = %item, "Skipping unrecognized ip entry");
                None
            }
        })
        .collect())
}

/// Parses `ip -j addr show`.
///
/// # Errors
///
/// `ParseError` when the output is not a JSON array.
pub fn parse_addr(json: &str) -> Result<Vec<NetworkInterface>> {
    Ok(entries::<RawLink>(json, "addr")?
        .into_iter()
        .map(|link| {
            let addresses = link
                .addr_info
                .into_iter()
                .filter_map(|a| {
                    let address = a.local?.parse::<IpAddr>().ok()?;
                    let max = if address.is_ipv4() { 32 } else { 128 };
                    Some(InterfaceAddress {
                        address,
                        prefix_len: a.prefixlen.unwrap_or(max),
                        scope: a.scope,
                    })
                })
                .collect();
            NetworkInterface {
                is_loopback: link.link_type.as_deref() == Some("loopback")
                    || link.flags.iter().any(|f| f == "LOOPBACK"),
                name: link.ifname,
                index: link.ifindex,
                state: link.operstate.unwrap_or_else(|| "UNKNOWN".to_string()),
                mtu: link.mtu,
                mac: link.address.filter(|m| !m.is_empty()),
                addresses,
            }
        })
        .collect())
}

/// Parses `ip -j route show table all`. Routes without a `table` field
/// belong to `main`.
///
/// # Errors
///
/// `ParseError` when the output is not a JSON array.
pub fn parse_routes(json: &str) -> Result<Vec<Route>> {
    Ok(entries::<RawRoute>(json, "route")?
        .into_iter()
        .map(|r| Route {
            destination: r.dst.unwrap_or_else(|| "default".to_string()),
            gateway: r.gateway,
            interface: r.dev,
            metric: r.metric,
            scope: r.scope,
            protocol: r.protocol,
            table: Some(r.table.unwrap_or_else(|| MAIN_TABLE.to_string())),
            route_type: Some(r.route_type.unwrap_or_else(|| "unicast".to_string())),
        })
        .collect())
}

/// `src` + `srclen` as one selector; `all` means no selector
fn selector(addr: Option<String>, len: Option<u8>) -> Option<String> {
    match (addr, len) {
        (Some(a), _) if a == "all" => None,
        (Some(a), Some(len)) => Some(format!("{a}/{len}")),
        (a, None) => a,
        (None, Some(_)) => None,
    }
}

/// Parses `ip -j rule show`.
///
/// # Errors
///
/// `ParseError` when the output is not a JSON array.
pub fn parse_rules(json: &str) -> Result<Vec<IpPolicyRule>> {
    Ok(entries::<RawRule>(json, "rule")?
        .into_iter()
        .map(|r| IpPolicyRule {
            priority: r.priority,
            source: selector(r.src, r.srclen),
            destination: selector(r.dst, r.dstlen),
            firewall_mark: r.fwmark,
            action: r.action.or_else(|| r.table.as_ref().map(|_| "lookup".to_string())),
            table: r.table,
        })
        .collect())
}

/// Parses `ip -j neigh show`.
///
/// # Errors
///
/// `ParseError` when the output is not a JSON array.
pub fn parse_neigh(json: &str) -> Result<Vec<ArpEntry>> {
    Ok(entries::<RawNeigh>(json, "neigh")?
        .into_iter()
        .map(|n| ArpEntry {
            ip: n.dst,
            mac: n.lladdr,
            interface: n.dev,
            state: n.state,
        })
        .collect())
}
