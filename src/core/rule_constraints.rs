//! Rule constraint functions for firewall rules
//!
//! This module centralizes which field combinations each backend can express.
//! Adapters call [`validate_rule`] before building any argv, so an
//! inexpressible rule fails with `InvalidRule` and no native command runs.
//!
//! # Examples
//!
//! ```
//! use unifw::core::firewall::{Action, BackendKind, FirewallRule, PortSpec, Protocol};
//! use unifw::core::rule_constraints::*;
//!
//! assert!(backend_supports_action(BackendKind::Ufw, Action::Limit));
//! assert!(!backend_supports_action(BackendKind::Iptables, Action::Limit));
//!
//! let rule = FirewallRule::new(Action::Allow).with_port(PortSpec::Single(22));
//! // iptables cannot match a port without a transport protocol
//! assert!(validate_rule(BackendKind::Iptables, &rule).is_err());
//! assert!(validate_rule(BackendKind::Ufw, &rule).is_ok());
//! ```

use super::error::{Error, Result};
use super::firewall::{Action, BackendKind, Direction, FirewallRule, IpFamily, PortSpec, Protocol};
use crate::validators;

// ═══════════════════════════════════════════════════════════════════════════
// Backend Capabilities
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the backend has a native verdict for `action`.
///
/// Only ufw has a built-in rate-limited allow.
pub fn backend_supports_action(kind: BackendKind, action: Action) -> bool {
    match action {
        Action::Limit => kind == BackendKind::Ufw,
        Action::Allow | Action::Deny | Action::Reject => true,
    }
}

/// Returns `true` if the backend resolves named application profiles
/// (ufw `app`, firewalld `service`).
pub fn backend_supports_app_profiles(kind: BackendKind) -> bool {
    matches!(kind, BackendKind::Ufw | BackendKind::Firewalld)
}

/// Returns `true` if the backend can target this direction.
///
/// firewalld zones only filter inbound traffic.
pub fn backend_supports_direction(kind: BackendKind, direction: Direction) -> bool {
    match direction {
        Direction::In => true,
        Direction::Out => kind != BackendKind::Firewalld,
    }
}

/// Returns `true` if a rule can be bound to one interface.
///
/// firewalld binds interfaces to zones, not to individual rules.
pub fn backend_supports_interface(kind: BackendKind) -> bool {
    kind != BackendKind::Firewalld
}

/// Returns `true` if a port may be given without naming tcp or udp.
///
/// ufw expands a bare port to both protocols. firewalld ports are always
/// `port/proto`, iptables and nftables need a transport match for `dport`.
pub fn backend_allows_portless_protocol(kind: BackendKind) -> bool {
    kind == BackendKind::Ufw
}

// ═══════════════════════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════════════════════

/// Validates the backend-independent fields of a rule.
///
/// # Errors
///
/// `InvalidRule` for port 0, reversed ranges, unsafe comments, odd profile
/// names, or rules with native-only fields.
pub fn validate_fields(rule: &FirewallRule) -> Result<()> {
    match &rule.port {
        Some(PortSpec::Single(p)) => {
            validators::validate_port(*p).map_err(Error::InvalidRule)?;
        }
        Some(PortSpec::Range { start, end }) => {
            validators::validate_port_range(*start, *end).map_err(Error::InvalidRule)?;
            if !rule.protocol.supports_ports() {
                return Err(Error::InvalidRule(
                    "Port ranges require protocol tcp or udp".to_string(),
                ));
            }
        }
        Some(PortSpec::App(name)) => {
            validators::validate_app_name(name).map_err(Error::InvalidRule)?;
            if rule.protocol != Protocol::Any {
                return Err(Error::InvalidRule(format!(
                    "Application profile '{name}' already defines its protocols; use protocol any"
                )));
            }
        }
        None => {}
    }

    if let Some(comment) = &rule.comment {
        validators::validate_comment(comment).map_err(Error::InvalidRule)?;
    }

    if let Some(iface) = &rule.interface {
        validators::validate_interface(iface).map_err(Error::InvalidRule)?;
    }

    if !rule.source.is_any()
        && !rule.destination.is_any()
        && rule.source.is_ipv6() != rule.destination.is_ipv6()
    {
        return Err(Error::InvalidRule(format!(
            "Source {} and destination {} are different IP families",
            rule.source, rule.destination
        )));
    }

    if !rule.qualifiers.is_empty() {
        return Err(Error::InvalidRule(format!(
            "Native qualifiers cannot be added through unifw: {}",
            rule.qualifiers.join(", ")
        )));
    }

    if rule.ipv6_only {
        return Err(Error::InvalidRule(
            "ipv6Only is read-only; give an IPv6 source instead".to_string(),
        ));
    }

    Ok(())
}

/// Validates a rule against everything `kind` can express.
///
/// # Errors
///
/// `InvalidRule` naming the first violated constraint.
pub fn validate_rule(kind: BackendKind, rule: &FirewallRule) -> Result<()> {
    validate_fields(rule)?;

    if !backend_supports_action(kind, rule.action) {
        return Err(Error::InvalidRule(format!(
            "{kind} has no '{}' action",
            rule.action
        )));
    }

    if !backend_supports_direction(kind, rule.direction) {
        return Err(Error::InvalidRule(format!(
            "{kind} only supports inbound rules"
        )));
    }

    if kind == BackendKind::Iptables && rule.address_family() == Some(IpFamily::V6) {
        return Err(Error::InvalidRule(
            "iptables manages IPv4 only; IPv6 addresses need ip6tables or nftables".to_string(),
        ));
    }

    if rule.interface.is_some() && !backend_supports_interface(kind) {
        return Err(Error::InvalidRule(format!(
            "{kind} binds interfaces to zones; assign the interface to a zone instead"
        )));
    }

    if let Some(port) = &rule.port {
        if port.is_app() && !backend_supports_app_profiles(kind) {
            return Err(Error::InvalidRule(format!(
                "{kind} does not support application profiles"
            )));
        }
        if !port.is_app() && !rule.protocol.supports_ports() && !backend_allows_portless_protocol(kind) {
            return Err(Error::InvalidRule(format!(
                "{kind} requires protocol tcp or udp when a port is given"
            )));
        }
    }

    Ok(())
}
