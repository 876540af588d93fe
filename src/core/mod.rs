//! Core firewall management functionality
//!
//! This module contains the backend-neutral rule model and everything needed
//! to drive the native firewall tools through it:
//!
//! - [`firewall`]: Rules, backends, detection and status types
//! - [`backend`]: The adapter contract and shared add/delete sequencing
//! - [`backends`]: ufw, iptables, firewalld and nftables adapters
//! - [`probe`]: Backend detection and preference
//! - [`coordinator`]: Per-resource write locks, retry and auditing
//! - [`manager`]: Backend resolution and the public firewall operations
//! - [`access`]: Actors, roles and permissions
//! - [`error`]: Error types and native failure classification
//! - [`rule_constraints`]: Business rules for valid field combinations

pub mod access;
pub mod backend;
pub mod backends;
pub mod coordinator;
pub mod error;
pub mod firewall;
pub mod manager;
pub mod probe;
pub mod rule_constraints;

#[cfg(test)]
pub mod test_helpers;
