//! unifw - one interface over the host firewall, routing and exposure
//!
//! Drives whichever of ufw, iptables, firewalld or nftables is installed
//! through a single rule shape, and reports routes, listening ports,
//! container publications and reverse-proxy hosts alongside it.
//!
//! # Architecture
//!
//! - [`core`] - Neutral rule model, backend adapters, probing and the mutation coordinator
//! - [`net`] - iproute2 and `ss` introspection, audited route and policy-rule changes
//! - [`integrations`] - Docker and Nginx Proxy Manager connectors
//! - [`service`] - Facade wiring configuration, runner and audit log
//! - [`audit`] - Append-only audit log of every mutation attempt
//! - [`command`] - Process runner with hard timeouts, argv only
//! - [`elevation`] - sudo / run0 / pkexec wrapping for privileged tools
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - No shell: every native command is an argv vector
//! - Every native call is bounded by a timeout that kills the child
//! - Mutations on one resource are serialized and never cancelled midway
//! - Every mutation attempt is audited, including forbidden ones

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod command;
pub mod config;
pub mod core;
pub mod elevation;
pub mod integrations;
pub mod net;
pub mod service;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::access::{Actor, Permission, Role};
pub use core::error::{Error, Result, StatusCode};
pub use core::firewall::{Action, Address, BackendKind, Direction, FirewallRule, PortSpec, Protocol};
pub use service::Unifw;
