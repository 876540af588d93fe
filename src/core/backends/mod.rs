//! Native adapters, one per [`BackendKind`]

pub mod firewalld;
pub mod iptables;
pub mod nftables;
pub mod ufw;

use super::backend::{FirewallBackend, NativeTool};
use super::firewall::BackendKind;
use crate::command::CommandRunner;
use std::sync::Arc;
use std::time::Duration;

pub use firewalld::FirewalldBackend;
pub use iptables::IptablesBackend;
pub use nftables::NftablesBackend;
pub use ufw::UfwBackend;

/// Settings the adapters read at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    pub timeout: Duration,
    pub nft_family: String,
    pub nft_table: String,
    /// `None` targets the default zone
    pub firewalld_zone: Option<String>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            nft_family: "inet".to_string(),
            nft_table: "filter".to_string(),
            firewalld_zone: None,
        }
    }
}

pub fn build_backend(
    kind: BackendKind,
    runner: Arc<dyn CommandRunner>,
    options: &BackendOptions,
) -> Arc<dyn FirewallBackend> {
    let tool = NativeTool::new(runner.clone(), kind.binary(), options.timeout);
    match kind {
        BackendKind::Ufw => Arc::new(UfwBackend::new(tool)),
        BackendKind::Iptables => Arc::new(IptablesBackend::new(tool)),
        BackendKind::Firewalld => Arc::new(FirewalldBackend::new(
            tool,
            NativeTool::new(runner, "systemctl", options.timeout),
            options.firewalld_zone.clone(),
        )),
        BackendKind::Nftables => Arc::new(NftablesBackend::new(
            tool,
            options.nft_family.clone(),
            options.nft_table.clone(),
        )),
    }
}
