//! Backend detection
//!
//! A backend is available when its binary is on PATH, its version query
//! succeeds with a recognizable version string, and (firewalld only) the
//! daemon reports `running`. Results are cached until [`BackendProbe::refresh`].

use super::backend::FirewallBackend;
use super::firewall::{BackendInfo, BackendKind, Detection};
use crate::command::{CommandRunner, argv};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

static UFW_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^ufw\s+(\S+)").expect("ufw version pattern is valid"));
static FIREWALLD_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(\d[\d.]*)").expect("firewalld version pattern is valid")
});
static NFT_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"nftables\s+v(\S+)").expect("nft version pattern is valid"));
static IPTABLES_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"iptables\s+v(\S+)").expect("iptables version pattern is valid")
});

/// Extracts the version from a tool's version output
pub fn parse_version(kind: BackendKind, output: &str) -> Option<String> {
    let pattern = match kind {
        BackendKind::Ufw => &UFW_VERSION,
        BackendKind::Firewalld => &FIREWALLD_VERSION,
        BackendKind::Nftables => &NFT_VERSION,
        BackendKind::Iptables => &IPTABLES_VERSION,
    };
    pattern
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub struct BackendProbe {
    runner: Arc<dyn CommandRunner>,
    backends: Vec<Arc<dyn FirewallBackend>>,
    timeout: Duration,
    cache: RwLock<Option<Detection>>,
}

impl BackendProbe {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        backends: Vec<Arc<dyn FirewallBackend>>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            backends,
            timeout,
            cache: RwLock::new(None),
        }
    }

    /// Cached detection, probing on first use
    pub async fn detect(&self) -> Detection {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return cached.clone();
        }
        self.refresh().await
    }

    /// Re-probes every backend and replaces the cache
    pub async fn refresh(&self) -> Detection {
        let mut set = JoinSet::new();
        for backend in &self.backends {
            let backend = backend.clone();
            let runner = self.runner.clone();
            let timeout = self.timeout;
            set.spawn(async move { probe_one(runner.as_ref(), backend.as_ref(), timeout).await });
        }

        let mut infos = Vec::with_capacity(self.backends.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(info) => infos.push(info),
                Err(e) => warn!(error = %e, "Backend probe task failed"),
            }
        }

        let detection = Detection::from_infos(infos);
        info!(
            available = ?detection.available(),
            preferred = ?detection.preferred,
            "Detected firewall backends"
        );
        *self.cache.write().await = Some(detection.clone());
        detection
    }
}

async fn probe_one(
    runner: &dyn CommandRunner,
    backend: &dyn FirewallBackend,
    timeout: Duration,
) -> BackendInfo {
    let kind = backend.kind();
    let binary = kind.binary();

    if runner.locate(binary).is_none() {
        debug!(backend = %kind, "Binary not on PATH");
        return BackendInfo::unavailable(kind, format!("{binary} not found in PATH"));
    }

    let version = match runner.run(binary, &argv(kind.version_args().iter().copied()), timeout).await {
        Ok(out) if out.success() => {
            let Some(version) = parse_version(kind, &out.stdout) else {
                return BackendInfo::unavailable(
                    kind,
                    format!("unrecognized version output: {}", out.stdout.trim()),
                );
            };
            version
        }
        Ok(out) => return BackendInfo::unavailable(kind, out.failure_message().to_string()),
        Err(e) => return BackendInfo::unavailable(kind, e.to_string()),
    };

    if kind == BackendKind::Firewalld {
        match runner.run(binary, &argv(["--state"]), timeout).await {
            Ok(out) if out.stdout.trim() == "running" => {}
            Ok(_) => return BackendInfo::unavailable(kind, "firewalld is not running"),
            Err(e) => return BackendInfo::unavailable(kind, e.to_string()),
        }
    }

    let (active, message) = match backend.status().await {
        Ok(status) => (status.enabled, None),
        Err(e) => {
            warn!(backend = %kind, error = %e, "Status query failed during probe");
            (false, Some(e.to_string()))
        }
    };

    BackendInfo {
        kind,
        available: true,
        active,
        preferred: false,
        version: Some(version),
        message,
    }
}
