//! Backend-neutral firewall operations
//!
//! [`FirewallManager`] picks the backend for each call and routes every
//! write through the [`MutationContext`], so all firewall changes are
//! serialized per backend and audited.

use super::access::{Actor, Permission};
use super::backend::FirewallBackend;
use super::backends::{BackendOptions, build_backend};
use super::coordinator::{Intent, LockScope, MutationContext};
use super::error::{Error, Result};
use super::firewall::{
    Action, BackendKind, BackendStatus, Detection, FirewallRule, NativeObjects, PortSpec, Protocol,
};
use super::probe::BackendProbe;
use crate::audit::{AuditAction, ResourceType};
use crate::command::CommandRunner;
use std::collections::HashMap;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing::debug;

pub struct FirewallManager {
    probe: BackendProbe,
    backends: HashMap<BackendKind, Arc<dyn FirewallBackend>>,
    mutations: MutationContext,
}

impl FirewallManager {
    /// Builds one adapter per backend kind over `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, options: &BackendOptions, mutations: MutationContext) -> Self {
        let adapters: Vec<Arc<dyn FirewallBackend>> = BackendKind::iter()
            .map(|kind| build_backend(kind, runner.clone(), options))
            .collect();
        Self::with_backends(runner, adapters, options, mutations)
    }

    /// Uses the given adapters instead of the built-in ones.
    pub fn with_backends(
        runner: Arc<dyn CommandRunner>,
        adapters: Vec<Arc<dyn FirewallBackend>>,
        options: &BackendOptions,
        mutations: MutationContext,
    ) -> Self {
        let backends = adapters.iter().map(|b| (b.kind(), b.clone())).collect();
        Self {
            probe: BackendProbe::new(runner, adapters, options.timeout),
            backends,
            mutations,
        }
    }

    pub async fn detect(&self) -> Detection {
        self.probe.detect().await
    }

    pub async fn refresh(&self) -> Detection {
        self.probe.refresh().await
    }

    /// The backend a call should use: `choice` if it is available, the
    /// preferred backend otherwise.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` when `choice` is unavailable or nothing is.
    pub async fn resolve(&self, choice: Option<BackendKind>) -> Result<Arc<dyn FirewallBackend>> {
        let detection = self.probe.detect().await;
        let kind = match choice {
            Some(kind) if detection.is_available(kind) => kind,
            Some(kind) => {
                let reason = detection
                    .info(kind)
                    .and_then(|i| i.message.clone())
                    .unwrap_or_else(|| "not detected".to_string());
                return Err(Error::BackendUnavailable {
                    target: kind.to_string(),
                    reason,
                });
            }
            None => detection.preferred.ok_or_else(|| Error::BackendUnavailable {
                target: "firewall".to_string(),
                reason: "no supported firewall backend is installed".to_string(),
            })?,
        };
        debug!(backend = %kind, "Resolved firewall backend");
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no adapter registered for {kind}")))
    }

    pub async fn status(&self, choice: Option<BackendKind>) -> Result<BackendStatus> {
        self.resolve(choice).await?.status().await
    }

    pub async fn list_rules(&self, choice: Option<BackendKind>) -> Result<Vec<FirewallRule>> {
        self.resolve(choice).await?.list_rules().await
    }

    pub async fn native_objects(&self, choice: Option<BackendKind>) -> Result<NativeObjects> {
        self.resolve(choice).await?.native_objects().await
    }

    pub async fn add_rule(
        &self,
        actor: &Actor,
        choice: Option<BackendKind>,
        rule: FirewallRule,
    ) -> Result<FirewallRule> {
        let intent = Intent::new(AuditAction::Create, ResourceType::FirewallRule).with_requested(&rule);
        let backend = self.writable(actor, choice, &intent).await?;
        let scope = LockScope::Firewall(backend.kind());
        self.mutations
            .execute(actor, Permission::FirewallWrite, scope, intent, move || {
                let backend = backend.clone();
                let rule = rule.clone();
                async move { backend.add_rule(&rule).await }
            })
            .await
    }

    /// Drops inbound traffic to `port`, on one interface or on all of them.
    pub async fn block_port(
        &self,
        actor: &Actor,
        choice: Option<BackendKind>,
        port: u16,
        protocol: Protocol,
        interface: Option<String>,
    ) -> Result<FirewallRule> {
        let mut rule = FirewallRule::new(Action::Deny)
            .with_protocol(protocol)
            .with_port(PortSpec::Single(port));
        rule.interface = interface.filter(|i| i != "all");
        self.add_rule(actor, choice, rule).await
    }

    pub async fn delete_rule(&self, actor: &Actor, choice: Option<BackendKind>, id: &str) -> Result<FirewallRule> {
        let intent = Intent::new(AuditAction::Delete, ResourceType::FirewallRule).with_resource_id(id);
        let backend = self.writable(actor, choice, &intent).await?;
        let scope = LockScope::Firewall(backend.kind());
        let id = id.to_string();
        self.mutations
            .execute(actor, Permission::FirewallWrite, scope, intent, move || {
                let backend = backend.clone();
                let id = id.clone();
                async move { backend.delete_rule(&id).await }
            })
            .await
    }

    pub async fn enable(&self, actor: &Actor, choice: Option<BackendKind>) -> Result<BackendStatus> {
        self.toggle(actor, choice, true).await
    }

    pub async fn disable(&self, actor: &Actor, choice: Option<BackendKind>) -> Result<BackendStatus> {
        self.toggle(actor, choice, false).await
    }

    /// Switches the firewall on or off, returning the status read back
    /// afterwards.
    async fn toggle(&self, actor: &Actor, choice: Option<BackendKind>, on: bool) -> Result<BackendStatus> {
        let action = if on { AuditAction::Enable } else { AuditAction::Disable };
        let mut intent = Intent::new(action, ResourceType::Firewall);
        if let Some(kind) = choice {
            intent = intent.with_resource_id(kind.to_string());
        }
        let backend = self.writable(actor, choice, &intent).await?;
        let kind = backend.kind();
        intent = intent.with_resource_id(kind.to_string());
        intent.before = match backend.status().await {
            Ok(status) => serde_json::to_value(status).ok(),
            Err(e) => {
                debug!(backend = %kind, error = %e, "Status before toggle unavailable");
                None
            }
        };

        let status = self
            .mutations
            .execute(actor, Permission::FirewallWrite, LockScope::Firewall(kind), intent, move || {
                let backend = backend.clone();
                async move {
                    if on {
                        backend.enable().await?;
                    } else {
                        backend.disable().await?;
                    }
                    backend.status().await
                }
            })
            .await?;
        self.probe.refresh().await;
        Ok(status)
    }

    /// Authorizes the write and resolves its backend, auditing an attempt
    /// that fails either step.
    async fn writable(
        &self,
        actor: &Actor,
        choice: Option<BackendKind>,
        intent: &Intent,
    ) -> Result<Arc<dyn FirewallBackend>> {
        self.mutations
            .authorize(actor, Permission::FirewallWrite, intent)
            .await?;
        match self.resolve(choice).await {
            Ok(backend) => Ok(backend),
            Err(e) => self.mutations.reject(actor, intent.clone(), e).await,
        }
    }
}
