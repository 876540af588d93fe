//! Mutation serialization, retry and auditing
//!
//! Every write runs under an exclusive lock for its [`LockScope`] inside a
//! spawned task, so a caller dropping its future cannot abort a native
//! command that is already in flight. Only [`Error::is_transient`] failures
//! are retried. Reads never take a lock.

use super::access::{Actor, Permission};
use super::error::{Error, Result};
use super::firewall::{BackendKind, BackendStatus, FirewallRule};
use crate::audit::{AuditAction, AuditEvent, AuditSink, Outcome, ResourceType};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// Resource a mutation holds exclusively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    Firewall(BackendKind),
    Routing,
    Proxy,
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Firewall(kind) => write!(f, "firewall:{kind}"),
            LockScope::Routing => write!(f, "routing"),
            LockScope::Proxy => write!(f, "proxy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

pub struct Coordinator {
    locks: Mutex<HashMap<LockScope, Arc<tokio::sync::Mutex<()>>>>,
    retry: RetryPolicy,
}

impl Coordinator {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            retry,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn lock_for(&self, scope: LockScope) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(scope)
            .or_default()
            .clone()
    }

    /// Runs `op` under the scope lock on a spawned task, retrying transient
    /// failures.
    ///
    /// # Errors
    ///
    /// The last error of `op`, or `Internal` if the task panicked.
    pub async fn with_lock<T, F, Fut>(&self, scope: LockScope, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let task = self.locked(scope, op);
        join(tokio::spawn(task)).await
    }

    /// The lock-and-retry future, not yet spawned
    fn locked<T, F, Fut>(
        &self,
        scope: LockScope,
        mut op: F,
    ) -> impl Future<Output = Result<T>> + Send + use<T, F, Fut>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let lock = self.lock_for(scope);
        let retry = self.retry;
        async move {
            let _guard = lock.lock_owned().await;
            let mut attempt = 1;
            loop {
                match op().await {
                    Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                        let delay = retry.backoff(attempt);
                        warn!(%scope, attempt, ?delay, error = %e, "Transient failure, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    other => return other,
                }
            }
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

async fn join<T>(handle: tokio::task::JoinHandle<Result<T>>) -> Result<T> {
    handle
        .await
        .map_err(|e| Error::Internal(format!("mutation task failed: {e}")))?
}

/// Identifies the audited resource from an operation's result
pub trait AuditTarget {
    fn audit_id(&self) -> Option<String>;
}

impl AuditTarget for FirewallRule {
    fn audit_id(&self) -> Option<String> {
        Some(self.id.clone())
    }
}

impl AuditTarget for BackendStatus {
    fn audit_id(&self) -> Option<String> {
        None
    }
}

impl AuditTarget for () {
    fn audit_id(&self) -> Option<String> {
        None
    }
}

/// What a mutation is about to do, for the audit record
#[derive(Debug, Clone)]
pub struct Intent {
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: Option<String>,
    pub before: Option<serde_json::Value>,
    /// Requested state, recorded as `after` when the attempt fails
    pub requested: Option<serde_json::Value>,
}

impl Intent {
    pub fn new(action: AuditAction, resource_type: ResourceType) -> Self {
        Self {
            action,
            resource_type,
            resource_id: None,
            before: None,
            requested: None,
        }
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn with_requested<S: Serialize>(mut self, requested: &S) -> Self {
        self.requested = serde_json::to_value(requested).ok();
        self
    }

    fn into_event<T: Serialize + AuditTarget>(self, actor: &Actor, result: &Result<T>) -> AuditEvent {
        let value = match result {
            Ok(value) => value,
            Err(err) => return self.failure_event(actor, err),
        };
        let json = serde_json::to_value(value).ok().filter(|v| !v.is_null());
        let resource_id = value.audit_id().or(self.resource_id);
        let event = AuditEvent::new(actor, self.action, self.resource_type, resource_id, Outcome::Success);
        // A delete returns what was removed
        if self.action == AuditAction::Delete {
            event.with_before(json.or(self.before))
        } else {
            event.with_before(self.before).with_after(json)
        }
    }

    fn failure_event(self, actor: &Actor, err: &Error) -> AuditEvent {
        AuditEvent::new(
            actor,
            self.action,
            self.resource_type,
            self.resource_id,
            Outcome::from_error(err),
        )
        .with_before(self.before)
        .with_after(self.requested)
    }
}

/// Coordinator plus audit sink: the only path by which state changes
#[derive(Clone)]
pub struct MutationContext {
    coordinator: Arc<Coordinator>,
    audit: Arc<dyn AuditSink>,
}

impl MutationContext {
    pub fn new(coordinator: Arc<Coordinator>, audit: Arc<dyn AuditSink>) -> Self {
        Self { coordinator, audit }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Records one event for an attempt that never reached the lock.
    pub async fn reject<T>(&self, actor: &Actor, intent: Intent, err: Error) -> Result<T> {
        record(self.audit.as_ref(), intent.failure_event(actor, &err)).await;
        Err(err)
    }

    /// Fails with `Forbidden`, recording the attempt, when `actor` lacks
    /// `permission`.
    pub async fn authorize(&self, actor: &Actor, permission: Permission, intent: &Intent) -> Result<()> {
        if actor.can(permission) {
            return Ok(());
        }
        warn!(actor = %actor, %permission, "Mutation forbidden");
        self.reject(actor, intent.clone(), actor.forbidden(permission)).await
    }

    /// Checks `permission`, runs `op` under `scope` and records exactly one
    /// audit event, whatever the outcome.
    ///
    /// The audit write happens inside the spawned task, so it is recorded
    /// even if the caller stops waiting.
    pub async fn execute<T, F, Fut>(
        &self,
        actor: &Actor,
        permission: Permission,
        scope: LockScope,
        intent: Intent,
        op: F,
    ) -> Result<T>
    where
        T: Serialize + AuditTarget + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.authorize(actor, permission, &intent).await?;

        let locked = self.coordinator.locked(scope, op);
        let audit = self.audit.clone();
        let actor = actor.clone();
        join(tokio::spawn(async move {
            let result = locked.await;
            if let Err(e) = &result {
                warn!(%scope, actor = %actor.name, error = %e, "Mutation failed");
            } else {
                info!(%scope, actor = %actor.name, action = %intent.action, "Mutation applied");
            }
            record(audit.as_ref(), intent.into_event(&actor, &result)).await;
            result
        }))
        .await
    }
}

async fn record(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event).await {
        warn!("Failed to write audit log: {}", e);
    }
}
