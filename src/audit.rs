//! Audit trail for mutating operations
//!
//! Every firewall, routing and proxy mutation produces exactly one
//! [`AuditEvent`], including forbidden and failed attempts. Events go through
//! the [`AuditSink`] seam; [`JsonlAuditLog`] is the default store.

use crate::core::access::Actor;
use crate::core::error::{Error, StatusCode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Longest failure reason kept in an event
const MAX_REASON_LEN: usize = 512;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum AuditAction {
    Create,
    Delete,
    Enable,
    Disable,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ResourceType {
    /// Backend-wide state (enable/disable)
    Firewall,
    FirewallRule,
    Route,
    IpRule,
    ProxyHost,
    Stream,
}

/// Result of the audited attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    Success,
    Failure { code: StatusCode, reason: String },
}

impl Outcome {
    pub fn from_error(err: &Error) -> Self {
        Self::Failure {
            code: err.status_code(),
            reason: crate::utils::truncate_string(&err.to_string(), MAX_REASON_LEN),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A single audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub actor: String,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: Option<String>,
    /// State before the mutation, when one existed
    pub before: Option<serde_json::Value>,
    /// State after the mutation, or the requested state for failed attempts
    pub after: Option<serde_json::Value>,
    pub outcome: Outcome,
    /// When the event occurred (UTC)
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        actor: &Actor,
        action: AuditAction,
        resource_type: ResourceType,
        resource_id: Option<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.name.clone(),
            action,
            resource_type,
            resource_id,
            before: None,
            after: None,
            outcome,
            timestamp: Utc::now(),
        }
    }

    pub fn with_before(mut self, before: Option<serde_json::Value>) -> Self {
        self.before = before;
        self
    }

    pub fn with_after(mut self, after: Option<serde_json::Value>) -> Self {
        self.after = after;
        self
    }
}

/// Filter for [`AuditSink::query`]. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<ResourceType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.actor.as_ref().is_none_or(|a| *a == event.actor)
            && self.action.is_none_or(|a| a == event.action)
            && self.resource_type.is_none_or(|r| r == event.resource_type)
            && self.since.is_none_or(|t| event.timestamp >= t)
            && self.until.is_none_or(|t| event.timestamp <= t)
    }

    fn apply<I>(&self, events: I) -> Vec<AuditEvent>
    where
        I: DoubleEndedIterator<Item = AuditEvent>,
    {
        events
            .rev()
            .filter(|e| self.matches(e))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Event counts over a set of audit events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub total: usize,
    pub by_action: BTreeMap<String, usize>,
    pub by_resource_type: BTreeMap<String, usize>,
    pub by_actor: BTreeMap<String, usize>,
    /// `success`, or the failure's status code
    pub by_outcome: BTreeMap<String, usize>,
}

impl AuditSummary {
    pub fn from_events(events: &[AuditEvent]) -> Self {
        let mut summary = Self {
            total: events.len(),
            ..Self::default()
        };
        for e in events {
            *summary.by_action.entry(e.action.to_string()).or_default() += 1;
            *summary.by_resource_type.entry(e.resource_type.to_string()).or_default() += 1;
            *summary.by_actor.entry(e.actor.clone()).or_default() += 1;
            let outcome = match &e.outcome {
                Outcome::Success => "success".to_string(),
                Outcome::Failure { code, .. } => code.to_string(),
            };
            *summary.by_outcome.entry(outcome).or_default() += 1;
        }
        summary
    }
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> std::io::Result<()>;

    async fn query(&self, query: &AuditQuery) -> std::io::Result<Vec<AuditEvent>>;
}

/// Audit log writer (JSON lines, one event per line)
pub struct JsonlAuditLog {
    log_path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the path to the audit log file
    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn record(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut json = serde_json::to_string(event)?;
        json.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        #[cfg(unix)]
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.log_path)
            .await?;
        #[cfg(not(unix))]
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> std::io::Result<Vec<AuditEvent>> {
        let content = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let events: Vec<AuditEvent> = content
            .lines()
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("Skipping unreadable audit line: {}", e);
                    None
                }
            })
            .collect();
        Ok(query.apply(events.into_iter()))
    }
}

/// In-process sink, for embedding and tests
#[derive(Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded event, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, event: &AuditEvent) -> std::io::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> std::io::Result<Vec<AuditEvent>> {
        Ok(query.apply(self.events().into_iter()))
    }
}
