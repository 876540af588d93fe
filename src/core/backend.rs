//! The backend contract and the plumbing shared by every adapter
//!
//! [`FirewallBackend`] is implemented once per native tool. The provided
//! `add_rule` / `delete_rule` methods own the list-mutate-relist sequence so
//! each adapter only supplies parsing and argv construction.

use super::error::{Error, Result};
use super::firewall::{BackendKind, BackendStatus, FirewallRule, NativeObjects};
use super::rule_constraints;
use crate::command::{CommandOutput, CommandRunner};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[async_trait]
pub trait FirewallBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Native enable state, default policies and logging level
    async fn status(&self) -> Result<BackendStatus>;

    /// Current rules in native evaluation order. Ids are only valid until
    /// the next mutation.
    async fn list_rules(&self) -> Result<Vec<FirewallRule>>;

    /// Backend-specific checks that need live state (e.g. chain existence).
    async fn preflight(&self, _rule: &FirewallRule) -> Result<()> {
        Ok(())
    }

    /// Issues the native add. Callers hold the backend lock.
    async fn dispatch_add(&self, rule: &FirewallRule) -> Result<()>;

    /// Issues the native delete for a rule taken from the current listing.
    async fn dispatch_delete(&self, rule: &FirewallRule) -> Result<()>;

    async fn enable(&self) -> Result<()> {
        Err(Error::UnsupportedOperation {
            backend: self.kind(),
            operation: "enable",
        })
    }

    async fn disable(&self) -> Result<()> {
        Err(Error::UnsupportedOperation {
            backend: self.kind(),
            operation: "disable",
        })
    }

    /// Application profiles, zones or tables, whichever the tool has.
    async fn native_objects(&self) -> Result<NativeObjects> {
        Err(Error::UnsupportedOperation {
            backend: self.kind(),
            operation: "native objects",
        })
    }

    /// Adds `rule`, returning it as the backend now lists it.
    ///
    /// Adding a rule that already exists (semantically) is a no-op that
    /// returns the existing entry.
    async fn add_rule(&self, rule: &FirewallRule) -> Result<FirewallRule> {
        let kind = self.kind();
        rule_constraints::validate_rule(kind, rule)?;
        self.preflight(rule).await?;

        let before = self.list_rules().await?;
        if let Some(existing) = find_equivalent(&before, rule) {
            info!(backend = %kind, id = %existing.id, "Rule already present, leaving ruleset unchanged");
            return Ok(existing.clone());
        }

        self.dispatch_add(rule).await?;

        let after = self.list_rules().await?;
        let added = resolve_added(kind, &before, &after, rule)?;
        info!(backend = %kind, id = %added.id, rule = %added, "Added firewall rule");
        Ok(added)
    }

    /// Deletes the rule currently listed under `id`, returning it.
    async fn delete_rule(&self, id: &str) -> Result<FirewallRule> {
        let kind = self.kind();
        let current = self.list_rules().await?;
        let Some(target) = current.into_iter().find(|r| r.id == id) else {
            return Err(Error::RuleNotFound {
                scope: kind.to_string(),
                id: id.to_string(),
            });
        };

        self.dispatch_delete(&target).await.map_err(|e| e.for_id(id))?;
        info!(backend = %kind, id, rule = %target, "Deleted firewall rule");
        Ok(target)
    }
}

/// First listed rule semantically equal to `wanted`
pub fn find_equivalent<'a>(
    rules: &'a [FirewallRule],
    wanted: &FirewallRule,
) -> Option<&'a FirewallRule> {
    rules.iter().find(|r| r.matches(wanted))
}

/// Picks the entry a native add produced by diffing the two listings.
///
/// Matching entries whose id was not present before win. Ids shift on some
/// backends (ufw renumbers), so a match with a reused id is accepted too.
///
/// # Errors
///
/// `ParseError` when no listed rule matches, i.e. the native tool accepted
/// the command but the rule cannot be read back.
pub fn resolve_added(
    kind: BackendKind,
    before: &[FirewallRule],
    after: &[FirewallRule],
    wanted: &FirewallRule,
) -> Result<FirewallRule> {
    let before_ids: HashSet<&str> = before.iter().map(|r| r.id.as_str()).collect();
    after
        .iter()
        .filter(|r| r.matches(wanted))
        .min_by_key(|r| before_ids.contains(r.id.as_str()))
        .cloned()
        .ok_or_else(|| {
            Error::parse(
                kind.binary(),
                format!("added rule '{wanted}' is not visible in the listing"),
            )
        })
}

/// One native binary driven through the runner with a fixed timeout
#[derive(Clone)]
pub struct NativeTool {
    runner: Arc<dyn CommandRunner>,
    program: &'static str,
    timeout: Duration,
}

impl NativeTool {
    pub fn new(runner: Arc<dyn CommandRunner>, program: &'static str, timeout: Duration) -> Self {
        Self {
            runner,
            program,
            timeout,
        }
    }

    pub fn program(&self) -> &'static str {
        self.program
    }

    pub fn is_installed(&self) -> bool {
        self.runner.locate(self.program).is_some()
    }

    /// Runs the tool and returns the raw output, whatever the exit code.
    pub async fn output(&self, args: &[String]) -> Result<CommandOutput> {
        self.runner
            .run(self.program, args, self.timeout)
            .await
            .map_err(|e| Error::from_run(self.program, e))
    }

    /// Runs the tool and returns stdout, classifying a non-zero exit.
    pub async fn run(&self, args: &[String]) -> Result<String> {
        let out = self.output(args).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(Error::from_failure(
                self.program,
                out.failure_message(),
                out.exit_code,
            ))
        }
    }

    /// [`Self::run`] for literal arguments
    pub async fn query(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.run(&args).await
    }
}

impl std::fmt::Debug for NativeTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeTool")
            .field("program", &self.program)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::{Action, PortSpec, Protocol};

    fn web(id: &str) -> FirewallRule {
        FirewallRule::new(Action::Allow)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Single(443))
            .with_id(id)
    }

    #[test]
    fn test_resolve_added_prefers_new_id() {
        let wanted = web("");
        let ssh = FirewallRule::new(Action::Allow)
            .with_protocol(Protocol::Tcp)
            .with_port(PortSpec::Single(22))
            .with_id("1");
        let before = vec![ssh.clone()];
        let after = vec![ssh, web("2")];
        assert_eq!(
            resolve_added(BackendKind::Ufw, &before, &after, &wanted).unwrap().id,
            "2"
        );
    }

    #[test]
    fn test_resolve_added_accepts_renumbered_entry() {
        // ufw inserts v4 rules ahead of v6 twins, so the new rule can take an old number
        let mut v6 = web("1");
        v6.ipv6_only = true;
        let before = vec![v6];
        let mut v6_shifted = web("2");
        v6_shifted.ipv6_only = true;
        let after = vec![web("1"), v6_shifted];
        let added = resolve_added(BackendKind::Ufw, &before, &after, &web("")).unwrap();
        assert_eq!(added.id, "1");
        assert!(!added.ipv6_only);
    }

    #[test]
    fn test_resolve_added_missing_is_parse_error() {
        let err = resolve_added(BackendKind::Nftables, &[], &[], &web("")).unwrap_err();
        assert!(matches!(err, Error::ParseError { .. }));
    }

    #[test]
    fn test_find_equivalent_ignores_comment() {
        let rules = vec![web("7").with_comment("https")];
        assert_eq!(find_equivalent(&rules, &web("")).map(|r| r.id.as_str()), Some("7"));
    }
}
