use crate::command::RunError;
use crate::core::firewall::BackendKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Core error types for unifw
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The tool (or connector) cannot be invoked at all
    #[error("{target} is unavailable: {reason}")]
    BackendUnavailable { target: String, reason: String },

    /// The backend has no analogue for the requested operation
    #[error("{backend} does not support {operation}")]
    UnsupportedOperation {
        backend: BackendKind,
        operation: &'static str,
    },

    /// Rule (or route/policy rule) failed validation, locally or natively
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// The referenced id is absent from the current listing
    #[error("{scope} has no entry with id '{id}'")]
    RuleNotFound { scope: String, id: String },

    /// Native command exceeded the runner timeout and was killed
    #[error("{program} did not finish within {timeout:?}")]
    BackendTimeout { program: String, timeout: Duration },

    /// Native output did not match the expected grammar
    #[error("Unexpected {tool} output: {message}")]
    ParseError { tool: String, message: String },

    /// Transient lock contention or reload in progress
    #[error("{tool} is busy: {message}")]
    Busy { tool: String, message: String },

    /// Entry already exists (duplicate priority, "File exists")
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Actor lacks the permission required for a mutation
    #[error("{actor} lacks permission '{permission}'")]
    Forbidden { actor: String, permission: String },

    /// Non-zero exit that matched no known pattern
    #[error("{tool} failed: {message}")]
    CommandFailed {
        tool: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outward status codes, one per error class plus `Success`
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
    strum::AsRefStr,
)]
pub enum StatusCode {
    Success,
    BackendUnavailable,
    UnsupportedOperation,
    InvalidRule,
    RuleNotFound,
    BackendTimeout,
    ParseError,
    Conflict,
    BackendBusy,
    Forbidden,
    CommandFailed,
    Internal,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BackendUnavailable { .. } => StatusCode::BackendUnavailable,
            Self::UnsupportedOperation { .. } => StatusCode::UnsupportedOperation,
            Self::InvalidRule(_) => StatusCode::InvalidRule,
            Self::RuleNotFound { .. } => StatusCode::RuleNotFound,
            Self::BackendTimeout { .. } => StatusCode::BackendTimeout,
            Self::ParseError { .. } | Self::Serialization(_) => StatusCode::ParseError,
            Self::Busy { .. } => StatusCode::BackendBusy,
            Self::Conflict(_) => StatusCode::Conflict,
            Self::Forbidden { .. } => StatusCode::Forbidden,
            Self::CommandFailed { .. } => StatusCode::CommandFailed,
            Self::Io(_) | Self::Internal(_) => StatusCode::Internal,
        }
    }

    /// Only lock contention and in-progress reloads are worth retrying.
    /// Timeouts are terminal: the native command may have partially applied.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Fills in the id of a `RuleNotFound` raised from native stderr,
    /// where the tool itself does not echo which entry it was given.
    pub fn for_id(self, id: &str) -> Self {
        match self {
            Self::RuleNotFound { scope, id: old } if old.is_empty() => Self::RuleNotFound {
                scope,
                id: id.to_string(),
            },
            other => other,
        }
    }

    pub(crate) fn parse(tool: &str, message: impl Into<String>) -> Self {
        Self::ParseError {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    /// Maps a runner failure into the taxonomy. A missing binary or a failed
    /// elevation is an environment error, never retried.
    pub(crate) fn from_run(program: &str, err: RunError) -> Self {
        match err {
            RunError::Timeout { timeout, .. } => Self::BackendTimeout {
                program: program.to_string(),
                timeout,
            },
            RunError::NotFound(_) => Self::BackendUnavailable {
                target: program.to_string(),
                reason: format!("{program} not found in PATH"),
            },
            RunError::Elevation(e) => Self::BackendUnavailable {
                target: program.to_string(),
                reason: e.to_string(),
            },
            RunError::Spawn { source, .. } => Self::BackendUnavailable {
                target: program.to_string(),
                reason: source.to_string(),
            },
        }
    }

    /// Turns a non-zero native exit into a classified error.
    pub(crate) fn from_failure(program: &str, message: &str, exit_code: Option<i32>) -> Self {
        let message = message.trim().to_string();
        match FailurePattern::classify(program, &message) {
            FailureKind::Busy => Self::Busy {
                tool: program.to_string(),
                message,
            },
            FailureKind::Unavailable => Self::BackendUnavailable {
                target: program.to_string(),
                reason: message,
            },
            FailureKind::Invalid => Self::InvalidRule(message),
            FailureKind::NotFound => Self::RuleNotFound {
                scope: program.to_string(),
                id: String::new(),
            },
            FailureKind::Conflict => Self::Conflict(message),
            FailureKind::Unknown => Self::CommandFailed {
                tool: program.to_string(),
                message,
                exit_code,
            },
        }
    }
}

/// Classification of a native failure message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Busy,
    Unavailable,
    Invalid,
    NotFound,
    Conflict,
    Unknown,
}

/// Database of native stderr patterns, per tool
pub struct FailurePattern;

impl FailurePattern {
    /// Matches a failure message against the known patterns for `program`.
    pub fn classify(program: &str, msg: &str) -> FailureKind {
        let lower = msg.to_lowercase();

        // Tool-specific patterns first, they are more precise than the shared ones
        let specific = match program {
            "ufw" => Self::classify_ufw(&lower),
            "iptables" | "ip6tables" => Self::classify_iptables(&lower),
            "firewall-cmd" => Self::classify_firewalld(&lower),
            "nft" => Self::classify_nft(&lower),
            "ip" => Self::classify_ip(&lower),
            _ => None,
        };
        if let Some(kind) = specific {
            return kind;
        }

        // Lock contention and reloads
        if lower.contains("resource busy")
            || lower.contains("resource temporarily unavailable")
            || lower.contains("xtables lock")
            || lower.contains("another app is currently holding")
            || lower.contains("could not acquire lock")
            || lower.contains("try again")
            || lower.contains("noreply")
            || lower.contains("timeout was reached")
            || lower.contains("reload in progress")
        {
            return FailureKind::Busy;
        }

        // Environment problems
        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you need to be root")
            || lower.contains("must be run as root")
            || lower.contains("a password is required")
            || lower.contains("not running")
            || lower.contains("command not found")
            || lower.contains("cache initialization failed")
            || lower.contains("cannot connect to the docker daemon")
        {
            return FailureKind::Unavailable;
        }

        if lower.contains("already exists") || lower.contains("file exists") {
            return FailureKind::Conflict;
        }

        if lower.contains("invalid") || lower.contains("syntax error") {
            return FailureKind::Invalid;
        }

        FailureKind::Unknown
    }

    fn classify_ufw(lower: &str) -> Option<FailureKind> {
        if lower.contains("could not delete non-existent rule")
            || lower.contains("rule not found")
        {
            return Some(FailureKind::NotFound);
        }
        if lower.contains("bad port")
            || lower.contains("wrong number of arguments")
            || lower.contains("improper rule syntax")
            || lower.contains("unsupported protocol")
            || lower.contains("invalid")
            || lower.contains("could not find profile")
            || lower.contains("need 'to' or 'from'")
        {
            return Some(FailureKind::Invalid);
        }
        None
    }

    fn classify_iptables(lower: &str) -> Option<FailureKind> {
        if lower.contains("does a matching rule exist")
            || lower.contains("index of deletion too big")
        {
            return Some(FailureKind::NotFound);
        }
        if lower.contains("another app is currently holding the xtables lock") {
            return Some(FailureKind::Busy);
        }
        if lower.contains("bad argument")
            || lower.contains("unknown option")
            || lower.contains("no chain/target/match by that name")
            || lower.contains("host/network")
            || lower.contains("couldn't load")
            || lower.contains("invalid port")
        {
            return Some(FailureKind::Invalid);
        }
        None
    }

    fn classify_firewalld(lower: &str) -> Option<FailureKind> {
        if lower.contains("not_enabled") {
            return Some(FailureKind::NotFound);
        }
        if lower.contains("already_enabled") || lower.contains("name_conflict") {
            return Some(FailureKind::Conflict);
        }
        if lower.contains("not running") {
            return Some(FailureKind::Unavailable);
        }
        if lower.contains("invalid_") || lower.contains("missing_") {
            return Some(FailureKind::Invalid);
        }
        None
    }

    fn classify_nft(lower: &str) -> Option<FailureKind> {
        // nft reports a missing table/chain as ENOENT, which is a rule problem here
        if lower.contains("could not process rule")
            || lower.contains("syntax error")
            || lower.contains("did you mean")
            || lower.contains("no such file or directory")
        {
            return Some(FailureKind::Invalid);
        }
        None
    }

    fn classify_ip(lower: &str) -> Option<FailureKind> {
        if lower.contains("file exists") {
            return Some(FailureKind::Conflict);
        }
        if lower.contains("no such process") || lower.contains("no such file or directory") {
            return Some(FailureKind::NotFound);
        }
        if lower.contains("cannot find device")
            || lower.contains("nexthop has invalid gateway")
            || lower.contains("network is unreachable")
            || lower.contains("invalid")
            || lower.contains("error: ")
        {
            return Some(FailureKind::Invalid);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xtables_lock_is_busy() {
        let msg = "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?";
        assert_eq!(FailurePattern::classify("iptables", msg), FailureKind::Busy);
        assert!(Error::from_failure("iptables", msg, Some(4)).is_transient());
    }

    #[test]
    fn test_iptables_missing_rule_is_not_found() {
        let msg = "iptables: Bad rule (does a matching rule exist in that chain?).";
        assert_eq!(
            FailurePattern::classify("iptables", msg),
            FailureKind::NotFound
        );
    }

    #[test]
    fn test_ufw_root_required_is_unavailable() {
        let err = Error::from_failure("ufw", "ERROR: You need to be root to run this script", Some(1));
        assert_eq!(err.status_code(), StatusCode::BackendUnavailable);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_firewalld_not_running() {
        assert_eq!(
            FailurePattern::classify("firewall-cmd", "FirewallD is not running"),
            FailureKind::Unavailable
        );
    }

    #[test]
    fn test_firewalld_not_enabled_is_not_found() {
        assert_eq!(
            FailurePattern::classify("firewall-cmd", "Warning: NOT_ENABLED: 8080:tcp"),
            FailureKind::NotFound
        );
    }

    #[test]
    fn test_nft_missing_chain_is_invalid() {
        let msg = "Error: No such file or directory; did you mean chain 'input' in table inet 'filter'?";
        assert_eq!(FailurePattern::classify("nft", msg), FailureKind::Invalid);
    }

    #[test]
    fn test_nft_permission_denied() {
        let msg = "Error: Could not process rule: Operation not permitted";
        // "could not process rule" wins over the generic permission pattern for nft
        assert_eq!(FailurePattern::classify("nft", msg), FailureKind::Invalid);
        assert_eq!(
            FailurePattern::classify("nft", "netlink: Error: cache initialization failed: Operation not permitted"),
            FailureKind::Unavailable
        );
    }

    #[test]
    fn test_ip_file_exists_is_conflict() {
        let err = Error::from_failure("ip", "RTNETLINK answers: File exists\n", Some(2));
        assert!(matches!(err, Error::Conflict(ref m) if m == "RTNETLINK answers: File exists"));
        assert_eq!(err.status_code(), StatusCode::Conflict);
    }

    #[test]
    fn test_unknown_failure_keeps_exit_code() {
        let err = Error::from_failure("ufw", "something odd happened", Some(3));
        match err {
            Error::CommandFailed { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_for_id_fills_native_not_found() {
        let err = Error::from_failure("iptables", "Index of deletion too big.", Some(1)).for_id("INPUT:9");
        match err {
            Error::RuleNotFound { id, .. } => assert_eq!(id, "INPUT:9"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_timeout_is_not_transient() {
        let err = Error::from_run(
            "ufw",
            RunError::Timeout {
                program: "ufw".into(),
                timeout: Duration::from_secs(10),
            },
        );
        assert_eq!(err.status_code(), StatusCode::BackendTimeout);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_status_code_display() {
        assert_eq!(StatusCode::BackendBusy.to_string(), "BackendBusy");
        assert_eq!(
            serde_json::to_string(&StatusCode::RuleNotFound).unwrap(),
            "\"RuleNotFound\""
        );
    }
}
