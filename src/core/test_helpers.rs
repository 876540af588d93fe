//! Shared test utilities for core module tests
//!
//! Provides scripted and stateful runners so adapter tests never touch real
//! firewall tools or require elevation. This module is only compiled in test mode.

use crate::command::{CommandOutput, CommandRunner, RunError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("UNIFW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("UNIFW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone)]
enum Scripted {
    Output(CommandOutput),
    Timeout,
}

/// Runner answering from a script keyed by the full command line.
///
/// Each key holds a queue of responses. Responses are consumed in order and
/// the last one repeats, so "list before" / "list after" pairs are scripted
/// by pushing two outputs.
#[derive(Default)]
pub struct FakeRunner {
    installed: HashSet<String>,
    script: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `program` as present on PATH
    pub fn with_tool(mut self, program: &str) -> Self {
        self.installed.insert(program.to_string());
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn push(&self, cmdline: &str, response: Scripted) {
        self.script
            .lock()
            .unwrap()
            .entry(cmdline.to_string())
            .or_default()
            .push_back(response);
    }

    /// Scripts a successful run printing `stdout`
    pub fn ok(&self, cmdline: &str, stdout: &str) -> &Self {
        self.push(
            cmdline,
            Scripted::Output(CommandOutput {
                exit_code: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            }),
        );
        self
    }

    /// Scripts a failing run
    pub fn fail(&self, cmdline: &str, exit_code: i32, stderr: &str) -> &Self {
        self.push(
            cmdline,
            Scripted::Output(CommandOutput {
                exit_code: Some(exit_code),
                stdout: String::new(),
                stderr: stderr.to_string(),
            }),
        );
        self
    }

    /// Scripts a run that exceeds its timeout
    pub fn timeout(&self, cmdline: &str) -> &Self {
        self.push(cmdline, Scripted::Timeout);
        self
    }

    /// Every command line run so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn count(&self, cmdline: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == cmdline)
            .count()
    }
}

fn cmdline(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, RunError> {
        if !self.installed.contains(program) {
            return Err(RunError::NotFound(program.to_string()));
        }
        let line = cmdline(program, args);
        self.calls.lock().unwrap().push(line.clone());

        let response = {
            let mut script = self.script.lock().unwrap();
            match script.get_mut(&line) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match response {
            Some(Scripted::Output(out)) => Ok(out),
            Some(Scripted::Timeout) => Err(RunError::Timeout {
                program: program.to_string(),
                timeout,
            }),
            None => Ok(CommandOutput {
                exit_code: Some(127),
                stdout: String::new(),
                stderr: format!("unscripted command: {line}"),
            }),
        }
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        self.installed
            .contains(program)
            .then(|| PathBuf::from(format!("/usr/sbin/{program}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UfwEntry {
    to: String,
    action: String,
    direction: String,
    from: String,
    comment: Option<String>,
    v6: bool,
}

#[derive(Debug, Default)]
struct UfwState {
    enabled: bool,
    entries: Vec<UfwEntry>,
}

/// Stateful ufw emulation: adds, numbered listing (v4 rules ahead of their
/// v6 twins), deletes by number, enable/disable.
pub struct FakeUfw {
    state: Mutex<UfwState>,
    calls: Mutex<Vec<String>>,
    /// Extra delay per command so concurrent callers overlap
    latency: Duration,
}

impl FakeUfw {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(UfwState {
                enabled: true,
                entries: Vec::new(),
            }),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn rule_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    fn render_numbered(state: &UfwState) -> String {
        if !state.enabled {
            return "Status: inactive\n".to_string();
        }
        let mut out = String::from(
            "Status: active\n\n     To                         Action      From\n     --                         ------      ----\n",
        );
        for (i, e) in state.entries.iter().enumerate() {
            let action = format!("{} {}", e.action, e.direction);
            let mut line = format!("[{:>2}] {:<26} {:<11} {}", i + 1, e.to, action, e.from);
            if let Some(c) = &e.comment {
                line.push_str(&format!("                   # {c}"));
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out.push('\n');
        out
    }

    fn add(state: &mut UfwState, args: &[String]) -> CommandOutput {
        let get = |i: usize| args.get(i).map(String::as_str).unwrap_or_default();
        let action = get(0).to_uppercase();
        let direction = get(1).to_uppercase();

        let mut i = 2;
        let mut iface = None;
        if get(i) == "on" {
            iface = Some(get(i + 1).to_string());
            i += 2;
        }
        if get(i) != "from" || get(i + 2) != "to" {
            return CommandOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "ERROR: Invalid syntax".to_string(),
            };
        }
        let src = get(i + 1);
        let dst = get(i + 3);
        i += 4;

        let mut to = String::from("Anywhere");
        let mut comment = None;
        while i < args.len() {
            match get(i) {
                "port" => {
                    to = get(i + 1).to_string();
                    if get(i + 2) == "proto" {
                        to = format!("{to}/{}", get(i + 3));
                        i += 2;
                    }
                    i += 2;
                }
                "app" => {
                    to = get(i + 1).to_string();
                    i += 2;
                }
                "proto" => {
                    to = format!("Anywhere/{}", get(i + 1));
                    i += 2;
                }
                "comment" => {
                    comment = Some(get(i + 1).to_string());
                    i += 2;
                }
                other => {
                    return CommandOutput {
                        exit_code: Some(1),
                        stdout: String::new(),
                        stderr: format!("ERROR: Wrong number of arguments near '{other}'"),
                    };
                }
            }
        }

        if dst != "any" {
            to = match to.strip_prefix("Anywhere") {
                Some(proto) => format!("{dst}{proto}"),
                None => format!("{dst} {to}"),
            };
        }
        if let Some(iface) = &iface {
            to = format!("{to} on {iface}");
        }

        let out_suffix = if direction == "OUT" { " (out)" } else { "" };
        let mut variants = Vec::new();
        if src == "any" && dst == "any" {
            variants.push((to.clone(), format!("Anywhere{out_suffix}"), false));
            variants.push((format!("{to} (v6)"), format!("Anywhere (v6){out_suffix}"), true));
        } else {
            let from = if src == "any" { "Anywhere" } else { src };
            let v6 = src.contains(':') || dst.contains(':');
            let from = if v6 && src == "any" { "Anywhere (v6)" } else { from };
            variants.push((to.clone(), format!("{from}{out_suffix}"), v6));
        }

        let mut added = 0;
        for (to, from, v6) in variants {
            let entry = UfwEntry {
                to,
                action: action.clone(),
                direction: direction.clone(),
                from,
                comment: comment.clone(),
                v6,
            };
            if state.entries.iter().any(|e| {
                e.to == entry.to && e.from == entry.from && e.action == entry.action && e.direction == entry.direction
            }) {
                continue;
            }
            if v6 {
                state.entries.push(entry);
            } else {
                let pos = state.entries.iter().position(|e| e.v6).unwrap_or(state.entries.len());
                state.entries.insert(pos, entry);
            }
            added += 1;
        }

        CommandOutput {
            exit_code: Some(0),
            stdout: if added == 0 {
                "Skipping adding existing rule\n".to_string()
            } else {
                "Rule added\nRule added (v6)\n".to_string()
            },
            stderr: String::new(),
        }
    }

    fn handle(&self, args: &[String]) -> CommandOutput {
        let ok = |stdout: &str| CommandOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        };
        let mut state = self.state.lock().unwrap();
        let joined = args.join(" ");
        match joined.as_str() {
            "status numbered" => ok(&Self::render_numbered(&state)),
            "status verbose" => {
                if state.enabled {
                    ok("Status: active\nLogging: on (low)\nDefault: deny (incoming), allow (outgoing), disabled (routed)\nNew profiles: skip\n")
                } else {
                    ok("Status: inactive\n")
                }
            }
            "version" => ok("ufw 0.36.2\nCopyright 2008-2023 Canonical Ltd.\n"),
            "--force enable" => {
                state.enabled = true;
                ok("Firewall is active and enabled on system startup\n")
            }
            "disable" => {
                state.enabled = false;
                ok("Firewall stopped and disabled on system startup\n")
            }
            _ if joined.starts_with("--force delete ") => {
                let n: usize = args[2].parse().unwrap_or(0);
                if n == 0 || n > state.entries.len() {
                    return CommandOutput {
                        exit_code: Some(1),
                        stdout: String::new(),
                        stderr: "ERROR: Could not delete non-existent rule\n".to_string(),
                    };
                }
                state.entries.remove(n - 1);
                ok("Rule deleted\n")
            }
            _ if matches!(args.first().map(String::as_str), Some("allow" | "deny" | "reject" | "limit")) => {
                Self::add(&mut state, args)
            }
            _ => CommandOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: format!("ERROR: Invalid syntax: {joined}"),
            },
        }
    }
}

#[async_trait]
impl CommandRunner for FakeUfw {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput, RunError> {
        if program != "ufw" {
            return Err(RunError::NotFound(program.to_string()));
        }
        self.calls.lock().unwrap().push(cmdline(program, args));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.handle(args))
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        (program == "ufw").then(|| PathBuf::from("/usr/sbin/ufw"))
    }
}
