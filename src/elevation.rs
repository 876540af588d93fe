//! Privilege elevation for native tool invocations
//!
//! unifw runs as an unprivileged user and elevates only the tools it drives:
//!
//! - **Firewall tools**: `ufw`, `iptables`, `firewall-cmd`, `nft`
//! - **Network tools**: `ip`, `ss`
//! - **Service control**: `systemctl` (firewalld start/stop)
//! - **Containers**: `docker`
//!
//! Any other program is refused with [`ElevationError::NotAllowed`].
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Headless fallback**: `pkexec`, or `sudo -n` when polkit is absent so a
//!   missing password fails fast instead of hanging until the runner timeout
//!
//! # Environment Variables
//!
//! - `UNIFW_ELEVATION_METHOD`: Force a specific method (`sudo`, `run0`, or `pkexec`).
//!   Useful with sudoers NOPASSWD rules.
//!   Example: `UNIFW_ELEVATION_METHOD=sudo unifw rules list`
//!
//! - `UNIFW_NO_ELEVATION`: Run tools directly (testing, or capability-granted hosts).
//!
//! # Security
//!
//! - Allowlisted binaries only
//! - Arguments are passed as an argv vector, never through a shell
//!
//! # Example
//!
//! ```no_run
//! use unifw::elevation::create_elevated_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_command("ufw", &["status".to_string(), "numbered".to_string()])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use crate::utils::find_binary;
use tokio::process::Command;

/// Programs that may be run with elevated privileges
pub const ELEVATABLE_PROGRAMS: &[&str] = &[
    "ufw",
    "iptables",
    "firewall-cmd",
    "nft",
    "ip",
    "ss",
    "systemctl",
    "docker",
];

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Program is not on the elevation allowlist
    #[error("Refusing to elevate '{0}': not an allowlisted program")]
    NotAllowed(String),

    /// No usable elevation helper in a non-interactive session
    #[error("No elevation helper found - install sudo, run0 or PolicyKit")]
    NoHelper,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `UNIFW_ELEVATION_METHOD`
    #[error("Invalid UNIFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),
}

fn binary_exists(name: &str) -> bool {
    find_binary(name).is_some()
}

fn wrapped(helper: &str, extra: &[&str], program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.args(extra).arg(program).args(args);
    cmd
}

/// Builds a command running `program` with root privileges.
///
/// # Errors
///
/// - [`ElevationError::NotAllowed`] for programs outside [`ELEVATABLE_PROGRAMS`]
/// - [`ElevationError::InvalidMethod`] / [`ElevationError::MethodNotAvailable`]
///   for a bad `UNIFW_ELEVATION_METHOD`
/// - [`ElevationError::NoHelper`] when no helper exists
pub fn create_elevated_command(program: &str, args: &[String]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    if !ELEVATABLE_PROGRAMS.contains(&program) {
        return Err(ElevationError::NotAllowed(program.to_string()));
    }

    // 1. Explicit opt-out (highest priority)
    if std::env::var_os("UNIFW_NO_ELEVATION").is_some() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Already root
    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit method override
    if let Ok(method) = std::env::var("UNIFW_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(wrapped(&method, &[], program, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection
    if binary_exists("run0") {
        return Ok(wrapped("run0", &[], program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty && binary_exists("sudo") {
        return Ok(wrapped("sudo", &[], program, args));
    }
    if binary_exists("pkexec") {
        return Ok(wrapped("pkexec", &[], program, args));
    }
    if binary_exists("sudo") {
        return Ok(wrapped("sudo", &["-n"], program, args));
    }

    Err(ElevationError::NoHelper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_binary_exists() {
        assert!(binary_exists("sh"));
        assert!(!binary_exists("unifw_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_rejects_unlisted_program() {
        let result = create_elevated_command("rm", &argv(&["-rf", "/"]));
        assert!(matches!(result, Err(ElevationError::NotAllowed(p)) if p == "rm"));
    }

    #[test]
    fn test_no_elevation_runs_directly() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("UNIFW_NO_ELEVATION", "1");
        }

        let cmd = create_elevated_command("ufw", &argv(&["status", "numbered"])).unwrap();
        assert_eq!(cmd.as_std().get_program(), "ufw");

        unsafe {
            std::env::remove_var("UNIFW_NO_ELEVATION");
        }
    }

    #[test]
    fn test_invalid_elevation_method() {
        if nix::unistd::getuid().is_root() {
            // Root short-circuits before the method override is read
            return;
        }
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::remove_var("UNIFW_NO_ELEVATION");
            std::env::set_var("UNIFW_ELEVATION_METHOD", "invalid_method");
        }

        let result = create_elevated_command("nft", &argv(&["list", "ruleset"]));

        unsafe {
            std::env::remove_var("UNIFW_ELEVATION_METHOD");
        }

        assert!(matches!(result, Err(ElevationError::InvalidMethod(_))));
    }

    #[test]
    fn test_elevation_method_case_insensitive() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::remove_var("UNIFW_NO_ELEVATION");
            std::env::set_var("UNIFW_ELEVATION_METHOD", "SUDO");
        }

        let result = create_elevated_command("nft", &argv(&["list", "ruleset"]));

        unsafe {
            std::env::remove_var("UNIFW_ELEVATION_METHOD");
        }

        // Succeeds when sudo exists, MethodNotAvailable otherwise, never InvalidMethod
        assert!(!matches!(result, Err(ElevationError::InvalidMethod(_))));
    }
}
