//! Host firewall allowance for the listening port.
//!
//! Rules are managed by shelling out to the platform tool. Every command
//! runs under a hard timeout and any failure is reported to the caller,
//! which treats it as non-fatal.

use std::io;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::FirewallConfig;

/// Upper bound on a single firewall command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a running command is checked for completion.
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors from firewall rule management.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// No supported tool exists on this platform.
    #[error("firewall automation unsupported: {0}")]
    Unsupported(String),

    /// The tool could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The tool exited unsuccessfully.
    #[error("{program} exited with {status}")]
    Failed { program: String, status: String },

    /// The tool did not finish in time and was killed.
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Opens and closes inbound access to a TCP port.
pub trait Firewall: Send + Sync {
    /// Adds an inbound allow rule for `port`.
    fn allow(&self, port: u16) -> Result<(), FirewallError>;

    /// Removes the rule added by [`allow`](Self::allow).
    fn revoke(&self, port: u16) -> Result<(), FirewallError>;
}

/// [`Firewall`] that leaves the host configuration alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFirewall;

impl Firewall for NoopFirewall {
    fn allow(&self, _port: u16) -> Result<(), FirewallError> {
        Ok(())
    }

    fn revoke(&self, _port: u16) -> Result<(), FirewallError> {
        Ok(())
    }
}

/// [`Firewall`] using `netsh advfirewall` on Windows and `ufw` on Linux.
#[derive(Debug, Clone)]
pub struct SystemFirewall {
    rule_name: String,
}

impl SystemFirewall {
    /// Creates a firewall handle managing the rule `rule_name`.
    pub fn new(rule_name: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
        }
    }

    /// Returns the configured firewall, or [`NoopFirewall`] when disabled.
    pub fn from_config(config: &FirewallConfig) -> Box<dyn Firewall> {
        if config.enabled {
            Box::new(Self::new(config.rule_name.clone()))
        } else {
            Box::new(NoopFirewall)
        }
    }

    fn allow_command(&self, port: u16) -> Result<Command, FirewallError> {
        if cfg!(windows) {
            let mut cmd = Command::new("netsh");
            cmd.args(["advfirewall", "firewall", "add", "rule"])
                .arg(format!("name={}", self.rule_name))
                .args(["dir=in", "action=allow", "protocol=TCP"])
                .arg(format!("localport={}", port));
            Ok(cmd)
        } else if cfg!(target_os = "linux") {
            let mut cmd = ufw_command()?;
            cmd.arg("allow").arg(format!("{}/tcp", port));
            Ok(cmd)
        } else {
            Err(unsupported(port))
        }
    }

    fn revoke_command(&self, port: u16) -> Result<Command, FirewallError> {
        if cfg!(windows) {
            let mut cmd = Command::new("netsh");
            cmd.args(["advfirewall", "firewall", "delete", "rule"])
                .arg(format!("name={}", self.rule_name))
                .arg("protocol=TCP")
                .arg(format!("localport={}", port));
            Ok(cmd)
        } else if cfg!(target_os = "linux") {
            let mut cmd = ufw_command()?;
            cmd.args(["delete", "allow"]).arg(format!("{}/tcp", port));
            Ok(cmd)
        } else {
            Err(unsupported(port))
        }
    }
}

impl Firewall for SystemFirewall {
    fn allow(&self, port: u16) -> Result<(), FirewallError> {
        run_with_timeout(self.allow_command(port)?, COMMAND_TIMEOUT).map_err(privilege_hint)?;
        info!("Firewall rule added for TCP port {}", port);
        Ok(())
    }

    fn revoke(&self, port: u16) -> Result<(), FirewallError> {
        run_with_timeout(self.revoke_command(port)?, COMMAND_TIMEOUT).map_err(privilege_hint)?;
        info!("Firewall rule removed for TCP port {}", port);
        Ok(())
    }
}

/// Builds a `ufw` invocation, through `sudo -n` when sudo is installed.
///
/// `-n` makes sudo fail at once instead of prompting for a password.
fn ufw_command() -> Result<Command, FirewallError> {
    let ufw = which::which("ufw").map_err(|_| {
        FirewallError::Unsupported("ufw not found; add an inbound rule manually".to_string())
    })?;
    Ok(match which::which("sudo") {
        Ok(sudo) => {
            let mut cmd = Command::new(sudo);
            cmd.arg("-n").arg(ufw);
            cmd
        }
        Err(_) => Command::new(ufw),
    })
}

/// Notes the privilege requirement on a failed rule change.
fn privilege_hint(err: FirewallError) -> FirewallError {
    match err {
        FirewallError::Failed { program, status } if cfg!(target_os = "linux") => {
            FirewallError::Failed {
                program,
                status: format!("{}; ufw needs root or passwordless sudo", status),
            }
        }
        other => other,
    }
}

fn unsupported(port: u16) -> FirewallError {
    FirewallError::Unsupported(format!(
        "allow incoming connections on TCP port {} manually",
        port
    ))
}

/// Runs `cmd` to completion, killing it after `timeout`.
fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<(), FirewallError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!("Running firewall command: {:?}", cmd);

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| FirewallError::Spawn {
            program: program.clone(),
            source,
        })?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Ok(()),
            Ok(Some(status)) => {
                return Err(FirewallError::Failed {
                    program,
                    status: status.to_string(),
                })
            }
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(FirewallError::Timeout { program, timeout });
            }
            Ok(None) => thread::sleep(COMMAND_POLL_INTERVAL),
            Err(source) => return Err(FirewallError::Spawn { program, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_firewall() {
        assert!(NoopFirewall.allow(8080).is_ok());
        assert!(NoopFirewall.revoke(8080).is_ok());
    }

    #[test]
    fn test_from_config_disabled_is_noop() {
        let config = FirewallConfig {
            enabled: false,
            rule_name: "x".to_string(),
        };
        let firewall = SystemFirewall::from_config(&config);
        assert!(firewall.allow(1).is_ok());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let cmd = Command::new("definitely-not-a-firewall-tool-3f9a");
        assert!(matches!(
            run_with_timeout(cmd, Duration::from_secs(1)),
            Err(FirewallError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_program() {
        let cmd = Command::new("false");
        assert!(matches!(
            run_with_timeout(cmd, Duration::from_secs(5)),
            Err(FirewallError::Failed { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_succeeding_program() {
        assert!(run_with_timeout(Command::new("true"), Duration::from_secs(5)).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_program_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = Instant::now();
        assert!(matches!(
            run_with_timeout(cmd, Duration::from_millis(200)),
            Err(FirewallError::Timeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_commands_use_ufw_when_present() {
        let firewall = SystemFirewall::new("Render Stats");
        match firewall.allow_command(8080) {
            Ok(cmd) => {
                let args: Vec<_> = cmd
                    .get_args()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect();
                assert!(args.ends_with(&["allow".to_string(), "8080/tcp".to_string()]));
                if which::which("sudo").is_ok() {
                    assert_eq!(args[0], "-n");
                    assert!(args[1].ends_with("ufw"));
                }
            }
            Err(e) => assert!(matches!(e, FirewallError::Unsupported(_))),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_rule_change_mentions_privileges() {
        let err = privilege_hint(FirewallError::Failed {
            program: "sudo".to_string(),
            status: "exit status: 1".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "sudo exited with exit status: 1; ufw needs root or passwordless sudo"
        );

        let timeout = privilege_hint(FirewallError::Timeout {
            program: "ufw".to_string(),
            timeout: COMMAND_TIMEOUT,
        });
        assert!(matches!(timeout, FirewallError::Timeout { .. }));
    }
}
