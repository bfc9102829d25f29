//! Bridge to the orchestration engine through an external command
//!
//! The configured executable is invoked once per operation:
//!
//! ```text
//! <command> <args...> redeploy --keypath <KP> [--dry-run] [--no-networking] [--reconcile]
//! <command> <args...> list-services --path <TYPE_PATH>
//! <command> <args...> modified-services --keypath <KP>
//! ```
//!
//! On success it exits 0 and prints JSON on stdout: a list of
//! `{"device": ..., "output": ...}` objects for `redeploy`, a list of
//! keypath strings for the other two. On failure it exits non-zero and the
//! trimmed stderr becomes the error text.

use crate::paths;
use crate::schema::BackendConfig;
use anyhow::{Result, bail};
use bulkops::{BackendError, DeviceOutput, OPERATION_TIMEOUT, RedeployRequest, ServiceBackend};
use serde::de::DeserializeOwned;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// [`ServiceBackend`] backed by an operator-supplied bridge executable
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: PathBuf,
    args: Vec<String>,
    /// Limit for discovery calls; redeploys use the request's own timeout
    discovery_timeout: Duration,
}

impl CommandBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        if config.command.trim().is_empty() {
            bail!("No backend configured. Set `command` under [backend] in config.toml");
        }
        Ok(Self {
            program: paths::expand(&config.command),
            args: config.args.clone(),
            discovery_timeout: OPERATION_TIMEOUT,
        })
    }

    fn invoke<T: DeserializeOwned>(
        &self,
        subject: &str,
        extra: &[&str],
        timeout: Duration,
    ) -> Result<T, BackendError> {
        log::debug!("{} {} {}", self.program.display(), self.args.join(" "), extra.join(" "));

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BackendError::Unavailable(format!("{}: {e}", self.program.display()))
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = wait_with_deadline(&mut child, timeout).map_err(|e| {
            BackendError::Unavailable(format!("{}: {e}", self.program.display()))
        })?;

        let Some(status) = status else {
            return Err(BackendError::Timeout {
                keypath: subject.to_string(),
                after: timeout,
            });
        };

        let stdout = join_output(stdout);
        let stderr = join_output(stderr);

        if !status.success() {
            let message = stderr.trim();
            return Err(BackendError::failed(if message.is_empty() {
                format!("bridge exited with {status}")
            } else {
                message.to_string()
            }));
        }

        serde_json::from_str(stdout.trim())
            .map_err(|e| BackendError::InvalidResponse(format!("{subject}: {e}")))
    }
}

impl ServiceBackend for CommandBackend {
    fn redeploy(
        &self,
        keypath: &str,
        request: &RedeployRequest,
    ) -> Result<Vec<DeviceOutput>, BackendError> {
        let mut extra = vec!["redeploy", "--keypath", keypath];
        if request.dry_run {
            extra.push("--dry-run");
        }
        if request.no_networking {
            extra.push("--no-networking");
        }
        if request.reconcile {
            extra.push("--reconcile");
        }
        self.invoke(keypath, &extra, request.timeout)
    }

    fn list_services(&self, type_path: &str) -> Result<Vec<String>, BackendError> {
        self.invoke(
            type_path,
            &["list-services", "--path", type_path],
            self.discovery_timeout,
        )
    }

    fn modified_services(&self, keypath: &str) -> Result<Vec<String>, BackendError> {
        self.invoke(
            keypath,
            &["modified-services", "--keypath", keypath],
            self.discovery_timeout,
        )
    }
}

/// Read a pipe to the end on a helper thread
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_output(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Poll the child until it exits or the deadline passes
///
/// Returns `Ok(None)` after killing a child that ran past the deadline.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use bulkops::CommitFlags;

    const BRIDGE: &str = r#"
        while [ $# -gt 0 ]; do
            case "$1" in
                redeploy) op=redeploy ;;
                list-services) op=list ;;
                modified-services) op=modified ;;
                --dry-run) dry=1 ;;
                --keypath|--path) shift; subject="$1" ;;
            esac
            shift
        done
        case "$op" in
            redeploy)
                if [ "$subject" = "/bad" ]; then echo "commit failed: device locked" >&2; exit 2; fi
                if [ "$subject" = "/slow" ]; then sleep 5; fi
                if [ "$subject" = "/garbage" ]; then echo "not json"; exit 0; fi
                if [ -n "$dry" ]; then
                    echo '[{"device":"ce0","output":"+ mtu 9000"}]'
                else
                    echo '[]'
                fi ;;
            list) echo '["/services/vpn{a}", "/services/vpn{b}"]' ;;
            modified) echo '[]' ;;
        esac
    "#;

    fn backend() -> CommandBackend {
        CommandBackend::from_config(&BackendConfig {
            command: "sh".into(),
            args: vec!["-c".into(), BRIDGE.into(), "bridge".into()],
        })
        .unwrap()
    }

    fn request(dry_run: bool) -> RedeployRequest {
        let flags = if dry_run {
            CommitFlags::default()
        } else {
            CommitFlags::commit()
        };
        RedeployRequest::new(flags, false)
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(CommandBackend::from_config(&BackendConfig::default()).is_err());
    }

    #[test]
    fn test_redeploy_dry_run_parses_devices() {
        let outputs = backend().redeploy("/ok", &request(true)).unwrap();
        assert_eq!(outputs, vec![DeviceOutput::new("ce0", "+ mtu 9000")]);
        assert!(backend().redeploy("/ok", &request(false)).unwrap().is_empty());
    }

    #[test]
    fn test_failure_uses_stderr() {
        let err = backend().redeploy("/bad", &request(false)).unwrap_err();
        assert_eq!(err, BackendError::failed("commit failed: device locked"));
    }

    #[test]
    fn test_timeout_kills_bridge() {
        let mut req = request(true);
        req.timeout = Duration::from_millis(200);
        let started = Instant::now();
        let err = backend().redeploy("/slow", &req).unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let err = backend().redeploy("/garbage", &request(true)).unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[test]
    fn test_discovery_calls() {
        let services = backend().list_services("/services/vpn").unwrap();
        assert_eq!(services, vec!["/services/vpn{a}", "/services/vpn{b}"]);
        assert!(backend().modified_services("/services/vpn{a}").unwrap().is_empty());
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let backend = CommandBackend::from_config(&BackendConfig {
            command: "/nonexistent/bsa-bridge".into(),
            args: Vec::new(),
        })
        .unwrap();
        let err = backend.list_services("/x").unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
