use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use mqlab_domain::{Fleet, Host, Role};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::CloudError;

/// Hard ceiling on any provisioner invocation. Apply of a full cluster sits
/// well under this; beyond it the subprocess is killed.
const RUN_LIMIT: Duration = Duration::from_secs(1800);

/// Drives the external infrastructure provisioner as a black-box subprocess.
///
/// The orchestrator hands it a generated variables document and consumes only
/// its final `output -json` document; stdout/stderr are streamed line-buffered
/// into the experiment log, never parsed.
pub struct Provisioner {
    /// Binary name. Default `terraform`; anything speaking the same CLI works.
    pub binary: String,
    /// Module directory containing the cluster definition.
    pub module_dir: PathBuf,
    /// Experiment log file; subprocess output is appended here line by line.
    pub log_path: Option<PathBuf>,
}

impl Provisioner {
    pub fn new(module_dir: PathBuf, log_path: Option<PathBuf>) -> Self {
        Self {
            binary: "terraform".into(),
            module_dir,
            log_path,
        }
    }

    /// `init` + `apply` with the generated variables document.
    pub async fn apply(&self, var_file: &Path) -> Result<(), CloudError> {
        let (code, _) = self
            .run(&["init", "-input=false", "-no-color"])
            .await
            .map_err(|e| CloudError::ProvisionerFailed(format!("init: {}", e)))?;
        if code != 0 {
            return Err(CloudError::ProvisionerFailed(format!(
                "init exited with code {}",
                code
            )));
        }

        let var_arg = format!("-var-file={}", var_file.display());
        let (code, _) = self
            .run(&["apply", "-auto-approve", "-input=false", "-no-color", &var_arg])
            .await
            .map_err(|e| CloudError::ProvisionerFailed(format!("apply: {}", e)))?;
        if code != 0 {
            return Err(CloudError::ProvisionerFailed(format!(
                "apply exited with code {}",
                code
            )));
        }
        Ok(())
    }

    /// `destroy` with the same variables document. Failure here is reported
    /// but never fatal to cleanup; the tag sweep is the final authority.
    pub async fn destroy(&self, var_file: &Path) -> Result<(), CloudError> {
        let var_arg = format!("-var-file={}", var_file.display());
        let (code, _) = self
            .run(&["destroy", "-auto-approve", "-input=false", "-no-color", &var_arg])
            .await
            .map_err(|e| CloudError::DestroyFailed(e.to_string()))?;
        if code != 0 {
            return Err(CloudError::DestroyFailed(format!(
                "destroy exited with code {}",
                code
            )));
        }
        Ok(())
    }

    /// Read the provisioner's output document and convert it to a fleet.
    pub async fn fleet(&self) -> Result<Fleet, CloudError> {
        let (code, out) = self
            .run(&["output", "-json", "-no-color"])
            .await
            .map_err(|e| CloudError::ProvisionerFailed(format!("output: {}", e)))?;
        if code != 0 {
            return Err(CloudError::ProvisionerFailed(format!(
                "output exited with code {}",
                code
            )));
        }
        let doc: Value = serde_json::from_str(out.trim())
            .map_err(|e| CloudError::ProvisionerFailed(format!("parse output document: {}", e)))?;
        parse_fleet(&doc)
    }

    /// Run one provisioner sub-command. Both output streams drain into a
    /// shared sink that appends each line to the experiment log as it
    /// arrives; the whole invocation is bounded by `RUN_LIMIT`. Returns
    /// (exit_code, combined_output).
    async fn run(&self, args: &[&str]) -> Result<(i32, String), CloudError> {
        info!(binary = %self.binary, ?args, dir = %self.module_dir.display(), "running provisioner");

        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.module_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .spawn()
            .map_err(|e| CloudError::Internal(format!("spawn {}: {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CloudError::Internal("stdout not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CloudError::Internal("stderr not piped".into()))?;

        let sink = Mutex::new(LogSink {
            file: self.open_log()?,
            collected: String::new(),
        });

        // Drain both streams side by side, then reap the child; one timer
        // covers the whole invocation.
        let mut exit = None;
        tokio::select! {
            status = async {
                tokio::join!(drain_lines(stdout, &sink), drain_lines(stderr, &sink));
                child.wait().await
            } => {
                exit = Some(status.map_err(|e| {
                    CloudError::Internal(format!("wait {}: {}", self.binary, e))
                })?);
            }
            _ = tokio::time::sleep(RUN_LIMIT) => {}
        }

        let Some(status) = exit else {
            let _ = child.kill().await;
            return Err(CloudError::ProvisionerFailed(format!(
                "{} {} exceeded the {}-minute ceiling",
                self.binary,
                args.first().copied().unwrap_or(""),
                RUN_LIMIT.as_secs() / 60,
            )));
        };

        let code = status.code().unwrap_or(-1);
        if code != 0 {
            warn!(binary = %self.binary, code, "provisioner exited non-zero");
        }
        let combined = sink.into_inner().map(|s| s.collected).unwrap_or_default();
        Ok((code, combined))
    }

    fn open_log(&self) -> Result<Option<std::fs::File>, CloudError> {
        let Some(path) = &self.log_path else {
            return Ok(None);
        };
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Some)
            .map_err(|e| CloudError::Internal(format!("open log {}: {}", path.display(), e)))
    }
}

/// Where provisioner output goes: the experiment log (line-buffered, as
/// lines arrive), the process log, and the combined string handed back to
/// the caller.
struct LogSink {
    file: Option<std::fs::File>,
    collected: String,
}

impl LogSink {
    fn line(&mut self, line: &str) {
        debug!(target: "mqlab::provisioner", "{}", line);
        if let Some(file) = &mut self.file {
            let _ = writeln!(file, "{}", line);
        }
        self.collected.push_str(line);
        self.collected.push('\n');
    }
}

/// Feed one output stream into the sink, line by line. The lock is held
/// only for the synchronous append, never across an await.
async fn drain_lines<R: AsyncRead + Unpin>(stream: R, sink: &Mutex<LogSink>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut sink) = sink.lock() {
            sink.line(&line);
        }
    }
}

/// Extract the per-role host lists from the provisioner output document.
/// Contract: for each role, an output `<role>_hosts` whose value is a list
/// of `{ "id": ..., "private_ip": ... }`.
fn parse_fleet(doc: &Value) -> Result<Fleet, CloudError> {
    let mut hosts = Vec::new();
    for role in Role::ALL {
        let key = format!("{}_hosts", role);
        let list = doc
            .get(&key)
            .and_then(|v| v.get("value"))
            .and_then(|v| v.as_array())
            .ok_or(CloudError::MissingField {
                service: "provisioner",
                field: "role host list",
            })?;
        for entry in list {
            let id = entry["id"].as_str().ok_or(CloudError::MissingField {
                service: "provisioner",
                field: "host id",
            })?;
            let private_ip = entry["private_ip"].as_str().ok_or(CloudError::MissingField {
                service: "provisioner",
                field: "host private_ip",
            })?;
            hosts.push(Host {
                id: id.to_string(),
                private_ip: private_ip.to_string(),
                role,
            });
        }
    }
    Ok(Fleet { hosts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output_doc() -> Value {
        json!({
            "coordinator_hosts": { "value": [ { "id": "i-0c", "private_ip": "10.0.0.1" } ] },
            "storage_hosts":     { "value": [ { "id": "i-0s", "private_ip": "10.0.0.2" } ] },
            "broker_hosts":      { "value": [ { "id": "i-0b", "private_ip": "10.0.0.3" } ] },
            "worker_hosts":      { "value": [ { "id": "i-0w", "private_ip": "10.0.0.4" },
                                              { "id": "i-1w", "private_ip": "10.0.0.5" } ] }
        })
    }

    #[test]
    fn parse_fleet_groups_hosts_by_role() {
        let fleet = parse_fleet(&output_doc()).unwrap();
        assert_eq!(fleet.hosts.len(), 5);
        assert_eq!(fleet.by_role(Role::Worker).count(), 2);
        assert_eq!(fleet.by_role(Role::Broker).next().unwrap().id, "i-0b");
    }

    #[test]
    fn parse_fleet_requires_every_role_key() {
        let mut doc = output_doc();
        doc.as_object_mut().unwrap().remove("broker_hosts");
        assert!(parse_fleet(&doc).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_streams_lines_into_log() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-provisioner");
        std::fs::write(&script, "#!/bin/sh\necho line-one\necho line-two >&2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let log = dir.path().join("orchestrator.log");
        let provisioner = Provisioner {
            binary: script.display().to_string(),
            module_dir: dir.path().to_path_buf(),
            log_path: Some(log.clone()),
        };

        let (code, combined) = provisioner.run(&["ignored"]).await.unwrap();
        assert_eq!(code, 0);
        assert!(combined.contains("line-one"));
        assert!(combined.contains("line-two"));

        let logged = std::fs::read_to_string(&log).unwrap();
        assert!(logged.contains("line-one"));
        assert!(logged.contains("line-two"));
    }
}
