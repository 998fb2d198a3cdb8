use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mqlab_cloud::{wait_for, Backoff, CloudClient, WaitError};
use mqlab_domain::{CommandResult, CommandStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExecError;

/// Submits shell payloads to hosts through the asynchronous control plane
/// and polls them to a terminal status. One instance is shared by every
/// caller; concurrent `run` calls are independent apart from the underlying
/// client, which is safe for concurrent use.
pub struct Executor {
    cloud: Arc<CloudClient>,
    /// When set, every submitted payload is also written here for
    /// post-mortem (`cmd-<n>-<host>.json`).
    manifest_dir: Option<PathBuf>,
    manifest_seq: AtomicU64,
}

impl Executor {
    pub fn new(cloud: Arc<CloudClient>) -> Self {
        Self {
            cloud,
            manifest_dir: None,
            manifest_seq: AtomicU64::new(0),
        }
    }

    pub fn with_manifest_dir(mut self, dir: PathBuf) -> Self {
        self.manifest_dir = Some(dir);
        self
    }

    /// Run a shell payload on `host`, polling to a terminal status.
    ///
    /// Returns the command output on `Success`. Any other terminal status is
    /// an `ExecutionFailed` error carrying stderr and the terminal kind. If
    /// the wall-clock deadline passes, the remote command is cancelled
    /// best-effort and `DeadlineExceeded` is returned; the call never
    /// outlives the deadline by more than one polling interval.
    pub async fn run(
        &self,
        host: &str,
        payload: &[String],
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, ExecError> {
        self.write_manifest(host, payload, deadline);

        let started = Instant::now();
        let command_id = self
            .cloud
            .send_command(host, payload, deadline.as_secs().max(30))
            .await?;
        debug!(host, command_id, "command submitted");

        let label = format!("command {} on {}", command_id, host);
        let remaining = deadline.saturating_sub(started.elapsed());
        let outcome = wait_for(&label, Backoff::poll(), remaining, cancel, || {
            let cloud = &self.cloud;
            let command_id = command_id.as_str();
            async move {
                match cloud.get_invocation(command_id, host).await {
                    Ok(inv) => Ok(inv.status.is_terminal().then_some(inv)),
                    // Transient network trouble on a poll is "not yet";
                    // the deadline bounds how long we keep trying.
                    Err(e @ mqlab_cloud::CloudError::Http { .. }) => {
                        debug!(command_id, error = %e, "poll failed; retrying");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await;

        let invocation = match outcome {
            Ok(inv) => inv,
            Err(WaitError::TimedOut { .. }) => {
                self.cancel_remote(&command_id).await;
                return Err(ExecError::DeadlineExceeded {
                    host: host.to_string(),
                    deadline,
                });
            }
            Err(WaitError::Cancelled { .. }) => {
                self.cancel_remote(&command_id).await;
                return Err(ExecError::Cancelled { host: host.to_string() });
            }
            Err(WaitError::Aborted { source, .. }) => return Err(ExecError::Cloud(source)),
        };

        match invocation.status {
            CommandStatus::Success => Ok(CommandResult {
                status: CommandStatus::Success,
                stdout: invocation.stdout,
                stderr: invocation.stderr,
                exit_code: invocation.exit_code,
            }),
            kind => Err(ExecError::ExecutionFailed {
                host: host.to_string(),
                kind,
                stderr: invocation.stderr,
            }),
        }
    }

    /// Best-effort cancel; the remote side may continue briefly.
    async fn cancel_remote(&self, command_id: &str) {
        if let Err(e) = self.cloud.cancel_command(command_id).await {
            warn!(command_id, error = %e, "could not cancel remote command");
        }
    }

    fn write_manifest(&self, host: &str, payload: &[String], deadline: Duration) {
        let Some(dir) = &self.manifest_dir else { return };
        let seq = self.manifest_seq.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("cmd-{:04}-{}.json", seq, host));
        let doc = serde_json::json!({
            "host": host,
            "commands": payload,
            "deadline_secs": deadline.as_secs(),
        });
        if let Err(e) = std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap_or_default())
        {
            warn!(path = %path.display(), error = %e, "could not write command manifest");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqlab_cloud::{BaseUrls, StaticCredentials};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_executor(server: &MockServer) -> Executor {
        let cloud = CloudClient::with_endpoints(
            "us-east-1",
            BaseUrls {
                ec2: format!("{}/ec2", server.uri()),
                ssm: format!("{}/ssm", server.uri()),
            },
            StaticCredentials {
                access_key_id: "AKID".into(),
                secret_access_key: "SECRET".into(),
                session_token: None,
            },
        );
        Executor::new(Arc::new(cloud))
    }

    fn mock_send(server: &MockServer) -> impl std::future::Future<Output = ()> + '_ {
        Mock::given(method("POST"))
            .and(path("/ssm/"))
            .and(header("X-Amz-Target", "AmazonSSM.SendCommand"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Command": { "CommandId": "cmd-42" }
            })))
            .mount(server)
    }

    fn invocation_body(status: &str, stdout: &str, code: i32) -> serde_json::Value {
        serde_json::json!({
            "Status": status,
            "StandardOutputContent": stdout,
            "StandardErrorContent": "",
            "ResponseCode": code
        })
    }

    #[tokio::test]
    async fn run_returns_output_on_success() {
        let server = MockServer::start().await;
        mock_send(&server).await;
        Mock::given(method("POST"))
            .and(path("/ssm/"))
            .and(header("X-Amz-Target", "AmazonSSM.GetCommandInvocation"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(invocation_body("Success", "hello", 0)),
            )
            .mount(&server)
            .await;

        let executor = test_executor(&server);
        let cancel = CancellationToken::new();
        let result = executor
            .run("i-0aaa", &["echo hello".into()], Duration::from_secs(60), &cancel)
            .await
            .unwrap();
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn run_maps_failed_terminal_status() {
        let server = MockServer::start().await;
        mock_send(&server).await;
        Mock::given(method("POST"))
            .and(path("/ssm/"))
            .and(header("X-Amz-Target", "AmazonSSM.GetCommandInvocation"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Status": "Failed",
                "StandardOutputContent": "",
                "StandardErrorContent": "no such unit",
                "ResponseCode": 1
            })))
            .mount(&server)
            .await;

        let executor = test_executor(&server);
        let cancel = CancellationToken::new();
        let err = executor
            .run("i-0aaa", &["systemctl start nope".into()], Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        match err {
            ExecError::ExecutionFailed { kind, stderr, .. } => {
                assert_eq!(kind, CommandStatus::Failed);
                assert_eq!(stderr, "no such unit");
            }
            other => panic!("expected ExecutionFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn run_cancels_remote_on_deadline() {
        let server = MockServer::start().await;
        mock_send(&server).await;
        // Command never leaves InProgress.
        Mock::given(method("POST"))
            .and(path("/ssm/"))
            .and(header("X-Amz-Target", "AmazonSSM.GetCommandInvocation"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(invocation_body("InProgress", "", -1)),
            )
            .mount(&server)
            .await;
        let cancel_mock = Mock::given(method("POST"))
            .and(path("/ssm/"))
            .and(header("X-Amz-Target", "AmazonSSM.CancelCommand"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1);
        cancel_mock.mount(&server).await;

        let executor = test_executor(&server);
        let cancel = CancellationToken::new();
        // Deadline shorter than the first poll delay: the wait gives up
        // before sleeping, so this test runs in milliseconds.
        let err = executor
            .run("i-0aaa", &["sleep 600".into()], Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::DeadlineExceeded { .. }));
    }

    #[tokio::test]
    async fn run_maps_upstream_cancellation() {
        let server = MockServer::start().await;
        mock_send(&server).await;
        Mock::given(method("POST"))
            .and(path("/ssm/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let executor = test_executor(&server);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor
            .run("i-0aaa", &["sleep 600".into()], Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn manifests_capture_submitted_payloads() {
        let server = MockServer::start().await;
        mock_send(&server).await;
        Mock::given(method("POST"))
            .and(path("/ssm/"))
            .and(header("X-Amz-Target", "AmazonSSM.GetCommandInvocation"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(invocation_body("Success", "", 0)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let executor = test_executor(&server).with_manifest_dir(dir.path().to_path_buf());
        let cancel = CancellationToken::new();
        executor
            .run("i-0aaa", &["true".into()], Duration::from_secs(60), &cancel)
            .await
            .unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content =
            std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert!(content.contains("\"host\": \"i-0aaa\""));
    }
}
