use mqlab_domain::{CommandStatus, ExperimentId};
use serde_json::json;
use tracing::{debug, info};

use crate::client::CloudClient;
use crate::error::CloudError;

/// Document executed for every submitted payload; commands are plain shell.
const RUN_DOCUMENT: &str = "AWS-RunShellScript";

/// One poll of a submitted command.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CloudClient {
    /// Submit a shell payload to one host. Returns the command id used for
    /// subsequent status polls.
    pub async fn send_command(
        &self,
        instance_id: &str,
        commands: &[String],
        timeout_secs: u64,
    ) -> Result<String, CloudError> {
        debug!(instance_id, lines = commands.len(), "control plane: SendCommand");
        let resp = self
            .json_api(
                "ssm",
                &self.base.ssm,
                "AmazonSSM.SendCommand",
                &json!({
                    "DocumentName": RUN_DOCUMENT,
                    "InstanceIds": [instance_id],
                    "Parameters": { "commands": commands },
                    "TimeoutSeconds": timeout_secs,
                }),
            )
            .await?;

        resp["Command"]["CommandId"]
            .as_str()
            .map(str::to_string)
            .ok_or(CloudError::MissingField {
                service: "ssm",
                field: "Command.CommandId",
            })
    }

    /// Fetch the current state of a submitted command on a host.
    pub async fn get_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<Invocation, CloudError> {
        let resp = self
            .json_api(
                "ssm",
                &self.base.ssm,
                "AmazonSSM.GetCommandInvocation",
                &json!({
                    "CommandId": command_id,
                    "InstanceId": instance_id,
                }),
            )
            .await?;

        let status_str = resp["Status"].as_str().ok_or(CloudError::MissingField {
            service: "ssm",
            field: "Status",
        })?;
        let status = CommandStatus::parse(status_str)
            .map_err(|e| CloudError::Internal(e.to_string()))?;

        Ok(Invocation {
            status,
            stdout: resp["StandardOutputContent"].as_str().unwrap_or("").to_string(),
            stderr: resp["StandardErrorContent"].as_str().unwrap_or("").to_string(),
            exit_code: resp["ResponseCode"].as_i64().unwrap_or(-1) as i32,
        })
    }

    /// Best-effort cancellation of an in-flight command.
    pub async fn cancel_command(&self, command_id: &str) -> Result<(), CloudError> {
        info!(command_id, "control plane: CancelCommand");
        self.json_api(
            "ssm",
            &self.base.ssm,
            "AmazonSSM.CancelCommand",
            &json!({ "CommandId": command_id }),
        )
        .await
        .map(|_| ())
    }

    /// Instance ids with an online control-plane agent, scoped to the
    /// experiment tag. Fresh hosts take a while to appear here.
    pub async fn online_agents(
        &self,
        experiment: &ExperimentId,
    ) -> Result<Vec<String>, CloudError> {
        let resp = self
            .json_api(
                "ssm",
                &self.base.ssm,
                "AmazonSSM.DescribeInstanceInformation",
                &json!({
                    "Filters": [{
                        "Key": "tag:ExperimentID",
                        "Values": [experiment.to_string()],
                    }],
                }),
            )
            .await?;

        let list = resp["InstanceInformationList"].as_array().cloned().unwrap_or_default();
        Ok(list
            .iter()
            .filter(|entry| entry["PingStatus"].as_str() == Some("Online"))
            .filter_map(|entry| entry["InstanceId"].as_str().map(str::to_string))
            .collect())
    }
}
