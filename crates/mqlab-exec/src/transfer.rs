use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ExecError;
use crate::executor::Executor;

/// Largest base64 payload shipped in one command; bounded by the control
/// plane's parameter size limit with headroom for the wrapping script.
const CHUNK_B64_BYTES: usize = 24_576;

/// Raw bytes per chunk so the encoded chunk stays under the budget.
const CHUNK_RAW_BYTES: usize = CHUNK_B64_BYTES / 4 * 3;

/// Deadline for each individual transfer command.
const CHUNK_DEADLINE: Duration = Duration::from_secs(120);

impl Executor {
    /// Write `bytes` to `dest` on the host. Files beyond the per-command
    /// payload budget are split into sequential append commands.
    pub async fn upload(
        &self,
        host: &str,
        dest: &str,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            vec![&[]]
        } else {
            bytes.chunks(CHUNK_RAW_BYTES).collect()
        };
        debug!(host, dest, size = bytes.len(), chunks = chunks.len(), "uploading file");

        for (i, chunk) in chunks.iter().enumerate() {
            let encoded = wrap_base64(&BASE64.encode(chunk));
            let redirect = if i == 0 { ">" } else { ">>" };
            let mut commands = Vec::new();
            if i == 0 {
                commands.push(format!("install -d \"$(dirname '{}')\"", dest));
            }
            commands.push(format!(
                "base64 -d {} '{}' << 'MQLAB_EOF'\n{}\nMQLAB_EOF",
                redirect, dest, encoded
            ));
            self.run(host, &commands, CHUNK_DEADLINE, cancel).await?;
        }
        Ok(())
    }

    /// Read a remote file; the host emits it base64-encoded on stdout.
    pub async fn download(
        &self,
        host: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ExecError> {
        let commands = vec![format!("base64 '{}'", path)];
        let result = self.run(host, &commands, CHUNK_DEADLINE, cancel).await?;

        let compact: String = result
            .stdout
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        BASE64.decode(compact.as_bytes()).map_err(|e| ExecError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
    }
}

/// Line-wrap a base64 string for here-doc hygiene.
fn wrap_base64(encoded: &str) -> String {
    encoded
        .as_bytes()
        .chunks(76)
        .map(|line| std::str::from_utf8(line).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\n")
}
