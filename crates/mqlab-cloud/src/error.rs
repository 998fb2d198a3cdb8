use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("{service} request failed: {code} — {message}")]
    Api {
        service: &'static str,
        code: String,
        message: String,
    },

    #[error("http error calling {url}: {message}")]
    Http { url: String, message: String },

    #[error("malformed {service} response: missing {field}")]
    MissingField {
        service: &'static str,
        field: &'static str,
    },

    #[error("provisioner failed: {0}")]
    ProvisionerFailed(String),

    #[error("provisioner destroy failed: {0}")]
    DestroyFailed(String),

    #[error("internal cloud error: {0}")]
    Internal(String),
}

impl CloudError {
    /// Provider throttling; callers retry these with backoff.
    pub fn is_throttle(&self) -> bool {
        match self {
            CloudError::Api { code, .. } => matches!(
                code.as_str(),
                "Throttling" | "RequestLimitExceeded" | "TooManyRequestsException"
            ),
            _ => false,
        }
    }

    /// "Already gone" responses that deletion paths treat as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            CloudError::Api { code, .. } => {
                code.contains("NotFound") || code.contains(".Malformed")
            }
            _ => false,
        }
    }
}
