use std::time::Duration;

use reqwest::StatusCode;
use sshx_proto::{ProtoError, SignalingMessage};
use thiserror::Error;

const CONTENT_TYPE: &str = "application/binary";

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// HTTP client for the mailbox relay.
#[derive(Clone)]
pub struct SignalingClient {
    http: reqwest::Client,
    base: String,
}

impl SignalingClient {
    /// `request_timeout` must outlast the relay's long-poll window.
    pub fn new(base: &str, request_timeout: Duration) -> Result<Self, SignalingError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn push(&self, target: &str, message: &SignalingMessage) -> Result<(), SignalingError> {
        let body = sshx_proto::encode(message)?;
        let response = self
            .http
            .post(format!("{}/push/{target}", self.base))
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SignalingError::Status(response.status()));
        }
        Ok(())
    }

    /// Long-polls `identity`'s mailbox. `None` means the window passed with
    /// nothing queued.
    pub async fn pull(&self, identity: &str) -> Result<Option<SignalingMessage>, SignalingError> {
        let response = self
            .http
            .get(format!("{}/pull/{identity}", self.base))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SignalingError::Status(response.status()));
        }
        let body = response.bytes().await?;
        let message: SignalingMessage = sshx_proto::decode(&body)?;
        Ok((!message.is_empty()).then_some(message))
    }
}
