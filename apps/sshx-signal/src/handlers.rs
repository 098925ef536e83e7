use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use sshx_proto::SignalingMessage;
use tracing::{debug, error, warn};

use crate::mailbox::Mailbox;

pub const CONTENT_TYPE: &str = "application/binary";

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn push(
    State(mailbox): State<Mailbox>,
    Path(identity): Path<String>,
    body: Bytes,
) -> StatusCode {
    let message: SignalingMessage = match sshx_proto::decode(&body) {
        Ok(message) => message,
        Err(err) => {
            warn!(target = "relay", identity = %identity, error = %err, "rejecting undecodable push");
            return StatusCode::BAD_REQUEST;
        }
    };
    if let Err(err) = message.validate() {
        warn!(target = "relay", identity = %identity, error = %err, "rejecting invalid push");
        return StatusCode::BAD_REQUEST;
    }

    debug!(
        target = "relay",
        identity = %identity,
        source = %message.source,
        flag = ?message.flag,
        id = %message.id,
        "push"
    );
    if let Err(err) = mailbox.push(&identity, message) {
        warn!(target = "relay", error = %err, "dropping message");
    }
    StatusCode::OK
}

pub async fn pull(State(mailbox): State<Mailbox>, Path(identity): Path<String>) -> Response {
    let message = mailbox.pull(&identity).await.unwrap_or_default();
    match sshx_proto::encode(&message) {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(err) => {
            error!(target = "relay", identity = %identity, error = %err, "failed to encode pull response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
