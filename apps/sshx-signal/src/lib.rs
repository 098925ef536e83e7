//! Mailbox relay used by sshx peers to exchange negotiation messages.

pub mod config;
pub mod handlers;
pub mod mailbox;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use mailbox::{Mailbox, MailboxError};

pub fn router(mailbox: Mailbox) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/push/:identity", post(handlers::push))
        .route("/pull/:identity", get(handlers::pull))
        .with_state(mailbox)
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, config: &Config) -> std::io::Result<()> {
    axum::serve(listener, router(Mailbox::new(config))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use sshx_proto::{Direction, PoolId, SignalingMessage};
    use std::time::Duration;
    use tower::ServiceExt;

    fn fast_config() -> Config {
        Config {
            pull_timeout: Duration::from_millis(50),
            ..Config::default()
        }
    }

    fn push_request(identity: &str, body: Vec<u8>) -> Request<Body> {
        Request::post(format!("/push/{identity}"))
            .header("content-type", handlers::CONTENT_TYPE)
            .body(Body::from(body))
            .unwrap()
    }

    async fn pull_message(app: Router, identity: &str) -> SignalingMessage {
        let response = app
            .oneshot(
                Request::get(format!("/pull/{identity}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            handlers::CONTENT_TYPE
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        sshx_proto::decode(&body).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn pushed_message_is_pulled_by_target() {
        let app = router(Mailbox::new(&fast_config()));
        let offer = SignalingMessage::offer(
            PoolId::new(0, 7, Direction::Outbound),
            "A",
            "B",
            "v=0".into(),
            0,
        );
        let response = app
            .clone()
            .oneshot(push_request("B", sshx_proto::encode(&offer).unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(pull_message(app.clone(), "B").await, offer);
        assert!(pull_message(app, "B").await.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_and_invalid_pushes_are_rejected() {
        let mailbox = Mailbox::new(&fast_config());
        let app = router(mailbox.clone());

        let response = app
            .clone()
            .oneshot(push_request("B", vec![0xde, 0xad]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let anonymous = SignalingMessage::candidate(
            PoolId::new(0, 7, Direction::Outbound),
            "",
            "B",
            Vec::new(),
        );
        let response = app
            .oneshot(push_request("B", sshx_proto::encode(&anonymous).unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!mailbox.contains("B"), "rejected pushes must not open a queue");
    }
}
