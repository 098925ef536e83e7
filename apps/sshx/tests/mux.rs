mod common;

use sshx_core::Node;
use sshx_core::adapter::forward::ForwardState;
use sshx_core::client::ClientError;
use sshx_proto::{Envelope, OperationCode, STATUS_FAILED, app};

#[test_timeout::tokio_timeout_test]
async fn stat_on_an_idle_node_is_empty() {
    let relay = common::start_relay().await;
    let node = Node::start(&common::node_config("idle", &relay, 22)).await.unwrap();

    let stats = node.client().stat().await.unwrap();
    assert!(stats.is_empty());

    node.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn unknown_application_is_rejected() {
    let relay = common::start_relay().await;
    let node = Node::start(&common::node_config("strict", &relay, 22)).await.unwrap();

    let err = node
        .client()
        .request(&Envelope::request(app::VNC, OperationCode::Up))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rejected { status: STATUS_FAILED, .. }));

    node.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn down_and_attach_need_a_known_pair() {
    let relay = common::start_relay().await;
    let node = Node::start(&common::node_config("lonely", &relay, 22)).await.unwrap();
    let client = node.client();

    let err = client.down("conn_0_12345_1", app::SSH).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { status: STATUS_FAILED, .. }));

    let attach = Envelope::request(app::SSH, OperationCode::Attach).with_pair_id("conn_0_12345_1");
    assert!(matches!(
        client.open(&attach).await,
        Err(ClientError::Rejected { status: STATUS_FAILED, .. })
    ));

    node.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn up_without_a_target_fails() {
    let relay = common::start_relay().await;
    let node = Node::start(&common::node_config("aimless", &relay, 22)).await.unwrap();

    let payload = ForwardState::to("").encode().unwrap();
    let request = Envelope::request(app::SSH, OperationCode::Up).with_payload(payload);
    let err = node.client().request(&request).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { status: STATUS_FAILED, .. }));
    assert!(node.pool().is_empty());

    node.shutdown().await;
}
