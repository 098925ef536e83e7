mod common;

use std::time::Duration;

use sshx_core::Node;
use sshx_core::adapter::forward::ForwardState;
use sshx_core::client::{ClientError, MuxClient};
use sshx_proto::{Envelope, OperationCode, STATUS_FAILED, app};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn ssh_up(target: &str) -> Envelope {
    let payload = ForwardState::to(target).encode().unwrap();
    Envelope::request(app::SSH, OperationCode::Up).with_payload(payload)
}

/// Starts a responder backed by an echo sshd and an initiator linked to it.
async fn linked_nodes(initiator_id: &str, responder_id: &str) -> (Node, Node) {
    let relay = common::start_relay().await;
    let sshd = common::echo_server().await;
    let responder = Node::start(&common::node_config(responder_id, &relay, sshd)).await.unwrap();
    let mut config = common::node_config(initiator_id, &relay, 22);
    common::link(&mut config, responder_id, responder.direct_addr());
    let initiator = Node::start(&config).await.unwrap();
    (initiator, responder)
}

/// Waits for the first pair a detached request registered.
async fn detached_pair_id(client: MuxClient) -> String {
    for _ in 0..100 {
        if let Some(status) = client.stat().await.unwrap().into_iter().next() {
            return status.pair_id;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("detached tunnel never registered");
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn direct_link_carries_bytes_and_tears_down_both_ends() {
    let relay = common::start_relay().await;
    let sshd = common::echo_server().await;

    let responder = Node::start(&common::node_config("node-b", &relay, sshd)).await.unwrap();
    let mut config = common::node_config("node-a", &relay, 22);
    common::link(&mut config, "node-b", responder.direct_addr());
    let initiator = Node::start(&config).await.unwrap();

    let payload = ForwardState::to("node-b").encode().unwrap();
    let request = Envelope::request(app::SSH, OperationCode::Up).with_payload(payload);
    let (reply, mut tunnel) = initiator.client().open(&request).await.unwrap();
    assert!(reply.is_ok());
    assert!(reply.pair_id.starts_with("conn_0_"));
    assert!(reply.pair_id.ends_with("_1"));

    tunnel.write_all(b"SSH-2.0-direct\r\n").await.unwrap();
    let mut echoed = [0u8; 16];
    tunnel.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"SSH-2.0-direct\r\n");

    let expected_remote = format!("{}0", reply.pair_id.strip_suffix('1').unwrap());
    let expected_remote = expected_remote.as_str();
    let responder_client = responder.client();
    assert!(
        common::eventually(50, || async move {
            responder_client.stat().await.is_ok_and(|stats| {
                stats.len() == 1
                    && stats[0].pair_id == expected_remote
                    && stats[0].target_id == "node-a"
            })
        })
        .await
    );

    let local_stats = initiator.client().stat().await.unwrap();
    assert_eq!(local_stats.len(), 1);
    assert_eq!(local_stats[0].target_id, "node-b");

    initiator.client().down(&reply.pair_id, app::SSH).await.unwrap();
    assert!(initiator.pool().is_empty());
    assert!(
        common::eventually(50, || async move {
            responder_client.stat().await.is_ok_and(|stats| stats.is_empty())
        })
        .await
    );

    initiator.shutdown().await;
    responder.shutdown().await;
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn attach_binds_a_console_to_a_detached_tunnel() {
    let (initiator, responder) = linked_nodes("attach-a", "attach-b").await;
    let client = initiator.client();

    client.send_detached(ssh_up("attach-b")).await.unwrap();
    let pair_id = detached_pair_id(client).await;
    assert!(pair_id.ends_with("_1"));

    let attach = Envelope::request(app::SSH, OperationCode::Attach).with_pair_id(pair_id.clone());
    let (reply, mut console) = client.open(&attach).await.unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.pair_id, pair_id);

    console.write_all(b"SSH-2.0-attached\r\n").await.unwrap();
    let mut echoed = [0u8; 18];
    console.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"SSH-2.0-attached\r\n");

    initiator.shutdown().await;
    responder.shutdown().await;
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn down_for_another_application_keeps_the_pair() {
    let (initiator, responder) = linked_nodes("mismatch-a", "mismatch-b").await;
    let client = initiator.client();

    let (reply, mut tunnel) = client.open(&ssh_up("mismatch-b")).await.unwrap();
    assert!(reply.is_ok());

    let err = client.down(&reply.pair_id, app::PROXY).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { status: STATUS_FAILED, .. }));

    let stats = client.stat().await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].pair_id, reply.pair_id);
    assert!(initiator.pool().get_pair(&reply.pair_id).is_some());

    tunnel.write_all(b"still up").await.unwrap();
    let mut echoed = [0u8; 8];
    tunnel.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"still up");

    client.down(&reply.pair_id, app::SSH).await.unwrap();
    assert!(initiator.pool().is_empty());

    initiator.shutdown().await;
    responder.shutdown().await;
}
