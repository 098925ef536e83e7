//! Plain TCP forwarding to the remote peer's local sshd.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sshx_proto::{ProtoError, app};
use tokio::net::TcpStream;
use tracing::debug;

use super::{Adapter, AdapterBase, AdapterContext, AdapterError, AdapterFactory, decode_state};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardState {
    pub host_id: String,
    pub parent_id: Option<String>,
}

impl ForwardState {
    pub fn to(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            parent_id: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        sshx_proto::encode(self)
    }
}

pub struct ForwardAdapter {
    base: AdapterBase,
    local_port: u16,
}

impl ForwardAdapter {
    pub fn new(state: ForwardState, local_port: u16) -> Self {
        Self {
            base: AdapterBase::new(state.host_id, state.parent_id),
            local_port,
        }
    }
}

pub fn factory() -> AdapterFactory {
    Arc::new(|payload: &[u8], ctx: &AdapterContext| {
        let state: ForwardState = decode_state(payload)?;
        Ok(Arc::new(ForwardAdapter::new(state, ctx.local_ssh_port)) as Arc<dyn Adapter>)
    })
}

#[async_trait]
impl Adapter for ForwardAdapter {
    fn code(&self) -> i32 {
        app::SSH
    }

    fn base(&self) -> &AdapterBase {
        &self.base
    }

    // The caller's socket is attached by whoever issued the request.
    async fn dial(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn respond(&self) -> Result<(), AdapterError> {
        let stream = TcpStream::connect(("127.0.0.1", self.local_port)).await?;
        debug!(
            target = "adapter",
            pair_id = %self.base.pair_id(),
            port = self.local_port,
            "connected to local service"
        );
        self.base.attach(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test_timeout::tokio_timeout_test]
    async fn respond_bridges_to_the_local_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let adapter = ForwardAdapter::new(ForwardState::to("peer"), port);
        let mut pair_end = adapter.take_stream().unwrap();

        adapter.respond().await.unwrap();
        let (mut service, _) = listener.accept().await.unwrap();

        pair_end.write_all(b"SSH-2.0-client\r\n").await.unwrap();
        let mut greeting = [0u8; 16];
        service.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"SSH-2.0-client\r\n");

        service.write_all(b"ok").await.unwrap();
        let mut reply = [0u8; 2];
        pair_end.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ok");
    }

    #[test]
    fn state_round_trips_through_the_registry_payload() {
        let state = ForwardState {
            host_id: "host-b".into(),
            parent_id: Some("conn_4_9_1".into()),
        };
        let adapter = factory()(&state.encode().unwrap(), &crate::adapter::tests::test_context()).unwrap();
        assert_eq!(adapter.host_id(), "host-b");
        assert_eq!(adapter.parent_id().as_deref(), Some("conn_4_9_1"));
    }
}
