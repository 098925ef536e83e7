//! Direct-link fast path: a plain TCP connection to a peer whose address is
//! configured, skipping the relay and ICE entirely.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sshx_proto::{DirectHandshake, Direction, PoolId, ProtoError, read_frame, write_frame};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, AdapterError, AdapterRegistry};
use crate::pair::{DirectPair, PairError, next_numeric_id};
use crate::pool::{ConnectionPool, PoolError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DirectError {
    /// The peer could not be reached; callers fall back to the relay.
    #[error("direct link to {0} unreachable")]
    Unreachable(SocketAddr),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("invalid handshake: {0}")]
    InvalidHandshake(&'static str),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Pair(#[from] PairError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub struct DirectService {
    identity: String,
    pool: Arc<ConnectionPool>,
    registry: Arc<AdapterRegistry>,
}

impl DirectService {
    pub fn new(identity: &str, pool: Arc<ConnectionPool>, registry: Arc<AdapterRegistry>) -> Self {
        Self {
            identity: identity.to_string(),
            pool,
            registry,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(target = "direct", error = %err, "accept failed");
                    continue;
                }
            };
            let service = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = service.accept(stream).await {
                    warn!(target = "direct", %peer, error = %err, "direct link rejected");
                }
            });
        }
    }

    async fn accept(&self, mut stream: TcpStream) -> Result<(), DirectError> {
        let handshake: DirectHandshake = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| DirectError::HandshakeTimeout)??;
        check_handshake(&handshake)?;

        let adapter = self.registry.build(handshake.app_code, &[])?;
        adapter.set_host_id(&handshake.host_id);
        let id = handshake.id.flipped();
        adapter.set_pair_id(&id.to_string());
        adapter.respond().await?;

        let pair = DirectPair::open(id, adapter, stream, self.pool.cleanup_sender())?;
        self.pool.add_pair(pair).await?;
        info!(target = "direct", pair_id = %id, from = %handshake.host_id, "accepted direct link");
        Ok(())
    }

    /// Opens a direct tunnel to `addr` on behalf of `adapter`.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        adapter: Arc<dyn Adapter>,
    ) -> Result<Arc<DirectPair>, DirectError> {
        let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(target = "direct", %addr, error = %err, "connect failed");
                return Err(DirectError::Unreachable(addr));
            }
            Err(_) => return Err(DirectError::Unreachable(addr)),
        };

        let id = PoolId::new(adapter.code(), next_numeric_id(), Direction::Outbound);
        let handshake = DirectHandshake {
            app_code: adapter.code(),
            host_id: self.identity.clone(),
            id,
        };
        write_frame(&mut stream, &handshake).await?;

        adapter.set_pair_id(&id.to_string());
        adapter.dial().await?;
        let pair = DirectPair::open(id, adapter, stream, self.pool.cleanup_sender())?;
        self.pool.add_pair(pair.clone()).await?;
        info!(target = "direct", pair_id = %id, %addr, "direct link open");
        Ok(pair)
    }
}

fn check_handshake(handshake: &DirectHandshake) -> Result<(), DirectError> {
    if handshake.id.is_zero() {
        return Err(DirectError::InvalidHandshake("zero pair id"));
    }
    if handshake.host_id.is_empty() {
        return Err(DirectError::InvalidHandshake("empty host id"));
    }
    if handshake.id.app_code != handshake.app_code {
        return Err(DirectError::InvalidHandshake("app code does not match pair id"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::tests::test_context;
    use sshx_proto::app;
    use tokio::io::AsyncReadExt;

    async fn start_service() -> (Arc<ConnectionPool>, SocketAddr) {
        let pool = ConnectionPool::new(Duration::from_millis(20), Duration::from_secs(2));
        let registry = Arc::new(AdapterRegistry::builtin(test_context()));
        let service = Arc::new(DirectService::new("listener", Arc::clone(&pool), registry));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(service.serve(listener));
        (pool, addr)
    }

    async fn send_handshake(addr: SocketAddr, handshake: &DirectHandshake) -> usize {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, handshake).await.unwrap();
        let mut buf = [0u8; 16];
        timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0)
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_handshakes_are_dropped() {
        let (pool, addr) = start_service().await;

        let zero = DirectHandshake {
            app_code: app::SSH,
            host_id: "dialer".into(),
            id: PoolId::new(app::SSH, 0, Direction::Outbound),
        };
        assert_eq!(send_handshake(addr, &zero).await, 0);

        let anonymous = DirectHandshake {
            host_id: String::new(),
            id: PoolId::new(app::SSH, 7, Direction::Outbound),
            ..zero.clone()
        };
        assert_eq!(send_handshake(addr, &anonymous).await, 0);

        let mismatched = DirectHandshake {
            app_code: app::PROXY,
            id: PoolId::new(app::SSH, 8, Direction::Outbound),
            ..zero
        };
        assert_eq!(send_handshake(addr, &mismatched).await, 0);

        assert!(pool.is_empty());
    }

    #[test]
    fn handshake_check_accepts_a_well_formed_frame() {
        let handshake = DirectHandshake {
            app_code: app::SSH,
            host_id: "dialer".into(),
            id: PoolId::new(app::SSH, 9, Direction::Outbound),
        };
        assert!(check_handshake(&handshake).is_ok());
    }
}
