use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::adapter::{AdapterContext, AdapterRegistry, ProxyTable};
use crate::client::MuxClient;
use crate::config::Config;
use crate::direct::DirectService;
use crate::mux::Multiplexer;
use crate::negotiation::Negotiator;
use crate::pair::{PairError, RtcStack};
use crate::pool::ConnectionPool;
use crate::signaling::{SignalingClient, SignalingError};

/// Long enough to cover the relay's long-poll window.
const RELAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("invalid direct link for {peer}: {addr}")]
    DirectLink { peer: String, addr: String },
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Transport(#[from] PairError),
}

/// A running peer: multiplexer, direct-link listener and relay loops.
pub struct Node {
    identity: String,
    pool: Arc<ConnectionPool>,
    mux_addr: SocketAddr,
    direct_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub async fn start(config: &Config) -> Result<Self, NodeError> {
        let direct_links = parse_direct_links(&config.direct_links)?;
        let mux_listener = bind("multiplexer", SocketAddr::from((Ipv4Addr::LOCALHOST, config.local_tcp_port))).await?;
        let direct_listener = bind("direct link", SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.direct_port))).await?;
        let mux_addr = local_addr("multiplexer", &mux_listener)?;
        let direct_addr = local_addr("direct link", &direct_listener)?;

        let pool = ConnectionPool::new(config.admission_poll(), config.admission_timeout());
        let registry = Arc::new(AdapterRegistry::builtin(AdapterContext {
            local_ssh_port: config.local_ssh_port,
            mux_addr,
            proxies: ProxyTable::default(),
        }));
        let client = SignalingClient::new(&config.signaling_server_addr, RELAY_REQUEST_TIMEOUT)?;
        let stack = RtcStack::new(&config.ice_servers)?;

        let (negotiator, mut tasks) = Negotiator::start(
            &config.id,
            stack,
            Arc::clone(&pool),
            Arc::clone(&registry),
            client,
        );
        let direct = Arc::new(DirectService::new(&config.id, Arc::clone(&pool), Arc::clone(&registry)));
        let mux = Arc::new(Multiplexer::new(
            registry,
            Arc::clone(&pool),
            negotiator,
            Arc::clone(&direct),
            direct_links,
            config.admission_timeout(),
        ));

        tasks.push(tokio::spawn(mux.serve(mux_listener)));
        tasks.push(tokio::spawn(direct.serve(direct_listener)));
        info!(
            target = "node",
            id = %config.id,
            mux = %mux_addr,
            direct = %direct_addr,
            relay = %config.signaling_server_addr,
            "node started"
        );

        Ok(Self {
            identity: config.id.clone(),
            pool,
            mux_addr,
            direct_addr,
            tasks,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn mux_addr(&self) -> SocketAddr {
        self.mux_addr
    }

    pub fn direct_addr(&self) -> SocketAddr {
        self.direct_addr
    }

    pub fn client(&self) -> MuxClient {
        MuxClient::new(self.mux_addr)
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.pool.close_all().await;
        info!(target = "node", id = %self.identity, "node stopped");
    }
}

async fn bind(what: &'static str, addr: SocketAddr) -> Result<TcpListener, NodeError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| NodeError::Bind { what, addr, source })
}

fn local_addr(what: &'static str, listener: &TcpListener) -> Result<SocketAddr, NodeError> {
    listener.local_addr().map_err(|source| NodeError::Bind {
        what,
        addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        source,
    })
}

fn parse_direct_links(links: &HashMap<String, String>) -> Result<HashMap<String, SocketAddr>, NodeError> {
    links
        .iter()
        .map(|(peer, addr)| {
            addr.parse()
                .map(|parsed| (peer.clone(), parsed))
                .map_err(|_| NodeError::DirectLink {
                    peer: peer.clone(),
                    addr: addr.clone(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_links_must_be_socket_addresses() {
        let mut links = HashMap::new();
        links.insert("b".to_string(), "127.0.0.1:8099".to_string());
        let parsed = parse_direct_links(&links).unwrap();
        assert_eq!(parsed["b"].port(), 8099);

        links.insert("c".to_string(), "not-an-address".to_string());
        assert!(matches!(
            parse_direct_links(&links),
            Err(NodeError::DirectLink { .. })
        ));
    }
}
