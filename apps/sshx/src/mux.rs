//! Local multiplexer: one framed request per TCP connection. UP and ATTACH
//! turn the connection into the tunnel's raw stream once the reply is sent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sshx_proto::{Envelope, OperationCode, ProtoError, STATUS_FAILED, STATUS_OK, read_frame, write_frame};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, AdapterError, AdapterRegistry};
use crate::direct::{DirectError, DirectService};
use crate::negotiation::{NegotiationError, Negotiator};
use crate::pair::Pair;
use crate::pool::ConnectionPool;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Direct(#[from] DirectError),
}

pub struct Multiplexer {
    registry: Arc<AdapterRegistry>,
    pool: Arc<ConnectionPool>,
    negotiator: Arc<Negotiator>,
    direct: Arc<DirectService>,
    direct_links: HashMap<String, SocketAddr>,
    exit_timeout: Duration,
}

impl Multiplexer {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        pool: Arc<ConnectionPool>,
        negotiator: Arc<Negotiator>,
        direct: Arc<DirectService>,
        direct_links: HashMap<String, SocketAddr>,
        exit_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            pool,
            negotiator,
            direct,
            direct_links,
            exit_timeout,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(target = "mux", error = %err, "accept failed");
                    continue;
                }
            };
            let mux = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = mux.handle(stream).await {
                    debug!(target = "mux", %peer, error = %err, "request failed");
                }
            });
        }
    }

    async fn handle(&self, mut stream: TcpStream) -> Result<(), MuxError> {
        let request: Envelope = read_frame(&mut stream).await?;
        let app_code = request.app_code();
        let op = match request.operation() {
            Ok(op) => op,
            Err(err) => {
                warn!(target = "mux", kind = request.kind, "unknown operation");
                reply(&mut stream, &request, request.reply("", STATUS_FAILED)).await?;
                return Err(err.into());
            }
        };
        if !self.registry.contains(app_code) {
            warn!(target = "mux", app_code, "unknown implementation");
            reply(&mut stream, &request, request.reply("", STATUS_FAILED)).await?;
            return Ok(());
        }
        debug!(target = "mux", app_code, ?op, pair_id = %request.pair_id, "request");

        match op {
            OperationCode::Up => self.up(stream, request).await,
            OperationCode::Down => self.down(stream, request).await,
            OperationCode::Stat => self.stat(stream, request).await,
            OperationCode::Attach => self.attach(stream, request).await,
        }
    }

    async fn up(&self, mut stream: TcpStream, request: Envelope) -> Result<(), MuxError> {
        let adapter = match self.registry.build(request.app_code(), &request.payload) {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(target = "mux", error = %err, "cannot build adapter");
                reply(&mut stream, &request, request.reply("", STATUS_FAILED)).await?;
                return Ok(());
            }
        };

        if request.detach {
            drop(stream);
            match self.launch(adapter, request.kind).await {
                Ok(pair) => {
                    self.await_exit(pair).await;
                }
                Err(err) => warn!(target = "mux", error = %err, "detached tunnel setup failed"),
            }
            return Ok(());
        }

        let pair = match self.launch(Arc::clone(&adapter), request.kind).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(target = "mux", host = %adapter.host_id(), error = %err, "tunnel setup failed");
                reply(&mut stream, &request, request.reply("", STATUS_FAILED)).await?;
                return Ok(());
            }
        };
        let key = pair.key();
        if !self.await_exit(pair).await {
            reply(&mut stream, &request, request.reply(key, STATUS_FAILED)).await?;
            return Ok(());
        }
        reply(&mut stream, &request, request.reply(key, STATUS_OK)).await?;
        adapter.attach(Box::new(stream))?;
        Ok(())
    }

    /// Direct link first when one is configured for the target, the relay
    /// otherwise or when the link is down.
    async fn launch(&self, adapter: Arc<dyn Adapter>, kind: i32) -> Result<Arc<dyn Pair>, MuxError> {
        if let Some(addr) = self.direct_links.get(&adapter.host_id()) {
            match self.direct.connect(*addr, Arc::clone(&adapter)).await {
                Ok(pair) => return Ok(pair as Arc<dyn Pair>),
                Err(DirectError::Unreachable(addr)) => {
                    info!(target = "mux", %addr, "direct link unreachable, using relay");
                }
                Err(err) => return Err(err.into()),
            }
        }
        let pair = self.negotiator.create_connection(adapter, kind).await?;
        Ok(pair as Arc<dyn Pair>)
    }

    /// Waits for the pair's first outcome. Failures remove it from the pool.
    async fn await_exit(&self, pair: Arc<dyn Pair>) -> bool {
        let key = pair.key();
        let outcome = match timeout(self.exit_timeout, pair.exit().wait()).await {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(_) => Err("timed out waiting for the peer".to_string()),
        };
        match outcome {
            Ok(()) => {
                info!(target = "mux", pair_id = %key, "tunnel up");
                true
            }
            Err(reason) => {
                warn!(target = "mux", pair_id = %key, reason = %reason, "tunnel failed");
                let _ = self.pool.remove_pair(&key).await;
                pair.close().await;
                false
            }
        }
    }

    async fn down(&self, mut stream: TcpStream, request: Envelope) -> Result<(), MuxError> {
        let status = match self.lookup(&request) {
            Some(_) => match self.pool.remove_pair(&request.pair_id).await {
                Ok(()) => STATUS_OK,
                Err(err) => {
                    warn!(target = "mux", error = %err, "down failed");
                    STATUS_FAILED
                }
            },
            None => STATUS_FAILED,
        };
        reply(&mut stream, &request, request.reply(request.pair_id.clone(), status)).await?;
        Ok(())
    }

    async fn stat(&self, mut stream: TcpStream, request: Envelope) -> Result<(), MuxError> {
        let mut response = request.reply("", STATUS_OK);
        response.payload = sshx_proto::encode(&self.pool.stats())?;
        reply(&mut stream, &request, response).await?;
        Ok(())
    }

    async fn attach(&self, mut stream: TcpStream, request: Envelope) -> Result<(), MuxError> {
        let Some(pair) = self.lookup(&request) else {
            reply(&mut stream, &request, request.reply(request.pair_id.clone(), STATUS_FAILED)).await?;
            return Ok(());
        };
        reply(&mut stream, &request, request.reply(request.pair_id.clone(), STATUS_OK)).await?;
        pair.adapter().attach(Box::new(stream))?;
        info!(target = "mux", pair_id = %request.pair_id, "attached");
        Ok(())
    }

    /// The registered pair for `request.pair_id`, provided it belongs to the
    /// requested application.
    fn lookup(&self, request: &Envelope) -> Option<Arc<dyn Pair>> {
        let found = self
            .pool
            .get_pair(&request.pair_id)
            .filter(|pair| pair.adapter().code() == request.app_code());
        if found.is_none() {
            warn!(target = "mux", pair_id = %request.pair_id, "cannot get pair for id");
        }
        found
    }
}

/// Detached requests get no reply.
async fn reply(stream: &mut TcpStream, request: &Envelope, response: Envelope) -> Result<(), ProtoError> {
    if request.detach {
        return Ok(());
    }
    write_frame(stream, &response).await
}
