//! Local forwarding listener. Every accepted connection becomes a child
//! ssh tunnel whose parent is the proxy's own pair, so tearing the proxy
//! down tears its children down with it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sshx_proto::{Envelope, OperationCode, ProtoError, app};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::forward::ForwardState;
use super::{Adapter, AdapterBase, AdapterContext, AdapterError, AdapterFactory, decode_state};
use crate::client::MuxClient;
use crate::now_millis;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyState {
    pub host_id: String,
    pub listen_port: u16,
}

impl ProxyState {
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        sshx_proto::encode(self)
    }
}

/// Bookkeeping for one forwarding listener.
#[derive(Debug)]
pub struct ProxyRepo {
    pub host: String,
    pub listen_port: u16,
    pub start_time: u64,
    pub connection_count: u64,
    cancel: Option<AbortHandle>,
}

impl ProxyRepo {
    pub fn new(host: impl Into<String>, listen_port: u16) -> Self {
        Self {
            host: host.into(),
            listen_port,
            start_time: now_millis(),
            connection_count: 0,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: AbortHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.abort();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub pair_id: String,
    pub host: String,
    pub listen_port: u16,
    pub start_time: u64,
    pub connection_count: u64,
}

/// Listeners keyed by the pair id of the proxy tunnel that owns them.
#[derive(Clone, Default)]
pub struct ProxyTable {
    repos: Arc<Mutex<HashMap<String, ProxyRepo>>>,
}

impl ProxyTable {
    pub fn validate(&self, port: u16) -> Result<(), AdapterError> {
        let repos = self.repos.lock();
        if repos.values().any(|repo| repo.listen_port == port) {
            return Err(AdapterError::PortInUse(port));
        }
        Ok(())
    }

    pub fn insert(&self, pair_id: &str, repo: ProxyRepo) -> Result<(), AdapterError> {
        let mut repos = self.repos.lock();
        if repos.values().any(|existing| existing.listen_port == repo.listen_port) {
            return Err(AdapterError::PortInUse(repo.listen_port));
        }
        repos.insert(pair_id.to_string(), repo);
        Ok(())
    }

    pub fn record_connection(&self, pair_id: &str) {
        if let Some(repo) = self.repos.lock().get_mut(pair_id) {
            repo.connection_count += 1;
        }
    }

    /// Drops the entry and stops its listener.
    pub fn remove(&self, pair_id: &str) -> bool {
        match self.repos.lock().remove(pair_id) {
            Some(mut repo) => {
                repo.cancel();
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<ProxyInfo> {
        let mut infos: Vec<ProxyInfo> = self
            .repos
            .lock()
            .iter()
            .map(|(pair_id, repo)| ProxyInfo {
                pair_id: pair_id.clone(),
                host: repo.host.clone(),
                listen_port: repo.listen_port,
                start_time: repo.start_time,
                connection_count: repo.connection_count,
            })
            .collect();
        infos.sort_by_key(|info| info.listen_port);
        infos
    }
}

pub struct ProxyAdapter {
    base: AdapterBase,
    listen_port: u16,
    mux: MuxClient,
    table: ProxyTable,
}

impl ProxyAdapter {
    pub fn new(state: ProxyState, ctx: &AdapterContext) -> Self {
        Self {
            base: AdapterBase::new(state.host_id, None),
            listen_port: state.listen_port,
            mux: MuxClient::new(ctx.mux_addr),
            table: ctx.proxies.clone(),
        }
    }
}

pub fn factory() -> AdapterFactory {
    Arc::new(|payload: &[u8], ctx: &AdapterContext| {
        let state: ProxyState = decode_state(payload)?;
        Ok(Arc::new(ProxyAdapter::new(state, ctx)) as Arc<dyn Adapter>)
    })
}

#[async_trait]
impl Adapter for ProxyAdapter {
    fn code(&self) -> i32 {
        app::PROXY
    }

    fn base(&self) -> &AdapterBase {
        &self.base
    }

    async fn dial(&self) -> Result<(), AdapterError> {
        self.table.validate(self.listen_port)?;
        let listener = TcpListener::bind(("127.0.0.1", self.listen_port)).await?;
        let port = listener.local_addr()?.port();
        let host = self.base.host_id();
        let pair_id = self.base.pair_id();

        let task = tokio::spawn(accept_loop(
            listener,
            host.clone(),
            pair_id.clone(),
            self.mux,
            self.table.clone(),
        ));
        let repo = ProxyRepo::new(host.clone(), port).with_cancel(task.abort_handle());
        if let Err(err) = self.table.insert(&pair_id, repo) {
            task.abort();
            return Err(err);
        }
        info!(target = "proxy", host = %host, port, pair_id = %pair_id, "proxy listening");
        Ok(())
    }

    // The remote side of a proxy tunnel carries no traffic of its own.
    async fn respond(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn close(&self) {
        if self.table.remove(&self.base.pair_id()) {
            debug!(target = "proxy", pair_id = %self.base.pair_id(), "proxy listener stopped");
        }
        self.base.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    host: String,
    parent: String,
    mux: MuxClient,
    table: ProxyTable,
) {
    loop {
        let (inbound, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(target = "proxy", error = %err, "accept failed");
                continue;
            }
        };
        table.record_connection(&parent);
        debug!(target = "proxy", %peer, parent = %parent, "spawning child tunnel");
        tokio::spawn(run_child(inbound, host.clone(), parent.clone(), mux));
    }
}

async fn run_child(mut inbound: TcpStream, host: String, parent: String, mux: MuxClient) {
    let state = ForwardState {
        host_id: host,
        parent_id: Some(parent),
    };
    let payload = match state.encode() {
        Ok(payload) => payload,
        Err(err) => {
            warn!(target = "proxy", error = %err, "failed to encode child request");
            return;
        }
    };
    let request = Envelope::request(app::SSH, OperationCode::Up).with_payload(payload);
    match mux.open(&request).await {
        Ok((reply, mut upstream)) => {
            debug!(target = "proxy", pair_id = %reply.pair_id, "child tunnel open");
            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await;
        }
        Err(err) => warn!(target = "proxy", error = %err, "child tunnel failed"),
    }
}
