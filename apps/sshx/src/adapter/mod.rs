//! Application adapters: the protocol-specific ends of a tunnel.
//!
//! The core only talks to an adapter through [`Adapter`]. Each adapter owns
//! an in-memory duplex pipe; the pair pipes the transport into one end and
//! the adapter bridges the other end to whatever raw connection is attached
//! (the caller's socket, a local service, or a freshly attached console).

pub mod forward;
pub mod proxy;
pub mod stat;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sshx_proto::{ProtoError, app};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub use proxy::ProxyTable;

/// Capacity of the in-memory pipe between a pair and its adapter.
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown implementation {0}")]
    UnknownImplementation(i32),
    #[error("{0} does not support this operation")]
    Unsupported(&'static str),
    #[error("invalid adapter payload: {0}")]
    Payload(#[from] ProtoError),
    #[error("proxy port {0} already in use")]
    PortInUse(u16),
    #[error("adapter closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn RawStream>;

#[async_trait]
pub trait Adapter: Send + Sync {
    fn code(&self) -> i32;

    fn base(&self) -> &AdapterBase;

    /// Initiator-side setup, run once the pair has created its channel.
    async fn dial(&self) -> Result<(), AdapterError>;

    /// Responder-side setup, run once the remote channel is open.
    async fn respond(&self) -> Result<(), AdapterError>;

    fn close(&self) {
        self.base().close();
    }

    /// Hands out the pair-facing end of the pipe. Only the first caller gets it.
    fn take_stream(&self) -> Option<DuplexStream> {
        self.base().take_stream()
    }

    /// Binds `raw` to the application end, replacing any previous binding.
    fn attach(&self, raw: BoxedStream) -> Result<(), AdapterError> {
        self.base().attach(raw)
    }

    fn host_id(&self) -> String {
        self.base().host_id()
    }

    fn set_host_id(&self, id: &str) {
        self.base().set_host_id(id);
    }

    fn pair_id(&self) -> String {
        self.base().pair_id()
    }

    fn set_pair_id(&self, id: &str) {
        self.base().set_pair_id(id);
    }

    fn parent_id(&self) -> Option<String> {
        self.base().parent_id()
    }

    fn set_parent_id(&self, id: Option<String>) {
        self.base().set_parent_id(id);
    }
}

/// Identity fields plus the pipe and bridge every adapter shares.
pub struct AdapterBase {
    host_id: RwLock<String>,
    pair_id: RwLock<String>,
    parent_id: RwLock<Option<String>>,
    pair_end: Mutex<Option<DuplexStream>>,
    idle: Mutex<Option<(DuplexStream, mpsc::UnboundedReceiver<BoxedStream>)>>,
    attach_tx: mpsc::UnboundedSender<BoxedStream>,
    bridge: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AdapterBase {
    pub fn new(host_id: impl Into<String>, parent_id: Option<String>) -> Self {
        let (pair_end, app_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (attach_tx, attach_rx) = mpsc::unbounded_channel();
        Self {
            host_id: RwLock::new(host_id.into()),
            pair_id: RwLock::new(String::new()),
            parent_id: RwLock::new(parent_id.filter(|id| !id.is_empty())),
            pair_end: Mutex::new(Some(pair_end)),
            idle: Mutex::new(Some((app_end, attach_rx))),
            attach_tx,
            bridge: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn host_id(&self) -> String {
        self.host_id.read().clone()
    }

    pub fn set_host_id(&self, id: &str) {
        *self.host_id.write() = id.to_string();
    }

    pub fn pair_id(&self) -> String {
        self.pair_id.read().clone()
    }

    pub fn set_pair_id(&self, id: &str) {
        *self.pair_id.write() = id.to_string();
    }

    pub fn parent_id(&self) -> Option<String> {
        self.parent_id.read().clone()
    }

    pub fn set_parent_id(&self, id: Option<String>) {
        *self.parent_id.write() = id.filter(|id| !id.is_empty());
    }

    pub fn take_stream(&self) -> Option<DuplexStream> {
        self.pair_end.lock().take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn attach(&self, raw: BoxedStream) -> Result<(), AdapterError> {
        if self.is_closed() {
            return Err(AdapterError::Closed);
        }
        self.attach_tx.send(raw).map_err(|_| AdapterError::Closed)?;
        if let Some((app_end, attaches)) = self.idle.lock().take() {
            let pair_id = self.pair_id();
            *self.bridge.lock() = Some(tokio::spawn(bridge(app_end, attaches, pair_id)));
        }
        Ok(())
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.bridge.lock().take() {
            task.abort();
        }
        self.idle.lock().take();
        self.pair_end.lock().take();
        debug!(target = "adapter", pair_id = %self.pair_id(), "adapter closed");
    }
}

/// Copies between the application end and the most recently attached raw
/// connection. A new attach drops the previous connection.
async fn bridge(
    mut app_end: DuplexStream,
    mut attaches: mpsc::UnboundedReceiver<BoxedStream>,
    pair_id: String,
) {
    let Some(mut current) = attaches.recv().await else {
        return;
    };
    loop {
        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut app_end, &mut current) => {
                match result {
                    Ok((up, down)) => debug!(target = "adapter", pair_id = %pair_id, up, down, "raw connection finished"),
                    Err(err) => debug!(target = "adapter", pair_id = %pair_id, error = %err, "raw connection failed"),
                }
                return;
            }
            next = attaches.recv() => match next {
                Some(raw) => {
                    debug!(target = "adapter", pair_id = %pair_id, "re-attaching raw connection");
                    current = raw;
                }
                None => return,
            },
        }
    }
}

/// What factories may depend on besides the request payload.
#[derive(Clone)]
pub struct AdapterContext {
    pub local_ssh_port: u16,
    pub mux_addr: SocketAddr,
    pub proxies: ProxyTable,
}

pub type AdapterFactory =
    Arc<dyn Fn(&[u8], &AdapterContext) -> Result<Arc<dyn Adapter>, AdapterError> + Send + Sync>;

/// Immutable code → factory table, built once when the node starts.
pub struct AdapterRegistry {
    factories: HashMap<i32, AdapterFactory>,
    context: AdapterContext,
}

impl AdapterRegistry {
    pub fn builder(context: AdapterContext) -> AdapterRegistryBuilder {
        AdapterRegistryBuilder {
            factories: HashMap::new(),
            context,
        }
    }

    /// Registry with the adapters shipped in this crate.
    pub fn builtin(context: AdapterContext) -> Self {
        Self::builder(context)
            .register(app::SSH, forward::factory())
            .register(app::PROXY, proxy::factory())
            .register(app::STAT, stat::factory())
            .build()
    }

    pub fn contains(&self, code: i32) -> bool {
        self.factories.contains_key(&code)
    }

    /// Builds a fresh adapter. An empty payload yields the default state.
    pub fn build(&self, code: i32, payload: &[u8]) -> Result<Arc<dyn Adapter>, AdapterError> {
        let factory = self
            .factories
            .get(&code)
            .ok_or(AdapterError::UnknownImplementation(code))?;
        factory(payload, &self.context)
    }

    pub fn context(&self) -> &AdapterContext {
        &self.context
    }
}

pub struct AdapterRegistryBuilder {
    factories: HashMap<i32, AdapterFactory>,
    context: AdapterContext,
}

impl AdapterRegistryBuilder {
    pub fn register(mut self, code: i32, factory: AdapterFactory) -> Self {
        self.factories.insert(code, factory);
        self
    }

    pub fn build(self) -> AdapterRegistry {
        AdapterRegistry {
            factories: self.factories,
            context: self.context,
        }
    }
}

/// Decodes adapter state, treating an empty payload as the default.
pub(crate) fn decode_state<T>(payload: &[u8]) -> Result<T, AdapterError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if payload.is_empty() {
        return Ok(T::default());
    }
    Ok(sshx_proto::decode(payload)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    pub(crate) fn test_context() -> AdapterContext {
        AdapterContext {
            local_ssh_port: 22,
            mux_addr: "127.0.0.1:9".parse().unwrap(),
            proxies: ProxyTable::default(),
        }
    }

    struct Echo {
        base: AdapterBase,
    }

    #[async_trait]
    impl Adapter for Echo {
        fn code(&self) -> i32 {
            99
        }
        fn base(&self) -> &AdapterBase {
            &self.base
        }
        async fn dial(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn respond(&self) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn attach_rebinds_the_application_end() {
        let adapter = Echo {
            base: AdapterBase::new("peer", None),
        };
        let mut pair_end = adapter.take_stream().unwrap();
        assert!(adapter.take_stream().is_none());

        let (first, mut first_remote) = tokio::io::duplex(1024);
        adapter.attach(Box::new(first)).unwrap();
        pair_end.write_all(b"one").await.unwrap();
        let mut buf = [0u8; 3];
        first_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");

        let (second, mut second_remote) = tokio::io::duplex(1024);
        adapter.attach(Box::new(second)).unwrap();
        second_remote.write_all(b"two").await.unwrap();
        pair_end.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");

        adapter.close();
        assert!(matches!(
            adapter.attach(Box::new(tokio::io::duplex(8).0)),
            Err(AdapterError::Closed)
        ));
    }

    #[test]
    fn registry_rejects_unknown_codes() {
        let registry = AdapterRegistry::builtin(test_context());
        assert!(registry.contains(app::SSH));
        assert!(!registry.contains(app::VNC));
        assert!(matches!(
            registry.build(app::VNC, &[]),
            Err(AdapterError::UnknownImplementation(1))
        ));
    }

    #[test]
    fn empty_payload_builds_default_state() {
        let registry = AdapterRegistry::builtin(test_context());
        let adapter = registry.build(app::SSH, &[]).unwrap();
        assert_eq!(adapter.code(), app::SSH);
        assert!(adapter.host_id().is_empty());
        assert!(adapter.parent_id().is_none());

        adapter.set_parent_id(Some(String::new()));
        assert!(adapter.parent_id().is_none());
        adapter.set_pair_id("conn_0_1_0");
        assert_eq!(adapter.pair_id(), "conn_0_1_0");
    }
}
