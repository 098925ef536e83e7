//! Connection pairs: one per tunnel attempt.

pub mod direct;
pub mod webrtc;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use sshx_proto::PoolId;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::adapter::{Adapter, AdapterError};

pub use self::direct::DirectPair;
pub use self::webrtc::{RtcStack, WebRtcPair};

#[derive(Debug, Error)]
pub enum PairError {
    #[error("id mismatch: pair {expected}, candidate for {actual}")]
    IdMismatch { expected: PoolId, actual: PoolId },
    #[error("remote description not set")]
    RemoteDescriptionNotSet,
    #[error("empty target")]
    EmptyTarget,
    #[error("pair closed")]
    Closed,
    #[error("exit signal already consumed")]
    ExitConsumed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed candidate: {0}")]
    Candidate(#[from] serde_json::Error),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

pub(crate) fn to_transport_error<E: std::fmt::Display>(err: E) -> PairError {
    PairError::Transport(err.to_string())
}

/// Negotiation progress. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Idle,
    /// Initiator: offer created and set locally, answer outstanding.
    AwaitingAnswer,
    /// Responder: answer created and set locally.
    Answered,
    /// Both descriptions set; candidates flow until the channel opens.
    CandidateExchange,
    Open,
    Closed,
}

/// Sent by a pair when it closes so the pool can drop its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupNotice {
    pub key: String,
    pub serial: u64,
}

pub type CleanupSender = mpsc::UnboundedSender<CleanupNotice>;

#[async_trait]
pub trait Pair: Send + Sync {
    fn pool_id(&self) -> PoolId;

    fn key(&self) -> String {
        self.pool_id().to_string()
    }

    /// Process-unique; distinguishes a pair from a later one with the same key.
    fn serial(&self) -> u64;

    fn adapter(&self) -> Arc<dyn Adapter>;

    fn is_ready(&self) -> bool;

    fn is_closed(&self) -> bool;

    fn exit(&self) -> &ExitSignal;

    /// Closes the transport and the adapter and notifies the pool. Repeated
    /// calls are no-ops.
    async fn close(&self);

    fn negotiated(&self) -> Option<&WebRtcPair> {
        None
    }
}

/// One-shot completion report for whoever waits on a tunnel.
pub struct ExitSignal {
    sender: Mutex<Option<oneshot::Sender<Result<(), PairError>>>>,
    receiver: Mutex<Option<oneshot::Receiver<Result<(), PairError>>>>,
}

impl ExitSignal {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Delivers the first result; later ones are dropped. Returns whether
    /// this call was the one that fired.
    pub fn fire(&self, result: Result<(), PairError>) -> bool {
        match self.sender.lock().take() {
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => {
                debug!(target = "pair", ?result, "exit already fired");
                false
            }
        }
    }

    pub fn has_fired(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub async fn wait(&self) -> Result<(), PairError> {
        let receiver = self.receiver.lock().take().ok_or(PairError::ExitConsumed)?;
        receiver.await.unwrap_or(Err(PairError::Closed))
    }
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub fn next_serial() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Clock-derived negotiation id, strictly increasing within the process.
pub fn next_numeric_id() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(1);
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}
