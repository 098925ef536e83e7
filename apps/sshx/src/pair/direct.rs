use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use sshx_proto::PoolId;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{CleanupNotice, CleanupSender, ExitSignal, Pair, PairError, PairState, next_serial};
use crate::adapter::Adapter;

/// A tunnel over a plain TCP connection. There is nothing to negotiate, so
/// it starts out open.
pub struct DirectPair {
    id: PoolId,
    serial: u64,
    adapter: Arc<dyn Adapter>,
    state: Mutex<PairState>,
    exit: ExitSignal,
    cleanup: CleanupSender,
    pipe: Mutex<Option<JoinHandle<()>>>,
}

impl DirectPair {
    pub fn open(
        id: PoolId,
        adapter: Arc<dyn Adapter>,
        mut stream: TcpStream,
        cleanup: CleanupSender,
    ) -> Result<Arc<Self>, PairError> {
        adapter.set_pair_id(&id.to_string());
        let mut pair_end = adapter.take_stream().ok_or(PairError::Closed)?;
        let pair = Arc::new(Self {
            id,
            serial: next_serial(),
            adapter,
            state: Mutex::new(PairState::Open),
            exit: ExitSignal::new(),
            cleanup,
            pipe: Mutex::new(None),
        });
        pair.exit.fire(Ok(()));

        let weak: Weak<Self> = Arc::downgrade(&pair);
        let task = tokio::spawn(async move {
            let result = tokio::io::copy_bidirectional(&mut pair_end, &mut stream).await;
            debug!(target = "pair", pair_id = %id, ?result, "direct pipe finished");
            if let Some(pair) = weak.upgrade() {
                tokio::spawn(async move { pair.close().await });
            }
        });
        *pair.pipe.lock() = Some(task);
        info!(target = "pair", pair_id = %id, "direct tunnel open");
        Ok(pair)
    }
}

#[async_trait]
impl Pair for DirectPair {
    fn pool_id(&self) -> PoolId {
        self.id
    }

    fn serial(&self) -> u64 {
        self.serial
    }

    fn adapter(&self) -> Arc<dyn Adapter> {
        Arc::clone(&self.adapter)
    }

    fn is_ready(&self) -> bool {
        *self.state.lock() == PairState::Open
    }

    fn is_closed(&self) -> bool {
        *self.state.lock() == PairState::Closed
    }

    fn exit(&self) -> &ExitSignal {
        &self.exit
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == PairState::Closed {
                return;
            }
            *state = PairState::Closed;
        }
        if let Some(pipe) = self.pipe.lock().take() {
            pipe.abort();
        }
        self.adapter.close();
        let _ = self.cleanup.send(CleanupNotice {
            key: self.key(),
            serial: self.serial,
        });
        info!(target = "pair", pair_id = %self.id, "direct tunnel closed");
    }
}
