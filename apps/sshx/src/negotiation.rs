//! Relay-driven negotiation: turns local requests into offers and incoming
//! offers, answers and candidates into pair state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sshx_proto::{Direction, Envelope, PoolId, SignalFlag, SignalingMessage};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, AdapterError, AdapterRegistry};
use crate::pair::webrtc::SignalSink;
use crate::pair::{Pair, PairError, RtcStack, WebRtcPair, next_numeric_id};
use crate::pool::{ConnectionPool, PoolError};
use crate::signaling::SignalingClient;

const PULL_BACKOFF: Duration = Duration::from_secs(1);
const ORPHAN_TTL: Duration = Duration::from_secs(30);
const ORPHAN_LIMIT: usize = 64;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("empty target")]
    EmptyTarget,
    #[error("signaling queue closed")]
    SinkClosed,
    #[error(transparent)]
    Pair(#[from] PairError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

type Orphans = HashMap<String, Vec<(Instant, Vec<u8>)>>;

pub struct Negotiator {
    identity: String,
    stack: RtcStack,
    pool: Arc<ConnectionPool>,
    registry: Arc<AdapterRegistry>,
    signals: SignalSink,
    /// Candidates that arrived before their pair existed, keyed by the
    /// pair they belong to.
    orphans: AsyncMutex<Orphans>,
}

impl Negotiator {
    /// Builds the negotiator and spawns its push and pull loops.
    pub fn start(
        identity: &str,
        stack: RtcStack,
        pool: Arc<ConnectionPool>,
        registry: Arc<AdapterRegistry>,
        client: SignalingClient,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let (signals, outbound) = mpsc::unbounded_channel();
        let negotiator = Arc::new(Self {
            identity: identity.to_string(),
            stack,
            pool,
            registry,
            signals,
            orphans: AsyncMutex::new(HashMap::new()),
        });
        let pusher = tokio::spawn(push_loop(client.clone(), outbound));
        let puller = tokio::spawn(pull_loop(Arc::clone(&negotiator), client));
        (negotiator, vec![pusher, puller])
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Starts a tunnel towards `adapter.host_id()`. The returned pair is
    /// registered and its offer is on the way; completion is reported
    /// through the pair's exit signal.
    pub async fn create_connection(
        &self,
        adapter: Arc<dyn Adapter>,
        request_type: i32,
    ) -> Result<Arc<WebRtcPair>, NegotiationError> {
        let target = adapter.host_id();
        if target.is_empty() {
            return Err(NegotiationError::EmptyTarget);
        }
        let id = PoolId::new(adapter.code(), next_numeric_id(), Direction::Outbound);
        let pair = WebRtcPair::new(
            &self.stack,
            id,
            &self.identity,
            adapter,
            self.signals.clone(),
            self.pool.cleanup_sender(),
        )
        .await?;

        pair.dial().await?;
        let offer = pair.offer(&target, request_type).await?;
        self.pool.add_pair(pair.clone()).await?;
        if self.signals.send(offer).is_err() {
            pair.close().await;
            return Err(NegotiationError::SinkClosed);
        }
        info!(target = "negotiation", pair_id = %id, target = %target, "offer sent");
        Ok(pair)
    }

    async fn dispatch(&self, message: SignalingMessage) {
        let id = message.id;
        let result = match message.flag {
            SignalFlag::Offer => self.serve_offer(message).await,
            SignalFlag::Answer => self.serve_answer(message).await,
            SignalFlag::Candidate => self.serve_candidate(message).await,
            SignalFlag::Unknown => {
                debug!(target = "negotiation", %id, "ignoring message without a flag");
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(target = "negotiation", %id, error = %err, "failed to handle signaling message");
        }
    }

    async fn serve_offer(&self, offer: SignalingMessage) -> Result<(), NegotiationError> {
        let app_code = Envelope::app_code_of(offer.remote_request_type);
        let adapter = self.registry.build(app_code, &[])?;
        adapter.set_host_id(&offer.source);

        let id = offer.id.flipped();
        let pair = WebRtcPair::new(
            &self.stack,
            id,
            &self.identity,
            adapter,
            self.signals.clone(),
            self.pool.cleanup_sender(),
        )
        .await?;
        pair.respond();
        self.pool.add_pair(pair.clone()).await?;

        {
            let mut orphans = self.orphans.lock().await;
            for (_, candidate) in orphans.remove(&id.to_string()).unwrap_or_default() {
                pair.queue_candidate(candidate).await?;
            }
        }

        let answer = pair.answer(&offer).await?;
        self.signals
            .send(answer)
            .map_err(|_| NegotiationError::SinkClosed)?;
        info!(target = "negotiation", pair_id = %id, source = %offer.source, "answer sent");
        Ok(())
    }

    async fn serve_answer(&self, answer: SignalingMessage) -> Result<(), NegotiationError> {
        let key = answer.id.flipped().to_string();
        let pair = self
            .pool
            .get_pair(&key)
            .ok_or_else(|| PoolError::NotFound(key.clone()))?;
        let Some(negotiated) = pair.negotiated() else {
            warn!(target = "negotiation", pair_id = %key, "answer for a pair that was not negotiated");
            return Ok(());
        };
        negotiated.make_connection(&answer).await?;
        debug!(target = "negotiation", pair_id = %key, "answer applied");
        Ok(())
    }

    async fn serve_candidate(&self, message: SignalingMessage) -> Result<(), NegotiationError> {
        let id = message.id.flipped();
        let key = id.to_string();
        let mut orphans = self.orphans.lock().await;

        let Some(pair) = self.pool.get_pair(&key) else {
            park(&mut orphans, key, message.candidate);
            return Ok(());
        };
        let Some(negotiated) = pair.negotiated() else {
            return Ok(());
        };
        match negotiated.add_candidate(&message.candidate, id).await {
            Err(PairError::RemoteDescriptionNotSet) => {
                negotiated.queue_candidate(message.candidate).await?
            }
            other => other?,
        }
        Ok(())
    }

    #[cfg(test)]
    async fn orphan_count(&self, key: &str) -> usize {
        self.orphans.lock().await.get(key).map_or(0, Vec::len)
    }
}

fn park(orphans: &mut Orphans, key: String, candidate: Vec<u8>) {
    let now = Instant::now();
    orphans.retain(|_, parked| {
        parked.retain(|(at, _)| now.duration_since(*at) < ORPHAN_TTL);
        !parked.is_empty()
    });
    let parked = orphans.entry(key).or_default();
    if parked.len() >= ORPHAN_LIMIT {
        parked.remove(0);
    }
    parked.push((now, candidate));
}

/// Pushes in the order messages were produced, one at a time.
async fn push_loop(client: SignalingClient, mut outbound: mpsc::UnboundedReceiver<SignalingMessage>) {
    while let Some(message) = outbound.recv().await {
        if let Err(err) = client.push(&message.target, &message).await {
            warn!(
                target = "negotiation",
                to = %message.target,
                flag = ?message.flag,
                error = %err,
                "push failed"
            );
        }
    }
}

async fn pull_loop(negotiator: Arc<Negotiator>, client: SignalingClient) {
    loop {
        match client.pull(&negotiator.identity).await {
            Ok(Some(message)) => {
                if let Err(err) = message.validate() {
                    warn!(target = "negotiation", error = %err, "discarding invalid message");
                    continue;
                }
                debug!(
                    target = "negotiation",
                    from = %message.source,
                    flag = ?message.flag,
                    id = %message.id,
                    "pulled"
                );
                let negotiator = Arc::clone(&negotiator);
                tokio::spawn(async move { negotiator.dispatch(message).await });
            }
            Ok(None) => {}
            Err(err) => {
                warn!(target = "negotiation", error = %err, "pull failed");
                sleep(PULL_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::tests::test_context;
    use sshx_proto::app;

    #[tokio::test(start_paused = true)]
    async fn parked_candidates_expire_and_are_capped() {
        let mut orphans = Orphans::new();
        for n in 0..(ORPHAN_LIMIT + 5) {
            park(&mut orphans, "conn_0_1_0".into(), vec![n as u8]);
        }
        let parked = &orphans["conn_0_1_0"];
        assert_eq!(parked.len(), ORPHAN_LIMIT);
        assert_eq!(parked[0].1, vec![5u8]);

        tokio::time::advance(ORPHAN_TTL + Duration::from_secs(1)).await;
        park(&mut orphans, "conn_0_2_0".into(), vec![1]);
        assert!(!orphans.contains_key("conn_0_1_0"));
        assert_eq!(orphans["conn_0_2_0"].len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_candidates_are_parked_until_their_pair_exists() {
        let Ok(stack) = RtcStack::new(&[]) else { return };
        let pool = ConnectionPool::new(Duration::from_millis(20), Duration::from_secs(2));
        let registry = Arc::new(AdapterRegistry::builtin(test_context()));
        // Nothing listens here; pulls fail and back off.
        let Ok(client) = SignalingClient::new("http://127.0.0.1:9", Duration::from_secs(1)) else {
            return;
        };
        let (negotiator, tasks) = Negotiator::start("B", stack, pool, registry, client);

        let remote = PoolId::new(app::SSH, 77, Direction::Outbound);
        let message = SignalingMessage::candidate(remote, "A", "B", b"{}".to_vec());
        negotiator.serve_candidate(message).await.unwrap();
        assert_eq!(negotiator.orphan_count("conn_0_77_0").await, 1);

        let answer = SignalingMessage::answer(remote, "A", "B", String::new());
        assert!(matches!(
            negotiator.serve_answer(answer).await,
            Err(NegotiationError::Pool(PoolError::NotFound(_)))
        ));

        let adapter = negotiator.registry.build(app::SSH, &[]).unwrap();
        assert!(matches!(
            negotiator.create_connection(adapter, 0).await,
            Err(NegotiationError::EmptyTarget)
        ));

        for task in tasks {
            task.abort();
        }
    }
}
