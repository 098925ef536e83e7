use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sshx_proto::{Direction, PoolId, SignalingMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    CleanupNotice, CleanupSender, ExitSignal, Pair, PairError, PairState, next_serial,
    to_transport_error,
};
use crate::adapter::Adapter;

const DATA_CHANNEL_LABEL: &str = "data";
const CHUNK_SIZE: usize = 16 * 1024;
const MAX_BUFFERED_AMOUNT: usize = 1024 * 1024;
const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);
/// Messages held between the data channel and the adapter pipe. When full,
/// the SCTP read loop stalls and the remote sender is throttled.
const INBOUND_QUEUE: usize = 64;

/// Outbound signaling messages; `target` on each message names the recipient.
pub type SignalSink = mpsc::UnboundedSender<SignalingMessage>;

/// Peer-connection factory shared by every negotiated pair of a node.
pub struct RtcStack {
    api: API,
    config: RTCConfiguration,
}

impl RtcStack {
    pub fn new(ice_servers: &[String]) -> Result<Self, PairError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(to_transport_error)?;

        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(to_transport_error)?;

        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(25)),
            Some(Duration::from_secs(2)),
        );
        // Peers on the same host have no other path.
        setting.set_include_loopback_candidate(true);

        let api = APIBuilder::new()
            .with_setting_engine(setting)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }

    async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>, PairError> {
        let pc = self
            .api
            .new_peer_connection(self.config.clone())
            .await
            .map_err(to_transport_error)?;
        Ok(Arc::new(pc))
    }
}

#[derive(Default)]
struct CandidateQueue {
    remote_set: bool,
    pending: Vec<Vec<u8>>,
}

/// A tunnel negotiated over the relay and carried by a data channel.
pub struct WebRtcPair {
    id: PoolId,
    serial: u64,
    local: String,
    peer: Mutex<String>,
    adapter: Arc<dyn Adapter>,
    pc: Arc<RTCPeerConnection>,
    state: Mutex<PairState>,
    exit: ExitSignal,
    candidates: AsyncMutex<CandidateQueue>,
    signals: SignalSink,
    cleanup: CleanupSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    weak: Weak<Self>,
}

impl WebRtcPair {
    pub async fn new(
        stack: &RtcStack,
        id: PoolId,
        local: &str,
        adapter: Arc<dyn Adapter>,
        signals: SignalSink,
        cleanup: CleanupSender,
    ) -> Result<Arc<Self>, PairError> {
        let pc = stack.peer_connection().await?;
        adapter.set_pair_id(&id.to_string());
        let pair = Arc::new_cyclic(|weak| Self {
            id,
            serial: next_serial(),
            local: local.to_string(),
            peer: Mutex::new(String::new()),
            adapter,
            pc,
            state: Mutex::new(PairState::Idle),
            exit: ExitSignal::new(),
            candidates: AsyncMutex::new(CandidateQueue::default()),
            signals,
            cleanup,
            tasks: Mutex::new(Vec::new()),
            weak: weak.clone(),
        });
        pair.install_handlers();
        Ok(pair)
    }

    pub fn state(&self) -> PairState {
        *self.state.lock()
    }

    pub fn peer(&self) -> String {
        self.peer.lock().clone()
    }

    fn install_handlers(&self) {
        let weak = self.weak.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let (Some(candidate), Some(pair)) = (candidate, weak.upgrade()) {
                        pair.send_local_candidate(candidate);
                    }
                })
            }));

        let weak = self.weak.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    debug!(target = "pair", ?state, "peer connection state changed");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(pair) = weak.upgrade() {
                            pair.close_in_background();
                        }
                    }
                })
            }));
    }

    fn send_local_candidate(&self, candidate: RTCIceCandidate) {
        let peer = self.peer();
        if peer.is_empty() {
            debug!(target = "pair", pair_id = %self.id, "candidate before peer is known");
            return;
        }
        let encoded = candidate
            .to_json()
            .map_err(to_transport_error)
            .and_then(|init| serde_json::to_vec(&init).map_err(PairError::from));
        match encoded {
            Ok(bytes) => {
                let message = SignalingMessage::candidate(self.id, &self.local, &peer, bytes);
                if self.signals.send(message).is_err() {
                    debug!(target = "pair", pair_id = %self.id, "signal sink closed");
                }
            }
            Err(err) => warn!(target = "pair", pair_id = %self.id, error = %err, "dropping local candidate"),
        }
    }

    /// Initiator: opens the data channel and runs the adapter's dial step.
    pub async fn dial(&self) -> Result<(), PairError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let result = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await
            .map_err(to_transport_error);
        let dc = self.fail_closed(result).await?;
        self.watch_channel(dc);

        let dialed = self.adapter.dial().await.map_err(PairError::from);
        self.fail_closed(dialed).await
    }

    /// Responder: waits for the initiator's data channel.
    pub fn respond(&self) {
        let weak = self.weak.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(pair) = weak.upgrade() {
                        debug!(target = "pair", pair_id = %pair.id, label = dc.label(), "remote data channel");
                        pair.watch_channel(dc);
                    }
                })
            }));
    }

    pub async fn offer(
        &self,
        target: &str,
        request_type: i32,
    ) -> Result<SignalingMessage, PairError> {
        if target.is_empty() {
            return self.fail_closed(Err(PairError::EmptyTarget)).await;
        }
        *self.peer.lock() = target.to_string();

        let result = async {
            let offer = self.pc.create_offer(None).await.map_err(to_transport_error)?;
            let sdp = offer.sdp.clone();
            self.pc
                .set_local_description(offer)
                .await
                .map_err(to_transport_error)?;
            Ok::<_, PairError>(sdp)
        }
        .await;
        let sdp = self.fail_closed(result).await?;
        self.transition(PairState::AwaitingAnswer);
        Ok(SignalingMessage::offer(
            self.id,
            &self.local,
            target,
            sdp,
            request_type,
        ))
    }

    pub async fn answer(&self, offer: &SignalingMessage) -> Result<SignalingMessage, PairError> {
        *self.peer.lock() = offer.source.clone();

        let result = async {
            let remote =
                RTCSessionDescription::offer(offer.sdp.clone()).map_err(to_transport_error)?;
            self.set_remote(remote).await?;
            let answer = self.pc.create_answer(None).await.map_err(to_transport_error)?;
            let sdp = answer.sdp.clone();
            self.pc
                .set_local_description(answer)
                .await
                .map_err(to_transport_error)?;
            Ok::<_, PairError>(sdp)
        }
        .await;
        let sdp = self.fail_closed(result).await?;
        self.transition(PairState::Answered);
        // Both descriptions are set; only candidates remain.
        self.transition(PairState::CandidateExchange);
        Ok(SignalingMessage::answer(
            self.id,
            &self.local,
            &offer.source,
            sdp,
        ))
    }

    /// Initiator: applies the answer and releases anyone waiting on exit.
    pub async fn make_connection(&self, answer: &SignalingMessage) -> Result<(), PairError> {
        let result = async {
            let remote =
                RTCSessionDescription::answer(answer.sdp.clone()).map_err(to_transport_error)?;
            self.set_remote(remote).await
        }
        .await;
        self.fail_closed(result).await?;
        self.transition(PairState::CandidateExchange);
        self.exit.fire(Ok(()));
        Ok(())
    }

    /// Applies a remote candidate. Fails without touching the transport when
    /// the id is wrong or no remote description is set yet.
    pub async fn add_candidate(&self, candidate: &[u8], id: PoolId) -> Result<(), PairError> {
        if id != self.id {
            return Err(PairError::IdMismatch {
                expected: self.id,
                actual: id,
            });
        }
        if self.pc.remote_description().await.is_none() {
            return Err(PairError::RemoteDescriptionNotSet);
        }
        self.apply_candidate(candidate).await
    }

    /// Parks a candidate until the remote description is set, or applies it
    /// right away if that already happened.
    pub async fn queue_candidate(&self, candidate: Vec<u8>) -> Result<(), PairError> {
        let mut queue = self.candidates.lock().await;
        if queue.remote_set {
            drop(queue);
            return self.apply_candidate(&candidate).await;
        }
        queue.pending.push(candidate);
        Ok(())
    }

    pub async fn pending_candidates(&self) -> usize {
        self.candidates.lock().await.pending.len()
    }

    async fn apply_candidate(&self, candidate: &[u8]) -> Result<(), PairError> {
        let init: RTCIceCandidateInit = serde_json::from_slice(candidate)?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_transport_error)
    }

    async fn set_remote(&self, description: RTCSessionDescription) -> Result<(), PairError> {
        let mut queue = self.candidates.lock().await;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_transport_error)?;
        queue.remote_set = true;
        for candidate in std::mem::take(&mut queue.pending) {
            if let Err(err) = self.apply_candidate(&candidate).await {
                warn!(target = "pair", pair_id = %self.id, error = %err, "queued candidate rejected");
            }
        }
        Ok(())
    }

    fn watch_channel(&self, dc: Arc<RTCDataChannel>) {
        let (inbound_tx, inbound_rx) = inbound_queue();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let inbound = inbound_tx.clone();
            Box::pin(async move {
                let _ = inbound.send(msg.data).await;
            })
        }));

        let weak = self.weak.clone();
        dc.on_close(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(pair) = weak.upgrade() {
                    debug!(target = "pair", pair_id = %pair.id, "data channel closed");
                    pair.close_in_background();
                }
            })
        }));

        let weak = self.weak.clone();
        let channel = Arc::downgrade(&dc);
        let inbound_rx = Mutex::new(inbound_rx);
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                let (Some(pair), Some(dc)) = (weak.upgrade(), channel.upgrade()) else {
                    return;
                };
                let inbound = inbound_rx.into_inner();
                tokio::spawn(async move {
                    if let Err(err) = pair.open(dc, inbound).await {
                        warn!(target = "pair", pair_id = %pair.id, error = %err, "failed to open tunnel");
                        pair.exit.fire(Err(PairError::Transport(err.to_string())));
                        pair.close().await;
                    }
                });
            })
        }));
    }

    async fn open(
        &self,
        dc: Arc<RTCDataChannel>,
        inbound: mpsc::Receiver<Bytes>,
    ) -> Result<(), PairError> {
        if self.id.direction == Direction::Inbound {
            self.adapter.respond().await?;
        }
        let stream = self.adapter.take_stream().ok_or(PairError::Closed)?;
        {
            let mut state = self.state.lock();
            if *state == PairState::Closed {
                return Err(PairError::Closed);
            }
            *state = PairState::Open;
        }
        self.exit.fire(Ok(()));
        info!(target = "pair", pair_id = %self.id, peer = %self.peer(), "tunnel open");
        self.start_pipe(dc, stream, inbound);
        Ok(())
    }

    fn start_pipe(
        &self,
        dc: Arc<RTCDataChannel>,
        stream: DuplexStream,
        mut inbound: mpsc::Receiver<Bytes>,
    ) {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let weak = self.weak.clone();
        let outbound = tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if let Err(err) = dc.send(&Bytes::copy_from_slice(&buf[..n])).await {
                    debug!(target = "pair", error = %err, "data channel send failed");
                    break;
                }
                while dc.buffered_amount().await > MAX_BUFFERED_AMOUNT {
                    sleep(BACKPRESSURE_POLL).await;
                }
            }
            if let Some(pair) = weak.upgrade() {
                pair.close_in_background();
            }
        });

        let weak = self.weak.clone();
        let incoming = tokio::spawn(async move {
            while let Some(data) = inbound.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
            }
            if let Some(pair) = weak.upgrade() {
                pair.close_in_background();
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(outbound);
        tasks.push(incoming);
        if self.is_closed() {
            tasks.drain(..).for_each(|task| task.abort());
        }
    }

    fn transition(&self, next: PairState) {
        let mut state = self.state.lock();
        if *state != PairState::Closed {
            *state = next;
        }
    }

    /// Any setup failure reports through exit and closes the pair.
    async fn fail_closed<T>(&self, result: Result<T, PairError>) -> Result<T, PairError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(target = "pair", pair_id = %self.id, error = %err, "negotiation step failed");
                self.exit.fire(Err(PairError::Transport(err.to_string())));
                self.close().await;
                Err(err)
            }
        }
    }

    fn close_in_background(&self) {
        if let Some(pair) = self.weak.upgrade() {
            tokio::spawn(async move { pair.close().await });
        }
    }
}

#[async_trait]
impl Pair for WebRtcPair {
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
        self.state() == PairState::Open
    }

    fn is_closed(&self) -> bool {
        self.state() == PairState::Closed
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
        self.exit.fire(Err(PairError::Closed));
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(err) = self.pc.close().await {
            debug!(target = "pair", pair_id = %self.id, error = %err, "peer connection close failed");
        }
        self.adapter.close();
        let _ = self.cleanup.send(CleanupNotice {
            key: self.key(),
            serial: self.serial,
        });
        info!(target = "pair", pair_id = %self.id, "pair closed");
    }

    fn negotiated(&self) -> Option<&WebRtcPair> {
        Some(self)
    }
}

fn inbound_queue() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
    mpsc::channel(INBOUND_QUEUE)
}
