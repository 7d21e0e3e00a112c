//! Wrapper over the `webrtc` crate's peer transport capability.
//!
//! [`PeerSession`] is the negotiation-time handle: it owns the peer
//! connection plus the pre-negotiated data channel and turns the capability's
//! event callbacks into awaitable state. [`Channel`] is what a finished
//! negotiation yields to callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, trace};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{ChannelError, ConnectError};
use crate::relay::RelayPeer;

/// Channel id agreed out of band by both roles, so no "channel announced"
/// handshake is needed.
const CHANNEL_LABEL: &str = "data";
const CHANNEL_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Pending,
    Open,
    Closed,
}

/// One payload received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

struct PeerCore {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    state_rx: watch::Receiver<ChannelState>,
    gathering_complete: Arc<AtomicBool>,
}

impl PeerCore {
    fn terminal(&self) -> bool {
        match self.pc.connection_state() {
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => true,
            // Connected and done gathering: nothing further can arrive for
            // this session, so the relay may drop it.
            RTCPeerConnectionState::Connected => self.gathering_complete.load(Ordering::SeqCst),
            _ => false,
        }
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
        let _ = self.pc.close().await;
        self.state_tx.send_replace(ChannelState::Closed);
    }
}

#[async_trait]
impl RelayPeer for PeerCore {
    async fn apply_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), webrtc::Error> {
        self.pc.add_ice_candidate(candidate).await
    }

    fn is_terminal(&self) -> bool {
        self.terminal()
    }
}

/// A peer transport session under negotiation.
pub struct PeerSession {
    core: Arc<PeerCore>,
    inbound: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl PeerSession {
    /// Builds the peer connection and its pre-negotiated data channel, and
    /// wires the capability's callbacks into awaitable state.
    pub async fn connect(config: RTCConfiguration) -> Result<Self, webrtc::Error> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let init = RTCDataChannelInit {
            negotiated: Some(CHANNEL_ID),
            ..Default::default()
        };
        let dc = pc.create_data_channel(CHANNEL_LABEL, Some(init)).await?;

        let (state_tx, state_rx) = watch::channel(ChannelState::Pending);
        let state_tx = Arc::new(state_tx);

        let open_tx = state_tx.clone();
        dc.on_open(Box::new(move || {
            trace!(target: "webrtc", "data channel open");
            open_tx.send_if_modified(|state| {
                if *state == ChannelState::Pending {
                    *state = ChannelState::Open;
                    true
                } else {
                    false
                }
            });
            Box::pin(async {})
        }));

        // A closed channel takes the whole session with it; hold the peer
        // connection weakly so the callback does not keep it alive.
        let close_tx = state_tx.clone();
        let weak_pc = Arc::downgrade(&pc);
        dc.on_close(Box::new(move || {
            trace!(target: "webrtc", "data channel closed");
            close_tx.send_replace(ChannelState::Closed);
            let pc = weak_pc.upgrade();
            Box::pin(async move {
                if let Some(pc) = pc {
                    let _ = pc.close().await;
                }
            })
        }));

        let gathering_complete = Arc::new(AtomicBool::new(false));
        let gathering_flag = gathering_complete.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            if state == RTCIceGathererState::Complete {
                gathering_flag.store(true, Ordering::SeqCst);
            }
            Box::pin(async {})
        }));

        let failure_tx = state_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            trace!(target: "webrtc", ?state, "peer connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                failure_tx.send_replace(ChannelState::Closed);
            }
            Box::pin(async {})
        }));

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let payload = if message.is_string {
                ChannelMessage::Text(String::from_utf8_lossy(&message.data).into_owned())
            } else {
                ChannelMessage::Binary(message.data.clone())
            };
            let _ = inbound_tx.send(payload);
            Box::pin(async {})
        }));

        Ok(Self {
            core: Arc::new(PeerCore {
                pc,
                dc,
                state_tx,
                state_rx,
                gathering_complete,
            }),
            inbound,
        })
    }

    /// Handle the candidate relay holds for this session.
    pub fn relay_handle(&self) -> Arc<dyn RelayPeer> {
        self.core.clone()
    }

    /// Subscribes `hook` to locally discovered candidates. A `None`
    /// candidate is the end-of-candidates sentinel.
    pub fn on_local_candidate<F>(&self, hook: F)
    where
        F: Fn(Option<RTCIceCandidateInit>) + Send + Sync + 'static,
    {
        self.core
            .pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let init = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(init),
                        Err(err) => {
                            debug!(target: "webrtc", error = %err, "dropping unserializable candidate");
                            return Box::pin(async {});
                        }
                    },
                    None => None,
                };
                hook(init);
                Box::pin(async {})
            }));
    }

    pub async fn create_offer_and_apply(&self) -> Result<RTCSessionDescription, webrtc::Error> {
        let offer = self.core.pc.create_offer(None).await?;
        self.core.pc.set_local_description(offer.clone()).await?;
        Ok(self.core.pc.local_description().await.unwrap_or(offer))
    }

    pub async fn create_answer_and_apply(&self) -> Result<RTCSessionDescription, webrtc::Error> {
        let answer = self.core.pc.create_answer(None).await?;
        self.core.pc.set_local_description(answer.clone()).await?;
        Ok(self.core.pc.local_description().await.unwrap_or(answer))
    }

    pub async fn apply_remote(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), webrtc::Error> {
        self.core.pc.set_remote_description(description).await
    }

    /// Suspends until the data channel opens. Errors when the channel or the
    /// peer connection reaches a terminal state first. No internal timeout;
    /// the negotiation session bounds the wait.
    pub async fn wait_channel_open(&self) -> Result<(), ConnectError> {
        match self.core.dc.ready_state() {
            RTCDataChannelState::Open => return Ok(()),
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => {
                return Err(ConnectError::ChannelClosed);
            }
            _ => {}
        }
        let mut state = self.core.state_rx.clone();
        loop {
            match *state.borrow_and_update() {
                ChannelState::Open => return Ok(()),
                ChannelState::Closed => return Err(ConnectError::ChannelClosed),
                ChannelState::Pending => {}
            }
            if state.changed().await.is_err() {
                return Err(ConnectError::ChannelClosed);
            }
        }
    }

    pub async fn close(&self) {
        self.core.close().await;
    }

    /// Converts a successfully opened session into the channel handed to
    /// callers.
    pub fn into_channel(self) -> Channel {
        Channel {
            inner: Arc::new(ChannelInner {
                core: self.core,
                inbound: AsyncMutex::new(self.inbound),
            }),
        }
    }
}

struct ChannelInner {
    core: Arc<PeerCore>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<ChannelMessage>>,
}

/// A bidirectional text/byte channel to one remote peer. Clones share the
/// underlying channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.inner.core.dc.send_text(text.to_string()).await?;
        Ok(())
    }

    pub async fn send_bytes(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.inner
            .core
            .dc
            .send(&Bytes::copy_from_slice(bytes))
            .await?;
        Ok(())
    }

    /// Next inbound payload; `None` once the channel has closed and its
    /// backlog is drained.
    pub async fn recv(&self) -> Option<ChannelMessage> {
        let mut inbound = self.inner.inbound.lock().await;
        tokio::select! {
            biased;
            message = inbound.recv() => message,
            _ = self.closed() => inbound.try_recv().ok(),
        }
    }

    /// True when both handles refer to the same underlying channel.
    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.core.state_rx.borrow() == ChannelState::Closed
            || matches!(
                self.inner.core.dc.ready_state(),
                RTCDataChannelState::Closing | RTCDataChannelState::Closed
            )
    }

    /// Resolves once the channel reaches its closed state.
    pub async fn closed(&self) {
        let mut state = self.inner.core.state_rx.clone();
        loop {
            if *state.borrow_and_update() == ChannelState::Closed {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn close(&self) {
        self.inner.core.close().await;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.inner.core.dc.label())
            .field("closed", &self.is_closed())
            .finish()
    }
}
