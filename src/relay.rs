//! Per-identity candidate relay.
//!
//! Candidates arrive asynchronously and out of order relative to the
//! offer/answer exchange, so they are forwarded eagerly in both directions:
//! outbound through a per-identity queue that preserves send order, inbound
//! through one long-poll loop that runs only while at least one registered
//! session is still negotiating.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::signaling::Signaling;
use crate::signaling::retry::{call_with_retry, poll_once};
use crate::signaling::wire::CandidateForward;

/// What the relay needs from a registered peer transport session.
#[async_trait]
pub trait RelayPeer: Send + Sync {
    async fn apply_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), webrtc::Error>;

    /// True once the session can make no further progress: closed, failed,
    /// or connected with gathering complete.
    fn is_terminal(&self) -> bool;
}

struct RelayState {
    connections: HashMap<String, Arc<dyn RelayPeer>>,
    active: bool,
}

/// Forwards locally discovered candidates and polls for remote ones, for
/// every pending negotiation of one local identity.
pub struct CandidateRelay {
    id: String,
    signaling: Arc<dyn Signaling>,
    state: Mutex<RelayState>,
    outbound: mpsc::UnboundedSender<CandidateForward>,
}

impl CandidateRelay {
    pub fn new(id: String, signaling: Arc<dyn Signaling>) -> Arc<Self> {
        let (outbound, mut queued) = mpsc::unbounded_channel::<CandidateForward>();
        let relay = Arc::new(Self {
            id,
            signaling: signaling.clone(),
            state: Mutex::new(RelayState {
                connections: HashMap::new(),
                active: false,
            }),
            outbound,
        });

        // One drain task per identity keeps candidate submission order
        // intact; a failing send delays only this identity's queue.
        tokio::spawn(async move {
            while let Some(forward) = queued.recv().await {
                call_with_retry(|| signaling.send_candidate(&forward)).await;
            }
        });

        relay
    }

    /// Registers a negotiating session under the remote identity its
    /// candidates will arrive from. Activates the poll loop if it was idle.
    /// Re-registering a target replaces the stale session's entry.
    pub fn register(self: &Arc<Self>, peer: Arc<dyn RelayPeer>, target_id: &str) {
        let activate = {
            let mut state = self.state.lock().unwrap();
            state.connections.insert(target_id.to_string(), peer);
            if state.active {
                false
            } else {
                state.active = true;
                true
            }
        };
        if activate {
            let relay = self.clone();
            tokio::spawn(relay.poll_loop());
        }
    }

    /// Hook for a session's local candidate events. `None` (end of
    /// candidates) is forwarded too, so the remote side observes gathering
    /// completion.
    pub fn forwarder(
        self: &Arc<Self>,
        target_id: String,
    ) -> impl Fn(Option<RTCIceCandidateInit>) + Send + Sync + 'static {
        let outbound = self.outbound.clone();
        let id = self.id.clone();
        move |candidate| {
            let forward = CandidateForward {
                candidate,
                candidate_id: Uuid::new_v4().to_string(),
                id: id.clone(),
                target_id: target_id.clone(),
            };
            let _ = outbound.send(forward);
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        trace!(target: "relay", id = %self.id, "candidate poll activated");
        loop {
            if let Some(delivery) = poll_once(self.signaling.poll_candidate(&self.id)).await {
                let peer = {
                    let state = self.state.lock().unwrap();
                    state.connections.get(&delivery.target_id).cloned()
                };
                match (peer, delivery.candidate) {
                    (Some(peer), Some(candidate)) => {
                        if let Err(err) = peer.apply_candidate(candidate).await {
                            debug!(target: "relay", error = %err, "failed to apply remote candidate");
                        }
                    }
                    // End-of-candidates sentinel; nothing to apply.
                    (Some(_), None) => {}
                    (None, _) => {
                        trace!(
                            target: "relay",
                            target_id = %delivery.target_id,
                            "dropping candidate for unregistered target"
                        );
                    }
                }
            }
            if !self.prune() {
                break;
            }
        }
        trace!(target: "relay", id = %self.id, "candidate poll deactivated");
    }

    /// Drops sessions that reached a terminal state; returns whether any
    /// pending negotiation remains.
    fn prune(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.connections.retain(|_, peer| !peer.is_terminal());
        state.active = !state.connections.is_empty();
        state.active
    }

    #[cfg(test)]
    fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }
}
