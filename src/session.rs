//! One negotiation session: the sequence turning an offer/answer exchange
//! plus relayed candidates into a usable channel for exactly one peer pair.
//!
//! Both roles bound the whole exchange-and-open sequence with one timeout;
//! on timeout or failure the peer transport session is torn down and the
//! rejection surfaced to the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::error::ConnectError;
use crate::relay::CandidateRelay;
use crate::signaling::Signaling;
use crate::signaling::retry::call_with_retry;
use crate::signaling::wire::{AnswerSubmission, Petition, PetitionOffer};
use crate::transport::{Channel, PeerSession};

/// Bound on one negotiation, from description exchange to channel open.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Responder role: answers a received petition. On success yields the
/// petitioner's display name with the opened channel.
pub(crate) async fn respond(
    signaling: &Arc<dyn Signaling>,
    relay: &Arc<CandidateRelay>,
    petition: Petition,
    open_timeout: Duration,
) -> Result<(String, Channel), ConnectError> {
    let config = signaling.configuration().await;
    let session = PeerSession::connect(config).await?;
    let Petition {
        offer,
        user,
        id: target_id,
    } = petition;

    let outcome = timeout(open_timeout, async {
        session.apply_remote(offer).await?;
        // Registered before anything yields to the relay's poll loop, so no
        // inbound candidate for this target is dropped.
        relay.register(session.relay_handle(), &target_id);
        session.on_local_candidate(relay.forwarder(target_id.clone()));
        let answer = session.create_answer_and_apply().await?;
        signaling
            .submit_answer(&AnswerSubmission {
                answer,
                target_id: target_id.clone(),
            })
            .await?;
        debug!(target: "session", target_id = %target_id, "answer submitted; waiting for channel");
        session.wait_channel_open().await
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok((user, session.into_channel())),
        Ok(Err(err)) => {
            session.close().await;
            Err(err)
        }
        Err(_) => {
            session.close().await;
            Err(ConnectError::Timeout)
        }
    }
}

/// Initiator role: submits a petition to a room and waits for the answered
/// channel to open.
pub(crate) async fn initiate(
    signaling: &Arc<dyn Signaling>,
    room: &str,
    user: &str,
    open_timeout: Duration,
) -> Result<Channel, ConnectError> {
    let config = signaling.configuration().await;
    let session = PeerSession::connect(config).await?;
    let id = Uuid::new_v4().to_string();
    let relay = CandidateRelay::new(id.clone(), signaling.clone());

    let outcome = timeout(open_timeout, async {
        let target_id = call_with_retry(|| signaling.resolve_host(room)).await;
        debug!(target: "session", room = %room, target_id = %target_id, "resolved host identity");
        // Candidate hook is in place before the offer starts gathering.
        session.on_local_candidate(relay.forwarder(target_id.clone()));
        let offer = session.create_offer_and_apply().await?;
        let answer = signaling
            .submit_petition(&PetitionOffer {
                offer,
                id: id.clone(),
                user: user.to_string(),
                target_id: target_id.clone(),
            })
            .await?;
        session.apply_remote(answer).await?;
        relay.register(session.relay_handle(), &target_id);
        session.wait_channel_open().await
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(session.into_channel()),
        Ok(Err(err)) => {
            session.close().await;
            Err(err)
        }
        Err(_) => {
            session.close().await;
            Err(ConnectError::Timeout)
        }
    }
}
