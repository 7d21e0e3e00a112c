//! Bodies and responses of the signaling wire contract.
//!
//! Session descriptions and candidates ride the `webrtc` crate's own serde
//! shapes (`{type, sdp}` and camelCase `RTCIceCandidateInit`), so nothing
//! here interprets their contents.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// One relay/reflection server descriptor from the `servers` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Long-poll request for an incoming join.
#[derive(Debug, Serialize)]
pub struct PetitionRequest<'a> {
    pub room: &'a str,
    pub id: &'a str,
}

/// A join request: the initiator's offer, display name and identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Petition {
    pub offer: RTCSessionDescription,
    pub user: String,
    pub id: String,
}

/// Room-code lookup used by the initiator to address its petition.
#[derive(Debug, Serialize)]
pub struct RoomQuery<'a> {
    pub room: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct HostIdentity {
    pub id: String,
}

/// Offer submission; the response is the responder's answer description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PetitionOffer {
    pub offer: RTCSessionDescription,
    pub id: String,
    pub user: String,
    pub target_id: String,
}

/// Answer addressed back to the petitioning identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSubmission {
    pub answer: RTCSessionDescription,
    pub target_id: String,
}

/// One connectivity candidate forwarded between identities.
///
/// `candidate: None` is the end-of-candidates sentinel; it is forwarded so
/// the remote side can observe gathering completion, and `candidate_id`
/// lets the service deduplicate resubmissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateForward {
    pub candidate: Option<RTCIceCandidateInit>,
    pub candidate_id: String,
    pub id: String,
    pub target_id: String,
}

/// Candidate delivered by the `candidate-request` long poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateDelivery {
    pub candidate: Option<RTCIceCandidateInit>,
    pub target_id: String,
}

/// Body of the empty-poll marker: HTTP 404 with `{"message": "timeout"}`.
#[derive(Debug, Deserialize)]
pub struct PollWindowMarker {
    pub message: String,
}

impl PollWindowMarker {
    pub fn is_timeout(&self) -> bool {
        self.message == "timeout"
    }
}
