//! Typed operations against the signaling service.
//!
//! The service is stateless and polled: there are no push notifications, so
//! "no data yet" arrives as a distinguished empty-poll response that the
//! [`retry`] layer resolves without treating it as a failure.

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::SignalError;

pub mod retry;
pub mod wire;

use retry::call_with_retry;
use wire::{
    AnswerSubmission, CandidateDelivery, CandidateForward, HostIdentity, IceServer, Petition,
    PetitionOffer, PetitionRequest, PollWindowMarker, RoomQuery,
};

/// Environment variable naming the signaling service base URL.
pub const SIGNALING_URL_ENV: &str = "TIDELINK_SIGNALING_URL";

/// The signaling operations the negotiation stack is built on.
///
/// A trait seam so the relay, sessions and host loop can be exercised
/// against scripted implementations in tests.
#[async_trait]
pub trait Signaling: Send + Sync + 'static {
    /// Transport configuration, fetched at most once per process.
    async fn configuration(&self) -> RTCConfiguration;

    /// Long poll for an incoming join petition addressed to `room`.
    async fn poll_petition(&self, room: &str, id: &str) -> Result<Petition, SignalError>;

    /// Resolve a room code to the hosting identity.
    async fn resolve_host(&self, room: &str) -> Result<String, SignalError>;

    /// Submit an offer; the response is the responder's answer.
    async fn submit_petition(
        &self,
        offer: &PetitionOffer,
    ) -> Result<RTCSessionDescription, SignalError>;

    /// Submit an answer addressed to the petitioning identity.
    async fn submit_answer(&self, answer: &AnswerSubmission) -> Result<(), SignalError>;

    /// Forward one locally discovered candidate.
    async fn send_candidate(&self, forward: &CandidateForward) -> Result<(), SignalError>;

    /// Long poll for a candidate addressed to `id`.
    async fn poll_candidate(&self, id: &str) -> Result<CandidateDelivery, SignalError>;
}

/// HTTP implementation of [`Signaling`]: JSON POST bodies, JSON responses,
/// plus one GET for the server list.
pub struct HttpSignaling {
    http: reqwest::Client,
    base: Url,
    configuration: tokio::sync::OnceCell<RTCConfiguration>,
}

impl HttpSignaling {
    pub fn new(base_url: &str) -> Result<Self, SignalError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            configuration: tokio::sync::OnceCell::new(),
        })
    }

    /// Reads the base URL from `TIDELINK_SIGNALING_URL`.
    pub fn from_env() -> Result<Self, SignalError> {
        let base = std::env::var(SIGNALING_URL_ENV).unwrap_or_default();
        Self::new(&base)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SignalError> {
        Ok(self.base.join(path)?)
    }

    /// Maps a response onto the signaling taxonomy: 2xx passes through, the
    /// 404 `{"message": "timeout"}` marker is an empty poll, anything else
    /// is a status failure.
    async fn classify(response: Response) -> Result<Response, SignalError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            if let Ok(marker) = response.json::<PollWindowMarker>().await {
                if marker.is_timeout() {
                    return Err(SignalError::EmptyPoll);
                }
            }
            return Err(SignalError::Status(status));
        }
        Err(SignalError::Status(status))
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, SignalError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let response = self.http.post(url).json(body).send().await?;
        let response = Self::classify(response).await?;
        Ok(response.json().await?)
    }

    /// POST whose acknowledgement body carries nothing we need.
    async fn post_ack<B>(&self, path: &str, body: &B) -> Result<(), SignalError>
    where
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(path)?;
        let response = self.http.post(url).json(body).send().await?;
        Self::classify(response).await?;
        Ok(())
    }

    async fn fetch_servers(&self) -> Result<Vec<IceServer>, SignalError> {
        let url = self.endpoint("servers")?;
        let response = self.http.get(url).send().await?;
        let response = Self::classify(response).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn configuration(&self) -> RTCConfiguration {
        self.configuration
            .get_or_init(|| async {
                let servers = call_with_retry(|| self.fetch_servers()).await;
                debug!(target: "signaling", count = servers.len(), "fetched ice servers");
                let ice_servers = servers
                    .into_iter()
                    .map(|server| RTCIceServer {
                        urls: server.urls,
                        username: server.username.unwrap_or_default(),
                        credential: server.credential.unwrap_or_default(),
                        ..Default::default()
                    })
                    .collect();
                RTCConfiguration {
                    ice_servers,
                    ..Default::default()
                }
            })
            .await
            .clone()
    }

    async fn poll_petition(&self, room: &str, id: &str) -> Result<Petition, SignalError> {
        self.post("petition-request", &PetitionRequest { room, id })
            .await
    }

    async fn resolve_host(&self, room: &str) -> Result<String, SignalError> {
        let identity: HostIdentity = self.post("id-request", &RoomQuery { room }).await?;
        Ok(identity.id)
    }

    async fn submit_petition(
        &self,
        offer: &PetitionOffer,
    ) -> Result<RTCSessionDescription, SignalError> {
        self.post("petition", offer).await
    }

    async fn submit_answer(&self, answer: &AnswerSubmission) -> Result<(), SignalError> {
        self.post_ack("answer", answer).await
    }

    async fn send_candidate(&self, forward: &CandidateForward) -> Result<(), SignalError> {
        self.post_ack("candidate", forward).await
    }

    async fn poll_candidate(&self, id: &str) -> Result<CandidateDelivery, SignalError> {
        #[derive(Serialize)]
        struct CandidateRequest<'a> {
            id: &'a str,
        }
        self.post("candidate-request", &CandidateRequest { id })
            .await
    }
}
