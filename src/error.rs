use reqwest::StatusCode;
use thiserror::Error;

/// Failure of a single signaling request.
///
/// `EmptyPoll` is not a real failure: it is the service reporting that a
/// long poll window elapsed with no data. The retry layer resolves it as
/// "no data yet" and it never reaches callers above that layer.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signaling request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("signaling service returned status {0}")]
    Status(StatusCode),
    #[error("no data within the poll window")]
    EmptyPoll,
    #[error("invalid signaling url: {0}")]
    Url(#[from] url::ParseError),
}

/// Failure of one negotiation attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("negotiation timed out before the channel opened")]
    Timeout,
    #[error("peer transport failed: {0}")]
    Transport(#[from] webrtc::Error),
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalError),
    #[error("data channel closed during negotiation")]
    ChannelClosed,
}

/// Failure of a send on an established channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("peer transport failed: {0}")]
    Transport(#[from] webrtc::Error),
}
