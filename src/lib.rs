//! Direct peer-to-peer data channels between a room host and its joiners.
//!
//! One side opens a room under a short shareable code and accepts any number
//! of joiners; the other side joins a room once by code and display name.
//! The two exchange session descriptions and connectivity candidates through
//! a stateless polled-HTTP signaling service until a direct channel opens,
//! after which the service plays no further part.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidelink::{Host, HttpSignaling, random_room_code};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let signaling = Arc::new(HttpSignaling::from_env()?);
//! let room = random_room_code();
//! let host = Host::open(signaling.clone(), room.clone());
//! while let Some((user, channel)) = host.next_channel().await {
//!     channel.send_text(&format!("welcome, {user}")).await?;
//! }
//!
//! // Elsewhere, a joiner:
//! let channel = tidelink::connect(signaling, &room, "alice").await?;
//! channel.send_text("hello").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

pub mod error;
mod host;
pub mod relay;
mod session;
pub mod signaling;
pub mod transport;

pub use error::{ChannelError, ConnectError, SignalError};
pub use host::Host;
pub use session::DEFAULT_OPEN_TIMEOUT;
pub use signaling::{HttpSignaling, SIGNALING_URL_ENV, Signaling};
pub use transport::{Channel, ChannelMessage};

/// Joins `room` as `user` and resolves once the direct channel is open.
///
/// One attempt with the default timeout; failures and timeouts surface to
/// the caller, who decides whether to try again.
pub async fn connect(
    signaling: Arc<dyn Signaling>,
    room: &str,
    user: &str,
) -> Result<Channel, ConnectError> {
    connect_with_timeout(signaling, room, user, DEFAULT_OPEN_TIMEOUT).await
}

pub async fn connect_with_timeout(
    signaling: Arc<dyn Signaling>,
    room: &str,
    user: &str,
    open_timeout: Duration,
) -> Result<Channel, ConnectError> {
    session::initiate(&signaling, room, user, open_timeout).await
}

/// A four-digit room code, zero padded. Collisions are the service's
/// problem, not ours.
pub fn random_room_code() -> String {
    format!("{:04}", rand::thread_rng().gen_range(0..10_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_codes_are_four_digits() {
        for _ in 0..100 {
            let code = random_room_code();
            assert_eq!(code.len(), 4);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
