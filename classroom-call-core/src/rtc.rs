//! Real-time connection primitive
//!
//! Standard offer/answer/ICE semantics plus local-candidate and remote-track
//! events. The `webrtc_backend` module implements these traits over the
//! `webrtc` crate; tests use the fakes in `testing`.

use crate::media::{LocalTrack, RemoteTrack};
use crate::types::{IceCandidatePayload, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Public relay-discovery servers used when nothing else is configured.
///
/// STUN only: peers that are both behind symmetric NAT will not connect.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Connection primitive errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtcError {
    /// Connection could not be created
    #[error("Failed to create peer connection: {0}")]
    Create(String),

    /// Offer/answer negotiation failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Candidate was rejected
    #[error("Invalid ICE candidate: {0}")]
    Candidate(String),

    /// Track could not be attached
    #[error("Track error: {0}")]
    Track(String),

    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:` or `turn:`)
    pub urls: Vec<String>,
}

/// Peer connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// Relay-discovery servers
    pub ice_servers: Vec<IceServer>,
    /// Candidates to pre-gather before an offer is created
    pub ice_candidate_pool_size: u8,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            }],
            ice_candidate_pool_size: 10,
        }
    }
}

/// Receives each locally discovered candidate
pub type LocalCandidateHandler = Arc<dyn Fn(IceCandidatePayload) + Send + Sync>;

/// Receives each remote track as it arrives
pub type RemoteTrackHandler = Arc<dyn Fn(RemoteTrack) + Send + Sync>;

/// One peer connection
#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Attach a local track so it is sent to the peer
    async fn add_track(&self, track: &LocalTrack) -> Result<(), RtcError>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;

    /// Create an answer and apply it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    /// Apply the peer's description
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), RtcError>;

    /// Feed one remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), RtcError>;

    /// Install the local candidate handler, replacing any previous one
    fn on_local_candidate(&self, handler: LocalCandidateHandler);

    /// Install the remote track handler, replacing any previous one
    fn on_remote_track(&self, handler: RemoteTrackHandler);

    /// Close the connection
    async fn close(&self) -> Result<(), RtcError>;
}

/// Factory for peer connections
#[async_trait]
pub trait RtcConnector: Send + Sync {
    /// Build a new connection
    async fn connect(&self, config: &RtcConfig) -> Result<Arc<dyn RtcConnection>, RtcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_two_stun_servers() {
        let config = RtcConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls.len(), 2);
        assert!(config.ice_servers[0]
            .urls
            .iter()
            .all(|url| url.starts_with("stun:")));
    }
}
