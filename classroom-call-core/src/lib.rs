//! Classroom Call - one-to-one audio/video calls signaled through a document store
//!
//! Two participants exchange a session description offer/answer and ICE
//! candidates by writing documents to a shared store, then media flows
//! directly between their peer connections. It features:
//!
//! - **Document-store signaling**: `calls/{id}` session documents with
//!   `offerCandidates` and `answerCandidates` sub-collections
//! - **Ordered negotiation**: the remote description is applied once and
//!   early candidates are buffered until it is
//! - **Explicit call state machine**: `Idle → Connecting → InCall → Ended`
//!   with guaranteed release of media and subscriptions
//! - **Pluggable seams**: document store, peer connection and media capture
//!   are traits; the `webrtc` crate backs peer connections by default
//!
//! # Examples
//!
//! ```rust,no_run
//! use classroom_call_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), CallError> {
//! let store = Arc::new(MemoryDocumentStore::new());
//! let alice = CallSessionController::builder(
//!     ParticipantId::new("alice").map_err(|e| CallError::Config(e.to_string()))?,
//!     store,
//! )
//! .build()?;
//!
//! let bob = ParticipantId::new("bob").map_err(|e| CallError::Config(e.to_string()))?;
//! let session_id = alice.start_call(&bob, true).await?;
//! println!("calling bob in session {session_id}");
//!
//! alice.hangup().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Participant identity
pub mod identity;

/// Document store abstraction and in-memory store
pub mod store;

/// Signaling over the document store
pub mod signaling;

/// Local and remote media
pub mod media;

/// Peer connection primitive
pub mod rtc;

/// Peer connection lifetime and negotiation ordering
pub mod peer;

/// Call session controller and state machine
pub mod call;

/// Call configuration
pub mod config;

/// `webrtc` crate backend (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

/// Test doubles (requires test-utils feature)
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types at crate root
pub use call::{CallError, CallSessionController, CallSessionControllerBuilder};
pub use config::{CallConfig, ConfigError};
pub use identity::{IdentityError, ParticipantId};
pub use media::{
    LocalMediaState, LocalTrack, MediaCapture, MediaError, MediaPermissions, RemoteMediaState,
    RemoteTrack, SyntheticCapture,
};
pub use peer::{CandidateOutcome, PeerConnectionManager, PeerError};
pub use rtc::{IceServer, RtcConfig, RtcConnection, RtcConnector, RtcError};
pub use signaling::{SignalingChannel, SignalingError, Subscription};
pub use store::{DocumentStore, MemoryDocumentStore, StoreError};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::{WebRtcConnection, WebRtcConnector};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallSessionController};
    pub use crate::config::CallConfig;
    pub use crate::identity::ParticipantId;
    pub use crate::media::{MediaCapture, SyntheticCapture};
    pub use crate::signaling::SignalingChannel;
    pub use crate::store::{DocumentStore, MemoryDocumentStore};
    pub use crate::types::{CallEvent, CallState, EndReason, SessionId};
    #[cfg(feature = "webrtc-backend")]
    pub use crate::webrtc_backend::WebRtcConnector;
}
