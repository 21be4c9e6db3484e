//! Call signaling types and data structures

use crate::identity::ParticipantId;
use crate::media::RemoteTrack;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a call session (also the session document id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
}

/// SDP offer or answer as stored on the session document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP payload
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Which side of the handshake contributed a candidate
///
/// Each role has its own append-only sub-collection under the session document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateRole {
    /// Candidates gathered by the caller
    Offer,
    /// Candidates gathered by the callee
    Answer,
}

impl CandidateRole {
    /// Name of the sub-collection holding this role's candidates
    pub fn collection_name(self) -> &'static str {
        match self {
            Self::Offer => "offerCandidates",
            Self::Answer => "answerCandidates",
        }
    }

    /// The role of the other party
    pub fn opposite(self) -> Self {
        match self {
            Self::Offer => Self::Answer,
            Self::Answer => Self::Offer,
        }
    }
}

/// One ICE candidate: opaque candidate line plus SDP metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    /// Candidate attribute line
    pub candidate: String,
    /// SDP media ID
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidatePayload {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// Set the media id and line index
    #[must_use]
    pub fn with_media(mut self, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_mline_index = Some(sdp_mline_index);
        self
    }
}

/// Candidate record as stored in a role sub-collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    /// Contributing side
    pub role: CandidateRole,
    /// Candidate payload
    #[serde(flatten)]
    pub payload: IceCandidatePayload,
}

impl IceCandidateRecord {
    /// Tag a payload with its role
    pub fn new(role: CandidateRole, payload: IceCandidatePayload) -> Self {
        Self { role, payload }
    }

    /// Check the record is usable when read from `expected`'s sub-collection
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the record is rejected
    pub fn validate(&self, expected: CandidateRole) -> Result<(), String> {
        if self.role != expected {
            return Err(format!(
                "candidate tagged {:?} found in {} collection",
                self.role,
                expected.collection_name()
            ));
        }
        if self.payload.candidate.trim().is_empty() {
            return Err("empty candidate line".to_string());
        }
        Ok(())
    }
}

/// Session document: one call attempt between a caller and a callee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    /// Identity of the caller
    pub caller_id: ParticipantId,
    /// Identity of the callee
    pub callee_id: ParticipantId,
    /// Offer written by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    /// Answer written once by the callee
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    /// Fresh session with no offer and no answer
    pub fn new(caller_id: ParticipantId, callee_id: ParticipantId) -> Self {
        Self {
            caller_id,
            callee_id,
            offer: None,
            answer: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the callee has answered
    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

/// Media constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Constraints for a call that wants video or not
    pub fn for_call(want_video: bool) -> Self {
        if want_video {
            Self::video_call()
        } else {
            Self::audio_only()
        }
    }

    /// Media kinds requested, audio first
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// Which side of the call this controller plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Created the session and wrote the offer
    Caller,
    /// Read the offer and wrote the answer
    Callee,
}

impl CallRole {
    /// Sub-collection this side appends its own candidates to
    pub fn local_candidate_role(self) -> CandidateRole {
        match self {
            Self::Caller => CandidateRole::Offer,
            Self::Callee => CandidateRole::Answer,
        }
    }
}

/// Call state enumeration
///
/// ```text
///   Idle ──start_call/answer_call──► Connecting ──remote track──► InCall
///                                        │                          │
///                                        └──── error / hangup ──► Ended ◄┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No call attempted yet
    Idle,
    /// Signaling and negotiation in progress
    Connecting,
    /// Remote media is flowing
    InCall,
    /// Call attempt is over
    Ended,
}

impl CallState {
    /// Whether a new call may be started from this state
    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Ended)
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    HungUp,
    /// The other participant ended the call and its session was deleted
    RemoteHungUp,
    /// Document store unreachable
    SignalingUnavailable,
    /// Camera or microphone access refused
    MediaPermissionDenied,
    /// Devices could not be opened for another reason
    MediaUnavailable,
    /// Someone else already answered the session
    SessionAlreadyAnswered,
    /// Session document does not exist
    SessionNotFound,
    /// Session has no offer to answer
    OfferMissing,
    /// Local user is not the session's callee
    NotCallee,
    /// Peer connection failed
    ConnectionFailed,
}

impl EndReason {
    /// Whether the call ended because of a failure
    pub fn is_error(self) -> bool {
        !matches!(self, Self::HungUp | Self::RemoteHungUp)
    }

    /// Message suitable for showing to the user
    pub fn user_message(self) -> &'static str {
        match self {
            Self::HungUp => "Call ended.",
            Self::RemoteHungUp => "The other participant ended the call.",
            Self::SignalingUnavailable => {
                "Could not reach the call service. Check your connection and try again."
            }
            Self::MediaPermissionDenied => {
                "Camera or microphone access was denied. Allow access in your browser or system settings and start the call again."
            }
            Self::MediaUnavailable => "No camera or microphone could be opened.",
            Self::SessionAlreadyAnswered => "This call was already answered on another device.",
            Self::SessionNotFound => "This call no longer exists.",
            Self::OfferMissing => "The caller has not finished setting up this call yet.",
            Self::NotCallee => "This call is addressed to someone else.",
            Self::ConnectionFailed => "The connection to the other participant failed.",
        }
    }
}

/// Call event for notifications
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// State transition
    StateChanged {
        /// Session the transition belongs to, if one was created
        session_id: Option<SessionId>,
        /// Previous state
        from: CallState,
        /// New state
        to: CallState,
    },
    /// Remote media became available
    RemoteTrackAdded {
        /// Session identifier
        session_id: SessionId,
        /// The remote track
        track: RemoteTrack,
    },
    /// A remote candidate could not be buffered and was discarded
    CandidateDropped {
        /// Session identifier
        session_id: SessionId,
        /// Candidate line
        candidate: String,
    },
    /// Call ended
    CallEnded {
        /// Session identifier, if one was created
        session_id: Option<SessionId>,
        /// Why it ended
        reason: EndReason,
    },
}
