//! Local and remote media for a call
//!
//! # Architecture
//!
//! The `MediaCapture` trait abstracts the platform's device access:
//! - `SyntheticCapture` - Produces track handles according to a permission policy
//!
//! Captured tracks are plain handles (`LocalTrack`) with a shared stopped flag;
//! the peer connection backend decides how a handle maps onto a real sender.
//! Stopping is idempotent so a track released by an early abort is not
//! released a second time on hangup.

use crate::types::{MediaConstraints, MediaKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused access to a device
    #[error("Permission denied for {0:?} device")]
    PermissionDenied(MediaKind),

    /// Device not found
    #[error("Device not found: {0:?}")]
    DeviceNotFound(MediaKind),

    /// Capture failed for another reason
    #[error("Capture error: {0}")]
    CaptureError(String),
}

/// Handle to one captured local track
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    label: String,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create a live track handle
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        let prefix = match kind {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        };
        Self {
            id: format!("{prefix}-{}", Uuid::new_v4().simple()),
            kind,
            label: label.into(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Media kind
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Device label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stop the track; returns `true` only for the call that stopped it
    pub fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!(track_id = %self.id, kind = ?self.kind, "Local track stopped");
        }
        first
    }

    /// Whether the track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The caller's own audio/video tracks for one call
#[derive(Debug, Clone, Default)]
pub struct LocalMediaState {
    tracks: Vec<LocalTrack>,
}

impl LocalMediaState {
    /// Wrap captured tracks
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    /// All tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Whether a video track was captured
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == MediaKind::Video)
    }

    /// Stop every track; returns how many were newly stopped
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    /// Whether every track is stopped
    pub fn is_released(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_stopped)
    }
}

/// Track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
    /// Stream the track belongs to
    pub stream_id: String,
}

/// Stream of tracks received from the peer, surfaced for rendering
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMediaState {
    tracks: Vec<RemoteTrack>,
}

impl RemoteMediaState {
    /// Record a track; a track id seen before is ignored
    pub fn add(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// All remote tracks
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    /// Whether nothing has been received
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Forget all tracks
    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}

/// Access to the local camera and microphone
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Request the devices named by `constraints`
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::PermissionDenied`] if access is refused. Nothing
    /// stays acquired when an error is returned.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaState, MediaError>;
}

/// Device permissions granted to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaPermissions {
    /// Microphone access allowed
    pub microphone: bool,
    /// Camera access allowed
    pub camera: bool,
}

impl Default for MediaPermissions {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
        }
    }
}

/// Capture that hands out track handles according to a permission policy
///
/// Used where no real device layer exists (headless runs, the CLI demo, tests).
#[derive(Debug, Clone, Default)]
pub struct SyntheticCapture {
    permissions: MediaPermissions,
}

impl SyntheticCapture {
    /// Create a capture with the given permissions
    #[must_use]
    pub fn new(permissions: MediaPermissions) -> Self {
        Self { permissions }
    }

    /// Capture where the camera is refused
    #[must_use]
    pub fn camera_denied() -> Self {
        Self::new(MediaPermissions {
            microphone: true,
            camera: false,
        })
    }

    fn allowed(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.permissions.microphone,
            MediaKind::Video => self.permissions.camera,
        }
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    #[tracing::instrument(skip(self))]
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaState, MediaError> {
        let kinds = constraints.kinds();
        if kinds.is_empty() {
            return Err(MediaError::CaptureError(
                "no media kinds requested".to_string(),
            ));
        }
        // Permission is all-or-nothing, like a browser prompt for camera+mic.
        if let Some(denied) = kinds.iter().copied().find(|k| !self.allowed(*k)) {
            tracing::warn!(kind = ?denied, "Media permission denied");
            return Err(MediaError::PermissionDenied(denied));
        }

        let tracks = kinds
            .into_iter()
            .map(|kind| {
                let label = match kind {
                    MediaKind::Audio => "Synthetic Microphone",
                    MediaKind::Video => "Synthetic Camera",
                };
                LocalTrack::new(kind, label)
            })
            .collect::<Vec<_>>();

        tracing::debug!(tracks = tracks.len(), "Local media acquired");
        Ok(LocalMediaState::new(tracks))
    }
}
