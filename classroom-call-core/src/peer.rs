//! Peer connection lifetime management
//!
//! Wraps one [`RtcConnection`] for the duration of one call and owns its local
//! tracks. Two ordering rules are enforced here rather than left to callers:
//!
//! - the remote description is applied at most once; later attempts are no-ops
//! - remote candidates arriving before the remote description are held in a
//!   bounded buffer and replayed, in arrival order, right after it is applied

use crate::media::{LocalMediaState, MediaCapture, MediaError, RemoteMediaState, RemoteTrack};
use crate::rtc::{RtcConfig, RtcConnection, RtcConnector, RtcError};
use crate::types::{IceCandidatePayload, MediaConstraints, SdpKind, SessionDescription};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Default number of remote candidates held before the remote description
pub const DEFAULT_CANDIDATE_BUFFER_CAPACITY: usize = 32;

/// Peer connection manager errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Underlying connection failed
    #[error(transparent)]
    Rtc(#[from] RtcError),

    /// Local media could not be captured
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Early-candidate buffer full; candidate discarded
    #[error("Early candidate dropped: buffer of {capacity} is full")]
    EarlyCandidateDropped {
        /// Buffer capacity
        capacity: usize,
    },

    /// Operation not valid in the current negotiation state
    #[error("Invalid negotiation state: {0}")]
    InvalidState(&'static str),

    /// Manager already closed
    #[error("Peer connection manager closed")]
    Closed,
}

/// What happened to a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Fed to the connection
    Applied,
    /// Held until the remote description is set
    Buffered,
    /// Already applied or buffered; ignored
    Duplicate,
}

#[derive(Default)]
struct Negotiation {
    remote_description: Option<SdpKind>,
    pending: VecDeque<IceCandidatePayload>,
    applied: HashSet<IceCandidatePayload>,
}

type CandidateCallback = Arc<dyn Fn(IceCandidatePayload) + Send + Sync>;
type TrackCallback = Arc<dyn Fn(RemoteTrack) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    local_candidate: Option<CandidateCallback>,
    remote_track: Option<TrackCallback>,
}

/// Owner of a single peer connection and its media
pub struct PeerConnectionManager {
    connection: Arc<dyn RtcConnection>,
    callbacks: Arc<Mutex<Callbacks>>,
    local_media: Mutex<Option<LocalMediaState>>,
    remote_media: Arc<Mutex<RemoteMediaState>>,
    negotiation: tokio::sync::Mutex<Negotiation>,
    closed: Arc<AtomicBool>,
    buffer_capacity: usize,
}

impl PeerConnectionManager {
    /// Open a connection using `config`'s relay-discovery servers
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Rtc`] if the connection cannot be built
    #[tracing::instrument(skip(connector, config), fields(ice_servers = config.ice_servers.len()))]
    pub async fn open(
        connector: &dyn RtcConnector,
        config: &RtcConfig,
        buffer_capacity: usize,
    ) -> Result<Self, PeerError> {
        let connection = connector.connect(config).await?;
        let callbacks = Arc::new(Mutex::new(Callbacks::default()));
        let remote_media = Arc::new(Mutex::new(RemoteMediaState::default()));
        let closed = Arc::new(AtomicBool::new(false));

        {
            let callbacks = Arc::clone(&callbacks);
            let closed = Arc::clone(&closed);
            connection.on_local_candidate(Arc::new(move |candidate| {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                let callback = callbacks.lock().local_candidate.clone();
                match callback {
                    Some(callback) => callback(candidate),
                    None => tracing::trace!("Local candidate discarded, no listener"),
                }
            }));
        }

        {
            let callbacks = Arc::clone(&callbacks);
            let closed = Arc::clone(&closed);
            let remote_media = Arc::clone(&remote_media);
            connection.on_remote_track(Arc::new(move |track| {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                if !remote_media.lock().add(track.clone()) {
                    return;
                }
                tracing::debug!(track_id = %track.id, kind = ?track.kind, "Remote track added");
                let callback = callbacks.lock().remote_track.clone();
                if let Some(callback) = callback {
                    callback(track);
                }
            }));
        }

        tracing::debug!("Peer connection opened");
        Ok(Self {
            connection,
            callbacks,
            local_media: Mutex::new(None),
            remote_media,
            negotiation: tokio::sync::Mutex::new(Negotiation::default()),
            closed,
            buffer_capacity: buffer_capacity.max(1),
        })
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Capture microphone (plus camera if `want_video`) and attach every track
    ///
    /// If the manager is closed while capture is pending, the captured tracks
    /// are stopped and [`PeerError::Closed`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Media`] if capture fails, including permission
    /// refusal
    #[tracing::instrument(skip(self, capture))]
    pub async fn attach_local_media(
        &self,
        capture: &dyn MediaCapture,
        want_video: bool,
    ) -> Result<LocalMediaState, PeerError> {
        self.ensure_open()?;
        let media = capture
            .acquire(&MediaConstraints::for_call(want_video))
            .await?;

        {
            let mut slot = self.local_media.lock();
            if self.closed.load(Ordering::SeqCst) {
                media.stop_all();
                tracing::debug!("Closed during capture, released fresh tracks");
                return Err(PeerError::Closed);
            }
            if let Some(previous) = slot.replace(media.clone()) {
                previous.stop_all();
            }
        }

        for track in media.tracks() {
            self.connection.add_track(track).await?;
        }
        tracing::debug!(tracks = media.tracks().len(), "Local media attached");
        Ok(media)
    }

    /// Create an offer and apply it locally
    ///
    /// Calling this twice renegotiates.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Rtc`] if the connection refuses
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let offer = self.connection.create_offer().await?;
        tracing::debug!(sdp_len = offer.sdp.len(), "Offer created");
        Ok(offer)
    }

    /// Create an answer to the applied remote offer and apply it locally
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidState`] if no remote offer has been applied
    pub async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.negotiation.lock().await.remote_description != Some(SdpKind::Offer) {
            return Err(PeerError::InvalidState("no remote offer applied"));
        }
        let answer = self.connection.create_answer().await?;
        tracing::debug!(sdp_len = answer.sdp.len(), "Answer created");
        Ok(answer)
    }

    /// Apply the callee's answer; returns `false` if a remote description
    /// was already set
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidState`] if `answer` is not an answer
    pub async fn apply_remote_answer(&self, answer: SessionDescription) -> Result<bool, PeerError> {
        if answer.kind != SdpKind::Answer {
            return Err(PeerError::InvalidState("expected a remote answer"));
        }
        self.apply_remote_description(answer).await
    }

    /// Apply the caller's offer; returns `false` if a remote description was
    /// already set
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidState`] if `offer` is not an offer
    pub async fn apply_remote_offer(&self, offer: SessionDescription) -> Result<bool, PeerError> {
        if offer.kind != SdpKind::Offer {
            return Err(PeerError::InvalidState("expected a remote offer"));
        }
        self.apply_remote_description(offer).await
    }

    #[tracing::instrument(skip(self, description), fields(kind = ?description.kind))]
    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<bool, PeerError> {
        self.ensure_open()?;
        // Held across the connection call: candidates arriving meanwhile wait
        // here and then see the description as set.
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.remote_description.is_some() {
            tracing::debug!("Remote description already set, ignoring");
            return Ok(false);
        }

        let kind = description.kind;
        self.connection.set_remote_description(description).await?;
        negotiation.remote_description = Some(kind);

        let pending: Vec<IceCandidatePayload> = negotiation.pending.drain(..).collect();
        let replayed = pending.len();
        for candidate in pending {
            match self.connection.add_ice_candidate(candidate.clone()).await {
                Ok(()) => {
                    negotiation.applied.insert(candidate);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Buffered candidate rejected on replay");
                }
            }
        }

        tracing::debug!(replayed, "Remote description applied");
        Ok(true)
    }

    /// Feed one remote candidate, buffering it if the remote description is
    /// not set yet
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::EarlyCandidateDropped`] when the buffer is full and
    /// [`PeerError::Rtc`] when the connection rejects the candidate
    pub async fn apply_remote_candidate(
        &self,
        candidate: IceCandidatePayload,
    ) -> Result<CandidateOutcome, PeerError> {
        self.ensure_open()?;
        let mut negotiation = self.negotiation.lock().await;

        if negotiation.applied.contains(&candidate) || negotiation.pending.contains(&candidate) {
            return Ok(CandidateOutcome::Duplicate);
        }

        if negotiation.remote_description.is_none() {
            if negotiation.pending.len() >= self.buffer_capacity {
                tracing::warn!(
                    capacity = self.buffer_capacity,
                    "Early candidate buffer full, dropping candidate"
                );
                return Err(PeerError::EarlyCandidateDropped {
                    capacity: self.buffer_capacity,
                });
            }
            negotiation.pending.push_back(candidate);
            tracing::trace!(buffered = negotiation.pending.len(), "Remote candidate buffered");
            return Ok(CandidateOutcome::Buffered);
        }

        self.connection.add_ice_candidate(candidate.clone()).await?;
        negotiation.applied.insert(candidate);
        tracing::trace!("Remote candidate applied");
        Ok(CandidateOutcome::Applied)
    }

    /// Register the callback receiving each discovered local candidate
    pub fn on_local_ice_candidate<F>(&self, callback: F)
    where
        F: Fn(IceCandidatePayload) + Send + Sync + 'static,
    {
        self.callbacks.lock().local_candidate = Some(Arc::new(callback));
    }

    /// Register the callback receiving each new remote track
    pub fn on_remote_track_added<F>(&self, callback: F)
    where
        F: Fn(RemoteTrack) + Send + Sync + 'static,
    {
        self.callbacks.lock().remote_track = Some(Arc::new(callback));
    }

    /// Currently attached local media
    pub fn local_media(&self) -> Option<LocalMediaState> {
        self.local_media.lock().clone()
    }

    /// Remote tracks received so far
    pub fn remote_media(&self) -> RemoteMediaState {
        self.remote_media.lock().clone()
    }

    /// Whether a remote description has been applied
    pub async fn has_remote_description(&self) -> bool {
        self.negotiation.lock().await.remote_description.is_some()
    }

    /// Number of candidates waiting for the remote description
    pub async fn buffered_candidates(&self) -> usize {
        self.negotiation.lock().await.pending.len()
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop local tracks, close the connection and drop all callbacks
    ///
    /// Only the first call does anything.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Rtc`] if the connection reports a close failure;
    /// local resources are released regardless
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut callbacks = self.callbacks.lock();
            callbacks.local_candidate = None;
            callbacks.remote_track = None;
        }

        let local = self.local_media.lock().take();
        let stopped = local.map_or(0, |media| media.stop_all());
        self.remote_media.lock().clear();

        let result = self.connection.close().await;

        let mut negotiation = self.negotiation.lock().await;
        negotiation.pending.clear();
        drop(negotiation);

        tracing::debug!(stopped_tracks = stopped, "Peer connection closed");
        result.map_err(PeerError::from)
    }
}
