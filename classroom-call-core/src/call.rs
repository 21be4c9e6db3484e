//! Call session control
//!
//! [`CallSessionController`] drives one participant's side of a call through
//! `Idle → Connecting → InCall → Ended`, wiring the signaling channel to a
//! [`PeerConnectionManager`].
//!
//! # Caller flow
//!
//! ```text
//! start_call
//!   ├─ create session document
//!   ├─ subscribe: session removed ──► Ended (RemoteHungUp)
//!   ├─ open peer connection, forward local candidates to offerCandidates
//!   ├─ attach local media
//!   ├─ subscribe: answer ──► apply remote answer (replays buffered candidates)
//!   ├─ subscribe: answerCandidates ──► apply or buffer
//!   └─ create + publish offer
//! remote track ──► InCall
//! ```
//!
//! The callee flow mirrors it: watch the session, read the offer, apply it,
//! subscribe to `offerCandidates`, create and publish the answer.
//!
//! Every setup attempt carries a generation number. Callbacks and setup steps
//! belonging to an older generation find their generation stale and release
//! whatever they hold instead of touching controller state. `hangup` racing an
//! in-flight `start_call` therefore ends the call immediately and the setup
//! returns [`CallError::Cancelled`].

use crate::config::CallConfig;
use crate::identity::ParticipantId;
use crate::media::{MediaCapture, MediaError, SyntheticCapture};
use crate::peer::{PeerConnectionManager, PeerError};
use crate::rtc::RtcConnector;
use crate::signaling::{SignalingChannel, SignalingError, Subscription};
use crate::store::DocumentStore;
use crate::types::{
    CallEvent, CallRole, CallState, CandidateRole, EndReason, IceCandidatePayload,
    IceCandidateRecord, MediaKind, SessionDescription, SessionId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Document store unreachable
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// Camera or microphone access refused
    #[error("Media permission denied for {0:?}")]
    MediaPermissionDenied(MediaKind),

    /// Devices could not be opened
    #[error("Media error: {0}")]
    Media(String),

    /// Session already carries an answer
    #[error("Session already answered: {0}")]
    SessionAlreadyAnswered(SessionId),

    /// Operation not allowed in the current state
    #[error("Invalid call state: {0:?}")]
    InvalidState(CallState),

    /// Session document does not exist
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Session has no offer yet
    #[error("Session {0} has no offer")]
    OfferMissing(SessionId),

    /// Local user is not the session's callee
    #[error("Session {session_id} is addressed to {callee}")]
    NotCallee {
        /// Session identifier
        session_id: SessionId,
        /// The session's actual callee
        callee: ParticipantId,
    },

    /// Other signaling failure
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Peer connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Setup was interrupted by hangup
    #[error("Call cancelled")]
    Cancelled,
}

impl CallError {
    /// Reason recorded when this error ends a call
    pub fn end_reason(&self) -> EndReason {
        match self {
            Self::SignalingUnavailable(_) => EndReason::SignalingUnavailable,
            Self::MediaPermissionDenied(_) => EndReason::MediaPermissionDenied,
            Self::Media(_) => EndReason::MediaUnavailable,
            Self::SessionAlreadyAnswered(_) => EndReason::SessionAlreadyAnswered,
            Self::SessionNotFound(_) => EndReason::SessionNotFound,
            Self::OfferMissing(_) => EndReason::OfferMissing,
            Self::NotCallee { .. } => EndReason::NotCallee,
            Self::Cancelled => EndReason::HungUp,
            Self::InvalidState(_)
            | Self::Signaling(_)
            | Self::Connection(_)
            | Self::Config(_) => EndReason::ConnectionFailed,
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Unavailable(msg) => Self::SignalingUnavailable(msg),
            SignalingError::SessionNotFound(id) => Self::SessionNotFound(id),
            SignalingError::SessionAlreadyAnswered(id) => Self::SessionAlreadyAnswered(id),
            other => Self::Signaling(other.to_string()),
        }
    }
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Media(MediaError::PermissionDenied(kind)) => {
                Self::MediaPermissionDenied(kind)
            }
            PeerError::Media(other) => Self::Media(other.to_string()),
            PeerError::Closed => Self::Cancelled,
            other => Self::Connection(other.to_string()),
        }
    }
}

struct ControllerInner {
    state: CallState,
    generation: u64,
    role: Option<CallRole>,
    session_id: Option<SessionId>,
    peer: Option<Arc<PeerConnectionManager>>,
    subscriptions: Vec<Subscription>,
    end_reason: Option<EndReason>,
}

impl Default for ControllerInner {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            generation: 0,
            role: None,
            session_id: None,
            peer: None,
            subscriptions: Vec::new(),
            end_reason: None,
        }
    }
}

/// Resources taken out of the controller when a call ends
struct Teardown {
    subscriptions: Vec<Subscription>,
    peer: Option<Arc<PeerConnectionManager>>,
    delete_session: Option<SessionId>,
    signaling: SignalingChannel,
}

impl Teardown {
    fn cancel_subscriptions(&mut self) {
        for subscription in &mut self.subscriptions {
            subscription.cancel();
        }
    }

    async fn run(mut self) {
        // Observations stop before the connection closes so no callback sees a
        // half-closed peer.
        self.cancel_subscriptions();
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!(error = %e, "Peer connection close reported an error");
            }
        }
        if let Some(session_id) = self.delete_session {
            if let Err(e) = self.signaling.teardown_session(session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "Session teardown failed");
            }
        }
    }
}

/// State shared between the controller and its spawned callbacks
#[derive(Clone)]
struct Shared {
    inner: Arc<Mutex<ControllerInner>>,
    events: broadcast::Sender<CallEvent>,
    signaling: SignalingChannel,
    teardown_on_hangup: bool,
}

impl Shared {
    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&self, inner: &mut ControllerInner, to: CallState) {
        let from = inner.state;
        inner.state = to;
        tracing::debug!(
            session_id = ?inner.session_id,
            old_state = ?from,
            new_state = ?to,
            "Call state transition"
        );
        self.emit(CallEvent::StateChanged {
            session_id: inner.session_id,
            from,
            to,
        });
    }

    fn begin(&self, role: CallRole) -> Result<u64, CallError> {
        let mut inner = self.inner.lock();
        if !inner.state.can_start() {
            return Err(CallError::InvalidState(inner.state));
        }
        inner.generation += 1;
        inner.role = Some(role);
        inner.session_id = None;
        inner.end_reason = None;
        inner.peer = None;
        inner.subscriptions.clear();
        self.transition(&mut inner, CallState::Connecting);
        Ok(inner.generation)
    }

    fn is_current(inner: &ControllerInner, generation: u64) -> bool {
        inner.generation == generation
            && matches!(inner.state, CallState::Connecting | CallState::InCall)
    }

    fn ensure_current(&self, generation: u64) -> Result<(), CallError> {
        if Self::is_current(&self.inner.lock(), generation) {
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }

    fn is_connecting(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.generation == generation && inner.state == CallState::Connecting
    }

    fn set_session(&self, generation: u64, session_id: SessionId) -> bool {
        let mut inner = self.inner.lock();
        if !Self::is_current(&inner, generation) {
            return false;
        }
        inner.session_id = Some(session_id);
        true
    }

    fn install_peer(&self, generation: u64, peer: &Arc<PeerConnectionManager>) -> bool {
        let mut inner = self.inner.lock();
        if !Self::is_current(&inner, generation) {
            return false;
        }
        inner.peer = Some(Arc::clone(peer));
        true
    }

    fn add_subscription(&self, generation: u64, subscription: Subscription) -> bool {
        let mut inner = self.inner.lock();
        if !Self::is_current(&inner, generation) {
            // Dropping the handle stops the observation.
            return false;
        }
        inner.subscriptions.push(subscription);
        true
    }

    fn mark_in_call(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CallState::Connecting {
            self.transition(&mut inner, CallState::InCall);
        }
    }

    /// Move to `Ended` and hand back what must be released
    ///
    /// `generation` of `None` ends whatever call is active.
    fn finish(&self, generation: Option<u64>, reason: EndReason) -> Option<Teardown> {
        let mut inner = self.inner.lock();
        if generation.is_some_and(|g| g != inner.generation) {
            return None;
        }
        if !matches!(inner.state, CallState::Connecting | CallState::InCall) {
            return None;
        }

        inner.end_reason = Some(reason);
        self.transition(&mut inner, CallState::Ended);
        if reason.is_error() {
            tracing::warn!(session_id = ?inner.session_id, reason = ?reason, "Call ended");
        } else {
            tracing::info!(session_id = ?inner.session_id, "Call ended");
        }
        self.emit(CallEvent::CallEnded {
            session_id: inner.session_id,
            reason,
        });

        let delete_session = match (inner.role, inner.session_id) {
            (Some(CallRole::Caller), Some(id)) if self.teardown_on_hangup => Some(id),
            _ => None,
        };
        Some(Teardown {
            subscriptions: std::mem::take(&mut inner.subscriptions),
            peer: inner.peer.take(),
            delete_session,
            signaling: self.signaling.clone(),
        })
    }

    /// End the call from inside a spawned callback
    fn end_in_background(&self, generation: u64, reason: EndReason) {
        if let Some(teardown) = self.finish(Some(generation), reason) {
            // Spawned: the teardown aborts the task this runs on.
            tokio::spawn(teardown.run());
        }
    }

    fn fail_in_background(&self, generation: u64, error: &CallError) {
        self.end_in_background(generation, error.end_reason());
    }
}

/// One participant's call controller
pub struct CallSessionController {
    local_user: ParticipantId,
    signaling: SignalingChannel,
    connector: Arc<dyn RtcConnector>,
    capture: Arc<dyn MediaCapture>,
    config: CallConfig,
    shared: Shared,
}

impl CallSessionController {
    /// Create a builder
    #[must_use]
    pub fn builder(
        local_user: ParticipantId,
        store: Arc<dyn DocumentStore>,
    ) -> CallSessionControllerBuilder {
        CallSessionControllerBuilder::new(local_user, store)
    }

    /// Local participant
    pub fn local_user(&self) -> &ParticipantId {
        &self.local_user
    }

    /// Active configuration
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.shared.inner.lock().state
    }

    /// Session of the current or most recent call
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.inner.lock().session_id
    }

    /// Side taken in the current or most recent call
    pub fn role(&self) -> Option<CallRole> {
        self.shared.inner.lock().role
    }

    /// Why the most recent call ended
    pub fn end_reason(&self) -> Option<EndReason> {
        self.shared.inner.lock().end_reason
    }

    /// Peer connection of the active call
    pub fn peer(&self) -> Option<Arc<PeerConnectionManager>> {
        self.shared.inner.lock().peer.clone()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.events.subscribe()
    }

    /// Call `callee_id`
    ///
    /// Returns once the offer is published; the call reaches `InCall` later,
    /// when the callee's media arrives.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] if a call is already active. Any
    /// other error means the call has ended with the matching
    /// [`EndReason`] and everything acquired so far is released.
    #[tracing::instrument(skip(self, callee_id), fields(caller = %self.local_user, callee = %callee_id))]
    pub async fn start_call(
        &self,
        callee_id: &ParticipantId,
        want_video: bool,
    ) -> Result<SessionId, CallError> {
        let generation = self.shared.begin(CallRole::Caller)?;
        match self.setup_caller(generation, callee_id, want_video).await {
            Ok(session_id) => {
                tracing::info!(session_id = %session_id, "Offer published, waiting for answer");
                Ok(session_id)
            }
            Err(e) => Err(self.abort_setup(generation, e).await),
        }
    }

    async fn setup_caller(
        &self,
        generation: u64,
        callee_id: &ParticipantId,
        want_video: bool,
    ) -> Result<SessionId, CallError> {
        let session_id = self
            .signaling
            .create_session(&self.local_user, callee_id)
            .await?;
        if !self.shared.set_session(generation, session_id) {
            self.discard_session(session_id).await;
            return Err(CallError::Cancelled);
        }
        self.watch_session_removal(generation, session_id).await?;

        let peer = self.open_peer(generation, session_id, CallRole::Caller).await?;
        peer.attach_local_media(self.capture.as_ref(), want_video)
            .await?;
        self.shared.ensure_current(generation)?;

        let answer_subscription = {
            let peer = Arc::clone(&peer);
            let shared = self.shared.clone();
            self.signaling
                .subscribe_to_answer(session_id, move |answer| async move {
                    apply_answer(&shared, generation, &peer, answer).await;
                })
                .await?
        };
        if !self.shared.add_subscription(generation, answer_subscription) {
            return Err(CallError::Cancelled);
        }
        self.subscribe_remote_candidates(generation, session_id, CandidateRole::Answer, &peer)
            .await?;

        let offer = peer.create_offer().await?;
        self.signaling.publish_offer(session_id, &offer).await?;
        self.shared.ensure_current(generation)?;
        Ok(session_id)
    }

    /// Answer the call stored under `session_id`
    ///
    /// # Errors
    ///
    /// Returns [`CallError::SessionNotFound`], [`CallError::NotCallee`],
    /// [`CallError::OfferMissing`] or [`CallError::SessionAlreadyAnswered`]
    /// when the session cannot be answered, plus the same failures as
    /// [`CallSessionController::start_call`]
    #[tracing::instrument(skip(self), fields(callee = %self.local_user, session_id = %session_id))]
    pub async fn answer_call(&self, session_id: SessionId, want_video: bool) -> Result<(), CallError> {
        let generation = self.shared.begin(CallRole::Callee)?;
        match self.setup_callee(generation, session_id, want_video).await {
            Ok(()) => {
                tracing::info!("Answer published");
                Ok(())
            }
            Err(e) => Err(self.abort_setup(generation, e).await),
        }
    }

    async fn setup_callee(
        &self,
        generation: u64,
        session_id: SessionId,
        want_video: bool,
    ) -> Result<(), CallError> {
        // Watch before reading so a deletion right after the read is not missed.
        self.watch_session_removal(generation, session_id).await?;
        let session = self.signaling.fetch_session(session_id).await?;
        if session.callee_id != self.local_user {
            return Err(CallError::NotCallee {
                session_id,
                callee: session.callee_id,
            });
        }
        if session.is_answered() {
            return Err(CallError::SessionAlreadyAnswered(session_id));
        }
        let offer = session.offer.ok_or(CallError::OfferMissing(session_id))?;
        if !self.shared.set_session(generation, session_id) {
            return Err(CallError::Cancelled);
        }

        let peer = self.open_peer(generation, session_id, CallRole::Callee).await?;
        peer.attach_local_media(self.capture.as_ref(), want_video)
            .await?;
        peer.apply_remote_offer(offer).await?;
        self.subscribe_remote_candidates(generation, session_id, CandidateRole::Offer, &peer)
            .await?;

        let answer = peer.create_answer().await?;
        self.signaling.publish_answer(session_id, &answer).await?;
        self.shared.ensure_current(generation)?;
        Ok(())
    }

    /// End the current call
    ///
    /// Safe to call in any state and any number of times. Subscriptions are
    /// cancelled first, then the peer connection and local media are
    /// released, then (for the caller, if configured) the session documents
    /// are deleted.
    #[tracing::instrument(skip(self))]
    pub async fn hangup(&self) {
        match self.shared.finish(None, EndReason::HungUp) {
            Some(teardown) => teardown.run().await,
            None => tracing::debug!(state = ?self.state(), "Hangup with no active call"),
        }
    }

    async fn abort_setup(&self, generation: u64, error: CallError) -> CallError {
        match self.shared.finish(Some(generation), error.end_reason()) {
            Some(teardown) => {
                tracing::warn!(error = %error, "Call setup failed");
                teardown.run().await;
                error
            }
            None => {
                tracing::debug!(error = %error, "Call setup interrupted");
                CallError::Cancelled
            }
        }
    }

    async fn discard_session(&self, session_id: SessionId) {
        if !self.config.teardown_on_hangup {
            return;
        }
        if let Err(e) = self.signaling.teardown_session(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to discard session");
        }
    }

    async fn open_peer(
        &self,
        generation: u64,
        session_id: SessionId,
        role: CallRole,
    ) -> Result<Arc<PeerConnectionManager>, CallError> {
        let peer = Arc::new(
            PeerConnectionManager::open(
                self.connector.as_ref(),
                &self.config.rtc,
                self.config.candidate_buffer_capacity,
            )
            .await?,
        );
        if !self.shared.install_peer(generation, &peer) {
            if let Err(e) = peer.close().await {
                tracing::debug!(error = %e, "Close of orphaned peer connection failed");
            }
            return Err(CallError::Cancelled);
        }

        let (tx, rx) = mpsc::unbounded_channel::<IceCandidatePayload>();
        peer.on_local_ice_candidate(move |candidate| {
            let _ = tx.send(candidate);
        });
        {
            let shared = self.shared.clone();
            peer.on_remote_track_added(move |track| {
                shared.mark_in_call(generation);
                shared.emit(CallEvent::RemoteTrackAdded { session_id, track });
            });
        }

        let forwarder = Subscription::spawn(
            "local-candidates",
            forward_local_candidates(
                self.shared.clone(),
                generation,
                session_id,
                role.local_candidate_role(),
                rx,
            ),
        );
        if !self.shared.add_subscription(generation, forwarder) {
            return Err(CallError::Cancelled);
        }
        Ok(peer)
    }

    async fn watch_session_removal(
        &self,
        generation: u64,
        session_id: SessionId,
    ) -> Result<(), CallError> {
        let shared = self.shared.clone();
        let subscription = self
            .signaling
            .subscribe_to_session_removed(session_id, move || async move {
                tracing::info!(session_id = %session_id, "Session deleted by the other participant");
                shared.end_in_background(generation, EndReason::RemoteHungUp);
            })
            .await?;
        if self.shared.add_subscription(generation, subscription) {
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }

    async fn subscribe_remote_candidates(
        &self,
        generation: u64,
        session_id: SessionId,
        role: CandidateRole,
        peer: &Arc<PeerConnectionManager>,
    ) -> Result<(), CallError> {
        let subscription = {
            let peer = Arc::clone(peer);
            let shared = self.shared.clone();
            self.signaling
                .subscribe_to_remote_candidates(session_id, role, move |record| {
                    let peer = Arc::clone(&peer);
                    let shared = shared.clone();
                    async move { apply_candidate(&shared, session_id, &peer, record).await }
                })
                .await?
        };
        if self.shared.add_subscription(generation, subscription) {
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }
}

impl Drop for CallSessionController {
    /// Ends an active call as if hung up
    ///
    /// Local tracks stop immediately. Closing the connection and deleting the
    /// session documents need a runtime and are spawned onto the current one.
    fn drop(&mut self) {
        let Some(mut teardown) = self.shared.finish(None, EndReason::HungUp) else {
            return;
        };
        teardown.cancel_subscriptions();
        if let Some(media) = teardown.peer.as_ref().and_then(|peer| peer.local_media()) {
            media.stop_all();
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(teardown.run());
            }
            Err(_) => tracing::warn!("Controller dropped outside a runtime, session left in place"),
        }
    }
}

/// Push local candidates one at a time so storage order equals discovery order
async fn forward_local_candidates(
    shared: Shared,
    generation: u64,
    session_id: SessionId,
    role: CandidateRole,
    mut candidates: mpsc::UnboundedReceiver<IceCandidatePayload>,
) {
    while let Some(candidate) = candidates.recv().await {
        // The session may already be gone; pushing would recreate its path.
        let current = Shared::is_current(&shared.inner.lock(), generation);
        if !current {
            tracing::debug!("Call over, local candidate discarded");
            return;
        }
        if let Err(e) = shared
            .signaling
            .push_local_candidate(session_id, role, candidate)
            .await
        {
            if shared.is_connecting(generation) {
                tracing::warn!(error = %e, "Candidate push failed while connecting");
                shared.fail_in_background(generation, &CallError::from(e));
                return;
            }
            tracing::warn!(error = %e, "Candidate push failed");
        }
    }
}

async fn apply_answer(
    shared: &Shared,
    generation: u64,
    peer: &PeerConnectionManager,
    answer: SessionDescription,
) {
    match peer.apply_remote_answer(answer).await {
        Ok(true) => tracing::debug!("Remote answer applied"),
        Ok(false) | Err(PeerError::Closed) => {}
        Err(e) => {
            tracing::warn!(error = %e, "Remote answer rejected");
            shared.fail_in_background(generation, &CallError::Connection(e.to_string()));
        }
    }
}

async fn apply_candidate(
    shared: &Shared,
    session_id: SessionId,
    peer: &PeerConnectionManager,
    record: IceCandidateRecord,
) {
    let line = record.payload.candidate.clone();
    match peer.apply_remote_candidate(record.payload).await {
        Ok(outcome) => tracing::trace!(outcome = ?outcome, "Remote candidate handled"),
        Err(PeerError::EarlyCandidateDropped { .. }) => {
            shared.emit(CallEvent::CandidateDropped {
                session_id,
                candidate: line,
            });
        }
        Err(PeerError::Closed) => {}
        Err(e) => tracing::warn!(error = %e, "Remote candidate rejected"),
    }
}

/// Builder for [`CallSessionController`]
pub struct CallSessionControllerBuilder {
    local_user: ParticipantId,
    store: Arc<dyn DocumentStore>,
    connector: Option<Arc<dyn RtcConnector>>,
    capture: Option<Arc<dyn MediaCapture>>,
    config: CallConfig,
}

impl CallSessionControllerBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(local_user: ParticipantId, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            local_user,
            store,
            connector: None,
            capture: None,
            config: CallConfig::default(),
        }
    }

    /// Set the peer connection factory
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn RtcConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the media capture
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the controller
    ///
    /// Without an explicit connector the `webrtc` backend is used; without an
    /// explicit capture, [`SyntheticCapture`] with full permissions.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Config`] if the configuration is invalid or no
    /// connector is available
    pub fn build(self) -> Result<CallSessionController, CallError> {
        self.config
            .validate()
            .map_err(|e| CallError::Config(e.to_string()))?;

        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };
        let capture = self
            .capture
            .unwrap_or_else(|| Arc::new(SyntheticCapture::default()));
        let signaling =
            SignalingChannel::with_collection(self.store, self.config.sessions_collection.clone());
        let (events, _) = broadcast::channel(self.config.event_channel_capacity);

        Ok(CallSessionController {
            local_user: self.local_user,
            shared: Shared {
                inner: Arc::new(Mutex::new(ControllerInner::default())),
                events,
                signaling: signaling.clone(),
                teardown_on_hangup: self.config.teardown_on_hangup,
            },
            signaling,
            connector,
            capture,
            config: self.config,
        })
    }
}

#[cfg(feature = "webrtc-backend")]
fn default_connector() -> Result<Arc<dyn RtcConnector>, CallError> {
    Ok(Arc::new(crate::webrtc_backend::WebRtcConnector::new()))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_connector() -> Result<Arc<dyn RtcConnector>, CallError> {
    Err(CallError::Config(
        "no peer connection backend; supply a connector".to_string(),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rtc::RtcError;
    use crate::store::MemoryDocumentStore;
    use crate::testing::{wait_until, FakeConnector};
    use pretty_assertions::assert_eq;

    fn controller(
        user: &str,
        store: &MemoryDocumentStore,
        connector: &Arc<FakeConnector>,
    ) -> CallSessionController {
        CallSessionController::builder(
            ParticipantId::new(user).unwrap(),
            Arc::new(store.clone()),
        )
        .with_connector(Arc::clone(connector) as Arc<dyn RtcConnector>)
        .build()
        .unwrap()
    }

    #[test]
    fn test_error_end_reasons() {
        let id = SessionId::new();
        assert_eq!(
            CallError::from(SignalingError::Unavailable("down".into())).end_reason(),
            EndReason::SignalingUnavailable
        );
        assert_eq!(
            CallError::from(SignalingError::SessionAlreadyAnswered(id)),
            CallError::SessionAlreadyAnswered(id)
        );
        assert_eq!(
            CallError::from(PeerError::Media(MediaError::PermissionDenied(MediaKind::Video)))
                .end_reason(),
            EndReason::MediaPermissionDenied
        );
        assert_eq!(CallError::from(PeerError::Closed), CallError::Cancelled);
        assert!(matches!(
            CallError::from(PeerError::EarlyCandidateDropped { capacity: 2 }),
            CallError::Connection(_)
        ));
        assert_eq!(
            CallError::from(PeerError::Rtc(RtcError::Closed)).end_reason(),
            EndReason::ConnectionFailed
        );
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let store = MemoryDocumentStore::new();
        let config = CallConfig {
            event_channel_capacity: 0,
            ..CallConfig::default()
        };
        let result = CallSessionController::builder(
            ParticipantId::new("alice").unwrap(),
            Arc::new(store),
        )
        .with_connector(Arc::new(FakeConnector::new()))
        .with_config(config)
        .build();
        assert!(matches!(result, Err(CallError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_call_reaches_connecting() {
        let store = MemoryDocumentStore::new();
        let connector = Arc::new(FakeConnector::new());
        let alice = controller("alice", &store, &connector);
        let mut events = alice.subscribe_events();

        assert_eq!(alice.state(), CallState::Idle);
        let session_id = alice
            .start_call(&ParticipantId::new("bob").unwrap(), false)
            .await
            .unwrap();
        assert_eq!(alice.state(), CallState::Connecting);
        assert_eq!(alice.session_id(), Some(session_id));
        assert_eq!(alice.role(), Some(CallRole::Caller));

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            CallEvent::StateChanged {
                from: CallState::Idle,
                to: CallState::Connecting,
                ..
            }
        ));

        let connection = connector.last().unwrap();
        assert_eq!(connection.offers_created(), 1);
        assert_eq!(connection.tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_track_moves_to_in_call() {
        let store = MemoryDocumentStore::new();
        let connector = Arc::new(FakeConnector::new());
        let alice = controller("alice", &store, &connector);
        alice
            .start_call(&ParticipantId::new("bob").unwrap(), true)
            .await
            .unwrap();

        connector.last().unwrap().emit_remote_track(MediaKind::Video);
        assert_eq!(alice.state(), CallState::InCall);

        alice.hangup().await;
        assert_eq!(alice.state(), CallState::Ended);
        assert_eq!(alice.end_reason(), Some(EndReason::HungUp));
        assert!(wait_until(|| store.watcher_count() == 0).await);
    }

    #[tokio::test]
    async fn test_new_call_after_ended() {
        let store = MemoryDocumentStore::new();
        let connector = Arc::new(FakeConnector::new());
        let alice = controller("alice", &store, &connector);
        let bob = ParticipantId::new("bob").unwrap();

        let first = alice.start_call(&bob, false).await.unwrap();
        alice.hangup().await;
        let second = alice.start_call(&bob, false).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(alice.state(), CallState::Connecting);
        assert_eq!(alice.end_reason(), None);
        assert_eq!(connector.connections().len(), 2);
    }

    #[tokio::test]
    async fn test_hangup_when_idle_is_noop() {
        let store = MemoryDocumentStore::new();
        let connector = Arc::new(FakeConnector::new());
        let alice = controller("alice", &store, &connector);
        alice.hangup().await;
        assert_eq!(alice.state(), CallState::Idle);
        assert_eq!(alice.end_reason(), None);
    }
}
