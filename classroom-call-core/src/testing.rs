//! In-process doubles for the connection and capture seams
//!
//! Enabled for unit tests and, through the `test-utils` feature, for
//! integration tests and downstream crates.

use crate::media::{LocalMediaState, LocalTrack, MediaCapture, MediaError, RemoteTrack};
use crate::rtc::{
    LocalCandidateHandler, RemoteTrackHandler, RtcConfig, RtcConnection, RtcConnector, RtcError,
};
use crate::types::{IceCandidatePayload, MediaConstraints, MediaKind, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
struct FakeState {
    tracks: Vec<LocalTrack>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidatePayload>,
    local_candidate: Option<LocalCandidateHandler>,
    remote_track: Option<RemoteTrackHandler>,
    closed: bool,
}

/// Connection that records every call and lets tests inject events
pub struct FakeConnection {
    config: RtcConfig,
    state: Mutex<FakeState>,
    offers_created: AtomicUsize,
    close_count: AtomicUsize,
    remote_gate: Mutex<Option<Arc<Notify>>>,
    remote_entered: Notify,
}

impl FakeConnection {
    fn new(config: RtcConfig) -> Self {
        Self {
            config,
            state: Mutex::new(FakeState::default()),
            offers_created: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            remote_gate: Mutex::new(None),
            remote_entered: Notify::new(),
        }
    }

    /// Make `set_remote_description` wait for
    /// [`FakeConnection::release_remote_description`]
    pub fn hold_remote_description(&self) {
        *self.remote_gate.lock() = Some(Arc::new(Notify::new()));
    }

    /// Wait until a held `set_remote_description` is in progress
    pub async fn remote_description_pending(&self) {
        self.remote_entered.notified().await;
    }

    /// Let a held `set_remote_description` finish
    pub fn release_remote_description(&self) {
        if let Some(gate) = self.remote_gate.lock().take() {
            gate.notify_one();
        }
    }

    /// Configuration the connection was built with
    pub fn config(&self) -> RtcConfig {
        self.config.clone()
    }

    /// Tracks attached so far
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().tracks.clone()
    }

    /// Local description last applied
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description.clone()
    }

    /// Remote description, if applied
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    /// Remote candidates fed so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidatePayload> {
        self.state.lock().applied_candidates.clone()
    }

    /// Number of offers created
    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    /// Number of `close` calls
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Simulate local candidate discovery; returns whether a handler saw it
    pub fn emit_local_candidate(&self, candidate: IceCandidatePayload) -> bool {
        let handler = self.state.lock().local_candidate.clone();
        match handler {
            Some(handler) => {
                handler(candidate);
                true
            }
            None => false,
        }
    }

    /// Simulate the peer's media arriving
    pub fn emit_remote_track(&self, kind: MediaKind) -> RemoteTrack {
        let track = RemoteTrack {
            id: format!("remote-{}", Uuid::new_v4().simple()),
            kind,
            stream_id: "remote-stream".to_string(),
        };
        let handler = self.state.lock().remote_track.clone();
        if let Some(handler) = handler {
            handler(track.clone());
        }
        track
    }

    fn ensure_open(state: &FakeState) -> Result<(), RtcError> {
        if state.closed {
            Err(RtcError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RtcConnection for FakeConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), RtcError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let n = self.offers_created.fetch_add(1, Ordering::SeqCst) + 1;
        let offer = SessionDescription::offer(format!("v=0 fake-offer {n}"));
        state.local_description = Some(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        match &state.remote_description {
            Some(remote) if remote.kind == SdpKind::Offer => {}
            _ => return Err(RtcError::Negotiation("no remote offer".to_string())),
        }
        let answer = SessionDescription::answer("v=0 fake-answer");
        state.local_description = Some(answer.clone());
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        let gate = self.remote_gate.lock().clone();
        if let Some(gate) = gate {
            self.remote_entered.notify_one();
            gate.notified().await;
        }
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.remote_description.is_some() {
            return Err(RtcError::Negotiation(
                "remote description already set".to_string(),
            ));
        }
        state.remote_description = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), RtcError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.remote_description.is_none() {
            return Err(RtcError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    fn on_local_candidate(&self, handler: LocalCandidateHandler) {
        self.state.lock().local_candidate = Some(handler);
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        self.state.lock().remote_track = Some(handler);
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.closed = true;
        state.local_candidate = None;
        state.remote_track = None;
        Ok(())
    }
}

/// Connector handing out [`FakeConnection`]s and remembering them
#[derive(Default)]
pub struct FakeConnector {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    failure: Option<RtcError>,
}

impl FakeConnector {
    /// Connector whose connections always build
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that refuses every connection with `error`
    pub fn failing(error: RtcError) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            failure: Some(error),
        }
    }

    /// Every connection built so far
    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    /// Most recent connection
    pub fn last(&self) -> Option<Arc<FakeConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl RtcConnector for FakeConnector {
    async fn connect(&self, config: &RtcConfig) -> Result<Arc<dyn RtcConnection>, RtcError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let connection = Arc::new(FakeConnection::new(config.clone()));
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// Capture that blocks until released, for exercising hangup during capture
pub struct GatedCapture<C> {
    inner: C,
    gate: Arc<Notify>,
    entered: Arc<Notify>,
    issued: Mutex<Vec<LocalMediaState>>,
}

impl<C: MediaCapture> GatedCapture<C> {
    /// Wrap `inner`; `acquire` waits for [`GatedCapture::open_gate`]
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            gate: Arc::new(Notify::new()),
            entered: Arc::new(Notify::new()),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Let the pending (or next) acquisition complete
    pub fn open_gate(&self) {
        self.gate.notify_one();
    }

    /// Wait until an acquisition is pending
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Media handed out so far
    pub fn issued(&self) -> Vec<LocalMediaState> {
        self.issued.lock().clone()
    }

    /// Whether every track ever handed out has been stopped
    pub fn all_released(&self) -> bool {
        self.issued.lock().iter().all(LocalMediaState::is_released)
    }
}

#[async_trait]
impl<C: MediaCapture> MediaCapture for GatedCapture<C> {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaState, MediaError> {
        self.entered.notify_one();
        self.gate.notified().await;
        let media = self.inner.acquire(constraints).await?;
        self.issued.lock().push(media.clone());
        Ok(media)
    }
}

/// Poll `condition` until it holds; `false` after two seconds
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::SyntheticCapture;

    #[tokio::test]
    async fn test_fake_connection_rejects_candidates_before_description() {
        let connector = FakeConnector::new();
        let connection = connector.connect(&RtcConfig::default()).await.unwrap();
        let result = connection
            .add_ice_candidate(IceCandidatePayload::new("c1"))
            .await;
        assert!(matches!(result, Err(RtcError::Candidate(_))));
        assert_eq!(connector.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_gated_capture_waits_for_gate() {
        let capture = Arc::new(GatedCapture::new(SyntheticCapture::default()));
        let task = {
            let capture = Arc::clone(&capture);
            tokio::spawn(async move { capture.acquire(&MediaConstraints::audio_only()).await })
        };
        capture.wait_entered().await;
        assert!(capture.issued().is_empty());

        capture.open_gate();
        let media = task.await.unwrap().unwrap();
        assert_eq!(capture.issued().len(), 1);
        assert!(!capture.all_released());
        media.stop_all();
        assert!(capture.all_released());
    }
}
