//! Call signaling over a document store
//!
//! Handles SDP exchange and ICE candidate delivery between exactly two parties.
//! A session document is the mailbox for the offer and the answer; each side
//! appends its candidates to its own sub-collection:
//!
//! ```text
//! calls/{sessionId}                          { callerId, calleeId, offer, answer, createdAt }
//! calls/{sessionId}/offerCandidates/{auto}   { role: "offer", candidate, sdpMid, ... }
//! calls/{sessionId}/answerCandidates/{auto}  { role: "answer", candidate, sdpMid, ... }
//! ```
//!
//! Every field has a single writer (caller writes the offer, callee the
//! answer, each side its own candidates), so no locking is needed beyond the
//! conditional write guarding the answer.

use crate::identity::ParticipantId;
use crate::store::{
    ChangeKind, CollectionPath, DocumentChange, DocumentPath, DocumentStore, Precondition,
    StoreError,
};
use crate::types::{
    CallSession, CandidateRole, IceCandidatePayload, IceCandidateRecord, SdpKind,
    SessionDescription, SessionId,
};
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Default name of the sessions collection
pub const DEFAULT_SESSIONS_COLLECTION: &str = "calls";

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Document store unreachable or failing
    #[error("Signaling unavailable: {0}")]
    Unavailable(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// An answer was already written
    #[error("Session already answered: {0}")]
    SessionAlreadyAnswered(SessionId),

    /// A different offer was already written
    #[error("Session {0} already carries a different offer")]
    OfferConflict(SessionId),

    /// Description of the wrong kind or unusable
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Stored record does not decode or fails validation
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

fn unavailable(err: StoreError) -> SignalingError {
    SignalingError::Unavailable(err.to_string())
}

/// Handle to a long-lived observation
///
/// The observation runs as a spawned task; `cancel` (or dropping the handle)
/// stops it, after which its callback never fires again.
#[derive(Debug)]
pub struct Subscription {
    label: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn spawn<F>(label: &'static str, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            label,
            handle: Some(tokio::spawn(task)),
        }
    }

    /// What this subscription observes
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Whether the observation task is still running
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop observing
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::trace!(subscription = self.label, "Subscription cancelled");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Signaling channel over an injected document store
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn DocumentStore>,
    sessions: CollectionPath,
}

impl SignalingChannel {
    /// Create a channel storing sessions in the default `calls` collection
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_collection(store, DEFAULT_SESSIONS_COLLECTION)
    }

    /// Create a channel storing sessions in `collection`
    #[must_use]
    pub fn with_collection(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            sessions: CollectionPath::root(collection),
        }
    }

    fn session_path(&self, session_id: SessionId) -> DocumentPath {
        self.sessions.doc(session_id)
    }

    fn candidates_path(&self, session_id: SessionId, role: CandidateRole) -> CollectionPath {
        self.session_path(session_id)
            .collection(role.collection_name())
    }

    /// Allocate a new session document with no offer and no answer
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Unavailable`] if the store write fails
    #[tracing::instrument(skip(self, caller_id, callee_id), fields(caller = %caller_id, callee = %callee_id))]
    pub async fn create_session(
        &self,
        caller_id: &ParticipantId,
        callee_id: &ParticipantId,
    ) -> Result<SessionId, SignalingError> {
        let session_id = SessionId::new();
        let session = CallSession::new(caller_id.clone(), callee_id.clone());
        let data = serde_json::to_value(&session)
            .map_err(|e| SignalingError::InvalidRecord(e.to_string()))?;

        self.store
            .create(&self.session_path(session_id), data)
            .await
            .map_err(unavailable)?;

        tracing::debug!(session_id = %session_id, "Session created");
        Ok(session_id)
    }

    /// Read a session document
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::SessionNotFound`] if the document is missing
    pub async fn fetch_session(&self, session_id: SessionId) -> Result<CallSession, SignalingError> {
        let data = self
            .store
            .get(&self.session_path(session_id))
            .await
            .map_err(unavailable)?
            .ok_or(SignalingError::SessionNotFound(session_id))?;
        serde_json::from_value(data).map_err(|e| SignalingError::InvalidRecord(e.to_string()))
    }

    async fn write_description(
        &self,
        session_id: SessionId,
        field: &str,
        description: &SessionDescription,
        precondition: Precondition,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(description)
            .map_err(|e| StoreError::InvalidDocument(e.to_string()))?;
        let mut patch = Map::new();
        patch.insert(field.to_string(), value);
        self.store
            .update(&self.session_path(session_id), patch, precondition)
            .await
    }

    /// Write the caller's offer
    ///
    /// Re-publishing the same offer is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::OfferConflict`] if a different offer is
    /// already stored, [`SignalingError::SessionNotFound`] if the session is
    /// gone
    #[tracing::instrument(skip(self, offer), fields(session_id = %session_id, sdp_len = offer.sdp.len()))]
    pub async fn publish_offer(
        &self,
        session_id: SessionId,
        offer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        if offer.kind != SdpKind::Offer {
            return Err(SignalingError::InvalidDescription(
                "publish_offer expects an offer".to_string(),
            ));
        }
        let expected = serde_json::to_value(offer)
            .map_err(|e| SignalingError::InvalidDescription(e.to_string()))?;

        match self
            .write_description(
                session_id,
                "offer",
                offer,
                Precondition::FieldAbsentOrEqual("offer".to_string(), expected),
            )
            .await
        {
            Ok(()) => {
                tracing::debug!("Offer published");
                Ok(())
            }
            Err(StoreError::PreconditionFailed { .. }) => {
                tracing::warn!("Refusing to overwrite a different offer");
                Err(SignalingError::OfferConflict(session_id))
            }
            Err(StoreError::NotFound(_)) => Err(SignalingError::SessionNotFound(session_id)),
            Err(e) => Err(unavailable(e)),
        }
    }

    /// Write the callee's answer; only the first answer is accepted
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::SessionAlreadyAnswered`] on a second answer
    #[tracing::instrument(skip(self, answer), fields(session_id = %session_id, sdp_len = answer.sdp.len()))]
    pub async fn publish_answer(
        &self,
        session_id: SessionId,
        answer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        if answer.kind != SdpKind::Answer {
            return Err(SignalingError::InvalidDescription(
                "publish_answer expects an answer".to_string(),
            ));
        }

        match self
            .write_description(
                session_id,
                "answer",
                answer,
                Precondition::FieldAbsent("answer".to_string()),
            )
            .await
        {
            Ok(()) => {
                tracing::debug!("Answer published");
                Ok(())
            }
            Err(StoreError::PreconditionFailed { .. }) => {
                tracing::warn!("Session already answered");
                Err(SignalingError::SessionAlreadyAnswered(session_id))
            }
            Err(StoreError::NotFound(_)) => Err(SignalingError::SessionNotFound(session_id)),
            Err(e) => Err(unavailable(e)),
        }
    }

    /// Append one local candidate to `role`'s sub-collection
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::InvalidRecord`] for an empty candidate line,
    /// [`SignalingError::Unavailable`] if the append fails
    #[tracing::instrument(skip(self, candidate), fields(session_id = %session_id, role = ?role))]
    pub async fn push_local_candidate(
        &self,
        session_id: SessionId,
        role: CandidateRole,
        candidate: IceCandidatePayload,
    ) -> Result<(), SignalingError> {
        let record = IceCandidateRecord::new(role, candidate);
        record.validate(role).map_err(SignalingError::InvalidRecord)?;
        let data = serde_json::to_value(&record)
            .map_err(|e| SignalingError::InvalidRecord(e.to_string()))?;

        self.store
            .append(&self.candidates_path(session_id, role), data)
            .await
            .map_err(unavailable)?;
        tracing::trace!("Local candidate pushed");
        Ok(())
    }

    /// Stream yielding the answer once, as soon as it appears
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Unavailable`] if the watch cannot be opened
    pub async fn answer_updates(
        &self,
        session_id: SessionId,
    ) -> Result<BoxStream<'static, SessionDescription>, SignalingError> {
        let changes = self
            .store
            .watch_document(&self.session_path(session_id))
            .await
            .map_err(unavailable)?;

        Ok(changes
            .filter_map(|change| future::ready(answer_from_change(&change)))
            .take(1)
            .boxed())
    }

    /// Stream yielding each candidate appended to `role`'s sub-collection,
    /// existing ones first, each exactly once and in append order
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Unavailable`] if the watch cannot be opened
    pub async fn remote_candidates(
        &self,
        session_id: SessionId,
        role: CandidateRole,
    ) -> Result<BoxStream<'static, IceCandidateRecord>, SignalingError> {
        let changes = self
            .store
            .watch_collection(&self.candidates_path(session_id, role))
            .await
            .map_err(unavailable)?;

        let mut seen: HashSet<DocumentPath> = HashSet::new();
        Ok(changes
            .filter_map(move |change| {
                let record = if change.kind == ChangeKind::Added && seen.insert(change.path.clone())
                {
                    candidate_from_change(role, &change)
                } else {
                    None
                };
                future::ready(record)
            })
            .boxed())
    }

    /// Stream yielding once when the session document is deleted
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Unavailable`] if the watch cannot be opened
    pub async fn session_removals(
        &self,
        session_id: SessionId,
    ) -> Result<BoxStream<'static, ()>, SignalingError> {
        let changes = self
            .store
            .watch_document(&self.session_path(session_id))
            .await
            .map_err(unavailable)?;

        Ok(changes
            .filter_map(|change| future::ready((change.kind == ChangeKind::Removed).then_some(())))
            .take(1)
            .boxed())
    }

    /// Invoke `on_removed` once if the session document is deleted
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Unavailable`] if the watch cannot be opened
    pub async fn subscribe_to_session_removed<F, Fut>(
        &self,
        session_id: SessionId,
        on_removed: F,
    ) -> Result<Subscription, SignalingError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut removals = self.session_removals(session_id).await?;
        Ok(Subscription::spawn("session-removed", async move {
            if removals.next().await.is_some() {
                tracing::debug!(session_id = %session_id, "Session removed remotely");
                on_removed().await;
            }
        }))
    }

    /// Invoke `on_answer` exactly once when the answer first appears
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Unavailable`] if the watch cannot be opened
    pub async fn subscribe_to_answer<F, Fut>(
        &self,
        session_id: SessionId,
        on_answer: F,
    ) -> Result<Subscription, SignalingError>
    where
        F: FnOnce(SessionDescription) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut answers = self.answer_updates(session_id).await?;
        Ok(Subscription::spawn("answer", async move {
            if let Some(answer) = answers.next().await {
                tracing::debug!(session_id = %session_id, "Answer received");
                on_answer(answer).await;
            }
        }))
    }

    /// Invoke `on_candidate` once per newly appended candidate of `role`
    ///
    /// Callbacks run one at a time in append order.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Unavailable`] if the watch cannot be opened
    pub async fn subscribe_to_remote_candidates<F, Fut>(
        &self,
        session_id: SessionId,
        role: CandidateRole,
        mut on_candidate: F,
    ) -> Result<Subscription, SignalingError>
    where
        F: FnMut(IceCandidateRecord) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut candidates = self.remote_candidates(session_id, role).await?;
        Ok(Subscription::spawn("remote-candidates", async move {
            while let Some(record) = candidates.next().await {
                on_candidate(record).await;
            }
        }))
    }

    /// Delete the session document and both candidate sub-collections
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Unavailable`] if the store fails; documents
    /// already gone are not an error
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn teardown_session(&self, session_id: SessionId) -> Result<(), SignalingError> {
        let mut removed = 0usize;
        for role in [CandidateRole::Offer, CandidateRole::Answer] {
            let records = self
                .store
                .list(&self.candidates_path(session_id, role))
                .await
                .map_err(unavailable)?;
            for record in records {
                self.store.delete(&record.path).await.map_err(unavailable)?;
                removed += 1;
            }
        }
        self.store
            .delete(&self.session_path(session_id))
            .await
            .map_err(unavailable)?;

        tracing::debug!(candidates = removed, "Session torn down");
        Ok(())
    }
}

fn answer_from_change(change: &DocumentChange) -> Option<SessionDescription> {
    if change.kind == ChangeKind::Removed {
        return None;
    }
    let answer = change.data.get("answer").filter(|v| !v.is_null())?;
    match serde_json::from_value::<SessionDescription>(answer.clone()) {
        Ok(description) if description.kind == SdpKind::Answer => Some(description),
        Ok(_) => {
            tracing::warn!(path = %change.path, "Answer field holds a non-answer description");
            None
        }
        Err(e) => {
            tracing::warn!(path = %change.path, error = %e, "Malformed answer ignored");
            None
        }
    }
}

fn candidate_from_change(role: CandidateRole, change: &DocumentChange) -> Option<IceCandidateRecord> {
    match decode_candidate(role, &change.data) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(path = %change.path, error = %e, "Invalid candidate record skipped");
            None
        }
    }
}

/// Decode a raw document as a candidate record of `role`
///
/// # Errors
///
/// Returns [`SignalingError::InvalidRecord`] if the data does not decode or
/// fails validation
pub fn decode_candidate(role: CandidateRole, data: &Value) -> Result<IceCandidateRecord, SignalingError> {
    let record: IceCandidateRecord = serde_json::from_value(data.clone())
        .map_err(|e| SignalingError::InvalidRecord(e.to_string()))?;
    record.validate(role).map_err(SignalingError::InvalidRecord)?;
    Ok(record)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn ids() -> (ParticipantId, ParticipantId) {
        (
            ParticipantId::new("alice").unwrap(),
            ParticipantId::new("bob").unwrap(),
        )
    }

    fn channel() -> (MemoryDocumentStore, SignalingChannel) {
        let store = MemoryDocumentStore::new();
        let channel = SignalingChannel::new(Arc::new(store.clone()));
        (store, channel)
    }

    #[tokio::test]
    async fn test_create_and_fetch_session() {
        let (_, channel) = channel();
        let (alice, bob) = ids();
        let id = channel.create_session(&alice, &bob).await.unwrap();

        let session = channel.fetch_session(id).await.unwrap();
        assert_eq!(session.caller_id, alice);
        assert_eq!(session.callee_id, bob);
        assert_eq!(session.offer, None);
        assert_eq!(session.answer, None);
    }

    #[tokio::test]
    async fn test_publish_offer_is_idempotent() {
        let (_, channel) = channel();
        let (alice, bob) = ids();
        let id = channel.create_session(&alice, &bob).await.unwrap();
        let offer = SessionDescription::offer("v=0 offer");

        channel.publish_offer(id, &offer).await.unwrap();
        channel.publish_offer(id, &offer).await.unwrap();

        let other = SessionDescription::offer("v=0 another");
        assert_eq!(
            channel.publish_offer(id, &other).await,
            Err(SignalingError::OfferConflict(id))
        );
        assert_eq!(channel.fetch_session(id).await.unwrap().offer, Some(offer));
    }

    #[tokio::test]
    async fn test_publish_answer_twice_is_rejected() {
        let (_, channel) = channel();
        let (alice, bob) = ids();
        let id = channel.create_session(&alice, &bob).await.unwrap();

        let answer = SessionDescription::answer("v=0 answer");
        channel.publish_answer(id, &answer).await.unwrap();
        assert_eq!(
            channel.publish_answer(id, &answer).await,
            Err(SignalingError::SessionAlreadyAnswered(id))
        );
    }

    #[tokio::test]
    async fn test_wrong_description_kinds_rejected() {
        let (_, channel) = channel();
        let (alice, bob) = ids();
        let id = channel.create_session(&alice, &bob).await.unwrap();

        assert!(matches!(
            channel
                .publish_offer(id, &SessionDescription::answer("v=0"))
                .await,
            Err(SignalingError::InvalidDescription(_))
        ));
        assert!(matches!(
            channel
                .publish_answer(id, &SessionDescription::offer("v=0"))
                .await,
            Err(SignalingError::InvalidDescription(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_to_missing_session() {
        let (_, channel) = channel();
        let id = SessionId::new();
        assert_eq!(
            channel
                .publish_answer(id, &SessionDescription::answer("v=0"))
                .await,
            Err(SignalingError::SessionNotFound(id))
        );
        assert_eq!(
            channel.fetch_session(id).await,
            Err(SignalingError::SessionNotFound(id))
        );
    }

    #[tokio::test]
    async fn test_store_outage_is_signaling_unavailable() {
        let (store, channel) = channel();
        let (alice, bob) = ids();
        store.set_available(false);
        assert!(matches!(
            channel.create_session(&alice, &bob).await,
            Err(SignalingError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_to_answer_fires_once() {
        let (_, channel) = channel();
        let (alice, bob) = ids();
        let id = channel.create_session(&alice, &bob).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = channel
            .subscribe_to_answer(id, move |answer| async move {
                let _ = tx.send(answer);
            })
            .await
            .unwrap();

        channel
            .publish_offer(id, &SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let answer = SessionDescription::answer("v=0 answer");
        channel.publish_answer(id, &answer).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(answer));
        // Sender dropped after the single invocation
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(closed, None);
    }

    #[tokio::test]
    async fn test_remote_candidates_in_append_order() {
        let (_, channel) = channel();
        let (alice, bob) = ids();
        let id = channel.create_session(&alice, &bob).await.unwrap();

        channel
            .push_local_candidate(id, CandidateRole::Answer, IceCandidatePayload::new("c0"))
            .await
            .unwrap();

        let mut stream = channel
            .remote_candidates(id, CandidateRole::Answer)
            .await
            .unwrap();

        for line in ["c1", "c2"] {
            channel
                .push_local_candidate(id, CandidateRole::Answer, IceCandidatePayload::new(line))
                .await
                .unwrap();
        }
        // Candidates of the other role never show up here
        channel
            .push_local_candidate(id, CandidateRole::Offer, IceCandidatePayload::new("x"))
            .await
            .unwrap();

        let mut lines = Vec::new();
        for _ in 0..3 {
            lines.push(stream.next().await.unwrap().payload.candidate);
        }
        assert_eq!(lines, vec!["c0", "c1", "c2"]);
    }

    #[tokio::test]
    async fn test_invalid_candidate_records_skipped() {
        let (store, channel) = channel();
        let (alice, bob) = ids();
        let id = channel.create_session(&alice, &bob).await.unwrap();
        let coll = CollectionPath::root("calls")
            .doc(id)
            .collection("offerCandidates");

        let mut stream = channel.remote_candidates(id, CandidateRole::Offer).await.unwrap();
        store.append(&coll, json!({"garbage": true})).await.unwrap();
        store
            .append(&coll, json!({"role": "answer", "candidate": "wrong-role"}))
            .await
            .unwrap();
        store
            .append(&coll, json!({"role": "offer", "candidate": "good"}))
            .await
            .unwrap();

        let record = stream.next().await.unwrap();
        assert_eq!(record.payload.candidate, "good");
    }

    #[tokio::test]
    async fn test_push_rejects_empty_candidate() {
        let (_, channel) = channel();
        let (alice, bob) = ids();
        let id = channel.create_session(&alice, &bob).await.unwrap();
        assert!(matches!(
            channel
                .push_local_candidate(id, CandidateRole::Offer, IceCandidatePayload::new(""))
                .await,
            Err(SignalingError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_teardown_removes_everything() {
        let (store, channel) = channel();
        let (alice, bob) = ids();
        let id = channel.create_session(&alice, &bob).await.unwrap();
        for role in [CandidateRole::Offer, CandidateRole::Answer] {
            channel
                .push_local_candidate(id, role, IceCandidatePayload::new("c"))
                .await
                .unwrap();
        }
        assert_eq!(store.document_count(), 3);

        channel.teardown_session(id).await.unwrap();
        assert_eq!(store.document_count(), 0);
        // Tearing down twice is harmless
        channel.teardown_session(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops() {
        let (_, channel) = channel();
        let (alice, bob) = ids();
        let id = channel.create_session(&alice, &bob).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sub = channel
            .subscribe_to_remote_candidates(id, CandidateRole::Offer, move |record| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(record);
                }
            })
            .await
            .unwrap();
        assert!(sub.is_active());
        sub.cancel();
        assert!(!sub.is_active());

        channel
            .push_local_candidate(id, CandidateRole::Offer, IceCandidatePayload::new("late"))
            .await
            .unwrap();
        // The callback (and its sender) went away with the task
        let result = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_session_removed_fires_on_teardown_only() {
        let (_, channel) = channel();
        let (alice, bob) = ids();
        let id = channel.create_session(&alice, &bob).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = channel
            .subscribe_to_session_removed(id, move || async move {
                let _ = tx.send(());
            })
            .await
            .unwrap();

        // Writes to the document are not removals
        channel
            .publish_offer(id, &SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );

        channel.teardown_session(id).await.unwrap();
        let fired = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(fired, Some(()));
    }

    #[test]
    fn test_decode_candidate() {
        let data = json!({"role": "offer", "candidate": "c", "sdpMid": "0", "sdpMLineIndex": 1});
        let record = decode_candidate(CandidateRole::Offer, &data).unwrap();
        assert_eq!(record.payload.sdp_mline_index, Some(1));
        assert!(decode_candidate(CandidateRole::Answer, &data).is_err());
    }
}
