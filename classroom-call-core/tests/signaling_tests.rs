//! Signaling channel behavior against the in-memory document store

use classroom_call_core::{
    CandidateRole, IceCandidatePayload, MemoryDocumentStore, ParticipantId, SessionDescription,
    SignalingChannel, SignalingError,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn session(store: &MemoryDocumentStore) -> (SignalingChannel, classroom_call_core::SessionId) {
    let channel = SignalingChannel::new(Arc::new(store.clone()));
    let id = channel
        .create_session(
            &ParticipantId::new("instructor").unwrap(),
            &ParticipantId::new("student").unwrap(),
        )
        .await
        .unwrap();
    (channel, id)
}

#[tokio::test]
async fn second_answer_is_rejected_and_first_kept() {
    let store = MemoryDocumentStore::new();
    let (channel, id) = session(&store).await;

    let first = SessionDescription::answer("v=0 first");
    channel.publish_answer(id, &first).await.unwrap();
    let second = channel
        .publish_answer(id, &SessionDescription::answer("v=0 second"))
        .await;

    assert_eq!(second, Err(SignalingError::SessionAlreadyAnswered(id)));
    assert_eq!(channel.fetch_session(id).await.unwrap().answer, Some(first));
}

#[tokio::test]
async fn answer_subscription_fires_once() {
    let store = MemoryDocumentStore::new();
    let (channel, id) = session(&store).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _subscription = channel
        .subscribe_to_answer(id, move |answer| async move {
            let _ = tx.send(answer);
        })
        .await
        .unwrap();

    let answer = SessionDescription::answer("v=0 answer");
    channel.publish_answer(id, &answer).await.unwrap();
    channel
        .publish_offer(id, &SessionDescription::offer("v=0 late offer"))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(received, Some(answer));
    // The sender was consumed with the callback
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn candidates_arrive_existing_first_in_append_order() {
    let store = MemoryDocumentStore::new();
    let (channel, id) = session(&store).await;

    channel
        .push_local_candidate(id, CandidateRole::Offer, IceCandidatePayload::new("early"))
        .await
        .unwrap();
    let mut stream = channel
        .remote_candidates(id, CandidateRole::Offer)
        .await
        .unwrap();
    channel
        .push_local_candidate(id, CandidateRole::Offer, IceCandidatePayload::new("late"))
        .await
        .unwrap();
    // Answer-side candidates never leak into the offer stream
    channel
        .push_local_candidate(id, CandidateRole::Answer, IceCandidatePayload::new("other"))
        .await
        .unwrap();

    let mut lines = Vec::new();
    for _ in 0..2 {
        let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.role, CandidateRole::Offer);
        lines.push(record.payload.candidate);
    }
    assert_eq!(lines, vec!["early", "late"]);
}

#[tokio::test]
async fn cancelled_subscription_stops_callbacks() {
    let store = MemoryDocumentStore::new();
    let (channel, id) = session(&store).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut subscription = channel
        .subscribe_to_remote_candidates(id, CandidateRole::Answer, move |record| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(record.payload.candidate);
            }
        })
        .await
        .unwrap();
    assert!(subscription.is_active());

    channel
        .push_local_candidate(id, CandidateRole::Answer, IceCandidatePayload::new("a1"))
        .await
        .unwrap();
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .as_deref(),
        Some("a1")
    );

    subscription.cancel();
    channel
        .push_local_candidate(id, CandidateRole::Answer, IceCandidatePayload::new("a2"))
        .await
        .unwrap();
    // The closure (and its sender) is dropped with the aborted task
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn teardown_removes_session_and_candidates() {
    let store = MemoryDocumentStore::new();
    let (channel, id) = session(&store).await;
    for role in [CandidateRole::Offer, CandidateRole::Answer] {
        channel
            .push_local_candidate(id, role, IceCandidatePayload::new("c"))
            .await
            .unwrap();
    }
    assert_eq!(store.document_count(), 3);

    channel.teardown_session(id).await.unwrap();
    assert_eq!(store.document_count(), 0);
    assert!(matches!(
        channel.fetch_session(id).await,
        Err(SignalingError::SessionNotFound(_))
    ));
    // Repeating teardown is harmless
    channel.teardown_session(id).await.unwrap();
}

#[tokio::test]
async fn outage_maps_to_unavailable() {
    let store = MemoryDocumentStore::new();
    let (channel, id) = session(&store).await;
    store.set_available(false);

    let result = channel
        .push_local_candidate(id, CandidateRole::Offer, IceCandidatePayload::new("c"))
        .await;
    assert!(matches!(result, Err(SignalingError::Unavailable(_))));
}
