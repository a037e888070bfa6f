//! Incoming-call accept: the UI/telephony race, duplicate accepts, retry
//! after failure, and the cold-start path from the durable record.

use huddle_rtc::store::{PendingCallRecord, PendingCallStore};
use huddle_rtc::test_utils::{connect_harness, settle, TestHarness};
use huddle_rtc::{AcceptTrigger, CallError, CallMediaType, CallPhase, UserId};
use serde_json::json;
use std::collections::HashMap;
use huddle_rtc::CallId;

async fn ringing_harness() -> TestHarness {
    let _ = env_logger::builder().is_test(true).try_init();
    let h = connect_harness("u1", "Me", &[("u9", "Ada")]).await;
    h.transport
        .inject_event(
            "incoming-call",
            json!({
                "callId": "c9",
                "callerId": "u9",
                "callType": "video",
                "callerName": "Ada",
                "participants": ["u9", "u1"],
                "rtpCapabilities": {},
            }),
        )
        .await;
    settle().await;
    h
}

#[tokio::test]
async fn test_incoming_call_rings_and_persists() {
    let h = ringing_harness().await;

    assert_eq!(h.client.phase().await, CallPhase::IncomingRinging);
    let displayed = h.telephony.displayed();
    assert_eq!(displayed.len(), 1);
    let (uuid, caller, name, has_video) = &displayed[0];
    assert!(!uuid.is_empty());
    assert_eq!(*caller, UserId::new("u9"));
    assert_eq!(name, "Ada");
    assert!(has_video);

    let record = PendingCallStore::new(h.store.clone())
        .load()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.call_id, CallId::new("c9"));
    assert_eq!(record.uuid, *uuid);

    // Redelivery keeps the same uuid and does not ring twice.
    h.transport
        .inject_event(
            "incoming-call",
            json!({"callId": "c9", "callerId": "u9", "callType": "video"}),
        )
        .await;
    settle().await;
    assert_eq!(h.telephony.displayed().len(), 1);
}

#[tokio::test]
async fn test_group_invite_composes_caller_name_from_parties() {
    let h = connect_harness("u1", "Me", &[("u9", "Ada"), ("u3", "Cal")]).await;

    // No push-provided name: the display name is composed from the other
    // parties, server-provided info outranking the directory.
    h.transport
        .inject_event(
            "incoming-call",
            json!({
                "callId": "c20",
                "callerId": "u9",
                "callType": "audio",
                "participants": ["u9", "u1", "u3"],
                "participantsInfo": {"u3": {"firstName": "Callie"}},
            }),
        )
        .await;
    settle().await;

    let displayed = h.telephony.displayed();
    assert_eq!(displayed.len(), 1);
    assert_eq!(displayed[0].2, "Ada, Callie");
}

#[tokio::test]
async fn test_caller_name_falls_back_to_directory_then_raw_id() {
    let h = connect_harness("u1", "Me", &[("u9", "Ada")]).await;

    h.transport
        .inject_event(
            "incoming-call",
            json!({
                "callId": "c21",
                "callerId": "u9",
                "callType": "audio",
                "participants": ["u9", "u1"],
            }),
        )
        .await;
    settle().await;
    assert_eq!(h.telephony.displayed()[0].2, "Ada");
    h.client.decline_call().await.unwrap();

    // Nobody knows this caller: the raw id is the last resort.
    h.transport
        .inject_event(
            "incoming-call",
            json!({
                "callId": "c22",
                "callerId": "u77",
                "callType": "audio",
                "participants": ["u77", "u1"],
            }),
        )
        .await;
    settle().await;
    assert_eq!(h.telephony.displayed()[1].2, "u77");
}

#[tokio::test]
async fn test_accept_connects_and_clears_record() {
    let h = ringing_harness().await;

    h.client.accept_call(AcceptTrigger::Ui).await.unwrap();

    assert_eq!(h.client.phase().await, CallPhase::Active);
    assert_eq!(h.transport.count_op("accept-call"), 1);
    let accept = &h.transport.payloads_for("accept-call")[0];
    assert_eq!(accept["callId"], "c9");
    assert_eq!(accept["fromUserId"], "u9");
    // The UI path answers the OS call screen.
    assert_eq!(h.telephony.answered().len(), 1);

    // The caller is a joined participant with the 1:1 slot populated.
    let remote = h.client.remote_peer().await.unwrap();
    assert_eq!(remote.user_id, UserId::new("u9"));
    assert_eq!(remote.name, "Ada");

    assert!(
        PendingCallStore::new(h.store.clone())
            .load()
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_duplicate_accept_is_a_noop() {
    let h = ringing_harness().await;

    h.client.accept_call(AcceptTrigger::Ui).await.unwrap();
    h.client
        .accept_call(AcceptTrigger::Telephony)
        .await
        .unwrap();

    assert_eq!(h.transport.count_op("accept-call"), 1);
    assert_eq!(h.transport.count_op("join-call"), 1);
    assert_eq!(h.client.phase().await, CallPhase::Active);
}

#[tokio::test]
async fn test_racing_accepts_run_the_sequence_once() {
    let h = ringing_harness().await;

    let (a, b) = tokio::join!(
        h.client.accept_call(AcceptTrigger::Ui),
        h.client.accept_call(AcceptTrigger::Telephony),
    );
    // One side wins; the loser either no-ops after completion or is told an
    // accept is in progress. The side effects happen exactly once.
    assert!(a.is_ok() || b.is_ok());
    for result in [a, b] {
        if let Err(e) = result {
            assert!(matches!(e, CallError::AcceptInProgress));
        }
    }
    assert_eq!(h.transport.count_op("accept-call"), 1);
    assert_eq!(h.transport.count_op("create-transport"), 2);
    assert_eq!(h.client.phase().await, CallPhase::Active);
}

#[tokio::test]
async fn test_failed_accept_restores_ringing_and_allows_retry() {
    let h = ringing_harness().await;
    h.transport.script("accept-call", Err("call not found".into()));

    let err = h.client.accept_call(AcceptTrigger::Ui).await;
    assert!(matches!(err, Err(CallError::Signal(_))));
    assert_eq!(h.client.phase().await, CallPhase::IncomingRinging);

    // The script is consumed; the retry goes through.
    h.client.accept_call(AcceptTrigger::Ui).await.unwrap();
    assert_eq!(h.client.phase().await, CallPhase::Active);
    assert_eq!(h.transport.count_op("accept-call"), 2);
}

#[tokio::test]
async fn test_cold_start_accept_resolves_from_durable_record() {
    let h = connect_harness("u1", "Me", &[]).await;

    // Process restarted: the record exists, no in-memory call does.
    let record = PendingCallRecord {
        call_id: CallId::new("c77"),
        uuid: "uuid-77".into(),
        caller_id: UserId::new("u9"),
        call_type: CallMediaType::Audio,
        caller_name: "Ada".into(),
        participants: vec![UserId::new("u9"), UserId::new("u1")],
        rtp_capabilities: None,
        participants_info: HashMap::new(),
    };
    PendingCallStore::new(h.store.clone())
        .save(&record)
        .await
        .unwrap();

    h.client
        .accept_call(AcceptTrigger::Telephony)
        .await
        .unwrap();

    assert_eq!(h.client.phase().await, CallPhase::Active);
    let accept = &h.transport.payloads_for("accept-call")[0];
    assert_eq!(accept["callId"], "c77");
    assert_eq!(accept["fromUserId"], "u9");
    // The telephony path already answered itself.
    assert!(h.telephony.answered().is_empty());

    let participants = h.client.participants().await;
    assert!(
        participants
            .iter()
            .any(|p| p.user_id == UserId::new("u9") && p.name == "Ada")
    );
}

#[tokio::test]
async fn test_unresolvable_accept_releases_telephony() {
    let h = connect_harness("u1", "Me", &[]).await;

    let err = h.client.accept_call(AcceptTrigger::Telephony).await;
    assert!(matches!(err, Err(CallError::NoPendingCall)));
    assert_eq!(h.telephony.end_all_count(), 1);
}

#[tokio::test]
async fn test_decline_tears_down_and_notifies() {
    let h = ringing_harness().await;

    h.client.decline_call().await.unwrap();

    assert_eq!(h.transport.count_op("leave-call"), 1);
    assert_eq!(h.client.phase().await, CallPhase::Idle);
    assert!(
        PendingCallStore::new(h.store.clone())
            .load()
            .await
            .unwrap()
            .is_none()
    );
    // The native call screen for that uuid was ended.
    assert_eq!(h.telephony.ended().len(), 1);

    let err = h.client.decline_call().await;
    assert!(matches!(err, Err(CallError::NoActiveCall)));
}

#[tokio::test]
async fn test_expiry_is_ignored_once_accept_progressed() {
    let h = ringing_harness().await;
    h.client.accept_call(AcceptTrigger::Ui).await.unwrap();

    h.transport
        .inject_event("call-expired", json!({"callId": "c9"}))
        .await;
    settle().await;

    // The accepted call survives the stale expiry.
    assert_eq!(h.client.phase().await, CallPhase::Active);
}

#[tokio::test]
async fn test_expiry_clears_an_unanswered_call() {
    let h = ringing_harness().await;

    h.transport
        .inject_event("call-expired", json!({"callId": "c9"}))
        .await;
    settle().await;

    assert_eq!(h.client.phase().await, CallPhase::Idle);
    assert!(
        PendingCallStore::new(h.store.clone())
            .load()
            .await
            .unwrap()
            .is_none()
    );
}
