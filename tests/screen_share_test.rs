//! Screen sharing: the single per-call slot, local/remote exclusivity, and
//! last-writer-wins between competing remote shares.

use huddle_rtc::test_utils::{connect_harness, settle, MockTrack, TestHarness};
use huddle_rtc::{CallError, CallMediaType, UserId};
use serde_json::json;

async fn active_call() -> TestHarness {
    let _ = env_logger::builder().is_test(true).try_init();
    let h = connect_harness("u1", "Me", &[("u2", "Bea"), ("u3", "Cal")]).await;
    h.client
        .start_call(vec![UserId::new("u2")], CallMediaType::Video)
        .await
        .unwrap();
    h.transport
        .inject_event("participant-joined", json!({"userId": "u2"}))
        .await;
    settle().await;
    h
}

async fn inject_remote_share(h: &TestHarness, producer_id: &str, user_id: &str) {
    h.transport.script(
        "create-consumer",
        Ok(json!({
            "id": format!("cons-{producer_id}"),
            "producerId": producer_id,
            "kind": "video",
        })),
    );
    h.transport
        .inject_event(
            "new-producer",
            json!({
                "producerId": producer_id,
                "userId": user_id,
                "kind": "video",
                "source": "screen",
            }),
        )
        .await;
    settle().await;
}

#[tokio::test]
async fn test_remote_share_fills_slot_without_touching_camera_stream() {
    let h = active_call().await;

    // Their camera video first.
    h.transport.script(
        "create-consumer",
        Ok(json!({"id": "cons-cam", "producerId": "p-cam", "kind": "video"})),
    );
    h.transport
        .inject_event(
            "new-producer",
            json!({"producerId": "p-cam", "userId": "u2", "kind": "video"}),
        )
        .await;
    settle().await;
    let camera_version = h.client.remote_peer().await.unwrap().stream_version;

    inject_remote_share(&h, "p-scr", "u2").await;

    let share = h.client.active_screen_share().unwrap();
    assert_eq!(share.owner, UserId::new("u2"));
    assert_eq!(share.producer_id.as_str(), "p-scr");
    // The camera composite was not replaced by the share.
    assert_eq!(
        h.client.remote_peer().await.unwrap().stream_version,
        camera_version
    );
}

#[tokio::test]
async fn test_local_share_rejected_while_remote_share_active() {
    let h = active_call().await;
    inject_remote_share(&h, "p-scr", "u2").await;

    let err = h
        .client
        .start_screen_share(MockTrack::video("my-screen"))
        .await;
    match err {
        Err(CallError::ScreenShareBusy { owner }) => assert_eq!(owner, UserId::new("u2")),
        other => panic!("expected ScreenShareBusy, got {other:?}"),
    }

    // Remote stops; now the local share may start.
    h.transport
        .inject_event("producer-closed", json!({"producerId": "p-scr"}))
        .await;
    settle().await;
    assert!(h.client.active_screen_share().is_none());

    h.client
        .start_screen_share(MockTrack::video("my-screen"))
        .await
        .unwrap();
    let share = h.client.active_screen_share().unwrap();
    assert_eq!(share.owner, UserId::new("u1"));
}

#[tokio::test]
async fn test_local_share_produces_with_screen_source() {
    let h = active_call().await;

    h.client
        .start_screen_share(MockTrack::video("my-screen"))
        .await
        .unwrap();

    let produce_payloads = h.transport.payloads_for("create-producer");
    let screen = produce_payloads
        .iter()
        .find(|p| p["appData"]["source"] == "screen")
        .expect("screen producer was created");
    assert_eq!(screen["kind"], "video");

    h.client.stop_screen_share().await.unwrap();
    assert_eq!(h.transport.count_op("close-producer"), 1);
    assert!(h.client.active_screen_share().is_none());

    // Stopping again is a no-op.
    h.client.stop_screen_share().await.unwrap();
    assert_eq!(h.transport.count_op("close-producer"), 1);
}

#[tokio::test]
async fn test_competing_remote_shares_resolve_last_writer_wins() {
    let h = active_call().await;
    // Third party joins; this is a group call now.
    h.transport
        .inject_event("participant-joined", json!({"userId": "u3"}))
        .await;
    settle().await;

    inject_remote_share(&h, "p-scr-2", "u2").await;
    assert_eq!(
        h.client.active_screen_share().unwrap().owner,
        UserId::new("u2")
    );

    inject_remote_share(&h, "p-scr-3", "u3").await;
    assert_eq!(
        h.client.active_screen_share().unwrap().owner,
        UserId::new("u3")
    );
}

#[tokio::test]
async fn test_sharer_leaving_clears_the_slot() {
    let h = active_call().await;
    h.transport
        .inject_event("participant-joined", json!({"userId": "u3"}))
        .await;
    settle().await;
    inject_remote_share(&h, "p-scr", "u2").await;

    h.transport
        .inject_event("participant-left", json!({"userId": "u2"}))
        .await;
    settle().await;

    assert!(h.client.active_screen_share().is_none());
    // The call itself survives with u3.
    assert!(h.client.current_call().await.is_some());
}

#[tokio::test]
async fn test_end_call_clears_local_share() {
    let h = active_call().await;
    h.client
        .start_screen_share(MockTrack::video("my-screen"))
        .await
        .unwrap();

    h.client.end_call().await;
    assert!(h.client.active_screen_share().is_none());
}
