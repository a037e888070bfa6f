//! Topology changes: 1:1 ↔ group upgrades and downgrades, mute routing in
//! both modes, and foreground/background video pausing.

use huddle_rtc::platform::AppLifecycle;
use huddle_rtc::test_utils::{connect_harness, settle, TestHarness};
use huddle_rtc::{CallError, CallMediaType, MediaKind, UserId};
use serde_json::json;

async fn one_to_one_call(call_type: CallMediaType) -> TestHarness {
    let _ = env_logger::builder().is_test(true).try_init();
    let h = connect_harness("u1", "Me", &[("u2", "Bea"), ("u3", "Cal")]).await;
    h.client
        .start_call(vec![UserId::new("u2")], call_type)
        .await
        .unwrap();
    h.transport
        .inject_event("participant-joined", json!({"userId": "u2"}))
        .await;
    h.transport
        .inject_event(
            "new-producer",
            json!({"producerId": "p-a2", "userId": "u2", "kind": "audio"}),
        )
        .await;
    settle().await;
    h
}

#[tokio::test]
async fn test_adding_a_participant_upgrades_to_group() {
    let h = one_to_one_call(CallMediaType::Audio).await;
    let established = h.client.remote_peer().await.unwrap();
    assert!(established.stream.is_some());

    h.client
        .add_participants(vec![UserId::new("u3")])
        .await
        .unwrap();

    // The single-slot view dissolves; the registry keeps u2's stream.
    assert!(h.client.remote_peer().await.is_none());
    assert!(h.client.manager().is_group().await);
    let participants = h.client.participants().await;
    assert_eq!(participants.len(), 3);
    let kept = participants
        .iter()
        .find(|p| p.user_id == UserId::new("u2"))
        .unwrap();
    assert!(kept.stream.is_some());

    let payload = &h.transport.payloads_for("add-participants")[0];
    assert_eq!(payload["participantIds"], json!(["u3"]));
}

#[tokio::test]
async fn test_duplicate_add_is_a_successful_noop() {
    let h = one_to_one_call(CallMediaType::Audio).await;

    h.client
        .add_participants(vec![UserId::new("u2")])
        .await
        .unwrap();
    assert_eq!(h.transport.count_op("add-participants"), 0);
    assert!(h.client.remote_peer().await.is_some());
}

#[tokio::test]
async fn test_failed_add_rolls_back_placeholders() {
    let h = one_to_one_call(CallMediaType::Audio).await;
    h.transport
        .script("add-participants", Err("user not found".into()));

    let err = h.client.add_participants(vec![UserId::new("u3")]).await;
    assert!(matches!(err, Err(CallError::Signal(_))));

    assert_eq!(h.client.participants().await.len(), 2);
    // The 1:1 view is restored with the established stream intact.
    let remote = h.client.remote_peer().await.unwrap();
    assert_eq!(remote.user_id, UserId::new("u2"));
    assert!(remote.stream.is_some());
}

#[tokio::test]
async fn test_add_respects_the_participant_limit() {
    let h = one_to_one_call(CallMediaType::Audio).await;

    let too_many: Vec<UserId> = (3..=12).map(|n| UserId::new(format!("u{n}"))).collect();
    let err = h.client.add_participants(too_many).await;
    assert!(matches!(err, Err(CallError::TooManyParticipants { .. })));
    assert_eq!(h.client.participants().await.len(), 2);
}

#[tokio::test]
async fn test_group_shrinking_back_to_one_to_one_keeps_the_stream() {
    let h = one_to_one_call(CallMediaType::Audio).await;
    h.transport
        .inject_event("participant-joined", json!({"userId": "u3"}))
        .await;
    settle().await;
    assert!(h.client.remote_peer().await.is_none());

    let u2_stream_id = h
        .client
        .participants()
        .await
        .iter()
        .find(|p| p.user_id == UserId::new("u2"))
        .unwrap()
        .stream
        .as_ref()
        .unwrap()
        .id()
        .to_string();

    h.transport
        .inject_event("participant-left", json!({"userId": "u3"}))
        .await;
    settle().await;

    // Downgrade: the survivor's existing handle carries over, no recreation.
    let remote = h.client.remote_peer().await.unwrap();
    assert_eq!(remote.user_id, UserId::new("u2"));
    assert_eq!(remote.stream.as_ref().unwrap().id(), u2_stream_id);
}

#[tokio::test]
async fn test_invited_participant_who_never_answers_is_pruned() {
    let h = one_to_one_call(CallMediaType::Audio).await;
    h.client
        .add_participants(vec![UserId::new("u3")])
        .await
        .unwrap();
    assert!(h.client.manager().is_group().await);

    h.transport
        .inject_event("participant-no-answer", json!({"userId": "u3"}))
        .await;
    settle().await;

    assert_eq!(h.client.participants().await.len(), 2);
    assert!(h.client.remote_peer().await.is_some());

    // No-answer for someone already joined is ignored.
    h.transport
        .inject_event("participant-no-answer", json!({"userId": "u2"}))
        .await;
    settle().await;
    assert_eq!(h.client.participants().await.len(), 2);
}

#[tokio::test]
async fn test_remote_mute_routes_by_topology() {
    let h = one_to_one_call(CallMediaType::Audio).await;

    // 1:1: an event for someone who is not the displayed remote is stale.
    h.transport
        .inject_event("remote-user-muted", json!({"userId": "u3"}))
        .await;
    settle().await;
    assert!(!h.client.remote_peer().await.unwrap().mic_muted);

    h.transport
        .inject_event("remote-user-muted", json!({"userId": "u2"}))
        .await;
    settle().await;
    assert!(h.client.remote_peer().await.unwrap().mic_muted);

    // Group mode: flags land on the registry entry.
    h.transport
        .inject_event("participant-joined", json!({"userId": "u3"}))
        .await;
    h.transport
        .inject_event("remote-user-video-muted", json!({"userId": "u3"}))
        .await;
    settle().await;
    let participants = h.client.participants().await;
    let u3 = participants
        .iter()
        .find(|p| p.user_id == UserId::new("u3"))
        .unwrap();
    assert!(u3.video_muted);

    h.transport
        .inject_event("remote-user-video-unmuted", json!({"userId": "u3"}))
        .await;
    settle().await;
    let participants = h.client.participants().await;
    let u3 = participants
        .iter()
        .find(|p| p.user_id == UserId::new("u3"))
        .unwrap();
    assert!(!u3.video_muted);
}

#[tokio::test]
async fn test_local_mute_notifies_peers() {
    let h = one_to_one_call(CallMediaType::Video).await;

    let muted = h.client.toggle_mute(MediaKind::Video).await.unwrap();
    assert!(muted);
    let payload = &h.transport.payloads_for("mute-video")[0];
    assert_eq!(payload["muted"], true);

    let muted = h.client.toggle_mute(MediaKind::Video).await.unwrap();
    assert!(!muted);
    assert_eq!(h.transport.payloads_for("mute-video")[1]["muted"], false);
}

#[tokio::test]
async fn test_backgrounding_pauses_video_and_foreground_resumes() {
    let h = one_to_one_call(CallMediaType::Video).await;

    h.client.on_app_state_change(AppLifecycle::Background).await;
    let payloads = h.transport.payloads_for("mute-video");
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["muted"], true);

    h.client.on_app_state_change(AppLifecycle::Foreground).await;
    let payloads = h.transport.payloads_for("mute-video");
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[1]["muted"], false);
}

#[tokio::test]
async fn test_manual_mute_survives_foregrounding() {
    let h = one_to_one_call(CallMediaType::Video).await;

    h.client.on_app_state_change(AppLifecycle::Background).await;
    // The user also mutes manually while backgrounded.
    h.client.toggle_mute(MediaKind::Video).await.unwrap();

    h.client.on_app_state_change(AppLifecycle::Foreground).await;

    // No auto-resume: every mute-video sent so far was a mute.
    for payload in h.transport.payloads_for("mute-video") {
        assert_eq!(payload["muted"], true);
    }

    // A second background/foreground cycle with the producer paused stays
    // quiet too.
    h.client.on_app_state_change(AppLifecycle::Background).await;
    h.client.on_app_state_change(AppLifecycle::Foreground).await;
    for payload in h.transport.payloads_for("mute-video") {
        assert_eq!(payload["muted"], true);
    }
}

#[tokio::test]
async fn test_backgrounding_an_audio_call_is_a_noop() {
    let h = one_to_one_call(CallMediaType::Audio).await;

    h.client.on_app_state_change(AppLifecycle::Background).await;
    h.client.on_app_state_change(AppLifecycle::Foreground).await;

    assert_eq!(h.transport.count_op("mute-video"), 0);
}
