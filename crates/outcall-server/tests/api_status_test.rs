mod common;

use common::{body_text, harness, turn_uri, webhook};
use outcall_types::CallStatus;
use std::time::Duration;
use tower::ServiceExt; // for oneshot

#[tokio::test]
async fn terminal_status_finalizes_and_closes_monitor() {
    let h = harness(|_| {}).await;
    let call = h.new_call(Some("Dana")).await;
    let resp = h
        .router()
        .oneshot(webhook(&turn_uri(&call.id, 0), &[("CallSid", "CA7")]))
        .await
        .expect("turn");
    assert_eq!(resp.status(), 200);

    let (_, mut events) = h.state.monitor.subscribe(&call.id).await;

    let resp = h
        .router()
        .oneshot(webhook(
            "/voice/status",
            &[
                ("CallSid", "CA7"),
                ("CallStatus", "completed"),
                ("CallDuration", "42"),
                ("RecordingUrl", "https://vendor.example/rec/1"),
            ],
        ))
        .await
        .expect("status");
    assert_eq!(resp.status(), 200);
    assert!(body_text(resp).await.contains("<Response></Response>"));

    let call = h.call(&call.id).await;
    assert_eq!(call.status, CallStatus::Completed);
    assert_eq!(call.duration_secs, Some(42));
    assert_eq!(call.recording_url.as_deref(), Some("https://vendor.example/rec/1"));
    assert_eq!(call.evaluation.expect("evaluation").result, "incomplete");

    let status = events.recv().await.expect("status event");
    assert!(status.contains(r#""type":"status""#));
    assert!(status.contains(r#""status":"completed""#));
    let ended = events.recv().await.expect("call ended event");
    assert!(ended.contains(r#""type":"call_ended""#));

    // Observers are dropped once the grace period has passed.
    let closed = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("observer closed");
    assert!(closed.is_none());
}

#[tokio::test]
async fn late_status_does_not_overwrite_outcome() {
    let h = harness(|_| {}).await;
    let call = h.new_call(None).await;
    h.router()
        .oneshot(webhook(&turn_uri(&call.id, 0), &[("CallSid", "CA8")]))
        .await
        .expect("greeting");
    h.router()
        .oneshot(webhook(
            &turn_uri(&call.id, 1),
            &[("CallSid", "CA8"), ("SpeechResult", "no")],
        ))
        .await
        .expect("decline");
    let declined = h.call(&call.id).await;
    assert_eq!(declined.status, CallStatus::Completed);

    h.router()
        .oneshot(webhook(
            "/voice/status",
            &[("CallSid", "CA8"), ("CallStatus", "busy"), ("CallDuration", "9")],
        ))
        .await
        .expect("status");

    let after = h.call(&call.id).await;
    assert_eq!(after.status, CallStatus::Completed);
    assert_eq!(after.evaluation, declined.evaluation);
}

#[tokio::test]
async fn busy_line_is_recorded_as_busy() {
    let h = harness(|_| {}).await;
    let call = h.new_call(None).await;
    let resp = h
        .router()
        .oneshot(webhook(&turn_uri(&call.id, 0), &[("CallSid", "CA3")]))
        .await
        .expect("turn");
    assert_eq!(resp.status(), 200);

    h.router()
        .oneshot(webhook(
            "/voice/status",
            &[("CallSid", "CA3"), ("CallStatus", "busy")],
        ))
        .await
        .expect("status");

    let call = h.call(&call.id).await;
    assert_eq!(call.status, CallStatus::Busy);
    assert_eq!(call.evaluation.expect("evaluation").result, "busy");
}

#[tokio::test]
async fn status_for_unknown_sid_is_acknowledged() {
    let h = harness(|_| {}).await;
    for form in [
        vec![("CallSid", "CA404"), ("CallStatus", "completed")],
        vec![("CallStatus", "completed")],
        vec![("CallSid", "CA404"), ("CallStatus", "exploded")],
    ] {
        let resp = h
            .router()
            .oneshot(webhook("/voice/status", &form))
            .await
            .expect("status");
        assert_eq!(resp.status(), 200);
        assert!(body_text(resp).await.contains("<Response></Response>"));
    }
}
