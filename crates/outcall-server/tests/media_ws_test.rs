mod common;

use common::{harness, turn_uri, webhook, Harness, QUESTIONS};
use futures_util::SinkExt;
use outcall_dialog::Stage;
use outcall_server::streaming::StreamingSession;
use outcall_types::CallStatus;
use outcall_voice::{RecognitionEvent, Transcript};
use std::sync::Arc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tower::ServiceExt; // for oneshot

fn final_text(text: &str, confidence: f32) -> RecognitionEvent {
    RecognitionEvent::Final(Transcript {
        text: text.to_string(),
        confidence,
        words: Vec::new(),
    })
}

/// Waits until the stored call reached `step` and the session is idle.
async fn settle(h: &Harness, call_id: &str, step: u32) {
    common::eventually(&format!("step {step}"), move || async move {
        let call = h.call(call_id).await;
        let idle = h
            .state
            .sessions
            .get(&call_id.to_string())
            .is_none_or(|session| !session.is_processing());
        call.current_step >= step && idle
    })
    .await;
}

/// Waits until `count` documents were spoken and the session is idle.
async fn settle_spoken(h: &Harness, call_id: &str, count: usize) {
    common::eventually(&format!("{count} spoken"), move || async move {
        let idle = h
            .state
            .sessions
            .get(&call_id.to_string())
            .is_none_or(|session| !session.is_processing());
        h.control.updates().len() >= count && idle
    })
    .await;
}

fn reject_call_updates(h: &Harness, reject: bool) {
    let conn = h.state.pool.get().expect("conn");
    let sql = if reject {
        "CREATE TRIGGER reject_call_updates BEFORE UPDATE ON calls \
         BEGIN SELECT RAISE(ABORT, 'store offline'); END;"
    } else {
        "DROP TRIGGER reject_call_updates;"
    };
    conn.execute_batch(sql).expect("trigger");
}

async fn streamed_call(h: &Harness) -> (String, mpsc::Sender<RecognitionEvent>) {
    let call = h.new_call(Some("Dana")).await;
    let resp = h
        .router()
        .oneshot(webhook(&turn_uri(&call.id, 0), &[("CallSid", "CA5")]))
        .await
        .expect("greeting");
    assert_eq!(resp.status(), 200);

    let addr = h.serve().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/voice/media"))
        .await
        .expect("connect");
    let frames = [
        json!({"event": "connected", "protocol": "Call", "version": "1.0.0"}),
        json!({
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ1",
            "start": {
                "streamSid": "MZ1",
                "callSid": "CA5",
                "tracks": ["inbound"],
                "customParameters": {"callId": call.id}
            }
        }),
        json!({"event": "media", "streamSid": "MZ1", "media": {"track": "inbound", "payload": "AAEC"}}),
    ];
    for frame in frames {
        ws.send(Message::Text(frame.to_string().into()))
            .await
            .expect("send frame");
    }

    let sessions = h.state.sessions.clone();
    let call_id = call.id.clone();
    common::eventually("streaming session", || {
        let sessions = sessions.clone();
        let call_id = call_id.clone();
        async move { sessions.get(&call_id).is_some() }
    })
    .await;
    assert_eq!(h.gateway.opened(), vec![call.id.clone()]);

    // Keep the media socket open for the rest of the test.
    tokio::spawn(async move {
        let _ws = ws;
        std::future::pending::<()>().await;
    });

    let events = h.gateway.events().expect("events sender");
    (call.id, events)
}

#[tokio::test]
async fn streamed_answers_drive_the_conversation() {
    let h = harness(|config| config.telephony.media_streams = true).await;
    let (call_id, events) = streamed_call(&h).await;

    events.send(final_text("yes", 0.95)).await.expect("send");
    settle(&h, &call_id, 2).await;
    let updates = h.control.updates();
    let (sid, doc) = updates.last().expect("spoken");
    assert_eq!(sid, "CA5");
    assert!(doc.contains(QUESTIONS[0]));
    assert!(doc.contains(r#"<Pause length="120"/>"#));

    // Low confidence is unclear: reprompt, nothing recorded, same stage.
    events.send(final_text("fifty", 0.3)).await.expect("send");
    settle_spoken(&h, &call_id, 2).await;
    let call = h.call(&call_id).await;
    assert!(call.responses.is_empty());
    assert_eq!(call.current_step, 2);
    assert!(call.transcript.iter().any(|e| e.text == "fifty"));
    assert!(h.control.updates().last().expect("reprompt").1.contains("Could you repeat"));

    events
        .send(final_text("fifty thousand", 0.9))
        .await
        .expect("send");
    settle(&h, &call_id, 3).await;
    let call = h.call(&call_id).await;
    assert_eq!(call.responses["0"], "fifty thousand");
    assert!(h.control.updates().last().expect("next").1.contains(QUESTIONS[1]));

    events.send(final_text("yes", 0.9)).await.expect("send");
    settle(&h, &call_id, 4).await;
    let call = h.call(&call_id).await;
    assert_eq!(call.status, CallStatus::Completed);
    assert_eq!(call.responses["1"], "yes");
    assert!(call.evaluation.is_some());
    assert!(h.control.updates().last().expect("outro").1.contains("<Hangup/>"));

    events.send(RecognitionEvent::Closed).await.expect("send");
    let sessions = h.state.sessions.clone();
    common::eventually("session release", || {
        let sessions = sessions.clone();
        let call_id = call_id.clone();
        async move { sessions.get(&call_id).is_none() }
    })
    .await;
}

#[tokio::test]
async fn reconnect_after_reprompt_resumes_the_same_stage() {
    let h = harness(|config| config.telephony.media_streams = true).await;
    let (call_id, events) = streamed_call(&h).await;

    events.send(final_text("mm", 0.2)).await.expect("send");
    settle_spoken(&h, &call_id, 1).await;
    assert!(h.control.updates()[0].1.contains("Do you have a couple of minutes"));
    assert_eq!(h.call(&call_id).await.current_step, 1);

    let session = StreamingSession::start(Arc::new(h.state.clone()), &call_id, Some("CA5".into()))
        .await
        .expect("restart");
    let resumed = session.dialog_state().await;
    assert_eq!(resumed.stage, Stage::AwaitingAvailability);
    assert_eq!(resumed.reprompts, 0);

    let events = h.gateway.events().expect("events sender");
    events.send(final_text("yes", 0.95)).await.expect("send");
    settle(&h, &call_id, 2).await;
    assert_eq!(session.dialog_state().await.stage, Stage::AwaitingAnswer(0));
    assert!(h.control.updates().last().expect("question").1.contains(QUESTIONS[0]));
}

#[tokio::test]
async fn failed_write_keeps_the_stage_and_asks_again() {
    let h = harness(|config| config.telephony.media_streams = true).await;
    let (call_id, events) = streamed_call(&h).await;
    let session = h.state.sessions.get(&call_id).expect("session");

    reject_call_updates(&h, true);
    events.send(final_text("yes", 0.95)).await.expect("send");
    settle_spoken(&h, &call_id, 1).await;
    assert!(h.control.updates()[0].1.contains("Do you have a couple of minutes"));
    assert_eq!(session.dialog_state().await.stage, Stage::AwaitingAvailability);
    reject_call_updates(&h, false);

    let call = h.call(&call_id).await;
    assert_eq!(call.current_step, 1);
    assert!(call.transcript.iter().all(|e| e.text != "yes"));

    events.send(final_text("yes", 0.95)).await.expect("send");
    settle(&h, &call_id, 2).await;
    let call = h.call(&call_id).await;
    assert!(call.transcript.iter().any(|e| e.text == "yes"));
    assert!(h.control.updates().last().expect("question").1.contains(QUESTIONS[0]));
}

#[tokio::test]
async fn partials_never_change_the_call() {
    let h = harness(|config| config.telephony.media_streams = true).await;
    let (call_id, events) = streamed_call(&h).await;
    let (_, mut monitor) = h.state.monitor.subscribe(&call_id).await;

    events
        .send(RecognitionEvent::Partial(Transcript {
            text: "yes I".into(),
            confidence: 0.95,
            words: Vec::new(),
        }))
        .await
        .expect("send");

    let event = monitor.recv().await.expect("partial event");
    assert!(event.contains(r#""is_final":false"#));
    assert!(event.contains(r#""intent":"YES""#));

    let session = h.state.sessions.get(&call_id).expect("session");
    common::eventually("partial buffered", || {
        let session = session.clone();
        async move { session.partial_text() == "yes I" }
    })
    .await;

    let call = h.call(&call_id).await;
    assert_eq!(call.current_step, 1);
    assert!(call.responses.is_empty());
    assert!(h.control.updates().is_empty());
}

#[tokio::test]
async fn terminal_status_stops_the_stream() {
    let h = harness(|config| config.telephony.media_streams = true).await;
    let (call_id, _events) = streamed_call(&h).await;

    h.router()
        .oneshot(webhook(
            "/voice/status",
            &[("CallSid", "CA5"), ("CallStatus", "completed")],
        ))
        .await
        .expect("status");

    assert!(h.state.sessions.get(&call_id).is_none());
    let call = h.call(&call_id).await;
    assert_eq!(call.status, CallStatus::Completed);
    assert_eq!(call.evaluation.expect("evaluation").result, "incomplete");
}
