mod common;

use common::{harness, turn_uri, webhook};
use futures_util::StreamExt;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tower::ServiceExt; // for oneshot

#[tokio::test]
async fn observer_follows_a_call_until_it_ends() {
    let h = harness(|_| {}).await;
    let call = h.new_call(Some("Dana")).await;
    let addr = h.serve().await;

    // Nobody is watching yet; nothing is retained for later observers.
    h.router()
        .oneshot(webhook(&turn_uri(&call.id, 0), &[("CallSid", "CA2")]))
        .await
        .expect("greeting");

    let url = format!("ws://{}/monitor/{}", addr, call.id);
    let (mut ws, _) = connect_async(url).await.expect("connect");

    let monitor = h.state.monitor.clone();
    let call_id = call.id.clone();
    common::eventually("observer registration", || {
        let monitor = monitor.clone();
        let call_id = call_id.clone();
        async move { monitor.observer_count(&call_id).await == 1 }
    })
    .await;

    h.router()
        .oneshot(webhook(
            &turn_uri(&call.id, 1),
            &[("CallSid", "CA2"), ("SpeechResult", "no"), ("Confidence", "0.9")],
        ))
        .await
        .expect("decline");

    let mut texts = Vec::new();
    let mut closed = false;
    while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
        match msg.expect("frame") {
            Message::Text(text) => texts.push(text.as_str().to_string()),
            Message::Close(_) => {
                closed = true;
                break;
            }
            _ => {}
        }
    }

    assert!(closed, "observer is disconnected after the grace period");
    assert!(
        !texts.iter().any(|t| t.contains("Hello Dana")),
        "greeting was published before the observer joined"
    );

    let heard = texts
        .iter()
        .find(|t| t.contains(r#""type":"transcript""#) && t.contains(r#""speaker":"customer""#))
        .expect("customer line");
    assert!(heard.contains(r#""text":"no""#));
    assert!(heard.contains(r#""intent":"NO""#));
    assert!(heard.contains(r#""is_final":true"#));

    let stage = texts
        .iter()
        .find(|t| t.contains(r#""type":"stage""#))
        .expect("stage event");
    assert!(stage.contains(r#""stage":"done""#));

    let ended = texts.last().expect("events");
    assert!(ended.contains(r#""type":"call_ended""#));
    assert!(ended.contains(r#""reason":"declined""#));

    assert_eq!(h.state.monitor.observer_count(&call.id).await, 0);
}

#[tokio::test]
async fn observers_of_other_calls_hear_nothing() {
    let h = harness(|_| {}).await;
    let watched = h.new_call(None).await;
    let other = h.new_call(None).await;
    let addr = h.serve().await;

    let url = format!("ws://{}/monitor/{}", addr, watched.id);
    let (mut ws, _) = connect_async(url).await.expect("connect");
    let monitor = h.state.monitor.clone();
    let call_id = watched.id.clone();
    common::eventually("observer registration", || {
        let monitor = monitor.clone();
        let call_id = call_id.clone();
        async move { monitor.observer_count(&call_id).await == 1 }
    })
    .await;

    h.router()
        .oneshot(webhook(&turn_uri(&other.id, 0), &[("CallSid", "CA6")]))
        .await
        .expect("greeting");

    let next = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "no event crosses calls");
}
