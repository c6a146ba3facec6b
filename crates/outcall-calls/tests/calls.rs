use outcall_calls::{
    append_transcript, apply_turn, attach_external_sid, create_call, create_module,
    find_call_by_sid, get_call, get_module, record_status, CallError, CreateCallParams,
    CreateModuleParams, NewQuestion, StatusReport, TurnOutcome, TurnUpdate,
};
use outcall_types::{CallStatus, Customer, Evaluation, Speaker, TranscriptEntry, VoiceKind};
use rusqlite::Connection;

fn setup() -> Connection {
    let conn = Connection::open_in_memory().expect("open");
    conn.execute_batch("PRAGMA foreign_keys = ON;").expect("pragma");
    outcall_db::run_migrations(&conn).expect("migrations");
    create_module(
        &conn,
        &CreateModuleParams {
            id: "refi".into(),
            name: "Refinance".into(),
            questions: vec![
                NewQuestion {
                    text: "How much would you like to borrow?".into(),
                    required: true,
                },
                NewQuestion {
                    text: "Do you own your home?".into(),
                    required: false,
                },
            ],
        },
    )
    .expect("module");
    conn
}

fn new_call(conn: &Connection) -> String {
    create_call(
        conn,
        &CreateCallParams {
            module_id: "refi".into(),
            customer: Customer {
                id: "cust-1".into(),
                name: Some("Dana".into()),
                phone: Some("+15550100".into()),
            },
            voice: VoiceKind::MaleFriendly,
        },
    )
    .expect("call")
    .id
}

fn line(text: &str, question: Option<usize>) -> TranscriptEntry {
    TranscriptEntry {
        speaker: Speaker::Customer,
        text: text.into(),
        question,
        intent: None,
        confidence: None,
        at: "2026-03-01T10:00:00Z".into(),
    }
}

#[test]
fn module_questions_come_back_in_order() {
    let conn = setup();
    let module = get_module(&conn, "refi").expect("module");
    assert_eq!(module.questions.len(), 2);
    assert_eq!(module.questions[0].order, 0);
    assert_eq!(module.questions[1].text, "Do you own your home?");
    assert!(!module.questions[1].required);
}

#[test]
fn unknown_module_is_reported() {
    let conn = setup();
    let err = get_module(&conn, "nope").expect_err("missing");
    assert!(matches!(err, CallError::ModuleNotFound(id) if id == "nope"));
}

#[test]
fn new_call_starts_at_step_zero() {
    let conn = setup();
    let id = new_call(&conn);
    let call = get_call(&conn, &id).expect("call");
    assert_eq!(call.current_step, 0);
    assert_eq!(call.status, CallStatus::Initiated);
    assert_eq!(call.voice, VoiceKind::MaleFriendly);
    assert_eq!(call.customer.name.as_deref(), Some("Dana"));
    assert!(call.responses.is_empty());
}

#[test]
fn replayed_turn_does_not_duplicate_transcript() {
    let conn = setup();
    let id = new_call(&conn);
    let update = TurnUpdate {
        next_step: 3,
        responses: vec![(0, "fifty thousand".into())],
        transcript: vec![line("fifty thousand", Some(0))],
        ..Default::default()
    };

    let first = apply_turn(&conn, &id, &update).expect("first");
    assert!(matches!(first, TurnOutcome::Applied(_)));
    let second = apply_turn(&conn, &id, &update).expect("replay");
    assert!(matches!(second, TurnOutcome::Replayed(_)));

    let call = get_call(&conn, &id).expect("call");
    assert_eq!(call.current_step, 3);
    assert_eq!(call.transcript.len(), 1);
    assert_eq!(call.responses.get("0").map(String::as_str), Some("fifty thousand"));
}

#[test]
fn step_never_decreases() {
    let conn = setup();
    let id = new_call(&conn);
    for step in [1, 2, 1, 3, 2] {
        let update = TurnUpdate {
            next_step: step,
            ..Default::default()
        };
        apply_turn(&conn, &id, &update).expect("turn");
    }
    assert_eq!(get_call(&conn, &id).expect("call").current_step, 3);
}

#[test]
fn terminal_call_rejects_further_turns() {
    let conn = setup();
    let id = new_call(&conn);
    apply_turn(
        &conn,
        &id,
        &TurnUpdate {
            next_step: 2,
            status: Some(CallStatus::NoAnswer),
            ..Default::default()
        },
    )
    .expect("finish");

    let err = apply_turn(
        &conn,
        &id,
        &TurnUpdate {
            next_step: 3,
            responses: vec![(0, "late".into())],
            ..Default::default()
        },
    )
    .expect_err("frozen");
    assert!(matches!(err, CallError::Finalized { status: CallStatus::NoAnswer, .. }));
    assert!(get_call(&conn, &id).expect("call").responses.is_empty());

    // Replaying the finishing turn is still a replay.
    let replay = apply_turn(
        &conn,
        &id,
        &TurnUpdate {
            next_step: 2,
            ..Default::default()
        },
    )
    .expect("replay");
    assert!(matches!(replay, TurnOutcome::Replayed(_)));
}

#[test]
fn reprompt_lines_append_without_moving_the_step() {
    let conn = setup();
    let id = new_call(&conn);
    apply_turn(
        &conn,
        &id,
        &TurnUpdate {
            next_step: 1,
            ..Default::default()
        },
    )
    .expect("greeting");

    let call = append_transcript(&conn, &id, &[line("mm", None)]).expect("append");
    assert_eq!(call.current_step, 1);
    let stored = get_call(&conn, &id).expect("call");
    assert_eq!(stored.current_step, 1);
    assert_eq!(stored.transcript.len(), 1);
    assert_eq!(stored.transcript[0].text, "mm");

    apply_turn(
        &conn,
        &id,
        &TurnUpdate {
            next_step: 2,
            status: Some(CallStatus::Completed),
            ..Default::default()
        },
    )
    .expect("finish");
    let err = append_transcript(&conn, &id, &[line("late", None)]).expect_err("frozen");
    assert!(matches!(err, CallError::Finalized { .. }));
    assert_eq!(get_call(&conn, &id).expect("call").transcript.len(), 1);
}

#[test]
fn status_report_finalizes_once_and_fills_metadata() {
    let conn = setup();
    let id = new_call(&conn);
    attach_external_sid(&conn, &id, "CA123").expect("sid");

    let ringing = StatusReport {
        status: CallStatus::Ringing,
        duration_secs: None,
        recording_url: None,
    };
    let outcome = record_status(&conn, "CA123", &ringing, |_| unreachable!()).expect("ringing");
    assert!(!outcome.finalized);
    assert_eq!(outcome.call.status, CallStatus::Ringing);

    let busy = StatusReport {
        status: CallStatus::Busy,
        duration_secs: Some(0),
        recording_url: None,
    };
    let outcome = record_status(&conn, "CA123", &busy, |_| Evaluation {
        result: "busy".into(),
        comments: "line busy".into(),
    })
    .expect("busy");
    assert!(outcome.finalized);
    assert_eq!(outcome.call.evaluation.as_ref().map(|e| e.result.as_str()), Some("busy"));

    let late = StatusReport {
        status: CallStatus::Completed,
        duration_secs: Some(40),
        recording_url: Some("https://rec.example/1".into()),
    };
    let outcome = record_status(&conn, "CA123", &late, |_| unreachable!()).expect("late");
    assert!(!outcome.finalized);
    assert_eq!(outcome.call.status, CallStatus::Busy);
    assert_eq!(outcome.call.duration_secs, Some(0));
    assert_eq!(outcome.call.recording_url.as_deref(), Some("https://rec.example/1"));
}

#[test]
fn early_status_does_not_regress_answered_call() {
    let conn = setup();
    let id = new_call(&conn);
    attach_external_sid(&conn, &id, "CA9").expect("sid");
    apply_turn(
        &conn,
        &id,
        &TurnUpdate {
            next_step: 1,
            status: Some(CallStatus::InProgress),
            ..Default::default()
        },
    )
    .expect("turn");

    let ringing = StatusReport {
        status: CallStatus::Ringing,
        duration_secs: None,
        recording_url: None,
    };
    let outcome = record_status(&conn, "CA9", &ringing, |_| unreachable!()).expect("status");
    assert_eq!(outcome.call.status, CallStatus::InProgress);

    let found = find_call_by_sid(&conn, "CA9").expect("lookup").expect("some");
    assert_eq!(found.id, id);
}
