use super::*;
use crate::call::CallDirection;
use crate::error::PhoneError;
use crate::useragent::transport::{SignalingError, TerminatedReason};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn outbound_call_rings_then_connects() {
    let line = TestLine::registered().await;
    assert_ok!(line.phone.dial("2000").await);

    let snapshot = line.snapshot();
    let call = snapshot.call.as_ref().unwrap();
    assert_eq!(call.state, CallState::Dialing);
    assert_eq!(call.direction, CallDirection::Outbound);
    assert_eq!(call.peer_address, "sip:2000@pbx.local");
    assert!(call.established_at.is_none());
    assert_eq!(
        line.transport.journal().last(),
        Some(&Primitive::Invite("sip:2000@pbx.local".to_string()))
    );

    assert!(line.transport.emit(SessionState::Provisional(180)));
    line.wait_for_call(CallState::Ringing).await;
    assert!(line.media.bound("default").is_none());

    assert!(line.transport.emit(SessionState::Established));
    let snapshot = line.wait_for_call(CallState::Connected).await;
    assert!(snapshot.call.unwrap().established_at.is_some());
    let media = line.media.bound("default").expect("remote stream bound");
    assert_eq!(media.to_string(), format!("loopback-{}", line.session_id()));
}

#[tokio::test]
async fn sip_uri_is_dialed_verbatim() {
    let line = TestLine::registered().await;
    assert_ok!(line.phone.dial("sip:bob@example.com").await);
    assert_eq!(
        line.snapshot().call.unwrap().peer_address,
        "sip:bob@example.com"
    );
}

#[tokio::test]
async fn session_creation_failure_returns_to_idle() {
    let line = TestLine::registered().await;
    line.transport.fail_next(
        PrimitiveKind::Invite,
        SignalingError::Failed("no route".to_string()),
    );
    let err = assert_err!(line.phone.dial("2000").await);
    assert_eq!(err, PhoneError::Transport("no route".to_string()));
    assert_eq!(line.snapshot().call_state(), CallState::Idle);

    // the line is usable again
    assert_ok!(line.phone.dial("2000").await);
}

#[tokio::test]
async fn dial_while_call_active_is_invalid() {
    let line = TestLine::registered().await;
    assert_ok!(line.phone.dial("2000").await);
    let err = assert_err!(line.phone.dial("3000").await);
    assert!(matches!(err, PhoneError::InvalidState { command: "dial", .. }));
    assert_eq!(line.count(PrimitiveKind::Invite), 1);
    assert_eq!(
        line.snapshot().call.unwrap().peer_address,
        "sip:2000@pbx.local"
    );
}

#[tokio::test]
async fn dial_rejects_malformed_number() {
    let line = TestLine::registered().await;
    let err = assert_err!(line.phone.dial("   ").await);
    assert!(matches!(err, PhoneError::InvalidTarget(_)));
    let err = assert_err!(line.phone.dial("20 00").await);
    assert!(matches!(err, PhoneError::InvalidTarget(_)));
    assert_eq!(line.count(PrimitiveKind::Invite), 0);
    assert_eq!(line.snapshot().call_state(), CallState::Idle);
}

#[tokio::test]
async fn hangup_while_dialing_cancels_and_byes_late_answer() {
    let line = TestLine::registered_with(LoopbackOption {
        auto_respond: false,
        ..Default::default()
    })
    .await;
    assert_ok!(line.phone.dial("2000").await);
    let session = line.session_id();

    assert_ok!(line.phone.hangup().await);
    assert_eq!(line.snapshot().call_state(), CallState::Idle);
    line.wait_for_primitive(|p| *p == Primitive::Cancel(session.clone()))
        .await;

    // the CANCEL crossed a 200 OK on the wire
    assert!(line.transport.emit(SessionState::Established));
    line.wait_for_primitive(|p| *p == Primitive::Bye(session.clone()))
        .await;
    assert_eq!(line.snapshot().call_state(), CallState::Idle);
    assert!(line.media.bound("default").is_none());
}

#[tokio::test]
async fn hangup_before_session_is_created() {
    let line = TestLine::registered().await;
    line.transport.pause(PrimitiveKind::Invite);
    let phone = line.phone.clone();
    let dialing = tokio::spawn(async move { phone.dial("2000").await });
    line.wait_for_call(CallState::Dialing).await;

    assert_ok!(line.phone.hangup().await);
    assert_eq!(line.snapshot().call_state(), CallState::Idle);

    line.transport.resume(PrimitiveKind::Invite);
    let err = assert_err!(dialing.await.unwrap());
    assert!(matches!(
        err,
        PhoneError::OperationFailed {
            operation: "dial",
            ..
        }
    ));
    let session = line.session_id();
    line.wait_for_primitive(|p| *p == Primitive::Cancel(session.clone()))
        .await;
    assert_eq!(line.snapshot().call_state(), CallState::Idle);
}

#[tokio::test]
async fn hangup_connected_call_sends_bye() {
    let line = TestLine::connected_outbound(LoopbackOption::default()).await;
    let session = line.session_id();
    assert_ok!(line.phone.hangup().await);

    let snapshot = line.snapshot();
    assert_eq!(snapshot.call_state(), CallState::Idle);
    assert!(snapshot.call.is_none());
    assert!(line.media.bound("default").is_none());
    assert!(line.transport.journal().contains(&Primitive::Bye(session)));
    assert_eq!(line.count(PrimitiveKind::Cancel), 0);
}

#[tokio::test]
async fn repeated_hangup_while_terminating() {
    let line = TestLine::connected_outbound(LoopbackOption::default()).await;
    line.transport.pause(PrimitiveKind::Bye);
    let phone = line.phone.clone();
    let first = tokio::spawn(async move { phone.hangup().await });
    line.wait_for_call(CallState::Terminating).await;

    assert_ok!(line.phone.hangup().await);
    assert_eq!(line.snapshot().call_state(), CallState::Terminating);

    line.transport.resume(PrimitiveKind::Bye);
    assert_ok!(first.await.unwrap());
    line.wait_for_call(CallState::Idle).await;
    assert_eq!(line.count(PrimitiveKind::Bye), 1);
}

#[tokio::test]
async fn failed_bye_still_ends_call() {
    let line = TestLine::connected_outbound(LoopbackOption::default()).await;
    line.transport.fail_next(
        PrimitiveKind::Bye,
        SignalingError::Failed("socket closed".to_string()),
    );
    assert_ok!(line.phone.hangup().await);

    let snapshot = line.snapshot();
    assert_eq!(snapshot.call_state(), CallState::Idle);
    assert!(snapshot.last_error.unwrap().contains("socket closed"));
}

#[tokio::test]
async fn hangup_while_idle_is_noop() {
    let line = TestLine::registered().await;
    let before = line.transport.journal().len();
    assert_ok!(line.phone.hangup().await);
    assert_eq!(line.transport.journal().len(), before);
    assert!(line.snapshot().last_error.is_none());
}

#[tokio::test]
async fn remote_rejection_ends_call() {
    let line = TestLine::registered().await;
    assert_ok!(line.phone.dial("2000").await);
    assert!(line
        .transport
        .emit(SessionState::Terminated(TerminatedReason::RemoteRejected(486))));

    let snapshot = line.wait_for_call(CallState::Idle).await;
    assert_eq!(
        snapshot.last_error.as_deref(),
        Some("call rejected by remote party: 486")
    );
}

#[tokio::test]
async fn remote_bye_ends_connected_call() {
    let line = TestLine::connected_outbound(LoopbackOption::default()).await;
    assert!(line
        .transport
        .emit(SessionState::Terminated(TerminatedReason::RemoteBye)));
    line.wait_for_call(CallState::Idle).await;
    assert!(line.media.bound("default").is_none());
    assert_eq!(line.count(PrimitiveKind::Bye), 0);
}

#[tokio::test]
async fn call_events_follow_round_trip() {
    let line = TestLine::registered().await;
    let mut events = line.phone.subscribe();
    assert_ok!(line.phone.dial("2000").await);
    assert!(line.transport.emit(SessionState::Established));
    line.wait_for_call(CallState::Connected).await;
    assert_ok!(line.phone.hangup().await);

    let mut states = Vec::new();
    while states.last() != Some(&CallState::Idle) {
        match wait_for_event(&mut events, |e| matches!(e, LineEvent::CallState { .. })).await {
            LineEvent::CallState { state, .. } => states.push(state),
            _ => unreachable!(),
        }
    }
    assert_eq!(
        states,
        vec![
            CallState::Dialing,
            CallState::Connected,
            CallState::Terminating,
            CallState::Idle
        ]
    );
}

#[tokio::test]
async fn remote_answers_after_delay() {
    let line = TestLine::registered_with(LoopbackOption {
        answer_after: Some(Duration::from_millis(20)),
        ..Default::default()
    })
    .await;
    assert_ok!(line.phone.dial("2000").await);
    line.wait_for_call(CallState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn duration_ticks_while_connected() {
    let line = TestLine::connected_outbound(LoopbackOption::default()).await;
    let mut events = line.phone.subscribe();

    let mut ticks = Vec::new();
    for _ in 0..3 {
        match wait_for_event(&mut events, |e| matches!(e, LineEvent::Duration { .. })).await {
            LineEvent::Duration { elapsed, .. } => ticks.push(elapsed),
            _ => unreachable!(),
        }
    }
    assert_eq!(ticks, vec![1, 2, 3]);
    assert!(line.snapshot().call.unwrap().duration >= 3);

    assert_ok!(line.phone.hangup().await);
    assert!(line.snapshot().call.is_none());

    // a new call counts from zero
    assert_ok!(line.phone.dial("2001").await);
    assert_eq!(line.snapshot().call.unwrap().duration, 0);
    assert!(line.transport.emit(SessionState::Established));
    line.wait_for_call(CallState::Connected).await;
    match wait_for_event(&mut events, |e| matches!(e, LineEvent::Duration { .. })).await {
        LineEvent::Duration { elapsed, .. } => assert_eq!(elapsed, 1),
        _ => unreachable!(),
    }
}
