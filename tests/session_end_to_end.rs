//! Full session against a local voice server: ready, transcript, server-side end.

use crossbeam_channel::Receiver;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use voicelink::{
    AgentState, ConnectRequest, ConnectionState, MockAudioBackend, MockCaptureDevice,
    SessionEvent, VoiceSession,
};

/// Drain events until `done` returns true or the deadline passes.
fn collect_until(
    events: &Receiver<SessionEvent>,
    timeout: Duration,
    done: impl Fn(&[SessionEvent]) -> bool,
) -> Vec<SessionEvent> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(20)) {
            Ok(SessionEvent::AudioLevel { .. }) => {}
            Ok(event) => {
                seen.push(event);
                if done(&seen) {
                    break;
                }
            }
            Err(_) => {}
        }
    }
    seen
}

fn request(endpoint: String) -> ConnectRequest {
    let mut request = ConnectRequest::new(&endpoint, "agent-1", "pk");
    request.reconnect_delay_ms = 20;
    request
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_runs_until_server_ends_it() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    let (initiate_tx, initiate_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let mut initiate = None;
        let mut audio_frames = 0usize;
        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Text(text) if initiate.is_none() => {
                    initiate = Some(text.as_str().to_string());
                    break;
                }
                Message::Binary(_) => audio_frames += 1,
                _ => {}
            }
        }
        initiate_tx.send(initiate).ok();

        for text in [
            r#"{"method":"onready","data":{"session_id":"s1"}}"#,
            r#"{"method":"ontranscript","data":{"text":"hi","is_final":true}}"#,
            r#"{"method":"onsessionended","data":{"reason":"done","duration":42}}"#,
        ] {
            ws.send(Message::Text(text.into())).await.unwrap();
        }

        // Count microphone frames until the client goes away.
        while let Some(Ok(message)) = ws.next().await {
            if matches!(message, Message::Binary(_)) {
                audio_frames += 1;
            }
        }
        audio_frames
    });

    let backend = Arc::new(
        MockAudioBackend::new().with_capture(MockCaptureDevice::new().with_samples(vec![500; 320])),
    );
    let session = VoiceSession::new(backend.clone());
    let events = session.events();
    session.connect(request(endpoint)).await.unwrap();

    let initiate = initiate_rx.await.unwrap().expect("no initiate message");
    let initiate: Value = serde_json::from_str(&initiate).unwrap();
    assert_eq!(initiate["method"], "initiate");
    assert_eq!(initiate["data"]["agent"]["agent_id"], "agent-1");

    let seen = tokio::task::spawn_blocking(move || {
        collect_until(&events, Duration::from_secs(5), |seen| {
            seen.iter().any(|e| {
                matches!(
                    e,
                    SessionEvent::ConnectionState {
                        state: ConnectionState::Disconnected,
                        ..
                    }
                )
            })
        })
    })
    .await
    .unwrap();

    assert!(seen.contains(&SessionEvent::SessionReady {
        session_id: Some("s1".to_string())
    }));
    assert!(seen.contains(&SessionEvent::AgentState {
        state: AgentState::Listening
    }));
    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::Transcript { text, is_user: true, is_final: true, .. } if text == "hi"
    )));
    assert!(seen.contains(&SessionEvent::SessionEnded {
        reason: Some("done".to_string()),
        duration_seconds: Some(42.0),
    }));

    let ready_at = seen
        .iter()
        .position(|e| matches!(e, SessionEvent::SessionReady { .. }))
        .unwrap();
    let ended_at = seen
        .iter()
        .position(|e| matches!(e, SessionEvent::SessionEnded { .. }))
        .unwrap();
    assert!(ready_at < ended_at);

    // The session end is terminal: no reconnect is attempted.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let late: Vec<SessionEvent> = session
        .events()
        .try_iter()
        .filter(|e| !matches!(e, SessionEvent::AudioLevel { .. }))
        .collect();
    let states: Vec<ConnectionState> = seen
        .iter()
        .chain(late.iter())
        .filter_map(|e| match e {
            SessionEvent::ConnectionState { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected
        ]
    );
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(session.agent_state(), AgentState::Idle);
    assert!(!session.get_audio_info().running);

    session.disconnect().await;
    assert!(!backend.render().is_started());
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_events_reach_the_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    let (custom_tx, custom_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut custom_tx = Some(custom_tx);
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if value["method"] == "user_action"
                    && let Some(tx) = custom_tx.take()
                {
                    tx.send(value).ok();
                }
            }
        }
    });

    let session = VoiceSession::new(Arc::new(MockAudioBackend::new()));
    let events = session.events();
    session.connect(request(endpoint)).await.unwrap();

    // Wait for the connection before sending.
    let connected = tokio::task::spawn_blocking(move || {
        collect_until(&events, Duration::from_secs(5), |seen| {
            seen.contains(&SessionEvent::ConnectionState {
                state: ConnectionState::Connected,
                reason: None,
            })
        })
    })
    .await
    .unwrap();
    assert!(connected.contains(&SessionEvent::ConnectionState {
        state: ConnectionState::Connected,
        reason: None,
    }));

    session
        .send_event("user_action", Some(serde_json::json!({"button": "stop"})))
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), custom_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received["data"]["button"], "stop");

    session.disconnect().await;
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_reader_still_gets_state_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        // Let both audio loops fill the queue with level updates first.
        tokio::time::sleep(Duration::from_millis(800)).await;
        for text in [
            r#"{"method":"onready","data":{"session_id":"s1"}}"#,
            r#"{"method":"onsessionended","data":{"reason":"done"}}"#,
        ] {
            ws.send(Message::Text(text.into())).await.unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    });

    let session = VoiceSession::with_event_queue(Arc::new(MockAudioBackend::new()), 32);
    let events = session.events();
    session.connect(request(endpoint)).await.unwrap();

    // Nobody reads while the server is talking.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let seen: Vec<SessionEvent> = events.try_iter().collect();
    let levels = seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::AudioLevel { .. }))
        .count();
    assert!(levels > 0);
    // Half of the queue, plus slack for the two loops racing the limit check.
    assert!(levels <= 18);
    assert!(seen.contains(&SessionEvent::SessionReady {
        session_id: Some("s1".to_string())
    }));
    assert!(seen.iter().any(|e| matches!(e, SessionEvent::SessionEnded { .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::ConnectionState {
            state: ConnectionState::Disconnected,
            ..
        }
    )));

    session.disconnect().await;
}
