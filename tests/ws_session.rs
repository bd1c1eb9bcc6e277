use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::State,
    http::HeaderMap,
    response::Response,
    routing::any,
    Router,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use xiaozhi_client::state::{DeviceState, StateMachine};
use xiaozhi_client::ws::messages::{ClientMessage, ServerMessage};
use xiaozhi_client::ws::{WsClient, WsConfig, WsEvent};
use xiaozhi_client::ErrorKind;

const OPUS_LIKE: &[u8] = &[0xf8, 0xff, 0xfe, 0x01, 0x9c, 0x80];

fn server_hello() -> String {
    json!({
        "type": "hello",
        "session_id": "sess-1",
        "transport": "websocket",
        "audio_params": { "sample_rate": 16000, "frame_duration": 60 }
    })
    .to_string()
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

fn connect(
    addr: &str,
) -> (
    Arc<StateMachine>,
    mpsc::Receiver<WsEvent>,
    WsClient,
) {
    let state = Arc::new(StateMachine::new());
    state.set(DeviceState::Activated);
    let (tx, rx) = mpsc::channel(256);
    let config = WsConfig::new(
        format!("ws://{}/v1/", addr),
        Some("T".to_string()),
        "02:00:00:aa:bb:cc",
        "5f3a2f66-8a1f-4e2a-9c9e-000000000000",
    );
    let client = WsClient::connect(config, state.clone(), tx).unwrap();
    (state, rx, client)
}

async fn next_event(rx: &mut mpsc::Receiver<WsEvent>) -> WsEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for ws event")
        .expect("event stream closed")
}

// Handshake, fragmented binary JSON, audio and a text control frame, in one
// scripted session. Checks both demux branches and order preservation.
#[tokio::test]
async fn session_demux_and_order() {
    async fn script(mut socket: WebSocket) {
        let first = socket.recv().await.unwrap().unwrap();
        if let WsMessage::Text(text) = &first {
            let v: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(v["type"], "hello");
            assert_eq!(v["version"], 1);
            assert_eq!(v["features"]["mcp"], true);
            assert_eq!(v["audio_params"]["format"], "opus");
        } else {
            panic!("expected client hello text frame");
        }
        socket
            .send(WsMessage::Text(server_hello().into()))
            .await
            .unwrap();

        // One JSON value fragmented across two binary frames. The split sits
        // inside the ASCII prefix so each fragment is valid UTF-8.
        let full = r#"{"type":"tts","state":"sentence_start","text":"你好"}"#.as_bytes();
        let (a, b) = full.split_at(20);
        socket
            .send(WsMessage::Binary(a.to_vec().into()))
            .await
            .unwrap();
        socket
            .send(WsMessage::Binary(b.to_vec().into()))
            .await
            .unwrap();

        socket
            .send(WsMessage::Binary(OPUS_LIKE.to_vec().into()))
            .await
            .unwrap();

        socket
            .send(WsMessage::Text(
                r#"{"type":"llm","emotion":"happy"}"#.into(),
            ))
            .await
            .unwrap();

        // Unknown types are ignored by the client.
        socket
            .send(WsMessage::Text(r#"{"type":"stt","text":"x"}"#.into()))
            .await
            .unwrap();

        while let Some(Ok(_)) = socket.recv().await {}
    }

    let app = Router::new().route(
        "/v1/",
        any(|ws: WebSocketUpgrade| async move { ws.on_upgrade(script) }),
    );
    let addr = serve(app).await;
    let (state, mut rx, client) = connect(&addr);

    match next_event(&mut rx).await {
        WsEvent::Ready {
            session_id,
            sample_rate,
        } => {
            assert_eq!(session_id.as_deref(), Some("sess-1"));
            assert_eq!(sample_rate, 16000);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(state.current(), DeviceState::WsReady);

    match next_event(&mut rx).await {
        WsEvent::Message(ServerMessage::Tts { state, text }) => {
            assert_eq!(state, "sentence_start");
            assert_eq!(text.as_deref(), Some("你好"));
        }
        other => panic!("unexpected {:?}", other),
    }

    match next_event(&mut rx).await {
        WsEvent::Audio(bytes) => assert_eq!(bytes, OPUS_LIKE),
        other => panic!("unexpected {:?}", other),
    }

    match next_event(&mut rx).await {
        WsEvent::Message(ServerMessage::Llm { emotion, .. }) => {
            assert_eq!(emotion.as_deref(), Some("happy"));
        }
        other => panic!("unexpected {:?}", other),
    }

    client.shutdown().await;
    match next_event(&mut rx).await {
        WsEvent::Closed => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(state.current(), DeviceState::Activated);
}

// The handshake headers the service requires, byte for byte.
#[tokio::test]
async fn handshake_headers() {
    let (seen_tx, mut seen_rx) = mpsc::channel::<HeaderMap>(1);

    async fn handler(
        ws: WebSocketUpgrade,
        headers: HeaderMap,
        State(tx): State<mpsc::Sender<HeaderMap>>,
    ) -> Response {
        let _ = tx.try_send(headers);
        ws.on_upgrade(|mut socket| async move {
            if socket.recv().await.is_some() {
                let _ = socket.send(WsMessage::Text(server_hello().into())).await;
            }
            while let Some(Ok(_)) = socket.recv().await {}
        })
    }

    let app = Router::new().route("/v1/", any(handler)).with_state(seen_tx);
    let addr = serve(app).await;
    let (_state, mut rx, client) = connect(&addr);

    assert!(matches!(next_event(&mut rx).await, WsEvent::Ready { .. }));

    let headers = seen_rx.recv().await.unwrap();
    assert_eq!(headers.get("Authorization").unwrap(), "Bearer T");
    assert_eq!(headers.get("Protocol-Version").unwrap(), "1");
    assert_eq!(headers.get("Device-Id").unwrap(), "02:00:00:aa:bb:cc");
    assert_eq!(
        headers.get("Client-Id").unwrap(),
        "5f3a2f66-8a1f-4e2a-9c9e-000000000000"
    );
    assert_eq!(headers.get("Origin").unwrap(), "https://xiaozhi.me");

    client.shutdown().await;
}

// An outbound listen/detect arrives on the server as submitted.
#[tokio::test]
async fn outbound_messages_reach_server() {
    let (seen_tx, mut seen_rx) = mpsc::channel::<String>(8);

    async fn handler(
        ws: WebSocketUpgrade,
        State(tx): State<mpsc::Sender<String>>,
    ) -> Response {
        ws.on_upgrade(move |mut socket| async move {
            let _hello = socket.recv().await;
            let _ = socket.send(WsMessage::Text(server_hello().into())).await;
            while let Some(Ok(msg)) = socket.recv().await {
                if let WsMessage::Text(text) = msg {
                    let _ = tx.send(text.to_string()).await;
                }
            }
        })
    }

    let app = Router::new().route("/v1/", any(handler)).with_state(seen_tx);
    let addr = serve(app).await;
    let (_state, mut rx, client) = connect(&addr);
    assert!(matches!(next_event(&mut rx).await, WsEvent::Ready { .. }));

    client
        .send(ClientMessage::listen_detect("sess-1", "turn on the light"))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let v: serde_json::Value = serde_json::from_str(&received).unwrap();
    assert_eq!(v["type"], "listen");
    assert_eq!(v["state"], "detect");
    assert_eq!(v["text"], "turn on the light");
    assert_eq!(v["session_id"], "sess-1");

    client.shutdown().await;
}

// After a successful hello, a dropped connection is retried 1 s later and
// the session comes back up.
#[tokio::test]
async fn reconnects_after_connection_loss() {
    let connections = Arc::new(AtomicUsize::new(0));

    let conns = connections.clone();
    let handler = move |ws: WebSocketUpgrade| {
        let conns = conns.clone();
        async move {
            ws.on_upgrade(move |mut socket| async move {
                let n = conns.fetch_add(1, Ordering::SeqCst);
                let _hello = socket.recv().await;
                let _ = socket.send(WsMessage::Text(server_hello().into())).await;
                if n == 0 {
                    // First connection dies right after the handshake.
                    return;
                }
                while let Some(Ok(_)) = socket.recv().await {}
            })
        }
    };

    let app = Router::new().route("/v1/", any(handler));
    let addr = serve(app).await;
    let (state, mut rx, client) = connect(&addr);

    assert!(matches!(next_event(&mut rx).await, WsEvent::Ready { .. }));

    let lost_at = Instant::now();
    match tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no second ready")
        .expect("stream closed")
    {
        WsEvent::Ready { .. } => {}
        other => panic!("unexpected {:?}", other),
    }
    // First rung of the ladder.
    let waited = lost_at.elapsed();
    assert!(waited >= Duration::from_millis(900), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(5), "waited {:?}", waited);
    assert_eq!(state.current(), DeviceState::WsReady);
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    client.shutdown().await;
}

// A connect failure before any hello surfaces a network error with no
// reconnect ladder.
#[tokio::test]
async fn first_connect_failure_is_terminal() {
    // Nothing listens here.
    let state = Arc::new(StateMachine::new());
    state.set(DeviceState::Activated);
    let (tx, mut rx) = mpsc::channel(16);
    let config = WsConfig::new(
        "ws://127.0.0.1:9/v1/",
        None,
        "02:00:00:aa:bb:cc",
        "cid",
    );
    let _client = WsClient::connect(config, state.clone(), tx).unwrap();

    match next_event(&mut rx).await {
        WsEvent::Error(e) => assert_eq!(e.kind(), ErrorKind::Network),
        other => panic!("unexpected {:?}", other),
    }
    match next_event(&mut rx).await {
        WsEvent::Closed => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(state.current(), DeviceState::Activated);
}

// Malformed JSON in a text frame is a protocol error.
#[tokio::test]
async fn malformed_text_frame_is_protocol_error() {
    async fn script(mut socket: WebSocket) {
        let _hello = socket.recv().await;
        let _ = socket.send(WsMessage::Text(server_hello().into())).await;
        let _ = socket.send(WsMessage::Text("not json".into())).await;
        while let Some(Ok(_)) = socket.recv().await {}
    }

    let app = Router::new().route(
        "/v1/",
        any(|ws: WebSocketUpgrade| async move { ws.on_upgrade(script) }),
    );
    let addr = serve(app).await;
    let (_state, mut rx, client) = connect(&addr);

    assert!(matches!(next_event(&mut rx).await, WsEvent::Ready { .. }));
    match next_event(&mut rx).await {
        WsEvent::Error(e) => assert_eq!(e.kind(), ErrorKind::Protocol),
        other => panic!("unexpected {:?}", other),
    }

    client.shutdown().await;
}
