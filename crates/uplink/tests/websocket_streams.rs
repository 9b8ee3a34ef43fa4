use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use uplink::websocket::{
    ConnectionManager, ConnectionState, ConnectionStatus, ReconnectConfig, ReconnectingSocket,
    SocketState, StreamMessage, Subscription, WsConfig,
};

#[derive(Debug, Clone)]
enum ServerCommand {
    Push(Value),
    PushRaw(String),
    Close(u16),
}

struct TestServer {
    url: String,
    accepted: Arc<AtomicUsize>,
    commands: broadcast::Sender<ServerCommand>,
    received: mpsc::UnboundedReceiver<String>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (commands, _) = broadcast::channel(256);
        let (received_tx, received) = mpsc::unbounded_channel();

        let counter = Arc::clone(&accepted);
        let command_tx = commands.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut commands = command_tx.subscribe();
                let received = received_tx.clone();

                tokio::spawn(async move {
                    let (mut sink, mut stream) = ws.split();
                    loop {
                        tokio::select! {
                            command = commands.recv() => match command {
                                Ok(ServerCommand::Push(value)) => {
                                    let text = Message::Text(value.to_string().into());
                                    let _ = sink.send(text).await;
                                }
                                Ok(ServerCommand::PushRaw(text)) => {
                                    let _ = sink.send(Message::Text(text.into())).await;
                                }
                                Ok(ServerCommand::Close(code)) => {
                                    let frame = CloseFrame {
                                        code: CloseCode::from(code),
                                        reason: "".into(),
                                    };
                                    let _ = sink.send(Message::Close(Some(frame))).await;
                                    return;
                                }
                                Err(_) => return,
                            },
                            frame = stream.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = received.send(text.as_str().to_string());
                                }
                                Some(Ok(_)) => {}
                                _ => return,
                            },
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://{addr}/stream"),
            accepted,
            commands,
            received,
        }
    }

    fn push(&self, value: Value) {
        let _ = self.commands.send(ServerCommand::Push(value));
    }

    fn push_raw(&self, text: &str) {
        let _ = self.commands.send(ServerCommand::PushRaw(text.to_string()));
    }

    fn close(&self, code: u16) {
        let _ = self.commands.send(ServerCommand::Close(code));
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    async fn next_received(&mut self) -> String {
        timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("server received nothing")
            .expect("server channel closed")
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

fn collector() -> (
    Arc<Mutex<Vec<Value>>>,
    impl Fn(&StreamMessage) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |message: &StreamMessage| {
        sink.lock().push(message.value().clone());
    })
}

fn fast_manager() -> ConnectionManager {
    let config = WsConfig::default()
        .connect_timeout(Duration::from_secs(2))
        .reconnect_delay(Duration::from_millis(100));
    ConnectionManager::new(config).unwrap()
}

#[tokio::test]
async fn test_subscribers_share_one_connection() {
    let server = TestServer::start().await;
    let manager = fast_manager();

    let (first_seen, first) = collector();
    let (second_seen, second) = collector();
    let _a = manager.subscribe(&server.url, first, false);
    let _b = manager.subscribe(&server.url, second, false);

    let connection = manager.connect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Connected).await;
    assert_eq!(server.accepted(), 1);
    assert_eq!(connection.subscriber_count(), 2);

    server.push(json!({"type": "tick", "price": 10}));
    wait_until(|| first_seen.lock().len() == 1 && second_seen.lock().len() == 1).await;

    assert_eq!(first_seen.lock()[0], json!({"type": "tick", "price": 10}));
    assert_eq!(manager.connection_count(), 1);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_unsubscribe_keeps_connection_open() {
    let server = TestServer::start().await;
    let manager = fast_manager();

    let (gone_seen, gone) = collector();
    let (kept_seen, kept) = collector();
    let leaving = manager.subscribe(&server.url, gone, false);
    let _staying = manager.subscribe(&server.url, kept, false);

    let connection = manager.connect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Connected).await;

    leaving.unsubscribe();
    leaving.unsubscribe();
    drop(leaving);

    server.push(json!(1));
    wait_until(|| kept_seen.lock().len() == 1).await;

    assert!(gone_seen.lock().is_empty());
    assert_eq!(connection.subscriber_count(), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(manager.connection_count(), 1);
}

#[tokio::test]
async fn test_late_subscriber_replays_history_first() {
    let server = TestServer::start().await;
    let manager = fast_manager();

    let (early_seen, early) = collector();
    let _early = manager.subscribe(&server.url, early, false);
    let connection = manager.connect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Connected).await;

    for i in 0..3 {
        server.push(json!(i));
    }
    wait_until(|| early_seen.lock().len() == 3).await;

    let (late_seen, late) = collector();
    let _late = manager.subscribe(&server.url, late, true);
    wait_until(|| late_seen.lock().len() == 3).await;

    server.push(json!(3));
    wait_until(|| late_seen.lock().len() == 4).await;

    let expected: Vec<Value> = (0..4).map(|i| json!(i)).collect();
    assert_eq!(*late_seen.lock(), expected);
    assert_eq!(connection.history_len(), 4);
}

#[tokio::test]
async fn test_send_reaches_server_only_when_connected() {
    let mut server = TestServer::start().await;
    let manager = fast_manager();

    manager.send(&server.url, &json!({"op": "early"}));

    let connection = manager.connect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Connected).await;

    manager.send(&server.url, &json!({"op": "subscribe", "channel": "ticker"}));
    manager.send(&server.url, "raw text");

    let first: Value = serde_json::from_str(&server.next_received().await).unwrap();
    assert_eq!(first, json!({"op": "subscribe", "channel": "ticker"}));
    assert_eq!(server.next_received().await, "raw text");
}

#[tokio::test]
async fn test_burst_of_sends_is_delivered_in_full() {
    let mut server = TestServer::start().await;
    let manager = fast_manager();

    let connection = manager.connect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Connected).await;

    for i in 0..100 {
        manager.send(&server.url, &json!({"channel": i}));
    }

    for i in 0..100 {
        let frame: Value = serde_json::from_str(&server.next_received().await).unwrap();
        assert_eq!(frame, json!({"channel": i}));
    }
}

#[tokio::test]
async fn test_send_on_disconnected_connection_is_dropped() {
    let mut server = TestServer::start().await;
    let config = WsConfig::default()
        .connect_timeout(Duration::from_secs(2))
        .reconnect_delay(Duration::from_millis(300));
    let manager = ConnectionManager::new(config).unwrap();

    let first = manager.connect(&server.url);
    wait_until(|| first.state() == ConnectionState::Connected).await;

    server.close(1011);
    wait_until(|| first.state() == ConnectionState::Disconnected).await;
    first.send(&json!({"op": "lost"}));
    manager.send(&server.url, &json!({"op": "lost too"}));

    wait_until(|| server.accepted() == 2).await;
    let second = manager.connect(&server.url);
    wait_until(|| second.state() == ConnectionState::Connected).await;
    manager.send(&server.url, &json!({"op": "after"}));

    let frame: Value = serde_json::from_str(&server.next_received().await).unwrap();
    assert_eq!(frame, json!({"op": "after"}));
    assert_eq!(first.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_panicking_subscriber_does_not_stall_stream() {
    let server = TestServer::start().await;
    let manager = fast_manager();

    let _faulty = manager.subscribe(
        &server.url,
        |_: &StreamMessage| panic!("subscriber failure"),
        false,
    );
    let (seen, callback) = collector();
    let _healthy = manager.subscribe(&server.url, callback, false);

    let connection = manager.connect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Connected).await;

    for i in 0..3 {
        server.push(json!(i));
    }
    wait_until(|| seen.lock().len() == 3).await;

    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(!manager.is_reconnecting(&server.url));
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_subscriber_can_unsubscribe_itself() {
    let server = TestServer::start().await;
    let manager = fast_manager();

    let calls = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let once = {
        let calls = Arc::clone(&calls);
        let slot = Arc::clone(&slot);
        manager.subscribe(
            &server.url,
            move |_: &StreamMessage| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(subscription) = slot.lock().take() {
                    subscription.unsubscribe();
                }
            },
            false,
        )
    };
    *slot.lock() = Some(once);
    let (seen, callback) = collector();
    let _steady = manager.subscribe(&server.url, callback, false);

    let connection = manager.connect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Connected).await;

    server.push(json!("first"));
    server.push(json!("second"));
    wait_until(|| seen.lock().len() == 2).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(connection.subscriber_count(), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_unparseable_frame_is_skipped() {
    let server = TestServer::start().await;
    let manager = fast_manager();

    let (seen, callback) = collector();
    let _sub = manager.subscribe(&server.url, callback, false);
    let connection = manager.connect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Connected).await;

    server.push_raw("{not json");
    server.push(json!({"type": "tick", "seq": 1}));
    wait_until(|| seen.lock().len() == 1).await;

    assert_eq!(seen.lock()[0], json!({"type": "tick", "seq": 1}));
    assert_eq!(connection.history_len(), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_history_keeps_the_latest_hundred() {
    let server = TestServer::start().await;
    let manager = fast_manager();

    let (live_seen, live) = collector();
    let _live = manager.subscribe(&server.url, live, false);
    let connection = manager.connect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Connected).await;

    for i in 0..105 {
        server.push(json!(i));
    }
    wait_until(|| live_seen.lock().len() == 105).await;
    assert_eq!(connection.history_len(), 100);

    let (late_seen, late) = collector();
    let _late = manager.subscribe(&server.url, late, true);
    wait_until(|| late_seen.lock().len() == 100).await;

    let expected: Vec<Value> = (5..105).map(|i| json!(i)).collect();
    assert_eq!(*late_seen.lock(), expected);
}

#[tokio::test]
async fn test_disconnect_closes_for_everyone() {
    let server = TestServer::start().await;
    let manager = fast_manager();

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let _status = manager.subscribe_to_status(&server.url, move |status: &ConnectionStatus| {
        sink.lock().push(status.state);
    });
    let connection = manager.connect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Connected).await;

    manager.disconnect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Disconnected).await;
    sleep(Duration::from_millis(250)).await;

    assert_eq!(manager.connection_count(), 0);
    assert!(!manager.is_reconnecting(&server.url));
    assert_eq!(server.accepted(), 1);
    assert!(connection.last_error().is_none());
    assert_eq!(
        *states.lock(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn test_normal_close_from_server_does_not_reconnect() {
    let server = TestServer::start().await;
    let manager = fast_manager();

    let connection = manager.connect(&server.url);
    wait_until(|| connection.state() == ConnectionState::Connected).await;

    server.close(1000);
    wait_until(|| connection.state() == ConnectionState::Disconnected).await;
    sleep(Duration::from_millis(250)).await;

    assert!(connection.last_error().is_none());
    assert_eq!(manager.connection_count(), 0);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_abnormal_close_reconnects_and_keeps_subscribers() {
    let server = TestServer::start().await;
    let manager = fast_manager();

    let (seen, callback) = collector();
    let _sub = manager.subscribe(&server.url, callback, false);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let _status = manager.subscribe_to_status(&server.url, move |status: &ConnectionStatus| {
        if let Some(error) = &status.last_error {
            sink.lock().push(error.code.clone());
        }
    });

    let first = manager.connect(&server.url);
    wait_until(|| first.state() == ConnectionState::Connected).await;

    server.close(1011);
    wait_until(|| first.state() == ConnectionState::Disconnected).await;
    assert_eq!(
        first.last_error().map(|error| error.code),
        Some("WEBSOCKET_DISCONNECTED".to_string())
    );
    assert!(manager.is_reconnecting(&server.url));

    wait_until(|| server.accepted() == 2).await;
    let second = manager.connect(&server.url);
    wait_until(|| second.state() == ConnectionState::Connected).await;
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!manager.is_reconnecting(&server.url));

    server.push(json!({"after": "reconnect"}));
    wait_until(|| seen.lock().len() == 1).await;
    assert_eq!(*errors.lock(), vec!["WEBSOCKET_DISCONNECTED".to_string()]);
}

#[tokio::test]
async fn test_refused_connection_reports_failure() {
    let manager = fast_manager();
    // Nothing listens on the discard port.
    let url = "ws://127.0.0.1:9/stream";

    let connection = manager.connect(url);
    wait_until(|| connection.state() == ConnectionState::Disconnected).await;

    let error = connection.last_error().unwrap();
    assert_eq!(error.code, "WEBSOCKET_CONNECTION_FAILED");
    assert!(manager.is_reconnecting(url));

    manager.reset();
    assert!(!manager.is_reconnecting(url));
}

#[tokio::test]
async fn test_socket_receives_and_sends() {
    let mut server = TestServer::start().await;
    let socket = ReconnectingSocket::new(&server.url, ReconnectConfig::default()).unwrap();
    assert_eq!(socket.state(), SocketState::Idle);

    socket.connect();
    wait_until(|| socket.state() == SocketState::Open).await;

    server.push(json!({"seq": 1}));
    server.push(json!({"seq": 2}));
    wait_until(|| {
        socket
            .last_message()
            .is_some_and(|message| message.value() == &json!({"seq": 2}))
    })
    .await;

    assert!(socket.send(&json!({"ack": 2})));
    let ack: Value = serde_json::from_str(&server.next_received().await).unwrap();
    assert_eq!(ack, json!({"ack": 2}));

    socket.disconnect();
    wait_until(|| socket.state() == SocketState::Closed).await;
    assert!(socket.error().is_none());
    assert!(!socket.send(&json!({"ack": 3})));
}

#[tokio::test]
async fn test_socket_reconnects_after_abnormal_close() {
    let server = TestServer::start().await;
    let config = ReconnectConfig::default()
        .initial_delay(Duration::from_millis(20))
        .max_delay(Duration::from_millis(100))
        .max_attempts(3);
    let socket = ReconnectingSocket::new(&server.url, config).unwrap();

    socket.connect();
    wait_until(|| socket.state() == SocketState::Open).await;

    server.close(1011);
    wait_until(|| server.accepted() == 2).await;
    wait_until(|| socket.state() == SocketState::Open).await;
    assert_eq!(
        socket.error().map(|error| error.code),
        Some("WEBSOCKET_DISCONNECTED".to_string())
    );

    server.close(1000);
    wait_until(|| socket.state() == SocketState::Closed).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepted(), 2);
    assert_eq!(socket.state(), SocketState::Closed);
}
