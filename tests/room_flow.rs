//! End-to-end room flows against an in-process signaling service, with real
//! peer connections negotiating over loopback host candidates.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};

use tidelink::{ChannelMessage, ConnectError, Host, HttpSignaling};

/// Mailbox-per-identity signaling service mirroring the polled wire
/// contract: data waits in queues, empty poll windows end in the 404
/// timeout marker.
#[derive(Default)]
struct Rooms {
    hosts: Mutex<HashMap<String, String>>,
    petitions: Mutex<HashMap<String, VecDeque<Value>>>,
    answers: Mutex<HashMap<String, VecDeque<Value>>>,
    candidates: Mutex<HashMap<String, VecDeque<Value>>>,
}

fn pop(queues: &Mutex<HashMap<String, VecDeque<Value>>>, key: &str) -> Option<Value> {
    queues.lock().unwrap().get_mut(key)?.pop_front()
}

fn push(queues: &Mutex<HashMap<String, VecDeque<Value>>>, key: &str, value: Value) {
    queues
        .lock()
        .unwrap()
        .entry(key.to_string())
        .or_default()
        .push_back(value);
}

fn poll_window_elapsed() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"message": "timeout"})))
}

/// Re-checks a mailbox for the duration of one poll window.
async fn window_poll(
    queues: &Mutex<HashMap<String, VecDeque<Value>>>,
    key: &str,
) -> Option<Value> {
    for _ in 0..20 {
        if let Some(value) = pop(queues, key) {
            return Some(value);
        }
        sleep(Duration::from_millis(10)).await;
    }
    None
}

async fn serve_rooms(rooms: Arc<Rooms>) -> String {
    let router = Router::new()
        .route("/servers", get(|| async { Json(json!([])) }))
        .route(
            "/petition-request",
            post(
                |State(rooms): State<Arc<Rooms>>, Json(body): Json<Value>| async move {
                    let room = body["room"].as_str().unwrap().to_string();
                    let id = body["id"].as_str().unwrap().to_string();
                    rooms.hosts.lock().unwrap().insert(room, id.clone());
                    match window_poll(&rooms.petitions, &id).await {
                        Some(petition) => (StatusCode::OK, Json(petition)),
                        None => poll_window_elapsed(),
                    }
                },
            ),
        )
        .route(
            "/id-request",
            post(
                |State(rooms): State<Arc<Rooms>>, Json(body): Json<Value>| async move {
                    let room = body["room"].as_str().unwrap();
                    match rooms.hosts.lock().unwrap().get(room) {
                        Some(id) => (StatusCode::OK, Json(json!({"id": id}))),
                        None => poll_window_elapsed(),
                    }
                },
            ),
        )
        .route(
            "/petition",
            post(
                |State(rooms): State<Arc<Rooms>>, Json(body): Json<Value>| async move {
                    let petitioner = body["id"].as_str().unwrap().to_string();
                    let target = body["targetId"].as_str().unwrap();
                    push(
                        &rooms.petitions,
                        target,
                        json!({
                            "offer": body["offer"],
                            "user": body["user"],
                            "id": petitioner,
                        }),
                    );
                    // The petition response is the answer itself, so this
                    // request stays open until the host produces one.
                    for _ in 0..1000 {
                        if let Some(submission) = pop(&rooms.answers, &petitioner) {
                            return (StatusCode::OK, Json(submission["answer"].clone()));
                        }
                        sleep(Duration::from_millis(10)).await;
                    }
                    poll_window_elapsed()
                },
            ),
        )
        .route(
            "/answer",
            post(
                |State(rooms): State<Arc<Rooms>>, Json(body): Json<Value>| async move {
                    let target = body["targetId"].as_str().unwrap();
                    push(&rooms.answers, target, body.clone());
                    StatusCode::OK
                },
            ),
        )
        .route(
            "/candidate",
            post(
                |State(rooms): State<Arc<Rooms>>, Json(body): Json<Value>| async move {
                    let target = body["targetId"].as_str().unwrap();
                    // Delivered under the sender's identity so the recipient
                    // can route it to the right session.
                    push(
                        &rooms.candidates,
                        target,
                        json!({
                            "candidate": body["candidate"],
                            "targetId": body["id"],
                        }),
                    );
                    StatusCode::OK
                },
            ),
        )
        .route(
            "/candidate-request",
            post(
                |State(rooms): State<Arc<Rooms>>, Json(body): Json<Value>| async move {
                    let id = body["id"].as_str().unwrap();
                    match window_poll(&rooms.candidates, id).await {
                        Some(delivery) => (StatusCode::OK, Json(delivery)),
                        None => poll_window_elapsed(),
                    }
                },
            ),
        )
        .with_state(rooms);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

#[tokio::test(flavor = "multi_thread")]
async fn host_and_joiner_exchange_messages() {
    init_logging();
    let base = serve_rooms(Arc::new(Rooms::default())).await;

    let host_signaling = Arc::new(HttpSignaling::new(&base).unwrap());
    let host = Host::open(host_signaling, "4242");

    let joiner_signaling = Arc::new(HttpSignaling::new(&base).unwrap());
    let joiner = timeout(
        Duration::from_secs(30),
        tidelink::connect(joiner_signaling, "4242", "alice"),
    )
    .await
    .expect("joiner stalled")
    .expect("joiner failed to connect");

    let (user, hosted) = timeout(Duration::from_secs(30), host.next_channel())
        .await
        .expect("host stalled")
        .expect("host stopped early");
    assert_eq!(user, "alice");

    joiner.send_text("hello").await.unwrap();
    let inbound = timeout(Duration::from_secs(10), hosted.recv())
        .await
        .expect("host recv stalled")
        .expect("channel closed");
    assert_eq!(inbound, ChannelMessage::Text("hello".into()));

    hosted.send_bytes(b"\x01\x02").await.unwrap();
    let inbound = timeout(Duration::from_secs(10), joiner.recv())
        .await
        .expect("joiner recv stalled")
        .expect("channel closed");
    assert_eq!(
        inbound,
        ChannelMessage::Binary(bytes::Bytes::from_static(b"\x01\x02"))
    );

    host.stop().await;
    assert!(host.next_channel().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejoining_under_the_same_name_replaces_the_old_channel() {
    init_logging();
    let base = serve_rooms(Arc::new(Rooms::default())).await;

    let host_signaling = Arc::new(HttpSignaling::new(&base).unwrap());
    let host = Host::open(host_signaling, "7777");

    let first_signaling = Arc::new(HttpSignaling::new(&base).unwrap());
    let _first_joiner = timeout(
        Duration::from_secs(30),
        tidelink::connect(first_signaling, "7777", "alice"),
    )
    .await
    .expect("first joiner stalled")
    .expect("first joiner failed");
    let (_, first_hosted) = timeout(Duration::from_secs(30), host.next_channel())
        .await
        .expect("host stalled")
        .expect("host stopped early");
    assert!(!first_hosted.is_closed());

    let second_signaling = Arc::new(HttpSignaling::new(&base).unwrap());
    let _second_joiner = timeout(
        Duration::from_secs(30),
        tidelink::connect(second_signaling, "7777", "alice"),
    )
    .await
    .expect("second joiner stalled")
    .expect("second joiner failed");
    let (user, second_hosted) = timeout(Duration::from_secs(30), host.next_channel())
        .await
        .expect("host stalled")
        .expect("host stopped early");

    // By the time the replacement is visible the superseded channel has
    // already been closed.
    assert_eq!(user, "alice");
    assert!(first_hosted.is_closed());
    assert!(!second_hosted.is_closed());

    host.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn joining_an_unanswered_room_times_out() {
    init_logging();
    // No host ever polls, so the room code never resolves.
    let base = serve_rooms(Arc::new(Rooms::default())).await;

    let signaling = Arc::new(HttpSignaling::new(&base).unwrap());
    let outcome = tidelink::connect_with_timeout(
        signaling,
        "0000",
        "alice",
        Duration::from_millis(600),
    )
    .await;
    assert!(matches!(outcome, Err(ConnectError::Timeout)));
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_the_host_closes_unconsumed_channels() {
    init_logging();
    let base = serve_rooms(Arc::new(Rooms::default())).await;

    let host_signaling = Arc::new(HttpSignaling::new(&base).unwrap());
    let host = Host::open(host_signaling, "3131");

    let joiner_signaling = Arc::new(HttpSignaling::new(&base).unwrap());
    let joiner = timeout(
        Duration::from_secs(30),
        tidelink::connect(joiner_signaling, "3131", "bob"),
    )
    .await
    .expect("joiner stalled")
    .expect("joiner failed to connect");

    // The finished channel is never consumed; stop must close it.
    sleep(Duration::from_millis(200)).await;
    host.stop().await;
    assert!(host.next_channel().await.is_none());

    timeout(Duration::from_secs(10), joiner.closed())
        .await
        .expect("joiner never observed the close");
}
