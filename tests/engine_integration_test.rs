//! Integration tests for the engine against a fake OSCQuery server.
//!
//! The HTTP side is a wiremock server, OSC traffic uses real UDP sockets on
//! loopback, and the push channel test runs a tokio-tungstenite server.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use oscquery_mirror::osc::{decode_packet, OscArg, OscMessage, OscPacket};
use oscquery_mirror::{Config, Engine, MirrorEvent, Origin, SyncRequest, Value};
use serde_json::json;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);

/// Matches requests without a query string (the structure request).
struct NoQuery;

impl wiremock::Match for NoQuery {
    fn matches(&self, request: &Request) -> bool {
        request.url.query().is_none()
    }
}

async fn mount_remote(server: &MockServer, host_info: serde_json::Value, structure: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("HOST_INFO", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(host_info))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(NoQuery)
        .respond_with(ResponseTemplate::new(200).set_body_json(structure))
        .mount(server)
        .await;
}

fn config_for(server: &MockServer) -> Config {
    Config {
        use_local: true,
        remote_port: server.address().port(),
        ..Config::default()
    }
}

/// Receive events until one matches, failing after [`WAIT`].
async fn wait_for<F>(events: &mut UnboundedReceiver<MirrorEvent>, mut matches: F) -> MirrorEvent
where
    F: FnMut(&MirrorEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn recv_message(socket: &UdpSocket, timeout: Duration) -> Option<OscMessage> {
    let mut buf = [0u8; 1024];
    let (len, _) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .ok()?
        .ok()?;
    match decode_packet(&buf[..len]).ok()? {
        OscPacket::Message(m) => Some(m),
        OscPacket::Bundle { .. } => None,
    }
}

fn synth_structure() -> serde_json::Value {
    json!({
        "CONTENTS": {
            "synth": {
                "DESCRIPTION": "Synth",
                "CONTENTS": {
                    "freq": {"TYPE": "f", "VALUE": 220.0, "RANGE": [{"MIN": 20, "MAX": 20000}]},
                    "on": {"TYPE": "T"}
                }
            },
            "vol": {"TYPE": "f", "VALUE": 0.5, "RANGE": [{"MIN": 0, "MAX": 1}]}
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_builds_tree_and_follows_osc_port_override() {
    let osc_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let osc_port = osc_peer.local_addr().unwrap().port();

    let server = MockServer::start().await;
    mount_remote(
        &server,
        json!({"NAME": "Fake", "OSC_PORT": osc_port, "OSC_TRANSPORT": "UDP"}),
        synth_structure(),
    )
    .await;

    let (engine, mut events) = Engine::new(config_for(&server)).unwrap();
    assert_eq!(engine.sync_now(), SyncRequest::Started);
    wait_for(&mut events, |e| matches!(e, MirrorEvent::StructureChanged { .. })).await;

    let tree = engine.tree();
    assert_eq!(tree.group("synth").unwrap().label, "Synth");
    assert_eq!(tree.parameter("vol").unwrap().value, Value::Float(0.5));
    assert_eq!(engine.host_info().unwrap().name.as_deref(), Some("Fake"));
    assert_eq!(engine.outbound_target(), ("127.0.0.1".to_string(), osc_port));

    assert!(engine.set_value("synth/freq", Value::Float(440.0)));
    let sent = recv_message(&osc_peer, WAIT).await.unwrap();
    assert_eq!(sent, OscMessage::with_args("/synth/freq", vec![OscArg::Float(440.0)]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inbound_datagram_updates_tree_without_echo() {
    let osc_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let osc_port = osc_peer.local_addr().unwrap().port();

    let server = MockServer::start().await;
    mount_remote(&server, json!({"OSC_PORT": osc_port}), synth_structure()).await;

    let (engine, mut events) = Engine::new(config_for(&server)).unwrap();
    engine.sync_now();
    wait_for(&mut events, |e| matches!(e, MirrorEvent::StructureChanged { .. })).await;

    let engine_port = engine.local_addr().unwrap().port();
    let update = OscMessage::with_args("/vol", vec![OscArg::Float(0.25)]);
    osc_peer
        .send_to(&update.encode(), ("127.0.0.1", engine_port))
        .await
        .unwrap();

    let event = wait_for(&mut events, |e| matches!(e, MirrorEvent::ValueChanged { .. })).await;
    match event {
        MirrorEvent::ValueChanged { path, value, origin } => {
            assert_eq!(path, "vol");
            assert_eq!(value, Value::Float(0.25));
            assert_eq!(origin, Origin::Remote);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(
        recv_message(&osc_peer, Duration::from_millis(300)).await.is_none(),
        "inbound update was echoed back"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_structure_keeps_prior_tree() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("HOST_INFO", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"NAME": "Half"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(NoQuery)
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (engine, mut events) = Engine::new(config_for(&server)).unwrap();
    engine.sync_now();
    wait_for(&mut events, |e| matches!(e, MirrorEvent::HostInfo(_))).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(engine.tree().is_empty());
    assert_eq!(engine.host_info().unwrap().name.as_deref(), Some("Half"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_requests_during_cycle_coalesce_into_one_follow_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("HOST_INFO", ""))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(NoQuery)
        .respond_with(ResponseTemplate::new(200).set_body_json(synth_structure()))
        .expect(2)
        .mount(&server)
        .await;

    let (engine, mut events) = Engine::new(config_for(&server)).unwrap();
    assert_eq!(engine.sync_now(), SyncRequest::Started);
    for _ in 0..3 {
        assert_eq!(engine.sync_now(), SyncRequest::Coalesced);
    }

    for _ in 0..2 {
        wait_for(&mut events, |e| matches!(e, MirrorEvent::StructureChanged { .. })).await;
    }
    tokio::time::sleep(Duration::from_millis(600)).await;

    let structure_requests = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.query().is_none())
        .count();
    assert_eq!(structure_requests, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_push_channel_listen_and_binary_updates() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_port = listener.local_addr().unwrap().port();
    let (frames_tx, mut frames_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let push = OscMessage::with_args("/synth/freq", vec![OscArg::Float(880.0)]).encode();
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                let text = text.to_string();
                let is_listen = text.contains("LISTEN");
                let _ = frames_tx.send(text);
                if is_listen {
                    ws.send(Message::Binary(push.clone())).await.unwrap();
                }
            }
        }
    });

    let server = MockServer::start().await;
    mount_remote(
        &server,
        json!({"WS_PORT": ws_port, "EXTENSIONS": {"LISTEN": true}}),
        synth_structure(),
    )
    .await;

    let (engine, mut events) = Engine::new(config_for(&server)).unwrap();
    engine.sync_now();
    wait_for(&mut events, |e| matches!(e, MirrorEvent::StructureChanged { .. })).await;

    assert!(engine.set_listen("synth", true));

    let mut frames = Vec::new();
    while frames.len() < 2 {
        let frame = tokio::time::timeout(WAIT, frames_rx.recv())
            .await
            .expect("timed out waiting for LISTEN")
            .unwrap();
        if !frames.contains(&frame) {
            frames.push(frame);
        }
    }
    frames.sort();
    assert_eq!(
        frames,
        vec![
            r#"{"COMMAND":"LISTEN","DATA":"/synth/freq"}"#.to_string(),
            r#"{"COMMAND":"LISTEN","DATA":"/synth/on"}"#.to_string(),
        ]
    );

    wait_for(&mut events, |e| {
        matches!(e, MirrorEvent::ValueChanged { path, origin: Origin::Remote, .. } if path == "synth/freq")
    })
    .await;
    assert_eq!(engine.value("synth/freq"), Some(Value::Float(880.0)));
    assert!(engine.is_push_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_push_reconnect_replays_enabled_groups() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_port = listener.local_addr().unwrap().port();
    let (frames_tx, mut frames_rx) = tokio::sync::mpsc::unbounded_channel::<(usize, String)>();

    tokio::spawn(async move {
        for conn in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut distinct = HashSet::new();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let text = text.to_string();
                    distinct.insert(text.clone());
                    let _ = frames_tx.send((conn, text));
                    // Drop the first connection once both groups are subscribed
                    if conn == 0 && distinct.len() == 2 {
                        break;
                    }
                }
            }
        }
    });

    let server = MockServer::start().await;
    mount_remote(
        &server,
        json!({"WS_PORT": ws_port, "EXTENSIONS": {"LISTEN": true}}),
        json!({
            "a": {"CONTENTS": {"x": {"TYPE": "f"}}},
            "b": {"CONTENTS": {"y": {"TYPE": "i"}}},
            "c": {"CONTENTS": {"z": {"TYPE": "s"}}}
        }),
    )
    .await;

    let (engine, mut events) = Engine::new(config_for(&server)).unwrap();
    engine.sync_now();
    wait_for(&mut events, |e| matches!(e, MirrorEvent::StructureChanged { .. })).await;
    assert!(engine.set_listen("a", true));
    assert!(engine.set_listen("b", true));

    let expected: HashSet<String> = [
        r#"{"COMMAND":"LISTEN","DATA":"/a/x"}"#.to_string(),
        r#"{"COMMAND":"LISTEN","DATA":"/b/y"}"#.to_string(),
    ]
    .into_iter()
    .collect();

    let mut second = HashSet::new();
    while second != expected {
        let (conn, frame) = tokio::time::timeout(Duration::from_secs(10), frames_rx.recv())
            .await
            .expect("timed out waiting for replay after reconnect")
            .unwrap();
        if conn == 1 {
            assert!(expected.contains(&frame), "unexpected frame after reconnect: {frame}");
            second.insert(frame);
        }
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok((_, frame)) = frames_rx.try_recv() {
        assert!(!frame.contains("/c/"), "disabled group was subscribed: {frame}");
    }
}

#[tokio::test]
async fn test_discovery_client_against_fake_server() {
    use oscquery_mirror::discovery::DiscoveryClient;

    let server = MockServer::start().await;
    mount_remote(
        &server,
        json!({"OSC_PORT": 9001, "EXTENSIONS": {"LISTEN": true}}),
        json!({"CONTENTS": {}}),
    )
    .await;

    let base = server.uri();
    let (info, structure) = tokio::task::spawn_blocking(move || {
        let client = DiscoveryClient::with_base_url(base).unwrap();
        (client.host_info().unwrap(), client.structure().unwrap())
    })
    .await
    .unwrap();

    assert_eq!(info.osc_port, Some(9001));
    assert!(info.listen);
    assert_eq!(structure, json!({"CONTENTS": {}}));
}

#[tokio::test]
async fn test_discovery_rejects_non_object_body() {
    use oscquery_mirror::discovery::DiscoveryClient;

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2, 3])))
        .mount(&server)
        .await;

    let base = server.uri();
    let result = tokio::task::spawn_blocking(move || {
        DiscoveryClient::with_base_url(base).unwrap().structure()
    })
    .await
    .unwrap();
    assert!(result.is_err());
}
