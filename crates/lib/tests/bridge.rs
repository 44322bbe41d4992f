//! Node bridge wire tests over a real loopback TCP listener: pairing,
//! token reconnect, auth failures, invoke round-trip, and transcript events.

use async_trait::async_trait;
use lib::envelope::{Channel, Envelope};
use lib::nodes::{BridgeFrame, NodeBridge, NodeStore, OperatorPrompt, PairRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

struct AutoApprove;

#[async_trait]
impl OperatorPrompt for AutoApprove {
    async fn prompt_pairing(&self, _request: &PairRequest, _is_repair: bool) -> bool {
        true
    }
}

struct AutoReject;

#[async_trait]
impl OperatorPrompt for AutoReject {
    async fn prompt_pairing(&self, _request: &PairRequest, _is_repair: bool) -> bool {
        false
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

struct Client {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    write: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(port: u16) -> Client {
        let mut last_err = None;
        for _ in 0..50 {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => {
                    let (r, write) = stream.into_split();
                    return Client {
                        lines: BufReader::new(r).lines(),
                        write,
                    };
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        panic!("bridge not reachable: {:?}", last_err);
    }

    async fn send(&mut self, frame: &BridgeFrame) {
        let mut line = serde_json::to_string(frame).unwrap();
        line.push('\n');
        self.write.write_all(line.as_bytes()).await.unwrap();
    }

    /// Next non-ping frame.
    async fn recv(&mut self) -> BridgeFrame {
        loop {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("bridge frame timeout")
                .unwrap()
                .expect("connection closed");
            let frame: BridgeFrame = serde_json::from_str(line.trim()).unwrap();
            if !matches!(frame, BridgeFrame::Ping {}) {
                return frame;
            }
        }
    }
}

async fn start_bridge(
    prompt: Arc<dyn OperatorPrompt>,
    dir: &std::path::Path,
) -> (NodeBridge, Arc<NodeStore>, mpsc::Receiver<Envelope>, u16) {
    let store = Arc::new(NodeStore::load(dir).await);
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let (event_tx, _) = broadcast::channel(16);
    let bridge = NodeBridge::new(store.clone(), prompt, inbound_tx, event_tx);
    let port = free_port();
    let serve = bridge.clone();
    tokio::spawn(async move {
        let _ = serve.serve("127.0.0.1", port).await;
    });
    (bridge, store, inbound_rx, port)
}

fn hello(node_id: &str, token: Option<&str>) -> BridgeFrame {
    BridgeFrame::Hello {
        node_id: node_id.to_string(),
        display_name: Some("Test Phone".into()),
        token: token.map(str::to_string),
        platform: Some("ios".into()),
        version: None,
        device_family: None,
        model_identifier: None,
        caps: vec!["canvas".into()],
        commands: vec!["canvas.show".into()],
    }
}

#[tokio::test]
async fn pair_disconnect_reconnect_with_token() {
    let dir = tempfile::tempdir().unwrap();
    let (_bridge, store, _rx, port) = start_bridge(Arc::new(AutoApprove), dir.path()).await;

    // Fresh node: hello without token yields not_paired, then pair issues one.
    let mut client = Client::connect(port).await;
    client.send(&hello("node-1", None)).await;
    assert_eq!(client.recv().await, BridgeFrame::NotPaired {});
    client
        .send(&BridgeFrame::Pair {
            node_id: "node-1".into(),
            display_name: Some("Test Phone".into()),
            platform: Some("ios".into()),
            version: None,
        })
        .await;
    let token = match client.recv().await {
        BridgeFrame::AuthOk { token: Some(t) } => t,
        other => panic!("expected auth_ok with token, got {:?}", other),
    };
    assert_eq!(token.len(), 32);
    drop(client);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let before = store.get("node-1").await.unwrap().last_seen_at_ms;

    // Reconnect with the stored token.
    let mut client = Client::connect(port).await;
    client.send(&hello("node-1", Some(&token))).await;
    assert_eq!(client.recv().await, BridgeFrame::AuthOk { token: None });
    let after = store.get("node-1").await.unwrap().last_seen_at_ms;
    assert!(after >= before);
}

#[tokio::test]
async fn bad_token_and_blank_node_id_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (_bridge, store, _rx, port) = start_bridge(Arc::new(AutoApprove), dir.path()).await;
    store
        .upsert(lib::nodes::PairedNode {
            node_id: "node-1".into(),
            display_name: None,
            platform: None,
            version: None,
            device_family: None,
            model_identifier: None,
            token: "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into(),
            caps: Vec::new(),
            commands: Vec::new(),
            created_at_ms: 1,
            last_seen_at_ms: 1,
        })
        .await
        .unwrap();

    let mut client = Client::connect(port).await;
    client.send(&hello("node-1", Some("wrong"))).await;
    match client.recv().await {
        BridgeFrame::AuthError { code, .. } => assert_eq!(code, "UNAUTHORIZED"),
        other => panic!("expected auth_error, got {:?}", other),
    }

    let mut client = Client::connect(port).await;
    client.send(&hello("   ", None)).await;
    match client.recv().await {
        BridgeFrame::AuthError { code, .. } => assert_eq!(code, "INVALID_REQUEST"),
        other => panic!("expected auth_error, got {:?}", other),
    }
}

#[tokio::test]
async fn rejected_pairing_gets_error() {
    let dir = tempfile::tempdir().unwrap();
    let (_bridge, _store, _rx, port) = start_bridge(Arc::new(AutoReject), dir.path()).await;
    let mut client = Client::connect(port).await;
    client
        .send(&BridgeFrame::Pair {
            node_id: "node-2".into(),
            display_name: None,
            platform: None,
            version: None,
        })
        .await;
    match client.recv().await {
        BridgeFrame::AuthError { code, .. } => assert_eq!(code, "PAIR_REJECTED"),
        other => panic!("expected auth_error, got {:?}", other),
    }
}

#[tokio::test]
async fn invoke_round_trip_and_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let (bridge, _store, _rx, port) = start_bridge(Arc::new(AutoApprove), dir.path()).await;

    // Disconnected node: UNAVAILABLE.
    let err = bridge
        .invoke("node-9", "canvas.show", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNAVAILABLE");

    // Pair and serve one invoke from the node side.
    let mut client = Client::connect(port).await;
    client
        .send(&BridgeFrame::Pair {
            node_id: "node-3".into(),
            display_name: None,
            platform: None,
            version: None,
        })
        .await;
    let BridgeFrame::AuthOk { .. } = client.recv().await else {
        panic!("pair failed")
    };

    let invoke_task = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            bridge
                .invoke(
                    "node-3",
                    "canvas.show",
                    Some(r#"{"url":"http://example"}"#.into()),
                    Some(Duration::from_secs(5)),
                )
                .await
        })
    };

    let (id, command) = match client.recv().await {
        BridgeFrame::Invoke { id, command, .. } => (id, command),
        other => panic!("expected invoke, got {:?}", other),
    };
    assert_eq!(command, "canvas.show");
    client
        .send(&BridgeFrame::InvokeResult {
            id,
            ok: true,
            result_json: Some(r#"{"shown":true}"#.into()),
            error: None,
        })
        .await;

    match invoke_task.await.unwrap().unwrap() {
        BridgeFrame::InvokeResult {
            ok, result_json, ..
        } => {
            assert!(ok);
            assert_eq!(result_json.as_deref(), Some(r#"{"shown":true}"#));
        }
        other => panic!("expected invoke_result, got {:?}", other),
    }
}

#[tokio::test]
async fn voice_transcript_becomes_node_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let (_bridge, _store, mut rx, port) = start_bridge(Arc::new(AutoApprove), dir.path()).await;

    let mut client = Client::connect(port).await;
    client
        .send(&BridgeFrame::Pair {
            node_id: "node-4".into(),
            display_name: None,
            platform: None,
            version: None,
        })
        .await;
    let BridgeFrame::AuthOk { .. } = client.recv().await else {
        panic!("pair failed")
    };

    client
        .send(&BridgeFrame::Event {
            event: "voice.transcript".into(),
            payload_json: Some(r#"{"text":"turn off the lights","deliver":false}"#.into()),
        })
        .await;

    let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("envelope timeout")
        .expect("pipeline closed");
    assert_eq!(envelope.channel, Channel::Node);
    assert_eq!(envelope.from, "node-node-4");
    assert_eq!(envelope.body, "turn off the lights");
    assert!(!envelope.deliver);
}
