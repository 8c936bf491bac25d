//! Client behaviour against a scripted WebSocket peer.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use {
    futures::{SinkExt, StreamExt},
    serde_json::{Value, json},
    switchyard_client::{CallOptions, Client, ClientState, Error},
    switchyard_protocol::{CallError, ErrorKind, RpcError},
    tokio::{
        net::{TcpListener, TcpStream},
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_tungstenite::{
        WebSocketStream, accept_async, accept_hdr_async,
        tungstenite::{
            Message,
            handshake::server::{Request, Response},
        },
    },
};

type ServerWs = WebSocketStream<TcpStream>;

/// Listener accepting exactly one WebSocket connection.
async fn fake_server() -> (String, JoinHandle<ServerWs>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("accept");
        accept_async(tcp).await.expect("ws accept")
    });
    (format!("ws://{addr}/rpc"), handle)
}

async fn connected() -> (Client, ServerWs) {
    let (url, server) = fake_server().await;
    let client = Client::new(&url).unwrap();
    client.connect().await.unwrap();
    (client, server.await.unwrap())
}

async fn recv_json(ws: &mut ServerWs) -> Value {
    loop {
        match ws.next().await.expect("frame").expect("read") {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            _ => continue,
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

#[tokio::test]
async fn call_resolves_with_result() {
    let (client, mut server) = connected().await;
    assert_eq!(client.state(), ClientState::Connected);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("add", Some(&json!([1, 2]))).await }
    });

    let request = recv_json(&mut server).await;
    assert_eq!(request["jsonrpc"], "2.0");
    assert_eq!(request["method"], "add");
    assert_eq!(request["params"], json!([1, 2]));
    send_json(&mut server, json!({"jsonrpc": "2.0", "id": request["id"], "result": 3})).await;

    assert_eq!(call.await.unwrap().unwrap(), json!(3));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn replies_are_matched_by_id_not_order() {
    let (client, mut server) = connected().await;

    let first = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .call_with("slow", None, CallOptions::default().with_id("a"))
                .await
        }
    });
    let second = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .call_with("fast", None, CallOptions::default().with_id("b"))
                .await
        }
    });

    recv_json(&mut server).await;
    recv_json(&mut server).await;
    send_json(&mut server, json!({"jsonrpc": "2.0", "id": "b", "result": "fast"})).await;
    send_json(&mut server, json!({"jsonrpc": "2.0", "id": "a", "result": "slow"})).await;

    assert_eq!(first.await.unwrap().unwrap(), json!("slow"));
    assert_eq!(second.await.unwrap().unwrap(), json!("fast"));
}

#[tokio::test]
async fn error_reply_is_rebuilt() {
    let (client, mut server) = connected().await;
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("add", Some(&json!([1]))).await }
    });

    let request = recv_json(&mut server).await;
    send_json(
        &mut server,
        json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32602, "message": "too few arguments", "data": {"missing": "b"}},
        }),
    )
    .await;

    let err = call.await.unwrap().unwrap_err();
    let rpc = err.rpc().expect("structured error");
    assert_eq!(rpc.kind, ErrorKind::InvalidParams);
    assert_eq!(rpc.message, "too few arguments");
    assert_eq!(rpc.data, Some(json!({"missing": "b"})));
}

#[tokio::test]
async fn unknown_error_code_fails_the_call() {
    let (client, mut server) = connected().await;
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("x", None).await }
    });

    let request = recv_json(&mut server).await;
    send_json(
        &mut server,
        json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": -32101, "message": "x"}}),
    )
    .await;

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.rpc().unwrap().kind, ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn invalid_frames_are_not_answered() {
    let (client, mut server) = connected().await;

    send_json(
        &mut server,
        json!({"jsonrpc": "2.0", "error": {"code": -32600, "message": "Invalid request"}}),
    )
    .await;
    server.send(Message::Text("{garbage".to_owned().into())).await.unwrap();
    send_json(&mut server, json!({"jsonrpc": "1.0", "id": 7, "method": "ghost"})).await;

    // Frames are read in order: the first thing back is the reply to this.
    send_json(&mut server, json!({"jsonrpc": "2.0", "id": 8, "method": "ghost"})).await;
    let reply = recv_json(&mut server).await;
    assert_eq!(reply["id"], 8);
    assert_eq!(reply["error"]["code"], -32601);

    assert_eq!(client.state(), ClientState::Connected);
    let quiet = tokio::time::timeout(Duration::from_millis(100), server.next()).await;
    assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
}

#[tokio::test]
async fn timeout_removes_slot_and_late_reply_is_ignored() {
    let (client, mut server) = connected().await;

    let err = client
        .call_with(
            "never",
            None,
            CallOptions::default()
                .with_id(7_i64)
                .with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(client.pending_calls(), 0);

    let stale = recv_json(&mut server).await;
    assert_eq!(stale["id"], 7);
    send_json(&mut server, json!({"jsonrpc": "2.0", "id": 7, "result": "late"})).await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("ping", None).await }
    });
    let request = recv_json(&mut server).await;
    send_json(&mut server, json!({"jsonrpc": "2.0", "id": request["id"], "result": "pong"})).await;
    assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    assert!(client.is_connected());
}

#[tokio::test]
async fn server_close_fails_pending_calls() {
    let (client, mut server) = connected().await;
    let calls: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.call("hang", None).await })
        })
        .collect();

    for _ in 0..3 {
        recv_json(&mut server).await;
    }
    server.close(None).await.unwrap();

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Call(CallError::Closed)), "{err:?}");
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn disconnect_fails_pending_and_client_reconnects() {
    let (client, mut server) = connected().await;
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("hang", None).await }
    });
    recv_json(&mut server).await;

    client.disconnect().await;
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(matches!(
        call.await.unwrap().unwrap_err(),
        Error::Call(CallError::Closed)
    ));

    let (url, next) = fake_server().await;
    client.connect_to(&url).await.unwrap();
    let mut server = next.await.unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("ping", None).await }
    });
    let request = recv_json(&mut server).await;
    send_json(&mut server, json!({"jsonrpc": "2.0", "id": request["id"], "result": true})).await;
    assert_eq!(call.await.unwrap().unwrap(), json!(true));
}

#[tokio::test]
async fn switching_servers_fails_calls_on_the_old_link() {
    let (client, mut old) = connected().await;
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("hang", None).await }
    });
    recv_json(&mut old).await;
    assert_eq!(client.pending_calls(), 1);

    let (url, next) = fake_server().await;
    client.connect_to(&url).await.unwrap();
    let mut server = next.await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("stranded call")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Call(CallError::Closed)), "{err:?}");
    assert_eq!(client.pending_calls(), 0);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("ping", None).await }
    });
    let request = recv_json(&mut server).await;
    send_json(&mut server, json!({"jsonrpc": "2.0", "id": request["id"], "result": "pong"})).await;
    assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
}

#[tokio::test]
async fn server_can_call_client_methods() {
    let (client, mut server) = connected().await;
    client.add_method("", "confirm", |params| async move {
        anyhow::Ok(json!(params == json!("proceed?")))
    });
    client.add_method("", "busy", |_| async {
        Err::<Value, _>(anyhow::Error::new(RpcError::server_defined(-32001, "try later")))
    });
    client.add_method("", "broken", |_| async { Err::<Value, _>(anyhow::anyhow!("secret detail")) });

    send_json(
        &mut server,
        json!({"jsonrpc": "2.0", "id": "s1", "method": "confirm", "params": "proceed?"}),
    )
    .await;
    assert_eq!(
        recv_json(&mut server).await,
        json!({"jsonrpc": "2.0", "id": "s1", "result": true})
    );

    send_json(&mut server, json!({"jsonrpc": "2.0", "id": 2, "method": "ghost"})).await;
    let reply = recv_json(&mut server).await;
    assert_eq!(reply["id"], 2);
    assert_eq!(reply["error"]["code"], -32601);

    send_json(&mut server, json!({"jsonrpc": "2.0", "id": 3, "method": "busy"})).await;
    let reply = recv_json(&mut server).await;
    assert_eq!(reply["error"]["code"], -32001);
    assert_eq!(reply["error"]["message"], "try later");

    send_json(&mut server, json!({"jsonrpc": "2.0", "id": 4, "method": "broken"})).await;
    let reply = recv_json(&mut server).await;
    assert_eq!(reply["error"]["code"], -32603);
    assert!(!reply.to_string().contains("secret"));
}

#[tokio::test]
async fn subscribe_sees_replay_then_updates_in_order() {
    let (client, mut server) = connected().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscribe = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .subscribe("clock", move |value| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(value);
                        anyhow::Ok(())
                    }
                })
                .await
        }
    });

    let request = recv_json(&mut server).await;
    assert_eq!(request["method"], "subscribe");
    assert_eq!(request["params"], json!(["clock"]));
    send_json(&mut server, json!({"jsonrpc": "2.0", "method": "clock", "params": 1})).await;
    send_json(&mut server, json!({"jsonrpc": "2.0", "id": request["id"], "result": ["clock"]})).await;
    assert!(subscribe.await.unwrap().unwrap());

    for tick in 2..5 {
        send_json(&mut server, json!({"jsonrpc": "2.0", "method": "clock", "params": tick})).await;
    }
    for expected in 1..5 {
        assert_eq!(rx.recv().await.unwrap(), json!(expected));
    }

    let unsubscribe = tokio::spawn({
        let client = client.clone();
        async move { client.unsubscribe("clock").await }
    });
    let request = recv_json(&mut server).await;
    assert_eq!(request["method"], "unsubscribe");
    send_json(&mut server, json!({"jsonrpc": "2.0", "id": request["id"], "result": []})).await;
    unsubscribe.await.unwrap().unwrap();

    send_json(&mut server, json!({"jsonrpc": "2.0", "method": "clock", "params": 99})).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn refused_subscription_returns_false() {
    let (client, mut server) = connected().await;
    let subscribe = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe("secret", |_| async { anyhow::Ok(()) }).await }
    });

    let request = recv_json(&mut server).await;
    send_json(&mut server, json!({"jsonrpc": "2.0", "id": request["id"], "result": []})).await;
    assert!(!subscribe.await.unwrap().unwrap());
}

#[tokio::test]
async fn notify_sends_no_id() {
    let (client, mut server) = connected().await;
    client.notify("log", Some(&json!({"line": "hi"}))).await.unwrap();
    let frame = recv_json(&mut server).await;
    assert_eq!(frame, json!({"jsonrpc": "2.0", "method": "log", "params": {"line": "hi"}}));
}

#[tokio::test]
async fn bearer_token_is_sent_on_upgrade() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (header_tx, header_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        accept_hdr_async(tcp, move |request: &Request, response: Response| {
            let header = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let _ = header_tx.send(header);
            Ok(response)
        })
        .await
        .unwrap()
    });

    let client = Client::builder()
        .url(format!("ws://{addr}/rpc"))
        .token("s3cret")
        .build()
        .unwrap();
    client.connect().await.unwrap();
    let _server = server.await.unwrap();

    assert_eq!(header_rx.await.unwrap().as_deref(), Some("Bearer s3cret"));
}
