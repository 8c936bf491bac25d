//! End-to-end tests: axum server on an ephemeral port driven by the real
//! client over WebSocket.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, time::Duration};

use {
    serde_json::{Value, json},
    switchyard_client::{CallOptions, Client, Error as ClientError},
    switchyard_protocol::{CallError, ErrorKind},
    switchyard_server::{
        Dispatcher, MethodDescriptor, Request, TokenAuthBackend, TokenUser, ws,
    },
    tokio::{net::TcpListener, sync::mpsc},
};

fn app() -> Dispatcher {
    Dispatcher::builder()
        .add_method(
            "",
            MethodDescriptor::new("add", |req: Request| async move {
                let a: i64 = req.param("a")?;
                let b: i64 = req.param("b")?;
                Ok(json!(a + b))
            })
            .param("a")
            .param("b"),
        )
        .add_method(
            "",
            MethodDescriptor::new("sleep", |req: Request| async move {
                let ms: u64 = req.param("ms")?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            })
            .param("ms"),
        )
        .add_method(
            "",
            MethodDescriptor::new("wipe", |req: Request| async move {
                let yes = req.ctx()?.confirm("wipe everything?", None).await?;
                Ok(json!(if yes { "wiped" } else { "kept" }))
            }),
        )
        .add_topics(["clock"])
        .build()
}

async fn start(dispatcher: Dispatcher) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { ws::serve(listener, dispatcher, "/rpc").await.unwrap() });
    addr
}

fn client_for(addr: SocketAddr) -> Client {
    Client::new(&format!("ws://{addr}/rpc")).unwrap()
}

async fn wait_for_connections(dispatcher: &Dispatcher, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while dispatcher.connection_count().await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection count never settled");
}

#[tokio::test]
async fn add_over_websocket() {
    let addr = start(app()).await;
    let client = client_for(addr);

    assert_eq!(client.call("add", Some(&json!([1, 2]))).await.unwrap(), json!(3));
    assert_eq!(
        client.call("add", Some(&json!({"a": 5, "b": -2}))).await.unwrap(),
        json!(3)
    );

    let err = client.call("ghost", None).await.unwrap_err();
    assert_eq!(err.rpc().unwrap().code(), -32601);

    let err = client.call("add", Some(&json!([1]))).await.unwrap_err();
    let rpc = err.rpc().unwrap();
    assert_eq!(rpc.code(), -32602);
    assert_eq!(rpc.message, "too few arguments");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_calls_complete_out_of_order() {
    let addr = start(app()).await;
    let client = client_for(addr);
    client.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    for ms in [300_u64, 1] {
        let client = client.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let value = client.call("sleep", Some(&json!([ms]))).await.unwrap();
            tx.send(value).unwrap();
        });
    }
    assert_eq!(rx.recv().await.unwrap(), json!(1));
    assert_eq!(rx.recv().await.unwrap(), json!(300));
}

#[tokio::test]
async fn subscription_replays_and_preserves_order() {
    let dispatcher = app();
    dispatcher.notify("clock", json!(0)).await.unwrap();
    let addr = start(dispatcher.clone()).await;
    let client = client_for(addr);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let granted = client
        .subscribe("clock", move |value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(value);
                anyhow::Ok(())
            }
        })
        .await
        .unwrap();
    assert!(granted);
    assert_eq!(rx.recv().await.unwrap(), json!(0));

    for tick in 1..=5 {
        dispatcher.notify("clock", json!(tick)).await.unwrap();
    }
    for tick in 1..=5 {
        assert_eq!(rx.recv().await.unwrap(), json!(tick));
    }

    assert_eq!(client.get_subscriptions().await.unwrap(), ["clock"]);
    client.unsubscribe("clock").await.unwrap();
    assert!(client.get_subscriptions().await.unwrap().is_empty());

    assert_eq!(dispatcher.notify("clock", json!(99)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unknown_topic_is_not_granted() {
    let addr = start(app()).await;
    let client = client_for(addr);
    assert!(!client.subscribe("weather", |_| async { anyhow::Ok(()) }).await.unwrap());
    assert_eq!(client.get_topics().await.unwrap(), ["clock"]);
}

#[tokio::test]
async fn server_asks_client_to_confirm() {
    let addr = start(app()).await;
    let client = client_for(addr);
    client.add_method("", "confirm", |question| async move {
        anyhow::Ok(json!(question == json!("wipe everything?")))
    });

    assert_eq!(client.call("wipe", None).await.unwrap(), json!("wiped"));
}

#[tokio::test]
async fn server_call_to_missing_client_method_fails() {
    let dispatcher = app();
    let addr = start(dispatcher.clone()).await;
    let client = client_for(addr);
    client.connect().await.unwrap();
    wait_for_connections(&dispatcher, 1).await;

    let conn = dispatcher.connections().await.pop().unwrap();
    let err = dispatcher
        .call(conn.id(), "ghost", None, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    let CallError::Rpc(rpc) = err else {
        panic!("expected rpc error, got {err:?}");
    };
    assert_eq!(rpc.kind, ErrorKind::MethodNotFound);
}

#[tokio::test]
async fn server_call_times_out() {
    let dispatcher = app();
    let addr = start(dispatcher.clone()).await;
    let client = client_for(addr);
    client.add_method("", "stall", |_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        anyhow::Ok(Value::Null)
    });
    client.connect().await.unwrap();
    wait_for_connections(&dispatcher, 1).await;

    let conn = dispatcher.connections().await.pop().unwrap();
    let err = dispatcher
        .call(conn.id(), "stall", None, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Timeout(_)));
    assert!(conn.pending().is_empty());
}

#[tokio::test]
async fn client_disconnect_fails_server_calls() {
    let dispatcher = app();
    let addr = start(dispatcher.clone()).await;
    let client = client_for(addr);
    client.add_method("", "stall", |_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        anyhow::Ok(Value::Null)
    });
    client.connect().await.unwrap();
    wait_for_connections(&dispatcher, 1).await;

    let conn = dispatcher.connections().await.pop().unwrap();
    let pending = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let conn_id = conn.id().to_owned();
        async move { dispatcher.call(&conn_id, "stall", None, None).await }
    });
    while conn.pending().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    client.disconnect().await;
    assert!(matches!(pending.await.unwrap(), Err(CallError::Closed)));
    wait_for_connections(&dispatcher, 0).await;
}

#[tokio::test]
async fn client_timeout_leaves_connection_usable() {
    let addr = start(app()).await;
    let client = client_for(addr);

    let err = client
        .call_with(
            "sleep",
            Some(&json!([500])),
            CallOptions::default().with_timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.call("add", Some(&json!([2, 2]))).await.unwrap(), json!(4));
}

#[tokio::test]
async fn bearer_token_controls_visibility() {
    let dispatcher = Dispatcher::builder()
        .auth(TokenAuthBackend::new([TokenUser::from_token(
            "ops",
            "hunter2",
            ["ops"],
        )]))
        .add_method(
            "",
            MethodDescriptor::new("deploy", |_req: Request| async { Ok(json!("deployed")) })
                .permission_required("ops"),
        )
        .build();
    let addr = start(dispatcher).await;
    let url = format!("ws://{addr}/rpc");

    let guest = Client::new(&url).unwrap();
    let err = guest.call("deploy", None).await.unwrap_err();
    assert_eq!(err.rpc().unwrap().kind, ErrorKind::MethodNotFound);
    assert!(!guest.get_methods().await.unwrap().contains(&"deploy".to_owned()));

    let ops = Client::builder().url(&url).token("hunter2").build().unwrap();
    assert_eq!(ops.call("deploy", None).await.unwrap(), json!("deployed"));

    // Logging in on an anonymous connection unlocks the same method.
    assert_eq!(
        guest.call("login", Some(&json!(["hunter2"]))).await.unwrap(),
        json!(true)
    );
    assert_eq!(guest.call("deploy", None).await.unwrap(), json!("deployed"));
}

#[tokio::test]
async fn unreachable_server_reports_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client_for(addr).call("add", None).await.unwrap_err();
    assert!(matches!(err, ClientError::Connect(_)));
}

#[tokio::test]
async fn health_reports_connections() {
    let dispatcher = app();
    let addr = start(dispatcher.clone()).await;
    let client = client_for(addr);
    client.connect().await.unwrap();
    wait_for_connections(&dispatcher, 1).await;

    let health: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["protocol"], "2.0");
    assert_eq!(health["connections"], 1);
}
