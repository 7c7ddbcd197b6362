use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamrpc_core::{
    CallError, CallOptions, Client, ClientConfig, MethodRegistry, RunningServer, Server,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time;

fn registry(hook: Option<oneshot::Sender<()>>) -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    registry.register("add", |params, _, done| {
        let a = params[0].as_i64().unwrap_or_default();
        let b = params[1].as_i64().unwrap_or_default();
        done.ok(a + b);
        Ok(())
    });
    registry.register("boom", |_, _, _| anyhow::bail!("handler gave up"));
    registry.register_async("delayed.fail", |_, _| async {
        time::sleep(Duration::from_millis(100)).await;
        Err(json!("This is an error"))
    });

    let hook = Mutex::new(hook);
    registry.register("listen", move |_, ctx, done| {
        let hook = hook.lock().unwrap().take();
        ctx.start_stream_with(move || {
            if let Some(hook) = hook {
                let _ = hook.send(());
            }
        });
        done.ok("listening");

        let emitter = ctx.emitter();
        tokio::spawn(async move {
            let mut n = 0;
            while emitter.is_open() {
                emitter.emit("event", json!([n]));
                n += 1;
                time::sleep(Duration::from_millis(20)).await;
            }
        });
        Ok(())
    });
    registry
}

async fn start(hook: Option<oneshot::Sender<()>>) -> (RunningServer, Client) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Server::new(registry(hook)).listen_on(listener).unwrap();
    let client = Client::new(ClientConfig::new("127.0.0.1", server.local_addr().port())).unwrap();
    (server, client)
}

fn url(server: &RunningServer) -> String {
    format!("http://{}/", server.local_addr())
}

#[tokio::test]
async fn simple_call_returns_a_complete_response() {
    let (server, client) = start(None).await;

    let res = reqwest::Client::new()
        .post(url(&server))
        .body(r#"{"id":1,"method":"add","params":[1,2]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-type"], "application/json");
    let body = res.bytes().await.unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value, json!({"id": 1, "result": 3, "error": null}));

    assert_eq!(client.call("add", vec![json!(1), json!(2)]).await.unwrap(), json!(3));
}

#[tokio::test]
async fn malformed_requests_never_reach_the_handler() {
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = invoked.clone();
    let mut registry = MethodRegistry::new();
    registry.register("echo", move |params, _, done| {
        flag.store(true, Ordering::SeqCst);
        done.ok(params[0].clone());
        Ok(())
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Server::new(registry).listen_on(listener).unwrap();

    let http = reqwest::Client::new();
    for body in [
        r#"{"id":1,"method":"echo"}"#,
        r#"{"method":"echo","params":["x"]}"#,
        r#"{"id":0,"method":"echo","params":["x"]}"#,
        r#"{"id":"","method":"echo","params":["x"]}"#,
        r#"{"id":1,"method":"","params":["x"]}"#,
        r#"{"id":1,"method":"echo","params":"x"}"#,
        r#"{"id":1,"method":"echo","params":["x"]"#,
    ] {
        let res = http.post(url(&server)).body(body).send().await.unwrap();
        assert_eq!(res.status(), 400, "{body}");
        assert_eq!(res.text().await.unwrap(), "Invalid Request\n", "{body}");
    }
    assert!(!invoked.load(Ordering::SeqCst));

    let res = http
        .post(url(&server))
        .body(r#"{"id":1,"method":"echo","params":["x"]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert!(invoked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unknown_method_is_a_bad_request() {
    let (_server, client) = start(None).await;

    let err = client.call("nope", vec![]).await.unwrap_err();
    assert_eq!(err.status(), Some(400));
    match err {
        CallError::Status { body, .. } => assert_eq!(body, "Unknown RPC call 'nope'"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn only_post_is_allowed() {
    let (server, _) = start(None).await;

    let res = reqwest::Client::new().get(url(&server)).send().await.unwrap();
    assert_eq!(res.status(), 405);
    assert_eq!(res.headers()["allow"], "POST");
    assert_eq!(res.text().await.unwrap(), "Method Not Allowed\n");
}

#[tokio::test]
async fn deferred_error_reaches_the_caller() {
    let (_server, client) = start(None).await;

    let err = client.call("delayed.fail", vec![]).await.unwrap_err();
    assert_eq!(err.remote(), Some(&json!("This is an error")));
}

#[tokio::test]
async fn failing_handler_is_answered_with_its_error() {
    let (_server, client) = start(None).await;

    let err = client.call("boom", vec![]).await.unwrap_err();
    assert_eq!(err.remote(), Some(&json!("handler gave up")));
}

#[tokio::test]
async fn any_path_is_served() {
    let (_server, client) = start(None).await;

    let options = CallOptions::path("/some/where");
    let sum = client
        .call_with("add", vec![json!(2), json!(2)], &options)
        .await
        .unwrap();
    assert_eq!(sum, json!(4));
}

#[tokio::test]
async fn stream_delivers_events_in_order_until_ended() {
    let (_server, client) = start(None).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let request = client.stream("listen", vec![]);
    let handle = request.handle();
    let keep = seen.clone();
    let mut conn = request
        .expose("event", move |params| {
            let mut seen = keep.lock().unwrap();
            seen.push(params[0].as_i64().unwrap());
            if seen.len() == 5 {
                handle.end();
            }
        })
        .open()
        .await
        .unwrap();

    assert_eq!(conn.response().await.unwrap(), json!("listening"));
    time::timeout(Duration::from_secs(5), conn.closed())
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen[..5], [0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn ending_the_stream_runs_the_disconnect_hook() {
    let (hook_tx, hook_rx) = oneshot::channel();
    let (_server, client) = start(Some(hook_tx)).await;

    let mut conn = client.stream("listen", vec![]).open().await.unwrap();
    assert_eq!(conn.response().await.unwrap(), json!("listening"));
    conn.end();
    drop(conn);

    time::timeout(Duration::from_secs(5), hook_rx)
        .await
        .expect("disconnect hook did not run")
        .unwrap();
}

#[tokio::test]
async fn credentials_are_sent_as_basic_auth() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let body = r#"{"id":1,"result":"ok","error":null}"#;
        let reply = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(reply.as_bytes()).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_lowercase()
    });

    let client =
        Client::new(ClientConfig::new("127.0.0.1", port).with_credentials("user", "pass")).unwrap();
    assert_eq!(client.call("whoami", vec![]).await.unwrap(), json!("ok"));

    let request = seen.await.unwrap();
    // base64("user:pass"), lowercased with the rest of the request
    assert!(request.contains("authorization: basic dxnlcjpwyxnz"), "{request}");
}
