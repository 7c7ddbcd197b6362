use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use streamrpc_core::{Client, ClientConfig, MethodRegistry, listen_socket};
use tokio::time;

#[tokio::test]
async fn socket_client_calls_and_listens() {
    let mut registry = MethodRegistry::new();
    registry.register("multiply", |params, _, done| {
        let a = params[0].as_i64().unwrap_or_default();
        let b = params[1].as_i64().unwrap_or_default();
        done.ok(a * b);
        Ok(())
    });
    registry.register("listen", |_, ctx, done| {
        ctx.start_stream();
        done.ok("listening");
        for n in 0..5 {
            ctx.emit_event("event", json!([n]));
        }
        Ok(())
    });

    let server = listen_socket("127.0.0.1:0", Arc::new(registry)).await.unwrap();
    let client = Client::new(ClientConfig::new("127.0.0.1", server.local_addr().port())).unwrap();
    let conn = client.connect_socket().await.unwrap();

    assert_eq!(
        conn.call("multiply", vec![json!(199), json!(2)]).await.unwrap(),
        json!(398)
    );

    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    let handle = conn.handle();
    conn.expose("event", move |params| {
        let n = seen.fetch_add(1, Ordering::SeqCst);
        assert_eq!(params[0], json!(n));
        if n == 4 {
            handle.end();
        }
    });
    assert_eq!(conn.call("listen", vec![]).await.unwrap(), json!("listening"));

    time::timeout(Duration::from_secs(5), conn.closed())
        .await
        .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 5);

    server.shutdown();
}
