use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use streamrpc_core::{
    Client, ClientConfig, MethodRegistry, Module, Server, ServerConfig, listen_socket,
};
use tokio::time;
use tracing::{Level, info};

fn number(params: &[Value], index: usize) -> f64 {
    params.get(index).and_then(Value::as_f64).unwrap_or_default()
}

fn methods() -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    registry.register("add", |params, _, done| {
        done.ok(number(&params, 0) + number(&params, 1));
        Ok(())
    });
    registry.register("multiply", |params, _, done| {
        done.ok(number(&params, 0) * number(&params, 1));
        Ok(())
    });

    let math = Module::new()
        .method("power", |params, _, done| {
            done.ok(number(&params, 0).powf(number(&params, 1)));
            Ok(())
        })
        .method("sqrt", |params, _, done| {
            done.ok(number(&params, 0).sqrt());
            Ok(())
        });
    registry.expose_module("math", math, None);

    registry.register_async("delayed.echo", |params, _| async move {
        let delay = number(&params, 1) as u64;
        time::sleep(Duration::from_millis(delay)).await;
        Ok(params.first().cloned().unwrap_or(Value::Null))
    });
    registry.register_typed("delayed.add", |_, (a, b, delay): (f64, f64, u64)| async move {
        time::sleep(Duration::from_millis(delay)).await;
        Ok::<_, Value>(a + b)
    });

    registry.register("listen", |_, ctx, done| {
        ctx.start_stream_with(|| info!("listener went away"));
        done.ok("listening");

        let emitter = ctx.emitter();
        tokio::spawn(async move {
            let mut ticks = time::interval(Duration::from_millis(200));
            let mut n = 0;
            while emitter.is_open() {
                ticks.tick().await;
                emitter.emit("event", json!([format!("tick {n}")]));
                n += 1;
            }
        });
        Ok(())
    });
    registry
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let server = Server::new(methods());
    let registry = server.registry().clone();
    let server = server.listen(&ServerConfig::new("127.0.0.1", 8088)).await?;
    let sockets = listen_socket("127.0.0.1:8089", registry).await?;

    let client = Client::new(ClientConfig::new("127.0.0.1", server.local_addr().port()))?;
    println!("  1 + 2 = {}", client.call("add", vec![json!(1), json!(2)]).await?);
    println!("199 * 2 = {}", client.call("multiply", vec![json!(199), json!(2)]).await?);
    println!("  3 ^ 3 = {}", client.call("math.power", vec![json!(3), json!(3)]).await?);

    let (sum, echo) = tokio::join!(
        client.call("delayed.add", vec![json!(1), json!(1), json!(1500)]),
        client.call("delayed.echo", vec![json!("Echo."), json!(1500)])
    );
    println!("{} {}", sum?, echo?);

    let request = client.stream("listen", vec![]);
    let handle = request.handle();
    let counter = Arc::new(AtomicUsize::new(0));
    let mut connection = request
        .expose("event", move |params| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            println!("Streaming #{}: {}", n, params[0]);
            if n >= 4 {
                handle.end();
            }
        })
        .open()
        .await?;
    println!("start listening: {}", connection.response().await?);
    connection.closed().await;

    let socket = Client::new(ClientConfig::new("127.0.0.1", sockets.local_addr().port()))?
        .connect_socket()
        .await?;
    let socket_counter = Arc::new(AtomicUsize::new(0));
    let socket_handle = socket.handle();
    socket.expose("event", move |params| {
        let n = socket_counter.fetch_add(1, Ordering::SeqCst);
        println!("Streaming (socket) #{}: {}", n, params[0]);
        if n >= 4 {
            socket_handle.end();
        }
    });
    socket.call("listen", vec![]).await?;
    socket.closed().await;

    sockets.shutdown();
    server.shutdown();
    Ok(())
}

