//! The same dispatch table served over a bare, persistent socket. Requests
//! and responses are concatenated JSON values in both directions; every
//! connection behaves as a streaming session.

use crate::codec::json::ValueDecoder;
use crate::error::ProtocolError;
use crate::message::{Event, Request, Response};
use crate::registry::MethodRegistry;
use crate::session::{self, DisconnectHook, DisconnectHooks, Exchange};
use crate::transport::Transport;
use crate::transport::tcp::TcpTransport;
use bytes::Bytes;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

/// Upper bound on flushing queued writes once the peer stops sending.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by every call on one socket.
struct SocketLink {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    hooks: DisconnectHooks,
}

impl SocketLink {
    fn sender(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Bytes>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write<T: serde::Serialize>(&self, value: &T) {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                if let Some(tx) = self.sender().as_ref() {
                    let _ = tx.send(Bytes::from(bytes));
                }
            }
            Err(e) => error!("failed to encode message: {e}"),
        }
    }

    fn is_open(&self) -> bool {
        self.sender().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Stops accepting writes; whatever is already queued still goes out.
    fn shut(&self) {
        self.sender().take();
        self.hooks.fire();
    }
}

struct SocketExchange {
    link: Arc<SocketLink>,
}

impl Exchange for SocketExchange {
    fn respond(&self, response: Response) {
        if self.link.is_open() {
            self.link.write(&response);
        }
    }

    fn start_stream(&self, on_disconnect: Option<DisconnectHook>) {
        if let Some(hook) = on_disconnect {
            self.link.hooks.push(hook);
        }
    }

    fn is_writable(&self) -> bool {
        self.link.is_open()
    }

    fn write_event(&self, event: &Event) {
        self.link.write(event);
    }

    fn close(&self) {
        trace!("close ignored: socket connections are owned by the client");
    }
}

/// Runs one socket connection until the peer goes away.
pub async fn serve_connection<T: Transport>(transport: Arc<T>, registry: Arc<MethodRegistry>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let link = Arc::new(SocketLink {
        tx: Mutex::new(Some(tx)),
        hooks: DisconnectHooks::default(),
    });

    let writer = transport.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = writer.send(&bytes).await {
                debug!("socket write failed: {e}");
                break;
            }
        }
    });

    let mut decoder = ValueDecoder::new();
    loop {
        let chunk = match transport.receive().await {
            Ok(chunk) => chunk,
            Err(e) => {
                trace!("socket read ended: {e}");
                break;
            }
        };
        let fed = decoder.feed(&chunk, |value| handle_value(&registry, &link, value));
        if let Err(e) = fed {
            warn!("discarding undecodable socket data: {e}");
        }
    }

    link.shut();
    drop(link);
    if time::timeout(DRAIN_TIMEOUT, &mut write_task).await.is_err() {
        warn!("socket writer did not drain in time");
        write_task.abort();
    }
    let _ = transport.close().await;
}

fn handle_value(registry: &MethodRegistry, link: &Arc<SocketLink>, value: Value) {
    let request = match Request::try_from(value) {
        Ok(request) => request,
        Err(e) => {
            warn!("--> dropping invalid request: {e}");
            return;
        }
    };
    let id = request.id.clone();
    let exchange = Arc::new(SocketExchange { link: link.clone() });
    if let Err(e @ ProtocolError::UnknownMethod { .. }) = session::dispatch(registry, request, exchange) {
        link.write(&Response::error(id, Value::String(e.to_string())));
    }
}

/// Handle to a socket server running in the background.
pub struct RunningSocketServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RunningSocketServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

pub async fn listen_socket(
    addr: impl ToSocketAddrs,
    registry: Arc<MethodRegistry>,
) -> anyhow::Result<RunningSocketServer> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("*** Socket server listening on {}", local_addr);

    let task = tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("socket accept failed: {e}");
                    break;
                }
            };
            trace!("<-- accepted socket connection from {}", peer);
            let _ = stream.set_nodelay(true);
            let transport = Arc::new(TcpTransport::new(stream));
            tokio::spawn(serve_connection(transport, registry.clone()));
        }
    });

    Ok(RunningSocketServer { local_addr, task })
}
