use super::{EventRouter, StreamHandle, route};
use crate::codec::Codec;
use crate::codec::json::{JsonCodec, ValueDecoder};
use crate::error::CallError;
use crate::message::{Params, Request, RequestId, Response};
use crate::transport::Transport;
use crate::transport::tcp::TcpTransport;
use dashmap::DashMap;
use nanoid::nanoid;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::ToSocketAddrs;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, error, trace, warn};

type Pending = Arc<DashMap<RequestId, oneshot::Sender<Response>>>;

/// Persistent connection to a socket server. Any number of calls may be in
/// flight; responses are matched by id and events go to exposed handlers.
pub struct SocketConnection<T = TcpTransport, C = JsonCodec>
where
    T: Transport,
    C: Codec,
{
    transport: Arc<T>,
    codec: C,
    pending: Pending,
    router: Arc<EventRouter>,
    handle: StreamHandle,
}

impl SocketConnection<TcpTransport, JsonCodec> {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, CallError> {
        let transport = TcpTransport::connect(addr).await?;
        Ok(Self::open(transport, JsonCodec::new()))
    }
}

impl<T, C> SocketConnection<T, C>
where
    T: Transport,
    C: Codec,
{
    /// Starts reading from `transport` in the background.
    pub fn open(transport: T, codec: C) -> Self {
        let transport = Arc::new(transport);
        let pending: Pending = Arc::new(DashMap::new());
        let router = Arc::new(EventRouter::default());
        let handle = StreamHandle::default();

        tokio::spawn(read_loop(
            transport.clone(),
            pending.clone(),
            router.clone(),
            handle.clone(),
        ));

        Self {
            transport,
            codec,
            pending,
            router,
            handle,
        }
    }

    pub fn expose<F>(&self, method: &str, f: F)
    where
        F: Fn(Params) + Send + Sync + 'static,
    {
        self.router.expose(method, f);
    }

    pub async fn call(&self, method: &str, params: Params) -> Result<Value, CallError> {
        self.call_timeout(method, params, None).await
    }

    pub async fn call_timeout(
        &self,
        method: &str,
        params: Params,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        if self.handle.is_ended() {
            return Err(CallError::Closed);
        }

        let request = Request::new(nanoid!(), method, params);
        let id = request.id.clone();
        let data = self.codec.encode(&request).map_err(CallError::Codec)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        debug!("--> request (id {}): {}", id, method);
        if let Err(e) = self.transport.send(&data).await {
            self.pending.remove(&id);
            return Err(CallError::Socket(e));
        }

        let result = match timeout {
            Some(dur) => match time::timeout(dur, rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.pending.remove(&id);
                    return Err(CallError::Timeout);
                }
            },
            None => rx.await,
        };

        match result {
            Ok(response) => response.into_result().map_err(CallError::Remote),
            Err(_) => Err(CallError::Closed),
        }
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Closes the connection. Calls still waiting fail with
    /// [`CallError::Closed`].
    pub fn end(&self) {
        self.handle.end();
    }

    pub async fn closed(&self) {
        self.handle.closed().await
    }
}

impl<T, C> Drop for SocketConnection<T, C>
where
    T: Transport,
    C: Codec,
{
    fn drop(&mut self) {
        self.handle.end();
    }
}

async fn read_loop<T: Transport>(
    transport: Arc<T>,
    pending: Pending,
    router: Arc<EventRouter>,
    handle: StreamHandle,
) {
    let mut decoder = ValueDecoder::new();
    loop {
        let chunk = tokio::select! {
            _ = handle.closed() => break,
            chunk = transport.receive() => chunk,
        };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                trace!("socket read ended: {e}");
                break;
            }
        };

        let fed = decoder.feed(&chunk, |value| {
            route(value, &router, |response| match pending.remove(&response.id) {
                Some((_, tx)) => {
                    let _ = tx.send(response);
                }
                None => error!("received response for unknown request: {}", response.id),
            })
        });
        if let Err(e) = fed {
            warn!("discarding undecodable socket data: {e}");
        }
    }

    pending.clear();
    if let Err(e) = transport.close().await {
        debug!("socket close failed: {e}");
    }
    handle.end();
}
