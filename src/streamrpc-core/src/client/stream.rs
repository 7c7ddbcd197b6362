//! Client side of a streaming exchange: one open HTTP body carrying the
//! response and any number of events, split apart as bytes arrive.

use super::{CALL_ID, CallOptions, Client, EventRouter, route};
use crate::codec::json::ValueDecoder;
use crate::error::CallError;
use crate::message::{Params, RequestId, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type ResponseSlot = oneshot::Sender<Result<Response, CallError>>;

/// Cloneable switch that ends a stream from anywhere, event handlers
/// included.
#[derive(Clone, Default)]
pub struct StreamHandle {
    token: CancellationToken,
}

impl StreamHandle {
    pub fn end(&self) {
        self.token.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the stream is over, whichever side ended it.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// A streaming call that has not been sent yet. Handlers exposed here are in
/// place before the first byte of the body can arrive.
pub struct StreamRequest {
    client: Client,
    method: String,
    params: Params,
    options: CallOptions,
    router: Arc<EventRouter>,
    handle: StreamHandle,
}

impl StreamRequest {
    pub(crate) fn new(client: Client, method: &str, params: Params) -> Self {
        Self {
            client,
            method: method.to_string(),
            params,
            options: CallOptions::default(),
            router: Arc::new(EventRouter::default()),
            handle: StreamHandle::default(),
        }
    }

    pub fn options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn expose<F>(self, method: &str, f: F) -> Self
    where
        F: Fn(Params) + Send + Sync + 'static,
    {
        self.router.expose(method, f);
        self
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub async fn open(self) -> Result<StreamConnection, CallError> {
        let response = self
            .client
            .send(&self.method, self.params, &self.options)
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let id = RequestId::Number(CALL_ID);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(demux(
            response.bytes_stream(),
            id.clone(),
            self.router.clone(),
            tx,
            self.handle.clone(),
        ));

        Ok(StreamConnection {
            id,
            router: self.router,
            handle: self.handle,
            response: Some(rx),
        })
    }
}

/// An open streaming exchange. Dropping it ends the stream.
pub struct StreamConnection {
    id: RequestId,
    router: Arc<EventRouter>,
    handle: StreamHandle,
    response: Option<oneshot::Receiver<Result<Response, CallError>>>,
}

impl StreamConnection {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn expose<F>(&self, method: &str, f: F)
    where
        F: Fn(Params) + Send + Sync + 'static,
    {
        self.router.expose(method, f);
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub fn end(&self) {
        debug!("ending stream (id {})", self.id);
        self.handle.end();
    }

    pub async fn closed(&self) {
        self.handle.closed().await
    }

    /// The call's own response. Only the first call gets it; a stream that
    /// ends without one yields [`CallError::NoResponse`].
    pub async fn response(&mut self) -> Result<Value, CallError> {
        let Some(rx) = self.response.take() else {
            return Err(CallError::Closed);
        };
        match rx.await {
            Ok(Ok(response)) => response.into_result().map_err(CallError::Remote),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CallError::NoResponse),
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.handle.end();
    }
}

async fn demux<S>(
    body: S,
    id: RequestId,
    router: Arc<EventRouter>,
    response: ResponseSlot,
    handle: StreamHandle,
) where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    let mut body = std::pin::pin!(body);
    let mut slot = Some(response);
    let mut decoder = ValueDecoder::new();

    loop {
        let chunk = tokio::select! {
            _ = handle.closed() => {
                trace!("stream (id {}) ended locally", id);
                break;
            }
            chunk = body.next() => chunk,
        };
        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                debug!("stream (id {}) failed: {e}", id);
                if let Some(slot) = slot.take() {
                    let _ = slot.send(Err(e.into()));
                }
                break;
            }
            None => {
                trace!("stream (id {}) ended by server", id);
                break;
            }
        };

        let fed = decoder.feed(&bytes, |value| {
            route(value, &router, |response| match slot.take() {
                Some(slot) if response.id == id => {
                    let _ = slot.send(Ok(response));
                }
                Some(pending) => {
                    warn!("response for unknown id {} on stream {}", response.id, id);
                    slot = Some(pending);
                }
                None => warn!("duplicate response on stream {}", id),
            })
        });
        if let Err(e) = fed {
            warn!("discarding undecodable stream data: {e}");
        }
    }

    handle.end();
}
