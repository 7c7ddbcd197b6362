use crate::error::ProtocolError;
use crate::message::{Event, Request, Response};
use crate::registry::MethodRegistry;
use crate::session::{self, DisconnectHook, DisconnectHooks, Exchange, UNSPECIFIED_FAILURE};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response as HttpResponse};
use futures::Stream;
use serde_json::Value;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

pub const METHOD_NOT_ALLOWED: &str = "Method Not Allowed\n";
pub const INVALID_REQUEST: &str = "Invalid Request\n";

const JSON: &str = "application/json";

/// How the exchange answers once the handler has decided.
enum Reply {
    Complete(Bytes),
    Stream,
}

struct HttpState {
    reply: Option<oneshot::Sender<Reply>>,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    streaming: bool,
}

/// One HTTP request/response pair. Until the handler completes or starts a
/// stream nothing has been sent; after `start_stream` every write goes onto
/// the open body in order.
struct HttpExchange {
    state: Mutex<HttpState>,
    hooks: Arc<DisconnectHooks>,
}

impl HttpExchange {
    fn state(&self) -> std::sync::MutexGuard<'_, HttpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Bytes {
    match serde_json::to_vec(value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            error!("failed to encode message: {e}");
            Bytes::new()
        }
    }
}

impl Exchange for HttpExchange {
    fn respond(&self, response: Response) {
        let bytes = encode(&response);
        let mut state = self.state();
        if state.streaming {
            if let Some(tx) = &state.tx {
                let _ = tx.send(bytes);
            }
        } else if let Some(reply) = state.reply.take() {
            let _ = reply.send(Reply::Complete(bytes));
        }
    }

    fn start_stream(&self, on_disconnect: Option<DisconnectHook>) {
        let mut state = self.state();
        let mut finished = false;
        if !state.streaming {
            match state.reply.take() {
                Some(reply) => {
                    state.streaming = true;
                    let _ = reply.send(Reply::Stream);
                }
                None => {
                    warn!("stream requested after the response was already sent");
                    finished = true;
                }
            }
        }
        drop(state);

        if let Some(hook) = on_disconnect {
            self.hooks.push(hook);
        }
        // the exchange is already over, nobody else will fire them
        if finished {
            self.hooks.fire();
        }
    }

    fn is_writable(&self) -> bool {
        let state = self.state();
        state.streaming && state.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn write_event(&self, event: &Event) {
        let state = self.state();
        if !state.streaming {
            debug!("dropping event '{}': exchange is not streaming", event.method);
            return;
        }
        if let Some(tx) = &state.tx {
            let _ = tx.send(encode(event));
        }
    }

    fn close(&self) {
        let mut state = self.state();
        state.tx.take();
        if !state.streaming {
            state.reply.take();
        }
    }
}

/// Streaming response body. Dropped by hyper when the exchange ends, which is
/// when the disconnect hooks run.
struct ExchangeBody {
    rx: mpsc::UnboundedReceiver<Bytes>,
    hooks: Arc<DisconnectHooks>,
}

impl Stream for ExchangeBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

impl Drop for ExchangeBody {
    fn drop(&mut self) {
        trace!("streaming exchange closed");
        self.hooks.fire();
    }
}

pub(crate) async fn handle_exchange(
    State(registry): State<Arc<MethodRegistry>>,
    req: axum::extract::Request,
) -> HttpResponse {
    trace!("<-- accepted request");
    if req.method() != Method::POST {
        return method_not_allowed();
    }

    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            debug!("--> response (invalid request): {e}");
            return invalid_request();
        }
    };

    let request = match Request::parse(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("--> response (invalid request): {e}");
            return invalid_request();
        }
    };
    let id = request.id.clone();

    let (reply_tx, reply_rx) = oneshot::channel();
    let (tx, rx) = mpsc::unbounded_channel();
    let hooks = Arc::new(DisconnectHooks::default());
    let exchange = Arc::new(HttpExchange {
        state: Mutex::new(HttpState {
            reply: Some(reply_tx),
            tx: Some(tx),
            streaming: false,
        }),
        hooks: hooks.clone(),
    });

    if let Err(e) = session::dispatch(&registry, request, exchange) {
        return rejected(&e);
    }

    match reply_rx.await {
        Ok(Reply::Complete(bytes)) => json_response(bytes),
        Ok(Reply::Stream) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, JSON)],
            Body::from_stream(ExchangeBody { rx, hooks }),
        )
            .into_response(),
        Err(_) => {
            warn!("exchange for id {} closed without a response", id);
            json_response(encode(&Response::error(
                id,
                Value::String(UNSPECIFIED_FAILURE.to_string()),
            )))
        }
    }
}

fn json_response(bytes: Bytes) -> HttpResponse {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, JSON.to_string()),
            (header::CONTENT_LENGTH, bytes.len().to_string()),
        ],
        bytes,
    )
        .into_response()
}

fn plain_text(status: StatusCode, message: String) -> HttpResponse {
    (
        status,
        [
            (header::CONTENT_TYPE, "text/plain".to_string()),
            (header::CONTENT_LENGTH, message.len().to_string()),
        ],
        message,
    )
        .into_response()
}

fn method_not_allowed() -> HttpResponse {
    let mut response = plain_text(StatusCode::METHOD_NOT_ALLOWED, METHOD_NOT_ALLOWED.to_string());
    response
        .headers_mut()
        .insert(header::ALLOW, header::HeaderValue::from_static("POST"));
    response
}

fn invalid_request() -> HttpResponse {
    plain_text(StatusCode::BAD_REQUEST, INVALID_REQUEST.to_string())
}

fn rejected(err: &ProtocolError) -> HttpResponse {
    match err {
        ProtocolError::MalformedRequest { .. } => invalid_request(),
        ProtocolError::UnknownMethod { .. } => plain_text(StatusCode::BAD_REQUEST, err.to_string()),
    }
}
