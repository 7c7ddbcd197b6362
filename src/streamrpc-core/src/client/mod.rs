pub mod socket;
pub mod stream;

use crate::codec::Codec;
use crate::codec::json::JsonCodec;
use crate::config::ClientConfig;
use crate::error::{CallError, ConfigError, MessageError};
use crate::message::{Event, Incoming, Params, Request, RequestId, Response};
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use url::Url;

pub use socket::SocketConnection;
pub use stream::{StreamConnection, StreamHandle, StreamRequest};

/// Id of every HTTP call. One call per exchange, so nothing to correlate
/// beyond checking the echo.
pub const CALL_ID: i64 = 1;

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Request path, relative to the configured endpoint.
    pub path: Option<String>,
}

impl CallOptions {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

pub type EventHandler = Arc<dyn Fn(Params) + Send + Sync>;

/// Event name to handler table of one client connection.
#[derive(Default)]
pub(crate) struct EventRouter {
    handlers: DashMap<String, EventHandler>,
}

impl EventRouter {
    pub(crate) fn expose<F>(&self, method: &str, f: F)
    where
        F: Fn(Params) + Send + Sync + 'static,
    {
        self.handlers.insert(method.to_string(), Arc::new(f));
    }

    pub(crate) fn dispatch(&self, event: Event) {
        // cloned out so a handler may expose further handlers
        let handler = self.handlers.get(&event.method).map(|h| h.value().clone());
        match handler {
            Some(handler) => handler(event.params),
            None => trace!("Unhandled event: {:?}", event),
        }
    }
}

/// Classifies one decoded value: events go to `router`, responses to
/// `on_response`.
pub(crate) fn route<F>(value: Value, router: &EventRouter, on_response: F)
where
    F: FnOnce(Response),
{
    match Incoming::classify(value) {
        Ok(Incoming::Event(event)) => router.dispatch(event),
        Ok(Incoming::Response(response)) => on_response(response),
        Err(e) => warn!("dropping undecodable message: {e}"),
    }
}

/// JSON-RPC client for one server endpoint.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    codec: JsonCodec,
    config: ClientConfig,
    endpoint: Url,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let endpoint = config.endpoint()?;
        Ok(Self {
            http: reqwest::Client::new(),
            codec: JsonCodec::new(),
            config,
            endpoint,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn call(&self, method: &str, params: Params) -> Result<Value, CallError> {
        self.call_with(method, params, &CallOptions::default()).await
    }

    /// Sends one request and waits for the whole response body.
    pub async fn call_with(
        &self,
        method: &str,
        params: Params,
        options: &CallOptions,
    ) -> Result<Value, CallError> {
        let response = self.send(method, params, options).await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(CallError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let value: Value = self.codec.decode(&body).map_err(CallError::Codec)?;
        let response = Response::try_from(value)?;
        if response.id != RequestId::Number(CALL_ID) {
            return Err(MessageError::InvalidField("id").into());
        }
        response.into_result().map_err(CallError::Remote)
    }

    /// Prepares a streaming call. Nothing is sent until
    /// [`StreamRequest::open`].
    pub fn stream(&self, method: &str, params: Params) -> StreamRequest {
        StreamRequest::new(self.clone(), method, params)
    }

    /// Opens the raw socket variant on the configured host and port.
    pub async fn connect_socket(&self) -> Result<SocketConnection, CallError> {
        SocketConnection::connect(self.config.socket_addr()).await
    }

    pub(crate) async fn send(
        &self,
        method: &str,
        params: Params,
        options: &CallOptions,
    ) -> Result<reqwest::Response, CallError> {
        let request = Request::new(CALL_ID, method, params);
        let body = self.codec.encode(&request).map_err(CallError::Codec)?;
        let url = match &options.path {
            Some(path) => self.endpoint.join(path)?,
            None => self.endpoint.clone(),
        };

        let mut builder = self
            .http
            .post(url)
            .header(CONTENT_TYPE, self.codec.content_type())
            .body(body);
        if let Some((user, password)) = self.config.credentials() {
            builder = builder.basic_auth(user, Some(password));
        }

        debug!("--> request (id {}): {}", CALL_ID, method);
        Ok(builder.send().await?)
    }
}
