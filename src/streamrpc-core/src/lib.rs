pub mod client;
pub mod codec;
pub mod config;
pub mod error;
mod message;
pub mod registry;
pub mod server;
mod session;
mod typed;
pub mod transport;

pub use client::{CallOptions, Client, SocketConnection, StreamConnection, StreamHandle, StreamRequest};
pub use config::{ClientConfig, ServerConfig};
pub use error::{CallError, ConfigError, MessageError, ProtocolError};
pub use message::*;
pub use registry::{MethodRegistry, Module, RpcMethod, Scope};
pub use server::socket::{RunningSocketServer, listen_socket};
pub use server::{RunningServer, Server};
pub use session::{CallContext, Completion, DisconnectHook, EventEmitter, UNSPECIFIED_FAILURE};
