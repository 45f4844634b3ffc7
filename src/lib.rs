//! # Event-driven RPC transport.
//!
//! Supported platforms: Linux and other unix-likes with a `polling` backend.
//!
//! rpcio is a reactor-based RPC server transport. A [`Server`] runs a
//! dedicated accept loop plus a fixed [`EventLoopGroup`] of worker loops;
//! each accepted connection is pinned to one worker for life, so per-channel
//! state needs no mutex. Messages are length-prefixed frames ([`packet`])
//! carrying an [`RpcMessage`] envelope encoded as JSON or bincode; requests
//! are dispatched synchronously into a [`ServiceRegistry`].
//!
//! Threads other than a channel's loop thread interact with it through
//! [`ChannelHandle`] (weak, marshaling) and with a loop through
//! [`TaskSender`] closures and timers.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rpcio::{ErrorCode, Server, ServerOptions, Service};
//!
//! struct Greeter;
//!
//! impl Service for Greeter {
//!     fn name(&self) -> &str {
//!         "greeter"
//!     }
//!     fn call(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, ErrorCode> {
//!         match method {
//!             "hello" => Ok([&b"hello "[..], request].concat()),
//!             _ => Err(ErrorCode::NoMethod),
//!         }
//!     }
//! }
//!
//! fn main() -> rpcio::Result<()> {
//!     let mut server = Server::new(ServerOptions {
//!         address: "127.0.0.1:9300".to_owned(),
//!         ..Default::default()
//!     })?;
//!     server.add_service(Box::new(Greeter));
//!     let handle = server.handle(); // call handle.stop() from another thread
//!     # let _ = handle;
//!     server.start() // blocks until stopped
//! }
//! ```

pub mod buffer;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod event_loop_group;
pub mod flat_storage;
pub mod packet;
pub mod rpc;
pub mod server;

pub use buffer::{Buffer, RecvResult};
pub use channel::{Channel, ChannelHandle, ChannelHandler, ChannelId, ChannelStatus};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, ListenerHandler, LoopCore, LoopStatus, TaskSender, TimerId};
pub use event_loop_group::{EventLoopGroup, LoopPicker};
pub use packet::{Packet, ParseOutcome, PayloadType, DEFAULT_MAX_BODY, HEADER_SIZE, VERSION};
pub use rpc::{ErrorCode, MessageType, RpcChannel, RpcMessage, Service, ServiceRegistry};
pub use server::{Server, ServerHandle, ServerOptions};
