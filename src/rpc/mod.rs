//! RPC transport over the verbs layer.
//!
//! Each connection owns one QP and a fixed set of contexts. A client
//! context sends a [`meta::RequestDescriptor`] naming its registered buffer;
//! the server pulls the request with an RDMA read, runs the handler on a
//! worker thread, writes the response into the same buffer with an RDMA
//! write, and notifies the client with a send.

pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod meta;
pub mod pool;
pub mod server;

pub use self::client::{Client, ConnId};
pub use self::config::{ClientConfig, RpcConfig, ServerConfig};
pub use self::error::{ConfigError, ConnectError, RpcError, ServerError};
pub use self::pool::SlotPool;
pub use self::server::{Handler, HandlerError, ResponseBuf, Server, ShutdownHandle};
