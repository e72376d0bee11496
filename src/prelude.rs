//! The rdmarpc prelude.
//!
//! The purpose of this module is to alleviate imports of common RPC
//! functionalities.

pub use crate::rpc::client::{Client, ConnId, MAX_CONTEXT_NUM};
pub use crate::rpc::config::{ClientConfig, RpcConfig, ServerConfig};
pub use crate::rpc::error::{ConfigError, ConnectError, RpcError, ServerError};
pub use crate::rpc::server::{Handler, HandlerError, ResponseBuf, Server, ShutdownHandle};
