//! Client side: connections and blocking calls.

mod conn;
mod context;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use quanta::Instant;

pub use self::conn::{ClientConn, ClientConnInner};
pub use self::context::{ClientContext, ClientState};
use super::config::ClientConfig;
use super::conn::create_link;
use super::error::{ConnectError, RpcError};
use super::meta::ConnParams;
use crate::rdma::cm::{CmEvent, CmEventType, CmId, EventChannel};
use crate::rdma::context::Context;
use crate::rdma::pd::Pd;
use crate::utils::sync::RwLockExt;

/// Index of a connection within its [`Client`].
pub type ConnId = u32;

/// Number of contexts per client connection, i.e. the bound on outstanding
/// calls over one connection.
pub const MAX_CONTEXT_NUM: usize = 8;

/// Default bound on connection establishment.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(3000);

/// RPC client.
///
/// A client holds any number of connections, each addressed by the
/// [`ConnId`] returned from [`Client::connect`]. All methods take `&self`,
/// so a client can be shared among threads.
pub struct Client {
    ctx: Context,
    pd: Pd,
    config: ClientConfig,
    conns: RwLock<Vec<Option<Arc<ClientConn>>>>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Create a client with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let ctx = Context::open(None);
        let pd = Pd::new(&ctx);
        Self {
            ctx,
            pd,
            config,
            conns: RwLock::new(Vec::new()),
        }
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to a server.
    ///
    /// Address resolution, route resolution and connection establishment
    /// must all complete within the configured connection timeout; any
    /// other CM event in between fails the attempt.
    pub fn connect(&self, host: &str, port: &str) -> Result<ConnId, ConnectError> {
        let start = Instant::now();
        let deadline = start + self.config.connect_timeout();
        let port = port
            .parse::<u16>()
            .map_err(|_| ConnectError::Resolve(format!("invalid port {:?}", port)))?;

        let ec = EventChannel::new();
        let id = CmId::new(&ec, &self.ctx);
        id.resolve_addr(host, port)
            .map_err(|e| ConnectError::Resolve(format!("{}: {}", host, e)))?;
        wait_event(&ec, CmEventType::AddrResolved, start, deadline)?;
        id.resolve_route()?;
        wait_event(&ec, CmEventType::RouteResolved, start, deadline)?;

        let (cq, qp) = create_link(&id, &self.pd)?;
        let inner = ClientConnInner::new(&self.pd, qp, self.config.buffer_size)?;
        let params = ConnParams {
            buffer_size: self.config.buffer_size,
            max_context_num: MAX_CONTEXT_NUM,
        };
        id.connect(&params.to_private_data()?)?;
        wait_event(&ec, CmEventType::Established, start, deadline)?;

        let handle = id.handle();
        let conn = ClientConn::new(id, ec, cq, inner, self.config.call_timeout())?;
        let mut conns = self.conns.write_locked();
        let conn_id = match conns.iter().position(Option::is_none) {
            Some(free) => {
                conns[free] = Some(Arc::new(conn));
                free
            }
            None => {
                conns.push(Some(Arc::new(conn)));
                conns.len() - 1
            }
        } as ConnId;
        log::info!(
            "connected to {}:{} as connection {} (CM id {})",
            host,
            port,
            conn_id,
            handle
        );
        Ok(conn_id)
    }

    fn conn(&self, conn: ConnId) -> Result<Arc<ClientConn>, RpcError> {
        self.conns
            .read_locked()
            .get(conn as usize)
            .and_then(Option::clone)
            .ok_or(RpcError::InvalidConnection)
    }

    /// Invoke procedure `rpc_id` over connection `conn` and wait for the
    /// response.
    ///
    /// Blocks while all [`MAX_CONTEXT_NUM`] contexts of the connection are
    /// in use by other calls.
    pub fn call(&self, conn: ConnId, rpc_id: u32, request: &[u8]) -> Result<Vec<u8>, RpcError> {
        self.conn(conn)?.call(rpc_id, request)
    }

    /// Number of contexts of `conn` free for new calls.
    pub fn available_slots(&self, conn: ConnId) -> Result<usize, RpcError> {
        Ok(self.conn(conn)?.available_slots())
    }

    /// Tear down a connection. Calls in flight on it fail.
    pub fn disconnect(&self, conn: ConnId) -> Result<(), RpcError> {
        let removed = self
            .conns
            .write_locked()
            .get_mut(conn as usize)
            .and_then(Option::take)
            .ok_or(RpcError::InvalidConnection)?;
        removed.disconnect()?;
        log::info!("disconnected connection {}", conn);
        Ok(())
    }
}

/// Wait for the next CM event, which must be of type `expected`.
fn wait_event(
    ec: &EventChannel,
    expected: CmEventType,
    start: Instant,
    deadline: Instant,
) -> Result<CmEvent, ConnectError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let Some(event) = ec.get_event_timeout(remaining) else {
        return Err(ConnectError::Timeout {
            expected,
            waited_ms: (Instant::now() - start).as_millis() as u64,
        });
    };

    log::debug!("CM event {:?} (expecting {:?})", event.ty(), expected);
    match event.ty() {
        ty if ty == expected => Ok(event),
        CmEventType::Rejected | CmEventType::Unreachable => {
            Err(ConnectError::Rejected(event.ty()))
        }
        CmEventType::AddrError | CmEventType::RouteError => {
            Err(ConnectError::Resolve(format!("{:?}", event.ty())))
        }
        got => Err(ConnectError::UnexpectedEvent { expected, got }),
    }
}
