//! Server side: the accept loop, per-connection serving, and handlers.

mod conn;
mod context;
mod handler;
mod worker;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

pub use self::conn::{ServerConn, ServerConnInner, MAX_CONTEXT_NUM, RECEIVER_NUM, SENDER_NUM};
pub use self::context::{ServerContext, ServerState};
pub use self::handler::{Handler, HandlerError, HandlerRegistry, ResponseBuf};
pub use self::worker::{WorkerHandle, WorkerPool, DEFAULT_THREAD_POOL_SIZE};
use super::config::ServerConfig;
use super::conn::create_link;
use super::error::{RpcError, ServerError};
use super::meta::ConnParams;
use crate::rdma::cm::{CmEvent, CmEventType, CmId, EventChannel};
use crate::rdma::context::Context;
use crate::rdma::cq::Cq;
use crate::rdma::pd::Pd;
use crate::rdma::qp::Qp;
use crate::utils::sync::{CondvarExt, LockExt};

/// Default listen backlog.
pub const DEFAULT_BACK_LOG: u32 = 8;

/// Handle that stops a running [`Server`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Sender<()>,
}

impl ShutdownHandle {
    /// Make [`Server::run`] return. Connections are torn down on the way out.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

enum Step {
    Event(CmEvent),
    Exit,
    Closed,
}

/// RPC server.
///
/// Register handlers with [`Server::register_handler`], then call
/// [`Server::run`], which serves until [`ShutdownHandle::shutdown`] is
/// called. Handlers may also be registered while the server runs.
pub struct Server {
    host: String,
    port: String,
    config: ServerConfig,
    ctx: Context,
    pd: Pd,
    handlers: Arc<HandlerRegistry>,

    exit_tx: Sender<()>,
    exit_rx: Receiver<()>,

    listening: Mutex<Option<SocketAddr>>,
    listening_cv: Condvar,
}

impl Server {
    /// Create a server that will listen on `host:port`. Port `"0"` picks a
    /// free port; see [`Server::wait_listening`].
    pub fn new(host: &str, port: &str) -> Self {
        Self::with_config(host, port, ServerConfig::default())
    }

    pub fn with_config(host: &str, port: &str, config: ServerConfig) -> Self {
        let ctx = Context::open(None);
        let pd = Pd::new(&ctx);
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
        Self {
            host: host.to_owned(),
            port: port.to_owned(),
            config,
            ctx,
            pd,
            handlers: Arc::new(HandlerRegistry::new()),
            exit_tx,
            exit_rx,
            listening: Mutex::new(None),
            listening_cv: Condvar::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register the handler of procedure `rpc_id`.
    ///
    /// A handler already registered for `rpc_id` is replaced.
    pub fn register_handler<F>(&self, rpc_id: u32, handler: F)
    where
        F: Fn(&[u8], &mut ResponseBuf<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.register(rpc_id, Arc::new(handler));
    }

    pub fn get_handler(&self, rpc_id: u32) -> Result<Handler, RpcError> {
        self.handlers.get(rpc_id)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.exit_tx.clone(),
        }
    }

    /// Wait until [`Server::run`] listens and return the bound address.
    pub fn wait_listening(&self, timeout: Duration) -> Option<SocketAddr> {
        let deadline = quanta::Instant::now() + timeout;
        let mut listening = self.listening.locked();
        loop {
            if let Some(addr) = *listening {
                return Some(addr);
            }
            let remaining = deadline.saturating_duration_since(quanta::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            listening = self.listening_cv.wait_timeout_locked(listening, remaining).0;
        }
    }

    fn set_listening(&self, addr: Option<SocketAddr>) {
        *self.listening.locked() = addr;
        self.listening_cv.notify_all();
    }

    fn resolve(&self) -> Result<SocketAddr, ServerError> {
        let port = self
            .port
            .parse::<u16>()
            .map_err(|_| ServerError::Resolve(format!("invalid port {:?}", self.port)))?;
        (self.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| ServerError::Resolve(format!("{}: {}", self.host, e)))?
            .next()
            .ok_or_else(|| ServerError::Resolve(format!("{} has no address", self.host)))
    }

    /// Listen and serve until shut down.
    pub fn run(&self) -> Result<(), ServerError> {
        let addr = self.resolve()?;
        let ec = EventChannel::new();
        let listener = CmId::new(&ec, &self.ctx);
        listener.bind_addr(addr).map_err(ServerError::Listen)?;
        listener
            .listen(self.config.backlog)
            .map_err(ServerError::Listen)?;
        let local = listener.local_addr();
        log::info!(
            "listening on {} (backlog {})",
            local.unwrap_or(addr),
            self.config.backlog
        );

        // Tearing a connection down waits for its running handlers, so it
        // happens off the event loop.
        let reaper = WorkerPool::new("rdmarpc-reaper", 1)
            .map_err(|e| ServerError::Resource(format!("cannot spawn reaper: {}", e)))?;
        let retire = reaper.handle();

        self.set_listening(local);

        let mut pending = HashMap::new();
        let mut conns = HashMap::new();
        let result = loop {
            let step = crossbeam_channel::select! {
                recv(ec.receiver()) -> event => event.map_or(Step::Closed, Step::Event),
                recv(self.exit_rx) -> _ => Step::Exit,
            };
            match step {
                Step::Event(event) => self.on_event(event, &mut pending, &mut conns, &retire),
                Step::Exit => break Ok(()),
                Step::Closed => break Err(ServerError::Resource("CM event channel closed".to_owned())),
            }
        };

        log::info!("server shutting down, {} connection(s) open", conns.len());
        drop(pending);
        drop(conns);
        drop(reaper);
        self.set_listening(None);
        result
    }

    fn on_event(
        &self,
        mut event: CmEvent,
        pending: &mut HashMap<u64, PendingConn>,
        conns: &mut HashMap<u64, ServerConn>,
        retire: &WorkerHandle,
    ) {
        log::debug!("CM event {:?} for id {}", event.ty(), event.id());
        match event.ty() {
            CmEventType::ConnectRequest => {
                let Some(id) = event.take_conn() else {
                    log::warn!("connect request without an identifier");
                    return;
                };
                if let Some(conn) = self.accept(id, event.private_data()) {
                    pending.insert(conn.id.handle(), conn);
                }
            }
            CmEventType::Established => {
                let Some(conn) = pending.remove(&event.id()) else {
                    log::warn!("established event for unknown id {}", event.id());
                    return;
                };
                let handle = conn.id.handle();
                let peer = conn.id.peer_addr();
                match conn.serve(&self.pd, &self.handlers, &self.config) {
                    Ok(conn) => {
                        log::info!("connection {} from {:?} established", handle, peer);
                        conns.insert(handle, conn);
                    }
                    Err(e) => log::error!("cannot serve connection {}: {}", handle, e),
                }
            }
            CmEventType::Disconnected => {
                if let Some(conn) = conns.remove(&event.id()) {
                    log::info!("connection {} disconnected", event.id());
                    retire.submit(move || drop(conn));
                } else if pending.remove(&event.id()).is_none() {
                    log::debug!("disconnect of unknown id {}", event.id());
                }
            }
            ty => log::debug!("ignored CM event {:?}", ty),
        }
    }

    /// Validate a connect request and accept it.
    fn accept(&self, id: CmId, private_data: &[u8]) -> Option<PendingConn> {
        let params = match ConnParams::from_private_data(private_data) {
            Ok(params) if params.max_context_num == 0 => Err("no contexts".to_owned()),
            Ok(params) if params.buffer_size > self.config.buffer_size => Err(format!(
                "buffer of {} bytes exceeds {}",
                params.buffer_size, self.config.buffer_size
            )),
            Ok(params) => Ok(params),
            Err(e) => Err(format!("malformed private data: {}", e)),
        };
        let params = match params {
            Ok(params) => params,
            Err(reason) => {
                log::warn!("rejecting connection {}: {}", id.handle(), reason);
                if let Err(e) = id.reject(&[]) {
                    log::error!("cannot reject: {}", e);
                }
                return None;
            }
        };

        let (cq, qp) = match create_link(&id, &self.pd) {
            Ok(link) => link,
            Err(e) => {
                log::error!("cannot create link for connection {}: {}", id.handle(), e);
                let _ = id.reject(&[]);
                return None;
            }
        };
        if let Err(e) = id.accept(&[]) {
            log::warn!("cannot accept connection {}: {}", id.handle(), e);
            return None;
        }
        Some(PendingConn {
            id,
            cq,
            qp,
            params,
        })
    }
}

/// Accepted connection waiting for its established event.
struct PendingConn {
    id: CmId,
    cq: Cq,
    qp: Qp,
    params: ConnParams,
}

impl PendingConn {
    fn serve(
        self,
        pd: &Pd,
        handlers: &Arc<HandlerRegistry>,
        config: &ServerConfig,
    ) -> Result<ServerConn, RpcError> {
        ServerConn::new(
            self.id,
            pd,
            self.cq,
            self.qp,
            handlers.clone(),
            config,
            self.params.buffer_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_handler_registration() {
        let server = Server::new("127.0.0.1", "0");
        assert!(matches!(server.get_handler(3), Err(RpcError::UnknownProcedure(3))));

        server.register_handler(3, |req, resp| {
            resp.write_all(req)?;
            Ok(())
        });
        let handler = server.get_handler(3).unwrap();
        let mut raw = [0u8; 8];
        let mut resp = ResponseBuf::new(&mut raw);
        handler(b"abc", &mut resp).unwrap();
        assert_eq!(resp.as_bytes(), b"abc");
    }

    #[test]
    fn test_bad_port() {
        let server = Server::new("127.0.0.1", "not-a-port");
        assert!(matches!(server.run(), Err(ServerError::Resolve(_))));
    }

    #[test]
    fn test_wait_listening_times_out() {
        let server = Server::new("127.0.0.1", "0");
        assert_eq!(server.wait_listening(Duration::from_millis(20)), None);
    }
}
