use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::context::{ServerContext, ServerState};
use super::handler::{HandlerRegistry, ResponseBuf};
use super::worker::{WorkerHandle, WorkerPool};
use crate::rdma::cm::CmId;
use crate::rdma::cq::Cq;
use crate::rdma::mr::Mr;
use crate::rdma::pd::Pd;
use crate::rdma::qp::Qp;
use crate::rpc::config::ServerConfig;
use crate::rpc::conn::{Conn, Poller, QUEUE_DEPTH};
use crate::rpc::error::RpcError;
use crate::rpc::meta::{RequestDescriptor, ResponseStatus};
use crate::rpc::pool::SlotPool;

/// Number of contexts per server connection.
pub const MAX_CONTEXT_NUM: usize = QUEUE_DEPTH / 2;

/// Contexts kept armed for incoming requests.
pub const RECEIVER_NUM: usize = MAX_CONTEXT_NUM / 2;

/// Contexts that write responses back.
pub const SENDER_NUM: usize = MAX_CONTEXT_NUM - RECEIVER_NUM;

/// How long a worker waits for a sender before re-checking for shutdown.
const SENDER_WAIT: Duration = Duration::from_millis(50);

/// State shared between a server connection, its poller and its workers.
pub struct ServerConnInner {
    qp: Qp,

    /// Receivers first, then senders.
    contexts: Vec<ServerContext>,
    senders: SlotPool<u32, SENDER_NUM>,

    registry: Arc<HandlerRegistry>,
    workers: WorkerHandle,

    buffer_size: usize,
    peer_buffer_size: usize,
    closing: AtomicBool,
}

impl ServerConnInner {
    pub fn new(
        pd: &Pd,
        qp: Qp,
        registry: Arc<HandlerRegistry>,
        workers: WorkerHandle,
        buffer_size: usize,
        peer_buffer_size: usize,
    ) -> io::Result<Self> {
        let contexts = (0..MAX_CONTEXT_NUM as u32)
            .map(|idx| ServerContext::new(pd, idx, buffer_size))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            qp,
            contexts,
            senders: SlotPool::from_items(RECEIVER_NUM as u32..MAX_CONTEXT_NUM as u32),
            registry,
            workers,
            buffer_size,
            peer_buffer_size,
            closing: AtomicBool::new(false),
        })
    }

    /// Arm every receiver.
    pub fn prepare(&self) -> Result<(), RpcError> {
        self.receivers().iter().try_for_each(|ctx| ctx.prepare(&self.qp))
    }

    #[inline]
    pub fn receivers(&self) -> &[ServerContext] {
        &self.contexts[..RECEIVER_NUM]
    }

    #[inline]
    pub fn senders(&self) -> &[ServerContext] {
        &self.contexts[RECEIVER_NUM..]
    }

    /// Number of senders free to write a response.
    pub fn available_senders(&self) -> usize {
        self.senders.available()
    }

    /// Largest response that fits in the client's buffer.
    #[inline]
    fn response_capacity(&self) -> usize {
        self.buffer_size.min(self.peer_buffer_size)
    }

    pub(super) fn release_sender(&self, idx: u32) {
        self.senders.release(idx);
    }

    /// Hand a filled receiver to the worker pool.
    pub(super) fn handle_wrapper(self: &Arc<Self>, receiver: u32) {
        let conn = self.clone();
        if !self.workers.submit(move || conn.serve(receiver)) {
            log::warn!("worker pool gone, request on receiver {} dropped", receiver);
        }
    }

    /// Serve the request held by `receiver`. Runs on a worker thread.
    fn serve(&self, receiver: u32) {
        let sender = loop {
            if self.closing.load(Ordering::Acquire) {
                log::debug!("connection closing, request on receiver {} dropped", receiver);
                return;
            }
            if let Some(sender) = self.senders.acquire_timeout(SENDER_WAIT) {
                break sender;
            }
        };

        let rctx = &self.contexts[receiver as usize];
        let sctx = &self.contexts[sender as usize];
        let (buf, desc, status) = {
            let mut s = sctx.lock();
            let mut r = rctx.lock();
            if r.state != ServerState::FilledWithRequest {
                log::debug!("receiver {} no longer filled ({:?})", receiver, r.state);
                drop((s, r));
                self.release_sender(sender);
                return;
            }

            s.swap(&mut r);
            r.reset();
            if let Err(e) = rctx.arm(&mut r, &self.qp) {
                log::warn!("receiver {} cannot re-arm: {}", receiver, e);
            }
            (s.buf.clone(), s.request, s.status)
        };
        let Some(desc) = desc else {
            sctx.lock().reset();
            self.release_sender(sender);
            return;
        };

        let (status, len) = self.run_handler(&buf, desc, status);
        let mut s = sctx.lock();
        if let Err(e) = sctx.write_response(&mut s, &self.qp, status, len) {
            log::warn!("sender {} cannot write response: {}", sender, e);
            s.reset();
            drop(s);
            self.release_sender(sender);
        }
    }

    /// Run the handler of `desc` on the request half of `buf`, leaving the
    /// response in its response half.
    fn run_handler(
        &self,
        buf: &Mr,
        desc: RequestDescriptor,
        status: Option<ResponseStatus>,
    ) -> (ResponseStatus, usize) {
        let mut mem = buf.mem();
        let (req, resp) = mem.split_at_mut(self.buffer_size);
        let resp = &mut resp[..self.response_capacity()];

        if let Some(status) = status {
            let msg = format!(
                "request of {} bytes exceeds buffer of {}",
                desc.meta.len, self.buffer_size
            );
            return fail(resp, status, &msg);
        }

        let handler = match self.registry.get(desc.rpc_id) {
            Ok(handler) => handler,
            Err(_) => {
                log::debug!("no handler for procedure {}", desc.rpc_id);
                return (ResponseStatus::UnknownProcedure, 0);
            }
        };

        let req = &req[..desc.meta.len as usize];
        let mut rb = ResponseBuf::new(resp);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(req, &mut rb)));
        let (overflowed, len) = (rb.overflowed(), rb.len());
        let capacity = rb.capacity();
        match outcome {
            _ if overflowed => fail(
                resp,
                ResponseStatus::ResponseTooLarge,
                &format!("response exceeds {} bytes", capacity),
            ),
            Ok(Ok(())) => (ResponseStatus::Ok, len),
            Ok(Err(e)) => {
                log::warn!("handler for procedure {} failed: {}", desc.rpc_id, e);
                fail(resp, ResponseStatus::HandlerFault, &e.to_string())
            }
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_owned());
                log::error!("handler for procedure {} panicked: {}", desc.rpc_id, msg);
                fail(resp, ResponseStatus::HandlerFault, &msg)
            }
        }
    }
}

/// Write an error message as the response, truncated to fit.
fn fail(resp: &mut [u8], status: ResponseStatus, msg: &str) -> (ResponseStatus, usize) {
    let len = msg.len().min(resp.len());
    resp[..len].copy_from_slice(&msg.as_bytes()[..len]);
    (status, len)
}

impl Conn for ServerConnInner {
    type Ctx = ServerContext;

    #[inline]
    fn qp(&self) -> &Qp {
        &self.qp
    }

    #[inline]
    fn contexts(&self) -> &[ServerContext] {
        &self.contexts
    }
}

/// A server connection.
pub struct ServerConn {
    id: CmId,
    inner: Arc<ServerConnInner>,
    poller: Poller,
    workers: Option<WorkerPool>,
}

impl ServerConn {
    /// Start serving on an accepted link: spawn the poller and the worker
    /// pool, then arm every receiver.
    pub(crate) fn new(
        id: CmId,
        pd: &Pd,
        cq: Cq,
        qp: Qp,
        registry: Arc<HandlerRegistry>,
        config: &ServerConfig,
        peer_buffer_size: usize,
    ) -> Result<Self, RpcError> {
        let workers = WorkerPool::new(
            &format!("rdmarpc-worker-{}", id.handle()),
            config.worker_threads,
        )?;
        let inner = Arc::new(ServerConnInner::new(
            pd,
            qp,
            registry,
            workers.handle(),
            config.buffer_size,
            peer_buffer_size,
        )?);
        let poller = Poller::spawn(
            format!("rdmarpc-server-{}", id.handle()),
            cq,
            inner.clone(),
        )?;
        inner.prepare()?;
        Ok(Self {
            id,
            inner,
            poller,
            workers: Some(workers),
        })
    }

    #[inline]
    pub fn handle(&self) -> u64 {
        self.id.handle()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.id.peer_addr()
    }

    pub fn inner(&self) -> &Arc<ServerConnInner> {
        &self.inner
    }
}

impl Drop for ServerConn {
    fn drop(&mut self) {
        self.inner.closing.store(true, Ordering::Release);
        if let Err(e) = self.id.disconnect() {
            log::error!("cannot disconnect on drop: {}", e);
        }
        self.poller.stop();

        // Handlers already running finish before the pool is gone.
        drop(self.workers.take());
        log::info!("server connection {} closed", self.id.handle());
    }
}
