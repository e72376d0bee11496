use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::context::ClientContext;
use super::MAX_CONTEXT_NUM;
use crate::rdma::cm::{CmId, EventChannel};
use crate::rdma::cq::{Cq, Wc};
use crate::rdma::mr::Mr;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpState};
use crate::rpc::conn::{Conn, Poller, WrTag};
use crate::rpc::error::RpcError;
use crate::rpc::meta::Notification;
use crate::rpc::pool::SlotPool;

/// State shared between a client connection and its poller.
pub struct ClientConnInner {
    qp: Qp,
    contexts: Vec<ClientContext>,
    pool: SlotPool<u32, MAX_CONTEXT_NUM>,

    /// Receive buffers for notifications, one per possible outstanding call.
    ///
    /// Receives complete in arrival order rather than in the order the
    /// contexts posted them, so notifications land in a shared ring and are
    /// routed to their context by the immediate data they carry.
    notify: Mr,
    ring: SlotPool<u32, MAX_CONTEXT_NUM>,
}

impl ClientConnInner {
    /// Register every context buffer of a connection over `qp`.
    pub fn new(pd: &Pd, qp: Qp, buffer_size: usize) -> io::Result<Self> {
        let contexts = (0..MAX_CONTEXT_NUM as u32)
            .map(|idx| ClientContext::new(pd, idx, buffer_size))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            qp,
            contexts,
            pool: SlotPool::from_items(0..MAX_CONTEXT_NUM as u32),
            notify: Mr::new(pd, MAX_CONTEXT_NUM * Notification::SIZE)?,
            ring: SlotPool::from_items(0..MAX_CONTEXT_NUM as u32),
        })
    }

    /// Number of contexts not lent out.
    pub fn available_slots(&self) -> usize {
        self.pool.available()
    }

    pub(super) fn available_notification_buffers(&self) -> usize {
        self.ring.available()
    }

    /// Post a receive for one response-ready notification.
    pub(super) fn arm_notification(&self) -> Result<(), RpcError> {
        let idx = self.ring.try_acquire().ok_or_else(|| {
            RpcError::Protocol("more notifications expected than contexts".to_owned())
        })?;
        let Some(buf) = self
            .notify
            .slice(idx as usize * Notification::SIZE, Notification::SIZE)
        else {
            self.ring.release(idx);
            return Err(RpcError::Protocol(format!("bad notification slot {}", idx)));
        };

        let tag = WrTag::new(self.contexts.len() as u32 + idx, 0);
        self.qp.recv(&[buf], tag.into()).map_err(|e| {
            self.ring.release(idx);
            RpcError::Post(e)
        })
    }
}

impl Conn for ClientConnInner {
    type Ctx = ClientContext;

    #[inline]
    fn qp(&self) -> &Qp {
        &self.qp
    }

    #[inline]
    fn contexts(&self) -> &[ClientContext] {
        &self.contexts
    }

    fn advance_conn(self: &Arc<Self>, tag: WrTag, wc: &Wc) {
        let Some(idx) = (tag.slot as usize)
            .checked_sub(self.contexts.len())
            .filter(|idx| *idx < MAX_CONTEXT_NUM)
        else {
            log::warn!("completion for unknown slot {}: {:?}", tag.slot, wc);
            return;
        };

        let len = match wc.ok() {
            Ok(len) => len.min(Notification::SIZE),
            Err(status) => {
                // The QP is broken, so no notification will arrive anymore.
                self.ring.release(idx as u32);
                for ctx in &self.contexts {
                    ctx.fail_if_waiting(status);
                }
                return;
            }
        };
        let offset = idx * Notification::SIZE;
        let bytes = self.notify.mem()[offset..offset + len].to_vec();
        self.ring.release(idx as u32);

        match wc
            .imm()
            .and_then(|rkey| self.contexts.iter().find(|ctx| ctx.buffer_rkey() == rkey))
        {
            Some(ctx) => ctx.on_notification(&bytes),
            None => log::warn!("notification for unknown buffer (imm {:?})", wc.imm()),
        }
    }
}

/// A client connection.
pub struct ClientConn {
    id: CmId,
    events: EventChannel,
    inner: Arc<ClientConnInner>,
    poller: Poller,
    call_timeout: Option<Duration>,
}

impl ClientConn {
    pub(crate) fn new(
        id: CmId,
        events: EventChannel,
        cq: Cq,
        inner: ClientConnInner,
        call_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        let inner = Arc::new(inner);
        let poller = Poller::spawn(
            format!("rdmarpc-client-{}", id.handle()),
            cq,
            inner.clone(),
        )?;
        Ok(Self {
            id,
            events,
            inner,
            poller,
            call_timeout,
        })
    }

    /// Invoke procedure `rpc_id` and wait for its response.
    ///
    /// Blocks while every context of the connection is in use.
    pub fn call(&self, rpc_id: u32, request: &[u8]) -> Result<Vec<u8>, RpcError> {
        while let Some(event) = self.events.try_get_event() {
            log::info!("connection {} got CM event {:?}", self.id.handle(), event.ty());
        }
        if self.inner.qp.state() == QpState::Error {
            return Err(RpcError::InvalidConnection);
        }

        let idx = self.inner.pool.acquire();
        let ctx = &self.inner.contexts[idx as usize];
        let result = ctx
            .call(&self.inner.qp, rpc_id, request)
            .and_then(|()| {
                ctx.wait(self.call_timeout, || {
                    log::warn!(
                        "tearing down connection {} after call timeout",
                        self.id.handle()
                    );
                    if let Err(e) = self.id.disconnect() {
                        log::error!("cannot disconnect: {}", e);
                    }
                })
            });
        self.inner.pool.release(idx);
        result
    }

    /// Number of contexts free for new calls.
    pub fn available_slots(&self) -> usize {
        self.inner.available_slots()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.id.peer_addr()
    }

    /// Disconnect. Calls in flight fail with a flushed completion.
    pub fn disconnect(&self) -> io::Result<()> {
        self.id.disconnect()
    }
}

impl Drop for ClientConn {
    fn drop(&mut self) {
        if let Err(e) = self.id.disconnect() {
            log::error!("cannot disconnect on drop: {}", e);
        }
        self.poller.stop();
        log::info!("connection {} closed", self.id.handle());
    }
}
