use std::io;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use super::conn::ServerConnInner;
use crate::rdma::cq::Wc;
use crate::rdma::mr::{Mr, MrRemote};
use crate::rdma::pd::Pd;
use crate::rdma::qp::Qp;
use crate::rpc::conn::{Conn, ConnCtx, WrTag};
use crate::rpc::error::RpcError;
use crate::rpc::meta::*;
use crate::utils::sync::LockExt;

/// State of a server context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Vacant,
    WaitingForBufferMeta,
    ReadingRequest,
    FilledWithRequest,
    FilledWithResponse,
    WritingResponse,
}

/// Mutable part of a server context.
pub(crate) struct ServerSlot {
    pub(crate) state: ServerState,
    pub(crate) epoch: u32,

    /// Request half followed by response half, `buffer_size` bytes each.
    pub(crate) buf: Arc<Mr>,

    /// Descriptor of the request being served.
    pub(crate) request: Option<RequestDescriptor>,

    /// Status decided before the handler runs, if any.
    pub(crate) status: Option<ResponseStatus>,
}

impl ServerSlot {
    /// Exchange buffers and the exchange in progress with `other`.
    ///
    /// Only ownership moves; no byte is copied. Epochs stay with their slots.
    pub(crate) fn swap(&mut self, other: &mut ServerSlot) {
        mem::swap(&mut self.buf, &mut other.buf);
        mem::swap(&mut self.request, &mut other.request);
        mem::swap(&mut self.status, &mut other.status);
        mem::swap(&mut self.state, &mut other.state);
    }

    /// Return to `Vacant`, invalidating completions of the finished exchange.
    pub(crate) fn reset(&mut self) {
        self.state = ServerState::Vacant;
        self.epoch = self.epoch.wrapping_add(1);
        self.request = None;
        self.status = None;
    }
}

/// One request being served.
///
/// Receiver contexts stay armed with a receive for the next request
/// descriptor; sender contexts take over a filled receiver's buffer and
/// push the response back.
pub struct ServerContext {
    idx: u32,
    buffer_size: usize,
    meta: Mr,
    slot: Mutex<ServerSlot>,
}

impl ServerContext {
    pub fn new(pd: &Pd, idx: u32, buffer_size: usize) -> io::Result<Self> {
        Ok(Self {
            idx,
            buffer_size,
            meta: Mr::new(pd, RequestDescriptor::SIZE)?,
            slot: Mutex::new(ServerSlot {
                state: ServerState::Vacant,
                epoch: 0,
                buf: Arc::new(Mr::new(pd, 2 * buffer_size)?),
                request: None,
                status: None,
            }),
        })
    }

    #[inline]
    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub fn state(&self) -> ServerState {
        self.slot.locked().state
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ServerSlot> {
        self.slot.locked()
    }

    /// Arm a receive for the next request descriptor.
    pub fn prepare(&self, qp: &Qp) -> Result<(), RpcError> {
        let mut slot = self.slot.locked();
        self.arm(&mut slot, qp)
    }

    pub(crate) fn arm(&self, slot: &mut ServerSlot, qp: &Qp) -> Result<(), RpcError> {
        let tag = WrTag::new(self.idx, slot.epoch);
        qp.recv(&[self.meta.as_slice()], tag.into())?;
        slot.state = ServerState::WaitingForBufferMeta;
        Ok(())
    }

    /// Post the response write and the notification that follows it.
    ///
    /// The response is `len` bytes at the start of the response half.
    pub(crate) fn write_response(
        &self,
        slot: &mut ServerSlot,
        qp: &Qp,
        status: ResponseStatus,
        len: usize,
    ) -> Result<(), RpcError> {
        let desc = slot
            .request
            .ok_or_else(|| RpcError::Protocol(format!("sender {} holds no request", self.idx)))?;
        slot.state = ServerState::FilledWithResponse;
        slot.status = Some(status);

        let tag = WrTag::new(self.idx, slot.epoch);
        if len > 0 {
            let local = slot.buf.slice(self.buffer_size, len).ok_or_else(|| {
                RpcError::ResponseTooLarge(format!("{} bytes exceed the response half", len))
            })?;
            let remote = MrRemote::new(desc.meta.addr, len, desc.meta.rkey);
            qp.write(&[local], &remote, tag.into(), false)?;
        }

        let notification = Notification {
            status,
            len: len as u32,
        };
        self.meta.mem()[..Notification::SIZE].copy_from_slice(&notification.encode());
        let note = self
            .meta
            .slice(0, Notification::SIZE)
            .ok_or_else(|| RpcError::Protocol("notification buffer too small".to_owned()))?;
        qp.send(&[note], Some(desc.meta.rkey), tag.into(), true)?;

        slot.state = ServerState::WritingResponse;
        log::trace!(
            "sender {} wrote {} response bytes ({:?})",
            self.idx,
            len,
            status
        );
        Ok(())
    }

    /// Handle a received request descriptor.
    ///
    /// Returns whether the request is ready for a handler.
    fn on_descriptor(&self, slot: &mut ServerSlot, qp: &Qp, len: usize) -> bool {
        let desc = match RequestDescriptor::decode(&self.meta.mem()[..len]) {
            Ok(desc) => desc,
            Err(e) => {
                log::warn!("receiver {} got a bad descriptor: {}", self.idx, e);
                if let Err(e) = self.arm(slot, qp) {
                    log::warn!("receiver {} cannot re-arm: {}", self.idx, e);
                    slot.reset();
                }
                return false;
            }
        };
        log::trace!(
            "receiver {} got procedure {} with {} request bytes",
            self.idx,
            desc.rpc_id,
            desc.meta.len
        );
        slot.request = Some(desc);

        let req_len = desc.meta.len as usize;
        if req_len > self.buffer_size {
            slot.status = Some(ResponseStatus::RequestTooLarge);
            slot.state = ServerState::FilledWithRequest;
            return true;
        }
        if req_len == 0 {
            slot.state = ServerState::FilledWithRequest;
            return true;
        }

        let tag = WrTag::new(self.idx, slot.epoch);
        let posted = match slot.buf.slice(0, req_len) {
            Some(local) => qp
                .read(&[local], &desc.meta.as_remote(), tag.into(), true)
                .map_err(RpcError::from),
            None => Err(RpcError::Protocol(format!("bad request length {}", req_len))),
        };
        match posted {
            Ok(()) => slot.state = ServerState::ReadingRequest,
            Err(e) => {
                log::warn!("receiver {} cannot read request: {}", self.idx, e);
                slot.reset();
            }
        }
        false
    }
}

impl ConnCtx for ServerContext {
    type Conn = ServerConnInner;

    fn advance(&self, conn: &Arc<ServerConnInner>, tag: WrTag, wc: &Wc) {
        let mut slot = self.slot.locked();
        if tag.epoch != slot.epoch || slot.state == ServerState::Vacant {
            log::debug!(
                "context {} dropped stale completion {:?} (epoch {}, current {}, {:?})",
                self.idx,
                wc,
                tag.epoch,
                slot.epoch,
                slot.state
            );
            return;
        }

        let len = match wc.ok() {
            Ok(len) => len,
            Err(status) => {
                log::debug!(
                    "context {} failed in state {:?}: {}",
                    self.idx,
                    slot.state,
                    status
                );
                let held_sender = matches!(
                    slot.state,
                    ServerState::FilledWithResponse | ServerState::WritingResponse
                );
                slot.reset();
                drop(slot);
                if held_sender {
                    conn.release_sender(self.idx);
                }
                return;
            }
        };

        let ready = match slot.state {
            ServerState::WaitingForBufferMeta => self.on_descriptor(&mut slot, conn.qp(), len),
            ServerState::ReadingRequest => {
                slot.state = ServerState::FilledWithRequest;
                true
            }
            ServerState::WritingResponse => {
                slot.reset();
                drop(slot);
                conn.release_sender(self.idx);
                return;
            }
            state => {
                log::warn!(
                    "context {} got a completion in state {:?}: {:?}",
                    self.idx,
                    state,
                    wc
                );
                false
            }
        };

        drop(slot);
        if ready {
            conn.handle_wrapper(self.idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::Context;
    use crate::rdma::cq::Cq;
    use crate::rdma::qp::QpCaps;

    #[test]
    fn test_zero_copy_swap() {
        let ctx = Context::open(None);
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let build = || {
            Qp::builder()
                .send_cq(&cq)
                .recv_cq(&cq)
                .caps(QpCaps::with_depth(8))
                .build(&pd)
                .unwrap()
        };
        let (a, b) = (build(), build());
        Qp::connect_local(&a, &b).unwrap();

        let receiver = ServerContext::new(&pd, 0, 32).unwrap();
        let sender = ServerContext::new(&pd, 1, 32).unwrap();
        receiver.prepare(&a).unwrap();
        assert_eq!(receiver.state(), ServerState::WaitingForBufferMeta);

        let filled = {
            let mut r = receiver.lock();
            r.buf.mem()[..5].copy_from_slice(b"hello");
            r.state = ServerState::FilledWithRequest;
            r.buf.clone()
        };

        {
            let mut s = sender.lock();
            let mut r = receiver.lock();
            s.swap(&mut r);
            assert_eq!(s.state, ServerState::FilledWithRequest);
            assert!(Arc::ptr_eq(&s.buf, &filled));
            assert_eq!(&s.buf.mem()[..5], b"hello");
            assert_eq!(r.state, ServerState::Vacant);
            assert!(!Arc::ptr_eq(&r.buf, &filled));
            r.reset();
            receiver.arm(&mut r, &a).unwrap();
        }
        assert_eq!(receiver.state(), ServerState::WaitingForBufferMeta);
        assert_eq!(sender.state(), ServerState::FilledWithRequest);
    }
}
