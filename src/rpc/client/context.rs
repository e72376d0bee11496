use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use quanta::Instant;

use super::conn::ClientConnInner;
use crate::rdma::cq::{Wc, WcStatus};
use crate::rdma::mr::Mr;
use crate::rdma::pd::Pd;
use crate::rdma::qp::Qp;
use crate::rdma::type_alias::RKey;
use crate::rpc::conn::{ConnCtx, WrTag};
use crate::rpc::error::RpcError;
use crate::rpc::meta::*;
use crate::utils::sync::{CondvarExt, LockExt};

/// State of a client context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Vacant,
    SendingBufferMeta,
    WaitingForResponse,
}

struct Slot {
    state: ClientState,
    epoch: u32,
    rpc_id: u32,
    outcome: Option<Result<Vec<u8>, RpcError>>,

    /// A notification that overtook the completion of the descriptor send.
    early: Option<Vec<u8>>,
}

/// One outstanding call of a client connection.
///
/// The context owns a registered buffer that holds the request while the
/// server reads it and receives the response the server writes back.
pub struct ClientContext {
    idx: u32,
    buf: Mr,
    meta: Mr,
    slot: Mutex<Slot>,
    cv: Condvar,
}

impl ClientContext {
    pub fn new(pd: &Pd, idx: u32, buffer_size: usize) -> io::Result<Self> {
        Ok(Self {
            idx,
            buf: Mr::new(pd, buffer_size)?,
            meta: Mr::new(pd, RequestDescriptor::SIZE)?,
            slot: Mutex::new(Slot {
                state: ClientState::Vacant,
                epoch: 0,
                rpc_id: 0,
                outcome: None,
                early: None,
            }),
            cv: Condvar::new(),
        })
    }

    /// Remote key of the request/response buffer, which identifies this
    /// context in notifications.
    #[inline]
    pub fn buffer_rkey(&self) -> RKey {
        self.buf.rkey()
    }

    pub fn state(&self) -> ClientState {
        self.slot.locked().state
    }

    pub fn epoch(&self) -> u32 {
        self.slot.locked().epoch
    }

    /// Copy the request into the registered buffer and send its descriptor.
    pub fn call(&self, qp: &Qp, rpc_id: u32, request: &[u8]) -> Result<(), RpcError> {
        let mut slot = self.slot.locked();
        if slot.state != ClientState::Vacant {
            return Err(RpcError::Protocol(format!(
                "context {} is busy ({:?})",
                self.idx, slot.state
            )));
        }
        if request.len() > self.buf.len() {
            return Err(RpcError::RequestTooLarge(format!(
                "request of {} bytes exceeds buffer of {}",
                request.len(),
                self.buf.len()
            )));
        }

        self.buf.mem()[..request.len()].copy_from_slice(request);
        let desc = RequestDescriptor {
            rpc_id,
            meta: BufferMeta {
                addr: self.buf.addr(),
                rkey: self.buf.rkey(),
                len: request.len() as u32,
            },
        };
        self.meta.mem().copy_from_slice(&desc.encode());

        slot.state = ClientState::SendingBufferMeta;
        slot.rpc_id = rpc_id;
        slot.outcome = None;
        slot.early = None;
        log::trace!("context {} sending request for procedure {}", self.idx, rpc_id);

        let tag = WrTag::new(self.idx, slot.epoch);
        if let Err(e) = qp.send(&[self.meta.as_slice()], None, tag.into(), true) {
            slot.state = ClientState::Vacant;
            slot.epoch = slot.epoch.wrapping_add(1);
            return Err(RpcError::Post(e));
        }
        Ok(())
    }

    /// Block until the exchange started by [`ClientContext::call`] finishes.
    ///
    /// If `timeout` expires first, `on_timeout` is invoked to tear the
    /// connection down; the wait then continues until the resulting flush
    /// returns the context to `Vacant`, and the call fails with
    /// [`RpcError::Timeout`].
    pub fn wait(
        &self,
        timeout: Option<Duration>,
        on_timeout: impl FnOnce(),
    ) -> Result<Vec<u8>, RpcError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut on_timeout = Some(on_timeout);
        let mut slot = self.slot.locked();
        loop {
            if let Some(outcome) = slot.outcome.take() {
                return match (on_timeout.is_none(), timeout) {
                    (true, Some(t)) => Err(RpcError::Timeout(t.as_millis() as u64)),
                    _ => outcome,
                };
            }

            match deadline {
                Some(deadline) if on_timeout.is_some() => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(slot);
                        log::warn!("call on context {} timed out", self.idx);
                        if let Some(f) = on_timeout.take() {
                            f();
                        }
                        slot = self.slot.locked();
                    } else {
                        slot = self.cv.wait_timeout_locked(slot, deadline - now).0;
                    }
                }
                _ => slot = self.cv.wait_locked(slot),
            }
        }
    }

    /// Complete the exchange with the server's notification.
    ///
    /// Completions of different queues are not ordered, so the notification
    /// may arrive before the completion of the descriptor send. It is then
    /// kept until that completion comes in.
    pub(super) fn on_notification(&self, bytes: &[u8]) {
        let mut slot = self.slot.locked();
        let state = slot.state;
        match state {
            ClientState::WaitingForResponse => {
                let outcome = self.response(slot.rpc_id, bytes);
                self.finish(&mut slot, outcome);
            }
            ClientState::SendingBufferMeta if slot.early.is_none() => {
                log::debug!("context {} got its notification early", self.idx);
                slot.early = Some(bytes.to_vec());
            }
            state => log::debug!(
                "context {} dropped a notification in state {:?}",
                self.idx,
                state
            ),
        }
    }

    /// Fail a context whose notification can no longer arrive.
    pub(super) fn fail_if_waiting(&self, status: WcStatus) {
        let mut slot = self.slot.locked();
        if slot.state == ClientState::WaitingForResponse {
            self.finish(&mut slot, Err(RpcError::Completion(status)));
        }
    }

    fn response(&self, rpc_id: u32, bytes: &[u8]) -> Result<Vec<u8>, RpcError> {
        let notification = Notification::decode(bytes)?;
        let len = notification.len as usize;
        if len > self.buf.len() {
            return Err(RpcError::Protocol(format!(
                "response of {} bytes overruns buffer of {}",
                len,
                self.buf.len()
            )));
        }

        let payload = self.buf.mem()[..len].to_vec();
        let message = || String::from_utf8_lossy(&payload).into_owned();
        match notification.status {
            ResponseStatus::Ok => Ok(payload),
            ResponseStatus::UnknownProcedure => Err(RpcError::UnknownProcedure(rpc_id)),
            ResponseStatus::HandlerFault => Err(RpcError::HandlerFault(message())),
            ResponseStatus::RequestTooLarge => Err(RpcError::RequestTooLarge(message())),
            ResponseStatus::ResponseTooLarge => Err(RpcError::ResponseTooLarge(message())),
        }
    }

    fn finish(&self, slot: &mut Slot, outcome: Result<Vec<u8>, RpcError>) {
        log::trace!(
            "context {} done in state {:?}: ok={}",
            self.idx,
            slot.state,
            outcome.is_ok()
        );
        slot.state = ClientState::Vacant;
        slot.epoch = slot.epoch.wrapping_add(1);
        slot.outcome = Some(outcome);
        slot.early = None;
        self.cv.notify_all();
    }
}

impl ConnCtx for ClientContext {
    type Conn = ClientConnInner;

    fn advance(&self, conn: &Arc<ClientConnInner>, tag: WrTag, wc: &Wc) {
        let mut slot = self.slot.locked();
        if tag.epoch != slot.epoch || slot.state != ClientState::SendingBufferMeta {
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

        match wc.ok() {
            Ok(_) => {
                slot.state = ClientState::WaitingForResponse;
                // An early notification consumed a receive armed for another
                // context, so the ring is refilled either way.
                if let Err(e) = conn.arm_notification() {
                    self.finish(&mut slot, Err(e));
                } else if let Some(bytes) = slot.early.take() {
                    let outcome = self.response(slot.rpc_id, &bytes);
                    self.finish(&mut slot, outcome);
                }
            }
            Err(status) => self.finish(&mut slot, Err(RpcError::Completion(status))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::rdma::context::Context;
    use crate::rdma::cq::Cq;
    use crate::rdma::mr::MrRemote;
    use crate::rdma::qp::QpCaps;
    use crate::rpc::conn::{dispatch, Conn};

    struct Rig {
        pd: Pd,
        cq: Cq,
        conn: Arc<ClientConnInner>,
        server_cq: Cq,
        server: Qp,
    }

    fn rig() -> Rig {
        let ctx = Context::open(None);
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 64).unwrap();
        let server_cq = Cq::new(&ctx, 64).unwrap();
        let build = |cq: &Cq| {
            Qp::builder()
                .send_cq(cq)
                .recv_cq(cq)
                .caps(QpCaps::with_depth(32))
                .build(&pd)
                .unwrap()
        };
        let client = build(&cq);
        let server = build(&server_cq);
        Qp::connect_local(&client, &server).unwrap();
        let conn = Arc::new(ClientConnInner::new(&pd, client, 64).unwrap());
        Rig {
            pd,
            cq,
            conn,
            server_cq,
            server,
        }
    }

    fn pump(rig: &Rig) {
        while let Some(wc) = rig.cq.poll_one() {
            dispatch(&rig.conn, &wc);
        }
    }

    #[test]
    fn test_state_discipline() {
        let rig = rig();
        let ctx = &rig.conn.contexts()[0];
        assert_eq!(ctx.state(), ClientState::Vacant);

        ctx.call(rig.conn.qp(), 5, b"ping").unwrap();
        assert_eq!(ctx.state(), ClientState::SendingBufferMeta);
        assert!(ctx.call(rig.conn.qp(), 5, b"ping").is_err());

        // The descriptor waits at the server until a receive is posted.
        pump(&rig);
        assert_eq!(ctx.state(), ClientState::SendingBufferMeta);

        let meta = Mr::new(&rig.pd, RequestDescriptor::SIZE).unwrap();
        rig.server.recv(&[meta.as_slice()], 0).unwrap();
        let desc = RequestDescriptor::decode(&meta.mem()[..]).unwrap();
        assert_eq!((desc.rpc_id, desc.meta.len), (5, 4));
        pump(&rig);
        assert_eq!(ctx.state(), ClientState::WaitingForResponse);

        // Play the server: pull the request, push the response, notify.
        let req = Mr::new(&rig.pd, 4).unwrap();
        rig.server.read(&[req.as_slice()], &desc.meta.as_remote(), 1, true).unwrap();
        assert_eq!(&req.mem()[..], b"ping");
        let resp = Mr::new_with_content(&rig.pd, b"pong!", Default::default()).unwrap();
        let dst = desc.meta.as_remote();
        rig.server.write(&[resp.as_slice()], &dst, 2, false).unwrap();
        let note = Notification {
            status: ResponseStatus::Ok,
            len: 5,
        };
        let note = Mr::new_with_content(&rig.pd, &note.encode(), Default::default()).unwrap();
        rig.server
            .send(&[note.as_slice()], Some(desc.meta.rkey), 3, true)
            .unwrap();
        // Receive, read, and the signaled send; the write is unsignaled.
        assert_eq!(rig.server_cq.poll().len(), 3);

        let epoch = ctx.epoch();
        pump(&rig);
        assert_eq!(ctx.state(), ClientState::Vacant);
        assert_eq!(ctx.epoch(), epoch + 1);
        assert_eq!(ctx.wait(None, || ()).unwrap(), b"pong!");
        assert_eq!(rig.conn.available_notification_buffers(), super::super::MAX_CONTEXT_NUM);
    }

    #[test]
    fn test_error_status() {
        let rig = rig();
        let ctx = &rig.conn.contexts()[1];
        ctx.call(rig.conn.qp(), 9, b"x").unwrap();

        let meta = Mr::new(&rig.pd, RequestDescriptor::SIZE).unwrap();
        rig.server.recv(&[meta.as_slice()], 0).unwrap();
        let desc = RequestDescriptor::decode(&meta.mem()[..]).unwrap();
        pump(&rig);

        let note = Notification {
            status: ResponseStatus::UnknownProcedure,
            len: 0,
        };
        let note = Mr::new_with_content(&rig.pd, &note.encode(), Default::default()).unwrap();
        rig.server
            .send(&[note.as_slice()], Some(desc.meta.rkey), 3, true)
            .unwrap();
        pump(&rig);
        assert!(matches!(ctx.wait(None, || ()), Err(RpcError::UnknownProcedure(9))));
    }

    #[test]
    fn test_notification_before_send_completion() {
        let rig = rig();
        let (c0, c1) = (&rig.conn.contexts()[0], &rig.conn.contexts()[1]);
        let notify = |ctx: &ClientContext, payload: &[u8], wr_id| {
            let resp = Mr::new_with_content(&rig.pd, payload, Default::default()).unwrap();
            let dst = MrRemote::new(ctx.buf.addr(), payload.len(), ctx.buf.rkey());
            rig.server.write(&[resp.as_slice()], &dst, wr_id, false).unwrap();
            let note = Notification {
                status: ResponseStatus::Ok,
                len: payload.len() as u32,
            };
            let note = Mr::new_with_content(&rig.pd, &note.encode(), Default::default()).unwrap();
            rig.server
                .send(&[note.as_slice()], Some(ctx.buffer_rkey()), wr_id, true)
                .unwrap();
        };

        // c0 is in flight, so one notification receive is armed.
        let meta0 = Mr::new(&rig.pd, RequestDescriptor::SIZE).unwrap();
        rig.server.recv(&[meta0.as_slice()], 0).unwrap();
        c0.call(rig.conn.qp(), 1, b"first").unwrap();
        pump(&rig);
        assert_eq!(c0.state(), ClientState::WaitingForResponse);

        // c1's notification lands in c0's receive before c1's descriptor
        // send completes.
        c1.call(rig.conn.qp(), 2, b"second").unwrap();
        notify(c1, b"two", 10);
        let meta1 = Mr::new(&rig.pd, RequestDescriptor::SIZE).unwrap();
        rig.server.recv(&[meta1.as_slice()], 1).unwrap();
        pump(&rig);
        assert_eq!(c1.state(), ClientState::Vacant);
        assert_eq!(c1.wait(Some(Duration::from_millis(300)), || ()).unwrap(), b"two");

        // The ring was refilled, so c0 still gets its response.
        notify(c0, b"one", 11);
        pump(&rig);
        assert_eq!(c0.wait(Some(Duration::from_millis(300)), || ()).unwrap(), b"one");
        assert_eq!(rig.conn.available_notification_buffers(), super::super::MAX_CONTEXT_NUM);
    }

    #[test]
    fn test_request_too_large() {
        let rig = rig();
        let ctx = &rig.conn.contexts()[0];
        let big = vec![0u8; 65];
        assert!(matches!(
            ctx.call(rig.conn.qp(), 1, &big),
            Err(RpcError::RequestTooLarge(_))
        ));
        assert_eq!(ctx.state(), ClientState::Vacant);
    }

    #[test]
    fn test_flush_wakes_waiter() {
        let rig = rig();
        let conn = rig.conn.clone();
        let cq = rig.cq.clone();

        let meta = Mr::new(&rig.pd, RequestDescriptor::SIZE).unwrap();
        rig.server.recv(&[meta.as_slice()], 0).unwrap();
        conn.contexts()[0].call(conn.qp(), 1, b"a").unwrap();
        pump(&rig);
        assert_eq!(conn.contexts()[0].state(), ClientState::WaitingForResponse);

        let waiter = thread::spawn(move || conn.contexts()[0].wait(None, || ()));
        rig.conn.qp().modify_to_error();
        while let Some(wc) = cq.poll_one() {
            dispatch(&rig.conn, &wc);
        }
        assert!(matches!(
            waiter.join().unwrap(),
            Err(RpcError::Completion(WcStatus::WrFlushErr))
        ));
    }

    #[test]
    fn test_timeout_tears_down() {
        let rig = rig();
        let ctx = &rig.conn.contexts()[0];
        ctx.call(rig.conn.qp(), 1, b"a").unwrap();

        let qp = rig.conn.qp().clone();
        let server = rig.server.clone();
        let conn = rig.conn.clone();
        let cq = rig.cq.clone();
        let result = ctx.wait(Some(Duration::from_millis(20)), move || {
            // Teardown moves both ends to the error state; the unreceived
            // descriptor then fails at the sender.
            qp.modify_to_error();
            server.modify_to_error();
            while let Some(wc) = cq.poll_one() {
                dispatch(&conn, &wc);
            }
        });
        assert!(matches!(result, Err(RpcError::Timeout(20))));
        assert_eq!(ctx.state(), ClientState::Vacant);
    }
}
