//! Queue pair and related types.

mod builder;

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;

pub use self::builder::*;
use crate::rdma::{context::Context, cq::*, mr::*, pd::Pd, type_alias::*};
use crate::utils::sync::LockExt;

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpState {
    /// Newly created or reset. Nothing can be posted.
    Reset,
    /// Initialized. Receives can be posted.
    Init,
    /// Ready to receive.
    Rtr,
    /// Ready to send.
    Rts,
    /// Failed. Every outstanding and future work request is flushed.
    Error,
}

/// Queue pair creation error type.
#[derive(Debug, Error)]
pub enum QpCreationError {
    /// A mandatory completion queue was not given to the builder.
    #[error("{0} CQ must be set")]
    MissingCq(&'static str),

    /// A completion queue was created on a different device.
    #[error("CQ belongs to a different device")]
    ForeignCq,

    /// Specified capabilities are not supported by the device.
    /// The three fields are for the capability name, the maximum supported
    /// value, and the required value.
    #[error("capability not enough: {0} supports up to {1}, {2} required")]
    CapabilityNotEnough(String, u32, u32),
}

struct PostedRecv {
    wr_id: WrId,
    sgl: Vec<Sge>,
}

/// Where to report the outcome of a send once the peer consumes it.
struct Origin {
    qp: Weak<QpInner>,
    wr_id: WrId,
    signal: bool,
}

impl Origin {
    fn complete(self, status: WcStatus) {
        if let Some(qp) = self.qp.upgrade() {
            qp.complete_send(self.wr_id, self.signal, status, WcOpcode::Send, 0);
        }
    }
}

/// A send that arrived while no receive was posted (receiver not ready).
struct Inbound {
    data: Vec<u8>,
    imm: Option<ImmData>,
    origin: Origin,
}

#[derive(Default)]
struct RecvQueue {
    posted: VecDeque<PostedRecv>,
    inbound: VecDeque<Inbound>,
}

pub(crate) struct QpInner {
    pd: Pd,
    qpn: Qpn,
    send_cq: Cq,
    recv_cq: Cq,
    caps: QpCaps,
    sq_sig_all: bool,

    /// Serializes send-queue processing so work requests run in post order.
    sq: Mutex<()>,

    /// Lock order: `state` before `rq`.
    state: Mutex<QpState>,
    rq: Mutex<RecvQueue>,
    peer: Mutex<Option<Weak<QpInner>>>,
}

impl QpInner {
    fn state(&self) -> QpState {
        *self.state.locked()
    }

    fn peer(&self) -> Option<Arc<QpInner>> {
        self.peer.locked().as_ref().and_then(Weak::upgrade)
    }

    /// Move into the error state, flushing posted receives and failing
    /// the senders of buffered inbound messages.
    fn set_error(&self) {
        let orphans = {
            let mut state = self.state.locked();
            if *state == QpState::Error {
                return;
            }
            *state = QpState::Error;

            let mut rq = self.rq.locked();
            for recv in rq.posted.drain(..) {
                self.recv_cq
                    .push(Wc::new(recv.wr_id, WcStatus::WrFlushErr, WcOpcode::Recv, 0));
            }
            rq.inbound.drain(..).map(|i| i.origin).collect::<Vec<_>>()
        };

        log::debug!("QP {} moved to error state", self.qpn);
        for origin in orphans {
            origin.complete(WcStatus::RetryExcErr);
        }
    }

    /// Report the outcome of a send-queue work request.
    fn complete_send(&self, wr_id: WrId, signal: bool, status: WcStatus, op: WcOpcode, len: usize) {
        if status == WcStatus::Success {
            if signal || self.sq_sig_all {
                self.send_cq.push(Wc::new(wr_id, status, op, len));
            }
        } else {
            log::trace!("QP {} {:?} wr {:#x} failed: {}", self.qpn, op, wr_id, status);
            self.send_cq.push(Wc::new(wr_id, status, op, 0));
            self.set_error();
        }
    }

    fn build_sgl(&self, local: &[MrSlice], max_sge: u32) -> io::Result<Vec<Sge>> {
        if local.len() > max_sge as usize {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("too many SGEs: {} > {}", local.len(), max_sge),
            ));
        }
        Ok(local.iter().map(MrSlice::to_sge).collect())
    }

    /// Check that every SGE is usable by this QP.
    fn sgl_permitted(&self, sgl: &[Sge], local_write: bool) -> bool {
        sgl.iter().all(|sge| {
            sge.mr.pd().same_as(&self.pd)
                && (!local_write || sge.mr.perm().contains(Permission::LOCAL_WRITE))
        })
    }

    /// Decide whether a send-queue work request may execute, returning the
    /// peer to execute it against.
    fn prepare_send(
        &self,
        sgl: &[Sge],
        wr_id: WrId,
        op: WcOpcode,
        local_write: bool,
    ) -> io::Result<Option<Arc<QpInner>>> {
        match self.state() {
            QpState::Rts => {}
            QpState::Error => {
                self.send_cq
                    .push(Wc::new(wr_id, WcStatus::WrFlushErr, op, 0));
                return Ok(None);
            }
            state => {
                return Err(IoError::new(
                    IoErrorKind::InvalidInput,
                    format!("QP {} is not ready to send (state {:?})", self.qpn, state),
                ))
            }
        }

        if !self.sgl_permitted(sgl, local_write) {
            self.complete_send(wr_id, true, WcStatus::LocProtErr, op, 0);
            return Ok(None);
        }
        match self.peer() {
            Some(peer) => Ok(Some(peer)),
            None => {
                self.complete_send(wr_id, true, WcStatus::RetryExcErr, op, 0);
                Ok(None)
            }
        }
    }

    /// Scatter an incoming message into a posted receive.
    /// Return `false` if the receive is too small to hold it.
    fn scatter_recv(&self, recv: PostedRecv, data: &[u8], imm: Option<ImmData>) -> bool {
        let capacity: usize = recv.sgl.iter().map(|sge| sge.len).sum();
        if data.len() > capacity {
            self.recv_cq
                .push(Wc::new(recv.wr_id, WcStatus::LocLenErr, WcOpcode::Recv, 0));
            return false;
        }

        let mut offset = 0;
        for sge in &recv.sgl {
            offset += sge.scatter(&data[offset..]);
        }
        self.recv_cq.push(
            Wc::new(recv.wr_id, WcStatus::Success, WcOpcode::Recv, data.len()).with_imm(imm),
        );
        true
    }

    /// Accept a message sent by the peer.
    fn deliver(&self, data: Vec<u8>, imm: Option<ImmData>, origin: Origin) {
        let outcome = {
            let state = self.state.locked();
            if matches!(*state, QpState::Rtr | QpState::Rts) {
                let mut rq = self.rq.locked();
                match rq.posted.pop_front() {
                    Some(recv) => Ok(self.scatter_recv(recv, &data, imm)),
                    None if rq.inbound.len() < self.caps.max_recv_wr as usize => {
                        rq.inbound.push_back(Inbound { data, imm, origin });
                        return;
                    }
                    None => Err(WcStatus::RnrRetryExcErr),
                }
            } else {
                Err(WcStatus::RetryExcErr)
            }
        };

        match outcome {
            Ok(true) => origin.complete(WcStatus::Success),
            Ok(false) => {
                self.set_error();
                origin.complete(WcStatus::RemInvReqErr);
            }
            Err(status) => origin.complete(status),
        }
    }

    /// Resolve a one-sided access from the peer into a local region and offset.
    fn resolve(
        &self,
        remote: &MrRemote,
        len: usize,
        perm: Permission,
    ) -> Result<(Arc<MrInner>, usize), WcStatus> {
        if !matches!(self.state(), QpState::Rtr | QpState::Rts) {
            return Err(WcStatus::RetryExcErr);
        }
        let mr = self.pd.lookup(remote.rkey).ok_or(WcStatus::RemAccessErr)?;
        if !mr.perm().contains(perm) {
            return Err(WcStatus::RemAccessErr);
        }
        let offset = mr.offset_of(remote.addr, len).ok_or(WcStatus::RemAccessErr)?;
        Ok((mr, offset))
    }
}

impl Drop for QpInner {
    fn drop(&mut self) {
        let rq = self.rq.get_mut().unwrap_or_else(|e| e.into_inner());
        for inbound in rq.inbound.drain(..) {
            inbound.origin.complete(WcStatus::RetryExcErr);
        }
    }
}

/// Queue pair.
///
/// This type is a simple wrapper of an `Arc`. Work requests execute at post
/// time against the connected peer; their completions are reported to the
/// send and receive CQs given at build time.
#[derive(Clone)]
pub struct Qp {
    pub(crate) inner: Arc<QpInner>,
}

impl fmt::Debug for Qp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Qp<{}>", self.inner.qpn))
    }
}

impl Qp {
    /// Return a builder for a queue pair.
    pub fn builder<'a>() -> QpBuilder<'a> {
        QpBuilder::new()
    }

    pub(super) fn new(pd: &Pd, builder: QpBuilder<'_>) -> Result<Self, QpCreationError> {
        let send_cq = builder.send_cq.ok_or(QpCreationError::MissingCq("send"))?;
        let recv_cq = builder.recv_cq.ok_or(QpCreationError::MissingCq("recv"))?;
        let ctx = pd.context();
        if !send_cq.context().same_as(ctx) || !recv_cq.context().same_as(ctx) {
            return Err(QpCreationError::ForeignCq);
        }

        let attr = ctx.attr();
        let caps = builder.caps;
        for (name, max, req) in [
            ("max_send_wr", attr.max_qp_wr, caps.max_send_wr),
            ("max_recv_wr", attr.max_qp_wr, caps.max_recv_wr),
            ("max_send_sge", attr.max_sge, caps.max_send_sge),
            ("max_recv_sge", attr.max_sge, caps.max_recv_sge),
        ] {
            if req > max {
                return Err(QpCreationError::CapabilityNotEnough(name.to_owned(), max, req));
            }
        }

        let qpn = ctx.alloc_qpn();
        log::trace!("created QP {}", qpn);
        Ok(Self {
            inner: Arc::new(QpInner {
                pd: pd.clone(),
                qpn,
                send_cq: send_cq.clone(),
                recv_cq: recv_cq.clone(),
                caps,
                sq_sig_all: builder.sq_sig_all,
                sq: Mutex::new(()),
                state: Mutex::new(QpState::Init),
                rq: Mutex::new(RecvQueue::default()),
                peer: Mutex::new(None),
            }),
        })
    }

    /// Get the queue pair number.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.inner.qpn
    }

    /// Get the current state of the queue pair.
    #[inline]
    pub fn state(&self) -> QpState {
        self.inner.state()
    }

    /// Get the capabilities of this QP.
    #[inline]
    pub fn caps(&self) -> &QpCaps {
        &self.inner.caps
    }

    /// Get the protection domain of this QP.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.inner.pd
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        self.inner.pd.context()
    }

    /// Get the send completion queue.
    #[inline]
    pub fn scq(&self) -> &Cq {
        &self.inner.send_cq
    }

    /// Get the receive completion queue.
    #[inline]
    pub fn rcq(&self) -> &Cq {
        &self.inner.recv_cq
    }

    /// Get the queue pair number of the connected peer, if it is still alive.
    pub fn peer_qpn(&self) -> Option<Qpn> {
        self.inner.peer().map(|peer| peer.qpn)
    }

    /// Connect this QP to `peer` and bring it to the RTS state.
    ///
    /// Only this side is connected; call [`Qp::connect_local`] or bind the
    /// peer in the other direction as well for a full connection.
    pub fn bind_peer(&self, peer: &Qp) -> io::Result<()> {
        let mut state = self.inner.state.locked();
        if *state == QpState::Error {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("QP {} is in error state", self.inner.qpn),
            ));
        }
        *self.inner.peer.locked() = Some(Arc::downgrade(&peer.inner));
        *state = QpState::Rts;
        Ok(())
    }

    /// Connect two local QPs with each other.
    pub fn connect_local(first: &Qp, second: &Qp) -> io::Result<()> {
        first.bind_peer(second)?;
        second.bind_peer(first)
    }

    /// Move the QP into the error state.
    ///
    /// Posted receives are flushed with [`WcStatus::WrFlushErr`], and so is
    /// every work request posted afterwards.
    pub fn modify_to_error(&self) {
        self.inner.set_error();
    }

    /// Post a receive request.
    ///
    /// **NOTE:** This method has no mutable borrows to its parameters, but can
    /// cause the content of the buffers to be modified!
    pub fn recv(&self, local: &[MrSlice], wr_id: WrId) -> io::Result<()> {
        let inner = &self.inner;
        let sgl = inner.build_sgl(local, inner.caps.max_recv_sge)?;

        enum Outcome {
            Queued,
            Refused,
            Matched(bool, Origin),
        }

        let outcome = {
            let state = inner.state.locked();
            match *state {
                QpState::Reset => {
                    return Err(IoError::new(
                        IoErrorKind::InvalidInput,
                        "cannot post receive to a QP in RESET state",
                    ))
                }
                QpState::Error => {
                    inner
                        .recv_cq
                        .push(Wc::new(wr_id, WcStatus::WrFlushErr, WcOpcode::Recv, 0));
                    return Ok(());
                }
                _ => {}
            }

            if !inner.sgl_permitted(&sgl, true) {
                inner
                    .recv_cq
                    .push(Wc::new(wr_id, WcStatus::LocProtErr, WcOpcode::Recv, 0));
                Outcome::Refused
            } else {
                let mut rq = inner.rq.locked();
                let recv = PostedRecv { wr_id, sgl };
                match rq.inbound.pop_front() {
                    Some(inbound) => Outcome::Matched(
                        inner.scatter_recv(recv, &inbound.data, inbound.imm),
                        inbound.origin,
                    ),
                    None if rq.posted.len() >= inner.caps.max_recv_wr as usize => {
                        return Err(IoError::new(
                            IoErrorKind::OutOfMemory,
                            format!("receive queue of QP {} is full", inner.qpn),
                        ))
                    }
                    None => {
                        rq.posted.push_back(recv);
                        Outcome::Queued
                    }
                }
            }
        };

        match outcome {
            Outcome::Queued => {}
            Outcome::Refused => inner.set_error(),
            Outcome::Matched(true, origin) => origin.complete(WcStatus::Success),
            Outcome::Matched(false, origin) => {
                inner.set_error();
                origin.complete(WcStatus::RemInvReqErr);
            }
        }
        Ok(())
    }

    /// Post a send request to the remote end of the connection.
    ///
    /// The send completes once the peer consumes it with a posted receive.
    /// If the peer has no receive posted, the message waits for one (up to
    /// the peer's receive queue depth).
    pub fn send(
        &self,
        local: &[MrSlice],
        imm: Option<ImmData>,
        wr_id: WrId,
        signal: bool,
    ) -> io::Result<()> {
        let inner = &self.inner;
        let sgl = inner.build_sgl(local, inner.caps.max_send_sge)?;
        let _sq = inner.sq.locked();
        let Some(peer) = inner.prepare_send(&sgl, wr_id, WcOpcode::Send, false)? else {
            return Ok(());
        };

        let mut data = Vec::new();
        for sge in &sgl {
            sge.gather(&mut data);
        }
        let origin = Origin {
            qp: Arc::downgrade(inner),
            wr_id,
            signal,
        };
        peer.deliver(data, imm, origin);
        Ok(())
    }

    /// Post an RDMA read request.
    ///
    /// The length of the read is the total length of `local`, starting at
    /// `remote.addr`. **NOTE:** This method has no mutable borrows to its
    /// parameters, but can cause the content of the buffers to be modified!
    pub fn read(
        &self,
        local: &[MrSlice],
        remote: &MrRemote,
        wr_id: WrId,
        signal: bool,
    ) -> io::Result<()> {
        let inner = &self.inner;
        let sgl = inner.build_sgl(local, inner.caps.max_send_sge)?;
        let _sq = inner.sq.locked();
        let Some(peer) = inner.prepare_send(&sgl, wr_id, WcOpcode::RdmaRead, true)? else {
            return Ok(());
        };

        let len: usize = sgl.iter().map(|sge| sge.len).sum();
        let status = match peer.resolve(remote, len, Permission::REMOTE_READ) {
            Ok((mr, offset)) => {
                let data = mr.mem()[offset..offset + len].to_vec();
                let mut copied = 0;
                for sge in &sgl {
                    copied += sge.scatter(&data[copied..]);
                }
                WcStatus::Success
            }
            Err(status) => status,
        };
        inner.complete_send(wr_id, signal, status, WcOpcode::RdmaRead, len);
        Ok(())
    }

    /// Post an RDMA write request.
    ///
    /// The length of the write is the total length of `local`, starting at
    /// `remote.addr`.
    pub fn write(
        &self,
        local: &[MrSlice],
        remote: &MrRemote,
        wr_id: WrId,
        signal: bool,
    ) -> io::Result<()> {
        let inner = &self.inner;
        let sgl = inner.build_sgl(local, inner.caps.max_send_sge)?;
        let _sq = inner.sq.locked();
        let Some(peer) = inner.prepare_send(&sgl, wr_id, WcOpcode::RdmaWrite, false)? else {
            return Ok(());
        };

        let mut data = Vec::new();
        for sge in &sgl {
            sge.gather(&mut data);
        }
        let status = match peer.resolve(remote, data.len(), Permission::REMOTE_WRITE) {
            Ok((mr, offset)) => {
                mr.mem()[offset..offset + data.len()].copy_from_slice(&data);
                WcStatus::Success
            }
            Err(status) => status,
        };
        inner.complete_send(wr_id, signal, status, WcOpcode::RdmaWrite, data.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        pd: Pd,
        cq_a: Cq,
        cq_b: Cq,
        a: Qp,
        b: Qp,
    }

    fn pair(caps: QpCaps) -> Pair {
        let ctx = Context::open(None);
        let pd = Pd::new(&ctx);
        let cq_a = Cq::new(&ctx, Cq::DEFAULT_CQ_DEPTH).unwrap();
        let cq_b = Cq::new(&ctx, Cq::DEFAULT_CQ_DEPTH).unwrap();
        let a = Qp::builder()
            .send_cq(&cq_a)
            .recv_cq(&cq_a)
            .caps(caps)
            .build(&pd)
            .unwrap();
        let b = Qp::builder()
            .send_cq(&cq_b)
            .recv_cq(&cq_b)
            .caps(caps)
            .build(&pd)
            .unwrap();
        Qp::connect_local(&a, &b).unwrap();
        Pair { pd, cq_a, cq_b, a, b }
    }

    #[test]
    fn test_build_checks() {
        let ctx = Context::open(None);
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        assert!(matches!(
            Qp::builder().send_cq(&cq).build(&pd),
            Err(QpCreationError::MissingCq("recv"))
        ));

        let other = Cq::new(&Context::open(Some("other")), 16).unwrap();
        assert!(matches!(
            Qp::builder().send_cq(&cq).recv_cq(&other).build(&pd),
            Err(QpCreationError::ForeignCq)
        ));

        let qp = Qp::builder().send_cq(&cq).recv_cq(&cq).build(&pd).unwrap();
        assert_eq!(qp.state(), QpState::Init);
        assert!(qp.peer_qpn().is_none());
    }

    #[test]
    fn test_send_recv() {
        let p = pair(QpCaps::default());
        let src = Mr::new_with_content(&p.pd, b"hello", Permission::default()).unwrap();
        let dst = Mr::new(&p.pd, 16).unwrap();

        p.b.recv(&[dst.as_slice()], 7).unwrap();
        p.a.send(&[src.as_slice()], Some(3), 8, true).unwrap();

        let wc = p.cq_b.poll_one().unwrap();
        assert_eq!((wc.wr_id(), wc.ok(), wc.imm()), (7, Ok(5), Some(3)));
        assert_eq!(&dst.mem()[..5], b"hello");
        let wc = p.cq_a.poll_one().unwrap();
        assert_eq!((wc.wr_id(), wc.opcode(), wc.status()), (8, WcOpcode::Send, WcStatus::Success));
    }

    #[test]
    fn test_rnr_buffering() {
        let p = pair(QpCaps::with_depth(1));
        let src = Mr::new_with_content(&p.pd, b"abc", Permission::default()).unwrap();
        let dst = Mr::new(&p.pd, 8).unwrap();

        p.a.send(&[src.as_slice()], None, 1, true).unwrap();
        assert!(p.cq_a.poll_one().is_none());

        p.a.send(&[src.as_slice()], None, 2, true).unwrap();
        let wc = p.cq_a.poll_one().unwrap();
        assert_eq!((wc.wr_id(), wc.status()), (2, WcStatus::RnrRetryExcErr));
        assert_eq!(p.a.state(), QpState::Error);

        p.b.recv(&[dst.as_slice()], 9).unwrap();
        assert_eq!(p.cq_b.poll_one().map(|wc| wc.ok()), Some(Ok(3)));
        assert_eq!(p.cq_a.poll_one().map(|wc| wc.status()), Some(WcStatus::Success));
        assert_eq!(&dst.mem()[..3], b"abc");
    }

    #[test]
    fn test_recv_too_small() {
        let p = pair(QpCaps::default());
        let src = Mr::new_with_content(&p.pd, &[1u8; 32], Permission::default()).unwrap();
        let dst = Mr::new(&p.pd, 8).unwrap();

        p.b.recv(&[dst.as_slice()], 1).unwrap();
        p.b.recv(&[dst.as_slice()], 2).unwrap();
        p.a.send(&[src.as_slice()], None, 3, false).unwrap();

        let wcs = p.cq_b.poll();
        assert_eq!(wcs[0].status(), WcStatus::LocLenErr);
        assert_eq!(wcs[1].status(), WcStatus::WrFlushErr);
        assert_eq!(p.cq_a.poll_one().map(|wc| wc.status()), Some(WcStatus::RemInvReqErr));
    }

    #[test]
    fn test_read_write() {
        let p = pair(QpCaps::default());
        let local = Mr::new(&p.pd, 8).unwrap();
        let remote = Mr::new_with_content(&p.pd, b"0123456789", Permission::default()).unwrap();

        p.a.read(&[local.as_slice()], &remote.as_remote(), 1, true).unwrap();
        assert_eq!(p.cq_a.poll_one().map(|wc| wc.ok()), Some(Ok(8)));
        assert_eq!(&local.mem()[..], b"01234567");

        local.mem().copy_from_slice(b"abcdefgh");
        let target = remote.as_remote().slice(2, 8).unwrap();
        p.a.write(&[local.slice(0, 4).unwrap()], &target, 2, false).unwrap();
        assert!(p.cq_a.poll_one().is_none());
        assert_eq!(&remote.mem()[..], b"01abcd6789");
    }

    #[test]
    fn test_remote_access_checks() {
        let p = pair(QpCaps::default());
        let local = Mr::new(&p.pd, 16).unwrap();
        let ro = Mr::with_perm(&p.pd, 16, Permission::REMOTE_READ).unwrap();

        p.a.write(&[local.as_slice()], &ro.as_remote(), 1, true).unwrap();
        assert_eq!(p.cq_a.poll_one().map(|wc| wc.status()), Some(WcStatus::RemAccessErr));
        assert_eq!(p.a.state(), QpState::Error);

        let p = pair(QpCaps::default());
        let local = Mr::new(&p.pd, 32).unwrap();
        let small = Mr::new(&p.pd, 16).unwrap();
        p.a.read(&[local.as_slice()], &small.as_remote(), 2, true).unwrap();
        assert_eq!(p.cq_a.poll_one().map(|wc| wc.status()), Some(WcStatus::RemAccessErr));

        let p = pair(QpCaps::default());
        let local = Mr::new(&p.pd, 16).unwrap();
        let gone = Mr::new(&p.pd, 16).unwrap().as_remote();
        p.a.read(&[local.as_slice()], &gone, 3, true).unwrap();
        assert_eq!(p.cq_a.poll_one().map(|wc| wc.status()), Some(WcStatus::RemAccessErr));
    }

    #[test]
    fn test_flush_on_error() {
        let p = pair(QpCaps::default());
        let buf = Mr::new(&p.pd, 16).unwrap();
        p.b.recv(&[buf.as_slice()], 1).unwrap();
        p.b.modify_to_error();
        assert_eq!(p.cq_b.poll_one().map(|wc| wc.status()), Some(WcStatus::WrFlushErr));

        p.b.recv(&[buf.as_slice()], 2).unwrap();
        assert_eq!(p.cq_b.poll_one().map(|wc| wc.status()), Some(WcStatus::WrFlushErr));

        p.a.send(&[buf.as_slice()], None, 3, true).unwrap();
        assert_eq!(p.cq_a.poll_one().map(|wc| wc.status()), Some(WcStatus::RetryExcErr));
    }

    #[test]
    fn test_peer_gone() {
        let p = pair(QpCaps::default());
        let buf = Mr::new(&p.pd, 16).unwrap();
        p.a.send(&[buf.as_slice()], None, 1, true).unwrap();
        drop(p.b);
        assert_eq!(p.cq_a.poll_one().map(|wc| wc.status()), Some(WcStatus::RetryExcErr));
        assert!(p.a.peer_qpn().is_none());
    }

    #[test]
    fn test_recv_queue_full() {
        let p = pair(QpCaps::with_depth(1));
        let buf = Mr::new(&p.pd, 16).unwrap();
        p.b.recv(&[buf.as_slice()], 1).unwrap();
        let err = p.b.recv(&[buf.as_slice()], 2).unwrap_err();
        assert_eq!(err.kind(), IoErrorKind::OutOfMemory);
    }
}
