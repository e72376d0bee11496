//! Connection/context plumbing shared by both ends.
//!
//! A connection owns one QP and one CQ, and a fixed array of contexts.
//! Every work request a context posts is tagged with the context's slot
//! index and its current epoch; a per-connection poller thread routes each
//! completion back to the context that posted it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::rdma::cm::CmId;
use crate::rdma::cq::{Cq, Wc};
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCaps};
use crate::rdma::type_alias::WrId;

use super::error::ConnectError;

/// Depth of each connection's send and receive queues.
pub const QUEUE_DEPTH: usize = 32;

/// How long the poller sleeps on an idle CQ before re-checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Work request tag: the posting slot and its epoch.
///
/// A slot's epoch advances every time the slot returns to `Vacant`, so
/// completions left over from an earlier exchange (e.g. flushes after an
/// error) can be told apart from those of the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrTag {
    pub slot: u32,
    pub epoch: u32,
}

impl WrTag {
    #[inline]
    pub fn new(slot: u32, epoch: u32) -> Self {
        Self { slot, epoch }
    }
}

impl From<WrTag> for WrId {
    #[inline]
    fn from(tag: WrTag) -> Self {
        ((tag.epoch as u64) << 32) | tag.slot as u64
    }
}

impl From<WrId> for WrTag {
    #[inline]
    fn from(wr_id: WrId) -> Self {
        Self {
            slot: wr_id as u32,
            epoch: (wr_id >> 32) as u32,
        }
    }
}

/// Per-slot protocol state machine.
pub trait ConnCtx: Send + Sync {
    type Conn: Conn<Ctx = Self>;

    /// Advance on one completion of a work request this context posted.
    ///
    /// Called from the poller thread only, and serially for each connection.
    fn advance(&self, conn: &Arc<Self::Conn>, tag: WrTag, wc: &Wc);
}

/// Connection owning a QP and a fixed set of contexts.
pub trait Conn: Send + Sync + Sized + 'static {
    type Ctx: ConnCtx<Conn = Self>;

    /// The queue pair of this connection.
    fn qp(&self) -> &Qp;

    /// The contexts of this connection, indexed by slot.
    fn contexts(&self) -> &[Self::Ctx];

    /// Handle a completion whose slot is not a context, i.e. a work request
    /// the connection posted on its own behalf.
    fn advance_conn(self: &Arc<Self>, tag: WrTag, wc: &Wc) {
        log::warn!(
            "completion for unknown slot {} (epoch {}): {:?}",
            tag.slot,
            tag.epoch,
            wc
        );
    }
}

/// Route a completion to the context that posted its work request.
pub fn dispatch<C: Conn>(conn: &Arc<C>, wc: &Wc) {
    let tag = WrTag::from(wc.wr_id());
    log::trace!("completion {:?} for slot {} epoch {}", wc, tag.slot, tag.epoch);
    match conn.contexts().get(tag.slot as usize) {
        Some(ctx) => ctx.advance(conn, tag, wc),
        None => conn.advance_conn(tag, wc),
    }
}

/// Per-connection CQ polling thread.
pub struct Poller {
    stop: Arc<AtomicBool>,
    cq: Cq,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Spawn a thread that polls `cq` and dispatches completions into `conn`.
    pub fn spawn<C: Conn>(name: String, cq: Cq, conn: Arc<C>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new().name(name).spawn({
            let stop = stop.clone();
            let cq = cq.clone();
            move || {
                while !stop.load(Ordering::Acquire) {
                    if let Some(wc) = cq.poll_one_timeout(POLL_INTERVAL) {
                        dispatch(&conn, &wc);
                    }
                }

                // Deliver whatever was completed before the stop request,
                // typically the flushes of a disconnect.
                while let Some(wc) = cq.poll_one() {
                    dispatch(&conn, &wc);
                }
            }
        })?;

        Ok(Self {
            stop,
            cq,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        self.cq.wake();
        if handle.join().is_err() {
            log::error!("poller thread panicked");
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create the CQ and QP of a connection on a CM identifier.
pub fn create_link(id: &CmId, pd: &Pd) -> Result<(Cq, Qp), ConnectError> {
    let cq = Cq::new(pd.context(), Cq::DEFAULT_CQ_DEPTH)?;
    let qp = id.create_qp(pd, &cq, &cq, QpCaps::with_depth(QUEUE_DEPTH as u32))?;
    Ok((cq, qp))
}
