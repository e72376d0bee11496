mod wc;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

pub use self::wc::*;
use super::context::Context;
use crate::utils::sync::{CondvarExt, LockExt};

struct CqInner {
    ctx: Context,
    capacity: u32,
    queue: Mutex<VecDeque<Wc>>,
    cond: Condvar,
}

/// Completion queue.
///
/// This type is a simple wrapper of an `Arc` and is guaranteed to have the
/// same memory layout with it. Queue pairs hold clones of the CQs they report
/// to, so a CQ lives as long as any of its users.
#[derive(Clone)]
#[repr(transparent)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl fmt::Debug for Cq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Cq<{:p}>", Arc::as_ptr(&self.inner)))
    }
}

impl Cq {
    /// Default CQ depth.
    pub const DEFAULT_CQ_DEPTH: u32 = 128;

    /// Create a new completion queue.
    pub fn new(ctx: &Context, capacity: u32) -> Result<Cq, CqCreationError> {
        if capacity == 0 {
            return Err(CqCreationError::ZeroCapacity);
        }
        let max_capacity = ctx.attr().max_cqe;
        if capacity > max_capacity {
            return Err(CqCreationError::TooManyCqes(max_capacity));
        }

        Ok(Self {
            inner: Arc::new(CqInner {
                ctx: ctx.clone(),
                capacity,
                queue: Mutex::new(VecDeque::with_capacity(capacity as usize)),
                cond: Condvar::new(),
            }),
        })
    }

    /// Get the underlying [`Context`].
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Get the capacity of the completion queue.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Get the number of completions currently queued.
    pub fn pending(&self) -> usize {
        self.inner.queue.locked().len()
    }

    /// Non-blockingly poll as many completions as the CQ capacity.
    #[inline]
    pub fn poll(&self) -> Vec<Wc> {
        self.poll_some(self.capacity())
    }

    /// Non-blockingly poll at most `num` completions.
    pub fn poll_some(&self, num: u32) -> Vec<Wc> {
        let mut queue = self.inner.queue.locked();
        let n = queue.len().min(num as usize);
        queue.drain(..n).collect()
    }

    /// Non-blockingly poll one completion.
    #[inline]
    pub fn poll_one(&self) -> Option<Wc> {
        self.inner.queue.locked().pop_front()
    }

    /// Block until one completion is available and return it.
    pub fn poll_one_blocking(&self) -> Wc {
        let mut queue = self.inner.queue.locked();
        loop {
            if let Some(wc) = queue.pop_front() {
                return wc;
            }
            queue = self.inner.cond.wait_locked(queue);
        }
    }

    /// Wait at most `timeout` for a completion.
    ///
    /// Returns `None` on timeout, and may also return `None` early if the
    /// CQ is [woken](Self::wake) with nothing queued.
    pub fn poll_one_timeout(&self, timeout: Duration) -> Option<Wc> {
        let queue = self.inner.queue.locked();
        let (mut queue, _) = if queue.is_empty() {
            self.inner.cond.wait_timeout_locked(queue, timeout)
        } else {
            (queue, false)
        };
        queue.pop_front()
    }

    /// Wake every thread blocked in a polling call on this CQ.
    pub fn wake(&self) {
        let _queue = self.inner.queue.locked();
        self.inner.cond.notify_all();
    }

    /// Check whether two handles refer to the same completion queue.
    #[inline]
    pub fn same_as(&self, other: &Cq) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Append a completion.
    pub(crate) fn push(&self, wc: Wc) {
        let mut queue = self.inner.queue.locked();
        if queue.len() >= self.inner.capacity as usize {
            log::error!(
                "CQ overrun (capacity {}), completion {:?} is still queued",
                self.inner.capacity,
                wc
            );
        }
        queue.push_back(wc);
        self.inner.cond.notify_all();
    }
}

/// Completion queue creation error type.
#[derive(Debug, Error)]
pub enum CqCreationError {
    /// The capacity of the CQ is zero.
    #[error("CQ capacity must be non-zero")]
    ZeroCapacity,

    /// The capacity of the CQ is larger than the device's maximum allowed
    /// capacity, which is contained in the error.
    #[error("CQ capacity too large (maximum: {0})")]
    TooManyCqes(u32),
}
