use std::fmt;

use thiserror::Error;

use crate::rdma::type_alias::*;

/// Opcode of a completion queue entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    Send,
    /// RDMA write request.
    RdmaWrite,
    /// RDMA read request.
    RdmaRead,
    /// Receive request.
    Recv,
}

/// Status of a completion queue entry.
///
/// The documentation and error messages are heavily borrowed from [RDMAmojo](https://www.rdmamojo.com/2013/02/15/ibv_poll_cq/).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// **Operation completed successfully:** this means that the corresponding
    /// Work Request (and all of the unsignaled Work Requests that were posted
    /// previous to it) ended and the memory buffers that this Work Request
    /// refers to are ready to be (re)used.
    #[error("success")]
    Success = 0,

    /// **Local Length Error:** a Work Request posted in a local Receive Queue
    /// isn't big enough for holding the incoming message, or a local Send
    /// Queue Work Request exceeds the maximum message size.
    #[error("local length error")]
    LocLenErr = 1,

    /// **Local QP Operation Error:** an internal QP consistency error was
    /// detected while processing this Work Request.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// **Local Protection Error:** the locally posted Work Request’s buffers
    /// in the scatter/gather list does not reference a Memory Region that is
    /// valid for the requested operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// **Work Request Flushed Error:** a Work Request was in process or
    /// outstanding when the QP transitioned into the Error State.
    #[error("WR flush error")]
    WrFlushErr = 5,

    /// **Remote Invalid Request Error:** the responder detected an invalid message
    /// on the channel, e.g. insufficient buffering to receive a new request.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// **Remote Access Error:** a protection error occurred on a remote data
    /// buffer to be read by an RDMA Read, written by an RDMA Write or accessed
    /// by an atomic operation. This error is reported only on RDMA operations
    /// or atomic operations.
    #[error("remote access error")]
    RemAccessErr = 10,

    /// **Remote Operation Error:** the operation could not be completed
    /// successfully by the responder.
    #[error("remote operation error")]
    RemOpErr = 11,

    /// **Transport Retry Counter Exceeded:** the local transport timeout retry
    /// counter was exceeded while trying to send this message. This means that
    /// the remote side didn't send any Ack or Nack.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// **RNR Retry Counter Exceeded:** the RNR NAK retry count was exceeded.
    /// This usually means that the remote side didn't post any WR to its
    /// Receive Queue.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    /// **General Error:** other error which isn't one of the above errors.
    #[error("general error")]
    GeneralErr = 21,
}

/// Work completion entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Wc {
    wr_id: WrId,
    status: WcStatus,
    opcode: WcOpcode,
    byte_len: u32,
    imm: Option<ImmData>,
}

impl Wc {
    pub(crate) fn new(wr_id: WrId, status: WcStatus, opcode: WcOpcode, byte_len: usize) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len: byte_len as u32,
            imm: None,
        }
    }

    pub(crate) fn with_imm(mut self, imm: Option<ImmData>) -> Self {
        self.imm = imm;
        self
    }

    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Get the completion status as a `Result`.
    ///
    /// - If the status is `Success`, return the number of bytes processed or transferred.
    /// - Otherwise, return an error.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status() {
            WcStatus::Success => Ok(self.bytes()),
            _ => Err(self.status()),
        }
    }

    /// Get the opcode of the work request.
    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Get the number of bytes processed or transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.byte_len as usize
    }

    /// Get the immediate data.
    #[inline]
    pub fn imm(&self) -> Option<ImmData> {
        self.imm
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id())
            .field("status", &self.status())
            .field("opcode", &self.opcode())
            .finish()
    }
}
