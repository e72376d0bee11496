//! Wire formats of the buffer handshake.
//!
//! A request travels as a [`RequestDescriptor`] sent over a two-sided send:
//! the procedure id plus a [`BufferMeta`] naming the client buffer that holds
//! the request bytes. The server pulls the request with an RDMA read, writes
//! the response back into the same buffer with an RDMA write, and finishes
//! with a [`Notification`] send. All integers are little-endian.

use serde::{Deserialize, Serialize};

use super::error::RpcError;
use crate::rdma::mr::MrRemote;
use crate::rdma::type_alias::RKey;

/// Descriptor of a registered buffer that the peer may access remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferMeta {
    pub addr: u64,
    pub rkey: RKey,
    pub len: u32,
}

impl BufferMeta {
    /// View the buffer as remote memory for one-sided verbs.
    #[inline]
    pub fn as_remote(&self) -> MrRemote {
        MrRemote::new(self.addr, self.len as usize, self.rkey)
    }
}

/// Request descriptor, sent from client to server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub rpc_id: u32,
    pub meta: BufferMeta,
}

impl RequestDescriptor {
    /// Encoded size in bytes.
    pub const SIZE: usize = 24;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.rpc_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.meta.addr.to_le_bytes());
        buf[12..16].copy_from_slice(&self.meta.rkey.to_le_bytes());
        buf[16..20].copy_from_slice(&self.meta.len.to_le_bytes());
        // 20..24 reserved
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        if buf.len() != Self::SIZE {
            return Err(RpcError::Protocol(format!(
                "request descriptor of {} bytes, expected {}",
                buf.len(),
                Self::SIZE
            )));
        }
        Ok(Self {
            rpc_id: le_u32(&buf[0..4]),
            meta: BufferMeta {
                addr: le_u64(&buf[4..12]),
                rkey: le_u32(&buf[12..16]),
                len: le_u32(&buf[16..20]),
            },
        })
    }
}

/// Outcome of a call as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseStatus {
    Ok = 0,
    UnknownProcedure = 1,
    HandlerFault = 2,
    RequestTooLarge = 3,
    ResponseTooLarge = 4,
}

impl TryFrom<u32> for ResponseStatus {
    type Error = RpcError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::UnknownProcedure,
            2 => Self::HandlerFault,
            3 => Self::RequestTooLarge,
            4 => Self::ResponseTooLarge,
            x => return Err(RpcError::Protocol(format!("unknown response status {}", x))),
        })
    }
}

/// Response-ready notification, sent from server to client after the
/// response has been written into the client's buffer.
///
/// On a non-`Ok` status the written payload is a UTF-8 error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub status: ResponseStatus,
    pub len: u32,
}

impl Notification {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&(self.status as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        if buf.len() != Self::SIZE {
            return Err(RpcError::Protocol(format!(
                "notification of {} bytes, expected {}",
                buf.len(),
                Self::SIZE
            )));
        }
        Ok(Self {
            status: ResponseStatus::try_from(le_u32(&buf[0..4]))?,
            len: le_u32(&buf[4..8]),
        })
    }
}

/// Connection parameters carried as connect-request private data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParams {
    /// Size of each client context buffer.
    pub buffer_size: usize,

    /// Number of client contexts, bounding outstanding requests.
    pub max_context_num: usize,
}

impl ConnParams {
    pub fn to_private_data(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_private_data(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

fn le_u32(b: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(b);
    u32::from_le_bytes(raw)
}

fn le_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_layout() {
        let desc = RequestDescriptor {
            rpc_id: 0x0102_0304,
            meta: BufferMeta {
                addr: 0x1122_3344_5566_7788,
                rkey: 0xAABB_CCDD,
                len: 5,
            },
        };
        let raw = desc.encode();
        assert_eq!(&raw[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(raw[4], 0x88);
        assert_eq!(&raw[16..24], &[5, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(RequestDescriptor::decode(&raw).unwrap(), desc);
        assert!(matches!(
            RequestDescriptor::decode(&raw[..20]),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn test_notification_status() {
        let raw = Notification {
            status: ResponseStatus::UnknownProcedure,
            len: 12,
        }
        .encode();
        assert_eq!(raw, [1, 0, 0, 0, 12, 0, 0, 0]);

        let mut bad = raw;
        bad[0] = 9;
        assert!(matches!(Notification::decode(&bad), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_conn_params() {
        let params = ConnParams {
            buffer_size: 4096,
            max_context_num: 8,
        };
        let data = params.to_private_data().unwrap();
        assert!(data.len() <= crate::rdma::cm::MAX_PRIVATE_DATA);
        assert_eq!(ConnParams::from_private_data(&data).unwrap(), params);
        assert!(ConnParams::from_private_data(b"garbage").is_err());
    }

    #[test]
    fn test_params_error_surfaces() {
        let err = ConnParams::from_private_data(b"{").unwrap_err();
        assert!(matches!(
            crate::rpc::error::ConnectError::from(err),
            crate::rpc::error::ConnectError::Params(_)
        ));
    }
}
