use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use std::sync::{Arc, RwLock};

use crate::rpc::error::RpcError;
use crate::utils::sync::RwLockExt;

/// Error a handler may return. Its message is sent back to the caller.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Request handler: reads the request bytes and writes the response.
pub type Handler =
    Arc<dyn Fn(&[u8], &mut ResponseBuf<'_>) -> Result<(), HandlerError> + Send + Sync>;

/// Procedure id to handler map, shared by the server and its connections.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<u32, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `rpc_id`, returning the handler it replaces.
    pub fn register(&self, rpc_id: u32, handler: Handler) -> Option<Handler> {
        let old = self.handlers.write_locked().insert(rpc_id, handler);
        if old.is_some() {
            log::debug!("handler for procedure {} replaced", rpc_id);
        }
        old
    }

    pub fn get(&self, rpc_id: u32) -> Result<Handler, RpcError> {
        self.handlers
            .read_locked()
            .get(&rpc_id)
            .cloned()
            .ok_or(RpcError::UnknownProcedure(rpc_id))
    }

    pub fn len(&self) -> usize {
        self.handlers.read_locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Response writer handed to handlers.
///
/// Writes go straight into the registered buffer the response is sent from.
/// The capacity is the smaller of the two ends' buffer sizes; writing past
/// it fails the call with a response-too-large error.
pub struct ResponseBuf<'a> {
    buf: &'a mut [u8],
    len: usize,
    overflowed: bool,
}

impl<'a> ResponseBuf<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            len: 0,
            overflowed: false,
        }
    }

    /// Number of response bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Largest response that fits.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Whether a write did not fit.
    #[inline]
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// The whole buffer, for handlers that serialize in place. Pair with
    /// [`ResponseBuf::set_len`].
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buf
    }

    /// Set the response length after writing through
    /// [`ResponseBuf::buffer_mut`].
    ///
    /// A length beyond the capacity marks the response as overflowed.
    pub fn set_len(&mut self, len: usize) {
        if len > self.buf.len() {
            self.overflowed = true;
            self.len = self.buf.len();
        } else {
            self.len = len;
        }
    }

    /// The bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl io::Write for ResponseBuf<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.buf.len() - self.len;
        if data.len() > room {
            self.overflowed = true;
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("response exceeds {} bytes", self.buf.len()),
            ));
        }
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn reply_with(msg: &'static str) -> Handler {
        Arc::new(move |_: &[u8], resp: &mut ResponseBuf<'_>| -> Result<(), HandlerError> {
            resp.write_all(msg.as_bytes())?;
            Ok(())
        })
    }

    #[test]
    fn test_register_overwrites() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(registry.get(1), Err(RpcError::UnknownProcedure(1))));

        assert!(registry.register(1, reply_with("first")).is_none());
        assert!(registry.register(1, reply_with("second")).is_some());
        assert_eq!(registry.len(), 1);

        let mut raw = [0u8; 16];
        let mut resp = ResponseBuf::new(&mut raw);
        (registry.get(1).unwrap())(b"", &mut resp).unwrap();
        assert_eq!(resp.as_bytes(), b"second");
    }

    #[test]
    fn test_response_buf_bounds() {
        let mut raw = [0u8; 4];
        let mut resp = ResponseBuf::new(&mut raw);
        resp.write_all(b"abc").unwrap();
        assert!(!resp.overflowed());
        assert!(resp.write_all(b"de").is_err());
        assert!(resp.overflowed());
        assert_eq!(resp.as_bytes(), b"abc");

        let mut raw = [0u8; 4];
        let mut resp = ResponseBuf::new(&mut raw);
        resp.buffer_mut()[..2].copy_from_slice(b"hi");
        resp.set_len(2);
        assert_eq!(resp.as_bytes(), b"hi");
        resp.set_len(5);
        assert!(resp.overflowed());
    }
}
