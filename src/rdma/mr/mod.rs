mod mr_slice;
mod perm;
mod remote;

use std::fmt;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) use self::mr_slice::Sge;
pub use self::mr_slice::MrSlice;
pub use self::perm::*;
pub use self::remote::*;
use super::pd::Pd;
use super::type_alias::*;
use crate::utils::sync::LockExt;

/// Registered memory shared between a region handle and in-flight work
/// requests.
pub(crate) struct MrInner {
    pd: Pd,
    addr: u64,
    len: usize,
    lkey: LKey,
    rkey: RKey,
    perm: Permission,
    buf: Mutex<Box<[u8]>>,
}

impl MrInner {
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    #[inline]
    pub fn rkey(&self) -> RKey {
        self.rkey
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn perm(&self) -> Permission {
        self.perm
    }

    #[inline]
    pub fn mem(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.buf.locked()
    }

    /// Translate a remote virtual address range into an offset of this region.
    pub fn offset_of(&self, addr: u64, len: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.addr)? as usize;
        let end = offset.checked_add(len)?;
        (end <= self.len()).then_some(offset)
    }
}

impl Drop for MrInner {
    fn drop(&mut self) {
        self.pd.deregister(self.rkey);
    }
}

/// Local memory region.
///
/// A memory region is a virtual memory space registered to the RDMA device.
/// The memory is owned by the region and is deregistered from its protection
/// domain when the last handle is dropped. Work requests in flight keep the
/// region alive until they complete.
pub struct Mr {
    pub(crate) inner: Arc<MrInner>,
}

impl fmt::Debug for Mr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .field("rkey", &self.rkey())
            .finish()
    }
}

impl Mr {
    /// Register a zero-filled memory region of `len` bytes with default permissions.
    pub fn new(pd: &Pd, len: usize) -> io::Result<Self> {
        Self::with_perm(pd, len, Permission::default())
    }

    /// Register a zero-filled memory region of `len` bytes with the given permissions.
    pub fn with_perm(pd: &Pd, len: usize, perm: Permission) -> io::Result<Self> {
        Self::reg(pd, vec![0u8; len].into_boxed_slice(), perm)
    }

    /// Register a memory region initialized with `content`.
    pub fn new_with_content(pd: &Pd, content: &[u8], perm: Permission) -> io::Result<Self> {
        Self::reg(pd, content.to_vec().into_boxed_slice(), perm)
    }

    fn reg(pd: &Pd, buf: Box<[u8]>, perm: Permission) -> io::Result<Self> {
        let max = pd.context().attr().max_mr_size;
        if buf.len() > max {
            return Err(IoError::new(
                IoErrorKind::OutOfMemory,
                format!("MR size {} exceeds device limit {}", buf.len(), max),
            ));
        }

        let ctx = pd.context();
        let key = ctx.alloc_key();
        let inner = Arc::new(MrInner {
            pd: pd.clone(),
            addr: ctx.alloc_addr(buf.len()),
            len: buf.len(),
            lkey: key,
            rkey: key,
            perm,
            buf: Mutex::new(buf),
        });
        pd.register(key, &inner);
        log::trace!(
            "registered MR rkey={} addr={:#x} len={}",
            key,
            inner.addr,
            inner.len()
        );
        Ok(Self { inner })
    }

    /// Get the protection domain the region is registered to.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.inner.pd
    }

    /// Get the start address of the registered memory area.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.inner.addr
    }

    /// Get the length of the registered memory area.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> LKey {
        self.inner.lkey
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> RKey {
        self.inner.rkey
    }

    /// Get the permissions of the memory region.
    #[inline]
    pub fn perm(&self) -> Permission {
        self.inner.perm
    }

    /// Lock the registered memory area for direct access.
    ///
    /// The guard must not be held while posting work requests that touch
    /// this region.
    #[inline]
    pub fn mem(&self) -> MrMem<'_> {
        MrMem(self.inner.mem())
    }

    /// Get a slice covering the whole memory region.
    #[inline]
    pub fn as_slice(&self) -> MrSlice<'_> {
        MrSlice::new(self, 0, self.len())
    }

    /// Get a slice of the memory region, or `None` if it is out of bounds.
    pub fn slice(&self, offset: usize, len: usize) -> Option<MrSlice<'_>> {
        let end = offset.checked_add(len)?;
        (end <= self.len()).then(|| MrSlice::new(self, offset, len))
    }

    /// View this local memory region as a remote memory region for RDMA access
    /// from remote peers.
    #[inline]
    pub fn as_remote(&self) -> MrRemote {
        MrRemote {
            addr: self.addr(),
            len: self.len(),
            rkey: self.rkey(),
        }
    }
}

/// Locked view of a memory region's bytes.
pub struct MrMem<'a>(MutexGuard<'a, Box<[u8]>>);

impl Deref for MrMem<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for MrMem<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}
