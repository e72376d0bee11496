use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::type_alias::*;

/// Device attributes.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAttr {
    /// Maximum number of outstanding work requests on any queue.
    pub max_qp_wr: u32,

    /// Maximum number of scatter/gather entries per work request.
    pub max_sge: u32,

    /// Maximum number of entries in a completion queue.
    pub max_cqe: u32,

    /// Largest memory region that can be registered.
    pub max_mr_size: usize,
}

impl Default for DeviceAttr {
    fn default() -> Self {
        Self {
            max_qp_wr: 16384,
            max_sge: 16,
            max_cqe: 65536,
            max_mr_size: 1 << 30,
        }
    }
}

struct ContextInner {
    name: String,
    attr: DeviceAttr,

    /// Next memory region key.
    next_key: AtomicU32,

    /// Next virtual address handed to a memory region.
    next_addr: AtomicU64,

    /// Next queue pair number.
    next_qpn: AtomicU32,
}

/// Device context.
///
/// This type is a simple wrapper of an `Arc`. Cloning it yields another
/// handle to the same opened device.
#[derive(Clone)]
#[repr(transparent)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Context {
    /// Name of the device opened when none is specified.
    pub const DEFAULT_DEVICE: &'static str = "srdma0";

    /// Page granularity of the virtual addresses handed to memory regions.
    const PAGE_SIZE: u64 = 4096;

    /// Open a software device with default attributes.
    ///
    /// If `dev_name` is `None`, the device is named [`Self::DEFAULT_DEVICE`].
    pub fn open(dev_name: Option<&str>) -> Self {
        Self::open_with_attr(dev_name, DeviceAttr::default())
    }

    /// Open a software device with the given attributes.
    pub fn open_with_attr(dev_name: Option<&str>, attr: DeviceAttr) -> Self {
        let name = dev_name.unwrap_or(Self::DEFAULT_DEVICE).to_owned();
        log::debug!("opened software RDMA device {}", name);
        Self {
            inner: Arc::new(ContextInner {
                name,
                attr,
                next_key: AtomicU32::new(0x100),
                next_addr: AtomicU64::new(0x7f00_0000_0000),
                next_qpn: AtomicU32::new(0x10),
            }),
        }
    }

    /// Get the device name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the device attributes.
    #[inline]
    pub fn attr(&self) -> &DeviceAttr {
        &self.inner.attr
    }

    /// Allocate a fresh memory region key.
    pub(crate) fn alloc_key(&self) -> RKey {
        self.inner.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a page-aligned virtual address range of the given length.
    pub(crate) fn alloc_addr(&self, len: usize) -> u64 {
        let span = (len as u64).max(1).div_ceil(Self::PAGE_SIZE) * Self::PAGE_SIZE;
        self.inner.next_addr.fetch_add(span, Ordering::Relaxed)
    }

    /// Allocate a fresh queue pair number.
    pub(crate) fn alloc_qpn(&self) -> Qpn {
        self.inner.next_qpn.fetch_add(1, Ordering::Relaxed)
    }

    /// Check whether two handles refer to the same device.
    #[inline]
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
