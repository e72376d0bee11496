use std::sync::Arc;

use super::{Mr, MrInner};

/// Slice of a local memory region.
///
/// A slice corresponds to an RDMA scatter-gather list entry, which can be used
/// in RDMA data-plane verbs.
#[derive(Clone, Copy)]
pub struct MrSlice<'a> {
    mr: &'a Mr,
    offset: usize,
    len: usize,
}

impl<'a> MrSlice<'a> {
    /// Create a new memory region slice of the given MR, offset, and length.
    pub(crate) fn new(mr: &'a Mr, offset: usize, len: usize) -> Self {
        Self { mr, offset, len }
    }

    /// Get the underlying `Mr`.
    #[inline]
    pub fn mr(&self) -> &'a Mr {
        self.mr
    }

    /// Get the offset of this slice in the memory region.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Get the virtual address of the start of this slice.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.mr.addr() + self.offset as u64
    }

    /// Get the length of this slice.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Attempt to resize the memory region slice to the specified length.
    /// This attempt has no effect if the desired length is greater
    /// than the largest possible length of the slice.
    /// Return whether the resize was successful.
    #[must_use = "must check if the resize was successful"]
    #[inline]
    pub fn resize(&mut self, len: usize) -> bool {
        let max_len = self.mr.len() - self.offset;
        if len <= max_len {
            self.len = len;
            true
        } else {
            false
        }
    }

    /// Turn this slice into an owned scatter/gather entry.
    pub(crate) fn to_sge(&self) -> Sge {
        Sge {
            mr: self.mr.inner.clone(),
            offset: self.offset,
            len: self.len,
        }
    }
}

/// Scatter/gather entry captured by a posted work request.
///
/// Holding the region alive until the work request executes keeps the
/// registration valid for the duration of the operation.
#[derive(Clone)]
pub(crate) struct Sge {
    pub mr: Arc<MrInner>,
    pub offset: usize,
    pub len: usize,
}

impl Sge {
    /// Gather the bytes this entry covers.
    pub fn gather(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.mr.mem()[self.offset..self.offset + self.len]);
    }

    /// Scatter `data` into this entry, returning the number of bytes consumed.
    pub fn scatter(&self, data: &[u8]) -> usize {
        let n = data.len().min(self.len);
        self.mr.mem()[self.offset..self.offset + n].copy_from_slice(&data[..n]);
        n
    }
}
