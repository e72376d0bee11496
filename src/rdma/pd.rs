use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use super::context::Context;
use super::mr::MrInner;
use super::type_alias::*;
use crate::utils::sync::LockExt;

struct PdInner {
    ctx: Context,

    /// Memory regions registered under this domain, keyed by remote key.
    regions: Mutex<HashMap<RKey, Weak<MrInner>>>,
}

/// Protection domain.
///
/// This type is a simple wrapper of an `Arc`. Memory regions and queue pairs
/// created under the same protection domain may be used together; one-sided
/// accesses from a peer resolve remote keys against the domain of the
/// targeted queue pair.
#[derive(Clone)]
#[repr(transparent)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl fmt::Debug for Pd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Pd<{:p}>", Arc::as_ptr(&self.inner)))
    }
}

impl Pd {
    /// Allocate a protection domain on the given device.
    pub fn new(ctx: &Context) -> Self {
        Self {
            inner: Arc::new(PdInner {
                ctx: ctx.clone(),
                regions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Check whether two handles refer to the same protection domain.
    #[inline]
    pub fn same_as(&self, other: &Pd) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of memory regions currently registered under this domain.
    pub fn num_regions(&self) -> usize {
        self.inner.regions.locked().len()
    }

    pub(crate) fn register(&self, rkey: RKey, mr: &Arc<MrInner>) {
        self.inner.regions.locked().insert(rkey, Arc::downgrade(mr));
    }

    pub(crate) fn deregister(&self, rkey: RKey) {
        self.inner.regions.locked().remove(&rkey);
    }

    /// Resolve a remote key into a live memory region.
    pub(crate) fn lookup(&self, rkey: RKey) -> Option<Arc<MrInner>> {
        self.inner.regions.locked().get(&rkey).and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc() {
        let ctx = Context::open(None);
        let pd = Pd::new(&ctx);
        assert!(pd.context().same_as(&ctx));
        assert_eq!(pd.num_regions(), 0);
    }
}
