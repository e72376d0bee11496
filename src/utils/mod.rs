/// Poison-tolerant wrappers around the standard lock types.
pub(crate) mod sync;
