//! Software RDMA verbs.
//!
//! This module mirrors the `ibverbs` object model (device context, protection
//! domain, memory region, completion queue, and queue pair) plus an
//! `rdma_cm`-style connection manager, and executes work requests
//! in-process. Work requests run to completion at post time, so completions
//! are observable on the CQ as soon as the posting call returns.
//!
//! Semantics kept from reliable-connected hardware:
//!
//! - every signaled work request yields exactly one work completion;
//!   unsignaled ones yield a completion only on error,
//! - work requests on one QP execute in post order,
//! - a send that finds no posted receive waits for one (RNR retry),
//! - one-sided accesses are checked against the remote key, bounds, and
//!   permission of the target memory region,
//! - an error completion moves the QP into the error state, flushing every
//!   outstanding and future receive.

pub mod cm;
pub mod context;
pub mod cq;
pub mod mr;
pub mod pd;
pub mod qp;
pub mod type_alias;
