//! A synchronous RPC transport over RDMA.
//!
//! A [`Client`] invokes numbered procedures on a [`Server`]. Request and
//! response payloads never travel in a two-sided message: the client only
//! sends a small descriptor of the buffer that holds the request, and the
//! server moves the payloads with one-sided RDMA reads and writes. The number
//! of calls in flight on one connection is bounded by a fixed pool of
//! contexts, so callers block instead of overrunning the queues.
//!
//! The verbs layer lives in [`rdma`]. It follows the shape of `ibverbs`
//! with safe `Arc`-based types ([`Context`](rdma::context::Context),
//! [`Pd`](rdma::pd::Pd), [`Cq`](rdma::cq::Cq), [`Mr`](rdma::mr::Mr), and
//! [`Qp`](rdma::qp::Qp)) that should be viewed as references to the
//! underlying resources, plus a connection manager in [`rdma::cm`]. The
//! provider executes work requests in-process, so connections are formed
//! between endpoints of the same process.
//!
//! # Example
//!
//! ```rust
//! use std::io::Write;
//! use std::sync::Arc;
//! use std::thread;
//! use std::time::Duration;
//!
//! use rdmarpc::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let server = Arc::new(Server::new("127.0.0.1", "0"));
//!     server.register_handler(1, |req, resp| {
//!         resp.write_all(req)?;
//!         Ok(())
//!     });
//!     let runner = thread::spawn({
//!         let server = server.clone();
//!         move || server.run()
//!     });
//!     let addr = server
//!         .wait_listening(Duration::from_secs(1))
//!         .expect("server listens");
//!
//!     let client = Client::new();
//!     let conn = client.connect("127.0.0.1", &addr.port().to_string())?;
//!     assert_eq!(client.call(conn, 1, b"hello")?, b"hello");
//!
//!     server.shutdown_handle().shutdown();
//!     runner.join().unwrap()?;
//!     Ok(())
//! }
//! ```

pub mod prelude;
pub mod rdma;
pub mod rpc;

mod utils;

pub use rpc::{Client, Server};
