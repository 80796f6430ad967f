//! Discrete-event session-churn harness.
//!
//! Drives many external client/server processes through a stochastic
//! join/leave workload. Three pieces:
//!
//! - [`timing`]: a delta-encoded timer list where the wait until the
//!   next due event is always one subtraction away.
//! - [`topology`]: a capacity-bounded multi-level fan-out tree builder
//!   connecting an arbitrary number of leaf endpoints.
//! - [`runtime`]: the single-threaded controller multiplexing timer
//!   expiry against line output from all live session processes with
//!   one blocking wait per iteration.
//!
//! The emulation substrate, the protocol the session binaries speak,
//! and the CSV post-processing are external; the controller reaches
//! them only through the seams in [`session`] and [`sink`].

pub mod config;
pub mod process;
pub mod runtime;
pub mod session;
pub mod sink;
pub mod timing;
pub mod topology;

mod trace;

pub use trace::init_tracing;
