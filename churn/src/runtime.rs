//! Run-time orchestration: the event-driven controller and its errors.

pub mod controller;

pub use controller::{Controller, HarnessError, RunStats};
