//! Timing primitives: signed delays, the clock seam, and the
//! delta-encoded timer list driving the controller's event loop.

mod queue;
mod time;

pub use queue::DeltaTimerQueue;
pub use time::{Clock, Delta, MonoClock};
