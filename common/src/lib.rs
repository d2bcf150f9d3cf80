//! Shared infrastructure for the bridge workspace.

pub mod clock;
pub mod lookback;

pub use clock::{Clock, MockClock, SystemClock};
pub use lookback::{parse_lookback, LookbackError};
