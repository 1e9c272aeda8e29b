//! Timing primitives: typed time, clocks, the hashed timing wheel and the
//! periodic ticker built on it.

mod clock;
mod slab;
mod ticker;
mod time;
pub(crate) mod wheel;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ticker::{TickCallback, TickHandle, Ticker, TickerError, WheelTicker};
pub use time::{Duration, Millis, MonoInstant, TimeUnit};
pub use wheel::WheelError;
