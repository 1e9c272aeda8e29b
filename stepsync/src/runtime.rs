//! Runtime utilities.
//!
//! - `timing`: clocks, typed time and the timing-wheel ticker (single-threaded).

pub mod timing;
