//! Utility functions and helpers
//!
//! This module contains the clock abstraction used for retention cutoffs.

pub mod time;

pub use time::{Clock, FixedClock, SystemClock};
