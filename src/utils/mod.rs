//! Utility functions

pub mod image;
pub mod timer;

pub use timer::{LatencyReport, LatencySnapshot, LatencyTracker};
