//! Safety enforcement: constrained action filtering and runtime monitors.

pub mod filter;
pub mod monitors;
