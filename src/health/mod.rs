//! System health: rolling statistics, the alert engine and its channels,
//! and the operator-facing health monitor.

pub mod alerts;
pub mod monitor;
pub mod stats;
