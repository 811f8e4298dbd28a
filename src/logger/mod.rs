//! Intervention logging: append-only record capture, sinks, offline
//! querying, and counterfactual replay.

pub mod intervention;
pub mod query;
pub mod replay;
pub mod sink;
