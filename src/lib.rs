#![forbid(unsafe_code)]

//! Policy Sentinel — runtime trust-and-safety layer for learning-based
//! controllers in safety-critical closed loops.
//!
//! For every control step the crate answers three questions:
//! 1. **How much to trust the policy's output** — calibrated conformal
//!    prediction sets and ensemble uncertainty decomposition
//! 2. **Whether the input is in-distribution** — a weighted OOD detector
//!    ensemble with a calibrated threshold
//! 3. **What safe action to emit when trust fails** — a bounded mitigation
//!    ladder plus box / half-space / CBF action projection
//!
//! Every decision is captured in an append-only intervention log for offline
//! replay; a statistical evaluator and a diversity-aware selector close the
//! calibration loop, and a deployment orchestrator governs candidate
//! promotion.

pub mod core;
pub mod eval;
pub mod health;
pub mod logger;
pub mod ood;
pub mod runtime;
pub mod safety;
pub mod selection;
pub mod uncertainty;

pub mod prelude;
