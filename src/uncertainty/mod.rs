//! Uncertainty quantification: numeric kernels and the conformal
//! prediction engine.

pub mod conformal;
pub mod kernels;
