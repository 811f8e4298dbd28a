//! Active-learning sample selection.

pub mod acquisition;
