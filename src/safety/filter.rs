//! Constraint-aware action filtering: box projection, half-space projection,
//! and discrete control-barrier-function enforcement with fallback.
//!
//! Projection runs sequentially box -> half-spaces -> CBF; each stage updates
//! the working action and records a margin (positive = strictly interior).

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;

use crate::core::contracts::{Dynamics, SafetyEnvelope};

/// Result of safety filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredAction {
    /// The (possibly modified) safe action.
    pub action: Vec<f64>,
    pub was_modified: bool,
    /// Margin to each constraint by name; positive means strictly interior.
    pub constraint_margins: BTreeMap<String, f64>,
    pub fallback_used: bool,
    /// Name of the last constraint that modified the action.
    pub violation_type: Option<String>,
}

// ──────────────────── constraints ────────────────────

/// Box (bound) constraint: `lower <= action <= upper` element-wise.
#[derive(Debug, Clone)]
pub struct BoxConstraint {
    pub name: String,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl BoxConstraint {
    #[must_use]
    pub fn new(name: &str, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        Self {
            name: name.to_string(),
            lower,
            upper,
        }
    }

    fn project(&self, action: &[f64]) -> (Vec<f64>, bool) {
        let projected: Vec<f64> = action
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .map(|(&a, (&lo, &hi))| a.clamp(lo, hi))
            .collect();
        let modified = projected
            .iter()
            .zip(action)
            .any(|(&p, &a)| (p - a).abs() > 1e-12);
        (projected, modified)
    }

    fn margin(&self, action: &[f64]) -> f64 {
        let lower = action
            .iter()
            .zip(&self.lower)
            .map(|(&a, &lo)| a - lo)
            .fold(f64::INFINITY, f64::min);
        let upper = action
            .iter()
            .zip(&self.upper)
            .map(|(&a, &hi)| hi - a)
            .fold(f64::INFINITY, f64::min);
        lower.min(upper)
    }

    fn satisfied(&self, action: &[f64]) -> bool {
        action
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .all(|(&a, (&lo, &hi))| a >= lo && a <= hi)
    }
}

/// Half-space constraint set: `A x <= b` row-wise.
#[derive(Debug, Clone)]
pub struct HalfSpaceConstraint {
    pub name: String,
    /// Row-major (M x D) constraint matrix.
    pub a: Vec<Vec<f64>>,
    pub b: Vec<f64>,
}

impl HalfSpaceConstraint {
    #[must_use]
    pub fn new(name: &str, a: Vec<Vec<f64>>, b: Vec<f64>) -> Self {
        Self {
            name: name.to_string(),
            a,
            b,
        }
    }

    fn violations(&self, x: &[f64]) -> Vec<f64> {
        self.a
            .iter()
            .zip(&self.b)
            .map(|(row, &bi)| dot(row, x) - bi)
            .collect()
    }

    /// Cyclic projection onto the half-space intersection: every violated
    /// row projects `x <- x - v * a_i / ||a_i||^2` until the update norm
    /// drops under `tolerance` or `max_iterations` is reached.
    fn project(
        &self,
        action: &[f64],
        max_iterations: usize,
        tolerance: f64,
    ) -> (Vec<f64>, bool) {
        let mut x = action.to_vec();
        if self
            .violations(&x)
            .iter()
            .all(|&v| v <= tolerance)
        {
            return (x, false);
        }

        for _ in 0..max_iterations {
            let x_prev = x.clone();
            for (row, &bi) in self.a.iter().zip(&self.b) {
                let violation = dot(row, &x) - bi;
                if violation > tolerance {
                    let norm_sq = dot(row, row);
                    if norm_sq > 1e-10 {
                        for (xi, &ai) in x.iter_mut().zip(row) {
                            *xi -= (violation / norm_sq) * ai;
                        }
                    }
                }
            }
            let delta: f64 = x
                .iter()
                .zip(&x_prev)
                .map(|(&a, &b)| (a - b) * (a - b))
                .sum::<f64>()
                .sqrt();
            if delta < tolerance {
                break;
            }
        }
        (x, true)
    }

    fn margin(&self, x: &[f64]) -> f64 {
        -self
            .violations(x)
            .iter()
            .fold(f64::NEG_INFINITY, |acc, &v| acc.max(v))
    }

    fn satisfied(&self, x: &[f64]) -> bool {
        self.violations(x).iter().all(|&v| v <= 0.0)
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}

// ──────────────────── CBF filter ────────────────────

/// Barrier function: `h(x) >= 0` defines the safe set.
pub type BarrierFn = Box<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// Discrete-time control barrier function filter.
///
/// Enforces `h(f(x, a)) >= (1 - alpha) * h(x)` via a monotone line search
/// scaling the action toward zero.
pub struct CbfFilter {
    dynamics: Box<dyn Dynamics>,
    barrier: BarrierFn,
    alpha: f64,
    n_samples: usize,
}

impl CbfFilter {
    #[must_use]
    pub fn new(dynamics: Box<dyn Dynamics>, barrier: BarrierFn, alpha: f64) -> Self {
        Self {
            dynamics,
            barrier,
            alpha,
            n_samples: 10,
        }
    }

    #[must_use]
    pub fn with_line_search_samples(mut self, n_samples: usize) -> Self {
        self.n_samples = n_samples.max(2);
        self
    }

    /// Check the discrete CBF condition; returns `(is_safe, margin)`.
    #[must_use]
    pub fn is_safe(&self, state: &[f64], action: &[f64]) -> (bool, f64) {
        let next = self.dynamics.predict(state, action);
        let margin = (self.barrier)(&next) - (1.0 - self.alpha) * (self.barrier)(state);
        (margin >= 0.0, margin)
    }

    /// Filter the action to satisfy the barrier condition. Returns
    /// `(action, was_modified, margin)`; the zero action is the terminal
    /// fallback of the line search.
    #[must_use]
    pub fn filter_action(&self, state: &[f64], action: &[f64]) -> (Vec<f64>, bool, f64) {
        let (safe, margin) = self.is_safe(state, action);
        if safe {
            return (action.to_vec(), false, margin);
        }

        for step in 0..self.n_samples {
            let frac = step as f64 / (self.n_samples - 1) as f64;
            let scaled: Vec<f64> = action.iter().map(|&a| (1.0 - frac) * a).collect();
            let (safe, margin) = self.is_safe(state, &scaled);
            if safe {
                return (scaled, true, margin);
            }
        }

        let zero = vec![0.0; action.len()];
        let (_, margin) = self.is_safe(state, &zero);
        (zero, true, margin)
    }
}

// ──────────────────── safety filter ────────────────────

/// Orchestrates box, half-space, and CBF constraints over candidate actions.
pub struct SafetyFilter {
    envelope: SafetyEnvelope,
    boxes: Vec<BoxConstraint>,
    half_spaces: Vec<HalfSpaceConstraint>,
    cbf: Option<CbfFilter>,
    fallback_action: Option<Vec<f64>>,
    max_iterations: usize,
    tolerance: f64,
}

impl SafetyFilter {
    #[must_use]
    pub fn new(envelope: SafetyEnvelope) -> Self {
        Self {
            envelope,
            boxes: Vec::new(),
            half_spaces: Vec::new(),
            cbf: None,
            fallback_action: None,
            max_iterations: 100,
            tolerance: 1e-6,
        }
    }

    #[must_use]
    pub fn with_box(mut self, constraint: BoxConstraint) -> Self {
        self.boxes.push(constraint);
        self
    }

    #[must_use]
    pub fn with_half_space(mut self, constraint: HalfSpaceConstraint) -> Self {
        self.half_spaces.push(constraint);
        self
    }

    #[must_use]
    pub fn with_cbf(mut self, cbf: CbfFilter) -> Self {
        self.cbf = Some(cbf);
        self
    }

    #[must_use]
    pub fn with_fallback_action(mut self, action: Vec<f64>) -> Self {
        self.fallback_action = Some(action);
        self
    }

    #[must_use]
    pub fn envelope(&self) -> &SafetyEnvelope {
        &self.envelope
    }

    /// Project a candidate action through every configured constraint.
    /// `state` is required only when a CBF filter is configured.
    #[must_use]
    pub fn filter(&self, candidate: &[f64], state: Option<&[f64]>) -> FilteredAction {
        let mut action = candidate.to_vec();
        let mut was_modified = false;
        let mut margins = BTreeMap::new();
        let mut fallback_used = false;
        let mut violation_type = None;

        for constraint in &self.boxes {
            let (projected, modified) = constraint.project(&action);
            if modified {
                was_modified = true;
                violation_type = Some(constraint.name.clone());
            }
            margins.insert(constraint.name.clone(), constraint.margin(&projected));
            action = projected;
        }

        for constraint in &self.half_spaces {
            let (projected, modified) =
                constraint.project(&action, self.max_iterations, self.tolerance);
            if modified {
                was_modified = true;
                violation_type = Some(constraint.name.clone());
            }
            margins.insert(constraint.name.clone(), constraint.margin(&projected));
            action = projected;
        }

        if let (Some(cbf), Some(state)) = (self.cbf.as_ref(), state) {
            let (filtered, modified, margin) = cbf.filter_action(state, &action);
            if margin.is_finite() {
                if modified {
                    was_modified = true;
                    violation_type = Some("cbf".to_string());
                }
                margins.insert("cbf".to_string(), margin);
                action = filtered;
            } else if let Some(fallback) = &self.fallback_action {
                // A non-finite barrier means the dynamics/barrier pair
                // produced garbage; substitute the conservative action.
                action = fallback.clone();
                fallback_used = true;
                was_modified = true;
            }
        }

        if norm(&action) < 1e-6
            && let Some(fallback) = &self.fallback_action
        {
            action = fallback.clone();
            fallback_used = true;
        }

        FilteredAction {
            action,
            was_modified,
            constraint_margins: margins,
            fallback_used,
            violation_type,
        }
    }

    /// Check all box and half-space constraints without modifying the
    /// action. CBF is excluded (it needs a state).
    #[must_use]
    pub fn check_constraints(&self, action: &[f64]) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for constraint in &self.boxes {
            results.insert(constraint.name.clone(), constraint.satisfied(action));
        }
        for constraint in &self.half_spaces {
            results.insert(constraint.name.clone(), constraint.satisfied(action));
        }
        results
    }
}

// ──────────────────── tests ────────────────────
