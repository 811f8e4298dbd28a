//! Runtime safety monitors: named-constraint limits, geofencing, and
//! time-to-collision with hysteresis.
//!
//! Every monitor returns a [`MonitorOutput`] with severity in `[0, 1]` and a
//! wall-clock timestamp. Monitors never fail; malformed observations read as
//! healthy defaults.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::contracts::{
    MonitorOutput, ObsValue, Observation, TrackedObject, scalar_or_zero, unix_now,
};

/// A runtime safety monitor. `check` is `&mut` because monitors may carry
/// local hysteresis state (see [`TtcMonitor`]).
pub trait Monitor: Send {
    fn monitor_id(&self) -> &str;
    fn check(&mut self, observation: &Observation) -> MonitorOutput;
}

// ──────────────────── constraint monitor ────────────────────

/// Compares a named observation key against a hard limit. Severity is the
/// proportional overshoot `(v - limit) / limit` clamped to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ConstraintMonitor {
    monitor_id: String,
    metric_key: String,
    limit: f64,
}

impl ConstraintMonitor {
    #[must_use]
    pub fn new(monitor_id: &str, metric_key: &str, limit: f64) -> Self {
        Self {
            monitor_id: monitor_id.to_string(),
            metric_key: metric_key.to_string(),
            limit,
        }
    }
}

impl Monitor for ConstraintMonitor {
    fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    fn check(&mut self, observation: &Observation) -> MonitorOutput {
        let value = scalar_or_zero(observation, &self.metric_key);
        let triggered = value > self.limit;
        let severity = if triggered {
            ((value - self.limit) / self.limit).clamp(0.0, 1.0)
        } else {
            0.0
        };
        MonitorOutput {
            monitor_id: self.monitor_id.clone(),
            triggered,
            severity,
            message: if triggered {
                format!(
                    "value {value} exceeded limit {limit} for {key}",
                    limit = self.limit,
                    key = self.metric_key
                )
            } else {
                "OK".to_string()
            },
            timestamp: unix_now(),
        }
    }
}

// ──────────────────── geofence monitor ────────────────────

/// Checks that `(x, y)` stays inside an axis-aligned rectangle. Severity is
/// binary.
#[derive(Debug, Clone)]
pub struct GeofenceMonitor {
    monitor_id: String,
    x_min: f64,
    y_min: f64,
    x_max: f64,
    y_max: f64,
}

impl GeofenceMonitor {
    /// Bounds are `(x_min, y_min, x_max, y_max)`.
    #[must_use]
    pub fn new(monitor_id: &str, bounds: (f64, f64, f64, f64)) -> Self {
        Self {
            monitor_id: monitor_id.to_string(),
            x_min: bounds.0,
            y_min: bounds.1,
            x_max: bounds.2,
            y_max: bounds.3,
        }
    }
}

impl Monitor for GeofenceMonitor {
    fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    fn check(&mut self, observation: &Observation) -> MonitorOutput {
        let x = scalar_or_zero(observation, "x");
        let y = scalar_or_zero(observation, "y");
        let inside =
            x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max;
        MonitorOutput {
            monitor_id: self.monitor_id.clone(),
            triggered: !inside,
            severity: if inside { 0.0 } else { 1.0 },
            message: if inside {
                "OK".to_string()
            } else {
                format!(
                    "position ({x}, {y}) out of bounds [{}, {}] x [{}, {}]",
                    self.x_min, self.x_max, self.y_min, self.y_max
                )
            },
            timestamp: unix_now(),
        }
    }
}

// ──────────────────── TTC kinematics ────────────────────

/// Kinematic model for time-to-collision estimation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtcModel {
    #[default]
    ConstantVelocity,
    ConstantAcceleration,
}

/// Configuration for the time-to-collision monitor (config keys
/// `ttc.critical`, `ttc.warning`, `ttc.debounce_steps`,
/// `ttc.min_closing_velocity`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtcConfig {
    /// TTC below this many seconds raises the raw trigger.
    pub critical: f64,
    /// TTC below this many seconds starts severity scaling.
    pub warning: f64,
    pub model: TtcModel,
    /// Hysteresis window: triggers only on a majority of recent raw checks.
    pub debounce_steps: usize,
    /// Minimum closing speed considered approaching.
    pub min_closing_velocity: f64,
}

impl Default for TtcConfig {
    fn default() -> Self {
        Self {
            critical: 1.0,
            warning: 3.0,
            model: TtcModel::ConstantVelocity,
            debounce_steps: 3,
            min_closing_velocity: 0.1,
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}

fn sub(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(&x, &y)| x - y).collect()
}

/// Constant-velocity TTC: `d / v_closing` when the closing speed along the
/// line of sight is at least `min_closing_velocity`, infinity otherwise.
#[must_use]
pub fn constant_velocity_ttc(
    ego_pos: &[f64],
    ego_vel: &[f64],
    obj_pos: &[f64],
    obj_vel: &[f64],
    min_closing_velocity: f64,
) -> f64 {
    let rel_pos = sub(obj_pos, ego_pos);
    let distance = norm(&rel_pos);
    if distance < 1e-6 {
        return 0.0;
    }
    let rel_vel = sub(ego_vel, obj_vel);
    let closing = dot(&rel_vel, &rel_pos) / distance;
    if closing < min_closing_velocity {
        return f64::INFINITY;
    }
    (distance / closing).max(0.0)
}

/// Constant-acceleration TTC: smallest positive root of
/// `0.5 * a_rel * t^2 + v_rel * t - d = 0`, infinity when no real positive
/// root exists.
#[must_use]
pub fn constant_acceleration_ttc(
    ego_pos: &[f64],
    ego_vel: &[f64],
    obj_pos: &[f64],
    obj_vel: &[f64],
    ego_acc: Option<&[f64]>,
    obj_acc: Option<&[f64]>,
) -> f64 {
    let rel_pos = sub(obj_pos, ego_pos);
    let distance = norm(&rel_pos);
    if distance < 1e-6 {
        return 0.0;
    }
    let direction: Vec<f64> = rel_pos.iter().map(|&p| p / distance).collect();

    let rel_vel = sub(ego_vel, obj_vel);
    let v_rel = dot(&rel_vel, &direction);
    let a_rel = match (ego_acc, obj_acc) {
        (Some(ea), Some(oa)) => dot(&sub(ea, oa), &direction),
        _ => 0.0,
    };

    let a = 0.5 * a_rel;
    let b = v_rel;
    let c = -distance;

    if a.abs() < 1e-10 {
        if b > 1e-6 {
            return distance / b;
        }
        return f64::INFINITY;
    }

    let discriminant = b * b - 4.0 * a * c;
    if discriminant < 0.0 {
        return f64::INFINITY;
    }
    let sqrt_disc = discriminant.sqrt();
    let t1 = (-b + sqrt_disc) / (2.0 * a);
    let t2 = (-b - sqrt_disc) / (2.0 * a);

    [t1, t2]
        .into_iter()
        .filter(|&t| t > 0.0)
        .fold(f64::INFINITY, f64::min)
}

// ──────────────────── TTC monitor ────────────────────

/// Time-to-collision monitor over tracked objects with debounce hysteresis.
///
/// Expected observation keys: `ego_position`, `ego_velocity` (vectors), and
/// `objects` (list of maps with `object_id`, `position`, `velocity`,
/// optional `acceleration`).
pub struct TtcMonitor {
    monitor_id: String,
    config: TtcConfig,
    trigger_history: VecDeque<bool>,
    last_triggered_object: Option<String>,
}

impl TtcMonitor {
    #[must_use]
    pub fn new(monitor_id: &str, config: TtcConfig) -> Self {
        Self {
            monitor_id: monitor_id.to_string(),
            config,
            trigger_history: VecDeque::new(),
            last_triggered_object: None,
        }
    }

    /// Object id that most recently caused a (debounced) trigger.
    #[must_use]
    pub fn last_triggered_object(&self) -> Option<&str> {
        self.last_triggered_object.as_deref()
    }

    fn compute_ttc(&self, ego_pos: &[f64], ego_vel: &[f64], obj: &TrackedObject) -> f64 {
        match self.config.model {
            TtcModel::ConstantVelocity => constant_velocity_ttc(
                ego_pos,
                ego_vel,
                &obj.position,
                &obj.velocity,
                self.config.min_closing_velocity,
            ),
            TtcModel::ConstantAcceleration => constant_acceleration_ttc(
                ego_pos,
                ego_vel,
                &obj.position,
                &obj.velocity,
                obj.acceleration.as_deref(),
                obj.acceleration.as_deref(),
            ),
        }
    }

    fn parse_objects(observation: &Observation) -> Vec<TrackedObject> {
        observation
            .get("objects")
            .and_then(ObsValue::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(TrackedObject::from_value)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Monitor for TtcMonitor {
    fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    fn check(&mut self, observation: &Observation) -> MonitorOutput {
        let ego_pos = observation
            .get("ego_position")
            .and_then(ObsValue::as_vector)
            .map_or_else(|| vec![0.0, 0.0], <[f64]>::to_vec);
        let ego_vel = observation
            .get("ego_velocity")
            .and_then(ObsValue::as_vector)
            .map_or_else(|| vec![0.0, 0.0], <[f64]>::to_vec);
        let objects = Self::parse_objects(observation);

        if objects.is_empty() {
            return MonitorOutput {
                monitor_id: self.monitor_id.clone(),
                triggered: false,
                severity: 0.0,
                message: "no objects to track".to_string(),
                timestamp: unix_now(),
            };
        }

        let mut min_ttc = f64::INFINITY;
        let mut min_object: Option<&str> = None;
        for obj in &objects {
            let ttc = self.compute_ttc(&ego_pos, &ego_vel, obj);
            if ttc < min_ttc {
                min_ttc = ttc;
                min_object = Some(&obj.object_id);
            }
        }

        let severity = if min_ttc >= self.config.warning {
            0.0
        } else if min_ttc <= 0.0 {
            1.0
        } else {
            (1.0 - min_ttc / self.config.warning).clamp(0.0, 1.0)
        };

        // Raw trigger, then majority-vote debounce over the recent window.
        let raw_triggered = min_ttc < self.config.critical;
        self.trigger_history.push_back(raw_triggered);
        while self.trigger_history.len() > self.config.debounce_steps {
            self.trigger_history.pop_front();
        }
        let triggered = if self.config.debounce_steps > 1 {
            let votes = self.trigger_history.iter().filter(|&&t| t).count();
            votes > self.trigger_history.len() / 2
        } else {
            raw_triggered
        };

        self.last_triggered_object = if triggered {
            min_object.map(ToString::to_string)
        } else {
            None
        };

        let message = if min_ttc.is_infinite() {
            "no collision predicted".to_string()
        } else if triggered {
            format!(
                "CRITICAL: ttc={min_ttc:.2}s to {}",
                min_object.unwrap_or("unknown")
            )
        } else if severity > 0.0 {
            format!(
                "WARNING: ttc={min_ttc:.2}s to {}",
                min_object.unwrap_or("unknown")
            )
        } else {
            format!("ttc={min_ttc:.2}s (safe)")
        };

        MonitorOutput {
            monitor_id: self.monitor_id.clone(),
            triggered,
            severity,
            message,
            timestamp: unix_now(),
        }
    }
}

// ──────────────────── tests ────────────────────
