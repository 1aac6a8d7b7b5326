//! Wire messages shared across the filter, pipeline, and binary.
//!
//! All messages are JSON on the wire. Inputs mirror the residual observer's
//! streams; the output is the per-step contact estimate plus an optional
//! per-set particle snapshot for offline rendering.

use serde::{Deserialize, Serialize};

// ============================================================================
// Input Streams
// ============================================================================

/// Generalized-force residual from the proprioceptive observer.
///
/// Joint names are matched by name against the rigid-body model's ordering;
/// joints the model knows but the message omits are zero-filled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualState {
    pub utime: u64,
    pub joint_names: Vec<String>,
    pub residual: Vec<f64>,
}

/// Current joint configuration of the robot.
///
/// The model is put at this configuration at the top of every filter step.
/// Until the first message arrives the zero pose is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotState {
    pub utime: u64,
    pub joint_names: Vec<String>,
    pub joint_positions: Vec<f64>,
}

/// Advisory list of links currently expected to carry external force.
/// Consumed only by the full-sweep likelihood mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalForceTorque {
    pub body_names: Vec<String>,
}

/// Ground-truth contact location, passed through for logging alongside the
/// estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactLocation {
    pub body_name: String,
    pub contact_position: [f64; 3],
    pub contact_force: [f64; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipleContactLocations {
    pub utime: u64,
    pub contacts: Vec<ContactLocation>,
}

// ============================================================================
// Output Streams
// ============================================================================

/// One estimated contact: link-frame quantities plus their world-frame
/// counterparts (positions via the full link isometry, force and normal via
/// the rotation only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleContactEstimate {
    pub body_name: String,
    pub contact_force: [f64; 3],
    pub contact_normal: [f64; 3],
    pub contact_position: [f64; 3],
    pub contact_force_in_world: [f64; 3],
    pub contact_normal_in_world: [f64; 3],
    pub contact_position_in_world: [f64; 3],
}

/// Published estimate of all currently active contacts.
///
/// `log_likelihood` carries the squared weighted residual error; with no
/// hypothesis active it is residualᵀ·W·residual and
/// `num_contact_points` is 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactEstimate {
    pub utime: u64,
    pub num_contact_points: usize,
    pub num_velocities: usize,
    pub log_likelihood: f64,
    pub velocity_names: Vec<String>,
    pub implied_residual: Vec<f64>,
    pub contacts: Vec<SingleContactEstimate>,
}

/// Ground truth and estimate side by side, for offline comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActualAndEstimatedContacts {
    pub utime: u64,
    pub actual: MultipleContactLocations,
    pub estimated: Vec<SingleContactEstimate>,
}

// ============================================================================
// Visualization Payload
// ============================================================================

/// One particle, reduced to what a renderer needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticleSnapshot {
    pub link_name: String,
    pub contact_location: [f64; 3],
    pub contact_normal: [f64; 3],
    /// Reaction force from the last evaluation; falls back to the normal
    /// when the particle has not been scored yet.
    pub contact_force: [f64; 3],
}

/// One hypothesis: its particle cloud, bests, and display color.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticleSetSnapshot {
    pub particles: Vec<ParticleSnapshot>,
    pub most_likely: Option<ParticleSnapshot>,
    pub historical_most_likely: Option<ParticleSnapshot>,
    pub color: [f64; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSnapshot {
    pub utime: u64,
    pub sets: Vec<ParticleSetSnapshot>,
}
