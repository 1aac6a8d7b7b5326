//! Filter Configuration Module
//!
//! Every tunable of the contact particle filter lives here as an
//! operator-editable TOML value. Each section struct implements `Default`
//! with the stock values, so a missing file or a partial file always yields
//! a runnable configuration.
//!
//! ## Loading Order
//!
//! 1. `CPF_CONFIG` environment variable (path to TOML file)
//! 2. `cpf.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The filter takes an `Arc<CpfConfig>` explicitly; there is no global
//! config singleton. Validation runs on every load and configuration errors
//! are fatal at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one filter deployment.
///
/// Load with [`CpfConfig::load`], which searches `$CPF_CONFIG`, then
/// `./cpf.toml`, then falls back to built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpfConfig {
    /// Robot description
    #[serde(default)]
    pub robot: RobotConfig,

    /// Measurement model (residual covariance)
    #[serde(default)]
    pub measurement_model: MeasurementModelConfig,

    /// Motion model variances and scheduling
    #[serde(default)]
    pub motion_model: MotionModelConfig,

    /// Proposal distribution mixture
    #[serde(default)]
    pub proposal: ProposalConfig,

    /// Birth / death thresholds and cooldowns
    #[serde(default)]
    pub thresholds: ThresholdConfig,

    /// Particle population per hypothesis
    #[serde(default = "defaults::num_particles")]
    pub num_particles: usize,

    /// Additive residual noise (testing aid)
    #[serde(default)]
    pub noise: NoiseConfig,

    /// QP back-end selection
    #[serde(default)]
    pub solver: SolverConfig,

    /// Caps and alternative code paths
    #[serde(default)]
    pub debug: DebugConfig,

    /// Warm-start behaviour for newborn hypotheses
    #[serde(default)]
    pub add_particle_set: AddParticleSetConfig,

    /// Input data files
    #[serde(default)]
    pub data: DataConfig,

    /// Visualization output
    #[serde(default)]
    pub vis: VisConfig,

    /// Deterministic replay seed
    #[serde(default)]
    pub rng: RngConfig,
}

impl Default for CpfConfig {
    fn default() -> Self {
        Self {
            robot: RobotConfig::default(),
            measurement_model: MeasurementModelConfig::default(),
            motion_model: MotionModelConfig::default(),
            proposal: ProposalConfig::default(),
            thresholds: ThresholdConfig::default(),
            num_particles: defaults::num_particles(),
            noise: NoiseConfig::default(),
            solver: SolverConfig::default(),
            debug: DebugConfig::default(),
            add_particle_set: AddParticleSetConfig::default(),
            data: DataConfig::default(),
            vis: VisConfig::default(),
            rng: RngConfig::default(),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotConfig {
    /// Path to the URDF robot description.
    #[serde(default)]
    pub urdf: PathBuf,

    /// Floating base type. Only "fixed" is supported.
    #[serde(default = "defaults::floating_base_type")]
    pub floating_base_type: String,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            urdf: PathBuf::new(),
            floating_base_type: defaults::floating_base_type(),
        }
    }
}

/// Residual covariance Σ = var · I.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementModelConfig {
    #[serde(default = "defaults::measurement_var")]
    pub var: f64,
}

impl Default for MeasurementModelConfig {
    fn default() -> Self {
        Self {
            var: defaults::measurement_var(),
        }
    }
}

/// World-space Gaussian motion step. The step variance is scheduled between
/// `var_min` and `var_max` by the current best squared error, saturating at
/// `var_max_squared_error_cutoff`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionModelConfig {
    /// Variance of the discrete catalog-graph motion model.
    #[serde(default = "defaults::motion_var")]
    pub var: f64,

    #[serde(default = "defaults::motion_var_min")]
    pub var_min: f64,

    #[serde(default = "defaults::motion_var_max")]
    pub var_max: f64,

    #[serde(default = "defaults::motion_var_cutoff")]
    pub var_max_squared_error_cutoff: f64,

    /// Use the precomputed discrete catalog-graph motion model instead of
    /// the continuous world-space Gaussian. Adapter-born sites always use
    /// the continuous step.
    #[serde(default)]
    pub discrete: bool,
}

impl Default for MotionModelConfig {
    fn default() -> Self {
        Self {
            var: defaults::motion_var(),
            var_min: defaults::motion_var_min(),
            var_max: defaults::motion_var_max(),
            var_max_squared_error_cutoff: defaults::motion_var_cutoff(),
            discrete: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalConfig {
    /// Fraction of particles advanced by the plain motion model; the rest
    /// are drawn around the historical most-likely point.
    #[serde(default = "defaults::normal_fraction")]
    pub normal_fraction: f64,

    #[serde(default)]
    pub historical: HistoricalProposalConfig,

    #[serde(default)]
    pub seed_distribution: SeedDistributionConfig,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            normal_fraction: defaults::normal_fraction(),
            historical: HistoricalProposalConfig::default(),
            seed_distribution: SeedDistributionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalProposalConfig {
    /// Variance of the Gaussian centred on the historical most-likely point.
    #[serde(default = "defaults::historical_variance")]
    pub variance: f64,

    /// Exact copies of the historical most-likely particle appended each
    /// step so a good hypothesis never dies to sampling noise.
    #[serde(default = "defaults::num_particles_at_actual")]
    pub num_particles_at_actual: usize,
}

impl Default for HistoricalProposalConfig {
    fn default() -> Self {
        Self {
            variance: defaults::historical_variance(),
            num_particles_at_actual: defaults::num_particles_at_actual(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedDistributionConfig {
    /// Particles drawn uniformly from the catalog when the squared error is
    /// above the threshold.
    #[serde(default = "defaults::seed_num_particles")]
    pub num_particles: usize,

    #[serde(default = "defaults::seed_error_threshold")]
    pub squared_error_threshold: f64,
}

impl Default for SeedDistributionConfig {
    fn default() -> Self {
        Self {
            num_particles: defaults::seed_num_particles(),
            squared_error_threshold: defaults::seed_error_threshold(),
        }
    }
}

/// Birth and death rules for particle sets. All timeouts are in simulated
/// seconds (derived from message `utime`), never wall time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "defaults::add_squared_error")]
    pub add_contact_point_squared_error: f64,

    #[serde(default = "defaults::remove_squared_error")]
    pub remove_contact_point_squared_error: f64,

    /// Cooldown after a birth before the next birth.
    #[serde(default = "defaults::add_timeout")]
    pub add_contact_point_timeout: f64,

    /// Cooldown after a death before the next death.
    #[serde(default = "defaults::remove_timeout")]
    pub remove_contact_point_timeout: f64,

    /// The error must stay above the add threshold for this long before a
    /// birth fires.
    #[serde(default = "defaults::persistence_window")]
    pub time_above_threshold_to_add_particle_set: f64,

    /// Particles below this squared error participate in the world-space
    /// average for the current most-likely.
    #[serde(default = "defaults::averaging_bound")]
    pub squared_error_bound_for_most_likely_particle_averaging: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            add_contact_point_squared_error: defaults::add_squared_error(),
            remove_contact_point_squared_error: defaults::remove_squared_error(),
            add_contact_point_timeout: defaults::add_timeout(),
            remove_contact_point_timeout: defaults::remove_timeout(),
            time_above_threshold_to_add_particle_set: defaults::persistence_window(),
            squared_error_bound_for_most_likely_particle_averaging: defaults::averaging_bound(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NoiseConfig {
    /// Add Gaussian noise to each incoming residual.
    #[serde(default)]
    pub add_noise: bool,

    #[serde(default)]
    pub stddev: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// QP back-end: "nnls" or "projected_gradient".
    #[serde(default = "defaults::solver_type")]
    pub solver_type: String,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            solver_type: defaults::solver_type(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Hard cap on simultaneous contact hypotheses.
    #[serde(default = "defaults::max_num_particle_sets")]
    pub max_num_particle_sets: usize,

    /// Pick the current most-likely as the most-populated site instead of
    /// the averaging policy.
    #[serde(default)]
    pub use_mode_for_most_likely: bool,

    /// Replace the particle filter step with the exhaustive likelihood
    /// sweep over hinted links.
    #[serde(default)]
    pub full_sweep: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            max_num_particle_sets: defaults::max_num_particle_sets(),
            use_mode_for_most_likely: false,
            full_sweep: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddParticleSetConfig {
    /// Propose-evaluate-resample cycles run for a newborn set before normal
    /// stepping resumes. 0 disables warm-starting.
    #[serde(default = "defaults::num_initial_steps")]
    pub num_initial_steps: usize,
}

impl Default for AddParticleSetConfig {
    fn default() -> Self {
        Self {
            num_initial_steps: defaults::num_initial_steps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DataConfig {
    /// TOML file listing the initial candidate contact sites.
    #[serde(default)]
    pub initial_particle_locations: PathBuf,

    /// Surface mesh cells for an external closest-point locator. The
    /// built-in catalog locator ignores this.
    #[serde(default)]
    pub contact_cells: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VisConfig {
    /// Publish per-set particle snapshots for offline rendering.
    #[serde(default)]
    pub publish_visualization_data: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RngConfig {
    /// Seed for the filter's single PRNG. Identical seed + config +
    /// residual stream reproduces outputs bit for bit.
    #[serde(default)]
    pub seed: u64,
}

// ============================================================================
// Defaults
// ============================================================================

mod defaults {
    pub fn floating_base_type() -> String {
        "fixed".to_string()
    }
    pub fn measurement_var() -> f64 {
        0.01
    }
    pub fn motion_var() -> f64 {
        0.01
    }
    pub fn motion_var_min() -> f64 {
        0.005
    }
    pub fn motion_var_max() -> f64 {
        0.05
    }
    pub fn motion_var_cutoff() -> f64 {
        5.0
    }
    pub fn normal_fraction() -> f64 {
        0.7
    }
    pub fn historical_variance() -> f64 {
        0.005
    }
    pub fn num_particles_at_actual() -> usize {
        5
    }
    pub fn seed_num_particles() -> usize {
        30
    }
    pub fn seed_error_threshold() -> f64 {
        5.0
    }
    pub fn add_squared_error() -> f64 {
        1.0
    }
    pub fn remove_squared_error() -> f64 {
        0.5
    }
    pub fn add_timeout() -> f64 {
        0.5
    }
    pub fn remove_timeout() -> f64 {
        1.0
    }
    pub fn persistence_window() -> f64 {
        0.2
    }
    pub fn averaging_bound() -> f64 {
        1.0
    }
    pub fn num_particles() -> usize {
        100
    }
    pub fn solver_type() -> String {
        "nnls".to_string()
    }
    pub fn max_num_particle_sets() -> usize {
        4
    }
    pub fn num_initial_steps() -> usize {
        4
    }
}

// ============================================================================
// Loading & Validation
// ============================================================================

impl CpfConfig {
    /// Load configuration using the standard search order:
    /// 1. `$CPF_CONFIG` environment variable
    /// 2. `./cpf.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("CPF_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded filter config from CPF_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from CPF_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "CPF_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("cpf.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded filter config from ./cpf.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./cpf.toml, using defaults");
                }
            }
        }

        info!("No cpf.toml found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field the filter depends on. Called on every load; a
    /// failure here is a fatal startup error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.robot.floating_base_type != "fixed" {
            return Err(ConfigError::invalid(
                "robot.floating_base_type",
                format!(
                    "'{}' (only 'fixed' is supported)",
                    self.robot.floating_base_type
                ),
            ));
        }
        if self.measurement_model.var <= 0.0 {
            return Err(ConfigError::invalid("measurement_model.var", "must be > 0"));
        }
        for (key, v) in [
            ("motion_model.var", self.motion_model.var),
            ("motion_model.var_min", self.motion_model.var_min),
            ("motion_model.var_max", self.motion_model.var_max),
            (
                "motion_model.var_max_squared_error_cutoff",
                self.motion_model.var_max_squared_error_cutoff,
            ),
            (
                "proposal.historical.variance",
                self.proposal.historical.variance,
            ),
        ] {
            if v <= 0.0 {
                return Err(ConfigError::Invalid {
                    key: "motion/proposal variance",
                    reason: format!("{key} must be > 0, got {v}"),
                });
            }
        }
        if self.motion_model.var_min > self.motion_model.var_max {
            return Err(ConfigError::invalid(
                "motion_model.var_min",
                "must not exceed motion_model.var_max",
            ));
        }
        if !(0.0..=1.0).contains(&self.proposal.normal_fraction) {
            return Err(ConfigError::invalid(
                "proposal.normal_fraction",
                format!("must be in [0, 1], got {}", self.proposal.normal_fraction),
            ));
        }
        for (key, v) in [
            (
                "thresholds.add_contact_point_squared_error",
                self.thresholds.add_contact_point_squared_error,
            ),
            (
                "thresholds.remove_contact_point_squared_error",
                self.thresholds.remove_contact_point_squared_error,
            ),
        ] {
            if v <= 0.0 {
                return Err(ConfigError::Invalid {
                    key: "thresholds",
                    reason: format!("{key} must be > 0, got {v}"),
                });
            }
        }
        for (key, v) in [
            (
                "thresholds.add_contact_point_timeout",
                self.thresholds.add_contact_point_timeout,
            ),
            (
                "thresholds.remove_contact_point_timeout",
                self.thresholds.remove_contact_point_timeout,
            ),
            (
                "thresholds.time_above_threshold_to_add_particle_set",
                self.thresholds.time_above_threshold_to_add_particle_set,
            ),
        ] {
            if v < 0.0 {
                return Err(ConfigError::Invalid {
                    key: "thresholds",
                    reason: format!("{key} must be >= 0, got {v}"),
                });
            }
        }
        if self.num_particles == 0 {
            return Err(ConfigError::invalid("num_particles", "must be >= 1"));
        }
        if self.noise.add_noise && self.noise.stddev <= 0.0 {
            return Err(ConfigError::invalid(
                "noise.stddev",
                "must be > 0 when noise.add_noise is set",
            ));
        }
        match self.solver.solver_type.as_str() {
            "nnls" | "projected_gradient" => {}
            other => {
                return Err(ConfigError::invalid(
                    "solver.solver_type",
                    format!("unknown solver '{other}' (expected 'nnls' or 'projected_gradient')"),
                ));
            }
        }
        if self.debug.max_num_particle_sets == 0 {
            return Err(ConfigError::invalid(
                "debug.max_num_particle_sets",
                "must be >= 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = CpfConfig::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.num_particles, 100);
        assert_eq!(config.debug.max_num_particle_sets, 4);
        assert!((config.proposal.normal_fraction - 0.7).abs() < 1e-12);
        assert_eq!(config.solver.solver_type, "nnls");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            f,
            "num_particles = 250\n\n[thresholds]\nadd_contact_point_squared_error = 2.5\n"
        )
        .expect("write");
        let config = CpfConfig::load_from_file(f.path()).expect("load");
        assert_eq!(config.num_particles, 250);
        assert!((config.thresholds.add_contact_point_squared_error - 2.5).abs() < 1e-12);
        // untouched section keeps its default
        assert!((config.thresholds.remove_contact_point_timeout - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_unknown_solver() {
        let mut config = CpfConfig::default();
        config.solver.solver_type = "simplex".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_floating_base() {
        let mut config = CpfConfig::default();
        config.robot.floating_base_type = "rpy".to_string();
        let err = config.validate().expect_err("must reject");
        assert!(err.to_string().contains("floating_base_type"));
    }

    #[test]
    fn rejects_bad_fraction() {
        let mut config = CpfConfig::default();
        config.proposal.normal_fraction = 1.3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_noise_without_stddev() {
        let mut config = CpfConfig::default();
        config.noise.add_noise = true;
        config.noise.stddev = 0.0;
        assert!(config.validate().is_err());
    }
}
