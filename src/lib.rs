//! CPF: Contact Particle Filter
//!
//! Online estimation of the number, surface location, and reaction force of
//! unmeasured external contacts on a robot, from its generalized-force
//! residual stream.
//!
//! ## Architecture
//!
//! - **Surface catalog**: candidate contact sites with precomputed friction
//!   cones and wrench bases
//! - **Likelihood evaluator**: bounded QP over cone coefficients per
//!   candidate tuple
//! - **Particle sets**: one population per tracked contact, with current
//!   and historical most-likely solutions
//! - **Hypothesis manager**: births and kills particle sets on residual
//!   energy and simulated-time cooldowns
//! - **Filter driver**: the per-residual synchronous step
//! - **Pipeline**: channel-tagged JSON streams in and out

pub mod catalog;
pub mod config;
pub mod filter;
pub mod likelihood;
pub mod locator;
pub mod manager;
pub mod model;
pub mod particles;
pub mod pipeline;
pub mod proposal;
pub mod solver;
pub mod types;

// Re-export the filter configuration
pub use config::CpfConfig;

// Re-export the driver and its outputs
pub use filter::{ContactFilter, FilterError, StepOutput};

// Re-export commonly used core types
pub use catalog::{CandidateSite, SiteId, SurfaceCatalog};
pub use likelihood::{LikelihoodEvaluator, SolutionRecord};
pub use locator::{CatalogLocator, SiteFactory, SurfaceLocator};
pub use manager::{HypothesisManager, ManagerEvent};
pub use model::{KinematicTree, LinkId, RigidBodyModel};
pub use particles::{Particle, ParticleSet, SetId};
pub use proposal::ProposalEngine;
pub use solver::{QpSolution, QpSolver};

// Re-export message types
pub use types::{ContactEstimate, ResidualState, SingleContactEstimate};
