//! Filter driver.
//!
//! One synchronous pipeline per residual message: refresh frames → propose
//! → peer-coupled measurement update → resample → best updates → estimate
//! assembly → hypothesis management. The driver owns every piece of filter
//! state, including the single seeded PRNG; identical seed, configuration,
//! and residual stream replay to bit-identical outputs.

use crate::catalog::{CatalogError, SurfaceCatalog};
use crate::config::{ConfigError, CpfConfig};
use crate::likelihood::{ContactSolution, EvalContact, LikelihoodEvaluator, SolutionRecord};
use crate::locator::{SiteFactory, SurfaceLocator};
use crate::manager::{HypothesisManager, ManageDeps};
use crate::model::{LinkFrameCache, ModelError, RigidBodyModel};
use crate::particles::{BestUpdateDeps, ParticleSet};
use crate::proposal::{DiscreteMotionModel, ProposalDeps, ProposalEngine, ProposalError};
use crate::solver::{SolverError, MAX_CONTACTS};
use crate::types::{
    ActualAndEstimatedContacts, ContactEstimate, ExternalForceTorque, FilterSnapshot,
    MultipleContactLocations, ResidualState, RobotState, SingleContactEstimate,
};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("QP solver failed: {0}")]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Proposal(#[from] ProposalError),

    #[error("step requested before any residual arrived")]
    NoResidual,
}

// ============================================================================
// Step Output
// ============================================================================

/// Everything one step publishes.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub estimate: ContactEstimate,
    pub snapshot: Option<FilterSnapshot>,
    /// Ground truth + estimate pairing, present once a ground-truth message
    /// has been seen.
    pub comparison: Option<ActualAndEstimatedContacts>,
}

// ============================================================================
// Contact Filter
// ============================================================================

pub struct ContactFilter {
    config: Arc<CpfConfig>,
    model: Box<dyn RigidBodyModel>,
    catalog: Arc<SurfaceCatalog>,
    locator: Box<dyn SurfaceLocator>,
    factory: SiteFactory,
    evaluator: LikelihoodEvaluator,
    proposal: ProposalEngine,
    manager: HypothesisManager,
    frames: LinkFrameCache,
    sets: Vec<ParticleSet>,
    rng: StdRng,
    running: bool,
    current_utime: u64,
    current_time: f64,
    residual: Option<DVector<f64>>,
    joint_positions: DVector<f64>,
    links_with_external_force: Vec<String>,
    actual_contacts: Option<MultipleContactLocations>,
    most_likely: Option<Arc<SolutionRecord>>,
    unknown_joints_warned: HashSet<String>,
}

impl ContactFilter {
    pub fn new(
        config: Arc<CpfConfig>,
        mut model: Box<dyn RigidBodyModel>,
        catalog: Arc<SurfaceCatalog>,
        locator: Box<dyn SurfaceLocator>,
    ) -> Result<Self, FilterError> {
        config.validate()?;

        let num_joints = model.num_joints();
        let evaluator = LikelihoodEvaluator::new(&config, num_joints)?;

        let mut proposal = ProposalEngine::new(Arc::clone(&config));
        if config.motion_model.discrete {
            let discrete =
                DiscreteMotionModel::build(&catalog, model.as_mut(), config.motion_model.var)?;
            proposal = proposal.with_discrete_model(discrete);
        }

        let joint_positions = DVector::zeros(num_joints);
        model.set_joint_positions(&joint_positions)?;
        let mut frames = LinkFrameCache::new();
        frames.refresh(model.as_ref());

        let factory = SiteFactory::new(u32::try_from(catalog.len()).unwrap_or(u32::MAX));
        let manager = HypothesisManager::new(Arc::clone(&config));
        let rng = StdRng::seed_from_u64(config.rng.seed);

        info!(
            joints = num_joints,
            sites = catalog.len(),
            solver = evaluator.solver_name(),
            seed = config.rng.seed,
            "contact filter initialized"
        );

        Ok(Self {
            config,
            model,
            catalog,
            locator,
            factory,
            evaluator,
            proposal,
            manager,
            frames,
            sets: Vec::new(),
            rng,
            running: false,
            current_utime: 0,
            current_time: 0.0,
            residual: None,
            joint_positions,
            links_with_external_force: Vec::new(),
            actual_contacts: None,
            most_likely: None,
            unknown_joints_warned: HashSet::new(),
        })
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Stop and forget every hypothesis.
    pub fn reset(&mut self) {
        self.stop();
        self.sets.clear();
        self.most_likely = None;
    }

    pub fn sets(&self) -> &[ParticleSet] {
        &self.sets
    }

    pub fn most_likely(&self) -> Option<&Arc<SolutionRecord>> {
        self.most_likely.as_ref()
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn manager(&self) -> &HypothesisManager {
        &self.manager
    }

    // ------------------------------------------------------------------
    // Message Handlers
    // ------------------------------------------------------------------

    /// Joint configuration update; applied at the top of the next step.
    pub fn on_robot_state(&mut self, msg: &RobotState) {
        let by_name: HashMap<&str, f64> = msg
            .joint_names
            .iter()
            .map(String::as_str)
            .zip(msg.joint_positions.iter().copied())
            .collect();
        for (index, name) in self.model.joint_names().iter().enumerate() {
            if let Some(&value) = by_name.get(name.as_str()) {
                self.joint_positions[index] = value;
            }
        }
        self.warn_unknown_names(&msg.joint_names);
    }

    /// Advisory links for the full-sweep mode.
    pub fn on_external_force_torque(&mut self, msg: &ExternalForceTorque) {
        self.links_with_external_force = msg.body_names.clone();
    }

    /// Ground truth pass-through for logging.
    pub fn on_contact_location(&mut self, msg: &MultipleContactLocations) {
        self.actual_contacts = Some(msg.clone());
    }

    /// Main entry: one residual message, one step (when running).
    pub fn on_residual(&mut self, msg: &ResidualState) -> Result<Option<StepOutput>, FilterError> {
        self.set_current_utime(msg.utime);
        let mut residual = self.align_residual(msg);
        if self.config.noise.add_noise {
            if let Ok(noise) = Normal::new(0.0, self.config.noise.stddev) {
                for value in residual.iter_mut() {
                    *value += noise.sample(&mut self.rng);
                }
            }
        }
        self.residual = Some(residual);

        if !self.running {
            return Ok(None);
        }
        let output = if self.config.debug.full_sweep {
            self.full_sweep_step()?
        } else {
            self.step()?
        };
        Ok(Some(output))
    }

    fn set_current_utime(&mut self, utime: u64) {
        self.current_utime = utime;
        self.current_time = utime as f64 / 1e6;
    }

    /// Reorder the message residual into model joint order; joints the
    /// message omits are zero-filled, unknown names warned once.
    fn align_residual(&mut self, msg: &ResidualState) -> DVector<f64> {
        let by_name: HashMap<&str, f64> = msg
            .joint_names
            .iter()
            .map(String::as_str)
            .zip(msg.residual.iter().copied())
            .collect();
        let aligned = DVector::from_iterator(
            self.model.num_joints(),
            self.model
                .joint_names()
                .iter()
                .map(|name| by_name.get(name.as_str()).copied().unwrap_or(0.0)),
        );
        self.warn_unknown_names(&msg.joint_names);
        aligned
    }

    fn warn_unknown_names(&mut self, names: &[String]) {
        for name in names {
            if !self.model.joint_names().contains(name)
                && self.unknown_joints_warned.insert(name.clone())
            {
                warn!(joint = %name, "message joint unknown to the model, ignoring");
            }
        }
    }

    // ------------------------------------------------------------------
    // The Step
    // ------------------------------------------------------------------

    /// One full particle-filter step over the stored residual.
    pub fn step(&mut self) -> Result<StepOutput, FilterError> {
        let residual = self.residual.clone().ok_or(FilterError::NoResidual)?;

        // 1. put the model at this step's configuration and snapshot frames
        self.model.set_joint_positions(&self.joint_positions)?;
        self.frames.refresh(self.model.as_ref());

        // 2. proposal / motion model
        let filter_best_error = self.most_likely.as_ref().map(|r| r.squared_error);
        for set in &mut self.sets {
            let mut deps = ProposalDeps {
                frames: &self.frames,
                locator: self.locator.as_ref(),
                factory: &self.factory,
                catalog: &self.catalog,
                rng: &mut self.rng,
                filter_best_error,
            };
            self.proposal.propose(set, &mut deps);
        }

        // 3. measurement update, each set conditioned on the others'
        //    historical bests
        let peer_lists: Vec<Vec<EvalContact>> = (0..self.sets.len())
            .map(|index| self.peers_excluding(index))
            .collect();
        for (set, peers) in self.sets.iter_mut().zip(&peer_lists) {
            self.evaluator.measurement_update(
                self.model.as_ref(),
                &residual,
                set,
                peers,
                self.current_time,
            )?;
        }

        // 4. importance resampling
        for set in &mut self.sets {
            set.resample(self.config.num_particles, &mut self.rng);
        }

        // 5. current / historical bests
        for index in 0..self.sets.len() {
            let peers = self.peers_excluding(index);
            let mut deps = BestUpdateDeps {
                evaluator: &self.evaluator,
                model: self.model.as_ref(),
                frames: &self.frames,
                locator: self.locator.as_ref(),
                factory: &self.factory,
                residual: &residual,
                peers: &peers,
                time: self.current_time,
                averaging_bound: self
                    .config
                    .thresholds
                    .squared_error_bound_for_most_likely_particle_averaging,
                use_mode: self.config.debug.use_mode_for_most_likely,
            };
            self.sets[index].update_best(&mut deps)?;
        }

        // 6. publishable estimate
        self.most_likely = self.assemble_most_likely();
        let output = self.build_output(&residual);

        // 7. births and deaths
        let mut deps = ManageDeps {
            model: self.model.as_ref(),
            frames: &self.frames,
            catalog: &self.catalog,
            locator: self.locator.as_ref(),
            factory: &self.factory,
            evaluator: &self.evaluator,
            proposal: &self.proposal,
            rng: &mut self.rng,
            time: self.current_time,
            residual: &residual,
            most_likely: self.most_likely.clone(),
        };
        self.manager.manage(&mut self.sets, &mut deps)?;

        Ok(output)
    }

    /// Historical-best contacts of every set except `index`.
    fn peers_excluding(&self, index: usize) -> Vec<EvalContact> {
        self.sets
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != index)
            .filter_map(|(_, set)| {
                set.historical_particle().map(|p| EvalContact {
                    site: p.site_arc(),
                    owner: Some(set.id()),
                })
            })
            .collect()
    }

    /// One contact per set (its current best), scalars from the first
    /// set's joint solve (which already holds the peers fixed).
    fn assemble_most_likely(&self) -> Option<Arc<SolutionRecord>> {
        let mut contacts = Vec::new();
        let mut base: Option<&Arc<SolutionRecord>> = None;
        for set in &self.sets {
            let Some(record) = set.most_likely().and_then(|p| p.solution()) else {
                continue;
            };
            if base.is_none() {
                base = Some(record);
            }
            if let Some(own) = record.contacts.first() {
                contacts.push(own.clone());
            }
        }
        let base = base?;
        Some(Arc::new(SolutionRecord {
            contacts,
            implied_residual: base.implied_residual.clone(),
            squared_error: base.squared_error,
            likelihood: base.likelihood,
            qp_objective: base.qp_objective,
            time: base.time,
        }))
    }

    // ------------------------------------------------------------------
    // Output Assembly
    // ------------------------------------------------------------------

    fn build_output(&self, residual: &DVector<f64>) -> StepOutput {
        let estimate = self.build_estimate(residual);
        let snapshot = self
            .config
            .vis
            .publish_visualization_data
            .then(|| FilterSnapshot {
                utime: self.current_utime,
                sets: self.sets.iter().map(ParticleSet::snapshot).collect(),
            });
        let comparison = self
            .actual_contacts
            .clone()
            .map(|actual| ActualAndEstimatedContacts {
                utime: self.current_utime,
                actual,
                estimated: estimate.contacts.clone(),
            });
        StepOutput {
            estimate,
            snapshot,
            comparison,
        }
    }

    fn build_estimate(&self, residual: &DVector<f64>) -> ContactEstimate {
        let velocity_names = self.model.joint_names().to_vec();
        let num_velocities = velocity_names.len();
        match self.most_likely.as_ref() {
            None => ContactEstimate {
                utime: self.current_utime,
                num_contact_points: 0,
                num_velocities,
                log_likelihood: self.evaluator.squared_error_no_contacts(residual),
                velocity_names,
                implied_residual: vec![0.0; num_velocities],
                contacts: vec![],
            },
            Some(record) => ContactEstimate {
                utime: self.current_utime,
                num_contact_points: record.contacts.len(),
                num_velocities,
                log_likelihood: record.squared_error,
                velocity_names,
                implied_residual: record.implied_residual.iter().copied().collect(),
                contacts: record
                    .contacts
                    .iter()
                    .map(|c| self.single_contact_estimate(c))
                    .collect(),
            },
        }
    }

    fn single_contact_estimate(&self, contact: &ContactSolution) -> SingleContactEstimate {
        let world_from_link = self.frames.world_from_link(contact.site.link);
        let rotation = world_from_link.rotation;
        SingleContactEstimate {
            body_name: contact.site.link_name.clone(),
            contact_force: contact.force.into(),
            contact_normal: contact.site.normal.into_inner().into(),
            contact_position: contact.site.position.coords.into(),
            contact_force_in_world: (rotation * contact.force).into(),
            contact_normal_in_world: (rotation * contact.site.normal.into_inner()).into(),
            contact_position_in_world: world_from_link
                .transform_point(&contact.site.position)
                .coords
                .into(),
        }
    }

    // ------------------------------------------------------------------
    // Full-Sweep Mode (non-default)
    // ------------------------------------------------------------------

    /// Exhaustive likelihood sweep over the cartesian product of sites on
    /// the hinted links, instead of the particle filter step.
    fn full_sweep_step(&mut self) -> Result<StepOutput, FilterError> {
        let residual = self.residual.clone().ok_or(FilterError::NoResidual)?;
        self.model.set_joint_positions(&self.joint_positions)?;
        self.frames.refresh(self.model.as_ref());

        let mut links: Vec<&str> = self
            .links_with_external_force
            .iter()
            .map(String::as_str)
            .filter(|name| !self.catalog.sites_on_link(name).is_empty())
            .collect();
        if links.len() > MAX_CONTACTS {
            warn!(
                hinted = links.len(),
                "more hinted links than solver contacts, truncating"
            );
            links.truncate(MAX_CONTACTS);
        }
        if links.is_empty() {
            self.most_likely = None;
            return Ok(self.build_output(&residual));
        }

        let site_lists: Vec<&[Arc<crate::catalog::CandidateSite>]> = links
            .iter()
            .map(|name| self.catalog.sites_on_link(name))
            .collect();

        // odometer walk over the cartesian product
        let mut best: Option<Arc<SolutionRecord>> = None;
        let mut indices = vec![0usize; site_lists.len()];
        loop {
            let contacts: Vec<EvalContact> = indices
                .iter()
                .zip(&site_lists)
                .map(|(&i, sites)| EvalContact {
                    site: Arc::clone(&sites[i]),
                    owner: None,
                })
                .collect();
            let record =
                self.evaluator
                    .evaluate(self.model.as_ref(), &residual, &contacts, self.current_time)?;
            if best
                .as_ref()
                .map_or(true, |b| record.squared_error < b.squared_error)
            {
                best = Some(record);
            }

            let mut digit = 0;
            loop {
                if digit == indices.len() {
                    break;
                }
                indices[digit] += 1;
                if indices[digit] < site_lists[digit].len() {
                    break;
                }
                indices[digit] = 0;
                digit += 1;
            }
            if digit == indices.len() {
                break;
            }
        }

        debug!(
            links = links.len(),
            error = best.as_ref().map_or(f64::NAN, |b| b.squared_error),
            "full likelihood sweep complete"
        );
        self.most_likely = best;
        Ok(self.build_output(&residual))
    }
}

// ============================================================================
// Tests
// ============================================================================
