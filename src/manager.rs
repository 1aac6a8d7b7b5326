//! Hypothesis lifecycle: birth, warm-start, and death of particle sets.
//!
//! Birth fires when the fit error has stayed above the add threshold for
//! the persistence window, the add cooldown has elapsed, and the set cap
//! allows it; the newborn is seeded from catalog links no existing
//! hypothesis claims. Death fires when dropping a contact from a set's
//! best solution does not worsen the fit. At most one death per step, and
//! a birth always wins over a death in the same step. All clocks run on
//! simulated time.

use crate::catalog::SurfaceCatalog;
use crate::config::CpfConfig;
use crate::likelihood::{EvalContact, LikelihoodEvaluator, SolutionRecord};
use crate::locator::{SiteFactory, SurfaceLocator};
use crate::model::{LinkFrameCache, RigidBodyModel};
use crate::particles::{BestUpdateDeps, Particle, ParticleSet, SetId};
use crate::proposal::{ProposalDeps, ProposalEngine};
use crate::solver::SolverError;
use nalgebra::DVector;
use rand::rngs::StdRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Display palette cycled over newborn sets: purple, orange, yellow,
/// blue-green.
pub const SET_COLORS: [[f64; 3]; 4] = [
    [0.5, 0.0, 0.5],
    [1.0, 0.64, 0.0],
    [1.0, 1.0, 0.0],
    [0.13, 0.7, 0.66],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    Added(SetId),
    Removed(SetId),
}

/// Step context handed down by the driver.
pub struct ManageDeps<'a> {
    pub model: &'a dyn RigidBodyModel,
    pub frames: &'a LinkFrameCache,
    pub catalog: &'a SurfaceCatalog,
    pub locator: &'a dyn SurfaceLocator,
    pub factory: &'a SiteFactory,
    pub evaluator: &'a LikelihoodEvaluator,
    pub proposal: &'a ProposalEngine,
    pub rng: &'a mut StdRng,
    pub time: f64,
    pub residual: &'a DVector<f64>,
    /// Filter-level most-likely solution from this step's update.
    pub most_likely: Option<Arc<SolutionRecord>>,
}

pub struct HypothesisManager {
    config: Arc<CpfConfig>,
    last_set_added: Option<f64>,
    last_set_removed: Option<f64>,
    /// Last simulated time the fit error was below the add threshold; the
    /// persistence clock. Starts at the first managed step.
    last_time_below_add_threshold: Option<f64>,
    next_set_id: u64,
    color_cycle: usize,
}

impl HypothesisManager {
    pub fn new(config: Arc<CpfConfig>) -> Self {
        Self {
            config,
            last_set_added: None,
            last_set_removed: None,
            last_time_below_add_threshold: None,
            next_set_id: 0,
            color_cycle: 0,
        }
    }

    pub fn last_set_added(&self) -> Option<f64> {
        self.last_set_added
    }

    pub fn last_set_removed(&self) -> Option<f64> {
        self.last_set_removed
    }

    /// Run the birth/death rules once, after a measurement update.
    pub fn manage(
        &mut self,
        sets: &mut Vec<ParticleSet>,
        deps: &mut ManageDeps<'_>,
    ) -> Result<Option<ManagerEvent>, SolverError> {
        let no_contact_error = deps.evaluator.squared_error_no_contacts(deps.residual);

        // the k−1 solves the removal scan needs
        for set in sets.iter_mut() {
            set.compute_removal_errors(
                deps.evaluator,
                deps.model,
                deps.residual,
                no_contact_error,
                deps.time,
            )?;
        }

        let thresholds = self.config.thresholds.clone();
        let mut want_add = false;
        let mut claimed_links: BTreeSet<String> = BTreeSet::new();

        match deps.most_likely.as_ref() {
            None => {
                if no_contact_error > thresholds.add_contact_point_squared_error {
                    want_add = true;
                } else {
                    self.last_time_below_add_threshold = Some(deps.time);
                }
            }
            Some(record) => {
                if record.squared_error < thresholds.add_contact_point_squared_error {
                    self.last_time_below_add_threshold = Some(deps.time);
                } else {
                    want_add = true;
                    for contact in &record.contacts {
                        claimed_links.insert(contact.site.link_name.clone());
                    }
                }
            }
        }

        let below_since = *self
            .last_time_below_add_threshold
            .get_or_insert(deps.time);
        let persistence_ok = (deps.time - below_since)
            >= thresholds.time_above_threshold_to_add_particle_set;
        let add_cooldown_ok = self
            .last_set_added
            .map_or(true, |t| (deps.time - t) >= thresholds.add_contact_point_timeout);
        let remove_cooldown_ok = self.last_set_removed.map_or(true, |t| {
            (deps.time - t) >= thresholds.remove_contact_point_timeout
        });

        if want_add {
            if !persistence_ok || !add_cooldown_ok {
                debug!(
                    time = deps.time,
                    persistence_ok, add_cooldown_ok, "birth blocked by timing gates"
                );
                return Ok(None);
            }
            if sets.len() >= self.config.debug.max_num_particle_sets {
                debug!("reached max number of particle sets");
                return Ok(None);
            }
            let id = self.birth(sets, &claimed_links, deps)?;
            return Ok(Some(ManagerEvent::Added(id)));
        }

        // removal scan: first below-threshold contact is the only
        // candidate this step
        let mut candidate: Option<Option<SetId>> = None;
        'scan: for set in sets.iter() {
            for &(owner, error) in set.removal_errors() {
                if error < thresholds.remove_contact_point_squared_error {
                    candidate = Some(owner);
                    break 'scan;
                }
            }
        }
        if let Some(owner) = candidate {
            if !remove_cooldown_ok {
                debug!(time = deps.time, "death blocked by remove cooldown");
                return Ok(None);
            }
            if let Some(owner_id) = owner {
                if let Some(position) = sets.iter().position(|s| s.id() == owner_id) {
                    let removed = sets.remove(position);
                    self.last_set_removed = Some(deps.time);
                    info!(
                        set = removed.id().0,
                        time = deps.time,
                        "dropping a contact did not hurt the fit, removing particle set"
                    );
                    return Ok(Some(ManagerEvent::Removed(removed.id())));
                }
                debug!(set = owner_id.0, "removal candidate no longer in the hypothesis list");
            }
        }
        Ok(None)
    }

    /// Create, seed, and warm-start a new hypothesis.
    fn birth(
        &mut self,
        sets: &mut Vec<ParticleSet>,
        claimed_links: &BTreeSet<String>,
        deps: &mut ManageDeps<'_>,
    ) -> Result<SetId, SolverError> {
        let id = SetId(self.next_set_id);
        self.next_set_id += 1;
        let color = SET_COLORS[self.color_cycle % SET_COLORS.len()];
        self.color_cycle += 1;

        let mut newborn = ParticleSet::new(id, color);
        for site in deps.catalog.iter() {
            if !claimed_links.contains(&site.link_name) {
                newborn.add(Particle::new(Arc::clone(site)));
            }
        }
        if newborn.number() == 0 {
            // every link already claimed: fall back to the whole catalog
            for site in deps.catalog.iter() {
                newborn.add(Particle::new(Arc::clone(site)));
            }
        }
        self.last_set_added = Some(deps.time);
        info!(
            set = id.0,
            particles = newborn.number(),
            time = deps.time,
            "adding a particle set"
        );

        let peers: Vec<EvalContact> = sets
            .iter()
            .filter_map(|s| {
                s.historical_particle().map(|p| EvalContact {
                    site: p.site_arc(),
                    owner: Some(s.id()),
                })
            })
            .collect();

        let warm_steps = self.config.add_particle_set.num_initial_steps;
        for _ in 0..warm_steps {
            let mut proposal_deps = ProposalDeps {
                frames: deps.frames,
                locator: deps.locator,
                factory: deps.factory,
                catalog: deps.catalog,
                rng: &mut *deps.rng,
                filter_best_error: deps.most_likely.as_ref().map(|r| r.squared_error),
            };
            deps.proposal.motion_step_all(&mut newborn, &mut proposal_deps);
            deps.evaluator.measurement_update(
                deps.model,
                deps.residual,
                &mut newborn,
                &peers,
                deps.time,
            )?;
            newborn.resample(self.config.num_particles, &mut *deps.rng);
        }

        if warm_steps > 0 {
            let mut best_deps = BestUpdateDeps {
                evaluator: deps.evaluator,
                model: deps.model,
                frames: deps.frames,
                locator: deps.locator,
                factory: deps.factory,
                residual: deps.residual,
                peers: &peers,
                time: deps.time,
                averaging_bound: self
                    .config
                    .thresholds
                    .squared_error_bound_for_most_likely_particle_averaging,
                use_mode: self.config.debug.use_mode_for_most_likely,
            };
            newborn.update_best(&mut best_deps)?;

            // the warm-start transient must not corrupt established peers
            for other in sets.iter_mut() {
                other.reset_to_historical(self.config.num_particles);
            }
        }

        sets.push(newborn);
        Ok(id)
    }
}

// ============================================================================
// Tests
// ============================================================================
