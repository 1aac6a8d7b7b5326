//! Proposal and motion model.
//!
//! Each step splits a set's particles into the motion-model group (world
//! Gaussian about each particle, variance scheduled by the current fit
//! error) and the historical group (drawn around the historical best,
//! importance-reweighted so the target stays the motion model). On top of
//! those, exact duplicates of the historical best keep a good hypothesis
//! alive, and a uniform catalog reseed kicks in when the fit error is high.
//!
//! The original discrete catalog-graph motion model is preserved behind
//! `motion_model.discrete`.

use crate::catalog::{CandidateSite, SurfaceCatalog};
use crate::config::CpfConfig;
use crate::locator::{SiteFactory, SurfaceLocator};
use crate::model::{LinkFrameCache, RigidBodyModel};
use crate::particles::{Particle, ParticleSet};
use nalgebra::{DVector, Point3, Vector3};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand_distr::Normal;
use statrs::distribution::Continuous;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Locator retries before a particle keeps its old site.
const MAX_PROJECTION_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("discrete motion model rejected transition weights: {0}")]
    DiscreteWeights(String),

    #[error(transparent)]
    Model(#[from] crate::model::ModelError),
}

/// What a proposal pass did to a set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProposalOutcome {
    pub reseeded: usize,
}

/// Per-step dependencies handed in by the driver.
pub struct ProposalDeps<'a> {
    pub frames: &'a LinkFrameCache,
    pub locator: &'a dyn SurfaceLocator,
    pub factory: &'a SiteFactory,
    pub catalog: &'a SurfaceCatalog,
    pub rng: &'a mut StdRng,
    /// Squared error of the filter-level most-likely solution, if any.
    pub filter_best_error: Option<f64>,
}

// ============================================================================
// Engine
// ============================================================================

pub struct ProposalEngine {
    config: Arc<CpfConfig>,
    discrete: Option<DiscreteMotionModel>,
}

impl ProposalEngine {
    pub fn new(config: Arc<CpfConfig>) -> Self {
        Self {
            config,
            discrete: None,
        }
    }

    /// Attach the precomputed discrete motion model (built once at startup
    /// from the zero-pose catalog geometry).
    pub fn with_discrete_model(mut self, model: DiscreteMotionModel) -> Self {
        self.discrete = Some(model);
        self
    }

    /// Advance every particle of `set` one step.
    pub fn propose(&self, set: &mut ParticleSet, deps: &mut ProposalDeps<'_>) -> ProposalOutcome {
        let (current, historical) = match (set.most_likely().cloned(), set.historical_particle().cloned())
        {
            (Some(c), Some(h)) => (c, h),
            // before the first measurement there is nothing to anchor on
            _ => {
                self.motion_step_all(set, deps);
                return ProposalOutcome::default();
            }
        };

        let population = set.number();
        let split = (population as f64 * self.config.proposal.normal_fraction).floor() as usize;
        let motion_variance = self.motion_variance(deps.filter_best_error);

        for index in 0..split {
            self.motion_step(&mut set.particles_mut()[index], motion_variance, deps);
        }
        self.historical_step(set, split, &current, &historical, motion_variance, deps);

        // pin a few exact copies of the historical best
        for _ in 0..self.config.proposal.historical.num_particles_at_actual {
            let mut copy = historical.clone();
            copy.set_proposal_weight(1.0);
            set.add(copy);
        }

        // uniform reseed when the fit has gone bad
        let mut reseeded = 0;
        if let Some(error) = current.squared_error() {
            if error > self.config.proposal.seed_distribution.squared_error_threshold {
                let count = self.config.proposal.seed_distribution.num_particles;
                debug!(set = set.id().0, error, count, "error above seed threshold, drawing from catalog");
                for site in deps.catalog.draw_uniform(count, deps.rng) {
                    set.add(Particle::new(site));
                    reseeded += 1;
                }
            }
        }
        ProposalOutcome { reseeded }
    }

    /// Pure motion-model pass: every particle steps, weight 1.
    pub fn motion_step_all(&self, set: &mut ParticleSet, deps: &mut ProposalDeps<'_>) {
        let variance = self.motion_variance(deps.filter_best_error);
        for particle in set.particles_mut() {
            self.motion_step(particle, variance, deps);
        }
    }

    /// σ²_m schedule: interpolate between var_min and var_max by the
    /// current fit error, saturating at the cutoff.
    fn motion_variance(&self, best_error: Option<f64>) -> f64 {
        let mm = &self.config.motion_model;
        match best_error {
            Some(error) => {
                let alpha = (error / mm.var_max_squared_error_cutoff).min(1.0);
                alpha * mm.var_max + (1.0 - alpha) * mm.var_min
            }
            None => mm.var_max,
        }
    }

    fn motion_step(&self, particle: &mut Particle, variance: f64, deps: &mut ProposalDeps<'_>) {
        particle.set_proposal_weight(1.0);

        if let Some(discrete) = &self.discrete {
            if let Some(next) = discrete.step(particle.site(), deps.rng) {
                particle.set_site(next);
                return;
            }
            // adapter-born site with no catalog row: continuous fallback
        }

        let origin = particle.site().world_position(deps.frames);
        for _ in 0..MAX_PROJECTION_ATTEMPTS {
            let target = sample_isotropic(&origin, variance, deps.rng);
            let Some(closest) = deps.locator.find_closest_point(&target, deps.frames) else {
                continue;
            };
            match deps.factory.site_from_closest(&closest, deps.frames) {
                Ok(site) => {
                    particle.set_site(site);
                    return;
                }
                Err(e) => {
                    // invalid surface answer: drop this draw and redraw
                    debug!(error = %e, "locator produced invalid site, redrawing");
                }
            }
        }
        warn!(
            link = %particle.site().link_name,
            "motion step exhausted projection attempts, particle stays put"
        );
    }

    /// Sample the tail group around the historical best and importance-
    /// reweight against the motion model.
    fn historical_step(
        &self,
        set: &mut ParticleSet,
        split: usize,
        current: &Particle,
        historical: &Particle,
        motion_variance: f64,
        deps: &mut ProposalDeps<'_>,
    ) {
        let historical_point = historical.site().world_position(deps.frames);
        let current_point = current.site().world_position(deps.frames);
        let proposal_variance = self.config.proposal.historical.variance;

        for index in split..set.number() {
            let sampled = sample_isotropic(&historical_point, proposal_variance, deps.rng);

            let motion_density = isotropic_pdf(&current_point, motion_variance, &sampled);
            let proposal_density = isotropic_pdf(&historical_point, proposal_variance, &sampled);
            let weight = if proposal_density > f64::MIN_POSITIVE {
                motion_density / proposal_density
            } else {
                1.0
            };

            let particle = &mut set.particles_mut()[index];
            if let Some(closest) = deps.locator.find_closest_point(&sampled, deps.frames) {
                if let Ok(site) = deps.factory.site_from_closest(&closest, deps.frames) {
                    particle.set_site(site);
                    particle.set_proposal_weight(weight);
                    continue;
                }
            }
            // no valid projection: leave the site, take a plain motion draw
            let variance = motion_variance;
            self.motion_step(&mut set.particles_mut()[index], variance, deps);
        }
    }
}

// ============================================================================
// Gaussian Helpers
// ============================================================================

fn sample_isotropic(mean: &Point3<f64>, variance: f64, rng: &mut StdRng) -> Point3<f64> {
    let Ok(normal) = Normal::new(0.0, variance.sqrt()) else {
        return *mean;
    };
    Point3::new(
        mean.x + normal.sample(rng),
        mean.y + normal.sample(rng),
        mean.z + normal.sample(rng),
    )
}

/// Density of 𝒩(mean, variance·I₃) at `x`, as a product of axis marginals.
fn isotropic_pdf(mean: &Point3<f64>, variance: f64, x: &Point3<f64>) -> f64 {
    let Ok(normal) = statrs::distribution::Normal::new(0.0, variance.sqrt()) else {
        return 0.0;
    };
    normal.pdf(x.x - mean.x) * normal.pdf(x.y - mean.y) * normal.pdf(x.z - mean.z)
}

// ============================================================================
// Discrete Motion Model (preserved alternative)
// ============================================================================

/// Precomputed categorical transitions between catalog sites, weighted by
/// world distance at the zero pose. Coarse, but allocation-free per step.
pub struct DiscreteMotionModel {
    sites: Vec<Arc<CandidateSite>>,
    transitions: Vec<WeightedIndex<f64>>,
}

impl DiscreteMotionModel {
    pub fn build(
        catalog: &SurfaceCatalog,
        model: &mut dyn RigidBodyModel,
        variance: f64,
    ) -> Result<Self, ProposalError> {
        model.set_joint_positions(&DVector::zeros(model.num_joints()))?;
        let mut frames = LinkFrameCache::new();
        frames.refresh(model);

        let sites: Vec<Arc<CandidateSite>> = catalog.iter().map(Arc::clone).collect();
        let positions: Vec<Vector3<f64>> = sites
            .iter()
            .map(|s| s.world_position(&frames).coords)
            .collect();

        let transitions = positions
            .iter()
            .map(|from| {
                let weights: Vec<f64> = positions
                    .iter()
                    .map(|to| (-(from - to).norm_squared() / (2.0 * variance)).exp())
                    .collect();
                WeightedIndex::new(weights)
                    .map_err(|e| ProposalError::DiscreteWeights(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { sites, transitions })
    }

    /// Draw the successor site. `None` for sites outside the catalog range
    /// (adapter-born), which use the continuous step instead.
    fn step(&self, from: &CandidateSite, rng: &mut StdRng) -> Option<Arc<CandidateSite>> {
        let index = from.id.0 as usize;
        if index >= self.transitions.len() {
            return None;
        }
        let next = self.transitions[index].sample(rng);
        Some(Arc::clone(&self.sites[next]))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SiteId;
    use crate::likelihood::SolutionRecord;
    use crate::locator::CatalogLocator;
    use crate::model::KinematicTree;
    use crate::particles::SetId;
    use rand::SeedableRng;

    fn fixture() -> (KinematicTree, Arc<SurfaceCatalog>) {
        let mut model = KinematicTree::from_urdf_str(
            r#"<robot name="r">
                 <link name="base"/>
                 <link name="arm"/>
                 <joint name="j" type="revolute">
                   <origin xyz="0.3 0 0"/>
                   <axis xyz="0 0 1"/>
                   <parent link="base"/>
                   <child link="arm"/>
                 </joint>
               </robot>"#,
        )
        .expect("parse");
        let entries: Vec<(&str, Point3<f64>, Vector3<f64>)> = (0..6)
            .map(|i| {
                (
                    "arm",
                    Point3::new(0.05 * f64::from(i), 0.02, 0.0),
                    Vector3::y(),
                )
            })
            .collect();
        let catalog =
            Arc::new(SurfaceCatalog::from_entries(entries, &model).expect("catalog"));
        model
            .set_joint_positions(&DVector::zeros(1))
            .expect("set q");
        (model, catalog)
    }

    fn record(error: f64) -> Arc<SolutionRecord> {
        Arc::new(SolutionRecord {
            contacts: vec![],
            implied_residual: DVector::zeros(1),
            squared_error: error,
            likelihood: (-0.5 * error).exp(),
            qp_objective: error,
            time: 0.0,
        })
    }

    fn scored_particle(catalog: &SurfaceCatalog, id: u32, error: f64) -> Particle {
        let mut p = Particle::new(Arc::clone(catalog.get(SiteId(id)).expect("site")));
        p.set_solution(record(error));
        p
    }

    struct Ctx {
        frames: LinkFrameCache,
        locator: CatalogLocator,
        factory: SiteFactory,
        catalog: Arc<SurfaceCatalog>,
        rng: StdRng,
    }

    fn ctx(model: &KinematicTree, catalog: &Arc<SurfaceCatalog>) -> Ctx {
        let mut frames = LinkFrameCache::new();
        frames.refresh(model);
        Ctx {
            frames,
            locator: CatalogLocator::new(Arc::clone(catalog)),
            factory: SiteFactory::new(u32::try_from(catalog.len()).expect("fits")),
            catalog: Arc::clone(catalog),
            rng: StdRng::seed_from_u64(11),
        }
    }

    fn populated_set(catalog: &SurfaceCatalog, n: usize, best_error: f64) -> ParticleSet {
        let mut set = ParticleSet::new(SetId(0), [1.0, 0.64, 0.0]);
        for i in 0..n {
            set.add(scored_particle(catalog, (i % 6) as u32, 1.0));
        }
        set.set_best(0.0, scored_particle(catalog, 0, best_error));
        set
    }

    #[test]
    fn population_grows_by_duplicates_only_when_error_is_low() {
        let (model, catalog) = fixture();
        let config = Arc::new(CpfConfig::default());
        let engine = ProposalEngine::new(Arc::clone(&config));
        let mut c = ctx(&model, &catalog);
        // best error below the seed threshold (5.0): no reseed
        let mut set = populated_set(&catalog, 40, 0.5);
        let mut deps = ProposalDeps {
            frames: &c.frames,
            locator: &c.locator,
            factory: &c.factory,
            catalog: &c.catalog,
            rng: &mut c.rng,
            filter_best_error: Some(0.5),
        };
        let outcome = engine.propose(&mut set, &mut deps);
        assert_eq!(outcome.reseeded, 0);
        assert_eq!(
            set.number(),
            40 + config.proposal.historical.num_particles_at_actual
        );
    }

    #[test]
    fn high_error_triggers_catalog_reseed() {
        let (model, catalog) = fixture();
        let config = Arc::new(CpfConfig::default());
        let engine = ProposalEngine::new(Arc::clone(&config));
        let mut c = ctx(&model, &catalog);
        let mut set = populated_set(&catalog, 40, 50.0);
        let mut deps = ProposalDeps {
            frames: &c.frames,
            locator: &c.locator,
            factory: &c.factory,
            catalog: &c.catalog,
            rng: &mut c.rng,
            filter_best_error: Some(50.0),
        };
        let outcome = engine.propose(&mut set, &mut deps);
        assert_eq!(outcome.reseeded, config.proposal.seed_distribution.num_particles);
        assert_eq!(
            set.number(),
            40 + config.proposal.historical.num_particles_at_actual
                + config.proposal.seed_distribution.num_particles
        );
    }

    #[test]
    fn unanchored_set_takes_pure_motion_steps() {
        let (model, catalog) = fixture();
        let engine = ProposalEngine::new(Arc::new(CpfConfig::default()));
        let mut c = ctx(&model, &catalog);
        let mut set = ParticleSet::new(SetId(0), [1.0, 1.0, 0.0]);
        for i in 0..10 {
            set.add(Particle::new(Arc::clone(
                catalog.get(SiteId(i % 6)).expect("site"),
            )));
        }
        let mut deps = ProposalDeps {
            frames: &c.frames,
            locator: &c.locator,
            factory: &c.factory,
            catalog: &c.catalog,
            rng: &mut c.rng,
            filter_best_error: None,
        };
        let outcome = engine.propose(&mut set, &mut deps);
        assert_eq!(outcome.reseeded, 0);
        assert_eq!(set.number(), 10);
        assert!(set
            .particles()
            .iter()
            .all(|p| (p.proposal_weight() - 1.0).abs() < 1e-12));
    }

    #[test]
    fn historical_group_carries_importance_weights() {
        let (model, catalog) = fixture();
        let engine = ProposalEngine::new(Arc::new(CpfConfig::default()));
        let mut c = ctx(&model, &catalog);
        let mut set = populated_set(&catalog, 30, 0.5);
        let mut deps = ProposalDeps {
            frames: &c.frames,
            locator: &c.locator,
            factory: &c.factory,
            catalog: &c.catalog,
            rng: &mut c.rng,
            filter_best_error: Some(0.5),
        };
        engine.propose(&mut set, &mut deps);
        // all weights must be positive and finite; the historical tail is
        // reweighted, the motion group sits at exactly 1
        assert!(set
            .particles()
            .iter()
            .all(|p| p.proposal_weight().is_finite() && p.proposal_weight() > 0.0));
        let reweighted = set
            .particles()
            .iter()
            .filter(|p| (p.proposal_weight() - 1.0).abs() > 1e-12)
            .count();
        assert!(reweighted > 0, "historical tail should be reweighted");
    }

    #[test]
    fn variance_schedule_saturates_at_cutoff() {
        let config = CpfConfig::default();
        let engine = ProposalEngine::new(Arc::new(config.clone()));
        let low = engine.motion_variance(Some(0.0));
        let high = engine.motion_variance(Some(config.motion_model.var_max_squared_error_cutoff * 10.0));
        assert!((low - config.motion_model.var_min).abs() < 1e-12);
        assert!((high - config.motion_model.var_max).abs() < 1e-12);
        assert!((engine.motion_variance(None) - config.motion_model.var_max).abs() < 1e-12);
    }

    #[test]
    fn discrete_model_stays_on_catalog_sites() {
        let (mut model, catalog) = fixture();
        let discrete =
            DiscreteMotionModel::build(&catalog, &mut model, 0.01).expect("build");
        let mut rng = StdRng::seed_from_u64(5);
        for i in 0..6u32 {
            let from = catalog.get(SiteId(i)).expect("site");
            let next = discrete.step(from, &mut rng).expect("catalog site steps");
            assert!((next.id.0 as usize) < catalog.len());
        }
        // an adapter-born site (id beyond the catalog) is not covered
        let foreign = crate::catalog::CandidateSite::new(
            SiteId(99),
            crate::model::LinkId(1),
            "arm",
            Point3::origin(),
            Vector3::y(),
            crate::catalog::DEFAULT_MU,
        )
        .expect("site");
        assert!(discrete.step(&foreign, &mut rng).is_none());
    }
}
