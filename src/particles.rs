//! Particles and per-hypothesis particle sets.
//!
//! A [`ParticleSet`] tracks exactly one contact: a population of particles
//! over the body surface, the current most-likely particle, and a bounded
//! time-window of recent best solutions from which the historical
//! most-likely is derived. Sets own their particles outright; solution
//! records refer to sets only through [`SetId`], never through handles, so
//! there are no ownership cycles.

use crate::likelihood::{EvalContact, LikelihoodEvaluator, SolutionRecord};
use crate::locator::{SiteFactory, SurfaceLocator};
use crate::model::{LinkFrameCache, RigidBodyModel};
use crate::solver::SolverError;
use crate::types::{ParticleSetSnapshot, ParticleSnapshot};
use nalgebra::{DVector, Point3, Vector3};
use ordered_float::OrderedFloat;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

/// Weight sums below this trip the reciprocal-error resampling fallback.
pub const DEGENERATE_WEIGHT_SUM: f64 = 1e-6;

/// Solution-window length in simulated seconds.
pub const DEFAULT_WINDOW_TIMEOUT: f64 = 1.0;

/// Stable hypothesis identity, issued by the manager at birth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetId(pub u64);

// ============================================================================
// Particle
// ============================================================================

/// One hypothesis about where a single contact is. Lives exactly one
/// resample cycle; the set rebuilds its population from scratch each time.
#[derive(Debug, Clone)]
pub struct Particle {
    site: Arc<crate::catalog::CandidateSite>,
    solution: Option<Arc<SolutionRecord>>,
    /// Motion density ÷ proposal density; 1 when drawn from the motion
    /// model itself.
    proposal_weight: f64,
}

impl Particle {
    pub fn new(site: Arc<crate::catalog::CandidateSite>) -> Self {
        Self {
            site,
            solution: None,
            proposal_weight: 1.0,
        }
    }

    pub fn site(&self) -> &crate::catalog::CandidateSite {
        &self.site
    }

    pub fn site_arc(&self) -> Arc<crate::catalog::CandidateSite> {
        Arc::clone(&self.site)
    }

    /// Move the particle to a new site. The stale solution record stays
    /// attached until the next measurement update overwrites it.
    pub fn set_site(&mut self, site: Arc<crate::catalog::CandidateSite>) {
        self.site = site;
    }

    pub fn solution(&self) -> Option<&Arc<SolutionRecord>> {
        self.solution.as_ref()
    }

    pub fn set_solution(&mut self, record: Arc<SolutionRecord>) {
        self.solution = Some(record);
    }

    pub fn proposal_weight(&self) -> f64 {
        self.proposal_weight
    }

    pub fn set_proposal_weight(&mut self, weight: f64) {
        self.proposal_weight = weight;
    }

    pub fn squared_error(&self) -> Option<f64> {
        self.solution.as_ref().map(|s| s.squared_error)
    }

    fn snapshot(&self) -> ParticleSnapshot {
        let force = self
            .solution
            .as_ref()
            .map_or_else(|| self.site.normal.into_inner(), |s| s.own_force());
        ParticleSnapshot {
            link_name: self.site.link_name.clone(),
            contact_location: self.site.position.coords.into(),
            contact_normal: self.site.normal.into_inner().into(),
            contact_force: force.into(),
        }
    }
}

// ============================================================================
// Best-Update Dependencies
// ============================================================================

/// Everything `update_best` needs from the step context.
pub struct BestUpdateDeps<'a> {
    pub evaluator: &'a LikelihoodEvaluator,
    pub model: &'a dyn RigidBodyModel,
    pub frames: &'a LinkFrameCache,
    pub locator: &'a dyn SurfaceLocator,
    pub factory: &'a SiteFactory,
    pub residual: &'a DVector<f64>,
    pub peers: &'a [EvalContact],
    pub time: f64,
    /// Particles under this squared error join the world-space average.
    pub averaging_bound: f64,
    /// Use the most-populated-site policy instead of averaging.
    pub use_mode: bool,
}

// ============================================================================
// Particle Set
// ============================================================================

#[derive(Debug, Clone)]
struct BestEntry {
    time: f64,
    particle: Particle,
}

/// Population of particles tracking one contact.
pub struct ParticleSet {
    id: SetId,
    color: [f64; 3],
    particles: Vec<Particle>,
    most_likely: Option<Particle>,
    window: VecDeque<BestEntry>,
    window_timeout: f64,
    historical: Option<BestEntry>,
    /// Squared error with each best-solution contact removed, tagged by the
    /// set owning that contact. Filled on demand for the manager.
    removal_errors: Vec<(Option<SetId>, f64)>,
}

impl ParticleSet {
    pub fn new(id: SetId, color: [f64; 3]) -> Self {
        Self::with_window_timeout(id, color, DEFAULT_WINDOW_TIMEOUT)
    }

    pub fn with_window_timeout(id: SetId, color: [f64; 3], window_timeout: f64) -> Self {
        Self {
            id,
            color,
            particles: Vec::new(),
            most_likely: None,
            window: VecDeque::new(),
            window_timeout,
            historical: None,
            removal_errors: Vec::new(),
        }
    }

    pub fn id(&self) -> SetId {
        self.id
    }

    pub fn color(&self) -> [f64; 3] {
        self.color
    }

    pub fn add(&mut self, particle: Particle) {
        self.particles.push(particle);
    }

    pub fn number(&self) -> usize {
        self.particles.len()
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    pub fn set_particles(&mut self, particles: Vec<Particle>) {
        self.particles = particles;
    }

    pub fn most_likely(&self) -> Option<&Particle> {
        self.most_likely.as_ref()
    }

    pub fn current_best_error(&self) -> Option<f64> {
        self.most_likely.as_ref().and_then(Particle::squared_error)
    }

    /// Best solution seen within the sliding window. Exists iff at least
    /// one measurement has been processed.
    pub fn historical_particle(&self) -> Option<&Particle> {
        self.historical.as_ref().map(|e| &e.particle)
    }

    pub fn historical_error(&self) -> Option<f64> {
        self.historical
            .as_ref()
            .and_then(|e| e.particle.squared_error())
    }

    pub fn removal_errors(&self) -> &[(Option<SetId>, f64)] {
        &self.removal_errors
    }

    /// Squared error of the best solution with `owner`'s contact removed.
    /// Valid after [`compute_removal_errors`](Self::compute_removal_errors).
    pub fn squared_error_without(&self, owner: SetId) -> Option<f64> {
        self.removal_errors
            .iter()
            .find(|(o, _)| *o == Some(owner))
            .map(|(_, error)| *error)
    }

    // ------------------------------------------------------------------
    // Resampling
    // ------------------------------------------------------------------

    /// Importance-resample `n` particles with replacement, weighted by
    /// likelihood × proposal weight. Degenerate weight sums fall back to
    /// proposal weight ÷ squared error.
    pub fn resample(&mut self, n: usize, rng: &mut StdRng) {
        if self.particles.is_empty() {
            return;
        }

        let mut weights: Vec<f64> = self
            .particles
            .iter()
            .map(|p| {
                let likelihood = p.solution().map_or(0.0, |s| s.likelihood);
                sanitize(likelihood * p.proposal_weight())
            })
            .collect();

        if weights.iter().sum::<f64>() < DEGENERATE_WEIGHT_SUM {
            warn!(
                set = self.id.0,
                "weight sum degenerate, resampling by reciprocal error"
            );
            weights = self
                .particles
                .iter()
                .map(|p| {
                    let error = p.squared_error().unwrap_or(f64::INFINITY);
                    sanitize(p.proposal_weight() / error.max(1e-12))
                })
                .collect();
        }

        if weights.iter().sum::<f64>() <= 0.0 {
            // nothing scored at all: draw uniformly
            weights.iter_mut().for_each(|w| *w = 1.0);
        }

        // the all-ones fallback above guarantees a valid categorical
        let Ok(categorical) = WeightedIndex::new(&weights) else {
            warn!(set = self.id.0, "resampling weights rejected, keeping population");
            return;
        };

        let next: Vec<Particle> = (0..n)
            .map(|_| {
                let mut p = self.particles[categorical.sample(rng)].clone();
                p.set_proposal_weight(1.0);
                p
            })
            .collect();
        self.particles = next;
    }

    // ------------------------------------------------------------------
    // Best Tracking
    // ------------------------------------------------------------------

    /// Install `particle` as the current most-likely and fold its solution
    /// into the sliding window.
    pub fn set_best(&mut self, time: f64, particle: Particle) {
        debug_assert!(particle.solution().is_some(), "best particle must be scored");
        self.most_likely = Some(particle.clone());
        self.window.push_back(BestEntry { time, particle });
        self.prune_window(time);
        self.recompute_historical();
    }

    /// Recompute the current most-likely after a measurement update.
    ///
    /// Averaging policy: particles under the bound are averaged in world
    /// coordinates, the mean is projected back to the surface, and the
    /// re-evaluated projection becomes the best. Falls back to the
    /// smallest-error particle when no particle is under the bound or the
    /// projection fails.
    pub fn update_best(
        &mut self,
        deps: &mut BestUpdateDeps<'_>,
    ) -> Result<(), SolverError> {
        if deps.use_mode {
            self.update_best_by_mode(deps.time);
            return Ok(());
        }

        let mut smallest: Option<&Particle> = None;
        let mut below: Vec<&Particle> = Vec::new();
        for particle in &self.particles {
            let Some(error) = particle.squared_error() else {
                continue;
            };
            if smallest
                .and_then(Particle::squared_error)
                .map_or(true, |best| error < best)
            {
                smallest = Some(particle);
            }
            if error < deps.averaging_bound {
                below.push(particle);
            }
        }
        let Some(smallest) = smallest.cloned() else {
            // no particle has been scored yet
            return Ok(());
        };

        if !below.is_empty() {
            let mut mean = Vector3::zeros();
            for particle in &below {
                mean += particle.site().world_position(deps.frames).coords;
            }
            mean /= below.len() as f64;

            if let Some(closest) = deps
                .locator
                .find_closest_point(&Point3::from(mean), deps.frames)
            {
                if let Ok(site) = deps.factory.site_from_closest(&closest, deps.frames) {
                    let mut contacts = Vec::with_capacity(1 + deps.peers.len());
                    contacts.push(EvalContact {
                        site: Arc::clone(&site),
                        owner: Some(self.id),
                    });
                    contacts.extend_from_slice(deps.peers);
                    let record =
                        deps.evaluator
                            .evaluate(deps.model, deps.residual, &contacts, deps.time)?;
                    let mut particle = Particle::new(site);
                    particle.set_solution(record);
                    self.set_best(deps.time, particle);
                    return Ok(());
                }
            }
            // projection failed: an invalid surface answer falls back to
            // the smallest-error particle
        }

        self.set_best(deps.time, smallest);
        Ok(())
    }

    /// Alternative policy: the particle at the most-populated site.
    fn update_best_by_mode(&mut self, time: f64) {
        let mut counts: HashMap<crate::catalog::SiteId, (usize, usize)> = HashMap::new();
        for (index, particle) in self.particles.iter().enumerate() {
            if particle.solution().is_none() {
                continue;
            }
            counts
                .entry(particle.site().id)
                .and_modify(|(count, _)| *count += 1)
                .or_insert((1, index));
        }
        // ties break toward the earliest particle for determinism
        let best = counts
            .values()
            .max_by_key(|(count, first)| (*count, std::cmp::Reverse(*first)))
            .map(|&(_, index)| self.particles[index].clone());
        if let Some(particle) = best {
            self.set_best(time, particle);
        }
    }

    fn prune_window(&mut self, now: f64) {
        let timeout = self.window_timeout;
        self.window.retain(|entry| (now - entry.time) < timeout);
    }

    fn recompute_historical(&mut self) {
        self.historical = self
            .window
            .iter()
            .min_by_key(|entry| {
                OrderedFloat(entry.particle.squared_error().unwrap_or(f64::INFINITY))
            })
            .cloned();
    }

    // ------------------------------------------------------------------
    // Manager Support
    // ------------------------------------------------------------------

    /// For every contact in the current best solution, the squared error of
    /// re-solving without it. One k−1 solve per contact.
    pub fn compute_removal_errors(
        &mut self,
        evaluator: &LikelihoodEvaluator,
        model: &dyn RigidBodyModel,
        residual: &DVector<f64>,
        no_contact_error: f64,
        time: f64,
    ) -> Result<(), SolverError> {
        self.removal_errors.clear();
        let Some(record) = self.most_likely.as_ref().and_then(Particle::solution) else {
            return Ok(());
        };
        let record = Arc::clone(record);

        for (drop_index, dropped) in record.contacts.iter().enumerate() {
            let remaining: Vec<EvalContact> = record
                .contacts
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != drop_index)
                .map(|(_, c)| EvalContact {
                    site: Arc::clone(&c.site),
                    owner: c.owner,
                })
                .collect();
            let error = if remaining.is_empty() {
                no_contact_error
            } else {
                evaluator
                    .evaluate(model, residual, &remaining, time)?
                    .squared_error
            };
            self.removal_errors.push((dropped.owner, error));
        }
        Ok(())
    }

    /// Collapse the population onto `n` copies of the historical best.
    /// Used after a peer set's warm-start so this set's interactions are
    /// not corrupted by the transient.
    pub fn reset_to_historical(&mut self, n: usize) {
        if let Some(historical) = self.historical_particle().cloned() {
            self.particles = vec![historical; n];
        }
    }

    pub fn snapshot(&self) -> ParticleSetSnapshot {
        ParticleSetSnapshot {
            particles: self.particles.iter().map(Particle::snapshot).collect(),
            most_likely: self.most_likely.as_ref().map(Particle::snapshot),
            historical_most_likely: self.historical_particle().map(Particle::snapshot),
            color: self.color,
        }
    }
}

fn sanitize(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CandidateSite, SiteId, DEFAULT_MU};
    use crate::model::LinkId;
    use rand::SeedableRng;

    fn site(id: u32) -> Arc<CandidateSite> {
        Arc::new(
            CandidateSite::new(
                SiteId(id),
                LinkId(0),
                "link",
                Point3::new(0.1 * f64::from(id), 0.0, 0.0),
                Vector3::z(),
                DEFAULT_MU,
            )
            .expect("site"),
        )
    }

    fn record(error: f64, likelihood: f64, time: f64) -> Arc<SolutionRecord> {
        Arc::new(SolutionRecord {
            contacts: vec![],
            implied_residual: DVector::zeros(2),
            squared_error: error,
            likelihood,
            qp_objective: error,
            time,
        })
    }

    fn scored(id: u32, error: f64, likelihood: f64) -> Particle {
        let mut p = Particle::new(site(id));
        p.set_solution(record(error, likelihood, 0.0));
        p
    }

    #[test]
    fn resample_draws_exact_population() {
        let mut set = ParticleSet::new(SetId(0), [0.5, 0.0, 0.5]);
        set.add(scored(0, 0.1, 0.9));
        set.add(scored(1, 5.0, 0.01));
        let mut rng = StdRng::seed_from_u64(1);
        set.resample(50, &mut rng);
        assert_eq!(set.number(), 50);
        // resampled particles start the next cycle at weight 1
        assert!(set.particles().iter().all(|p| (p.proposal_weight() - 1.0).abs() < 1e-12));
    }

    #[test]
    fn resample_prefers_high_likelihood() {
        let mut set = ParticleSet::new(SetId(0), [0.5, 0.0, 0.5]);
        set.add(scored(0, 0.01, 1.0));
        set.add(scored(1, 100.0, 1e-9));
        let mut rng = StdRng::seed_from_u64(2);
        set.resample(200, &mut rng);
        let zeros = set
            .particles()
            .iter()
            .filter(|p| p.site().id == SiteId(0))
            .count();
        assert!(zeros > 190, "expected near-total capture, got {zeros}/200");
    }

    #[test]
    fn degenerate_weights_fall_back_to_reciprocal_error() {
        let mut set = ParticleSet::new(SetId(0), [0.5, 0.0, 0.5]);
        // both likelihoods underflow to zero; errors differ by 100×
        set.add(scored(0, 1.0, 0.0));
        set.add(scored(1, 100.0, 0.0));
        let mut rng = StdRng::seed_from_u64(3);
        set.resample(300, &mut rng);
        assert_eq!(set.number(), 300);
        let low_error = set
            .particles()
            .iter()
            .filter(|p| p.site().id == SiteId(0))
            .count();
        assert!(
            low_error > 250,
            "reciprocal-error weights should dominate, got {low_error}/300"
        );
        assert!(set
            .particles()
            .iter()
            .all(|p| p.proposal_weight().is_finite()));
    }

    #[test]
    fn unscored_population_resamples_uniformly() {
        let mut set = ParticleSet::new(SetId(0), [0.5, 0.0, 0.5]);
        set.add(Particle::new(site(0)));
        set.add(Particle::new(site(1)));
        let mut rng = StdRng::seed_from_u64(4);
        set.resample(100, &mut rng);
        assert_eq!(set.number(), 100);
    }

    #[test]
    fn historical_error_is_monotone_within_window() {
        let mut set = ParticleSet::with_window_timeout(SetId(0), [0.5, 0.0, 0.5], 1.0);
        let mut last = f64::INFINITY;
        for (step, error) in [4.0, 2.5, 3.0, 1.0, 6.0].iter().enumerate() {
            let t = step as f64 * 0.1;
            set.set_best(t, scored(0, *error, 0.5));
            let historical = set.historical_error().expect("historical exists");
            assert!(
                historical <= last + 1e-12,
                "historical error rose inside the window: {historical} > {last}"
            );
            last = historical;
        }
        assert!((set.historical_error().expect("historical") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn historical_forgets_expired_entries() {
        let mut set = ParticleSet::with_window_timeout(SetId(0), [0.5, 0.0, 0.5], 1.0);
        set.set_best(0.0, scored(0, 0.2, 0.9));
        set.set_best(0.5, scored(1, 3.0, 0.1));
        assert!((set.historical_error().expect("historical") - 0.2).abs() < 1e-12);
        // t = 1.2: the 0.2-error entry has aged out of the 1 s window
        set.set_best(1.2, scored(2, 2.0, 0.2));
        assert!((set.historical_error().expect("historical") - 2.0).abs() < 1e-12);
    }

    #[test]
    fn mode_policy_picks_most_populated_site() {
        let mut set = ParticleSet::new(SetId(0), [0.5, 0.0, 0.5]);
        set.add(scored(7, 2.0, 0.1));
        set.add(scored(7, 2.0, 0.1));
        set.add(scored(3, 0.5, 0.9));
        set.update_best_by_mode(0.0);
        assert_eq!(
            set.most_likely().expect("best").site().id,
            SiteId(7),
            "mode policy counts particles, not likelihood"
        );
    }

    #[test]
    fn reset_to_historical_clones_population() {
        let mut set = ParticleSet::new(SetId(0), [0.5, 0.0, 0.5]);
        set.add(scored(1, 1.0, 0.4));
        set.set_best(0.0, scored(5, 0.3, 0.8));
        set.reset_to_historical(40);
        assert_eq!(set.number(), 40);
        assert!(set.particles().iter().all(|p| p.site().id == SiteId(5)));
    }
}
