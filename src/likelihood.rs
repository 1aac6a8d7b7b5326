//! Measurement likelihood for candidate contact tuples.
//!
//! For sites s₁…s_k and a residual r, builds the per-site joint-space maps
//! H_i = J_iᵀ·wrench_basis_i, delegates the bounded QP over cone
//! coefficients to the configured back-end, and packages the implied
//! residual, weighted squared error, and Gaussian likelihood into an
//! immutable, shareable [`SolutionRecord`].

use crate::catalog::{CandidateSite, SiteId};
use crate::config::{ConfigError, CpfConfig};
use crate::model::RigidBodyModel;
use crate::particles::{ParticleSet, SetId};
use crate::solver::{solver_from_type, QpSolver, SolverError};
use nalgebra::{DMatrix, DVector, Vector3, Vector4};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Solution Records
// ============================================================================

/// One contact inside a solution: the site, the set that contributed it (if
/// any), and the recovered reaction.
#[derive(Debug, Clone)]
pub struct ContactSolution {
    pub site: Arc<CandidateSite>,
    /// Particle set that owns this contact; `None` for sweep evaluations.
    pub owner: Option<SetId>,
    pub alpha: Vector4<f64>,
    /// Reaction force `friction_cone · α`, link frame.
    pub force: Vector3<f64>,
}

/// Result of one k-contact likelihood evaluation. Immutable; shared by
/// reference between particles that hit the same site within a pass.
#[derive(Debug, Clone)]
pub struct SolutionRecord {
    pub contacts: Vec<ContactSolution>,
    /// Σ H_i α_i, the generalized force this solution would produce.
    pub implied_residual: DVector<f64>,
    /// (r − r̂)ᵀ W (r − r̂)
    pub squared_error: f64,
    /// exp(−½ (r − r̂)ᵀ Σ⁻¹ (r − r̂))
    pub likelihood: f64,
    pub qp_objective: f64,
    /// Simulated time of the evaluation, seconds.
    pub time: f64,
}

impl SolutionRecord {
    pub fn num_contacts(&self) -> usize {
        self.contacts.len()
    }

    /// Reaction force of the first (owning) contact.
    pub fn own_force(&self) -> Vector3<f64> {
        self.contacts.first().map_or_else(Vector3::zeros, |c| c.force)
    }
}

/// A site entering an evaluation together with the set that claims it.
#[derive(Debug, Clone)]
pub struct EvalContact {
    pub site: Arc<CandidateSite>,
    pub owner: Option<SetId>,
}

// ============================================================================
// Evaluator
// ============================================================================

pub struct LikelihoodEvaluator {
    solver: Box<dyn QpSolver>,
    /// Positive-definite error weight W (identity unless reconfigured).
    weight: DMatrix<f64>,
    /// Σ⁻¹ = I/σ² from `measurement_model.var`.
    covariance_inv: DMatrix<f64>,
    num_joints: usize,
}

impl LikelihoodEvaluator {
    pub fn new(config: &CpfConfig, num_joints: usize) -> Result<Self, ConfigError> {
        let solver = solver_from_type(&config.solver.solver_type).ok_or_else(|| {
            ConfigError::Invalid {
                key: "solver.solver_type",
                reason: format!("unknown solver '{}'", config.solver.solver_type),
            }
        })?;
        Ok(Self {
            solver,
            weight: DMatrix::identity(num_joints, num_joints),
            covariance_inv: DMatrix::identity(num_joints, num_joints)
                / config.measurement_model.var,
            num_joints,
        })
    }

    pub fn num_joints(&self) -> usize {
        self.num_joints
    }

    pub fn solver_name(&self) -> &'static str {
        self.solver.name()
    }

    /// rᵀ·W·r, the fit error of explaining the residual with no contacts.
    pub fn squared_error_no_contacts(&self, residual: &DVector<f64>) -> f64 {
        (&self.weight * residual).dot(residual)
    }

    /// H_i for one site at the model's current configuration.
    pub fn joint_space_map(
        &self,
        model: &dyn RigidBodyModel,
        site: &CandidateSite,
    ) -> DMatrix<f64> {
        let jacobian = model.geometric_jacobian(site.link);
        let basis = DMatrix::from_iterator(6, 4, site.wrench_basis.iter().copied());
        jacobian.transpose() * basis
    }

    /// Score one tuple of contacts against the residual.
    ///
    /// The rigid-body model must already be at the step's configuration.
    pub fn evaluate(
        &self,
        model: &dyn RigidBodyModel,
        residual: &DVector<f64>,
        contacts: &[EvalContact],
        time: f64,
    ) -> Result<Arc<SolutionRecord>, SolverError> {
        let h_blocks: Vec<DMatrix<f64>> = contacts
            .iter()
            .map(|c| self.joint_space_map(model, &c.site))
            .collect();

        let qp = self.solver.solve(residual, &h_blocks, &self.weight)?;

        let mut implied = DVector::zeros(self.num_joints);
        let mut solved = Vec::with_capacity(contacts.len());
        for (i, contact) in contacts.iter().enumerate() {
            let alpha = qp.alpha[i];
            implied += &h_blocks[i] * alpha;
            solved.push(ContactSolution {
                site: Arc::clone(&contact.site),
                owner: contact.owner,
                alpha,
                force: contact.site.friction_cone * alpha,
            });
        }

        let misfit = residual - &implied;
        let squared_error = (&self.weight * &misfit).dot(&misfit);
        let exponent = (&self.covariance_inv * &misfit).dot(&misfit);
        let likelihood = (-0.5 * exponent).exp();

        Ok(Arc::new(SolutionRecord {
            contacts: solved,
            implied_residual: implied,
            squared_error,
            likelihood,
            qp_objective: qp.objective,
            time,
        }))
    }

    /// Score every particle of a set, holding the peers' contacts fixed.
    ///
    /// Particles sharing a site within this pass share one QP solve; the
    /// records are immutable so sharing is by reference.
    pub fn measurement_update(
        &self,
        model: &dyn RigidBodyModel,
        residual: &DVector<f64>,
        set: &mut ParticleSet,
        peers: &[EvalContact],
        time: f64,
    ) -> Result<(), SolverError> {
        let own_set = set.id();
        let mut solved: HashMap<SiteId, Arc<SolutionRecord>> = HashMap::new();

        for particle in set.particles_mut() {
            let site_id = particle.site().id;
            let record = if let Some(shared) = solved.get(&site_id) {
                Arc::clone(shared)
            } else {
                let mut contacts = Vec::with_capacity(1 + peers.len());
                contacts.push(EvalContact {
                    site: particle.site_arc(),
                    owner: Some(own_set),
                });
                contacts.extend_from_slice(peers);
                let record = self.evaluate(model, residual, &contacts, time)?;
                solved.insert(site_id, Arc::clone(&record));
                record
            };
            particle.set_solution(record);
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
    use crate::catalog::SurfaceCatalog;
    use crate::model::KinematicTree;
    use crate::particles::Particle;
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Vector3};

    /// Four-joint serial chain so single-contact H blocks are square and
    /// generically invertible.
    const CHAIN_URDF: &str = r#"
        <robot name="chain4">
          <link name="base"/>
          <link name="l1"/>
          <link name="l2"/>
          <link name="l3"/>
          <link name="l4"/>
          <joint name="j1" type="revolute">
            <origin xyz="0 0 0.2"/><axis xyz="0 0 1"/>
            <parent link="base"/><child link="l1"/>
          </joint>
          <joint name="j2" type="revolute">
            <origin xyz="0.3 0 0"/><axis xyz="0 1 0"/>
            <parent link="l1"/><child link="l2"/>
          </joint>
          <joint name="j3" type="revolute">
            <origin xyz="0.3 0 0"/><axis xyz="0 0 1"/>
            <parent link="l2"/><child link="l3"/>
          </joint>
          <joint name="j4" type="revolute">
            <origin xyz="0.25 0 0"/><axis xyz="0 1 0"/>
            <parent link="l3"/><child link="l4"/>
          </joint>
        </robot>
    "#;

    fn setup() -> (KinematicTree, SurfaceCatalog) {
        let mut model = KinematicTree::from_urdf_str(CHAIN_URDF).expect("parse");
        model
            .set_joint_positions(&DVector::from_vec(vec![0.3, -0.5, 0.7, 0.2]))
            .expect("set q");
        let catalog = SurfaceCatalog::from_entries(
            [
                ("l4", Point3::new(0.1, 0.02, 0.0), Vector3::new(0.0, 1.0, 0.2)),
                ("l3", Point3::new(0.1, 0.0, 0.03), Vector3::new(0.0, 0.0, 1.0)),
            ],
            &model,
        )
        .expect("catalog");
        (model, catalog)
    }

    fn evaluator() -> LikelihoodEvaluator {
        LikelihoodEvaluator::new(&CpfConfig::default(), 4).expect("evaluator")
    }

    #[test]
    fn zero_residual_yields_unit_likelihood() {
        let (model, catalog) = setup();
        let ev = evaluator();
        let site = catalog.iter().next().expect("site");
        let record = ev
            .evaluate(
                &model,
                &DVector::zeros(4),
                &[EvalContact {
                    site: Arc::clone(site),
                    owner: None,
                }],
                0.0,
            )
            .expect("evaluate");
        assert_relative_eq!(record.contacts[0].alpha.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(record.implied_residual.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(record.squared_error, 0.0, epsilon = 1e-12);
        assert_relative_eq!(record.likelihood, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn recovers_synthesized_contact() {
        let (model, catalog) = setup();
        let ev = evaluator();
        let site = catalog.iter().next().expect("site");
        let truth = Vector4::new(0.3, 0.0, 0.3, 0.0);
        let h = ev.joint_space_map(&model, site);
        let residual = &h * truth;

        let record = ev
            .evaluate(
                &model,
                &residual,
                &[EvalContact {
                    site: Arc::clone(site),
                    owner: None,
                }],
                0.0,
            )
            .expect("evaluate");
        assert!(record.squared_error < 1e-10);
        for i in 0..4 {
            assert_relative_eq!(record.contacts[0].alpha[i], truth[i], epsilon = 1e-6);
        }
        let expected_force = site.friction_cone * truth;
        assert_relative_eq!(
            (record.own_force() - expected_force).norm(),
            0.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn measurement_update_shares_records_per_site() {
        let (model, catalog) = setup();
        let ev = evaluator();
        let site = catalog.iter().next().expect("site");
        let mut set = ParticleSet::new(SetId(1), [0.5, 0.0, 0.5]);
        for _ in 0..3 {
            set.add(Particle::new(Arc::clone(site)));
        }
        let residual = DVector::from_vec(vec![0.1, 0.2, -0.1, 0.05]);
        ev.measurement_update(&model, &residual, &mut set, &[], 0.5)
            .expect("update");

        let records: Vec<_> = set
            .particles()
            .iter()
            .map(|p| p.solution().expect("scored"))
            .collect();
        assert!(Arc::ptr_eq(records[0], records[1]));
        assert!(Arc::ptr_eq(records[1], records[2]));
        assert_eq!(records[0].contacts[0].owner, Some(SetId(1)));
    }

    #[test]
    fn no_contact_error_is_weighted_norm() {
        let ev = evaluator();
        let r = DVector::from_vec(vec![1.0, 2.0, 0.0, -1.0]);
        assert_relative_eq!(ev.squared_error_no_contacts(&r), 6.0, epsilon = 1e-12);
    }
}
