//! Projected-gradient QP back-end.
//!
//! First-order alternative to the active-set solver: gradient steps on the
//! weighted misfit with projection onto α ≥ 0, step size 1/L from a
//! Frobenius bound on the Hessian. Approximate to a tolerance rather than
//! exact, but dependency-free and immune to rank deficiency.

use super::{stack_and_weight, unstack, QpSolution, QpSolver, SolverError};
use nalgebra::{DMatrix, DVector};

pub struct ProjectedGradientSolver {
    max_iterations: usize,
    /// Stop when the projected-gradient norm falls below this.
    tolerance: f64,
}

impl Default for ProjectedGradientSolver {
    fn default() -> Self {
        Self {
            max_iterations: 5_000,
            tolerance: 1e-10,
        }
    }
}

impl QpSolver for ProjectedGradientSolver {
    fn solve(
        &self,
        residual: &DVector<f64>,
        h_blocks: &[DMatrix<f64>],
        weight: &DMatrix<f64>,
    ) -> Result<QpSolution, SolverError> {
        let k = h_blocks.len();
        let (a, b) = stack_and_weight(residual, h_blocks, weight)?;

        let hessian = a.transpose() * &a;
        let atb = a.transpose() * &b;
        // Frobenius norm upper-bounds the spectral norm, so 1/L is safe.
        let lipschitz = 2.0 * hessian.norm();
        let mut x: DVector<f64> = DVector::zeros(a.ncols());

        if lipschitz > 0.0 {
            let step = 1.0 / lipschitz;
            for _ in 0..self.max_iterations {
                let gradient = 2.0 * (&hessian * &x - &atb);
                let next = (&x - step * &gradient).map(|v| v.max(0.0));
                let moved = (&next - &x).norm();
                x = next;
                if moved < self.tolerance {
                    break;
                }
            }
        }

        if x.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::Numerical(
                "projected gradient produced non-finite coefficients".to_string(),
            ));
        }

        let misfit = &b - &a * &x;
        Ok(QpSolution {
            alpha: unstack(&x, k),
            objective: misfit.norm_squared(),
        })
    }

    fn name(&self) -> &'static str {
        "projected_gradient"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn zero_residual_stays_at_zero() {
        let block = DMatrix::from_fn(4, 4, |r, c| ((r + c) as f64).cos());
        let solution = ProjectedGradientSolver::default()
            .solve(&DVector::zeros(4), &[block], &DMatrix::identity(4, 4))
            .expect("solve");
        assert_relative_eq!(solution.alpha[0].norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(solution.objective, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn converges_on_identity_blocks() {
        let block = DMatrix::identity(4, 4);
        let r = DVector::from_vec(vec![0.2, 0.0, 0.9, 0.0]);
        let solution = ProjectedGradientSolver::default()
            .solve(&r, &[block], &DMatrix::identity(4, 4))
            .expect("solve");
        assert_relative_eq!(solution.alpha[0][0], 0.2, epsilon = 1e-5);
        assert_relative_eq!(solution.alpha[0][2], 0.9, epsilon = 1e-5);
        assert!(solution.objective < 1e-8);
    }
}
