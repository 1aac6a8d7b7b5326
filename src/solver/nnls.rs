//! Lawson–Hanson active-set non-negative least squares.
//!
//! The default QP back-end. Exact for this problem class: the active-set
//! loop terminates with the KKT point of ‖Aα − b‖² over α ≥ 0, and every
//! least-squares subproblem is solved by SVD for rank safety.

use super::{stack_and_weight, unstack, QpSolution, QpSolver, SolverError};
use nalgebra::{DMatrix, DVector};

pub struct NnlsSolver {
    /// Outer iterations per column budget; the textbook bound is a small
    /// multiple of the column count.
    max_outer_per_col: usize,
}

impl Default for NnlsSolver {
    fn default() -> Self {
        Self {
            max_outer_per_col: 10,
        }
    }
}

impl QpSolver for NnlsSolver {
    fn solve(
        &self,
        residual: &DVector<f64>,
        h_blocks: &[DMatrix<f64>],
        weight: &DMatrix<f64>,
    ) -> Result<QpSolution, SolverError> {
        let k = h_blocks.len();
        let (a, b) = stack_and_weight(residual, h_blocks, weight)?;
        let x = nnls(&a, &b, self.max_outer_per_col * a.ncols())?;
        let misfit = &b - &a * &x;
        Ok(QpSolution {
            alpha: unstack(&x, k),
            objective: misfit.norm_squared(),
        })
    }

    fn name(&self) -> &'static str {
        "nnls"
    }
}

/// Solve min ‖Ax − b‖² s.t. x ≥ 0.
fn nnls(a: &DMatrix<f64>, b: &DVector<f64>, max_outer: usize) -> Result<DVector<f64>, SolverError> {
    let cols = a.ncols();
    let tol = 10.0 * f64::EPSILON * a.amax().max(1.0) * (a.nrows().max(cols) as f64);

    let mut x: DVector<f64> = DVector::zeros(cols);
    let mut passive = vec![false; cols];
    let mut gradient = a.transpose() * (b - a * &x);
    let mut outer = 0usize;

    loop {
        // most-violated KKT multiplier among the clamped columns
        let mut entering: Option<usize> = None;
        for i in 0..cols {
            if !passive[i] && gradient[i] > tol {
                if entering.map_or(true, |j| gradient[i] > gradient[j]) {
                    entering = Some(i);
                }
            }
        }
        let Some(j) = entering else {
            return Ok(x);
        };

        outer += 1;
        if outer > max_outer {
            return Err(SolverError::IterationLimit(outer));
        }
        passive[j] = true;

        loop {
            let z = solve_passive(a, b, &passive)?;
            let feasible = (0..cols).all(|i| !passive[i] || z[i] > tol);
            if feasible {
                x = z;
                break;
            }

            // back-track along x → z until the first coordinate hits zero
            let mut step = f64::INFINITY;
            for i in 0..cols {
                if passive[i] && z[i] <= tol {
                    let denom = x[i] - z[i];
                    if denom > f64::EPSILON {
                        step = step.min(x[i] / denom);
                    }
                }
            }
            if !step.is_finite() {
                return Err(SolverError::Numerical(
                    "degenerate back-tracking step in active-set loop".to_string(),
                ));
            }
            for i in 0..cols {
                if passive[i] {
                    x[i] += step * (z[i] - x[i]);
                    if x[i] <= tol {
                        x[i] = 0.0;
                        passive[i] = false;
                    }
                }
            }
        }

        gradient = a.transpose() * (b - a * &x);
    }
}

/// Unconstrained least squares restricted to the passive columns; clamped
/// columns come back as exact zeros.
fn solve_passive(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    passive: &[bool],
) -> Result<DVector<f64>, SolverError> {
    let active_cols: Vec<usize> = (0..a.ncols()).filter(|&i| passive[i]).collect();
    let mut sub = DMatrix::zeros(a.nrows(), active_cols.len());
    for (s, &i) in active_cols.iter().enumerate() {
        sub.column_mut(s).copy_from(&a.column(i));
    }
    let solution = sub
        .svd(true, true)
        .solve(b, 1e-13)
        .map_err(|e| SolverError::Numerical(e.to_string()))?;

    let mut z = DVector::zeros(a.ncols());
    for (s, &i) in active_cols.iter().enumerate() {
        z[i] = solution[s];
    }
    Ok(z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    fn eye(n: usize) -> DMatrix<f64> {
        DMatrix::identity(n, n)
    }

    #[test]
    fn zero_residual_gives_zero_alpha() {
        let solver = NnlsSolver::default();
        let block = DMatrix::from_fn(4, 4, |r, c| ((r + 2 * c) as f64).sin());
        let solution = solver
            .solve(&DVector::zeros(4), &[block], &eye(4))
            .expect("solve");
        assert_eq!(solution.alpha.len(), 1);
        assert_relative_eq!(solution.alpha[0].norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(solution.objective, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn recovers_interior_solution_exactly() {
        // well-conditioned block, strictly positive truth → constraint inactive
        let block = DMatrix::from_row_slice(
            4,
            4,
            &[
                2.0, 0.1, 0.0, 0.3, //
                0.0, 1.5, 0.2, 0.0, //
                0.1, 0.0, 1.8, 0.2, //
                0.3, 0.2, 0.0, 1.1,
            ],
        );
        let truth = Vector4::new(0.3, 0.0, 0.3, 0.0);
        let r = &block * truth;
        let solution = NnlsSolver::default()
            .solve(&r, &[block], &eye(4))
            .expect("solve");
        for i in 0..4 {
            assert_relative_eq!(solution.alpha[0][i], truth[i], epsilon = 1e-8);
        }
        assert!(solution.objective < 1e-16);
    }

    #[test]
    fn clamps_negative_directions() {
        // b = -e1: the best nonneg fit along the identity is zero on that axis
        let block = eye(4);
        let r = DVector::from_vec(vec![-1.0, 0.5, 0.0, 0.0]);
        let solution = NnlsSolver::default()
            .solve(&r, &[block], &eye(4))
            .expect("solve");
        assert_relative_eq!(solution.alpha[0][0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(solution.alpha[0][1], 0.5, epsilon = 1e-12);
        // leftover misfit is exactly the clamped component
        assert_relative_eq!(solution.objective, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn two_contact_recovery() {
        let b1 = DMatrix::from_fn(6, 4, |r, c| ((r * 3 + c) as f64 * 0.37).cos());
        let b2 = DMatrix::from_fn(6, 4, |r, c| ((r * 5 + c) as f64 * 0.61).sin());
        let a1 = Vector4::new(0.4, 0.0, 0.2, 0.0);
        let a2 = Vector4::new(0.0, 0.3, 0.0, 0.1);
        let r = &b1 * a1 + &b2 * a2;
        let solution = NnlsSolver::default()
            .solve(&r, &[b1, b2], &eye(6))
            .expect("solve");
        assert_eq!(solution.alpha.len(), 2);
        assert!(solution.objective < 1e-12);
    }

    #[test]
    fn diagonal_weight_changes_the_tradeoff() {
        // one row conflicts with another; up-weighting row 0 must pull the
        // fit toward it
        let block = DMatrix::from_row_slice(2, 4, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        let r = DVector::from_vec(vec![1.0, 0.0]);
        let mut w = eye(2);
        w[(0, 0)] = 100.0;
        let heavy = NnlsSolver::default()
            .solve(&r, &[block.clone()], &w)
            .expect("solve");
        let even = NnlsSolver::default()
            .solve(&r, &[block], &eye(2))
            .expect("solve");
        assert!(heavy.alpha[0][0] > even.alpha[0][0]);
    }
}
