//! QP back-ends for the measurement likelihood.
//!
//! The likelihood reduces to a non-negative least squares over the stacked
//! cone coefficients of 1–4 contacts:
//!
//! ```text
//!   minimize ‖r − [H₁ … H_k]·α‖²_W   subject to α ≥ 0
//! ```
//!
//! Back-ends implement [`QpSolver`] and are picked by `solver.solver_type`
//! at startup. α = 0 is always feasible, so the problem is never
//! infeasible; solver errors are fatal at runtime.

mod nnls;
mod projected_gradient;

pub use nnls::NnlsSolver;
pub use projected_gradient::ProjectedGradientSolver;

use crate::catalog::FRICTION_CONE_EDGES;
use nalgebra::{DMatrix, DVector, Vector4};
use thiserror::Error;

/// Largest contact count any back-end must handle.
pub const MAX_CONTACTS: usize = 4;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("solver handles 1..={MAX_CONTACTS} contacts, got {0}")]
    BadContactCount(usize),

    #[error("H block {index} is {rows}×{cols}, expected {expected_rows}×{expected_cols}")]
    DimensionMismatch {
        index: usize,
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },

    #[error("weight matrix is not positive definite")]
    IndefiniteWeight,

    #[error("numerical failure in QP solve: {0}")]
    Numerical(String),

    #[error("active-set iteration limit hit after {0} iterations")]
    IterationLimit(usize),
}

// ============================================================================
// Trait
// ============================================================================

/// Solution of one bounded QP: per-contact cone coefficients and the final
/// weighted objective ‖r − Σ H_i α_i‖²_W.
#[derive(Debug, Clone)]
pub struct QpSolution {
    pub alpha: Vec<Vector4<f64>>,
    pub objective: f64,
}

pub trait QpSolver: Send {
    /// Solve for `h_blocks.len()` contacts. Every block must be n×4 with
    /// n = `residual.len()`; `weight` is the n×n positive-definite W.
    fn solve(
        &self,
        residual: &DVector<f64>,
        h_blocks: &[DMatrix<f64>],
        weight: &DMatrix<f64>,
    ) -> Result<QpSolution, SolverError>;

    fn name(&self) -> &'static str;
}

/// Instantiate a back-end by its configured name.
pub fn solver_from_type(solver_type: &str) -> Option<Box<dyn QpSolver>> {
    match solver_type {
        "nnls" => Some(Box::new(NnlsSolver::default())),
        "projected_gradient" => Some(Box::new(ProjectedGradientSolver::default())),
        _ => None,
    }
}

// ============================================================================
// Shared Plumbing
// ============================================================================

/// Validate shapes, stack the blocks into one n×4k matrix, and fold the
/// weight in through its Cholesky factor (‖x‖²_W = ‖Lᵀx‖²).
fn stack_and_weight(
    residual: &DVector<f64>,
    h_blocks: &[DMatrix<f64>],
    weight: &DMatrix<f64>,
) -> Result<(DMatrix<f64>, DVector<f64>), SolverError> {
    let k = h_blocks.len();
    if k == 0 || k > MAX_CONTACTS {
        return Err(SolverError::BadContactCount(k));
    }
    let n = residual.len();
    for (index, block) in h_blocks.iter().enumerate() {
        if block.nrows() != n || block.ncols() != FRICTION_CONE_EDGES {
            return Err(SolverError::DimensionMismatch {
                index,
                rows: block.nrows(),
                cols: block.ncols(),
                expected_rows: n,
                expected_cols: FRICTION_CONE_EDGES,
            });
        }
    }

    let mut stacked = DMatrix::zeros(n, k * FRICTION_CONE_EDGES);
    for (i, block) in h_blocks.iter().enumerate() {
        stacked
            .view_mut((0, i * FRICTION_CONE_EDGES), (n, FRICTION_CONE_EDGES))
            .copy_from(block);
    }

    let chol = weight
        .clone()
        .cholesky()
        .ok_or(SolverError::IndefiniteWeight)?;
    let lt = chol.l().transpose();
    Ok((&lt * stacked, &lt * residual))
}

/// Split the stacked coefficient vector back into per-contact α blocks.
fn unstack(x: &DVector<f64>, k: usize) -> Vec<Vector4<f64>> {
    (0..k)
        .map(|i| {
            Vector4::new(
                x[i * FRICTION_CONE_EDGES],
                x[i * FRICTION_CONE_EDGES + 1],
                x[i * FRICTION_CONE_EDGES + 2],
                x[i * FRICTION_CONE_EDGES + 3],
            )
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
