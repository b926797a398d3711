//! Finite difference Jacobians for residual-only systems.

use crate::error::SolverResult;
use nalgebra::{DMatrix, DVector};

fn perturbation(xj: f64, epsilon: f64) -> f64 {
    epsilon * xj.abs().max(1.0)
}

/// Forward differences around a point whose residual `f_x` is already known.
///
/// Column `j` is `(f(x + h_j e_j) - f(x)) / h_j` with `h_j = ε·max(|x_j|, 1)`.
pub fn forward_difference_jacobian<F>(
    x: &DVector<f64>,
    f_x: &DVector<f64>,
    f: F,
    epsilon: f64,
) -> SolverResult<DMatrix<f64>>
where
    F: Fn(&DVector<f64>) -> SolverResult<DVector<f64>>,
{
    let mut jac = DMatrix::zeros(f_x.len(), x.len());
    let mut xp = x.clone();

    for j in 0..x.len() {
        let h = perturbation(x[j], epsilon);
        xp[j] = x[j] + h;
        let column = (f(&xp)? - f_x) / h;
        jac.set_column(j, &column);
        xp[j] = x[j];
    }

    Ok(jac)
}
