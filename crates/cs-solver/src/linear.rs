//! Linear solve contract and the bundled dense LU backend.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinearSolveError {
    #[error("matrix is singular")]
    Singular,

    #[error("system is {rows}x{cols} but right-hand side has {rhs} entries")]
    Shape { rows: usize, cols: usize, rhs: usize },

    #[error("solution contains non-finite entries")]
    NonFinite,
}

/// Factor and solve `J · δ = rhs`.
///
/// A failed factorization is reported, never panicked on; the Newton layer
/// turns it into a divergence.
pub trait LinearSolver {
    fn factor_and_solve(
        &mut self,
        jacobian: &DMatrix<f64>,
        rhs: &DVector<f64>,
    ) -> Result<DVector<f64>, LinearSolveError>;
}

impl<T: LinearSolver + ?Sized> LinearSolver for &mut T {
    fn factor_and_solve(
        &mut self,
        jacobian: &DMatrix<f64>,
        rhs: &DVector<f64>,
    ) -> Result<DVector<f64>, LinearSolveError> {
        (**self).factor_and_solve(jacobian, rhs)
    }
}

/// Dense LU with partial pivoting.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenseLu;

impl LinearSolver for DenseLu {
    fn factor_and_solve(
        &mut self,
        jacobian: &DMatrix<f64>,
        rhs: &DVector<f64>,
    ) -> Result<DVector<f64>, LinearSolveError> {
        let (rows, cols) = jacobian.shape();
        if rows != cols || rows != rhs.len() {
            return Err(LinearSolveError::Shape {
                rows,
                cols,
                rhs: rhs.len(),
            });
        }
        if rows == 0 {
            return Ok(DVector::zeros(0));
        }
        let dx = jacobian
            .clone()
            .lu()
            .solve(rhs)
            .ok_or(LinearSolveError::Singular)?;
        if dx.iter().all(|v| v.is_finite()) {
            Ok(dx)
        } else {
            Err(LinearSolveError::NonFinite)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_small_system() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 2.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, 2.0]);
        let x = DenseLu.factor_and_solve(&a, &b).unwrap();
        assert!((&a * &x - &b).norm() < 1e-12);
    }

    #[test]
    fn singular_matrix_is_reported() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        assert_eq!(
            DenseLu.factor_and_solve(&a, &b),
            Err(LinearSolveError::Singular)
        );
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let a = DMatrix::<f64>::identity(2, 2);
        let b = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        assert!(matches!(
            DenseLu.factor_and_solve(&a, &b),
            Err(LinearSolveError::Shape { rhs: 3, .. })
        ));
    }
}
