//! Nonlinear solve presets per analysis phase.
//!
//! Static operating points get a large iteration budget and a long line
//! search. Transient corrector solves start from the predictor and get a
//! short budget; a failure there rejects the step.

use crate::newton::NewtonConfig;

/// Phase a nonlinear solve belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolveMode {
    /// DC operating point and DC sweep points.
    #[default]
    DcOperatingPoint,

    /// Corrector of a time step.
    Transient,
}

impl SolveMode {
    /// Human-readable name for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SolveMode::DcOperatingPoint => "dc_op",
            SolveMode::Transient => "transient",
        }
    }

    /// Newton configuration used for this phase.
    pub fn to_newton_config(&self) -> NewtonConfig {
        match self {
            SolveMode::DcOperatingPoint => NewtonConfig {
                max_iterations: 200,
                residual_abs_tol: 1e-6,
                residual_rel_tol: 1e-9,
                update_abs_tol: 1e-12,
                update_rel_tol: 1e-3,
                delta_x_tol: 1.0,
                max_step: f64::INFINITY,
                line_search_beta: 0.5,
                max_line_search_iters: 9,
                min_damping: 1e-10,
                divergence_factor: 1e8,
            },
            SolveMode::Transient => NewtonConfig {
                max_iterations: 20,
                residual_abs_tol: 1e-9,
                residual_rel_tol: 1e-6,
                update_abs_tol: 1e-6,
                update_rel_tol: 1e-2,
                delta_x_tol: 0.33,
                max_step: f64::INFINITY,
                line_search_beta: 0.5,
                max_line_search_iters: 2,
                min_damping: 1e-10,
                divergence_factor: 1e8,
            },
        }
    }
}
