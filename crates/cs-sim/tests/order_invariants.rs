//! History length and order bounds hold on every accepted step.

mod common;

use common::Spiral;
use cs_core::Tolerances;
use cs_sim::{IntegrationMethod, StepControlOptions, StepController, StepOutcome};
use cs_solver::DenseLu;
use nalgebra::DVector;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn history_never_outgrows_the_order(
        a in 0.1_f64..2.0,
        w in 0.0_f64..10.0,
        max_order in 1_usize..=5,
        rel in 1e-5_f64..1e-2,
        x0 in 0.1_f64..5.0,
    ) {
        let options = StepControlOptions {
            method: IntegrationMethod::VariableOrderBdf { max_order },
            tolerances: Tolerances { abs: 1e-6, rel },
            ..StepControlOptions::default()
        };
        let mut c = StepController::new(Spiral { a, w }, DenseLu, options).unwrap();
        c.initialize(0.0, DVector::from_vec(vec![x0, 0.0]), 3.0).unwrap();

        let mut accepted = 0;
        let mut last_time = 0.0;
        while !c.is_finished() && accepted < 400 {
            match c.step().unwrap() {
                StepOutcome::Accepted(step) => {
                    accepted += 1;
                    let s = c.state();
                    prop_assert!(step.time > last_time);
                    last_time = step.time;
                    prop_assert!(step.order >= 1 && step.order <= max_order);
                    prop_assert!(s.order() >= 1 && s.order() <= max_order);
                    prop_assert_eq!(s.history_len(), s.order() + 1);
                    prop_assert!(s.previous_steps().count() >= s.used_order());
                }
                StepOutcome::Rejected(rejected) => {
                    prop_assert_eq!(rejected.time, last_time);
                    prop_assert_eq!(c.state().history_len(), c.state().order() + 1);
                }
            }
        }
        prop_assert!(accepted > 0);
    }
}
