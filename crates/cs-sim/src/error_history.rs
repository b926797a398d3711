//! Local truncation error bookkeeping.
//!
//! The estimator works on partial sums of squared weighted terms. Sums from
//! sub-problems are merged and then reduced across processes before any
//! square root is taken, so every process computes the same norms.

use crate::integrator::{BdfCoefficients, TKM1_TK_SAFETY};
use cs_core::Communicator;
use std::collections::VecDeque;

/// Partial sums behind the error norms of one step attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ErrorSums {
    /// `Σ (δ/w)²` with `δ` the corrector minus the predictor.
    pub x_error_sum: f64,
    /// Same for the charge/flux vector.
    pub q_error_sum: f64,
    /// Order `k-1` estimate: `Σ ((φ_k + δ)/w)²`.
    pub x_error_sum_m1: f64,
    /// Order `k-2` estimate: `Σ ((φ_{k-1} + φ_k + δ)/w)²`.
    pub x_error_sum_m2: f64,
    /// Order `k+1` estimate: `Σ ((δ - φ_{k+1})/w)²`.
    pub x_error_sum_p1: f64,
    /// `Σ (φq_1/w)²`, the scaled derivative of the charges.
    pub q1_history_sum: f64,
    /// Number of terms in each sum.
    pub len: usize,
}

impl ErrorSums {
    /// Fold another block's sums into these.
    pub fn merge(&mut self, other: &ErrorSums) {
        self.x_error_sum += other.x_error_sum;
        self.q_error_sum += other.q_error_sum;
        self.x_error_sum_m1 += other.x_error_sum_m1;
        self.x_error_sum_m2 += other.x_error_sum_m2;
        self.x_error_sum_p1 += other.x_error_sum_p1;
        self.q1_history_sum += other.q1_history_sum;
        self.len += other.len;
    }

    /// Sum over all processes.
    pub fn reduce(&self, comm: &dyn Communicator) -> ErrorSums {
        let mut buf = [
            self.x_error_sum,
            self.q_error_sum,
            self.x_error_sum_m1,
            self.x_error_sum_m2,
            self.x_error_sum_p1,
            self.q1_history_sum,
        ];
        comm.sum_all_slice(&mut buf);
        ErrorSums {
            x_error_sum: buf[0],
            q_error_sum: buf[1],
            x_error_sum_m1: buf[2],
            x_error_sum_m2: buf[3],
            x_error_sum_p1: buf[4],
            q1_history_sum: buf[5],
            len: comm.sum_all_count(self.len),
        }
    }

    /// Weighted RMS norm for one of the sums.
    pub fn norm(&self, sum: f64) -> f64 {
        if self.len == 0 {
            0.0
        } else {
            (sum / self.len as f64).sqrt()
        }
    }
}

/// Scaled error estimates at orders `k-2 ..= k+1`. `E` is the estimate, `T`
/// the same scaled by the order, which is what order selection compares.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OrderEstimates {
    pub order: usize,
    /// `c_k · ‖δ‖`, the quantity tested against 1.
    pub error_ratio: f64,
    pub ek: f64,
    pub tk: f64,
    pub ekm1: Option<f64>,
    pub tkm1: Option<f64>,
    pub ekm2: Option<f64>,
    pub tkm2: Option<f64>,
    pub ekp1: Option<f64>,
    pub tkp1: Option<f64>,
}

impl OrderEstimates {
    /// `sums` must already be reduced. `has_next_difference` tells whether
    /// `x_error_sum_p1` holds a real `φ_{k+1}` term.
    pub fn from_sums(order: usize, coeffs: &BdfCoefficients, sums: &ErrorSums, has_next_difference: bool) -> Self {
        let k = order;
        let ck = coeffs.ck;
        let error_ratio = ck * sums.norm(sums.x_error_sum);
        let ek = coeffs.sigma[k] * error_ratio;
        let tk = (k + 1) as f64 * ek;

        let (ekm1, tkm1) = if k > 1 {
            let e = coeffs.sigma[k - 1] * ck * sums.norm(sums.x_error_sum_m1);
            (Some(e), Some(k as f64 * e))
        } else {
            (None, None)
        };
        let (ekm2, tkm2) = if k > 2 {
            let e = coeffs.sigma[k - 2] * ck * sums.norm(sums.x_error_sum_m2);
            (Some(e), Some((k - 1) as f64 * e))
        } else {
            (None, None)
        };
        let (ekp1, tkp1) = if has_next_difference {
            let t = ck * sums.norm(sums.x_error_sum_p1);
            (Some(t / (k + 2) as f64), Some(t))
        } else {
            (None, None)
        };

        Self {
            order: k,
            error_ratio,
            ek,
            tk,
            ekm1,
            tkm1,
            ekm2,
            tkm2,
            ekp1,
            tkp1,
        }
    }

    /// Order the lower-order estimates suggest keeping, before any raise is
    /// considered: `k - 1` when dropping an order would not increase the error.
    pub fn reduced_order(&self) -> usize {
        let k = self.order;
        match (self.tkm1, self.tkm2) {
            (Some(tkm1), Some(tkm2)) if tkm1.max(tkm2) <= self.tk => k - 1,
            (Some(tkm1), None) if tkm1 <= TKM1_TK_SAFETY * self.tk => k - 1,
            _ => k,
        }
    }

    /// Estimate that matches `order` (one of `k-1`, `k`, `k+1`).
    pub fn estimate_for(&self, order: usize) -> f64 {
        if order + 1 == self.order {
            self.ekm1.unwrap_or(self.ek)
        } else if order == self.order + 1 {
            self.ekp1.unwrap_or(self.ek)
        } else {
            self.ek
        }
    }
}

/// Summary of one accepted step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AcceptedError {
    pub time: f64,
    pub step: f64,
    pub order: usize,
    pub error_ratio: f64,
    pub sums: ErrorSums,
}

/// Accepted-step error record, bounded in depth.
///
/// Updated only when a step is accepted. Reset explicitly when the order
/// jumps by more than one or integration restarts at a breakpoint.
#[derive(Clone, Debug)]
pub struct ErrorHistory {
    depth: usize,
    records: VecDeque<AcceptedError>,
}

impl ErrorHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            records: VecDeque::with_capacity(depth.max(1)),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn record_accepted(&mut self, record: AcceptedError) {
        if self.records.len() == self.depth {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn reset(&mut self) {
        self.records.clear();
    }

    pub fn last(&self) -> Option<&AcceptedError> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AcceptedError> {
        self.records.iter()
    }

    /// Largest error ratio among the tracked steps.
    pub fn max_error_ratio(&self) -> Option<f64> {
        self.records.iter().map(|r| r.error_ratio).reduce(f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_core::SerialComm;

    fn sums(x: f64, len: usize) -> ErrorSums {
        ErrorSums {
            x_error_sum: x,
            q_error_sum: x / 2.0,
            x_error_sum_m1: 2.0 * x,
            x_error_sum_m2: 3.0 * x,
            x_error_sum_p1: x / 4.0,
            q1_history_sum: 1.0,
            len,
        }
    }

    #[test]
    fn merge_adds_every_field() {
        let mut a = sums(4.0, 2);
        a.merge(&sums(2.0, 3));
        assert_eq!(a.x_error_sum, 6.0);
        assert_eq!(a.x_error_sum_m2, 18.0);
        assert_eq!(a.q1_history_sum, 2.0);
        assert_eq!(a.len, 5);
    }

    #[test]
    fn merged_blocks_match_one_big_block() {
        let mut a = sums(4.0, 2);
        a.merge(&sums(4.0, 2));
        let whole = sums(8.0, 4);
        assert!((a.norm(a.x_error_sum) - whole.norm(whole.x_error_sum)).abs() < 1e-15);
    }

    #[test]
    fn serial_reduce_is_identity() {
        let s = sums(3.0, 7);
        assert_eq!(s.reduce(&SerialComm), s);
    }

    #[test]
    fn history_is_bounded_and_resettable() {
        let mut h = ErrorHistory::new(3);
        for i in 0..5 {
            h.record_accepted(AcceptedError {
                time: i as f64,
                step: 1.0,
                order: 1,
                error_ratio: i as f64 / 10.0,
                sums: ErrorSums::default(),
            });
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.last().map(|r| r.time), Some(4.0));
        assert_eq!(h.max_error_ratio(), Some(0.4));
        h.reset();
        assert!(h.is_empty());
        assert_eq!(h.max_error_ratio(), None);
    }
}
