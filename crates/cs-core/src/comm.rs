//! Collective reductions over the process group.
//!
//! Every convergence or error-control decision is taken on globally reduced
//! quantities so that all processes take the same branch. Norms are therefore
//! built from local partial sums pushed through a [`Communicator`].

use nalgebra::DVector;

/// Process-group reductions.
///
/// Implementations wrap whatever transport the host uses. All methods are
/// collective: every rank must call them in the same order.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn sum_all(&self, local: f64) -> f64;
    fn max_all(&self, local: f64) -> f64;
    fn min_all(&self, local: f64) -> f64;

    fn sum_all_count(&self, local: usize) -> usize;

    /// Elementwise sum of a small fixed-size buffer.
    fn sum_all_slice(&self, values: &mut [f64]) {
        for v in values.iter_mut() {
            *v = self.sum_all(*v);
        }
    }
}

/// Single-process group.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn sum_all(&self, local: f64) -> f64 {
        local
    }

    fn max_all(&self, local: f64) -> f64 {
        local
    }

    fn min_all(&self, local: f64) -> f64 {
        local
    }

    fn sum_all_count(&self, local: usize) -> usize {
        local
    }

    fn sum_all_slice(&self, _values: &mut [f64]) {}
}

/// Local contribution `Σ (v_i / w_i)^2` to a weighted RMS norm.
pub fn wrms_partial_sum(v: &DVector<f64>, weights: &DVector<f64>) -> f64 {
    v.iter()
        .zip(weights.iter())
        .map(|(vi, wi)| {
            let r = vi / wi;
            r * r
        })
        .sum()
}

/// Weighted root-mean-square norm, `sqrt(Σ (v_i/w_i)^2 / N)` over all ranks.
pub fn weighted_rms_norm(comm: &dyn Communicator, v: &DVector<f64>, weights: &DVector<f64>) -> f64 {
    let sum = comm.sum_all(wrms_partial_sum(v, weights));
    let count = comm.sum_all_count(v.len());
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt()
}

pub fn two_norm(comm: &dyn Communicator, v: &DVector<f64>) -> f64 {
    comm.sum_all(v.norm_squared()).sqrt()
}

pub fn inf_norm(comm: &dyn Communicator, v: &DVector<f64>) -> f64 {
    comm.max_all(v.iter().fold(0.0_f64, |m, x| m.max(x.abs())))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pretends `ranks` processes each own an identical copy of the data.
    struct ReplicatedComm {
        ranks: usize,
    }

    impl Communicator for ReplicatedComm {
        fn rank(&self) -> usize {
            0
        }
        fn size(&self) -> usize {
            self.ranks
        }
        fn sum_all(&self, local: f64) -> f64 {
            local * self.ranks as f64
        }
        fn max_all(&self, local: f64) -> f64 {
            local
        }
        fn min_all(&self, local: f64) -> f64 {
            local
        }
        fn sum_all_count(&self, local: usize) -> usize {
            local * self.ranks
        }
    }

    #[test]
    fn wrms_of_unit_ratio_is_one() {
        let v = DVector::from_vec(vec![2.0, -4.0, 0.5]);
        let w = v.map(f64::abs);
        let norm = weighted_rms_norm(&SerialComm, &v, &w);
        assert!((norm - 1.0).abs() < 1e-14);
    }

    #[test]
    fn wrms_is_invariant_under_replication() {
        let v = DVector::from_vec(vec![1.0, 3.0]);
        let w = DVector::from_vec(vec![0.5, 2.0]);
        let serial = weighted_rms_norm(&SerialComm, &v, &w);
        let replicated = weighted_rms_norm(&ReplicatedComm { ranks: 4 }, &v, &w);
        assert!((serial - replicated).abs() < 1e-14);
    }

    #[test]
    fn two_norm_sums_across_ranks() {
        let v = DVector::from_vec(vec![3.0, 4.0]);
        assert!((two_norm(&SerialComm, &v) - 5.0).abs() < 1e-14);
        assert!((two_norm(&ReplicatedComm { ranks: 4 }, &v) - 10.0).abs() < 1e-14);
    }

    #[test]
    fn empty_vector_has_zero_norm() {
        let v = DVector::<f64>::zeros(0);
        assert_eq!(weighted_rms_norm(&SerialComm, &v, &v), 0.0);
        assert_eq!(inf_norm(&SerialComm, &v), 0.0);
    }

    #[test]
    fn default_slice_reduction_uses_sum_all() {
        let comm = ReplicatedComm { ranks: 3 };
        let mut buf = [1.0, 2.0];
        comm.sum_all_slice(&mut buf);
        assert_eq!(buf, [3.0, 6.0]);
    }
}
