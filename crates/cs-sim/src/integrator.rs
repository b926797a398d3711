//! Variable-order, variable-step BDF in modified divided difference form.
//!
//! Fixed-leading-coefficient formulation of orders 1 through 5. The solution
//! history is a set of scaled differences `φ_0 ..= φ_k`; the predictor is
//! their sum and each accepted correction is folded back in.

use nalgebra::DVector;

pub const MAX_BDF_ORDER: usize = 5;

const SLOTS: usize = MAX_BDF_ORDER + 1;

// Step-size and order selection constants.
pub(crate) const H0_SAFETY: f64 = 2.0;
pub(crate) const H_PHASE0_INCR: f64 = 2.0;
pub(crate) const TKM1_TK_SAFETY: f64 = 2.0;
pub(crate) const TKP1_TK_SAFETY: f64 = 0.5;
pub(crate) const R_FACTOR: f64 = 0.9;
pub(crate) const R_SAFETY: f64 = 2.0;
pub(crate) const R_FUDGE: f64 = 1e-4;
pub(crate) const R_MIN: f64 = 0.25;
pub(crate) const R_MAX: f64 = 0.9;
pub(crate) const R_HINCR_TEST: f64 = 2.0;
pub(crate) const R_HINCR: f64 = 2.0;

/// Integration method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IntegrationMethod {
    /// Fixed-leading-coefficient BDF up to `max_order` (at most 5).
    VariableOrderBdf { max_order: usize },
    /// The same family held at order 1.
    BackwardEuler,
    /// Static problems; time is not advanced.
    NoIntegration,
}

impl Default for IntegrationMethod {
    fn default() -> Self {
        IntegrationMethod::VariableOrderBdf {
            max_order: MAX_BDF_ORDER,
        }
    }
}

impl IntegrationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationMethod::VariableOrderBdf { .. } => "bdf",
            IntegrationMethod::BackwardEuler => "backward_euler",
            IntegrationMethod::NoIntegration => "none",
        }
    }

    pub fn max_order(&self) -> usize {
        match *self {
            IntegrationMethod::VariableOrderBdf { max_order } => max_order.clamp(1, MAX_BDF_ORDER),
            IntegrationMethod::BackwardEuler => 1,
            IntegrationMethod::NoIntegration => 0,
        }
    }

    pub fn integrates(&self) -> bool {
        !matches!(self, IntegrationMethod::NoIntegration)
    }
}

/// Coefficients of the current step.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BdfCoefficients {
    /// `psi[j]`: sum of the last `j + 1` step sizes.
    pub psi: [f64; SLOTS],
    pub alpha: [f64; SLOTS],
    pub beta: [f64; SLOTS],
    pub sigma: [f64; SLOTS],
    pub gamma: [f64; SLOTS],
    pub alphas: f64,
    pub alpha0: f64,
    /// Leading coefficient: weight of `∂q/∂x` in the corrector Jacobian.
    pub cj: f64,
    /// Error constant of the current order.
    pub ck: f64,
    /// Number of steps taken at constant size and order (capped).
    pub constant_steps: usize,
}

impl Default for BdfCoefficients {
    fn default() -> Self {
        let mut unit = [0.0; SLOTS];
        unit[0] = 1.0;
        Self {
            psi: [0.0; SLOTS],
            alpha: unit,
            beta: unit,
            sigma: unit,
            gamma: [0.0; SLOTS],
            alphas: -1.0,
            alpha0: -1.0,
            cj: 0.0,
            ck: 0.0,
            constant_steps: 0,
        }
    }
}

impl BdfCoefficients {
    /// State at (re)start with first step `h`.
    pub fn reset(&mut self, h: f64) {
        *self = Self::default();
        self.psi[0] = h;
        self.cj = 1.0 / h;
    }

    /// Coefficients for a step of size `h` at `order`, given the previous
    /// accepted step and order.
    pub fn update(&mut self, h: f64, order: usize, used_step: f64, used_order: usize) {
        let k = order;
        if h != used_step || k != used_order {
            self.constant_steps = 0;
        }
        self.constant_steps = (self.constant_steps + 1).min(used_order + 2);

        if k + 1 >= self.constant_steps {
            self.beta[0] = 1.0;
            self.alpha[0] = 1.0;
            self.sigma[0] = 1.0;
            self.gamma[0] = 0.0;
            let mut temp1 = h;
            for i in 1..=k {
                let temp2 = self.psi[i - 1];
                self.psi[i - 1] = temp1;
                self.beta[i] = self.beta[i - 1] * self.psi[i - 1] / temp2;
                temp1 = temp2 + h;
                self.alpha[i] = h / temp1;
                self.sigma[i] = (i + 1) as f64 * self.sigma[i - 1] * self.alpha[i];
                self.gamma[i] = self.gamma[i - 1] + self.alpha[i - 1] / h;
            }
            self.psi[k] = temp1;
        }

        self.alphas = -(0..k).map(|i| 1.0 / (i + 1) as f64).sum::<f64>();
        self.alpha0 = -(0..k).map(|i| self.alpha[i]).sum::<f64>();
        self.cj = -self.alphas / h;
        self.ck = (self.alpha[k] + self.alphas - self.alpha0).abs().max(self.alpha[k]);
    }

    /// Undo the `psi` shift of a rejected step of size `h`.
    pub fn restore(&mut self, h: f64, order: usize) {
        for i in 1..=order {
            self.psi[i - 1] = self.psi[i] - h;
        }
    }
}

/// Scaled differences `φ_0 ..= φ_k`, plus `φ_{k+1}` once one exists.
#[derive(Clone, Debug, PartialEq)]
pub struct DifferenceHistory {
    terms: Vec<DVector<f64>>,
    next: Option<DVector<f64>>,
}

impl DifferenceHistory {
    /// Order-1 history from a value and its first scaled difference.
    pub fn start(value: DVector<f64>, first: DVector<f64>) -> Self {
        Self {
            terms: vec![value, first],
            next: None,
        }
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn order(&self) -> usize {
        self.terms.len().saturating_sub(1)
    }

    /// `φ_i`; index `order + 1` reads the pending difference.
    pub fn term(&self, i: usize) -> Option<&DVector<f64>> {
        self.terms.get(i).or(if i == self.terms.len() {
            self.next.as_ref()
        } else {
            None
        })
    }

    pub fn next_difference(&self) -> Option<&DVector<f64>> {
        self.next.as_ref()
    }

    pub fn terms(&self) -> &[DVector<f64>] {
        &self.terms
    }

    pub(crate) fn from_parts(terms: Vec<DVector<f64>>, next: Option<DVector<f64>>) -> Self {
        Self { terms, next }
    }

    /// Multiply `φ_i` by `beta[i]` for `i >= from`.
    pub fn scale_for_prediction(&mut self, from: usize, beta: &[f64]) {
        for (i, term) in self.terms.iter_mut().enumerate().skip(from) {
            *term *= beta[i];
        }
    }

    /// Inverse of [`Self::scale_for_prediction`].
    pub fn unscale(&mut self, from: usize, beta: &[f64]) {
        for (i, term) in self.terms.iter_mut().enumerate().skip(from) {
            *term /= beta[i];
        }
    }

    /// Predictor `Σ φ_i`.
    pub fn predict(&self) -> DVector<f64> {
        let mut sum = self.terms[0].clone();
        for term in &self.terms[1..] {
            sum += term;
        }
        sum
    }

    /// `Σ_{i>=1} γ_i φ_i`, the predicted derivative.
    pub fn derivative(&self, gamma: &[f64]) -> DVector<f64> {
        let mut sum = DVector::zeros(self.terms[0].len());
        for (i, term) in self.terms.iter().enumerate().skip(1) {
            sum.axpy(gamma[i], term, 1.0);
        }
        sum
    }

    /// Fold an accepted correction `delta` into the history.
    pub fn absorb(&mut self, delta: &DVector<f64>, max_order: usize) {
        let k = self.order();
        self.next = (k < max_order).then(|| delta.clone());
        self.terms[k] += delta;
        for j in (0..k).rev() {
            let (lo, hi) = self.terms.split_at_mut(j + 1);
            lo[j] += &hi[0];
        }
    }

    /// Forget the pending difference.
    pub fn clear_next(&mut self) {
        self.next = None;
    }

    /// Change the order. Raising needs the pending difference and goes up
    /// by one at most. Returns the order actually set.
    pub fn set_order(&mut self, order: usize) -> usize {
        let order = order.max(1);
        if order > self.order() {
            if let Some(next) = self.next.take() {
                self.terms.push(next);
            }
        }
        while self.order() > order {
            self.next = self.terms.pop();
        }
        self.order()
    }

    /// Scale `φ_1` (used when the very first step is retried smaller).
    pub fn scale_first_difference(&mut self, r: f64) {
        if let Some(t) = self.terms.get_mut(1) {
            *t *= r;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f64) -> DVector<f64> {
        DVector::from_element(1, x)
    }

    #[test]
    fn first_step_is_backward_euler() {
        let h = 0.1;
        let mut c = BdfCoefficients::default();
        c.reset(h);
        c.update(h, 1, 0.0, 1);
        assert!((c.cj - 1.0 / h).abs() < 1e-12);
        assert!((c.gamma[1] - 1.0 / h).abs() < 1e-12);
        assert!((c.beta[1] - 1.0).abs() < 1e-15);
        assert!((c.ck - 0.5).abs() < 1e-15);
        assert!((c.psi[1] - 2.0 * h).abs() < 1e-15);
    }

    #[test]
    fn constant_step_order_two_matches_bdf2() {
        let h = 0.5;
        let mut c = BdfCoefficients::default();
        c.reset(h);
        c.update(h, 1, 0.0, 1);
        c.update(h, 2, h, 1);
        // BDF2 leading coefficient is 3/(2h).
        assert!((c.cj - 1.5 / h).abs() < 1e-12);
    }

    #[test]
    fn restore_undoes_psi_shift() {
        let mut c = BdfCoefficients::default();
        c.reset(0.2);
        c.update(0.2, 1, 0.0, 1);
        let saved = c.psi;
        c.update(0.1, 1, 0.2, 1);
        c.restore(0.1, 1);
        assert!((c.psi[0] - saved[0]).abs() < 1e-15);
    }

    #[test]
    fn absorb_at_order_one_produces_backward_difference() {
        let mut hist = DifferenceHistory::start(v(1.0), v(0.0));
        let pred = hist.predict();
        let x_new = v(0.8);
        hist.absorb(&(&x_new - &pred), 5);
        assert_eq!(hist.term(0), Some(&v(0.8)));
        assert!((hist.term(1).unwrap()[0] + 0.2).abs() < 1e-15);
        assert!(hist.next_difference().is_some());
    }

    #[test]
    fn set_order_moves_the_pending_difference() {
        let mut hist = DifferenceHistory::start(v(1.0), v(0.5));
        assert_eq!(hist.set_order(2), 1, "no pending difference yet");
        hist.absorb(&v(0.1), 5);
        assert_eq!(hist.set_order(2), 2);
        assert_eq!(hist.len(), 3);
        assert!(hist.next_difference().is_none());
        assert_eq!(hist.set_order(1), 1);
        assert_eq!(hist.len(), 2);
        assert!(hist.next_difference().is_some());
        assert_eq!(hist.term(2), hist.next_difference());
    }

    #[test]
    fn scaling_round_trips() {
        let mut hist = DifferenceHistory::start(v(2.0), v(3.0));
        let beta = [1.0, 1.7, 1.0, 1.0, 1.0, 1.0];
        hist.scale_for_prediction(1, &beta);
        assert!((hist.term(1).unwrap()[0] - 5.1).abs() < 1e-12);
        hist.unscale(1, &beta);
        assert!((hist.term(1).unwrap()[0] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn method_orders() {
        assert_eq!(IntegrationMethod::default().max_order(), 5);
        assert_eq!(IntegrationMethod::VariableOrderBdf { max_order: 9 }.max_order(), 5);
        assert_eq!(IntegrationMethod::BackwardEuler.max_order(), 1);
        assert!(!IntegrationMethod::NoIntegration.integrates());
    }
}
