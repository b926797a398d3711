//! Discontinuity times the integrator must land on exactly.

/// Anything that can name the next discontinuity after a time.
pub trait BreakpointSource {
    fn next_breakpoint(&self, after: f64) -> Option<f64>;
}

impl BreakpointSource for Vec<f64> {
    fn next_breakpoint(&self, after: f64) -> Option<f64> {
        self.iter().copied().filter(|&t| t > after).fold(None, |best, t| match best {
            Some(b) if b <= t => Some(b),
            _ => Some(t),
        })
    }
}

/// Sorted breakpoint times; points closer than the tolerance are merged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BreakpointSet {
    times: Vec<f64>,
    tolerance: f64,
}

impl BreakpointSet {
    pub fn new(tolerance: f64) -> Self {
        Self {
            times: Vec::new(),
            tolerance: tolerance.max(0.0),
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.times.iter().copied()
    }

    /// Insert `t`, unless a point already lies within the tolerance.
    /// Returns whether the set changed.
    pub fn insert(&mut self, t: f64) -> bool {
        if !t.is_finite() {
            return false;
        }
        let idx = self.times.partition_point(|&s| s < t);
        let near = |i: usize| self.times.get(i).is_some_and(|&s| (s - t).abs() <= self.tolerance);
        if near(idx) || (idx > 0 && near(idx - 1)) {
            return false;
        }
        self.times.insert(idx, t);
        true
    }

    pub fn extend(&mut self, times: impl IntoIterator<Item = f64>) {
        for t in times {
            self.insert(t);
        }
    }

    /// First breakpoint strictly beyond `t` by more than the tolerance.
    pub fn next_after(&self, t: f64) -> Option<f64> {
        let idx = self.times.partition_point(|&s| s <= t + self.tolerance);
        self.times.get(idx).copied()
    }

    /// Whether `t` coincides with a breakpoint.
    pub fn contains(&self, t: f64) -> bool {
        let idx = self.times.partition_point(|&s| s < t - self.tolerance);
        self.times.get(idx).is_some_and(|&s| (s - t).abs() <= self.tolerance)
    }

    /// Drop every point at or before `t` (within tolerance).
    pub fn prune_through(&mut self, t: f64) {
        let idx = self.times.partition_point(|&s| s <= t + self.tolerance);
        self.times.drain(..idx);
    }
}

impl BreakpointSource for BreakpointSet {
    fn next_breakpoint(&self, after: f64) -> Option<f64> {
        self.next_after(after)
    }
}
