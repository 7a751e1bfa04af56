//! Step-indexed learning-rate schedule.

#[derive(Debug, Clone, PartialEq)]
pub struct PiecewiseConstant {
    boundaries: Vec<usize>,
    values: Vec<f64>,
}

impl PiecewiseConstant {
    /// `values.len()` must be `boundaries.len() + 1`.
    pub fn new(boundaries: Vec<usize>, values: Vec<f64>) -> Option<Self> {
        (values.len() == boundaries.len() + 1 && boundaries.windows(2).all(|w| w[0] <= w[1]))
            .then_some(Self { boundaries, values })
    }

    /// `lr` until 3/5 of the run, `lr / 2` until 4/5, `lr / 4` after.
    pub fn for_run(learning_rate: f64, total_steps: usize) -> Self {
        Self {
            boundaries: vec![total_steps * 3 / 5, total_steps * 4 / 5],
            values: vec![learning_rate, learning_rate / 2.0, learning_rate / 4.0],
        }
    }

    /// A step equal to a boundary still gets the earlier value.
    pub fn value(&self, step: usize) -> f64 {
        let idx = self
            .boundaries
            .iter()
            .position(|b| step <= *b)
            .unwrap_or(self.boundaries.len());
        self.values[idx]
    }

    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }
}
