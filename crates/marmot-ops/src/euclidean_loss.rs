// EuclideanLoss — loss = sum((a - b)^2) / (2N)
//
// N is the size of the first axis (the batch). The top is a scalar and, as a
// loss operator, gets a default loss weight of 1.
//
// The gradient w.r.t. a is (a - b) / N scaled by the top gradient (which
// holds the loss weight); the gradient w.r.t. b is its negation. Either
// bottom may be propagated, so a target can be learned too.

use marmot_core::{Error, Result, Shape};

use crate::config::OpConfig;
use crate::operator::{Bindings, Operator};

#[derive(Debug, Clone, Default)]
pub struct EuclideanLoss {
    num: usize,
}

impl EuclideanLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(_cfg: &OpConfig) -> Result<Self> {
        Ok(Self::new())
    }
}

impl Operator for EuclideanLoss {
    fn kind(&self) -> &'static str {
        "EuclideanLoss"
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        Some(2)
    }

    fn exact_num_tops(&self) -> Option<usize> {
        Some(1)
    }

    fn reshape(&mut self, io: &Bindings<'_>) -> Result<()> {
        let a = io.bottoms[0].shape();
        let b = io.bottoms[1].shape();
        if a.elem_count() != b.elem_count() {
            return Err(Error::ShapeMismatch { expected: a, got: b });
        }
        self.num = a.dims().first().copied().unwrap_or(1).max(1);
        io.tops[0].reshape(Shape::scalar())
    }

    fn forward(&mut self, io: &Bindings<'_>) -> Result<()> {
        let a = io.bottoms[0].values()?;
        let b = io.bottoms[1].values()?;
        let sq: f32 = a.iter().zip(&b).map(|(x, y)| (x - y) * (x - y)).sum();
        io.tops[0].set_values(&[sq / (2.0 * self.num as f32)])
    }

    fn backward(&mut self, io: &Bindings<'_>, propagate_down: &[bool], _: &[bool]) -> Result<()> {
        if !propagate_down.iter().any(|&p| p) {
            return Ok(());
        }
        let a = io.bottoms[0].values()?;
        let b = io.bottoms[1].values()?;
        let scale = io.tops[0].grads()?[0] / self.num as f32;
        for (i, sign) in [(0usize, 1.0f32), (1, -1.0)] {
            if propagate_down[i] {
                let d: Vec<f32> = a.iter().zip(&b).map(|(x, y)| sign * scale * (x - y)).collect();
                io.emit_bottom_grad(i, &d)?;
            }
        }
        Ok(())
    }

    fn is_loss(&self) -> bool {
        true
    }
}
