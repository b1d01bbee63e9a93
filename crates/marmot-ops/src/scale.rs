use marmot_core::Result;

use crate::config::OpConfig;
use crate::operator::{reshape_like_bottom, Bindings, Operator};

/// `top = factor * bottom`. May run in place.
#[derive(Debug, Clone)]
pub struct Scale {
    factor: f32,
}

impl Scale {
    pub fn new(factor: f32) -> Self {
        Scale { factor }
    }

    /// Reads `factor` (default 1).
    pub fn from_config(cfg: &OpConfig) -> Result<Self> {
        Ok(Scale::new(cfg.f32_or("factor", 1.0)?))
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }
}

impl Operator for Scale {
    fn kind(&self) -> &'static str {
        "Scale"
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        Some(1)
    }

    fn exact_num_tops(&self) -> Option<usize> {
        Some(1)
    }

    fn reshape(&mut self, io: &Bindings<'_>) -> Result<()> {
        reshape_like_bottom(io)
    }

    fn forward(&mut self, io: &Bindings<'_>) -> Result<()> {
        let y: Vec<f32> = io.bottoms[0].values()?.iter().map(|x| x * self.factor).collect();
        io.tops[0].set_values(&y)
    }

    fn backward(&mut self, io: &Bindings<'_>, propagate_down: &[bool], _: &[bool]) -> Result<()> {
        if !propagate_down[0] {
            return Ok(());
        }
        let dx: Vec<f32> = io.tops[0].grads()?.iter().map(|g| g * self.factor).collect();
        io.emit_bottom_grad(0, &dx)
    }

    fn allows_in_place(&self) -> bool {
        true
    }
}
