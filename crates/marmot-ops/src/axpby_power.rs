// AxpbyPower — y = alpha * x + beta * x^power
//
// Derivative: dy/dx = alpha + beta * power * x^(power - 1). Both terms are
// applied; dropping alpha would only be right for alpha = 0.
//
// Backward needs the original x, so the operator cannot run in place.

use marmot_core::Result;

use crate::config::OpConfig;
use crate::operator::{reshape_like_bottom, Bindings, Operator};

#[derive(Debug, Clone)]
pub struct AxpbyPower {
    alpha: f32,
    beta: f32,
    power: f32,
}

impl AxpbyPower {
    pub fn new(alpha: f32, beta: f32, power: f32) -> Self {
        AxpbyPower { alpha, beta, power }
    }

    /// Reads `alpha`, `beta` and `power`, each defaulting to 1.
    pub fn from_config(cfg: &OpConfig) -> Result<Self> {
        Ok(AxpbyPower::new(
            cfg.f32_or("alpha", 1.0)?,
            cfg.f32_or("beta", 1.0)?,
            cfg.f32_or("power", 1.0)?,
        ))
    }
}

impl Operator for AxpbyPower {
    fn kind(&self) -> &'static str {
        "AxpbyPower"
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
        let y: Vec<f32> = io.bottoms[0]
            .values()?
            .iter()
            .map(|&x| self.alpha * x + self.beta * x.powf(self.power))
            .collect();
        io.tops[0].set_values(&y)
    }

    fn backward(&mut self, io: &Bindings<'_>, propagate_down: &[bool], _: &[bool]) -> Result<()> {
        if !propagate_down[0] {
            return Ok(());
        }
        let x = io.bottoms[0].values()?;
        let dy = io.tops[0].grads()?;
        let dx: Vec<f32> = x
            .iter()
            .zip(&dy)
            .map(|(&x, &g)| (self.alpha + self.beta * self.power * x.powf(self.power - 1.0)) * g)
            .collect();
        io.emit_bottom_grad(0, &dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_core::{MemoryContext, Tensor, TensorId};

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_forward_and_derivative() {
        let x = Tensor::new(TensorId(0), "x", 2, MemoryContext::HostOnly);
        let y = Tensor::new(TensorId(1), "y", 2, MemoryContext::HostOnly);
        x.set_values(&[2.0, 3.0]).unwrap();
        let io = Bindings { bottoms: vec![&x], tops: vec![&y], params: vec![] };
        // y = 0.5 x + 2 x^2
        let mut op = AxpbyPower::new(0.5, 2.0, 2.0);
        op.forward(&io).unwrap();
        let out = y.values().unwrap();
        assert!(approx_eq(out[0], 9.0));
        assert!(approx_eq(out[1], 19.5));

        y.fill_grads(1.0).unwrap();
        op.backward(&io, &[true], &[]).unwrap();
        let dx = x.grads().unwrap();
        // dy/dx = 0.5 + 4 x
        assert!(approx_eq(dx[0], 8.5));
        assert!(approx_eq(dx[1], 12.5));
    }

    #[test]
    fn test_matches_finite_difference() {
        let op_cfg = OpConfig::new().with("alpha", 1.5).with("beta", -0.5).with("power", 3.0);
        let mut op = AxpbyPower::from_config(&op_cfg).unwrap();
        let f = |x: f32| 1.5 * x - 0.5 * x.powi(3);
        let x0 = 0.7f32;
        let eps = 1e-3f32;
        let numeric = (f(x0 + eps) - f(x0 - eps)) / (2.0 * eps);

        let x = Tensor::new(TensorId(0), "x", 1, MemoryContext::HostOnly);
        let y = Tensor::new(TensorId(1), "y", 1, MemoryContext::HostOnly);
        x.set_values(&[x0]).unwrap();
        y.fill_grads(1.0).unwrap();
        let io = Bindings { bottoms: vec![&x], tops: vec![&y], params: vec![] };
        op.backward(&io, &[true], &[]).unwrap();
        assert!((x.grads().unwrap()[0] - numeric).abs() < 1e-2);
    }
}
