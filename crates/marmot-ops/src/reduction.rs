// Reduction — collapse all axes from `axis` on into one number per slice
//
//   SUM    coeff * sum(x)
//   MEAN   coeff * sum(x) / K
//   ASUM   coeff * sum(|x|)
//   SUMSQ  coeff * sum(x^2)
//
// With the default axis 0 the whole bottom becomes a scalar top, which is
// how a graph turns an activation into a loss.

use marmot_core::{Error, Result, Shape};

use crate::config::OpConfig;
use crate::operator::{Bindings, Operator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionOp {
    Sum,
    Mean,
    Asum,
    Sumsq,
}

impl ReductionOp {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(ReductionOp::Sum),
            "mean" => Ok(ReductionOp::Mean),
            "asum" => Ok(ReductionOp::Asum),
            "sumsq" => Ok(ReductionOp::Sumsq),
            other => Err(Error::config(format!("unknown reduction operation '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reduction {
    op: ReductionOp,
    coeff: f32,
    axis: usize,
    outer: usize,
    inner: usize,
}

impl Reduction {
    pub fn new(op: ReductionOp, coeff: f32) -> Self {
        Reduction {
            op,
            coeff,
            axis: 0,
            outer: 1,
            inner: 0,
        }
    }

    /// Reads `operation` (default "sum"), `coeff` (default 1) and `axis`
    /// (default 0).
    pub fn from_config(cfg: &OpConfig) -> Result<Self> {
        let mut r = Reduction::new(
            ReductionOp::parse(cfg.str_or("operation", "sum")?)?,
            cfg.f32_or("coeff", 1.0)?,
        );
        r.axis = cfg.usize_or("axis", 0)?;
        Ok(r)
    }
}

impl Operator for Reduction {
    fn kind(&self) -> &'static str {
        "Reduction"
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        Some(1)
    }

    fn exact_num_tops(&self) -> Option<usize> {
        Some(1)
    }

    fn reshape(&mut self, io: &Bindings<'_>) -> Result<()> {
        let shape = io.bottoms[0].shape();
        if self.axis > shape.rank() {
            return Err(Error::shape(format!(
                "Reduction axis {} out of range for bottom shape {shape}",
                self.axis
            )));
        }
        self.inner = shape.count_from(self.axis);
        self.outer = shape.dims()[..self.axis].iter().product();
        io.tops[0].reshape(Shape::from(&shape.dims()[..self.axis]))
    }

    fn forward(&mut self, io: &Bindings<'_>) -> Result<()> {
        let x = io.bottoms[0].values()?;
        let inner = self.inner;
        let y: Vec<f32> = (0..self.outer)
            .map(|o| {
                let s = &x[o * inner..(o + 1) * inner];
                let r = match self.op {
                    ReductionOp::Sum => s.iter().sum::<f32>(),
                    ReductionOp::Mean => s.iter().sum::<f32>() / inner.max(1) as f32,
                    ReductionOp::Asum => s.iter().map(|v| v.abs()).sum(),
                    ReductionOp::Sumsq => s.iter().map(|v| v * v).sum(),
                };
                self.coeff * r
            })
            .collect();
        io.tops[0].set_values(&y)
    }

    fn backward(&mut self, io: &Bindings<'_>, propagate_down: &[bool], _: &[bool]) -> Result<()> {
        if !propagate_down[0] {
            return Ok(());
        }
        let x = io.bottoms[0].values()?;
        let dy = io.tops[0].grads()?;
        let inner = self.inner;
        let mut dx = vec![0.0f32; x.len()];
        for o in 0..self.outer {
            let g = self.coeff * dy[o];
            for i in o * inner..(o + 1) * inner {
                dx[i] = match self.op {
                    ReductionOp::Sum => g,
                    ReductionOp::Mean => g / inner as f32,
                    ReductionOp::Asum => sign(x[i]) * g,
                    ReductionOp::Sumsq => 2.0 * g * x[i],
                };
            }
        }
        io.emit_bottom_grad(0, &dx)
    }
}

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_core::{MemoryContext, Tensor, TensorId};

    fn run(op: ReductionOp, coeff: f32, x: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let bottom = Tensor::new(TensorId(0), "x", x.len(), MemoryContext::HostOnly);
        let top = Tensor::new(TensorId(1), "y", (), MemoryContext::HostOnly);
        bottom.set_values(x).unwrap();
        let io = Bindings { bottoms: vec![&bottom], tops: vec![&top], params: vec![] };
        let mut r = Reduction::new(op, coeff);
        r.reshape(&io).unwrap();
        r.forward(&io).unwrap();
        top.fill_grads(1.0).unwrap();
        r.backward(&io, &[true], &[]).unwrap();
        (top.values().unwrap(), bottom.grads().unwrap())
    }

    #[test]
    fn test_sum_to_scalar() {
        let (y, dx) = run(ReductionOp::Sum, 1.0, &[1.0, 2.0, 3.0]);
        assert_eq!(y, vec![6.0]);
        assert_eq!(dx, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_mean_and_coeff() {
        let (y, dx) = run(ReductionOp::Mean, 2.0, &[1.0, 3.0]);
        assert_eq!(y, vec![4.0]);
        assert_eq!(dx, vec![1.0, 1.0]);
    }

    #[test]
    fn test_asum_and_sumsq() {
        let (y, dx) = run(ReductionOp::Asum, 1.0, &[-2.0, 0.0, 1.0]);
        assert_eq!(y, vec![3.0]);
        assert_eq!(dx, vec![-1.0, 0.0, 1.0]);

        let (y, dx) = run(ReductionOp::Sumsq, 0.5, &[2.0, -1.0]);
        assert_eq!(y, vec![2.5]);
        assert_eq!(dx, vec![2.0, -1.0]);
    }

    #[test]
    fn test_axis_keeps_leading_dims() {
        let bottom = Tensor::new(TensorId(0), "x", (2, 3), MemoryContext::HostOnly);
        let top = Tensor::new(TensorId(1), "y", (), MemoryContext::HostOnly);
        bottom.set_values(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let io = Bindings { bottoms: vec![&bottom], tops: vec![&top], params: vec![] };
        let cfg = OpConfig::new().with("axis", 1usize);
        let mut r = Reduction::from_config(&cfg).unwrap();
        r.reshape(&io).unwrap();
        r.forward(&io).unwrap();
        assert_eq!(top.shape(), Shape::from(2));
        assert_eq!(top.values().unwrap(), vec![6.0, 15.0]);
    }

    #[test]
    fn test_unknown_operation() {
        let cfg = OpConfig::new().with("operation", "max");
        assert!(Reduction::from_config(&cfg).is_err());
    }
}
