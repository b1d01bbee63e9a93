// InnerProduct — fully-connected layer: y = x W^T + b
//
// The bottom is folded at `axis` into a matrix:
//
//   M = product of dims before axis   (rows, e.g. batch)
//   K = product of dims from axis on  (features per row)
//
// PARAMETER SHAPES:
//
//   weight: [num_output, K]
//   bias:   [num_output]        (only when bias_term is set)
//
// The top keeps the leading dims and replaces the rest with num_output.
//
// BACKWARD:
//
//   dW[n, k] += sum_m dY[m, n] * X[m, k]
//   db[n]    += sum_m dY[m, n]
//   dX[m, k] += sum_n dY[m, n] * W[n, k]

use rand::rngs::StdRng;

use marmot_core::{Error, Result, Shape, Tensor};

use crate::config::OpConfig;
use crate::filler::Filler;
use crate::operator::{Bindings, Operator};

#[derive(Debug, Clone)]
pub struct InnerProduct {
    num_output: usize,
    bias_term: bool,
    axis: usize,
    weight_filler: Filler,
    bias_filler: Filler,
    m: usize,
    k: usize,
}

impl InnerProduct {
    pub fn new(num_output: usize, bias_term: bool) -> Self {
        InnerProduct {
            num_output,
            bias_term,
            axis: 1,
            weight_filler: Filler::Xavier,
            bias_filler: Filler::Constant { value: 0.0 },
            m: 0,
            k: 0,
        }
    }

    /// Reads `num_output` (required), `bias_term` (default true), `axis`
    /// (default 1), `weight_filler` (default xavier) and `bias_filler`
    /// (default constant 0).
    pub fn from_config(cfg: &OpConfig) -> Result<Self> {
        let num_output = cfg.require_usize("num_output")?;
        if num_output == 0 {
            return Err(Error::config("InnerProduct num_output must be positive"));
        }
        let mut op = InnerProduct::new(num_output, cfg.bool_or("bias_term", true)?);
        op.axis = cfg.usize_or("axis", 1)?;
        op.weight_filler = Filler::from_config(cfg, "weight_filler", op.weight_filler)?;
        op.bias_filler = Filler::from_config(cfg, "bias_filler", op.bias_filler)?;
        Ok(op)
    }

    fn fold(&self, shape: &Shape) -> Result<(usize, usize)> {
        if self.axis > shape.rank() {
            return Err(Error::shape(format!(
                "InnerProduct axis {} out of range for bottom shape {shape}",
                self.axis
            )));
        }
        let k = shape.count_from(self.axis);
        Ok((shape.elem_count() / k.max(1), k))
    }
}

impl Operator for InnerProduct {
    fn kind(&self) -> &'static str {
        "InnerProduct"
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        Some(1)
    }

    fn exact_num_tops(&self) -> Option<usize> {
        Some(1)
    }

    fn param_shapes(&self, bottoms: &[Shape]) -> Result<Vec<Shape>> {
        let (_, k) = self.fold(&bottoms[0])?;
        let mut shapes = vec![Shape::from((self.num_output, k))];
        if self.bias_term {
            shapes.push(Shape::from(self.num_output));
        }
        Ok(shapes)
    }

    fn init_params(&self, params: &[&Tensor], rng: &mut StdRng) -> Result<()> {
        if let Some(w) = params.first() {
            self.weight_filler.fill(w, rng)?;
        }
        if let Some(b) = params.get(1) {
            self.bias_filler.fill(b, rng)?;
        }
        Ok(())
    }

    fn reshape(&mut self, io: &Bindings<'_>) -> Result<()> {
        let bottom = io.bottoms[0].shape();
        let (m, k) = self.fold(&bottom)?;
        let weight = io.params[0].shape();
        if weight.dims() != [self.num_output, k] {
            return Err(Error::ShapeMismatch {
                expected: weight,
                got: Shape::from((self.num_output, k)),
            });
        }
        self.m = m;
        self.k = k;
        let mut top = bottom.dims()[..self.axis].to_vec();
        top.push(self.num_output);
        io.tops[0].reshape(top)
    }

    fn forward(&mut self, io: &Bindings<'_>) -> Result<()> {
        let (m, k, n) = (self.m, self.k, self.num_output);
        let x = io.bottoms[0].values()?;
        let w = io.params[0].values()?;
        let b = match io.params.get(1) {
            Some(t) => t.values()?,
            None => vec![0.0; n],
        };
        let mut y = vec![0.0f32; m * n];
        for row in 0..m {
            let xr = &x[row * k..(row + 1) * k];
            for col in 0..n {
                let wr = &w[col * k..(col + 1) * k];
                let dot: f32 = xr.iter().zip(wr).map(|(a, b)| a * b).sum();
                y[row * n + col] = dot + b[col];
            }
        }
        io.tops[0].set_values(&y)
    }

    fn backward(
        &mut self,
        io: &Bindings<'_>,
        propagate_down: &[bool],
        param_propagate: &[bool],
    ) -> Result<()> {
        let (m, k, n) = (self.m, self.k, self.num_output);
        let dy = io.tops[0].grads()?;

        if param_propagate.first().copied().unwrap_or(false) {
            let x = io.bottoms[0].values()?;
            let mut dw = vec![0.0f32; n * k];
            for row in 0..m {
                for col in 0..n {
                    let g = dy[row * n + col];
                    for i in 0..k {
                        dw[col * k + i] += g * x[row * k + i];
                    }
                }
            }
            io.params[0].accumulate_grads(&dw)?;
        }

        if let (Some(bias), true) = (io.params.get(1), param_propagate.get(1).copied().unwrap_or(false)) {
            let mut db = vec![0.0f32; n];
            for row in 0..m {
                for col in 0..n {
                    db[col] += dy[row * n + col];
                }
            }
            bias.accumulate_grads(&db)?;
        }

        if propagate_down[0] {
            let w = io.params[0].values()?;
            let mut dx = vec![0.0f32; m * k];
            for row in 0..m {
                for col in 0..n {
                    let g = dy[row * n + col];
                    for i in 0..k {
                        dx[row * k + i] += g * w[col * k + i];
                    }
                }
            }
            io.emit_bottom_grad(0, &dx)?;
        }
        Ok(())
    }
}
