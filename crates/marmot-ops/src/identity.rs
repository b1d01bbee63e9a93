use marmot_core::Result;

use crate::config::OpConfig;
use crate::operator::{reshape_like_bottom, Bindings, Operator};

/// `top = bottom`. May run in place.
#[derive(Debug, Clone, Default)]
pub struct Identity;

impl Identity {
    pub fn from_config(_cfg: &OpConfig) -> Result<Self> {
        Ok(Identity)
    }
}

impl Operator for Identity {
    fn kind(&self) -> &'static str {
        "Identity"
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
        if io.is_in_place(0) {
            return Ok(());
        }
        let x = io.bottoms[0].values()?;
        io.tops[0].set_values(&x)
    }

    fn backward(&mut self, io: &Bindings<'_>, propagate_down: &[bool], _: &[bool]) -> Result<()> {
        if !propagate_down[0] || io.is_in_place(0) {
            return Ok(());
        }
        let dy = io.tops[0].grads()?;
        io.emit_bottom_grad(0, &dy)
    }

    fn allows_in_place(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_core::{MemoryContext, Tensor, TensorId};

    #[test]
    fn test_identity_passes_values_and_grads() {
        let x = Tensor::new(TensorId(0), "x", 2, MemoryContext::HostOnly);
        let y = Tensor::new(TensorId(1), "y", 1, MemoryContext::HostOnly);
        x.set_values(&[1.0, -2.0]).unwrap();
        let io = Bindings { bottoms: vec![&x], tops: vec![&y], params: vec![] };
        let mut op = Identity;
        op.reshape(&io).unwrap();
        op.forward(&io).unwrap();
        assert_eq!(y.values().unwrap(), vec![1.0, -2.0]);

        y.set_grads(&[0.5, 0.25]).unwrap();
        op.backward(&io, &[true], &[]).unwrap();
        op.backward(&io, &[true], &[]).unwrap();
        assert_eq!(x.grads().unwrap(), vec![1.0, 0.5]);
    }
}
