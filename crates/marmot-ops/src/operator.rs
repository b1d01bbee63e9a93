// Operator — the contract every node's computation implements
//
// A graph node binds one operator to three ordered tensor lists:
//
//   bottoms  inputs, produced by earlier nodes or fed by the caller
//   tops     outputs, written by forward()
//   params   learnable tensors owned (or shared) by the node
//
// The operator never owns tensors. It receives them through Bindings for
// each call and reads or writes their buffers through `&Tensor`.
//
// GRADIENT CONVENTION:
//
//   backward() ADDS its contribution into each bottom's gradient, because a
//   tensor consumed by several nodes collects one term per consumer. The one
//   exception is an in-place pair (a top that is the same tensor as the
//   bottom): there the buffer still holds dY and is overwritten with dX.
//   Bindings::emit_bottom_grad applies this rule so operators don't have to.
//   Parameter gradients always accumulate.

use std::fmt;

use rand::rngs::StdRng;

use marmot_core::{Result, Shape, Tensor};

/// The tensors an operator works on for one call.
pub struct Bindings<'a> {
    pub bottoms: Vec<&'a Tensor>,
    pub tops: Vec<&'a Tensor>,
    pub params: Vec<&'a Tensor>,
}

impl<'a> Bindings<'a> {
    /// Whether bottom `i` is also one of the tops.
    pub fn is_in_place(&self, i: usize) -> bool {
        let id = self.bottoms[i].id();
        self.tops.iter().any(|t| t.id() == id)
    }

    /// Write `delta` as bottom `i`'s gradient contribution: added to what is
    /// there, or stored outright for an in-place pair.
    pub fn emit_bottom_grad(&self, i: usize, delta: &[f32]) -> Result<()> {
        if self.is_in_place(i) {
            self.bottoms[i].set_grads(delta)
        } else {
            self.bottoms[i].accumulate_grads(delta)
        }
    }

    pub fn bottom_shapes(&self) -> Vec<Shape> {
        self.bottoms.iter().map(|t| t.shape()).collect()
    }
}

/// The capability every operator type implements.
pub trait Operator: Send + fmt::Debug {
    /// Registry tag of this operator (e.g. "InnerProduct").
    fn kind(&self) -> &'static str;

    /// Required number of bottoms, if fixed.
    fn exact_num_bottoms(&self) -> Option<usize> {
        None
    }

    /// Required number of tops, if fixed.
    fn exact_num_tops(&self) -> Option<usize> {
        None
    }

    /// Shapes of the parameters this operator needs, given its bottom shapes.
    fn param_shapes(&self, _bottoms: &[Shape]) -> Result<Vec<Shape>> {
        Ok(Vec::new())
    }

    /// Fill freshly allocated parameters. Only called for parameters this
    /// node owns; shared parameters keep their owner's values.
    fn init_params(&self, _params: &[&Tensor], _rng: &mut StdRng) -> Result<()> {
        Ok(())
    }

    /// One-time setup after bindings are resolved.
    fn set_up(&mut self, _io: &Bindings<'_>) -> Result<()> {
        Ok(())
    }

    /// Derive top shapes from bottom shapes. No numeric work.
    fn reshape(&mut self, io: &Bindings<'_>) -> Result<()>;

    /// Compute tops from bottoms and params.
    fn forward(&mut self, io: &Bindings<'_>) -> Result<()>;

    /// Propagate top gradients into bottoms where `propagate_down[i]` is set
    /// and into params where `param_propagate[j]` is set.
    fn backward(
        &mut self,
        io: &Bindings<'_>,
        propagate_down: &[bool],
        param_propagate: &[bool],
    ) -> Result<()>;

    /// Loss operators get a default loss weight of 1 on their first top.
    fn is_loss(&self) -> bool {
        false
    }

    /// Whether a top may be declared with the same name as its bottom.
    fn allows_in_place(&self) -> bool {
        false
    }

    /// Whether `force_backward` may turn on gradients for bottom `i`.
    fn allow_force_backward(&self, _bottom: usize) -> bool {
        true
    }
}

/// Element-wise single-input check shared by the unary operators.
pub(crate) fn reshape_like_bottom(io: &Bindings<'_>) -> Result<()> {
    let shape = io.bottoms[0].shape();
    for top in &io.tops {
        if top.id() != io.bottoms[0].id() {
            top.reshape(shape.clone())?;
        }
    }
    Ok(())
}
