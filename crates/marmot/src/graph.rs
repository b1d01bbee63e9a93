// Graph — the built, topologically ordered network
//
// The builder produces a Graph; an Executor runs it. The graph owns:
//
//   tensors   arena of every tensor, data edges and parameters alike,
//             addressed by TensorId
//   nodes     operators in execution order, each holding TensorIds
//   params    the owner/sharer registry
//
// Topology never changes after build. Only tensor buffers (and shapes, via
// reshape) mutate while the graph runs.

use std::collections::HashMap;
use std::fmt;

use marmot_core::{bail, Error, MemoryContext, Result, Tensor, TensorId};
use marmot_ops::{Bindings, Operator};

use crate::params::{Learnable, ParamId, ParamRegistry, ParamRole};
use crate::spec::Phase;

/// One operator bound to its tensors.
pub struct GraphNode {
    pub(crate) name: String,
    pub(crate) op: Box<dyn Operator>,
    pub(crate) bottoms: Vec<TensorId>,
    pub(crate) tops: Vec<TensorId>,
    pub(crate) params: Vec<TensorId>,
    pub(crate) param_ids: Vec<ParamId>,
    pub(crate) bottom_need_backward: Vec<bool>,
    pub(crate) param_propagate: Vec<bool>,
    pub(crate) loss_weights: Vec<f32>,
    pub(crate) needs_backward: bool,
}

impl GraphNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operator type tag.
    pub fn kind(&self) -> &'static str {
        self.op.kind()
    }

    pub fn bottoms(&self) -> &[TensorId] {
        &self.bottoms
    }

    pub fn tops(&self) -> &[TensorId] {
        &self.tops
    }

    /// Parameter tensors, by slot.
    pub fn params(&self) -> &[TensorId] {
        &self.params
    }

    pub fn param_ids(&self) -> &[ParamId] {
        &self.param_ids
    }

    pub fn bottom_need_backward(&self) -> &[bool] {
        &self.bottom_need_backward
    }

    pub fn param_propagate(&self) -> &[bool] {
        &self.param_propagate
    }

    /// Loss weight of each top.
    pub fn loss_weights(&self) -> &[f32] {
        &self.loss_weights
    }

    pub fn needs_backward(&self) -> bool {
        self.needs_backward
    }

    /// Resolve this node's tensor ids against the arena.
    pub(crate) fn bind<'a>(&self, tensors: &'a [Tensor]) -> Bindings<'a> {
        Bindings {
            bottoms: self.bottoms.iter().map(|id| &tensors[id.0]).collect(),
            tops: self.tops.iter().map(|id| &tensors[id.0]).collect(),
            params: self.params.iter().map(|id| &tensors[id.0]).collect(),
        }
    }
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("bottoms", &self.bottoms)
            .field("tops", &self.tops)
            .field("params", &self.params)
            .field("needs_backward", &self.needs_backward)
            .finish()
    }
}

/// A built network.
#[derive(Debug)]
pub struct Graph {
    pub(crate) name: String,
    pub(crate) phase: Phase,
    pub(crate) tensors: Vec<Tensor>,
    pub(crate) tensor_index: HashMap<String, TensorId>,
    pub(crate) tensor_order: Vec<TensorId>,
    pub(crate) nodes: Vec<GraphNode>,
    pub(crate) node_index: HashMap<String, usize>,
    pub(crate) params: ParamRegistry,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
    pub(crate) memory: MemoryContext,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn memory(&self) -> &MemoryContext {
        &self.memory
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // Tensors

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0]
    }

    /// Look up a data tensor by name. Parameters are not named tensors; reach
    /// them through [`params`](Self::params).
    pub fn tensor_by_name(&self, name: &str) -> Option<&Tensor> {
        self.tensor_index.get(name).map(|id| &self.tensors[id.0])
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.tensor_index.contains_key(name)
    }

    /// Data tensor names in creation order.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.tensor_order
            .iter()
            .map(|id| self.tensors[id.0].name())
            .collect()
    }

    pub fn input_tensors(&self) -> Vec<&Tensor> {
        self.inputs.iter().map(|id| &self.tensors[id.0]).collect()
    }

    /// Tensors no node consumes.
    pub fn output_tensors(&self) -> Vec<&Tensor> {
        self.outputs.iter().map(|id| &self.tensors[id.0]).collect()
    }

    pub fn input_ids(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn output_ids(&self) -> &[TensorId] {
        &self.outputs
    }

    // Nodes

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&GraphNode> {
        self.nodes.get(index)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&GraphNode> {
        self.node_index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.node_index.get(name).copied()
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.node_index.contains_key(name)
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn node_needs_backward(&self, node: usize) -> Option<bool> {
        self.nodes.get(node).map(|n| n.needs_backward)
    }

    pub fn bottom_need_backward(&self, node: usize) -> Option<&[bool]> {
        self.nodes.get(node).map(|n| n.bottom_need_backward.as_slice())
    }

    /// Loss weight of top `top` of node `node`.
    pub fn loss_weight(&self, node: usize, top: usize) -> Option<f32> {
        self.nodes.get(node)?.loss_weights.get(top).copied()
    }

    // Parameters

    pub fn params(&self) -> &ParamRegistry {
        &self.params
    }

    /// Owner parameters with their multipliers, in registration order.
    pub fn learnable_params(&self) -> Vec<(&Learnable, &Tensor)> {
        self.params
            .learnables()
            .iter()
            .map(|l| (l, &self.tensors[l.tensor.0]))
            .collect()
    }

    /// Bytes reserved by the value buffers of every tensor.
    pub fn memory_used(&self) -> usize {
        self.tensors.iter().map(|t| t.capacity_bytes()).sum()
    }

    /// Re-run shape inference for every node in order.
    pub fn reshape(&mut self) -> Result<()> {
        let Graph { nodes, tensors, .. } = self;
        for node in nodes.iter_mut() {
            let io = node.bind(tensors);
            node.op.reshape(&io)?;
        }
        Ok(())
    }

    /// Alias the parameter values of `other`'s nodes into same-named nodes
    /// here, slot by slot. Gradients stay independent. Nodes of `other`
    /// without a counterpart are skipped. Returns the number of parameters
    /// now shared.
    pub fn share_parameters_with(&mut self, other: &Graph) -> Result<usize> {
        let mut shared = 0;
        for src in &other.nodes {
            let Some(&target) = self.node_index.get(&src.name) else {
                tracing::info!(node = %src.name, "ignoring source node absent from target graph");
                continue;
            };
            let node = &self.nodes[target];
            if node.params.len() != src.params.len() {
                bail!(
                    "node '{}': {} parameters in source, {} in target",
                    src.name,
                    src.params.len(),
                    node.params.len()
                );
            }
            for (&dst_id, &src_id) in node.params.iter().zip(&src.params) {
                let src_t = &other.tensors[src_id.0];
                let dst_shape = self.tensors[dst_id.0].shape();
                if dst_shape != src_t.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: dst_shape,
                        got: src_t.shape(),
                    });
                }
                self.tensors[dst_id.0].share_values(src_t)?;
                shared += 1;
            }
        }
        self.realias_sharers()?;
        tracing::debug!(graph = %self.name, shared, "shared parameters");
        Ok(shared)
    }

    /// Point every sharer's values back at its owner's buffer.
    fn realias_sharers(&mut self) -> Result<()> {
        for entry in self.params.entries() {
            let ParamRole::Sharer { owner } = entry.role else {
                continue;
            };
            let owner_tensor = self.params.entries()[owner.0].tensor;
            // Owners are registered before their sharers.
            let (lo, hi) = self.tensors.split_at_mut(entry.tensor.0);
            hi[0].share_values(&lo[owner_tensor.0])?;
        }
        Ok(())
    }
}
