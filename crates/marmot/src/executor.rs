// Executor — runs a built Graph
//
// Forward walks nodes in build order over an inclusive range, accumulating
// the weighted loss; backward walks a range in reverse, skipping nodes that
// need no gradient. Parameters are updated through the owner list, either
// with the plain `values -= grads` rule or through an external ParamUpdater.
//
// Running a sub-range is only meaningful when every bottom consumed inside
// the range was produced by an earlier pass; the executor does not check.

use std::collections::HashMap;

use marmot_core::{Error, Result};
use marmot_ops::OperatorRegistry;

use crate::builder::GraphBuilder;
use crate::checkpoint::{Checkpoint, LoadMode, LoadReport};
use crate::config::RuntimeConfig;
use crate::graph::Graph;
use crate::observe::{ExecObserver, TraceObserver};
use crate::params::ParamId;
use crate::spec::GraphSpec;

// Results

/// Result of a full forward pass.
#[derive(Debug, Clone, Default)]
pub struct ForwardResult {
    /// Weighted sum over every loss-carrying top.
    pub loss: f32,
    /// Values of the graph's output tensors, keyed by tensor name.
    pub outputs: HashMap<String, Vec<f32>>,
}

impl ForwardResult {
    /// Get an output by tensor name.
    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.outputs.get(name).map(Vec::as_slice)
    }
}

// External optimizers

/// One owner parameter handed to a [`ParamUpdater`].
#[derive(Debug)]
pub struct LearnableParam<'a> {
    pub param: ParamId,
    /// Position in the learnable list.
    pub index: usize,
    pub name: &'a str,
    pub tensor: &'a marmot_core::Tensor,
    pub lr_mult: f32,
    pub decay_mult: f32,
}

/// Applies an update rule to owner parameters.
///
/// Called once per owner, in registration order, per [`Executor::update_with`].
pub trait ParamUpdater {
    fn update(&mut self, param: LearnableParam<'_>) -> Result<()>;
}

// Executor

pub struct Executor {
    graph: Graph,
    config: RuntimeConfig,
    observers: Vec<Box<dyn ExecObserver>>,
}

impl Executor {
    /// Wrap a built graph. Installs a [`TraceObserver`] when
    /// `config.debug_info` is set.
    pub fn new(graph: Graph, config: RuntimeConfig) -> Self {
        let mut observers: Vec<Box<dyn ExecObserver>> = Vec::new();
        if config.debug_info {
            observers.push(Box::new(TraceObserver));
        }
        Self {
            graph,
            config,
            observers,
        }
    }

    /// Build `spec` with `registry` and wrap the result.
    pub fn from_spec(spec: &GraphSpec, registry: &OperatorRegistry, config: RuntimeConfig) -> Result<Self> {
        let graph = GraphBuilder::new(registry, config.clone()).build(spec)?;
        Ok(Self::new(graph, config))
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn add_observer(&mut self, observer: Box<dyn ExecObserver>) {
        self.observers.push(observer);
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    // Forward

    /// Run nodes `start..=end` and return the weighted loss they produced.
    ///
    /// After each node, every top's gradient is reset to its loss weight
    /// (zero for tops carrying no loss), so a following backward pass starts
    /// from fresh activation gradients.
    pub fn forward_range(&mut self, start: usize, end: usize) -> Result<f32> {
        let len = self.graph.len();
        if start > end || end >= len {
            return Err(Error::InvalidRange { start, end, len });
        }
        let mut loss = 0.0;
        for i in start..=end {
            {
                let Graph { nodes, tensors, .. } = &mut self.graph;
                let node = &mut nodes[i];
                let io = node.bind(tensors);
                node.op.forward(&io)?;
                for (top, &w) in io.tops.iter().zip(&node.loss_weights) {
                    if w != 0.0 {
                        loss += w * top.sum_values()?;
                    }
                    top.fill_grads(w)?;
                }
            }
            for obs in &mut self.observers {
                obs.after_forward(&self.graph, i)?;
            }
        }
        Ok(loss)
    }

    pub fn forward_from(&mut self, start: usize) -> Result<f32> {
        let end = self.graph.len().saturating_sub(1);
        self.forward_range(start, end)
    }

    pub fn forward_to(&mut self, end: usize) -> Result<f32> {
        self.forward_range(0, end)
    }

    /// Run every node on whatever the input tensors already hold.
    pub fn forward_prefilled(&mut self) -> Result<f32> {
        if self.graph.is_empty() {
            return Ok(0.0);
        }
        self.forward_range(0, self.graph.len() - 1)
    }

    /// Copy `inputs` into the graph's input tensors, then run every node.
    pub fn forward(&mut self, inputs: &HashMap<String, Vec<f32>>) -> Result<ForwardResult> {
        for (name, values) in inputs {
            let id = self
                .graph
                .inputs
                .iter()
                .copied()
                .find(|id| self.graph.tensor(*id).name() == name.as_str())
                .ok_or_else(|| Error::config(format!("'{name}' is not an input of this graph")))?;
            self.graph.tensor(id).set_values(values)?;
        }
        let loss = self.forward_prefilled()?;
        let mut outputs = HashMap::with_capacity(self.graph.outputs.len());
        for t in self.graph.output_tensors() {
            outputs.insert(t.name().to_string(), t.values()?);
        }
        Ok(ForwardResult { loss, outputs })
    }

    // Backward

    /// Run nodes `from` down to `to` in reverse. Nodes that need no gradient
    /// are skipped. Gradients accumulate into whatever the buffers hold.
    pub fn backward_range(&mut self, from: usize, to: usize) -> Result<()> {
        let len = self.graph.len();
        if to > from || from >= len {
            return Err(Error::InvalidRange {
                start: to,
                end: from,
                len,
            });
        }
        for i in (to..=from).rev() {
            if !self.graph.nodes[i].needs_backward {
                continue;
            }
            {
                let Graph { nodes, tensors, .. } = &mut self.graph;
                let node = &mut nodes[i];
                let io = node.bind(tensors);
                node.op
                    .backward(&io, &node.bottom_need_backward, &node.param_propagate)?;
            }
            for obs in &mut self.observers {
                obs.after_backward(&self.graph, i)?;
            }
        }
        Ok(())
    }

    pub fn backward(&mut self) -> Result<()> {
        if self.graph.is_empty() {
            return Ok(());
        }
        self.backward_range(self.graph.len() - 1, 0)
    }

    pub fn backward_from(&mut self, from: usize) -> Result<()> {
        self.backward_range(from, 0)
    }

    pub fn backward_to(&mut self, to: usize) -> Result<()> {
        let from = self.graph.len().saturating_sub(1);
        self.backward_range(from, to)
    }

    /// Full forward with `inputs`, then full backward. Returns the loss.
    pub fn forward_backward(&mut self, inputs: &HashMap<String, Vec<f32>>) -> Result<f32> {
        let result = self.forward(inputs)?;
        self.backward()?;
        Ok(result.loss)
    }

    // Parameters

    /// Zero every owner's gradient. Sharers alias their owner's buffer.
    pub fn clear_param_grads(&mut self) -> Result<()> {
        for (_, tensor) in self.graph.learnable_params() {
            tensor.zero_grads()?;
        }
        Ok(())
    }

    pub fn reshape(&mut self) -> Result<()> {
        self.graph.reshape()
    }

    /// `values -= grads` on each owner, in registration order.
    pub fn update(&mut self) -> Result<()> {
        let owners: Vec<ParamId> = self.graph.params.learnables().iter().map(|l| l.param).collect();
        for param in owners {
            let id = self.graph.params.entries()[param.0].tensor;
            self.graph.tensor(id).update()?;
            for obs in &mut self.observers {
                obs.after_update(&self.graph, param)?;
            }
        }
        Ok(())
    }

    /// Hand each owner, with its multipliers, to `updater` once.
    pub fn update_with(&mut self, updater: &mut dyn ParamUpdater) -> Result<()> {
        let count = self.graph.params.learnables().len();
        for index in 0..count {
            let l = &self.graph.params.learnables()[index];
            let param = l.param;
            updater.update(LearnableParam {
                param,
                index,
                name: &self.graph.params.entries()[param.0].display_name,
                tensor: self.graph.tensor(l.tensor),
                lr_mult: l.lr_mult,
                decay_mult: l.decay_mult,
            })?;
            for obs in &mut self.observers {
                obs.after_update(&self.graph, param)?;
            }
        }
        Ok(())
    }

    /// See [`Graph::share_parameters_with`].
    pub fn share_parameters_with(&mut self, other: &Graph) -> Result<usize> {
        self.graph.share_parameters_with(other)
    }

    /// See [`Graph::load_pretrained`].
    pub fn load_pretrained(&mut self, source: &Checkpoint, mode: LoadMode) -> Result<LoadReport> {
        self.graph.load_pretrained(source, mode)
    }

    pub fn to_checkpoint(&self, write_grads: bool) -> Result<Checkpoint> {
        self.graph.to_checkpoint(write_grads)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("graph", &self.graph.name())
            .field("nodes", &self.graph.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
