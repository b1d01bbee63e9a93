// Graph description — the declarative input to the graph builder
//
// A GraphSpec is an ordered list of nodes. Each node names its operator type,
// the tensors it reads (bottoms) and writes (tops), its parameters, and the
// execution states it takes part in. Tensors are wired purely by name: a
// bottom must name an input or a top of an earlier node.
//
// The types derive serde, so a graph can be written as JSON:
//
//   {
//     "name": "tiny",
//     "inputs": [{"name": "x", "shape": [1]}],
//     "force_backward": true,
//     "nodes": [
//       {"name": "n0", "type": "Identity", "bottoms": ["x"], "tops": ["a"]},
//       {"name": "n1", "type": "Scale", "bottoms": ["a"], "tops": ["b"],
//        "config": {"factor": 2.0}},
//       {"name": "n2", "type": "Reduction", "bottoms": ["b"], "tops": ["loss"],
//        "loss_weights": [1.0]}
//     ]
//   }
//
// or assembled in code with the builder helpers on GraphSpec and NodeSpec.

use serde::{Deserialize, Serialize};

use marmot_core::{Error, Result, Shape};
use marmot_ops::{ConfigValue, OpConfig};

/// Execution phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Train,
    Test,
}

/// The state a graph is built for. Nodes are kept or dropped by matching
/// their rules against it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetState {
    pub phase: Phase,
    pub level: i32,
    pub stages: Vec<String>,
}

/// One include or exclude rule. Every field that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateRule {
    pub phase: Option<Phase>,
    pub min_level: Option<i32>,
    pub max_level: Option<i32>,
    /// All of these stages must be active.
    pub stages: Vec<String>,
    /// None of these stages may be active.
    pub not_stages: Vec<String>,
}

impl StateRule {
    pub fn phase(phase: Phase) -> Self {
        StateRule {
            phase: Some(phase),
            ..Default::default()
        }
    }

    pub fn stage(stage: impl Into<String>) -> Self {
        StateRule {
            stages: vec![stage.into()],
            ..Default::default()
        }
    }

    pub fn with_min_level(mut self, level: i32) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn with_max_level(mut self, level: i32) -> Self {
        self.max_level = Some(level);
        self
    }

    pub fn with_not_stage(mut self, stage: impl Into<String>) -> Self {
        self.not_stages.push(stage.into());
        self
    }
}

/// How a sharer's shape is checked against its owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareMode {
    /// All dimensions must be equal.
    #[default]
    Strict,
    /// Only the element counts must be equal.
    Permissive,
}

/// Declaration of one node parameter.
///
/// A named parameter whose name was already registered by an earlier node is
/// shared with it. Multipliers left unset default to 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamSpec {
    pub name: Option<String>,
    pub lr_mult: Option<f32>,
    pub decay_mult: Option<f32>,
    pub share_mode: ShareMode,
}

impl ParamSpec {
    pub fn named(name: impl Into<String>) -> Self {
        ParamSpec {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_lr_mult(mut self, lr_mult: f32) -> Self {
        self.lr_mult = Some(lr_mult);
        self
    }

    pub fn with_decay_mult(mut self, decay_mult: f32) -> Self {
        self.decay_mult = Some(decay_mult);
        self
    }

    pub fn with_share_mode(mut self, mode: ShareMode) -> Self {
        self.share_mode = mode;
        self
    }
}

/// A graph input: a tensor the caller fills before running forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub shape: Shape,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    pub name: String,
    /// Operator type tag, looked up in the registry.
    #[serde(rename = "type")]
    pub kind: String,
    pub bottoms: Vec<String>,
    pub tops: Vec<String>,
    /// Per-top loss weights. Missing entries default to 0, or 1 for the
    /// first top of a loss operator when the list is empty.
    pub loss_weights: Vec<f32>,
    pub params: Vec<ParamSpec>,
    /// Per-bottom override of gradient propagation. Empty means "decide
    /// automatically"; otherwise it must have one entry per bottom.
    pub propagate_down: Vec<bool>,
    pub include: Vec<StateRule>,
    pub exclude: Vec<StateRule>,
    pub config: OpConfig,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        NodeSpec {
            name: name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn bottom(mut self, name: impl Into<String>) -> Self {
        self.bottoms.push(name.into());
        self
    }

    pub fn top(mut self, name: impl Into<String>) -> Self {
        self.tops.push(name.into());
        self
    }

    pub fn loss_weight(mut self, weight: f32) -> Self {
        self.loss_weights.push(weight);
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn propagate_down(mut self, flags: Vec<bool>) -> Self {
        self.propagate_down = flags;
        self
    }

    pub fn include(mut self, rule: StateRule) -> Self {
        self.include.push(rule);
        self
    }

    pub fn exclude(mut self, rule: StateRule) -> Self {
        self.exclude.push(rule);
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.config.insert(key, value);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSpec {
    pub name: String,
    pub inputs: Vec<InputSpec>,
    /// Compute gradients for every node and bottom, not only those under a
    /// loss.
    pub force_backward: bool,
    pub nodes: Vec<NodeSpec>,
}

impl GraphSpec {
    pub fn new(name: impl Into<String>) -> Self {
        GraphSpec {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn input(mut self, name: impl Into<String>, shape: impl Into<Shape>) -> Self {
        self.inputs.push(InputSpec {
            name: name.into(),
            shape: shape.into(),
        });
        self
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn force_backward(mut self, force: bool) -> Self {
        self.force_backward = force;
        self
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::config(format!("invalid graph description: {e}")))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::msg(format!("cannot serialize graph: {e}")))
    }
}
