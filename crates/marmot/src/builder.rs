// GraphBuilder — GraphSpec → Graph
//
// BUILD STEPS:
//
//   1. Filter nodes by the configured NetState.
//   2. Create the graph inputs.
//   3. For each node in declared order:
//        - resolve bottoms by name (only names created earlier exist, which
//          keeps the graph acyclic and topologically ordered)
//        - create tops, or alias the bottom at the same position when the
//          node is declared in place
//        - create parameter tensors from the operator's declared shapes and
//          register them as owners or sharers
//        - set up and reshape the operator
//   4. Decide which nodes and bottoms need gradients.
//
// BACKWARD NEED:
//
//   Forward seeding: a bottom needs a gradient if its tensor does (or as
//   its explicit propagate_down entry says); a node needs backward if any
//   bottom or learnable parameter does; its tops then need gradients too.
//
//   Loss pass, last node first: a node whose tops carry no loss weight and
//   feed no loss-contributing node is switched off; so is a node whose tops
//   are all consumed without any consumer wanting their gradient.
//
//   force_backward: every node runs backward, and every bottom without an
//   explicit propagate_down entry gets a gradient if the operator allows it.
//
//   Closure: if a consumer wants a gradient for a tensor, the node that
//   produced it runs backward.

use std::collections::{BTreeSet, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::SeedableRng;

use marmot_core::{config_bail, Error, Result, Shape, Tensor, TensorId};
use marmot_ops::{Bindings, OperatorRegistry};

use crate::config::RuntimeConfig;
use crate::filter::filter_nodes;
use crate::graph::{Graph, GraphNode};
use crate::params::{ParamId, ParamRegistry, Registration};
use crate::spec::GraphSpec;

/// Builds graphs from descriptions using a registry of operator types.
#[derive(Debug, Clone)]
pub struct GraphBuilder<'r> {
    registry: &'r OperatorRegistry,
    config: RuntimeConfig,
}

impl<'r> GraphBuilder<'r> {
    pub fn new(registry: &'r OperatorRegistry, config: RuntimeConfig) -> Self {
        GraphBuilder { registry, config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn build(&self, spec: &GraphSpec) -> Result<Graph> {
        let node_specs = filter_nodes(&spec.nodes, &self.config.state)?;
        let ctx = self.config.memory.clone();
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let mut tensors: Vec<Tensor> = Vec::new();
        let mut tensor_index: HashMap<String, TensorId> = HashMap::new();
        let mut tensor_order: Vec<TensorId> = Vec::new();
        // per tensor: does some gradient need to flow into it
        let mut need: Vec<bool> = Vec::new();
        // tensors not yet consumed; what remains are the graph outputs
        let mut available: BTreeSet<TensorId> = BTreeSet::new();
        // latest node that wrote each tensor
        let mut producer: HashMap<TensorId, usize> = HashMap::new();

        let mut inputs = Vec::with_capacity(spec.inputs.len());
        for input in &spec.inputs {
            if tensor_index.contains_key(&input.name) {
                config_bail!("duplicate graph input '{}'", input.name);
            }
            input.shape.checked_byte_size()?;
            let id = TensorId(tensors.len());
            tensors.push(Tensor::new(id, &input.name, input.shape.clone(), ctx.clone()));
            tensor_index.insert(input.name.clone(), id);
            tensor_order.push(id);
            need.push(spec.force_backward);
            available.insert(id);
            inputs.push(id);
            tracing::debug!(input = %input.name, shape = %input.shape, "graph input");
        }

        let mut nodes: Vec<GraphNode> = Vec::with_capacity(node_specs.len());
        let mut node_index: HashMap<String, usize> = HashMap::new();
        let mut params = ParamRegistry::new();
        let mut bottom_producers: Vec<Vec<Option<usize>>> = Vec::with_capacity(node_specs.len());
        let mut explicit_propagate: Vec<bool> = Vec::with_capacity(node_specs.len());

        for (idx, ns) in node_specs.iter().enumerate() {
            if node_index.contains_key(&ns.name) {
                config_bail!("duplicate node name '{}'", ns.name);
            }
            let mut op = self.registry.create(&ns.kind, &ns.config)?;

            if let Some(n) = op.exact_num_bottoms() {
                if ns.bottoms.len() != n {
                    config_bail!(
                        "node '{}' ({}) takes {n} bottoms, got {}",
                        ns.name,
                        ns.kind,
                        ns.bottoms.len()
                    );
                }
            }
            if let Some(n) = op.exact_num_tops() {
                if ns.tops.len() != n {
                    config_bail!(
                        "node '{}' ({}) produces {n} tops, got {}",
                        ns.name,
                        ns.kind,
                        ns.tops.len()
                    );
                }
            }
            if !ns.propagate_down.is_empty() && ns.propagate_down.len() != ns.bottoms.len() {
                config_bail!(
                    "node '{}': propagate_down has {} entries for {} bottoms",
                    ns.name,
                    ns.propagate_down.len(),
                    ns.bottoms.len()
                );
            }
            if ns.loss_weights.len() > ns.tops.len() {
                config_bail!(
                    "node '{}': {} loss weights for {} tops",
                    ns.name,
                    ns.loss_weights.len(),
                    ns.tops.len()
                );
            }

            // Bottoms
            let mut bottoms = Vec::with_capacity(ns.bottoms.len());
            let mut bottom_flags = Vec::with_capacity(ns.bottoms.len());
            let mut producers = Vec::with_capacity(ns.bottoms.len());
            for (i, name) in ns.bottoms.iter().enumerate() {
                let id = *tensor_index.get(name).ok_or_else(|| {
                    Error::config(format!("unknown bottom '{name}' for node '{}'", ns.name))
                })?;
                available.remove(&id);
                bottoms.push(id);
                bottom_flags.push(ns.propagate_down.get(i).copied().unwrap_or(need[id.0]));
                producers.push(producer.get(&id).copied());
            }

            // Tops
            let mut tops = Vec::with_capacity(ns.tops.len());
            for (i, name) in ns.tops.iter().enumerate() {
                let id = if ns.bottoms.get(i) == Some(name) {
                    if !op.allows_in_place() {
                        config_bail!(
                            "node '{}' ({}) cannot run in place on '{name}'",
                            ns.name,
                            ns.kind
                        );
                    }
                    bottoms[i]
                } else if tensor_index.contains_key(name) {
                    config_bail!(
                        "tensor '{name}' of node '{}' is already produced elsewhere; \
                         only an in-place top (same name and position as a bottom) may reuse a name",
                        ns.name
                    );
                } else {
                    let id = TensorId(tensors.len());
                    tensors.push(Tensor::new(id, name, Shape::scalar(), ctx.clone()));
                    tensor_index.insert(name.clone(), id);
                    tensor_order.push(id);
                    need.push(false);
                    id
                };
                available.insert(id);
                producer.insert(id, idx);
                tops.push(id);
            }

            // Parameters
            let bottom_shapes: Vec<Shape> = bottoms.iter().map(|id| tensors[id.0].shape()).collect();
            let shapes = op.param_shapes(&bottom_shapes)?;
            if ns.params.len() > shapes.len() {
                config_bail!(
                    "node '{}' declares {} parameters but {} has {}",
                    ns.name,
                    ns.params.len(),
                    ns.kind,
                    shapes.len()
                );
            }
            for shape in &shapes {
                shape.checked_byte_size()?;
            }
            // Fill every slot with fresh values so the RNG stream does not
            // depend on which slots end up shared.
            let fresh: Vec<Tensor> = shapes
                .iter()
                .enumerate()
                .map(|(j, s)| Tensor::new(TensorId(j), "init", s.clone(), ctx.clone()))
                .collect();
            if !fresh.is_empty() {
                let refs: Vec<&Tensor> = fresh.iter().collect();
                op.init_params(&refs, &mut rng)?;
            }

            let mut param_tensors = Vec::with_capacity(shapes.len());
            let mut param_ids = Vec::with_capacity(shapes.len());
            let mut param_propagate = Vec::with_capacity(shapes.len());
            for (slot, shape) in shapes.into_iter().enumerate() {
                let pspec = ns.params.get(slot).cloned().unwrap_or_default();
                let id = TensorId(tensors.len());
                let pid = ParamId(params.len());
                let mut tensor = Tensor::new(id, format!("{}/{slot}", ns.name), shape.clone(), ctx.clone());
                match params.register(idx, &ns.name, slot, id, shape, &pspec)? {
                    Registration::Owner => tensor.set_values(&fresh[slot].values()?)?,
                    Registration::Sharer { owner_tensor } => {
                        let owner = &tensors[owner_tensor.0];
                        tensor.share_values(owner)?;
                        tensor.share_grads(owner)?;
                        tracing::debug!(
                            node = %ns.name,
                            slot,
                            owner = %owner.name(),
                            "sharing parameter"
                        );
                    }
                }
                tensors.push(tensor);
                need.push(false);
                let lr_mult = params.learnable_of(pid).map(|l| l.lr_mult).unwrap_or(1.0);
                param_tensors.push(id);
                param_ids.push(pid);
                param_propagate.push(lr_mult != 0.0);
            }

            {
                let io = Bindings {
                    bottoms: bottoms.iter().map(|id| &tensors[id.0]).collect(),
                    tops: tops.iter().map(|id| &tensors[id.0]).collect(),
                    params: param_tensors.iter().map(|id| &tensors[id.0]).collect(),
                };
                op.set_up(&io)?;
                op.reshape(&io)?;
            }

            let needs_backward =
                bottom_flags.iter().any(|&f| f) || param_propagate.iter().any(|&p| p);
            if needs_backward {
                for top in &tops {
                    need[top.0] = true;
                }
            }

            let loss_weights: Vec<f32> = (0..tops.len())
                .map(|i| match ns.loss_weights.get(i) {
                    Some(&w) => w,
                    None if ns.loss_weights.is_empty() && op.is_loss() && i == 0 => 1.0,
                    None => 0.0,
                })
                .collect();

            tracing::debug!(
                node = %ns.name,
                kind = %ns.kind,
                tops = ?tops.iter().map(|id| tensors[id.0].shape().to_string()).collect::<Vec<_>>(),
                params = param_tensors.len(),
                "set up node"
            );

            node_index.insert(ns.name.clone(), idx);
            nodes.push(GraphNode {
                name: ns.name.clone(),
                op,
                bottoms,
                tops,
                params: param_tensors,
                param_ids,
                bottom_need_backward: bottom_flags,
                param_propagate,
                loss_weights,
                needs_backward,
            });
            bottom_producers.push(producers);
            explicit_propagate.push(!ns.propagate_down.is_empty());
        }

        prune_to_loss(&mut nodes);
        if spec.force_backward {
            for (node, explicit) in nodes.iter_mut().zip(&explicit_propagate) {
                node.needs_backward = true;
                if *explicit {
                    continue;
                }
                for i in 0..node.bottom_need_backward.len() {
                    if node.op.allow_force_backward(i) {
                        node.bottom_need_backward[i] = true;
                    }
                }
            }
        }
        close_over_producers(&mut nodes, &bottom_producers);

        for node in &nodes {
            if node.needs_backward {
                tracing::debug!(node = %node.name, "needs backward computation");
            } else {
                tracing::debug!(node = %node.name, "does not need backward computation");
            }
        }

        let outputs: Vec<TensorId> = available.into_iter().collect();
        let graph = Graph {
            name: spec.name.clone(),
            phase: self.config.state.phase,
            tensors,
            tensor_index,
            tensor_order,
            nodes,
            node_index,
            params,
            inputs,
            outputs,
            memory: ctx,
        };
        tracing::info!(
            graph = %graph.name,
            phase = ?graph.phase,
            nodes = graph.len(),
            params = graph.params.len(),
            learnable = graph.params.learnables().len(),
            outputs = ?graph.output_tensors().iter().map(|t| t.name()).collect::<Vec<_>>(),
            memory_bytes = graph.memory_used(),
            "built graph"
        );
        Ok(graph)
    }
}

/// Switch off backward for nodes that cannot affect the loss, and for nodes
/// whose outputs are all consumed by nodes that want no gradient for them.
fn prune_to_loss(nodes: &mut [GraphNode]) {
    let mut under_loss: HashSet<TensorId> = HashSet::new();
    let mut consumed: HashSet<TensorId> = HashSet::new();
    let mut wanted: HashSet<TensorId> = HashSet::new();

    for node in nodes.iter_mut().rev() {
        let contributes = node
            .tops
            .iter()
            .zip(&node.loss_weights)
            .any(|(top, &w)| w != 0.0 || under_loss.contains(top));
        let skip_propagate = node
            .tops
            .iter()
            .all(|top| consumed.contains(top) && !wanted.contains(top));

        if node.needs_backward && skip_propagate {
            node.needs_backward = false;
            node.bottom_need_backward.fill(false);
        }
        if !contributes {
            node.needs_backward = false;
        }
        for (i, bottom) in node.bottoms.iter().enumerate() {
            if contributes {
                under_loss.insert(*bottom);
            } else {
                node.bottom_need_backward[i] = false;
            }
            consumed.insert(*bottom);
            if node.bottom_need_backward[i] {
                wanted.insert(*bottom);
            }
        }
    }
}

/// A node whose output some consumer wants a gradient for must run backward.
fn close_over_producers(nodes: &mut [GraphNode], bottom_producers: &[Vec<Option<usize>>]) {
    for j in (0..nodes.len()).rev() {
        let wanted: Vec<usize> = nodes[j]
            .bottom_need_backward
            .iter()
            .zip(&bottom_producers[j])
            .filter_map(|(&flag, &p)| if flag { p } else { None })
            .collect();
        for p in wanted {
            nodes[p].needs_backward = true;
        }
    }
}
