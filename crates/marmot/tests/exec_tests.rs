// Executor tests — forward/backward over full and partial ranges, observers,
// updates, and the same graph on an accelerated memory context

use std::collections::HashMap;

use marmot::prelude::*;
use marmot::{ExecEvent, MemoryContext};

// Helpers

fn registry() -> OperatorRegistry {
    OperatorRegistry::with_builtins()
}

/// X → n0 (identity) → A → n1 (×2) → B → n2 (sum, weight 1) → loss
fn three_node_spec(x_propagate: Option<bool>) -> GraphSpec {
    let mut n0 = NodeSpec::new("n0", "Identity").bottom("X").top("A");
    if let Some(flag) = x_propagate {
        n0 = n0.propagate_down(vec![flag]);
    }
    GraphSpec::new("three")
        .input("X", 1)
        .force_backward(true)
        .node(n0)
        .node(NodeSpec::new("n1", "Scale").bottom("A").top("B").set("factor", 2.0))
        .node(
            NodeSpec::new("n2", "Reduction")
                .bottom("B")
                .top("loss")
                .loss_weight(1.0),
        )
}

fn executor(spec: &GraphSpec, config: RuntimeConfig) -> Executor {
    Executor::from_spec(spec, &registry(), config).expect("failed to build graph")
}

fn values(exec: &Executor, name: &str) -> Vec<f32> {
    exec.graph().tensor_by_name(name).unwrap().values().unwrap()
}

fn grads(exec: &Executor, name: &str) -> Vec<f32> {
    exec.graph().tensor_by_name(name).unwrap().grads().unwrap()
}

fn approx_eq(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len(), "length mismatch: {a:?} vs {b:?}");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < 1e-5, "index {i}: {x} != {y}");
    }
}

// Three-node scenario

#[test]
fn test_three_node_forward() {
    let mut exec = executor(&three_node_spec(None), RuntimeConfig::default());
    exec.graph().tensor_by_name("X").unwrap().set_values(&[3.0]).unwrap();

    let x_id = exec.graph().tensor_by_name("X").unwrap().id();
    assert_eq!(exec.graph().input_ids(), [x_id]);

    let loss = exec.forward_range(0, 2).unwrap();
    assert_eq!(loss, 6.0);
    assert_eq!(values(&exec, "A"), vec![3.0]);
    assert_eq!(values(&exec, "B"), vec![6.0]);
    assert_eq!(values(&exec, "loss"), vec![6.0]);
}

#[test]
fn test_three_node_backward_with_input_gradient() {
    let mut exec = executor(&three_node_spec(None), RuntimeConfig::default());
    assert_eq!(exec.graph().bottom_need_backward(0), Some(&[true][..]));
    exec.graph().tensor_by_name("X").unwrap().set_values(&[3.0]).unwrap();

    exec.forward_range(0, 2).unwrap();
    exec.clear_param_grads().unwrap();
    exec.backward_range(2, 0).unwrap();

    assert_eq!(grads(&exec, "A"), vec![2.0]);
    assert_eq!(grads(&exec, "X"), vec![2.0]);
}

#[test]
fn test_three_node_backward_masked_input_after_clear() {
    let mut exec = executor(&three_node_spec(Some(false)), RuntimeConfig::default());
    assert_eq!(exec.graph().bottom_need_backward(0), Some(&[false][..]));
    exec.graph().tensor_by_name("X").unwrap().set_values(&[3.0]).unwrap();

    exec.forward_range(0, 2).unwrap();
    exec.clear_param_grads().unwrap();
    exec.backward_range(2, 0).unwrap();

    assert_eq!(grads(&exec, "A"), vec![2.0]);
    assert_eq!(grads(&exec, "X"), vec![0.0]);
}

#[test]
fn test_three_node_backward_masked_input_never_cleared() {
    let mut exec = executor(&three_node_spec(Some(false)), RuntimeConfig::default());
    let x = exec.graph().tensor_by_name("X").unwrap();
    x.set_values(&[3.0]).unwrap();
    x.set_grads(&[7.5]).unwrap();

    exec.forward_range(0, 2).unwrap();
    exec.backward_range(2, 0).unwrap();

    assert_eq!(grads(&exec, "A"), vec![2.0]);
    assert_eq!(grads(&exec, "X"), vec![7.5]);
}

#[test]
fn test_repeated_passes_do_not_accumulate_activation_gradients() {
    let mut exec = executor(&three_node_spec(Some(false)), RuntimeConfig::default());
    exec.graph().tensor_by_name("X").unwrap().set_values(&[3.0]).unwrap();
    for _ in 0..3 {
        exec.forward_prefilled().unwrap();
        exec.backward().unwrap();
    }
    assert_eq!(grads(&exec, "A"), vec![2.0]);
    assert_eq!(grads(&exec, "loss"), vec![1.0]);
}

// Ranges and inputs

#[test]
fn test_split_forward_matches_full_forward() {
    let mut exec = executor(&three_node_spec(None), RuntimeConfig::default());
    exec.graph().tensor_by_name("X").unwrap().set_values(&[1.5]).unwrap();
    let head = exec.forward_to(1).unwrap();
    let tail = exec.forward_from(2).unwrap();
    assert_eq!(head, 0.0);
    assert_eq!(tail, 3.0);
    assert_eq!(exec.forward_prefilled().unwrap(), head + tail);
}

#[test]
fn test_split_backward_matches_full_backward() {
    let mut exec = executor(&three_node_spec(None), RuntimeConfig::default());
    exec.graph().tensor_by_name("X").unwrap().set_values(&[3.0]).unwrap();
    exec.forward_prefilled().unwrap();
    exec.backward_to(1).unwrap();
    assert_eq!(grads(&exec, "A"), vec![2.0]);
    assert_eq!(grads(&exec, "X"), vec![0.0]);
    exec.backward_from(0).unwrap();
    assert_eq!(grads(&exec, "X"), vec![2.0]);
}

#[test]
fn test_invalid_range() {
    let mut exec = executor(&three_node_spec(None), RuntimeConfig::default());
    assert!(matches!(
        exec.forward_range(2, 1),
        Err(Error::InvalidRange { start: 2, end: 1, len: 3 })
    ));
    assert!(matches!(exec.forward_range(0, 3), Err(Error::InvalidRange { .. })));
    assert!(matches!(exec.backward_range(3, 0), Err(Error::InvalidRange { .. })));
}

#[test]
fn test_forward_with_inputs() {
    let mut exec = executor(&three_node_spec(None), RuntimeConfig::default());
    let inputs = HashMap::from([("X".to_string(), vec![-2.0])]);
    let result = exec.forward(&inputs).unwrap();
    assert_eq!(result.loss, -4.0);
    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.get("loss").unwrap(), &[-4.0]);
}

#[test]
fn test_forward_backward_returns_loss() {
    let mut exec = executor(&three_node_spec(None), RuntimeConfig::default());
    let inputs = HashMap::from([("X".to_string(), vec![0.5])]);
    assert_eq!(exec.forward_backward(&inputs).unwrap(), 1.0);
    assert_eq!(grads(&exec, "X"), vec![2.0]);
}

#[test]
fn test_empty_graph_runs() {
    let mut exec = executor(&GraphSpec::new("empty").input("x", 2), RuntimeConfig::default());
    assert_eq!(exec.forward_prefilled().unwrap(), 0.0);
    exec.backward().unwrap();
    let result = exec.forward(&HashMap::new()).unwrap();
    assert_eq!(result.get("x").unwrap(), &[0.0, 0.0]);
}

// Observers

#[test]
fn test_observer_sees_every_node() {
    let mut exec = executor(&three_node_spec(None), RuntimeConfig::default());
    let log = EventLog::new();
    exec.add_observer(Box::new(log.clone()));

    exec.forward_prefilled().unwrap();
    exec.backward().unwrap();

    let names = |f: fn(&ExecEvent) -> Option<&str>| -> Vec<String> {
        log.events().iter().filter_map(f).map(str::to_string).collect()
    };
    let forward = names(|e| match e {
        ExecEvent::Forward { node } => Some(node.as_str()),
        _ => None,
    });
    let backward = names(|e| match e {
        ExecEvent::Backward { node } => Some(node.as_str()),
        _ => None,
    });
    assert_eq!(forward, ["n0", "n1", "n2"]);
    assert_eq!(backward, ["n2", "n1", "n0"]);
}

#[test]
fn test_backward_skips_nodes_without_gradient() {
    // Nothing feeds a loss, so no node runs backward.
    let spec = GraphSpec::new("no_loss")
        .input("x", 2)
        .node(NodeSpec::new("s", "Scale").bottom("x").top("y"));
    let mut exec = executor(&spec, RuntimeConfig::default());
    let log = EventLog::new();
    exec.add_observer(Box::new(log.clone()));
    exec.forward_prefilled().unwrap();
    exec.backward().unwrap();
    assert_eq!(log.events(), vec![ExecEvent::Forward { node: "s".into() }]);
}

#[test]
fn test_debug_info_installs_trace_observer() {
    let config = RuntimeConfig::default().with_debug_info(true);
    let mut exec = executor(&three_node_spec(None), config);
    exec.forward_prefilled().unwrap();
    exec.backward().unwrap();
    exec.update().unwrap();
    assert!(format!("{exec:?}").contains("observers: 1"));
}

// Training

fn regression_spec() -> GraphSpec {
    GraphSpec::new("regression")
        .input("x", (1, 1))
        .input("t", (1, 1))
        .node(
            NodeSpec::new("fc", "InnerProduct")
                .bottom("x")
                .top("y")
                .set("num_output", 1usize)
                .set("bias_term", false)
                .set(
                    "weight_filler",
                    OpConfig::new().with("type", "constant").with("value", 0.0),
                ),
        )
        .node(NodeSpec::new("loss", "EuclideanLoss").bottom("y").bottom("t").top("l"))
}

#[test]
fn test_sgd_step_reduces_loss() {
    let mut exec = executor(&regression_spec(), RuntimeConfig::default());
    let inputs = HashMap::from([
        ("x".to_string(), vec![1.0]),
        ("t".to_string(), vec![2.0]),
    ]);

    exec.clear_param_grads().unwrap();
    let before = exec.forward_backward(&inputs).unwrap();
    assert_eq!(before, 2.0);
    let (_, w) = exec.graph().learnable_params()[0];
    assert_eq!(w.grads().unwrap(), vec![-2.0]);

    exec.update().unwrap();
    let (_, w) = exec.graph().learnable_params()[0];
    assert_eq!(w.values().unwrap(), vec![2.0]);
    let after = exec.forward(&inputs).unwrap().loss;
    assert_eq!(after, 0.0);
}

struct Sgd {
    lr: f32,
    seen: Vec<String>,
}

impl ParamUpdater for Sgd {
    fn update(&mut self, param: LearnableParam<'_>) -> Result<()> {
        self.seen.push(param.name.to_string());
        let grads = param.tensor.grads()?;
        let rate = self.lr * param.lr_mult;
        param.tensor.with_values_mut(|v| {
            for (x, g) in v.iter_mut().zip(&grads) {
                *x -= rate * g;
            }
        })
    }
}

#[test]
fn test_update_with_external_rule() {
    let mut exec = executor(&regression_spec(), RuntimeConfig::default());
    let log = EventLog::new();
    exec.add_observer(Box::new(log.clone()));
    let inputs = HashMap::from([
        ("x".to_string(), vec![1.0]),
        ("t".to_string(), vec![2.0]),
    ]);
    let mut sgd = Sgd { lr: 0.25, seen: Vec::new() };

    let mut last = f32::INFINITY;
    for _ in 0..15 {
        exec.clear_param_grads().unwrap();
        let loss = exec.forward_backward(&inputs).unwrap();
        assert!(loss <= last);
        last = loss;
        exec.update_with(&mut sgd).unwrap();
    }
    assert!(last < 0.01);
    assert_eq!(sgd.seen.len(), 15);
    assert!(sgd.seen.iter().all(|n| n == "fc.0"));
    assert!(log
        .events()
        .contains(&ExecEvent::Update { param: "fc.0".into() }));
}

#[test]
fn test_frozen_parameter_is_not_trained() {
    let spec = GraphSpec::new("frozen")
        .input("x", (1, 1))
        .input("t", (1, 1))
        .node(
            NodeSpec::new("fc", "InnerProduct")
                .bottom("x")
                .top("y")
                .param(ParamSpec::default().with_lr_mult(0.0))
                .set("num_output", 1usize)
                .set("bias_term", false),
        )
        .node(NodeSpec::new("loss", "EuclideanLoss").bottom("y").bottom("t").top("l"));
    let mut exec = executor(&spec, RuntimeConfig::default());
    assert_eq!(exec.graph().node_needs_backward(0), Some(false));
    assert_eq!(exec.graph().nodes()[0].param_propagate(), &[false]);

    let inputs = HashMap::from([
        ("x".to_string(), vec![1.0]),
        ("t".to_string(), vec![2.0]),
    ]);
    exec.forward_backward(&inputs).unwrap();
    let (_, w) = exec.graph().learnable_params()[0];
    assert_eq!(w.grads().unwrap(), vec![0.0]);
}

// Memory contexts

#[test]
fn test_accelerated_context_matches_host() {
    let (memory, device) = MemoryContext::simulated();
    let config = RuntimeConfig::default().with_memory(memory);
    let mut exec = executor(&three_node_spec(None), config);
    assert!(exec.graph().memory().is_accelerated());

    let inputs = HashMap::from([("X".to_string(), vec![3.0])]);
    let loss = exec.forward_backward(&inputs).unwrap();
    exec.clear_param_grads().unwrap();

    assert_eq!(loss, 6.0);
    assert_eq!(grads(&exec, "A"), vec![2.0]);
    assert_eq!(grads(&exec, "X"), vec![2.0]);
    assert!(device.live_allocations() <= exec.graph().tensor_names().len() * 2);
}

#[test]
fn test_regression_on_accelerated_context() {
    let (memory, device) = MemoryContext::simulated();
    let mut exec = executor(&regression_spec(), RuntimeConfig::default().with_memory(memory));
    let inputs = HashMap::from([
        ("x".to_string(), vec![1.0]),
        ("t".to_string(), vec![2.0]),
    ]);
    exec.clear_param_grads().unwrap();
    exec.forward_backward(&inputs).unwrap();
    exec.update().unwrap();
    approx_eq(&exec.graph().learnable_params()[0].1.values().unwrap(), &[2.0]);
    // the cleared gradient lived on the device until backward read it
    assert!(device.stats().device_to_host >= 1);
}

#[test]
fn test_reshape_propagates_new_input_shape() {
    let spec = GraphSpec::new("reshape")
        .input("x", 2)
        .node(NodeSpec::new("s", "Scale").bottom("x").top("y").set("factor", 3.0));
    let mut exec = executor(&spec, RuntimeConfig::default());
    let x = exec.graph().tensor_by_name("x").unwrap();
    x.reshape(4).unwrap();
    x.set_values(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    exec.reshape().unwrap();
    exec.forward_prefilled().unwrap();
    assert_eq!(values(&exec, "y"), vec![3.0, 6.0, 9.0, 12.0]);
}
