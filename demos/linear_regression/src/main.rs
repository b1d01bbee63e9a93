// Demo: Linear Regression with a declarative graph
//
// The network is described as JSON, built once, then trained by repeating:
//   1. forward:   y = x W^T + b, loss = sum((y - t)^2) / 2N
//   2. backward:  gradients for W and b from the graph
//   3. update:    W -= lr * dW, b -= lr * db  (through a ParamUpdater)
//
// We're learning y = 2*x + 1 using a single weight and bias.

use std::collections::HashMap;

use marmot::prelude::*;

const GRAPH: &str = r#"{
    "name": "linear_regression",
    "inputs": [
        {"name": "x", "shape": [10, 1]},
        {"name": "target", "shape": [10, 1]}
    ],
    "nodes": [
        {"name": "fc", "type": "InnerProduct", "bottoms": ["x"], "tops": ["y"],
         "config": {"num_output": 1, "weight_filler": {"type": "constant", "value": 0.5}}},
        {"name": "loss", "type": "EuclideanLoss", "bottoms": ["y", "target"], "tops": ["l"]}
    ]
}"#;

/// Plain gradient descent scaled by each parameter's lr_mult.
struct Sgd {
    lr: f32,
}

impl ParamUpdater for Sgd {
    fn update(&mut self, param: LearnableParam<'_>) -> Result<()> {
        let grads = param.tensor.grads()?;
        let rate = self.lr * param.lr_mult;
        param.tensor.with_values_mut(|values| {
            for (v, g) in values.iter_mut().zip(&grads) {
                *v -= rate * g;
            }
        })
    }
}

fn main() -> marmot::Result<()> {
    println!(" Marmot Linear Regression \n");

    let spec = GraphSpec::from_json_str(GRAPH)?;
    let registry = OperatorRegistry::with_builtins();
    let mut exec = Executor::from_spec(&spec, &registry, RuntimeConfig::default())?;

    // y = 2*x + 1  (true function we want to learn)
    let x: Vec<f32> = (0..10).map(|i| i as f32).collect();
    let target: Vec<f32> = x.iter().map(|&v| 2.0 * v + 1.0).collect();
    let inputs = HashMap::from([("x".to_string(), x), ("target".to_string(), target)]);

    println!("Nodes: {:?}", exec.graph().node_names());
    println!("Learnable parameters: {}\n", exec.graph().learnable_params().len());

    let mut sgd = Sgd { lr: 0.02 };
    for epoch in 0..2000 {
        exec.clear_param_grads()?;
        let loss = exec.forward_backward(&inputs)?;
        exec.update_with(&mut sgd)?;
        if epoch % 200 == 0 {
            println!("Epoch {epoch:4}: loss = {loss:.6}");
        }
    }

    let params: Vec<Vec<f32>> = exec
        .graph()
        .learnable_params()
        .iter()
        .map(|(_, t)| t.values())
        .collect::<Result<_>>()?;
    println!(
        "\nFinal: w = {:.4} (expected 2.0), b = {:.4} (expected 1.0)",
        params[0][0], params[1][0]
    );

    let ckpt = exec.to_checkpoint(false)?;
    println!("Checkpoint holds {} nodes", ckpt.nodes.len());
    Ok(())
}
