// Checkpoint tests — snapshots, binary files, and loading pretrained
// parameters leniently or strictly

use marmot::checkpoint::{self, NodeCheckpoint, TensorRecord};
use marmot::prelude::*;

fn registry() -> OperatorRegistry {
    OperatorRegistry::with_builtins()
}

fn net(outputs: usize, seed: u64) -> Executor {
    let spec = GraphSpec::new("net")
        .input("x", (1, 1))
        .node(
            NodeSpec::new("fc", "InnerProduct")
                .bottom("x")
                .top("y")
                .set("num_output", outputs)
                .set("bias_filler", OpConfig::new().with("type", "uniform")),
        )
        .node(NodeSpec::new("loss", "Reduction").bottom("y").top("l").loss_weight(1.0));
    Executor::from_spec(&spec, &registry(), RuntimeConfig::default().with_seed(seed)).unwrap()
}

fn param_values(exec: &Executor, slot: usize) -> Vec<f32> {
    let fc = exec.graph().node_by_name("fc").unwrap();
    exec.graph().tensor(fc.params()[slot]).values().unwrap()
}

#[test]
fn test_snapshot_lists_every_node() {
    let exec = net(3, 1);
    let ckpt = exec.to_checkpoint(false).unwrap();
    assert_eq!(ckpt.name, "net");
    assert_eq!(ckpt.nodes.len(), 2);
    let fc = ckpt.node("fc").unwrap();
    assert_eq!(fc.kind, "InnerProduct");
    assert_eq!(fc.params.len(), 2);
    assert_eq!(fc.params[0].shape, Shape::from((3, 1)));
    assert_eq!(fc.params[0].values, param_values(&exec, 0));
    assert!(fc.params[0].grads.is_none());
    assert!(ckpt.node("loss").unwrap().params.is_empty());
}

#[test]
fn test_load_restores_values() {
    let source = net(3, 1);
    let mut target = net(3, 2);
    assert_ne!(param_values(&source, 0), param_values(&target, 0));

    let bytes = checkpoint::to_bytes(&source.to_checkpoint(false).unwrap()).unwrap();
    let ckpt = checkpoint::from_bytes(&bytes).unwrap();
    let report = target.load_pretrained(&ckpt, LoadMode::Strict).unwrap();

    assert_eq!(report.loaded, ["fc/0", "fc/1"]);
    assert!(report.skipped.is_empty());
    assert_eq!(param_values(&target, 0), param_values(&source, 0));
    assert_eq!(param_values(&target, 1), param_values(&source, 1));
}

#[test]
fn test_snapshot_with_gradients() {
    let mut exec = net(2, 1);
    exec.graph().tensor_by_name("x").unwrap().set_values(&[3.0]).unwrap();
    exec.forward_prefilled().unwrap();
    exec.clear_param_grads().unwrap();
    exec.backward().unwrap();

    let ckpt = exec.to_checkpoint(true).unwrap();
    let fc = ckpt.node("fc").unwrap();
    assert_eq!(fc.params[0].grads.as_deref(), Some(&[3.0, 3.0][..]));
    assert_eq!(fc.params[1].grads.as_deref(), Some(&[1.0, 1.0][..]));

    let path = std::env::temp_dir().join(format!("marmot_grads_{}.mrmt", std::process::id()));
    checkpoint::save(&path, &ckpt).unwrap();
    let loaded = checkpoint::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(loaded, ckpt);
}

fn mismatched_source() -> Checkpoint {
    Checkpoint {
        name: "other".into(),
        nodes: vec![NodeCheckpoint {
            name: "fc".into(),
            kind: "InnerProduct".into(),
            params: vec![
                TensorRecord {
                    shape: Shape::from((4, 1)),
                    values: vec![1.0, 2.0, 3.0, 4.0],
                    grads: None,
                },
                TensorRecord {
                    shape: Shape::from(3),
                    values: vec![9.0, 9.0, 9.0],
                    grads: None,
                },
            ],
        }],
    }
}

#[test]
fn test_lenient_load_skips_shape_mismatch() {
    let mut target = net(3, 5);
    let before = param_values(&target, 0);

    let report = target
        .load_pretrained(&mismatched_source(), LoadMode::Lenient)
        .unwrap();

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "fc/0");
    assert_eq!(report.loaded, ["fc/1"]);
    assert_eq!(param_values(&target, 0), before);
    assert_eq!(param_values(&target, 1), vec![9.0, 9.0, 9.0]);
}

#[test]
fn test_strict_load_fails_on_shape_mismatch() {
    let mut target = net(3, 5);
    let err = target
        .load_pretrained(&mismatched_source(), LoadMode::Strict)
        .unwrap_err();
    match err {
        Error::LoadMismatch { name, .. } => assert_eq!(name, "fc/0"),
        other => panic!("expected LoadMismatch, got {other:?}"),
    }
}

#[test]
fn test_unknown_source_node() {
    let mut ckpt = net(3, 1).to_checkpoint(false).unwrap();
    ckpt.nodes.push(NodeCheckpoint {
        name: "gone".into(),
        kind: "Scale".into(),
        params: vec![],
    });

    let mut target = net(3, 2);
    let report = target.load_pretrained(&ckpt, LoadMode::Lenient).unwrap();
    assert_eq!(report.loaded.len(), 2);
    assert_eq!(report.skipped, vec![("gone".to_string(), "no node of this name".to_string())]);

    assert!(matches!(
        target.load_pretrained(&ckpt, LoadMode::Strict),
        Err(Error::LoadMismatch { .. })
    ));
}

#[test]
fn test_parameter_count_mismatch() {
    let mut ckpt = net(3, 1).to_checkpoint(false).unwrap();
    ckpt.nodes[0].params.pop();
    let mut target = net(3, 2);
    let report = target.load_pretrained(&ckpt, LoadMode::Lenient).unwrap();
    assert!(report.loaded.is_empty());
    assert_eq!(report.skipped[0].0, "fc");
    assert!(target.load_pretrained(&ckpt, LoadMode::Strict).is_err());
}

#[test]
fn test_json_checkpoint() {
    let ckpt = net(2, 4).to_checkpoint(false).unwrap();
    let json = ckpt.to_json_string().unwrap();
    assert_eq!(Checkpoint::from_json_str(&json).unwrap(), ckpt);
}
