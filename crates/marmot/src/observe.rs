// Execution observers — hooks called as nodes run and after updates

use std::sync::{Arc, Mutex};

use marmot_core::{Result, Tensor};

use crate::graph::Graph;
use crate::params::ParamId;

// ExecObserver — the hook trait

/// Receives a callback at fixed points of execution.
///
/// Observers only read the graph; they cannot change what runs. Every method
/// defaults to doing nothing.
pub trait ExecObserver: Send {
    /// Node `node` finished its forward pass.
    fn after_forward(&mut self, _graph: &Graph, _node: usize) -> Result<()> {
        Ok(())
    }

    /// Node `node` finished its backward pass.
    fn after_backward(&mut self, _graph: &Graph, _node: usize) -> Result<()> {
        Ok(())
    }

    /// Owner parameter `param` was updated.
    fn after_update(&mut self, _graph: &Graph, _param: ParamId) -> Result<()> {
        Ok(())
    }
}

// TraceObserver — per-tensor statistics through `tracing`

/// Logs the mean absolute value of every tensor a node touched, at debug
/// level. Installed by the executor when `RuntimeConfig::debug_info` is set.
#[derive(Debug, Default, Clone)]
pub struct TraceObserver;

fn abs_mean(sum: f32, t: &Tensor) -> f32 {
    sum / t.count().max(1) as f32
}

impl ExecObserver for TraceObserver {
    fn after_forward(&mut self, graph: &Graph, node: usize) -> Result<()> {
        let n = &graph.nodes()[node];
        for &id in n.tops() {
            let t = graph.tensor(id);
            tracing::debug!(
                node = %n.name(),
                top = %t.name(),
                data = abs_mean(t.asum_values()?, t),
                "[forward]"
            );
        }
        for (slot, &id) in n.params().iter().enumerate() {
            let t = graph.tensor(id);
            tracing::debug!(
                node = %n.name(),
                param = slot,
                data = abs_mean(t.asum_values()?, t),
                "[forward]"
            );
        }
        Ok(())
    }

    fn after_backward(&mut self, graph: &Graph, node: usize) -> Result<()> {
        let n = &graph.nodes()[node];
        for (i, &id) in n.bottoms().iter().enumerate() {
            if !n.bottom_need_backward()[i] {
                continue;
            }
            let t = graph.tensor(id);
            tracing::debug!(
                node = %n.name(),
                bottom = %t.name(),
                diff = abs_mean(t.asum_grads()?, t),
                "[backward]"
            );
        }
        for (slot, &id) in n.params().iter().enumerate() {
            if !n.param_propagate()[slot] {
                continue;
            }
            let t = graph.tensor(id);
            tracing::debug!(
                node = %n.name(),
                param = slot,
                diff = abs_mean(t.asum_grads()?, t),
                "[backward]"
            );
        }
        Ok(())
    }

    fn after_update(&mut self, graph: &Graph, param: ParamId) -> Result<()> {
        let Some(entry) = graph.params().get(param) else {
            return Ok(());
        };
        let t = graph.tensor(entry.tensor);
        tracing::debug!(
            param = %entry.display_name,
            data = abs_mean(t.asum_values()?, t),
            diff = abs_mean(t.asum_grads()?, t),
            "[update]"
        );
        Ok(())
    }
}

// EventLog — records the callback sequence

/// One observer callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Forward { node: String },
    Backward { node: String },
    Update { param: String },
}

/// Records every callback into a shared list. Clone the log before handing
/// it to an executor to keep a handle for reading.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ExecEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event log poisoned").clear();
    }

    fn push(&self, event: ExecEvent) {
        self.events.lock().expect("event log poisoned").push(event);
    }
}

impl ExecObserver for EventLog {
    fn after_forward(&mut self, graph: &Graph, node: usize) -> Result<()> {
        self.push(ExecEvent::Forward {
            node: graph.nodes()[node].name().to_string(),
        });
        Ok(())
    }

    fn after_backward(&mut self, graph: &Graph, node: usize) -> Result<()> {
        self.push(ExecEvent::Backward {
            node: graph.nodes()[node].name().to_string(),
        });
        Ok(())
    }

    fn after_update(&mut self, graph: &Graph, param: ParamId) -> Result<()> {
        let name = graph
            .params()
            .get(param)
            .map(|e| e.display_name.clone())
            .unwrap_or_default();
        self.push(ExecEvent::Update { param: name });
        Ok(())
    }
}
