use marmot_core::MemoryContext;

use crate::spec::{NetState, Phase};

// Runtime configuration
//
// Everything a build needs besides the graph description itself: the state
// used to filter nodes, the memory context every tensor buffer is created
// with, the seed for parameter fillers, and whether per-node statistics are
// traced during execution.

/// Configuration for building and running a graph.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Phase, level and stages matched against node rules.
    pub state: NetState,
    /// Host-only or accelerated buffers.
    pub memory: MemoryContext,
    /// Seed for parameter initialization (default: 0).
    pub seed: u64,
    /// Install a [`TraceObserver`](crate::TraceObserver) on executors.
    pub debug_info: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state: NetState::default(),
            memory: MemoryContext::HostOnly,
            seed: 0,
            debug_info: false,
        }
    }
}

impl RuntimeConfig {
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.state.phase = phase;
        self
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.state.level = level;
        self
    }

    /// Activate a stage.
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.state.stages.push(stage.into());
        self
    }

    pub fn with_memory(mut self, memory: MemoryContext) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_debug_info(mut self, debug_info: bool) -> Self {
        self.debug_info = debug_info;
        self
    }
}
