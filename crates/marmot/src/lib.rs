//! # Marmot
//!
//! A declarative DAG network engine: describe nodes and the named tensors
//! connecting them, build the description into a topologically ordered graph,
//! then run forward and backward passes over any contiguous range of it.
//!
//! ## Usage
//!
//! ```rust
//! use marmot::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `marmot-core` | SyncedBuffer, DeviceMemory, MemoryContext, Tensor, Shape, Error |
//! | `marmot-ops` | Operator trait, OperatorRegistry, OpConfig, fillers, reference operators |
//! | `marmot` | Graph description, filtering, builder, executor, checkpoints |
//!
//! ## Modules
//!
//! - [`spec`] — GraphSpec / NodeSpec / ParamSpec, serde-derived
//! - [`filter`] — phase, level and stage rules
//! - [`builder`] — GraphSpec → Graph, including backward-need analysis
//! - [`executor`] — ranged forward/backward, updates, parameter sharing
//! - [`checkpoint`] — parameter snapshots, binary and JSON

/// Re-export core types.
pub use marmot_core::{
    DeviceMemory, DevicePtr, Error, HostBlock, MemoryContext, MemorySpace, Result, Shape,
    SimulatedDevice, SyncedBuffer, SyncedHead, Tensor, TensorId, TransferStats,
};

/// Re-export the operator contract and reference operators.
pub mod ops {
    pub use marmot_ops::*;
}

/// Graph builder — resolves a GraphSpec into a Graph.
pub mod builder;

/// Checkpoint — save and load graph parameters.
pub mod checkpoint;

/// Runtime configuration.
pub mod config;

/// Executor — forward, backward, update.
pub mod executor;

/// State rules deciding which nodes a build includes.
pub mod filter;

/// The built graph.
pub mod graph;

/// Execution observers.
pub mod observe;

/// Parameter owner/sharer registry.
pub mod params;

/// Serde-derived graph description.
pub mod spec;

pub use builder::GraphBuilder;
pub use checkpoint::{Checkpoint, LoadMode, LoadReport, NodeCheckpoint, TensorRecord};
pub use config::RuntimeConfig;
pub use executor::{Executor, ForwardResult, LearnableParam, ParamUpdater};
pub use graph::{Graph, GraphNode};
pub use observe::{EventLog, ExecEvent, ExecObserver, TraceObserver};
pub use params::{Learnable, ParamEntry, ParamId, ParamRegistry, ParamRole};
pub use spec::{GraphSpec, InputSpec, NetState, NodeSpec, ParamSpec, Phase, ShareMode, StateRule};

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, LoadMode, LoadReport};
    pub use crate::executor::{Executor, ForwardResult, LearnableParam, ParamUpdater};
    pub use crate::observe::{EventLog, ExecEvent, ExecObserver, TraceObserver};
    pub use crate::ops::{
        AxpbyPower, ConfigValue, EuclideanLoss, Filler, Identity, InnerProduct, OpConfig,
        Operator, OperatorRegistry, Reduction, Scale,
    };
    pub use crate::spec::{GraphSpec, NodeSpec, ParamSpec, Phase, ShareMode, StateRule};
    pub use crate::{
        Error, Graph, GraphBuilder, MemoryContext, Result, RuntimeConfig, Shape, SimulatedDevice,
        Tensor,
    };
}
