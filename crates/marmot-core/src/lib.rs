//! # marmot-core
//!
//! Memory and tensor primitives for Marmot.
//!
//! This crate provides:
//! - [`SyncedBuffer`] — a byte buffer kept coherent between host and device memory
//! - [`DeviceMemory`] — the accelerator memory trait, with [`SimulatedDevice`]
//! - [`MemoryContext`] — which memory spaces a buffer may use
//! - [`Tensor`] — a named array with a values buffer and a gradient buffer
//! - [`Shape`] — tensor dimensions
//! - [`Error`] / [`Result`] — the error type shared by every marmot crate

pub mod error;
pub mod memory;
pub mod shape;
pub mod synced;
pub mod tensor;

pub use error::{Error, Result};
pub use memory::{
    DeviceMemory, DevicePtr, HostBlock, MemoryContext, MemorySpace, SimulatedDevice, TransferStats,
};
pub use shape::Shape;
pub use synced::{SyncedBuffer, SyncedHead};
pub use tensor::{Tensor, TensorId};
