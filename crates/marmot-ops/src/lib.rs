//! # marmot-ops
//!
//! The operator contract and the reference operators for Marmot.
//!
//! A graph node's computation is any type implementing [`Operator`]:
//!
//! 1. **Operator trait** — shape inference, forward, backward with masks
//! 2. **OperatorRegistry** — maps a type tag to a constructor
//! 3. **OpConfig** — the free-form settings each node carries
//! 4. **Fillers** — parameter initialization from a seeded RNG
//!
//! Reference operators: [`Identity`], [`Scale`], [`AxpbyPower`],
//! [`InnerProduct`], [`Reduction`], [`EuclideanLoss`].

pub mod axpby_power;
pub mod config;
pub mod euclidean_loss;
pub mod filler;
pub mod identity;
pub mod inner_product;
pub mod operator;
pub mod reduction;
pub mod registry;
pub mod scale;

pub use axpby_power::AxpbyPower;
pub use config::{ConfigValue, OpConfig};
pub use euclidean_loss::EuclideanLoss;
pub use filler::Filler;
pub use identity::Identity;
pub use inner_product::InnerProduct;
pub use operator::{Bindings, Operator};
pub use reduction::{Reduction, ReductionOp};
pub use registry::{OperatorCtor, OperatorRegistry};
pub use scale::Scale;
