// OperatorRegistry — type tag → constructor
//
// Graph descriptions name operators by string tag ("Scale", "InnerProduct").
// The registry turns a tag plus the node's config into a boxed operator.
// New operator types are added by registering a constructor; the graph
// builder never needs to know the concrete types.

use std::collections::HashMap;
use std::fmt;

use marmot_core::{Error, Result};

use crate::config::OpConfig;
use crate::operator::Operator;
use crate::{AxpbyPower, EuclideanLoss, Identity, InnerProduct, Reduction, Scale};

/// Builds an operator from its node config.
pub type OperatorCtor = fn(&OpConfig) -> Result<Box<dyn Operator>>;

#[derive(Clone, Default)]
pub struct OperatorRegistry {
    ctors: HashMap<String, OperatorCtor>,
}

impl OperatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every reference operator of this crate.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.ctors.insert("Identity".into(), identity);
        reg.ctors.insert("Scale".into(), scale);
        reg.ctors.insert("AxpbyPower".into(), axpby_power);
        reg.ctors.insert("InnerProduct".into(), inner_product);
        reg.ctors.insert("Reduction".into(), reduction);
        reg.ctors.insert("EuclideanLoss".into(), euclidean_loss);
        reg
    }

    /// Register a constructor. Registering the same tag twice is an error.
    pub fn register(&mut self, tag: impl Into<String>, ctor: OperatorCtor) -> Result<()> {
        let tag = tag.into();
        if self.ctors.contains_key(&tag) {
            return Err(Error::config(format!("operator type '{tag}' already registered")));
        }
        tracing::debug!(tag = %tag, "registered operator type");
        self.ctors.insert(tag, ctor);
        Ok(())
    }

    /// Construct an operator of type `tag`.
    pub fn create(&self, tag: &str, config: &OpConfig) -> Result<Box<dyn Operator>> {
        let ctor = self.ctors.get(tag).ok_or_else(|| {
            Error::config(format!(
                "unknown operator type '{tag}' (known: {})",
                self.tags().join(", ")
            ))
        })?;
        ctor(config)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.ctors.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.ctors.keys().cloned().collect();
        tags.sort();
        tags
    }
}

fn identity(c: &OpConfig) -> Result<Box<dyn Operator>> {
    Ok(Box::new(Identity::from_config(c)?))
}

fn scale(c: &OpConfig) -> Result<Box<dyn Operator>> {
    Ok(Box::new(Scale::from_config(c)?))
}

fn axpby_power(c: &OpConfig) -> Result<Box<dyn Operator>> {
    Ok(Box::new(AxpbyPower::from_config(c)?))
}

fn inner_product(c: &OpConfig) -> Result<Box<dyn Operator>> {
    Ok(Box::new(InnerProduct::from_config(c)?))
}

fn reduction(c: &OpConfig) -> Result<Box<dyn Operator>> {
    Ok(Box::new(Reduction::from_config(c)?))
}

fn euclidean_loss(c: &OpConfig) -> Result<Box<dyn Operator>> {
    Ok(Box::new(EuclideanLoss::from_config(c)?))
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
