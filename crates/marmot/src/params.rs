// ParamRegistry — owner/sharer bookkeeping for node parameters
//
// Every parameter slot of every node gets one ParamEntry, in build order.
// The first node to declare a given parameter name owns it; later nodes
// declaring the same name become sharers. Anonymous parameters are always
// owners.
//
//   ParamEntry { role: Owner { learnable: 2 } }   → learnables[2]
//   ParamEntry { role: Sharer { owner: ParamId(5) } }
//                                                 → entries[5] is an owner
//
// A sharer points straight at its owner; there are no chains. Learning-rate
// and decay multipliers live on the owner's Learnable record, together with
// whether they were set explicitly. A sharer that sets a multiplier must
// agree with an explicit owner value, or supplies it when the owner left it
// unset.

use std::collections::HashMap;

use marmot_core::{Error, Result, Shape, TensorId};

use crate::spec::{ParamSpec, ShareMode};

/// Index of a parameter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Holds the storage; `learnable` indexes the learnable list.
    Owner { learnable: usize },
    /// Aliases the storage of `owner`.
    Sharer { owner: ParamId },
}

#[derive(Debug, Clone)]
pub struct ParamEntry {
    pub tensor: TensorId,
    /// Index of the owning node in the graph.
    pub node: usize,
    /// Position among the node's parameters.
    pub slot: usize,
    pub display_name: String,
    pub shape: Shape,
    pub role: ParamRole,
}

impl ParamEntry {
    pub fn is_owner(&self) -> bool {
        matches!(self.role, ParamRole::Owner { .. })
    }
}

/// A parameter an optimizer updates, with its multipliers.
#[derive(Debug, Clone)]
pub struct Learnable {
    pub param: ParamId,
    pub tensor: TensorId,
    pub lr_mult: f32,
    pub decay_mult: f32,
    pub has_lr_mult: bool,
    pub has_decay_mult: bool,
}

/// Where a newly registered parameter gets its storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Owner,
    /// Alias this owner's tensor.
    Sharer { owner_tensor: TensorId },
}

#[derive(Debug, Clone, Default)]
pub struct ParamRegistry {
    entries: Vec<ParamEntry>,
    learnables: Vec<Learnable>,
    by_name: HashMap<String, ParamId>,
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register parameter `slot` of node `node_name`.
    pub fn register(
        &mut self,
        node: usize,
        node_name: &str,
        slot: usize,
        tensor: TensorId,
        shape: Shape,
        spec: &ParamSpec,
    ) -> Result<Registration> {
        let id = ParamId(self.entries.len());
        let display_name = match &spec.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{node_name}.{slot}"),
        };

        let existing = spec
            .name
            .as_ref()
            .filter(|n| !n.is_empty())
            .and_then(|n| self.by_name.get(n).copied());

        let Some(owner) = existing else {
            let learnable = self.learnables.len();
            self.learnables.push(Learnable {
                param: id,
                tensor,
                lr_mult: spec.lr_mult.unwrap_or(1.0),
                decay_mult: spec.decay_mult.unwrap_or(1.0),
                has_lr_mult: spec.lr_mult.is_some(),
                has_decay_mult: spec.decay_mult.is_some(),
            });
            if let Some(name) = spec.name.as_ref().filter(|n| !n.is_empty()) {
                self.by_name.insert(name.clone(), id);
            }
            self.entries.push(ParamEntry {
                tensor,
                node,
                slot,
                display_name,
                shape,
                role: ParamRole::Owner { learnable },
            });
            return Ok(Registration::Owner);
        };

        let owner_entry = &self.entries[owner.0];
        let compatible = match spec.share_mode {
            ShareMode::Strict => owner_entry.shape == shape,
            ShareMode::Permissive => owner_entry.shape.elem_count() == shape.elem_count(),
        };
        if !compatible {
            return Err(Error::config(format!(
                "cannot share parameter '{display_name}' of node '{node_name}': owner shape {} vs \
                 sharer shape {shape} ({:?} mode)",
                owner_entry.shape, spec.share_mode
            )));
        }
        let owner_tensor = owner_entry.tensor;
        let ParamRole::Owner { learnable } = owner_entry.role else {
            return Err(Error::InvalidState(format!(
                "parameter '{display_name}' resolves to a sharer"
            )));
        };

        let record = &mut self.learnables[learnable];
        if let Some(lr) = spec.lr_mult {
            if record.has_lr_mult && record.lr_mult != lr {
                return Err(Error::config(format!(
                    "shared parameter '{display_name}' has mismatched lr_mult ({} vs {lr})",
                    record.lr_mult
                )));
            }
            record.lr_mult = lr;
            record.has_lr_mult = true;
        }
        if let Some(decay) = spec.decay_mult {
            if record.has_decay_mult && record.decay_mult != decay {
                return Err(Error::config(format!(
                    "shared parameter '{display_name}' has mismatched decay_mult ({} vs {decay})",
                    record.decay_mult
                )));
            }
            record.decay_mult = decay;
            record.has_decay_mult = true;
        }

        self.entries.push(ParamEntry {
            tensor,
            node,
            slot,
            display_name,
            shape,
            role: ParamRole::Sharer { owner },
        });
        Ok(Registration::Sharer { owner_tensor })
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn get(&self, id: ParamId) -> Option<&ParamEntry> {
        self.entries.get(id.0)
    }

    /// Owners in registration order.
    pub fn learnables(&self) -> &[Learnable] {
        &self.learnables
    }

    /// The owner entry `id` resolves to (itself for an owner).
    pub fn owner_of(&self, id: ParamId) -> ParamId {
        match self.entries[id.0].role {
            ParamRole::Owner { .. } => id,
            ParamRole::Sharer { owner } => owner,
        }
    }

    /// Owner of the parameter registered under `name`.
    pub fn by_name(&self, name: &str) -> Option<ParamId> {
        self.by_name.get(name).copied()
    }

    /// Learnable record of an owner entry.
    pub fn learnable_of(&self, id: ParamId) -> Option<&Learnable> {
        match self.entries.get(self.owner_of(id).0)?.role {
            ParamRole::Owner { learnable } => self.learnables.get(learnable),
            ParamRole::Sharer { .. } => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
