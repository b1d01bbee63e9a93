// Fillers — parameter initialization
//
// A filler is described in an operator's config as a nested map:
//
//   {"type": "constant", "value": 0.0}
//   {"type": "uniform",  "min": -0.1, "max": 0.1}
//   {"type": "gaussian", "mean": 0.0, "std": 0.01}
//   {"type": "xavier"}                  U(-s, s), s = sqrt(3 / fan_in)
//
// fan_in is count / shape[0]: for a weight of shape [num_output, K] that is
// K, the number of inputs feeding each output unit.
//
// All random draws go through the caller's StdRng, which the graph builder
// seeds from its runtime config, so a given seed always yields the same
// initial weights.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use marmot_core::{Error, Result, Tensor};

use crate::config::OpConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Filler {
    Constant { value: f32 },
    Uniform { min: f32, max: f32 },
    Gaussian { mean: f32, std: f32 },
    Xavier,
}

impl Filler {
    /// Parse the filler stored under `key`, falling back to `default` when
    /// the key is absent.
    pub fn from_config(cfg: &OpConfig, key: &str, default: Filler) -> Result<Filler> {
        let Some(section) = cfg.section(key)? else {
            return Ok(default);
        };
        match section.str_or("type", "constant")? {
            "constant" => Ok(Filler::Constant {
                value: section.f32_or("value", 0.0)?,
            }),
            "uniform" => {
                let min = section.f32_or("min", 0.0)?;
                let max = section.f32_or("max", 1.0)?;
                if min > max {
                    return Err(Error::config(format!(
                        "uniform filler with min {min} > max {max}"
                    )));
                }
                Ok(Filler::Uniform { min, max })
            }
            "gaussian" => {
                let std = section.f32_or("std", 1.0)?;
                if std < 0.0 {
                    return Err(Error::config("gaussian filler with negative std"));
                }
                Ok(Filler::Gaussian {
                    mean: section.f32_or("mean", 0.0)?,
                    std,
                })
            }
            "xavier" => Ok(Filler::Xavier),
            other => Err(Error::config(format!("unknown filler type '{other}'"))),
        }
    }

    /// Overwrite `tensor`'s values.
    pub fn fill(&self, tensor: &Tensor, rng: &mut StdRng) -> Result<()> {
        let shape = tensor.shape();
        match *self {
            Filler::Constant { value } => tensor.with_values_mut(|v| v.fill(value)),
            Filler::Uniform { min, max } => tensor.with_values_mut(|v| fill_uniform(v, min, max, rng)),
            Filler::Gaussian { mean, std } => {
                let normal = Normal::new(mean, std)
                    .map_err(|e| Error::config(format!("gaussian filler: {e}")))?;
                tensor.with_values_mut(|v| {
                    for x in v.iter_mut() {
                        *x = normal.sample(rng);
                    }
                })
            }
            Filler::Xavier => {
                let count = shape.elem_count();
                let rows = shape.dims().first().copied().unwrap_or(1).max(1);
                let fan_in = (count / rows).max(1) as f32;
                let scale = (3.0 / fan_in).sqrt();
                tensor.with_values_mut(|v| fill_uniform(v, -scale, scale, rng))
            }
        }
    }
}

fn fill_uniform(v: &mut [f32], min: f32, max: f32, rng: &mut StdRng) {
    if min == max {
        v.fill(min);
        return;
    }
    for x in v.iter_mut() {
        *x = rng.gen_range(min..max);
    }
}
