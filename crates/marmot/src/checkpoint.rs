// Checkpoint — parameter snapshots of a graph
//
// A Checkpoint mirrors the node list: each node carries its parameter
// tensors' shapes and values (and optionally gradients). It derives serde
// for JSON and also has a compact binary form (.mrmt):
//
//   Header:
//     magic:   [u8; 4]  = b"MRMT"
//     version: u32 LE   = 1
//     name:    str
//     count:   u32 LE   = number of nodes
//
//   For each node:
//     name:    str
//     kind:    str
//     nparams: u32 LE
//     For each param:
//       ndim:      u32 LE
//       dims:      [u32 LE; ndim]
//       has_grads: u8
//       len:       u64 LE          (element count)
//       values:    [f32 LE; len]
//       grads:     [f32 LE; len]   (only if has_grads)
//
//   str = u32 LE byte length + UTF-8 bytes
//
// Loading into a graph matches nodes by name and parameters by slot.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use marmot_core::{Error, Result, Shape};

use crate::graph::Graph;

const MAGIC: &[u8; 4] = b"MRMT";
const VERSION: u32 = 1;
// Counts read from a file only preallocate up to this many entries.
const PREALLOC_LIMIT: usize = 1024;

/// One parameter tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Shape,
    pub values: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grads: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCheckpoint {
    pub name: String,
    pub kind: String,
    pub params: Vec<TensorRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub nodes: Vec<NodeCheckpoint>,
}

impl Checkpoint {
    pub fn node(&self, name: &str) -> Option<&NodeCheckpoint> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::msg(format!("cannot serialize checkpoint: {e}")))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::msg(format!("invalid checkpoint: {e}")))
    }
}

/// What to do when a checkpoint entry does not fit the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadMode {
    /// Log and skip the entry.
    #[default]
    Lenient,
    /// Fail with [`Error::LoadMismatch`].
    Strict,
}

/// Outcome of [`Graph::load_pretrained`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// `node/slot` of every parameter copied.
    pub loaded: Vec<String>,
    /// Entry name and reason for everything skipped.
    pub skipped: Vec<(String, String)>,
}

impl Graph {
    /// Snapshot every node's parameters.
    pub fn to_checkpoint(&self, write_grads: bool) -> Result<Checkpoint> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut params = Vec::with_capacity(node.params.len());
            for &id in &node.params {
                let t = &self.tensors[id.0];
                params.push(TensorRecord {
                    shape: t.shape(),
                    values: t.values()?,
                    grads: if write_grads { Some(t.grads()?) } else { None },
                });
            }
            nodes.push(NodeCheckpoint {
                name: node.name.clone(),
                kind: node.kind().to_string(),
                params,
            });
        }
        Ok(Checkpoint {
            name: self.name.clone(),
            nodes,
        })
    }

    /// Copy parameter values from `source` into nodes of the same name.
    ///
    /// Source nodes missing here, parameter count mismatches and shape
    /// mismatches are skipped under [`LoadMode::Lenient`] and fatal under
    /// [`LoadMode::Strict`]. Values written into a shared parameter land in
    /// its owner's storage.
    pub fn load_pretrained(&mut self, source: &Checkpoint, mode: LoadMode) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let reject = |name: String, reason: String, report: &mut LoadReport| -> Result<()> {
            if mode == LoadMode::Strict {
                return Err(Error::LoadMismatch { name, reason });
            }
            tracing::warn!(entry = %name, %reason, "skipping pretrained entry");
            report.skipped.push((name, reason));
            Ok(())
        };

        for src in &source.nodes {
            let Some(&target) = self.node_index.get(&src.name) else {
                tracing::info!(node = %src.name, "ignoring source node absent from target graph");
                reject(src.name.clone(), "no node of this name".into(), &mut report)?;
                continue;
            };
            let node = &self.nodes[target];
            if node.params.len() != src.params.len() {
                let reason = format!(
                    "{} parameters in source, {} in target",
                    src.params.len(),
                    node.params.len()
                );
                reject(src.name.clone(), reason, &mut report)?;
                continue;
            }
            for (slot, record) in src.params.iter().enumerate() {
                let name = format!("{}/{slot}", src.name);
                let tensor = &self.tensors[node.params[slot].0];
                let shape = tensor.shape();
                if record.shape != shape {
                    let reason = format!("shape {} in source, {shape} in target", record.shape);
                    reject(name, reason, &mut report)?;
                    continue;
                }
                if record.values.len() != shape.elem_count() {
                    let reason = format!(
                        "{} values for shape {shape}",
                        record.values.len()
                    );
                    reject(name, reason, &mut report)?;
                    continue;
                }
                tensor.set_values(&record.values)?;
                tracing::debug!(param = %name, "copied pretrained values");
                report.loaded.push(name);
            }
        }
        Ok(report)
    }
}

// Low-level IO helpers

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_str(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn write_f32s(w: &mut impl Write, values: &[f32]) -> std::io::Result<()> {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    w.write_all(&bytes)
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read exactly `len` bytes. The buffer grows with the data actually
/// present, so a corrupt length fails with an IO error instead of a huge
/// allocation.
fn read_bytes(r: &mut impl Read, len: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.by_ref().take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("checkpoint ended after {} of {len} bytes", buf.len()),
        )));
    }
    Ok(buf)
}

fn read_str(r: &mut impl Read) -> Result<String> {
    let len = read_u32(r)?;
    let buf = read_bytes(r, u64::from(len))?;
    String::from_utf8(buf).map_err(|e| Error::msg(format!("invalid UTF-8 in checkpoint: {e}")))
}

fn read_f32s(r: &mut impl Read, len: u64) -> Result<Vec<f32>> {
    let bytes = len
        .checked_mul(4)
        .ok_or_else(|| Error::msg(format!("invalid checkpoint: element count {len} overflows")))?;
    let buf = read_bytes(r, bytes)?;
    Ok(buf
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Write a checkpoint in the binary format.
pub fn write_checkpoint(writer: &mut impl Write, ckpt: &Checkpoint) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u32(writer, VERSION)?;
    write_str(writer, &ckpt.name)?;
    write_u32(writer, ckpt.nodes.len() as u32)?;

    for node in &ckpt.nodes {
        write_str(writer, &node.name)?;
        write_str(writer, &node.kind)?;
        write_u32(writer, node.params.len() as u32)?;
        for p in &node.params {
            let dims = p.shape.dims();
            write_u32(writer, dims.len() as u32)?;
            for &d in dims {
                write_u32(writer, d as u32)?;
            }
            if let Some(g) = &p.grads {
                if g.len() != p.values.len() {
                    return Err(Error::msg(format!(
                        "node '{}': {} gradients for {} values",
                        node.name,
                        g.len(),
                        p.values.len()
                    )));
                }
            }
            writer.write_all(&[p.grads.is_some() as u8])?;
            write_u64(writer, p.values.len() as u64)?;
            write_f32s(writer, &p.values)?;
            if let Some(g) = &p.grads {
                write_f32s(writer, g)?;
            }
        }
    }
    Ok(())
}

/// Read a checkpoint in the binary format.
pub fn read_checkpoint(reader: &mut impl Read) -> Result<Checkpoint> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::msg(format!(
            "invalid checkpoint: expected magic {:?}, got {:?}",
            MAGIC, magic
        )));
    }
    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(Error::msg(format!(
            "unsupported checkpoint version: {version} (expected {VERSION})"
        )));
    }

    let name = read_str(reader)?;
    let count = read_u32(reader)? as usize;
    let mut nodes = Vec::with_capacity(count.min(PREALLOC_LIMIT));
    for _ in 0..count {
        let node_name = read_str(reader)?;
        let kind = read_str(reader)?;
        let nparams = read_u32(reader)? as usize;
        let mut params = Vec::with_capacity(nparams.min(PREALLOC_LIMIT));
        for _ in 0..nparams {
            let ndim = read_u32(reader)? as usize;
            let mut dims = Vec::with_capacity(ndim.min(PREALLOC_LIMIT));
            for _ in 0..ndim {
                dims.push(read_u32(reader)? as usize);
            }
            let has_grads = read_u8(reader)? != 0;
            let len = read_u64(reader)?;
            let values = read_f32s(reader, len)?;
            let grads = if has_grads { Some(read_f32s(reader, len)?) } else { None };
            params.push(TensorRecord {
                shape: Shape::new(dims),
                values,
                grads,
            });
        }
        nodes.push(NodeCheckpoint {
            name: node_name,
            kind,
            params,
        });
    }
    Ok(Checkpoint { name, nodes })
}

pub fn to_bytes(ckpt: &Checkpoint) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_checkpoint(&mut buf, ckpt)?;
    Ok(buf)
}

pub fn from_bytes(bytes: &[u8]) -> Result<Checkpoint> {
    let mut cursor = std::io::Cursor::new(bytes);
    read_checkpoint(&mut cursor)
}

/// Save a checkpoint file.
pub fn save(path: impl AsRef<Path>, ckpt: &Checkpoint) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_checkpoint(&mut writer, ckpt)?;
    writer.flush()?;
    Ok(())
}

/// Load a checkpoint file.
pub fn load(path: impl AsRef<Path>) -> Result<Checkpoint> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    read_checkpoint(&mut reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        Checkpoint {
            name: "net".into(),
            nodes: vec![
                NodeCheckpoint {
                    name: "fc".into(),
                    kind: "InnerProduct".into(),
                    params: vec![
                        TensorRecord {
                            shape: Shape::from((2, 2)),
                            values: vec![1.0, -2.0, 3.5, 0.0],
                            grads: Some(vec![0.1, 0.2, 0.3, 0.4]),
                        },
                        TensorRecord {
                            shape: Shape::from(2),
                            values: vec![0.5, 0.25],
                            grads: None,
                        },
                    ],
                },
                NodeCheckpoint {
                    name: "loss".into(),
                    kind: "EuclideanLoss".into(),
                    params: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_binary_roundtrip() {
        let ckpt = sample();
        let bytes = to_bytes(&ckpt).unwrap();
        assert_eq!(&bytes[..4], b"MRMT");
        assert_eq!(from_bytes(&bytes).unwrap(), ckpt);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = to_bytes(&sample()).unwrap();
        bytes[0] = b'X';
        assert!(from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_truncated_is_io_error() {
        let bytes = to_bytes(&sample()).unwrap();
        let err = from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    /// A stream with one node holding one parameter of `len` elements and
    /// no element data.
    fn header_with_len(len: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        write_u32(&mut bytes, VERSION).unwrap();
        write_str(&mut bytes, "net").unwrap();
        write_u32(&mut bytes, 1).unwrap();
        write_str(&mut bytes, "fc").unwrap();
        write_str(&mut bytes, "InnerProduct").unwrap();
        write_u32(&mut bytes, 1).unwrap();
        write_u32(&mut bytes, 1).unwrap();
        write_u32(&mut bytes, 3).unwrap();
        bytes.push(0);
        write_u64(&mut bytes, len).unwrap();
        bytes
    }

    #[test]
    fn test_overflowing_length_is_rejected() {
        let err = from_bytes(&header_with_len(u64::MAX / 2)).unwrap_err();
        assert!(matches!(err, Error::Msg(_)));
    }

    #[test]
    fn test_length_past_end_of_data_is_io_error() {
        let mut bytes = header_with_len(1 << 40);
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        let err = from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_huge_counts_do_not_preallocate() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        write_u32(&mut bytes, VERSION).unwrap();
        write_str(&mut bytes, "net").unwrap();
        write_u32(&mut bytes, u32::MAX).unwrap();
        assert!(matches!(from_bytes(&bytes), Err(Error::Io(_))));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        write_u32(&mut bytes, VERSION).unwrap();
        write_u32(&mut bytes, u32::MAX).unwrap();
        assert!(matches!(from_bytes(&bytes), Err(Error::Io(_))));
    }

    #[test]
    fn test_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("marmot_ckpt_{}.mrmt", std::process::id()));
        save(&path, &sample()).unwrap();
        let loaded = load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_json_omits_missing_grads() {
        let json = sample().to_json_string().unwrap();
        assert_eq!(json.matches("grads").count(), 1);
        assert_eq!(Checkpoint::from_json_str(&json).unwrap(), sample());
    }
}
