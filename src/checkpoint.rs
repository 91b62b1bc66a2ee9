//! Per worker checkpoints and their consolidation into full tensors.
//!
//! Every worker saves its own shards next to the metadata needed to undo the sharding:
//! for every unit its path, the layout of each backing parameter and the names its shared
//! parameters are known by elsewhere. Consolidation only needs the checkpoints of every
//! rank, never the model or the group.

use std::{collections::BTreeMap, fs, path::Path};

use comms::Collective;
use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::{
    ParamId, Result, ShardErr, ShardedModel, builder::join_path, shard::unpad,
    state::TrainingState,
};

/// The layout of a single backing parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamMetadata {
    /// The names of the tensors laid out in the parameter, relative to the unit.
    pub names: Vec<String>,
    pub shapes: Vec<Vec<usize>>,
    pub numels: Vec<usize>,
    /// The padding of this worker's shard.
    pub padding: usize,
}

/// The parameters a unit owns and the ones it shares with other units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitMetadata {
    pub path: String,
    pub params: BTreeMap<String, ParamMetadata>,
    /// Pairs of `(source, destination)` fully qualified names of shared tensors.
    pub shared_param_info: Vec<(String, String)>,
}

/// Everything needed to put a worker's shards back together with the other workers' ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub rank: usize,
    pub world_size: usize,
    pub param_metadata: Vec<UnitMetadata>,
}

/// A worker's shards keyed by their backing parameters' fully qualified names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub weights: BTreeMap<String, Vec<f32>>,
    pub metadata: ShardMetadata,
}

impl Checkpoint {
    /// Writes the checkpoint to `path` as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string(self)?;
        let path = path.as_ref();
        fs::write(path, json)?;
        debug!("saved the checkpoint of rank {} to {}", self.metadata.rank, path.display());
        Ok(())
    }

    /// Reads a checkpoint previously written with `save`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl<C: Collective> ShardedModel<C> {
    /// Describes how this worker's shards were cut out of the full tensors.
    pub fn local_metadata(&self) -> ShardMetadata {
        let param_metadata = self
            .units()
            .map(|(id, unit)| {
                let params = unit
                    .params
                    .iter()
                    .map(|&pid| (self.params[pid.0].name.clone(), self.param_metadata(pid)))
                    .collect();

                let shared_param_info = self
                    .aliases
                    .iter()
                    .filter(|alias| alias.unit == id)
                    .flat_map(|alias| {
                        let param = &self.params[alias.param.0];
                        let sources = self.state_keys(alias.param, param.owner, &param.name);
                        let destinations = self.state_keys(alias.param, alias.unit, &alias.name);
                        sources.into_iter().zip(destinations)
                    })
                    .collect();

                UnitMetadata {
                    path: unit.path.clone(),
                    params,
                    shared_param_info,
                }
            })
            .collect();

        ShardMetadata {
            rank: self.rank,
            world_size: self.world_size,
            param_metadata,
        }
    }

    fn param_metadata(&self, pid: ParamId) -> ParamMetadata {
        let param = &self.params[pid.0];
        match &param.flat {
            Some(group) => ParamMetadata {
                names: group.names().to_vec(),
                shapes: group.shapes().to_vec(),
                numels: group.numels().to_vec(),
                padding: param.padding,
            },
            None => ParamMetadata {
                names: vec![param.name.clone()],
                shapes: vec![param.orig_shape.clone()],
                numels: vec![param.numel],
                padding: param.padding,
            },
        }
    }

    /// Takes a snapshot of this worker's shards and metadata.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        self.check_state(self.root, &[TrainingState::Idle])?;

        let weights = self
            .params
            .iter()
            .map(|p| (p.path.clone(), p.shard.clone()))
            .collect();

        Ok(Checkpoint {
            weights,
            metadata: self.local_metadata(),
        })
    }
}

/// Reassembles the full tensors out of the checkpoints of every worker of a group.
///
/// # Arguments
/// * `checkpoints` - One checkpoint per rank, in any order.
///
/// # Returns
/// A map from fully qualified name to full tensor, shared tensors included under every
/// name they're known by.
pub fn consolidate(checkpoints: &[Checkpoint]) -> Result<BTreeMap<String, ArrayD<f32>>> {
    let Some(first) = checkpoints.first() else {
        return Err(ShardErr::Config("there are no checkpoints to consolidate".into()));
    };

    let world_size = first.metadata.world_size;
    if checkpoints.len() != world_size {
        return Err(ShardErr::SizeMismatch {
            what: "checkpoints",
            got: checkpoints.len(),
            expected: world_size,
        });
    }

    let mut ranks: Vec<&Checkpoint> = checkpoints.iter().collect();
    ranks.sort_by_key(|c| c.metadata.rank);
    for (rank, checkpoint) in ranks.iter().enumerate() {
        let meta = &checkpoint.metadata;
        if meta.rank != rank || meta.world_size != world_size {
            return Err(ShardErr::Config(format!(
                "checkpoint of rank {} out of {} doesn't belong to a group of {world_size}",
                meta.rank, meta.world_size
            )));
        }
    }

    let mut out = BTreeMap::new();
    for (i, unit) in first.metadata.param_metadata.iter().enumerate() {
        for (name, meta) in &unit.params {
            let key = join_path(&unit.path, name);
            let mut flat = Vec::new();

            for checkpoint in &ranks {
                let missing = || ShardErr::UnknownParam {
                    unit: unit.path.clone(),
                    name: name.clone(),
                };

                let shard = checkpoint.weights.get(&key).ok_or_else(missing)?;
                let padding = checkpoint
                    .metadata
                    .param_metadata
                    .get(i)
                    .and_then(|u| u.params.get(name))
                    .ok_or_else(missing)?
                    .padding;

                flat.extend_from_slice(unpad(shard, padding));
            }

            let numel: usize = meta.numels.iter().sum();
            if flat.len() != numel {
                return Err(ShardErr::SizeMismatch {
                    what: "consolidated parameter",
                    got: flat.len(),
                    expected: numel,
                });
            }

            let mut rest = flat.as_slice();
            for ((member, shape), &numel) in meta.names.iter().zip(&meta.shapes).zip(&meta.numels) {
                let (head, tail) = rest.split_at(numel);
                let tensor = ArrayD::from_shape_vec(IxDyn(shape), head.to_vec())?;
                out.insert(join_path(&unit.path, member), tensor);
                rest = tail;
            }
        }
    }

    for unit in &first.metadata.param_metadata {
        for (src, dst) in &unit.shared_param_info {
            let tensor = out.get(src).cloned().ok_or_else(|| ShardErr::UnknownParam {
                unit: unit.path.clone(),
                name: src.clone(),
            })?;

            out.insert(dst.clone(), tensor);
        }
    }

    info!("consolidated {} tensors out of {world_size} checkpoints", out.len());
    Ok(out)
}
