use std::collections::BTreeMap;

use comms::Collective;
use log::debug;
use ndarray::{ArrayD, IxDyn};

use super::ShardedModel;
use crate::{
    ParamId, Result, ShardErr, UnitId,
    shard::shard_tensor,
    state::TrainingState::{Idle, SummonFullParams},
};

impl<C: Collective> ShardedModel<C> {
    /// Gathers the full parameters of `id` for the duration of `body`.
    ///
    /// Inside `body` the parameters expose their full tensors and may be modified through
    /// `param_mut(..).data_mut()`. Unless `volatile` is set, the modifications of the
    /// parameters owned by the summoned units are written back into this worker's shards
    /// when `body` returns. The full tensors are freed afterwards no matter how `body` ends.
    ///
    /// # Arguments
    /// * `id` - The unit to summon.
    /// * `recurse` - Whether to summon every unit nested inside `id` too.
    /// * `volatile` - Whether to discard the modifications made inside `body`.
    /// * `body` - The code needing the full parameters.
    ///
    /// # Returns
    /// Whatever `body` returns.
    pub fn summon_full_params<T, F>(
        &mut self,
        id: UnitId,
        recurse: bool,
        volatile: bool,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let targets = if recurse { self.subtree(id)? } else { vec![id] };
        for &target in &targets {
            self.check_state(target, &[Idle])?;
        }

        for &target in &targets {
            self.units[target.0].state = SummonFullParams;
        }

        let gathered = targets.iter().try_for_each(|&target| self.rebuild_full(target));
        let out = gathered.and_then(|()| body(self));

        let written = if volatile || out.is_err() {
            Ok(())
        } else {
            self.write_back(&targets)
        };

        for &target in &targets {
            let params = self.units[target.0].uses();
            self.free_full(&params);
            self.units[target.0].state = Idle;
        }

        debug!(unit = self.units[id.0].path.as_str(); "released {} summoned units", targets.len());

        let out = out?;
        written?;
        Ok(out)
    }

    /// Copies this worker's slice of the full tensors owned by `targets` into the shards.
    fn write_back(&mut self, targets: &[UnitId]) -> Result<()> {
        let (rank, world_size) = (self.rank, self.world_size);

        for &target in targets {
            for &pid in &self.units[target.0].params {
                let param = &mut self.params[pid.0];
                if !param.is_sharded {
                    continue;
                }

                let (shard, _) = shard_tensor(param.full_slice()?, rank, world_size);
                param.shard = shard;
            }
        }

        Ok(())
    }

    /// Gathers every parameter into a map from fully qualified name to full tensor.
    ///
    /// Flattened parameters are split into their members and shared parameters appear
    /// under every name they're known by. Every worker of the group must call this
    /// together.
    pub fn full_state_dict(&mut self) -> Result<BTreeMap<String, ArrayD<f32>>> {
        let root = self.root;
        self.summon_full_params(root, true, true, |model| {
            let mut out = BTreeMap::new();

            for (i, param) in model.params.iter().enumerate() {
                let full = param.full_slice()?;
                let keys = model.state_keys(ParamId(i), param.owner, &param.name);
                out.extend(keys.into_iter().zip(model.split_full(ParamId(i), full)?));
            }

            for alias in &model.aliases {
                let full = model.params[alias.param.0].full_slice()?;
                let keys = model.state_keys(alias.param, alias.unit, &alias.name);
                out.extend(keys.into_iter().zip(model.split_full(alias.param, full)?));
            }

            Ok(out)
        })
    }

    /// Reshapes a full flat tensor into the tensors its state dict keys map to.
    fn split_full(&self, pid: ParamId, full: &[f32]) -> Result<Vec<ArrayD<f32>>> {
        let param = &self.params[pid.0];
        match &param.flat {
            Some(group) => Ok(group.split(full)?.into_iter().map(|(_, t)| t).collect()),
            None => Ok(vec![ArrayD::from_shape_vec(
                IxDyn(&param.orig_shape),
                full.to_vec(),
            )?]),
        }
    }

    /// Copies every local shard into a map keyed by the parameters' fully qualified names.
    ///
    /// Sharded parameters are one dimensional and include their padding, unsharded ones
    /// keep their original shape.
    pub fn local_state_dict(&self) -> Result<BTreeMap<String, ArrayD<f32>>> {
        self.check_state(self.root, &[Idle])?;

        self.params
            .iter()
            .map(|param| {
                let shape = if param.is_sharded {
                    vec![param.shard.len()]
                } else {
                    param.orig_shape.clone()
                };

                let shard = ArrayD::from_shape_vec(IxDyn(&shape), param.shard.clone())?;
                Ok((param.path.clone(), shard))
            })
            .collect()
    }

    /// Replaces every local shard with the one stored under its parameter's name.
    pub fn load_local_state_dict(&mut self, state: &BTreeMap<String, ArrayD<f32>>) -> Result<()> {
        self.check_state(self.root, &[Idle])?;

        for param in self.params.iter_mut() {
            let shard = state.get(&param.path).ok_or_else(|| ShardErr::UnknownParam {
                unit: String::new(),
                name: param.path.clone(),
            })?;

            if shard.len() != param.shard.len() {
                return Err(ShardErr::SizeMismatch {
                    what: "local state dict",
                    got: shard.len(),
                    expected: param.shard.len(),
                });
            }

            param.shard = shard.iter().copied().collect();
            param.full = None;
        }

        Ok(())
    }

    /// Replaces every local shard with this worker's slice of the full tensors in `state`.
    ///
    /// The map is expected to hold the same keys `full_state_dict` produces, shared aliases
    /// aside. No collective takes place since every worker reads the whole map.
    pub fn load_full_state_dict(&mut self, state: &BTreeMap<String, ArrayD<f32>>) -> Result<()> {
        self.check_state(self.root, &[Idle])?;

        for i in 0..self.params.len() {
            let pid = ParamId(i);
            let param = &self.params[i];
            let keys = self.state_keys(pid, param.owner, &param.name);
            let shapes = match &param.flat {
                Some(group) => group.shapes().to_vec(),
                None => vec![param.orig_shape.clone()],
            };

            let mut flat = Vec::with_capacity(param.numel);
            for (key, shape) in keys.iter().zip(&shapes) {
                let tensor = state.get(key).ok_or_else(|| ShardErr::UnknownParam {
                    unit: self.units[param.owner.0].path.clone(),
                    name: key.clone(),
                })?;

                if tensor.shape() != shape.as_slice() {
                    return Err(ShardErr::SizeMismatch {
                        what: "full state dict",
                        got: tensor.len(),
                        expected: shape.iter().product(),
                    });
                }

                flat.extend(tensor.iter().copied());
            }

            let shard = if param.is_sharded {
                shard_tensor(&flat, self.rank, self.world_size).0
            } else {
                flat
            };

            let param = &mut self.params[i];
            param.shard = shard;
            param.full = None;
        }

        debug!("loaded a full state dict of {} entries", state.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use comms::Solo;
    use ndarray::{ArrayD, IxDyn, array};

    use crate::{ModelBuilder, UnitConfig};

    #[test]
    fn state_dicts_of_a_single_worker_keep_the_original_shapes() {
        let mut builder = ModelBuilder::new();
        let root = builder.root(UnitConfig::default());
        let child = builder.unit(root, "block", UnitConfig::default());
        builder.param(root, "bias", array![1.0, 2.0].into_dyn());
        builder.flat_param(
            child,
            "flat",
            vec![
                ("weight".to_string(), array![[1.0, 2.0], [3.0, 4.0]].into_dyn()),
                ("scale".to_string(), array![5.0].into_dyn()),
            ],
        );

        let mut model = builder.build(Solo).unwrap();
        let full = model.full_state_dict().unwrap();

        let keys: Vec<_> = full.keys().cloned().collect();
        assert_eq!(keys, ["bias", "block.scale", "block.weight"]);
        assert_eq!(full["block.weight"], array![[1.0, 2.0], [3.0, 4.0]].into_dyn());

        let local = model.local_state_dict().unwrap();
        assert_eq!(local["block.flat"].shape(), &[5]);
        assert_eq!(local["bias"], array![1.0, 2.0].into_dyn());
    }

    #[test]
    fn loading_a_full_state_dict_replaces_the_shards() {
        let mut builder = ModelBuilder::new();
        let root = builder.root(UnitConfig::default());
        let weight = builder.param(root, "weight", ArrayD::zeros(IxDyn(&[2, 2])));

        let mut model = builder.build(Solo).unwrap();
        let mut state = model.full_state_dict().unwrap();
        state.insert("weight".into(), array![[1.0, 2.0], [3.0, 4.0]].into_dyn());

        model.load_full_state_dict(&state).unwrap();
        assert_eq!(model.param(weight).unwrap().shard(), &[1.0, 2.0, 3.0, 4.0]);

        state.insert("weight".into(), array![1.0].into_dyn());
        assert!(model.load_full_state_dict(&state).is_err());
    }

    #[test]
    fn summoned_modifications_are_kept_unless_volatile() {
        let mut builder = ModelBuilder::new();
        let root = builder.root(UnitConfig::default());
        let weight = builder.param(root, "weight", array![1.0, 2.0].into_dyn());
        let mut model = builder.build(Solo).unwrap();

        model
            .summon_full_params(root, true, true, |model| {
                model.param_mut(weight)?.data_mut()?.fill(0.0);
                Ok(())
            })
            .unwrap();

        // A single worker's shard is the full tensor, so the write is visible regardless.
        assert_eq!(model.param(weight).unwrap().shard(), &[0.0, 0.0]);
        assert!(!model.param(weight).unwrap().has_full());
        assert_eq!(model.unit(root).unwrap().state(), crate::TrainingState::Idle);
    }
}
