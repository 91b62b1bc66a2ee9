use comms::Collective;
use log::debug;
use ndarray::{ArrayD, IxDyn};

use super::ShardedModel;
use crate::{ParamId, Result, ShardErr, UnitId, shard::View, state::TrainingState};

impl<C: Collective> ShardedModel<C> {
    /// Gathers the full parameters of `id`.
    ///
    /// Allowed while the unit is idle or running its forward. A no-op for the parameters
    /// that are already full.
    pub fn rebuild_full_params(&mut self, id: UnitId) -> Result<()> {
        self.check_state(id, &[TrainingState::Idle, TrainingState::Forward])?;
        self.rebuild_full(id)
    }

    /// Frees the full parameters of `id`, a no-op for the ones that are already freed.
    pub fn free_full_params(&mut self, id: UnitId) -> Result<()> {
        self.check_state(id, &[TrainingState::Idle, TrainingState::Forward])?;
        let params = self.unit(id)?.uses();
        self.free_full(&params);
        Ok(())
    }

    /// Materializes the full tensor of every parameter `id` uses and points their data at it.
    ///
    /// The `has_full` state of each parameter is authoritative: a parameter shared with
    /// another unit is gathered once no matter which unit asks first.
    pub(crate) fn rebuild_full(&mut self, id: UnitId) -> Result<()> {
        let uses = self.unit(id)?.uses();
        let mut gathered = 0;

        for pid in uses {
            let param = &mut self.params[pid.0];
            if !param.is_sharded || param.full.is_some() {
                param.view = View::Full;
                continue;
            }

            let mut full = self.collective.all_gather(&param.shard)?;
            if full.len() < param.numel {
                return Err(ShardErr::SizeMismatch {
                    what: "gathered parameter",
                    got: full.len(),
                    expected: param.numel,
                });
            }

            full.truncate(param.numel);
            param.full = Some(ArrayD::from_shape_vec(IxDyn(&param.orig_shape), full)?);
            param.view = View::Full;
            gathered += 1;
        }

        if gathered > 0 {
            debug!(unit = self.units[id.0].path.as_str(); "gathered {gathered} full parameters");
        }

        Ok(())
    }

    /// Points the data of every parameter `id` uses at its already gathered full tensor.
    pub(crate) fn use_full_params(&mut self, id: UnitId) -> Result<()> {
        for pid in self.unit(id)?.uses() {
            let param = &mut self.params[pid.0];
            if param.is_sharded && param.full.is_none() {
                return Err(ShardErr::FullParamsMissing {
                    param: param.path.clone(),
                });
            }

            param.view = View::Full;
        }

        Ok(())
    }

    /// Releases the full tensors of `params` and points their data back at the shards.
    pub(crate) fn free_full(&mut self, params: &[ParamId]) {
        for &pid in params {
            let param = &mut self.params[pid.0];
            if param.full.take().is_some() {
                debug!(param = param.path.as_str(); "freed full parameter");
            }

            param.view = View::Shard;
        }
    }

    /// Points the data of every parameter `id` uses at its shard, keeping any full tensor.
    pub(crate) fn use_shard_view(&mut self, id: UnitId) -> Result<()> {
        for pid in self.unit(id)?.uses() {
            self.params[pid.0].view = View::Shard;
        }

        Ok(())
    }
}
