use comms::{Collective, ReduceOp};
use log::trace;

use super::ShardedModel;
use crate::{
    ParamId, Result, ShardErr, UnitId,
    shard::{View, flatten_and_pad},
    state::TrainingState::{BackwardPost, BackwardPre, Idle},
};

impl<C: Collective> ShardedModel<C> {
    /// Reduces the complete gradient of `pid` in the context of its owner `id`.
    ///
    /// A shared parameter may be complete before its owner saw its pre backward hook, the
    /// owner then moves straight to `BACKWARD_POST`.
    ///
    /// The averaged gradient is reduce-scattered across the group and the resulting shard
    /// is accumulated into the parameter's saved gradient shard. Inside a no sync scope the
    /// full gradient is left attached instead and no collective is issued.
    pub(crate) fn post_backward(&mut self, pid: ParamId, id: UnitId) -> Result<()> {
        if self.params[pid.0].shared {
            self.check_state(id, &[Idle, BackwardPre, BackwardPost])?;
        } else {
            self.check_state(id, &[BackwardPre, BackwardPost])?;
        }
        self.units[id.0].state = BackwardPost;

        let param = &self.params[pid.0];
        let Some(grad) = &param.grad else {
            return Ok(());
        };

        if grad.requires_grad {
            return Err(ShardErr::GradRequiresGrad {
                param: param.path.clone(),
            });
        }

        let unit = &self.units[id.0];
        let (sync, predivide, postdivide) = (unit.require_grad_sync, unit.predivide, unit.postdivide);

        // Inside a no sync scope the full parameters of units that keep them after
        // forward are kept too, they won't change before the next forward.
        if sync || unit.reshard_after_forward {
            self.free_full(&[pid]);
        }

        let param = &mut self.params[pid.0];
        param.view = View::Shard;

        if !sync {
            return Ok(());
        }

        let Some(mut grad) = param.grad.take() else {
            return Ok(());
        };

        if predivide > 1.0 {
            grad.values /= predivide;
        }

        if !param.is_sharded {
            if postdivide > 1.0 {
                grad.values /= postdivide;
            }

            param.grad = Some(grad);
            param.reductions += 1;
            return Ok(());
        }

        let padded = flatten_and_pad(&grad.values, self.world_size);
        drop(grad);

        let mut reduced = self
            .collective
            .reduce_scatter(ReduceOp::Sum, &padded, self.world_size)?;

        self.post_reduction(pid, id, &mut reduced, postdivide)
    }

    /// Scales a reduced gradient shard and accumulates it into the parameter's saved shard.
    fn post_reduction(
        &mut self,
        pid: ParamId,
        id: UnitId,
        reduced: &mut [f32],
        postdivide: f32,
    ) -> Result<()> {
        self.check_state(id, &[BackwardPost])?;

        if postdivide > 1.0 {
            reduced.iter_mut().for_each(|g| *g /= postdivide);
        }

        let param = &mut self.params[pid.0];
        match &mut param.saved_grad_shard {
            Some(saved) if saved.len() == reduced.len() => {
                saved.iter_mut().zip(reduced.iter()).for_each(|(s, r)| *s += r);
            }
            Some(saved) => {
                return Err(ShardErr::SizeMismatch {
                    what: "reduced gradient shard",
                    got: reduced.len(),
                    expected: saved.len(),
                });
            }
            None => param.saved_grad_shard = Some(reduced.to_vec()),
        }

        param.reductions += 1;
        trace!(param = param.path.as_str(); "reduced gradient shard of {} elements", reduced.len());

        Ok(())
    }
}
