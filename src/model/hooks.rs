use comms::Collective;
use log::{debug, trace};

use super::ShardedModel;
use crate::{
    ParamId, Result, ShardErr, UnitId,
    shard::{Grad, Hook},
    state::TrainingState::{self, BackwardPost, BackwardPre, Forward, Idle},
};

impl<C: Collective> ShardedModel<C> {
    /// Runs the forward of unit `id`.
    ///
    /// The unit's full parameters are gathered for the duration of `body`, which may read
    /// them through `param(..).data()` and run the forward of nested units. With gradients
    /// enabled, every parameter the unit uses gets one more pending gradient contribution
    /// that must later be delivered through `accumulate_grad`.
    ///
    /// The root only starts a forward between steps, nested units may also be run again
    /// while the backward pass is in progress.
    ///
    /// # Arguments
    /// * `id` - The unit to run.
    /// * `body` - The unit's computation.
    ///
    /// # Returns
    /// Whatever `body` returns.
    pub fn forward<T, F>(&mut self, id: UnitId, body: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let resume = match self.unit(id)?.state {
            state @ (BackwardPre | BackwardPost) => state,
            _ => Idle,
        };

        if self.unit(id)?.is_root {
            self.check_state(id, &[Idle])?;
            if self.grad_enabled && !self.in_step {
                self.begin_step();
            }
        } else {
            self.check_state(id, &[Idle, BackwardPre, BackwardPost])?;
        }

        self.unit_mut(id)?.state = Forward;
        self.rebuild_full(id)?;

        if self.grad_enabled {
            self.register_post_backward_hooks(id);
        }

        let out = body(self)?;

        let unit = self.unit(id)?;
        if unit.reshard_after_forward {
            let params = unit.uses();
            self.free_full(&params);
        }

        self.use_shard_view(id)?;
        self.unit_mut(id)?.state = resume;

        Ok(out)
    }

    fn begin_step(&mut self) {
        self.in_step = true;
        for param in self.params.iter_mut() {
            param.reductions = 0;
        }
    }

    /// Arms the post backward hook of every trainable parameter `id` uses.
    ///
    /// A hook is armed once per step by the first unit that uses the parameter, every
    /// further use only adds to its pending contributions. The reduction always runs on
    /// the parameter's canonical owner, whichever unit armed it.
    fn register_post_backward_hooks(&mut self, id: UnitId) {
        for pid in self.units[id.0].uses() {
            let param = &mut self.params[pid.0];
            if !param.requires_grad {
                continue;
            }

            match &mut param.hook {
                Some(hook) => hook.pending += 1,
                None => {
                    param.hook = Some(Hook {
                        unit: param.owner,
                        pending: 1,
                    })
                }
            }
        }
    }

    /// Runs the pre backward hook of unit `id`.
    ///
    /// It must be called before any gradient of the unit's parameters is delivered and may
    /// be called again for every output of the unit. Each call makes sure the full
    /// parameters are in place, the gradient preparation only runs on the first one of
    /// the step.
    pub fn pre_backward(&mut self, id: UnitId) -> Result<()> {
        let unit = self.unit(id)?;
        if unit.is_root {
            self.queue_wait_for_post_backward()?;
        }

        if self.unit(id)?.reshard_after_forward {
            self.rebuild_full(id)?;
        } else {
            self.use_full_params(id)?;
        }

        if !self.units[id.0].pre_backward_done {
            self.units[id.0].pre_backward_done = true;
            self.check_state(id, &[Idle, BackwardPre])?;
            self.prep_grads_for_backward(id)?;
        }

        let unit = self.unit_mut(id)?;
        if unit.state == Idle {
            unit.state = BackwardPre;
        }

        self.check_state(id, &[BackwardPre, BackwardPost])
    }

    /// Queues the root's finalization, once per backward pass.
    fn queue_wait_for_post_backward(&mut self) -> Result<()> {
        if !self.callback_queued {
            self.check_state(self.root, &[Idle])?;
            self.callback_queued = true;
        }

        Ok(())
    }

    /// Prepares the gradients of the unit's parameters for a new backward pass.
    ///
    /// A full shaped gradient is left in place to keep accumulating on it, a shard shaped
    /// one is moved aside so the upcoming reduction accumulates onto it.
    fn prep_grads_for_backward(&mut self, id: UnitId) -> Result<()> {
        for pid in self.units[id.0].uses() {
            let param = &mut self.params[pid.0];
            let Some(grad) = &param.grad else {
                continue;
            };

            let shape = grad.values.shape();
            if shape == param.orig_shape.as_slice() {
                continue;
            }

            if shape.len() == 1 && shape[0] == param.shard.len() {
                let grad = param.grad.take().map(|g| g.values.iter().copied().collect());
                param.saved_grad_shard = grad;
                continue;
            }

            return Err(ShardErr::UnexpectedGradShape {
                param: param.path.clone(),
                got: shape.to_vec(),
                full: param.orig_shape.clone(),
                shard: param.shard.len(),
            });
        }

        Ok(())
    }

    /// Delivers one gradient contribution for a forward use of `pid`.
    ///
    /// Contributions are summed into the parameter's full shaped gradient. Once every
    /// forward use of the step has delivered its contribution the parameter's gradient is
    /// complete and gets reduced. A `None` contribution stands for a use that produced no
    /// gradient.
    ///
    /// # Arguments
    /// * `pid` - The parameter the contribution belongs to.
    /// * `grad` - The contribution, shaped like the full parameter.
    pub fn accumulate_grad(&mut self, pid: ParamId, grad: Option<Grad>) -> Result<()> {
        let param = self.param_mut(pid)?;
        let Some(hook) = param.hook.filter(|h| h.pending > 0) else {
            return Err(ShardErr::HookNotArmed {
                param: param.path.clone(),
            });
        };

        if let Some(grad) = grad {
            if grad.values.shape() != param.orig_shape.as_slice() {
                return Err(ShardErr::UnexpectedGradShape {
                    param: param.path.clone(),
                    got: grad.values.shape().to_vec(),
                    full: param.orig_shape.clone(),
                    shard: param.shard.len(),
                });
            }

            match &mut param.grad {
                Some(acc) if acc.values.shape() == grad.values.shape() => {
                    acc.values += &grad.values;
                    acc.requires_grad |= grad.requires_grad;
                }
                Some(acc) => {
                    return Err(ShardErr::UnexpectedGradShape {
                        param: param.path.clone(),
                        got: acc.values.shape().to_vec(),
                        full: param.orig_shape.clone(),
                        shard: param.shard.len(),
                    });
                }
                None => param.grad = Some(grad),
            }
        }

        let pending = hook.pending - 1;
        param.hook = Some(Hook { pending, ..hook });
        trace!(param = param.path.as_str(); "{pending} gradient contributions pending");

        if pending == 0 {
            self.post_backward(pid, hook.unit)?;
        }

        Ok(())
    }

    /// Runs a backward pass.
    ///
    /// `body` plays the part of the graph engine: it calls `pre_backward` on every unit
    /// whose outputs receive a gradient, outermost first, and delivers the gradient
    /// contributions of the parameters. Once `body` returns, the root's finalization runs
    /// if the root's pre backward hook queued it.
    pub fn backward<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let out = body(self)?;
        if self.callback_queued {
            self.wait_for_post_backward()?;
        }

        Ok(out)
    }

    /// Finalizes the backward pass across the whole tree.
    fn wait_for_post_backward(&mut self) -> Result<()> {
        let root = self.root;
        let sync = self.units[root.0].require_grad_sync;

        self.check_state(root, &[BackwardPre, BackwardPost])?;

        // Only owned parameters count, shared ones are reduced on their owner.
        let owns_trainable: Vec<bool> = self
            .units
            .iter()
            .map(|u| u.params.iter().any(|p| self.params[p.0].requires_grad))
            .collect();

        let mut subtree_trainable = owns_trainable.clone();
        for i in (0..self.units.len()).rev() {
            if let Some(parent) = self.units[i].parent
                && subtree_trainable[i]
            {
                subtree_trainable[parent.0] = true;
            }
        }

        for i in 0..self.units.len() {
            let id = UnitId(i);
            self.finalize_params(id, sync)?;

            let expected: &[TrainingState] = match (subtree_trainable[i], owns_trainable[i]) {
                (true, true) => &[BackwardPost],
                (true, false) => &[BackwardPre],
                // Without trainable parameters the unit may not even have seen its
                // pre backward hook.
                (false, _) => &[BackwardPre, Idle],
            };

            self.check_state(id, expected)?;

            let unit = &mut self.units[i];
            unit.pre_backward_done = false;
            unit.state = Idle;
        }

        self.callback_queued = false;
        self.in_step = false;
        debug!("finalized the backward pass of {} units", self.units.len());

        Ok(())
    }

    /// Disarms the hooks of the parameters owned by `id` and exposes their reduced gradients.
    fn finalize_params(&mut self, id: UnitId, sync: bool) -> Result<()> {
        let unit = &self.units[id.0];
        for &pid in &unit.params {
            let param = &mut self.params[pid.0];
            if !param.requires_grad {
                continue;
            }

            if let Some(hook) = param.hook.take()
                && hook.pending > 0
            {
                return Err(ShardErr::PendingGradients {
                    unit: self.units[hook.unit.0].path.clone(),
                    pending: hook.pending,
                });
            }

            // Outside of a synchronized pass the unsharded gradient keeps accumulating.
            if !sync {
                continue;
            }

            if let Some(saved) = param.saved_grad_shard.take() {
                param.grad = Some(Grad::from(ndarray::Array1::from(saved).into_dyn()));
            }
        }

        Ok(())
    }
}
