use comms::Collective;
use rayon::prelude::*;

use super::ShardedModel;
use crate::{Result, ShardErr, optim::Optimizer, shard::View, state::TrainingState};

impl<C: Collective> ShardedModel<C> {
    /// Updates every parameter shard with its reduced gradient.
    ///
    /// Parameters are updated in parallel, each one by its own optimizer. Parameters without
    /// a gradient are left untouched.
    ///
    /// # Arguments
    /// * `optimizers` - One optimizer per parameter, in registration order.
    pub fn step<O>(&mut self, optimizers: &mut [O]) -> Result<()>
    where
        O: Optimizer + Send,
    {
        self.check_state(self.root, &[TrainingState::Idle])?;

        if optimizers.len() != self.params.len() {
            return Err(ShardErr::SizeMismatch {
                what: "optimizers",
                got: optimizers.len(),
                expected: self.params.len(),
            });
        }

        self.params
            .par_iter_mut()
            .zip(optimizers.par_iter_mut())
            .try_for_each(|(param, optimizer)| {
                // A full tensor kept around from an earlier forward would go stale.
                param.full = None;
                param.view = View::Shard;

                let Some(grad) = &param.grad else {
                    return Ok(());
                };

                let Some(grad_values) = grad.values.as_slice().filter(|g| g.len() == param.shard.len())
                else {
                    return Err(ShardErr::UnexpectedGradShape {
                        param: param.path.clone(),
                        got: grad.values.shape().to_vec(),
                        full: param.orig_shape.clone(),
                        shard: param.shard.len(),
                    });
                };

                optimizer.update_params(grad_values, &mut param.shard)
            })
    }

    /// Drops every gradient, reduced or still accumulating.
    pub fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.grad = None;
            param.saved_grad_shard = None;
        }
    }
}
