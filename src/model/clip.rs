use comms::{Collective, ReduceOp};
use log::debug;

use super::ShardedModel;
use crate::{Result, ShardErr, state::TrainingState};

impl<C: Collective> ShardedModel<C> {
    /// Clips the norm of every gradient of the model, taken as a single vector.
    ///
    /// Each worker only holds its shards of the gradients, so the local norms are
    /// aggregated across the group before deciding the scaling. Every worker of the group
    /// must call this together, between a finalized backward pass and the optimizer step.
    ///
    /// # Arguments
    /// * `max_norm` - The maximum norm allowed.
    /// * `norm_type` - The `p` of the p-norm, `f32::INFINITY` for the maximum norm.
    ///
    /// # Returns
    /// The total norm of the gradients before clipping.
    pub fn clip_grad_norm(&mut self, max_norm: f32, norm_type: f32) -> Result<f32> {
        self.check_state(self.root, &[TrainingState::Idle])?;

        if norm_type <= 0.0 || norm_type.is_nan() {
            return Err(ShardErr::Config(format!("invalid norm type {norm_type}")));
        }

        let grads = self.params.iter().filter_map(|p| p.grad.as_ref());
        let total = if norm_type == f32::INFINITY {
            let mut local = [grads.flat_map(|g| g.values.iter()).fold(0.0f32, |m, g| m.max(g.abs()))];
            self.collective.all_reduce(ReduceOp::Max, &mut local)?;
            local[0]
        } else {
            let mut local = [grads
                .flat_map(|g| g.values.iter())
                .map(|g| g.abs().powf(norm_type))
                .sum::<f32>()];
            self.collective.all_reduce(ReduceOp::Sum, &mut local)?;
            local[0].powf(norm_type.recip())
        };

        let coef = max_norm / (total + 1e-6);
        if coef < 1.0 {
            for grad in self.params.iter_mut().filter_map(|p| p.grad.as_mut()) {
                grad.values.par_mapv_inplace(|g| g * coef);
            }

            debug!("clipped gradients of norm {total} by {coef}");
        }

        Ok(total)
    }
}
