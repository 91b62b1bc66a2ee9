//! Optimizers applied to each worker's shards after a finalized backward pass.

mod adam;
mod gradient_descent;
mod momentum;

pub use adam::Adam;
pub use gradient_descent::GradientDescent;
pub use momentum::GradientDescentWithMomentum;

use crate::Result;

/// Defines the strategy for updating a parameter shard based on its reduced gradient.
///
/// An instance holds the state of a single parameter, sized to this worker's shard.
pub trait Optimizer {
    /// Updates `params` in place using `grad`.
    ///
    /// # Arguments
    /// * `grad` - The reduced gradient shard.
    /// * `params` - The parameter shard to update.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `grad` and `params` differ in length.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;
}

pub(crate) fn check_lens(grad: &[f32], params: &[f32]) -> Result<()> {
    if grad.len() != params.len() {
        return Err(crate::ShardErr::SizeMismatch {
            what: "optimizer update",
            got: grad.len(),
            expected: params.len(),
        });
    }

    Ok(())
}
