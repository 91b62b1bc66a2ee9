use super::{Optimizer, check_lens};
use crate::Result;

/// Gradient descent with a velocity term per element of the shard.
#[derive(Debug, Clone)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The length of the shard this instance updates.
    /// * `learning_rate` - The coefficient scaling every update.
    /// * `momentum` - How much of the previous velocity is kept.
    pub fn new(len: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_lens(grad, params)?;
        check_lens(grad, &self.velocity)?;

        let (lr, mu) = (self.learning_rate, self.momentum);
        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = mu * *v + g;
                *p -= lr * *v;
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_builds_up_across_updates() {
        let mut optimizer = GradientDescentWithMomentum::new(1, 1.0, 0.5);
        let mut params = [0.0];

        optimizer.update_params(&[1.0], &mut params).unwrap();
        assert_eq!(params, [-1.0]);

        optimizer.update_params(&[1.0], &mut params).unwrap();
        assert_eq!(params, [-2.5]);
    }
}
