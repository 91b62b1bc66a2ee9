use std::ops::{Deref, DerefMut};

use comms::Collective;
use log::{debug, warn};

use super::ShardedModel;
use crate::{Result, state::TrainingState};

/// A scope in which gradients are accumulated locally instead of being reduced.
///
/// It turns gradient synchronization off for every unit of the tree and turns it back on
/// to the previous values when dropped, whatever way the scope ends. The model is reached
/// through the scope while it lives.
pub struct NoSync<'a, C: Collective> {
    model: &'a mut ShardedModel<C>,
    saved: Vec<bool>,
}

impl<C: Collective> ShardedModel<C> {
    /// Opens a no sync scope.
    ///
    /// Passes run inside the scope keep their full shaped gradients attached to the
    /// parameters without issuing any collective, the first synchronized pass after it
    /// reduces everything that was accumulated.
    ///
    /// # Returns
    /// The scope, or an `InvalidState` error if the root is in the middle of a step.
    pub fn no_sync(&mut self) -> Result<NoSync<'_, C>> {
        self.check_state(self.root, &[TrainingState::Idle])?;

        let saved = self.units.iter().map(|u| u.require_grad_sync).collect();
        for unit in self.units.iter_mut() {
            unit.require_grad_sync = false;
        }

        debug!("entered a no sync scope");
        Ok(NoSync { model: self, saved })
    }
}

impl<C: Collective> Deref for NoSync<'_, C> {
    type Target = ShardedModel<C>;

    fn deref(&self) -> &Self::Target {
        self.model
    }
}

impl<C: Collective> DerefMut for NoSync<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.model
    }
}

impl<C: Collective> Drop for NoSync<'_, C> {
    fn drop(&mut self) {
        for (unit, &sync) in self.model.units.iter_mut().zip(&self.saved) {
            if unit.require_grad_sync {
                warn!(unit = unit.path.as_str(); "gradient synchronization was turned on inside a no sync scope");
            }

            unit.require_grad_sync = sync;
        }

        debug!("left a no sync scope");
    }
}
