//! The sharded model: the unit tree, its parameters and the lifecycle driving them.
//!
//! * `gather` materializes and frees full parameters.
//! * `hooks` runs the forward and backward lifecycle and the root's finalization.
//! * `reduce` is the gradient reduction pipeline fired once a parameter's gradient is ready.
//! * `no_sync`, `summon`, `clip` and `step` are the scoped overrides and utilities
//!   built on top of them.

mod clip;
mod gather;
mod hooks;
mod no_sync;
mod reduce;
mod step;
mod summon;

use comms::Collective;
use log::error;

pub use no_sync::NoSync;

use crate::{
    ParamId, Result, ShardErr, UnitId,
    builder::join_path,
    shard::ShardedParam,
    state::TrainingState,
    unit::Unit,
};

/// A parameter used by a unit other than its canonical owner.
#[derive(Debug, Clone)]
pub struct SharedAlias {
    pub(crate) param: ParamId,
    pub(crate) unit: UnitId,
    pub(crate) path: String,
    pub(crate) name: String,
}

impl SharedAlias {
    pub fn param(&self) -> ParamId {
        self.param
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// The fully qualified name the sharing unit knows the parameter by.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The name the sharing unit knows the parameter by.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A tree of units whose parameters are sharded across the workers of a group.
///
/// Every worker of the group holds its own `ShardedModel` built from the same tree and
/// drives it through the same sequence of calls, which keeps the sequence of collectives
/// identical across workers.
pub struct ShardedModel<C> {
    pub(crate) collective: C,
    pub(crate) rank: usize,
    pub(crate) world_size: usize,
    pub(crate) units: Vec<Unit>,
    pub(crate) params: Vec<ShardedParam>,
    pub(crate) aliases: Vec<SharedAlias>,
    pub(crate) root: UnitId,
    pub(crate) grad_enabled: bool,
    pub(crate) callback_queued: bool,
    pub(crate) in_step: bool,
}

impl<C: Collective> ShardedModel<C> {
    pub(crate) fn new(
        collective: C,
        units: Vec<Unit>,
        params: Vec<ShardedParam>,
        aliases: Vec<SharedAlias>,
        root: UnitId,
    ) -> Self {
        Self {
            rank: collective.rank(),
            world_size: collective.world_size(),
            collective,
            units,
            params,
            aliases,
            root,
            grad_enabled: true,
            callback_queued: false,
            in_step: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn root(&self) -> UnitId {
        self.root
    }

    pub fn collective(&self) -> &C {
        &self.collective
    }

    /// Consumes the model and hands back its process group.
    pub fn into_collective(self) -> C {
        self.collective
    }

    pub fn unit(&self, id: UnitId) -> Result<&Unit> {
        self.units.get(id.0).ok_or(ShardErr::UnknownUnit(id.0))
    }

    pub(crate) fn unit_mut(&mut self, id: UnitId) -> Result<&mut Unit> {
        self.units.get_mut(id.0).ok_or(ShardErr::UnknownUnit(id.0))
    }

    /// Iterates every unit, parents before their children.
    pub fn units(&self) -> impl Iterator<Item = (UnitId, &Unit)> {
        self.units.iter().enumerate().map(|(i, u)| (UnitId(i), u))
    }

    pub fn param(&self, id: ParamId) -> Result<&ShardedParam> {
        self.params.get(id.0).ok_or(ShardErr::UnknownParamId(id.0))
    }

    pub fn param_mut(&mut self, id: ParamId) -> Result<&mut ShardedParam> {
        self.params.get_mut(id.0).ok_or(ShardErr::UnknownParamId(id.0))
    }

    /// Iterates every parameter in registration order.
    pub fn params(&self) -> impl Iterator<Item = (ParamId, &ShardedParam)> {
        self.params.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    pub fn aliases(&self) -> &[SharedAlias] {
        &self.aliases
    }

    /// Looks a parameter up by its fully qualified name, shared aliases included.
    pub fn find_param(&self, path: &str) -> Option<ParamId> {
        self.params
            .iter()
            .position(|p| p.path == path)
            .map(ParamId)
            .or_else(|| {
                self.aliases
                    .iter()
                    .find(|alias| alias.path == path)
                    .map(|alias| alias.param)
            })
    }

    /// Enables or disables the registration of backward hooks during forward.
    ///
    /// With gradients disabled a forward is an evaluation pass: it gathers and frees
    /// parameters but never arms a reduction.
    pub fn set_grad_enabled(&mut self, enabled: bool) {
        self.grad_enabled = enabled;
    }

    pub fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    /// Returns `id` and every unit nested inside it, parents first.
    pub fn subtree(&self, id: UnitId) -> Result<Vec<UnitId>> {
        self.unit(id)?;

        let mut inside = vec![false; self.units.len()];
        inside[id.0] = true;
        let mut out = vec![id];

        for (i, unit) in self.units.iter().enumerate().skip(id.0 + 1) {
            if unit.parent.is_some_and(|p| inside[p.0]) {
                inside[i] = true;
                out.push(UnitId(i));
            }
        }

        Ok(out)
    }

    /// Overrides the gradient divide factors of `id`.
    ///
    /// # Arguments
    /// * `id` - The unit to update.
    /// * `pre` - The factor gradients are divided by before the reduction.
    /// * `post` - The factor the reduced gradients are divided by.
    /// * `recursive` - Whether to also update every unit nested inside `id`.
    pub fn set_gradient_divide_factors(
        &mut self,
        id: UnitId,
        pre: f32,
        post: f32,
        recursive: bool,
    ) -> Result<()> {
        self.check_state(id, &[TrainingState::Idle])?;

        let targets = if recursive { self.subtree(id)? } else { vec![id] };
        for target in targets {
            let unit = self.unit_mut(target)?;
            unit.predivide = pre;
            unit.postdivide = post;
        }

        Ok(())
    }

    /// The state dict keys of `pid` as seen from `unit` under `name`.
    ///
    /// A plain parameter has a single key, a flattened one has one per member, all of
    /// them relative to the unit's path.
    pub(crate) fn state_keys(&self, pid: ParamId, unit: UnitId, name: &str) -> Vec<String> {
        let prefix = &self.units[unit.0].path;
        match &self.params[pid.0].flat {
            Some(group) => group.names().iter().map(|m| join_path(prefix, m)).collect(),
            None => vec![join_path(prefix, name)],
        }
    }

    /// Checks the state of `id`, reporting the mismatch on the first rank.
    pub(crate) fn check_state(&self, id: UnitId, expected: &[TrainingState]) -> Result<()> {
        self.unit(id)?.assert_state(expected).inspect_err(|e| {
            if self.rank == 0 {
                error!("{e}");
            }
        })
    }
}
