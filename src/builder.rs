use comms::Collective;
use log::{debug, info};
use ndarray::{Array1, ArrayD};

use crate::{
    ParamId, Result, ShardErr, UnitConfig, UnitId,
    model::{SharedAlias, ShardedModel},
    shard::{FlatParamGroup, ShardedParam, View, predivide_factor, shard_tensor},
    state::TrainingState,
    unit::Unit,
};

struct UnitSpec {
    name: String,
    parent: Option<UnitId>,
    config: UnitConfig,
}

struct ParamSpec {
    unit: UnitId,
    name: String,
    data: ArrayD<f32>,
    requires_grad: bool,
    flat: Option<FlatParamGroup>,
}

struct AliasSpec {
    param: ParamId,
    unit: UnitId,
    name: String,
}

/// Collects the model tree before any sharding takes place.
///
/// The tree is assembled first and only `build` resolves the root, shards the parameters
/// and links the shared ones, so nothing about the tree is inferred during training.
#[derive(Default)]
pub struct ModelBuilder {
    units: Vec<UnitSpec>,
    params: Vec<ParamSpec>,
    aliases: Vec<AliasSpec>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the root unit, the one unit without a parent.
    pub fn root(&mut self, config: UnitConfig) -> UnitId {
        self.push_unit(String::new(), None, config)
    }

    /// Adds a unit nested inside `parent`.
    ///
    /// # Arguments
    /// * `parent` - The enclosing unit.
    /// * `name` - The unit's name, unique among its siblings.
    /// * `config` - The unit's configuration.
    pub fn unit(&mut self, parent: UnitId, name: &str, config: UnitConfig) -> UnitId {
        self.push_unit(name.to_string(), Some(parent), config)
    }

    fn push_unit(&mut self, name: String, parent: Option<UnitId>, config: UnitConfig) -> UnitId {
        self.units.push(UnitSpec {
            name,
            parent,
            config,
        });

        UnitId(self.units.len() - 1)
    }

    /// Registers a trainable parameter owned by `unit`.
    pub fn param(&mut self, unit: UnitId, name: &str, data: ArrayD<f32>) -> ParamId {
        self.push_param(unit, name, data, true, None)
    }

    /// Registers a parameter that doesn't take part in the backward pass.
    pub fn frozen_param(&mut self, unit: UnitId, name: &str, data: ArrayD<f32>) -> ParamId {
        self.push_param(unit, name, data, false, None)
    }

    /// Registers several tensors as a single flat backing parameter of `unit`.
    ///
    /// # Arguments
    /// * `unit` - The owning unit.
    /// * `name` - The name of the backing parameter.
    /// * `members` - The named tensors, concatenated in order.
    pub fn flat_param(
        &mut self,
        unit: UnitId,
        name: &str,
        members: Vec<(String, ArrayD<f32>)>,
    ) -> ParamId {
        let (group, flat) = FlatParamGroup::flatten(members);
        self.push_param(unit, name, Array1::from(flat).into_dyn(), true, Some(group))
    }

    fn push_param(
        &mut self,
        unit: UnitId,
        name: &str,
        data: ArrayD<f32>,
        requires_grad: bool,
        flat: Option<FlatParamGroup>,
    ) -> ParamId {
        self.params.push(ParamSpec {
            unit,
            name: name.to_string(),
            data,
            requires_grad,
            flat,
        });

        ParamId(self.params.len() - 1)
    }

    /// Makes `unit` use the already registered `param` under `name`.
    ///
    /// The parameter's owner stays the canonical one: it's sharded, gathered and reduced
    /// once no matter how many units reference it. Sharing is only allowed between units
    /// that don't nest each other.
    pub fn share(&mut self, param: ParamId, unit: UnitId, name: &str) {
        self.aliases.push(AliasSpec {
            param,
            unit,
            name: name.to_string(),
        });
    }

    /// Shards every parameter and resolves the tree.
    ///
    /// # Arguments
    /// * `collective` - The process group this worker belongs to.
    ///
    /// # Returns
    /// The sharded model or a `Config` error if the tree is malformed.
    pub fn build<C: Collective>(self, collective: C) -> Result<ShardedModel<C>> {
        let Self {
            units: unit_specs,
            params: param_specs,
            aliases: alias_specs,
        } = self;

        let rank = collective.rank();
        let world_size = collective.world_size();
        let predivide = predivide_factor(world_size);
        let postdivide = world_size as f32 / predivide;

        let mut units: Vec<Unit> = Vec::with_capacity(unit_specs.len());
        let mut root = None;

        for (i, spec) in unit_specs.into_iter().enumerate() {
            let path = match spec.parent {
                None => {
                    if root.replace(UnitId(i)).is_some() {
                        return Err(ShardErr::Config("the model has more than one root".into()));
                    }
                    String::new()
                }
                Some(parent) => {
                    // Parents are always registered before their children, so the
                    // arena order is a top-down walk of the tree.
                    let Some(parent_unit) = units.get_mut(parent.0) else {
                        return Err(ShardErr::UnknownUnit(parent.0));
                    };

                    parent_unit.children.push(UnitId(i));
                    join_path(&parent_unit.path, &spec.name)
                }
            };

            units.push(Unit {
                path,
                parent: spec.parent,
                children: Vec::new(),
                params: Vec::new(),
                shared: Vec::new(),
                state: TrainingState::Idle,
                is_root: false,
                require_grad_sync: true,
                reshard_after_forward: spec.config.reshard_after_forward,
                predivide,
                postdivide,
                pre_backward_done: false,
            });
        }

        let root = root.ok_or_else(|| ShardErr::Config("the model has no root unit".into()))?;
        units[root.0].is_root = true;
        // The root's full parameters are needed right away by the backward pass.
        units[root.0].reshard_after_forward = false;

        let mut params = Vec::with_capacity(param_specs.len());
        for (i, spec) in param_specs.into_iter().enumerate() {
            let unit = units
                .get_mut(spec.unit.0)
                .ok_or(ShardErr::UnknownUnit(spec.unit.0))?;

            let path = join_path(&unit.path, &spec.name);
            if spec.name.is_empty() {
                return Err(ShardErr::Config(format!(
                    "unit `{}` has a parameter without a name",
                    unit.path
                )));
            }

            unit.params.push(ParamId(i));
            params.push(shard_param(spec, path, rank, world_size));
        }

        check_unique_paths(&params)?;

        let mut aliases = Vec::with_capacity(alias_specs.len());
        for spec in alias_specs {
            let param = params
                .get_mut(spec.param.0)
                .ok_or(ShardErr::UnknownParamId(spec.param.0))?;

            if spec.unit.0 >= units.len() {
                return Err(ShardErr::UnknownUnit(spec.unit.0));
            }

            let owner = param.owner;
            if is_ancestor(&units, owner, spec.unit) || is_ancestor(&units, spec.unit, owner) {
                return Err(ShardErr::Config(format!(
                    "`{}` can only be shared between units that don't nest each other",
                    param.path
                )));
            }

            let unit = &mut units[spec.unit.0];
            if unit.params.is_empty() {
                return Err(ShardErr::Config(format!(
                    "unit `{}` must own at least one parameter to share `{}`",
                    unit.path, param.path
                )));
            }

            param.shared = true;
            unit.shared.push(spec.param);
            aliases.push(SharedAlias {
                param: spec.param,
                unit: spec.unit,
                path: join_path(&unit.path, &spec.name),
                name: spec.name,
            });
        }

        let mut seen: Vec<&str> = params.iter().map(|p| p.path.as_str()).collect();
        for alias in &aliases {
            if seen.contains(&alias.path.as_str()) {
                return Err(ShardErr::DuplicateParam(alias.path.clone()));
            }
            seen.push(&alias.path);
        }

        let local: usize = params.iter().map(|p| p.shard.len()).sum();
        let total: usize = params.iter().map(|p| p.numel).sum();
        info!(
            "built a model of {} units and {} parameters, {local} of {total} elements live on rank {rank}",
            units.len(),
            params.len(),
        );

        Ok(ShardedModel::new(collective, units, params, aliases, root))
    }
}

/// Joins a unit path and a name with a dot, the root's empty path adds nothing.
pub(crate) fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Whether `ancestor` is `unit` or encloses it.
fn is_ancestor(units: &[Unit], ancestor: UnitId, unit: UnitId) -> bool {
    let mut curr = Some(unit);
    while let Some(id) = curr {
        if id == ancestor {
            return true;
        }
        curr = units[id.0].parent;
    }

    false
}

fn check_unique_paths(params: &[ShardedParam]) -> Result<()> {
    for (i, param) in params.iter().enumerate() {
        if params[..i].iter().any(|p| p.path == param.path) {
            return Err(ShardErr::DuplicateParam(param.path.clone()));
        }
    }

    Ok(())
}

/// Replaces a parameter's data with this worker's shard.
fn shard_param(spec: ParamSpec, path: String, rank: usize, world_size: usize) -> ShardedParam {
    let orig_shape = spec.data.shape().to_vec();
    let numel = spec.data.len();
    let flat: Vec<f32> = spec.data.iter().copied().collect();
    let is_sharded = world_size > 1;

    let (shard, padding) = if is_sharded {
        shard_tensor(&flat, rank, world_size)
    } else {
        (flat, 0)
    };

    debug!(
        param = path.as_str();
        "sharded {numel} elements into {} local elements with {padding} padding",
        shard.len()
    );

    ShardedParam {
        name: spec.name,
        path,
        owner: spec.unit,
        orig_shape,
        numel,
        is_sharded,
        requires_grad: spec.requires_grad,
        padding,
        shard,
        full: None,
        view: View::Shard,
        grad: None,
        saved_grad_shard: None,
        hook: None,
        shared: false,
        flat: spec.flat,
        reductions: 0,
    }
}
