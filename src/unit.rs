use crate::{ParamId, Result, state::TrainingState};

/// The index of a unit inside a `ShardedModel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub(crate) usize);

impl UnitId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A node of the model tree owning a subset of the parameters.
#[derive(Debug)]
pub struct Unit {
    pub(crate) path: String,
    pub(crate) parent: Option<UnitId>,
    pub(crate) children: Vec<UnitId>,
    /// The parameters this unit is the canonical owner of.
    pub(crate) params: Vec<ParamId>,
    /// Parameters owned by a sibling unit that this unit uses too.
    pub(crate) shared: Vec<ParamId>,
    pub(crate) state: TrainingState,
    pub(crate) is_root: bool,
    pub(crate) require_grad_sync: bool,
    pub(crate) reshard_after_forward: bool,
    pub(crate) predivide: f32,
    pub(crate) postdivide: f32,
    pub(crate) pre_backward_done: bool,
}

impl Unit {
    /// The unit's dotted path from the root, empty for the root itself.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<UnitId> {
        self.parent
    }

    pub fn children(&self) -> &[UnitId] {
        &self.children
    }

    pub fn params(&self) -> &[ParamId] {
        &self.params
    }

    pub fn shared_params(&self) -> &[ParamId] {
        &self.shared
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn require_grad_sync(&self) -> bool {
        self.require_grad_sync
    }

    pub fn reshard_after_forward(&self) -> bool {
        self.reshard_after_forward
    }

    /// The gradient divide factors, before and after the reduction.
    pub fn divide_factors(&self) -> (f32, f32) {
        (self.predivide, self.postdivide)
    }

    /// Every parameter the unit uses, owned ones first.
    pub(crate) fn uses(&self) -> Vec<ParamId> {
        self.params.iter().chain(&self.shared).copied().collect()
    }

    pub(crate) fn assert_state(&self, expected: &[TrainingState]) -> Result<()> {
        crate::state::assert_state(&self.path, self.state, expected)
    }
}
