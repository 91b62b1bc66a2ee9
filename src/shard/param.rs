use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};

use crate::{Result, ShardErr, UnitId, shard::FlatParamGroup};

/// The index of a parameter inside a `ShardedModel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub(crate) usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Which storage the parameter's data currently points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum View {
    Shard,
    Full,
}

/// A gradient delivered for a parameter.
#[derive(Debug, Clone)]
pub struct Grad {
    pub values: ArrayD<f32>,
    /// Whether the gradient itself is part of a graph, gradients like these are rejected.
    pub requires_grad: bool,
}

impl Grad {
    /// Creates a gradient that is itself tracked for gradients.
    pub fn tracked(values: ArrayD<f32>) -> Self {
        Self {
            values,
            requires_grad: true,
        }
    }
}

impl From<ArrayD<f32>> for Grad {
    fn from(values: ArrayD<f32>) -> Self {
        Self {
            values,
            requires_grad: false,
        }
    }
}

/// The post backward hook of a parameter, armed once per step by the first forward
/// that uses it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Hook {
    /// The unit the reduction runs on, the parameter's canonical owner.
    pub(crate) unit: UnitId,
    /// Forward uses still waiting for their gradient contribution.
    pub(crate) pending: usize,
}

/// The sharded record of a single trainable tensor.
#[derive(Debug)]
pub struct ShardedParam {
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) owner: UnitId,
    pub(crate) orig_shape: Vec<usize>,
    pub(crate) numel: usize,
    pub(crate) is_sharded: bool,
    pub(crate) requires_grad: bool,
    pub(crate) padding: usize,
    pub(crate) shard: Vec<f32>,
    pub(crate) full: Option<ArrayD<f32>>,
    pub(crate) view: View,
    pub(crate) grad: Option<Grad>,
    pub(crate) saved_grad_shard: Option<Vec<f32>>,
    pub(crate) hook: Option<Hook>,
    pub(crate) shared: bool,
    pub(crate) flat: Option<FlatParamGroup>,
    pub(crate) reductions: usize,
}

impl ShardedParam {
    /// The parameter's name inside its owning unit.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parameter's fully qualified name.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn owner(&self) -> UnitId {
        self.owner
    }

    pub fn orig_shape(&self) -> &[usize] {
        &self.orig_shape
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn is_sharded(&self) -> bool {
        self.is_sharded
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// The amount of zeros padding this worker's shard.
    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Whether the parameter is referenced by more than one unit.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn flat_group(&self) -> Option<&FlatParamGroup> {
        self.flat.as_ref()
    }

    /// This worker's slice of the parameter, padding included.
    ///
    /// For an unsharded parameter the shard is the whole flattened tensor.
    pub fn shard(&self) -> &[f32] {
        &self.shard
    }

    /// Whether the full tensor is currently materialized.
    pub fn has_full(&self) -> bool {
        self.full.is_some()
    }

    /// The amount of gradient reductions this parameter went through in the current step.
    pub fn reductions(&self) -> usize {
        self.reductions
    }

    /// The parameter's externally visible gradient, if any.
    pub fn grad(&self) -> Option<&ArrayD<f32>> {
        self.grad.as_ref().map(|g| &g.values)
    }

    /// The data the parameter currently exposes.
    ///
    /// Inside a gather window this is the full tensor with its original shape, otherwise
    /// it's the local shard. An unsharded parameter always exposes its original shape.
    pub fn data(&self) -> Result<ArrayViewD<'_, f32>> {
        if let (View::Full, Some(full)) = (self.view, &self.full) {
            return Ok(full.view());
        }

        let shape = self.shard_shape();
        Ok(ArrayViewD::from_shape(IxDyn(&shape), &self.shard)?)
    }

    /// Mutably borrows the data the parameter currently exposes.
    pub fn data_mut(&mut self) -> Result<ArrayViewMutD<'_, f32>> {
        let shape = self.shard_shape();
        if let (View::Full, Some(full)) = (self.view, &mut self.full) {
            return Ok(full.view_mut());
        }

        Ok(ArrayViewMutD::from_shape(IxDyn(&shape), &mut self.shard)?)
    }

    /// Borrows a member of a flattened parameter out of the full tensor.
    pub fn member(&self, name: &str) -> Result<ArrayViewD<'_, f32>> {
        let missing = || ShardErr::UnknownParam {
            unit: self.path.clone(),
            name: name.to_string(),
        };

        let group = self.flat.as_ref().ok_or_else(missing)?;
        let data = self.full_slice()?;
        group.member(data, name).ok_or_else(missing)?
    }

    /// The full tensor's elements in logical order.
    pub(crate) fn full_slice(&self) -> Result<&[f32]> {
        if !self.is_sharded {
            return Ok(&self.shard);
        }

        self.full
            .as_ref()
            .and_then(|full| full.as_slice())
            .ok_or_else(|| ShardErr::FullParamsMissing {
                param: self.path.clone(),
            })
    }

    fn shard_shape(&self) -> Vec<usize> {
        if self.is_sharded {
            vec![self.shard.len()]
        } else {
            self.orig_shape.clone()
        }
    }
}
