use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::{Result, ShardErr};

/// The layout of several named tensors concatenated into one flat backing parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatParamGroup {
    names: Vec<String>,
    shapes: Vec<Vec<usize>>,
    numels: Vec<usize>,
}

impl FlatParamGroup {
    /// Concatenates `members` into a single flat tensor.
    ///
    /// # Arguments
    /// * `members` - The named tensors, in the order they are laid out.
    ///
    /// # Returns
    /// The group's layout and the flat tensor's elements.
    pub fn flatten(members: Vec<(String, ArrayD<f32>)>) -> (Self, Vec<f32>) {
        let total = members.iter().map(|(_, t)| t.len()).sum();
        let mut flat = Vec::with_capacity(total);
        let mut group = Self {
            names: Vec::with_capacity(members.len()),
            shapes: Vec::with_capacity(members.len()),
            numels: Vec::with_capacity(members.len()),
        };

        for (name, tensor) in members {
            flat.extend(tensor.iter().copied());
            group.names.push(name);
            group.shapes.push(tensor.shape().to_vec());
            group.numels.push(tensor.len());
        }

        (group, flat)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn shapes(&self) -> &[Vec<usize>] {
        &self.shapes
    }

    pub fn numels(&self) -> &[usize] {
        &self.numels
    }

    /// The amount of elements of the whole group.
    pub fn numel(&self) -> usize {
        self.numels.iter().sum()
    }

    /// Returns the position of the member named `name` inside the flat tensor.
    fn locate(&self, name: &str) -> Option<(usize, usize)> {
        let idx = self.names.iter().position(|n| n == name)?;
        let start = self.numels[..idx].iter().sum();
        Some((idx, start))
    }

    /// Borrows the member named `name` out of the group's flat full tensor.
    ///
    /// # Returns
    /// `None` if there's no member with that name.
    pub fn member<'a>(&self, flat: &'a [f32], name: &str) -> Option<Result<ArrayViewD<'a, f32>>> {
        let (idx, start) = self.locate(name)?;
        let end = start + self.numels[idx];
        if flat.len() < end {
            return Some(Err(ShardErr::SizeMismatch {
                what: "flat parameter",
                got: flat.len(),
                expected: self.numel(),
            }));
        }

        let view = ArrayViewD::from_shape(IxDyn(&self.shapes[idx]), &flat[start..end]);
        Some(view.map_err(ShardErr::from))
    }

    /// Splits the group's flat full tensor back into its named members.
    pub fn split(&self, flat: &[f32]) -> Result<Vec<(String, ArrayD<f32>)>> {
        if flat.len() != self.numel() {
            return Err(ShardErr::SizeMismatch {
                what: "flat parameter",
                got: flat.len(),
                expected: self.numel(),
            });
        }

        let mut out = Vec::with_capacity(self.names.len());
        let mut rest = flat;
        for ((name, shape), &numel) in self.names.iter().zip(&self.shapes).zip(&self.numels) {
            let (head, tail) = rest.split_at(numel);
            out.push((name.clone(), ArrayD::from_shape_vec(IxDyn(shape), head.to_vec())?));
            rest = tail;
        }

        Ok(out)
    }

    /// Concatenates one tensor per member, in the group's order, into a flat tensor.
    ///
    /// This is used to build the flat gradient of the backing parameter out of its
    /// members' gradients.
    pub fn concat(&self, parts: &[ArrayViewD<'_, f32>]) -> Result<ArrayD<f32>> {
        if parts.len() != self.names.len() {
            return Err(ShardErr::SizeMismatch {
                what: "flat parameter members",
                got: parts.len(),
                expected: self.names.len(),
            });
        }

        let mut flat = Vec::with_capacity(self.numel());
        for (part, shape) in parts.iter().zip(&self.shapes) {
            if part.shape() != shape.as_slice() {
                return Err(ShardErr::SizeMismatch {
                    what: "flat parameter member",
                    got: part.len(),
                    expected: shape.iter().product(),
                });
            }

            flat.extend(part.iter().copied());
        }

        Ok(ArrayD::from_shape_vec(IxDyn(&[flat.len()]), flat)?)
    }
}
