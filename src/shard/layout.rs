use std::ops::Range;

/// How a flattened tensor of `numel` elements is split among the workers of a group.
///
/// The tensor is cut into chunks of `ceil(numel / world_size)` elements, the last non empty
/// chunk may be shorter and any trailing chunk may be empty. Every shard is zero padded up
/// to the length of the first chunk so all workers hold the same amount of elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    numel: usize,
    rank: usize,
    world_size: usize,
}

impl ShardLayout {
    /// Creates a new `ShardLayout`.
    ///
    /// # Arguments
    /// * `numel` - The amount of elements of the full tensor.
    /// * `rank` - The worker whose shard this layout describes.
    /// * `world_size` - The amount of workers in the group.
    ///
    /// # Panics
    /// If `world_size` is zero or `rank` is out of range.
    pub fn new(numel: usize, rank: usize, world_size: usize) -> Self {
        assert!(world_size > 0);
        assert!(rank < world_size);

        Self {
            numel,
            rank,
            world_size,
        }
    }

    /// The length of every shard, padding included.
    pub fn chunk_len(&self) -> usize {
        self.numel.div_ceil(self.world_size)
    }

    /// The range of the flattened full tensor covered by this worker's shard, padding excluded.
    pub fn range(&self) -> Range<usize> {
        let chunk = self.chunk_len();
        let start = (self.rank * chunk).min(self.numel);
        let end = (start + chunk).min(self.numel);
        start..end
    }

    /// The amount of padding elements appended to this worker's shard.
    pub fn local_pad(&self) -> usize {
        self.chunk_len() - self.range().len()
    }

    /// The amount of padding elements across every shard of the group.
    pub fn total_pad(&self) -> usize {
        self.chunk_len() * self.world_size - self.numel
    }
}

/// Extracts a worker's shard out of a flattened full tensor.
///
/// # Arguments
/// * `flat` - The full tensor's elements in logical order.
/// * `rank` - The worker's rank.
/// * `world_size` - The amount of workers in the group.
///
/// # Returns
/// The zero padded shard and its local padding.
pub fn shard_tensor(flat: &[f32], rank: usize, world_size: usize) -> (Vec<f32>, usize) {
    let layout = ShardLayout::new(flat.len(), rank, world_size);
    let mut shard = flat[layout.range()].to_vec();
    shard.resize(layout.chunk_len(), 0.0);
    (shard, layout.local_pad())
}

/// Flattens `values` and zero pads them so their length is divisible by `world_size`.
pub fn flatten_and_pad<'a, I>(values: I, world_size: usize) -> Vec<f32>
where
    I: IntoIterator<Item = &'a f32>,
{
    let mut flat: Vec<f32> = values.into_iter().copied().collect();
    let rem = flat.len() % world_size;
    if rem != 0 {
        flat.resize(flat.len() + world_size - rem, 0.0);
    }

    flat
}

/// Drops the trailing `pad` elements of a shard.
pub fn unpad(shard: &[f32], pad: usize) -> &[f32] {
    &shard[..shard.len().saturating_sub(pad)]
}

/// Computes the factor gradients are divided by before the reduction.
///
/// It doubles from one while it divides `world_size` and it's still smaller than the
/// remaining quotient, so the pre and post reduction divisions are balanced.
pub fn predivide_factor(world_size: usize) -> f32 {
    let mut factor = 1;
    while world_size % factor == 0 && world_size / factor > factor {
        factor *= 2;
    }

    factor as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_are_relative_to_the_first_chunk() {
        let pads: Vec<_> = (0..4).map(|r| ShardLayout::new(5, r, 4).local_pad()).collect();
        assert_eq!(pads, vec![0, 0, 1, 2]);
        assert_eq!(ShardLayout::new(5, 0, 4).total_pad(), 3);

        let ranges: Vec<_> = (0..4).map(|r| ShardLayout::new(5, r, 4).range()).collect();
        assert_eq!(ranges, vec![0..2, 2..4, 4..5, 5..5]);
    }

    #[test]
    fn shards_reassemble_the_tensor() {
        for world_size in 1..=9 {
            for numel in 0..=23usize {
                let flat: Vec<f32> = (0..numel).map(|v| v as f32).collect();

                let mut gathered = Vec::new();
                for rank in 0..world_size {
                    let (shard, pad) = shard_tensor(&flat, rank, world_size);
                    assert_eq!(shard.len(), numel.div_ceil(world_size));
                    assert!(shard[shard.len() - pad..].iter().all(|&v| v == 0.0));
                    gathered.extend_from_slice(&shard);
                }

                gathered.truncate(numel);
                assert_eq!(gathered, flat, "numel {numel} world size {world_size}");
            }
        }
    }

    #[test]
    fn flatten_and_pad_rounds_up_to_the_world_size() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(
            flatten_and_pad(&values, 4),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(flatten_and_pad(&values, 5).len(), 5);
    }

    #[test]
    fn unpad_strips_trailing_elements() {
        assert_eq!(unpad(&[1.0, 2.0, 0.0], 1), &[1.0, 2.0]);
        assert_eq!(unpad(&[1.0], 0), &[1.0]);
    }

    #[test]
    fn divide_factors_are_balanced() {
        let factors: Vec<_> = [1, 2, 4, 8, 16]
            .into_iter()
            .map(|w| {
                let pre = predivide_factor(w);
                (pre, w as f32 / pre)
            })
            .collect();

        assert_eq!(
            factors,
            vec![(1.0, 1.0), (2.0, 1.0), (2.0, 2.0), (4.0, 2.0), (4.0, 4.0)]
        );
    }
}
