use crate::{Collective, ReduceOp, Result, check_scatter};

/// A group made of a single worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct Solo;

impl Collective for Solo {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&mut self, shard: &[f32]) -> Result<Vec<f32>> {
        Ok(shard.to_vec())
    }

    fn reduce_scatter(
        &mut self,
        _op: ReduceOp,
        input: &[f32],
        shard_count: usize,
    ) -> Result<Vec<f32>> {
        check_scatter(input.len(), shard_count, 1)?;
        Ok(input.to_vec())
    }

    fn all_reduce(&mut self, _op: ReduceOp, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collectives_are_identity() {
        let mut solo = Solo;
        assert_eq!(solo.all_gather(&[1.0, 2.0]).unwrap(), vec![1.0, 2.0]);
        assert_eq!(
            solo.reduce_scatter(ReduceOp::Sum, &[3.0, 4.0], 1).unwrap(),
            vec![3.0, 4.0]
        );

        let mut values = [5.0];
        solo.all_reduce(ReduceOp::Max, &mut values).unwrap();
        assert_eq!(values, [5.0]);
    }

    #[test]
    fn rejects_more_shards_than_workers() {
        assert!(Solo.reduce_scatter(ReduceOp::Sum, &[1.0, 2.0], 2).is_err());
    }
}
