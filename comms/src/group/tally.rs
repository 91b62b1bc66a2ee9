use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::{Collective, ReduceOp, Result};

/// Counters of the collectives issued through a `Tally`.
#[derive(Debug, Default)]
pub struct CollectiveStats {
    all_gathers: AtomicUsize,
    reduce_scatters: AtomicUsize,
    all_reduces: AtomicUsize,
}

impl CollectiveStats {
    pub fn all_gathers(&self) -> usize {
        self.all_gathers.load(Ordering::Relaxed)
    }

    pub fn reduce_scatters(&self) -> usize {
        self.reduce_scatters.load(Ordering::Relaxed)
    }

    pub fn all_reduces(&self) -> usize {
        self.all_reduces.load(Ordering::Relaxed)
    }

    /// Sets every counter back to zero.
    pub fn reset(&self) {
        self.all_gathers.store(0, Ordering::Relaxed);
        self.reduce_scatters.store(0, Ordering::Relaxed);
        self.all_reduces.store(0, Ordering::Relaxed);
    }
}

/// A `Collective` wrapper counting every successful call made through it.
pub struct Tally<C> {
    inner: C,
    stats: Arc<CollectiveStats>,
}

impl<C: Collective> Tally<C> {
    /// Creates a new `Tally` around `inner`.
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            stats: Arc::default(),
        }
    }

    /// Returns a handle on the counters, it stays valid after the wrapper is moved.
    pub fn stats(&self) -> Arc<CollectiveStats> {
        Arc::clone(&self.stats)
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: Collective> Collective for Tally<C> {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    fn all_gather(&mut self, shard: &[f32]) -> Result<Vec<f32>> {
        let full = self.inner.all_gather(shard)?;
        self.stats.all_gathers.fetch_add(1, Ordering::Relaxed);
        Ok(full)
    }

    fn reduce_scatter(
        &mut self,
        op: ReduceOp,
        input: &[f32],
        shard_count: usize,
    ) -> Result<Vec<f32>> {
        let shard = self.inner.reduce_scatter(op, input, shard_count)?;
        self.stats.reduce_scatters.fetch_add(1, Ordering::Relaxed);
        Ok(shard)
    }

    fn all_reduce(&mut self, op: ReduceOp, values: &mut [f32]) -> Result<()> {
        self.inner.all_reduce(op, values)?;
        self.stats.all_reduces.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Solo;

    #[test]
    fn counts_successful_calls() {
        let mut group = Tally::new(Solo);
        let stats = group.stats();

        group.all_gather(&[1.0]).unwrap();
        group.all_gather(&[1.0]).unwrap();
        group.reduce_scatter(ReduceOp::Sum, &[1.0], 1).unwrap();
        assert!(group.reduce_scatter(ReduceOp::Sum, &[1.0], 2).is_err());

        assert_eq!(stats.all_gathers(), 2);
        assert_eq!(stats.reduce_scatters(), 1);
        assert_eq!(stats.all_reduces(), 0);

        stats.reset();
        assert_eq!(stats.all_gathers(), 0);
    }
}
