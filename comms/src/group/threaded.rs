use std::sync::Arc;

use log::trace;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;

use crate::{Collective, CommErr, ReduceOp, Result, check_scatter, msg::OpKind};

struct Contribution {
    kind: OpKind,
    data: Vec<f32>,
}

/// What every worker of a round walks away with.
enum Outcome {
    Gathered(Vec<f32>),
    Reduced(Vec<f32>),
    Desync {
        expected: &'static str,
        got: &'static str,
    },
    ShapeMismatch {
        op: &'static str,
        got: usize,
        expected: usize,
    },
}

#[derive(Default)]
struct Round {
    contributions: Vec<Option<Contribution>>,
    arrived: usize,
    departed: usize,
    outcome: Option<Arc<Outcome>>,
}

struct Rendezvous {
    world_size: usize,
    round: Mutex<Round>,
    cvar: Condvar,
}

impl Rendezvous {
    /// Blocks until every worker has contributed to the current round and returns its outcome.
    ///
    /// A round is filled while `outcome` is `None` and drained once it's set. Workers
    /// arriving for the next round while the current one drains wait for it to reset.
    fn meet(&self, rank: usize, contribution: Contribution) -> Arc<Outcome> {
        let mut round = self.round.lock();
        while round.outcome.is_some() {
            self.cvar.wait(&mut round);
        }

        round.contributions[rank] = Some(contribution);
        round.arrived += 1;

        if round.arrived == self.world_size {
            let outcome = combine(&mut round.contributions);
            round.outcome = Some(Arc::new(outcome));
            self.cvar.notify_all();
        }

        let outcome = loop {
            if let Some(outcome) = &round.outcome {
                break Arc::clone(outcome);
            }

            self.cvar.wait(&mut round);
        };

        round.departed += 1;
        if round.departed == self.world_size {
            round.arrived = 0;
            round.departed = 0;
            round.outcome = None;
            self.cvar.notify_all();
        }

        outcome
    }
}

/// Folds every contribution of a filled round into its outcome.
fn combine(contributions: &mut [Option<Contribution>]) -> Outcome {
    let mut taken = contributions.iter_mut().filter_map(Option::take);
    let Some(first) = taken.next() else {
        return Outcome::Gathered(Vec::new());
    };

    let kind = first.kind;
    let len = first.data.len();
    let mut acc = first.data;

    for Contribution { kind: got, data } in taken {
        if got != kind {
            return Outcome::Desync {
                expected: kind.name(),
                got: got.name(),
            };
        }

        if data.len() != len {
            return Outcome::ShapeMismatch {
                op: kind.name(),
                got: data.len(),
                expected: len,
            };
        }

        match kind {
            OpKind::AllGather => acc.extend_from_slice(&data),
            OpKind::ReduceScatter { op, .. } | OpKind::AllReduce { op } => acc
                .par_iter_mut()
                .zip(data.par_iter())
                .for_each(|(a, v)| *a = op.apply(*a, *v)),
        }
    }

    match kind {
        OpKind::AllGather => Outcome::Gathered(acc),
        _ => Outcome::Reduced(acc),
    }
}

/// A group of workers living in the same process, each on its own thread.
pub struct ThreadGroup {
    rendezvous: Arc<Rendezvous>,
}

impl ThreadGroup {
    /// Creates a new `ThreadGroup` for `world_size` workers.
    ///
    /// # Panics
    /// If `world_size` is zero.
    pub fn new(world_size: usize) -> Self {
        assert!(world_size > 0, "a group needs at least one worker");

        let round = Round {
            contributions: (0..world_size).map(|_| None).collect(),
            ..Default::default()
        };

        Self {
            rendezvous: Arc::new(Rendezvous {
                world_size,
                round: Mutex::new(round),
                cvar: Condvar::new(),
            }),
        }
    }

    /// Consumes the group and hands out one endpoint per rank, in rank order.
    pub fn into_endpoints(self) -> Vec<ThreadEndpoint> {
        (0..self.rendezvous.world_size)
            .map(|rank| ThreadEndpoint {
                rank,
                rendezvous: Arc::clone(&self.rendezvous),
            })
            .collect()
    }
}

/// A single worker's handle on a `ThreadGroup`.
pub struct ThreadEndpoint {
    rank: usize,
    rendezvous: Arc<Rendezvous>,
}

impl ThreadEndpoint {
    fn exchange(&self, kind: OpKind, data: Vec<f32>) -> Result<Arc<Outcome>> {
        trace!("rank {} entering {}", self.rank, kind.name());
        let outcome = self.rendezvous.meet(self.rank, Contribution { kind, data });

        match &*outcome {
            &Outcome::Desync { expected, got } => return Err(CommErr::Desync { expected, got }),
            &Outcome::ShapeMismatch { op, got, expected } => {
                return Err(CommErr::ShapeMismatch { op, got, expected });
            }
            _ => {}
        }

        Ok(outcome)
    }
}

impl Collective for ThreadEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.rendezvous.world_size
    }

    fn all_gather(&mut self, shard: &[f32]) -> Result<Vec<f32>> {
        match &*self.exchange(OpKind::AllGather, shard.to_vec())? {
            Outcome::Gathered(full) => Ok(full.clone()),
            _ => Err(CommErr::UnexpectedMessage { got: "reduced" }),
        }
    }

    fn reduce_scatter(
        &mut self,
        op: ReduceOp,
        input: &[f32],
        shard_count: usize,
    ) -> Result<Vec<f32>> {
        let chunk = check_scatter(input.len(), shard_count, self.world_size())?;
        let kind = OpKind::ReduceScatter { op, shard_count };

        match &*self.exchange(kind, input.to_vec())? {
            Outcome::Reduced(full) => Ok(full[self.rank * chunk..(self.rank + 1) * chunk].to_vec()),
            _ => Err(CommErr::UnexpectedMessage { got: "gathered" }),
        }
    }

    fn all_reduce(&mut self, op: ReduceOp, values: &mut [f32]) -> Result<()> {
        match &*self.exchange(OpKind::AllReduce { op }, values.to_vec())? {
            Outcome::Reduced(full) => {
                values.copy_from_slice(full);
                Ok(())
            }
            _ => Err(CommErr::UnexpectedMessage { got: "gathered" }),
        }
    }
}
