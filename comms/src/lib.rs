mod align;
mod deserialize;
mod error;
pub mod group;
pub mod msg;
mod receiver;
mod sender;
mod serialize;

use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use tokio::io::{AsyncRead, AsyncWrite};

pub use align::{Align1, Align4};
pub use deserialize::Deserialize;
pub use error::{CommErr, Result};
pub use group::{CollectiveStats, Solo, Tally, TcpGroup, ThreadEndpoint, ThreadGroup};
pub use receiver::OnoReceiver;
pub use sender::OnoSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// The element-wise reduction applied by `reduce_scatter` and `all_reduce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    /// Folds `value` into `acc` following this reduction.
    #[inline]
    pub fn apply(self, acc: f32, value: f32) -> f32 {
        match self {
            ReduceOp::Sum => acc + value,
            ReduceOp::Max => acc.max(value),
        }
    }
}

/// The blocking collective primitives every worker of a group must call in the same order.
///
/// A call on one worker returns only after every other worker of the group has issued
/// the same call, so the sequence of collectives must be identical across workers.
pub trait Collective {
    /// Returns this worker's position in the group.
    fn rank(&self) -> usize;

    /// Returns the amount of workers in the group.
    fn world_size(&self) -> usize;

    /// Exchanges equal-length shards between every worker.
    ///
    /// # Arguments
    /// * `shard` - This worker's contribution.
    ///
    /// # Returns
    /// The rank-ordered concatenation of every worker's shard.
    fn all_gather(&mut self, shard: &[f32]) -> Result<Vec<f32>>;

    /// Reduces `input` across every worker and keeps this worker's contiguous slice of the result.
    ///
    /// # Arguments
    /// * `op` - The reduction to apply.
    /// * `input` - This worker's contribution, its length must be divisible by `shard_count`.
    /// * `shard_count` - The amount of slices the reduced tensor is split into.
    ///
    /// # Returns
    /// The `rank`-th slice of the reduced tensor.
    fn reduce_scatter(&mut self, op: ReduceOp, input: &[f32], shard_count: usize)
    -> Result<Vec<f32>>;

    /// Reduces `values` in place across every worker.
    ///
    /// # Arguments
    /// * `op` - The reduction to apply.
    /// * `values` - This worker's contribution, overwritten with the reduced values.
    fn all_reduce(&mut self, op: ReduceOp, values: &mut [f32]) -> Result<()>;
}

impl<C: Collective + ?Sized> Collective for Box<C> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn all_gather(&mut self, shard: &[f32]) -> Result<Vec<f32>> {
        (**self).all_gather(shard)
    }

    fn reduce_scatter(
        &mut self,
        op: ReduceOp,
        input: &[f32],
        shard_count: usize,
    ) -> Result<Vec<f32>> {
        (**self).reduce_scatter(op, input, shard_count)
    }

    fn all_reduce(&mut self, op: ReduceOp, values: &mut [f32]) -> Result<()> {
        (**self).all_reduce(op, values)
    }
}

/// Checks the local preconditions of a `reduce_scatter` call.
///
/// # Arguments
/// * `len` - The length of the input.
/// * `shard_count` - The requested amount of slices.
/// * `world_size` - The amount of workers in the group.
///
/// # Returns
/// The length of each output slice or a `CommErr` if the input can't be split.
pub(crate) fn check_scatter(len: usize, shard_count: usize, world_size: usize) -> Result<usize> {
    if shard_count != world_size || len % shard_count != 0 {
        return Err(CommErr::InvalidShardCount { len, shard_count });
    }

    Ok(len / shard_count)
}

/// Creates both `OnoReceiver` and `OnoSender` network channel parts.
///
/// Given a writer and reader creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of an ono receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}
