//! The shard store: how tensors are split among workers and the per parameter records
//! holding each worker's slice.

mod flat;
mod layout;
mod param;

pub use flat::FlatParamGroup;
pub use layout::{ShardLayout, flatten_and_pad, predivide_factor, shard_tensor, unpad};
pub use param::{Grad, ParamId, ShardedParam};

pub(crate) use param::{Hook, View};
