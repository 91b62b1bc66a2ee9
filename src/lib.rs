//! Sharded data parallel training.
//!
//! Every trainable tensor of a model is split into one contiguous slice per worker. A unit
//! gathers its full parameters only while running its forward and backward computations,
//! gradients are reduce-scattered back into slices as soon as they are complete and the
//! root unit finalizes the whole tree once the backward pass drains.
//!
//! The collectives are provided by the `comms` crate, any `comms::Collective` drives a
//! `ShardedModel`.

mod builder;
pub mod checkpoint;
mod config;
mod data;
mod error;
mod model;
pub mod optim;
pub mod shard;
mod state;
mod unit;

pub use builder::ModelBuilder;
pub use config::UnitConfig;
pub use data::shard_range;
pub use error::{Result, ShardErr};
pub use model::{NoSync, ShardedModel, SharedAlias};
pub use shard::{FlatParamGroup, Grad, ParamId, ShardedParam};
pub use state::{TrainingState, assert_state};
pub use unit::{Unit, UnitId};
