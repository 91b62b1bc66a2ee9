#![allow(dead_code)]

use std::{sync::Arc, thread};

use comms::{CollectiveStats, Tally, ThreadEndpoint, ThreadGroup};
use ndarray::{ArrayD, IxDyn};
use sharded_data_parallel::{ModelBuilder, ShardedModel};

pub type Model = ShardedModel<Tally<ThreadEndpoint>>;

/// Runs `f` on `world_size` threads, each one with its own counted endpoint of a group.
pub fn on_workers<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(Tally<ThreadEndpoint>) -> T + Sync,
{
    let endpoints = ThreadGroup::new(world_size).into_endpoints();
    thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|ep| s.spawn(move || f(Tally::new(ep))))
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Builds `builder` on top of `collective`, handing back the call counters too.
pub fn build(builder: ModelBuilder, collective: Tally<ThreadEndpoint>) -> (Model, Arc<CollectiveStats>) {
    let stats = collective.stats();
    (builder.build(collective).unwrap(), stats)
}

pub fn filled(shape: &[usize], value: f32) -> ArrayD<f32> {
    ArrayD::from_elem(IxDyn(shape), value)
}

pub fn tensor(shape: &[usize], values: &[f32]) -> ArrayD<f32> {
    ArrayD::from_shape_vec(IxDyn(shape), values.to_vec()).unwrap()
}
