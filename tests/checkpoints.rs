mod common;

use std::collections::BTreeMap;

use comms::Collective;
use sharded_data_parallel::{ModelBuilder, UnitConfig, checkpoint};

use common::{build, filled, on_workers, tensor};

fn builder() -> ModelBuilder {
    let mut builder = ModelBuilder::new();
    let root = builder.root(UnitConfig::default());
    let encoder = builder.unit(root, "encoder", UnitConfig::default());
    let head = builder.unit(root, "head", UnitConfig::default());

    builder.param(root, "scale", tensor(&[1], &[0.5]));
    let flat = builder.flat_param(
        encoder,
        "flat",
        vec![
            ("weight".into(), tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0])),
            ("bias".into(), tensor(&[3], &[5.0, 6.0, 7.0])),
        ],
    );
    builder.param(head, "out", filled(&[5], 9.0));
    builder.share(flat, head, "tied");
    builder
}

#[test]
fn consolidated_checkpoints_match_the_gathered_state() {
    let outcomes = on_workers(3, |ep| {
        let (mut model, _) = build(builder(), ep);

        let metadata = model.local_metadata();
        let encoder = &metadata.param_metadata[1];
        assert_eq!(encoder.path, "encoder");
        assert_eq!(encoder.params["flat"].names, ["weight", "bias"]);
        assert_eq!(encoder.params["flat"].numels, [4, 3]);

        let head = &metadata.param_metadata[2];
        assert_eq!(
            head.shared_param_info,
            [
                ("encoder.weight".to_string(), "head.weight".to_string()),
                ("encoder.bias".to_string(), "head.bias".to_string()),
            ]
        );

        (model.checkpoint().unwrap(), model.full_state_dict().unwrap())
    });

    let checkpoints: Vec<_> = outcomes.iter().rev().map(|(c, _)| c.clone()).collect();
    let consolidated = checkpoint::consolidate(&checkpoints).unwrap();

    let keys: Vec<_> = consolidated.keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        ["encoder.bias", "encoder.weight", "head.bias", "head.out", "head.weight", "scale"]
    );
    assert_eq!(consolidated["encoder.weight"], tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]));
    assert_eq!(consolidated["head.bias"], tensor(&[3], &[5.0, 6.0, 7.0]));

    for (_, full) in &outcomes {
        assert_eq!(full, &consolidated);
    }
}

#[test]
fn full_state_dicts_load_into_every_rank() {
    on_workers(2, |ep| {
        let (mut model, _) = build(builder(), ep);

        let mut state: BTreeMap<_, _> = model.full_state_dict().unwrap();
        state.insert("head.out".into(), tensor(&[5], &[1.0, 2.0, 3.0, 4.0, 5.0]));
        model.load_full_state_dict(&state).unwrap();

        let out = model.find_param("head.out").unwrap();
        let expected = [[1.0, 2.0, 3.0], [4.0, 5.0, 0.0]][model.rank()];
        assert_eq!(model.param(out).unwrap().shard(), expected);

        let reloaded = model.full_state_dict().unwrap();
        assert_eq!(reloaded, state);
    });
}

#[test]
fn local_state_dicts_round_trip_the_shards() {
    on_workers(2, |ep| {
        let (mut model, _) = build(builder(), ep);
        let local = model.local_state_dict().unwrap();
        assert_eq!(local["encoder.flat"].shape(), &[4]);

        let zeroed: BTreeMap<_, _> = local
            .iter()
            .map(|(k, v)| (k.clone(), v.mapv(|_| 0.0)))
            .collect();

        model.load_local_state_dict(&zeroed).unwrap();
        assert_eq!(model.local_state_dict().unwrap(), zeroed);

        model.load_local_state_dict(&local).unwrap();
        assert_eq!(model.local_state_dict().unwrap(), local);
    });
}

#[test]
fn a_single_worker_checkpoint_is_the_whole_model() {
    let (checkpoint, full) = on_workers(1, |ep| {
        assert_eq!(ep.world_size(), 1);
        let (mut model, _) = build(builder(), ep);
        (model.checkpoint().unwrap(), model.full_state_dict().unwrap())
    })
    .pop()
    .unwrap();

    assert_eq!(checkpoint.weights["encoder.flat"].len(), 7);
    assert_eq!(checkpoint::consolidate(&[checkpoint]).unwrap(), full);
}
