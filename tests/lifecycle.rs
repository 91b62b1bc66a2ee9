mod common;

use comms::{Collective, Solo};
use sharded_data_parallel::{Grad, ModelBuilder, ShardErr, TrainingState, UnitConfig};

use common::{build, filled, on_workers, tensor};

#[test]
fn rebuilding_twice_gathers_once() {
    on_workers(2, |ep| {
        let mut builder = ModelBuilder::new();
        let root = builder.root(UnitConfig::default());
        let w = builder.param(root, "w", tensor(&[10], &[1.0; 10]));
        let (mut model, stats) = build(builder, ep);

        model.rebuild_full_params(root).unwrap();
        model.rebuild_full_params(root).unwrap();
        assert_eq!(stats.all_gathers(), 1);
        assert!(model.param(w).unwrap().has_full());
        assert_eq!(model.param(w).unwrap().data().unwrap().shape(), &[10]);

        model.free_full_params(root).unwrap();
        model.free_full_params(root).unwrap();
        assert!(!model.param(w).unwrap().has_full());
        assert_eq!(model.param(w).unwrap().data().unwrap().shape(), &[5]);

        model.rebuild_full_params(root).unwrap();
        assert_eq!(stats.all_gathers(), 2);
        assert!(model.param(w).unwrap().has_full());
    });
}

#[test]
fn gathered_parameters_reassemble_the_original() {
    let original: Vec<f32> = (0..7).map(|v| v as f32).collect();

    let shards = on_workers(3, |ep| {
        let rank = ep.rank();
        let mut builder = ModelBuilder::new();
        let root = builder.root(UnitConfig::default());
        let w = builder.param(root, "w", tensor(&[7], &original));
        let (mut model, _) = build(builder, ep);

        let param = model.param(w).unwrap();
        assert_eq!(param.shard().len(), 3);
        assert_eq!(param.padding(), [0, 0, 2][rank]);
        let shard = param.shard().to_vec();

        model.rebuild_full_params(root).unwrap();
        let full = model.param(w).unwrap().data().unwrap().to_owned();
        assert_eq!(full, tensor(&[7], &original));

        shard
    });

    assert_eq!(shards[2], [6.0, 0.0, 0.0]);
}

#[test]
fn divide_factors_follow_the_world_size() {
    for (world_size, factors) in [(1, (1.0, 1.0)), (2, (2.0, 1.0)), (4, (2.0, 2.0)), (8, (4.0, 2.0))] {
        let got = on_workers(world_size, |ep| {
            let mut builder = ModelBuilder::new();
            let root = builder.root(UnitConfig::default());
            builder.param(root, "w", filled(&[10], 1.0));
            let (model, _) = build(builder, ep);
            model.unit(root).unwrap().divide_factors()
        });

        assert!(got.iter().all(|&f| f == factors), "world size {world_size}");
    }
}

#[test]
fn the_root_keeps_its_full_parameters_after_forward() {
    on_workers(2, |ep| {
        let mut builder = ModelBuilder::new();
        let root = builder.root(UnitConfig::default());
        let block = builder.unit(root, "block", UnitConfig::default());
        let bias = builder.param(root, "bias", filled(&[4], 1.0));
        let weight = builder.param(block, "weight", filled(&[2, 2], 1.0));
        let (mut model, _) = build(builder, ep);

        assert!(model.unit(root).unwrap().is_root());
        assert!(!model.unit(root).unwrap().reshard_after_forward());
        assert!(!model.unit(block).unwrap().is_root());
        assert!(model.unit(block).unwrap().reshard_after_forward());

        model.set_grad_enabled(false);
        model
            .forward(root, |model| {
                assert_eq!(model.unit(root)?.state(), TrainingState::Forward);
                model.forward(block, |model| {
                    assert_eq!(model.param(weight)?.data()?.shape(), &[2, 2]);
                    Ok(())
                })
            })
            .unwrap();

        assert!(model.param(bias).unwrap().has_full());
        assert!(!model.param(weight).unwrap().has_full());
        assert_eq!(model.param(bias).unwrap().data().unwrap().shape(), &[2]);
        assert!(model.units().all(|(_, u)| u.state() == TrainingState::Idle));
    });
}

#[test]
fn gathering_outside_of_forward_reports_both_states() {
    let mut builder = ModelBuilder::new();
    let root = builder.root(UnitConfig::default());
    let block = builder.unit(root, "block", UnitConfig::default());
    builder.param(block, "w", filled(&[3], 1.0));
    let mut model = builder.build(Solo).unwrap();

    model.forward(root, |model| model.forward(block, |_| Ok(()))).unwrap();

    let err = model
        .backward(|model| {
            model.pre_backward(root)?;
            model.pre_backward(block)?;
            model.rebuild_full_params(block)
        })
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "unit `block`: expected to be in states [IDLE, FORWARD] but current state is BACKWARD_PRE"
    );

    let err = model.free_full_params(block).unwrap_err();
    assert!(matches!(
        err,
        ShardErr::InvalidState { actual: TrainingState::BackwardPre, .. }
    ));
}

#[test]
fn a_new_step_waits_for_the_previous_one() {
    let mut builder = ModelBuilder::new();
    let root = builder.root(UnitConfig::default());
    let w = builder.param(root, "w", filled(&[3], 1.0));
    let mut model = builder.build(Solo).unwrap();

    model.forward(root, |_| Ok(())).unwrap();
    let err = model
        .backward(|model| {
            model.pre_backward(root)?;
            model.forward(root, |_| Ok(()))
        })
        .unwrap_err();

    match err {
        ShardErr::InvalidState { expected, actual, .. } => {
            assert_eq!(expected, [TrainingState::Idle]);
            assert_eq!(actual, TrainingState::BackwardPre);
        }
        other => panic!("unexpected error {other}"),
    }

    assert!(model.param(w).unwrap().grad().is_none());
}

#[test]
fn evaluation_passes_arm_no_hooks() {
    let mut builder = ModelBuilder::new();
    let root = builder.root(UnitConfig::default());
    let w = builder.param(root, "w", filled(&[3], 1.0));
    let mut model = builder.build(Solo).unwrap();

    model.set_grad_enabled(false);
    model.forward(root, |_| Ok(())).unwrap();

    let err = model.accumulate_grad(w, Some(Grad::from(filled(&[3], 1.0)))).unwrap_err();
    assert!(matches!(err, ShardErr::HookNotArmed { .. }));

    model.set_grad_enabled(true);
    model.forward(root, |_| Ok(())).unwrap();
    model
        .backward(|model| {
            model.pre_backward(root)?;
            model.accumulate_grad(w, Some(Grad::from(filled(&[3], 1.0))))
        })
        .unwrap();

    assert_eq!(model.param(w).unwrap().reductions(), 1);
}

#[test]
fn summoned_changes_land_in_the_shards() {
    on_workers(2, |ep| {
        let rank = ep.rank();
        let mut builder = ModelBuilder::new();
        let root = builder.root(UnitConfig::default());
        let w = builder.param(root, "w", tensor(&[3], &[1.0, 2.0, 3.0]));
        let (mut model, _) = build(builder, ep);

        model
            .summon_full_params(root, true, true, |model| {
                assert_eq!(model.unit(root)?.state(), TrainingState::SummonFullParams);
                model.param_mut(w)?.data_mut()?.fill(0.0);
                Ok(())
            })
            .unwrap();

        let expected = [[1.0, 2.0], [3.0, 0.0]][rank];
        assert_eq!(model.param(w).unwrap().shard(), expected);

        model
            .summon_full_params(root, true, false, |model| {
                model.param_mut(w)?.data_mut()?.mapv_inplace(|v| v * 10.0);
                Ok(())
            })
            .unwrap();

        let expected = [[10.0, 20.0], [30.0, 0.0]][rank];
        assert_eq!(model.param(w).unwrap().shard(), expected);
        assert!(!model.param(w).unwrap().has_full());
        assert_eq!(model.unit(root).unwrap().state(), TrainingState::Idle);
    });
}

#[test]
fn summoning_in_the_middle_of_a_step_fails() {
    let mut builder = ModelBuilder::new();
    let root = builder.root(UnitConfig::default());
    builder.param(root, "w", filled(&[3], 1.0));
    let mut model = builder.build(Solo).unwrap();

    model.forward(root, |_| Ok(())).unwrap();
    let err = model
        .backward(|model| {
            model.pre_backward(root)?;
            model.summon_full_params(root, false, true, |_| Ok(()))
        })
        .unwrap_err();

    assert!(matches!(err, ShardErr::InvalidState { .. }));
}

#[test]
fn malformed_trees_are_rejected() {
    let mut builder = ModelBuilder::new();
    builder.root(UnitConfig::default());
    builder.root(UnitConfig::default());
    assert!(matches!(builder.build(Solo), Err(ShardErr::Config(_))));

    let mut builder = ModelBuilder::new();
    let root = builder.root(UnitConfig::default());
    builder.param(root, "w", filled(&[1], 1.0));
    builder.param(root, "w", filled(&[1], 1.0));
    assert!(matches!(builder.build(Solo), Err(ShardErr::DuplicateParam(_))));

    let mut builder = ModelBuilder::new();
    let root = builder.root(UnitConfig::default());
    let block = builder.unit(root, "block", UnitConfig::default());
    let w = builder.param(root, "w", filled(&[1], 1.0));
    builder.param(block, "v", filled(&[1], 1.0));
    builder.share(w, block, "tied");
    assert!(matches!(builder.build(Solo), Err(ShardErr::Config(_))));
}

#[test]
fn parameter_ids_of_another_model_are_rejected() {
    let mut builder = ModelBuilder::new();
    let root = builder.root(UnitConfig::default());
    builder.param(root, "a", filled(&[1], 1.0));
    let b = builder.param(root, "b", filled(&[1], 1.0));

    let mut builder = ModelBuilder::new();
    let root = builder.root(UnitConfig::default());
    builder.param(root, "a", filled(&[1], 1.0));
    let mut model = builder.build(Solo).unwrap();

    assert!(matches!(model.param(b), Err(ShardErr::UnknownParamId(1))));
    assert!(matches!(model.param_mut(b), Err(ShardErr::UnknownParamId(1))));
}

#[test]
fn nested_units_can_run_forward_again_during_backward() {
    on_workers(2, |ep| {
        let mut builder = ModelBuilder::new();
        let root = builder.root(UnitConfig::default());
        let block = builder.unit(root, "block", UnitConfig::default());
        let w = builder.param(block, "w", filled(&[4], 0.0));
        let (mut model, _) = build(builder, ep);

        for step in 1..=2 {
            model
                .forward(root, |model| {
                    model.set_grad_enabled(false);
                    let out = model.forward(block, |_| Ok(()));
                    model.set_grad_enabled(true);
                    out
                })
                .unwrap();

            model
                .backward(|model| {
                    model.pre_backward(root)?;
                    model.pre_backward(block)?;

                    model.forward(block, |model| {
                        assert_eq!(model.param(w)?.data()?.len(), 4);
                        Ok(())
                    })?;
                    assert_eq!(model.unit(block)?.state(), TrainingState::BackwardPre);

                    model.accumulate_grad(w, Some(Grad::from(filled(&[4], 1.0))))?;
                    assert_eq!(model.unit(block)?.state(), TrainingState::BackwardPost);

                    // The gradients were already prepared for this step.
                    model.pre_backward(block)
                })
                .unwrap();

            let param = model.param(w).unwrap();
            assert_eq!(param.reductions(), 1);
            assert_eq!(param.grad().unwrap(), &filled(&[2], step as f32));
            assert!(model.units().all(|(_, u)| u.state() == TrainingState::Idle));
        }
    });
}

#[test]
fn flattened_members_are_readable_inside_forward() {
    on_workers(2, |ep| {
        let mut builder = ModelBuilder::new();
        let root = builder.root(UnitConfig::default());
        let block = builder.unit(root, "block", UnitConfig::default());
        let flat = builder.flat_param(
            block,
            "flat",
            vec![
                ("weight".into(), tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0])),
                ("bias".into(), tensor(&[1], &[5.0])),
            ],
        );
        let (mut model, _) = build(builder, ep);

        assert!(model.param(flat).unwrap().member("bias").is_err());

        let group = model.param(flat).unwrap().flat_group().unwrap().clone();
        model
            .forward(root, |model| {
                model.forward(block, |model| {
                    let param = model.param(flat)?;
                    assert_eq!(param.member("weight")?, tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]));
                    assert_eq!(param.member("bias")?, tensor(&[1], &[5.0]));
                    assert!(param.member("scale").is_err());
                    Ok(())
                })
            })
            .unwrap();

        let grad = group
            .concat(&[filled(&[2, 2], 1.0).view(), filled(&[1], 2.0).view()])
            .unwrap();
        model
            .backward(|model| {
                model.pre_backward(root)?;
                model.pre_backward(block)?;
                model.accumulate_grad(flat, Some(Grad::from(grad)))
            })
            .unwrap();

        let rank = model.rank();
        let expected = [tensor(&[3], &[1.0, 1.0, 1.0]), tensor(&[3], &[1.0, 2.0, 0.0])][rank].clone();
        assert_eq!(model.param(flat).unwrap().grad().unwrap(), &expected);
    });
}
