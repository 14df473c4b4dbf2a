//! Trainer and train-state lifecycle tests

use super::*;
use crate::checkpoint::{CheckpointKind, StreamingCheckpointer, ROLLING_FILE};
use crate::optim::{AdamW, SGD};
use crate::rng::RngKey;
use crate::sharding::{Mesh, PartitionRule, PartitionSpec};
use crate::Error;
use approx::assert_abs_diff_eq;
use ndarray::Array2;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const VOCAB: usize = 8;

fn rules() -> Vec<PartitionRule> {
    vec![
        PartitionRule::new(r"lm\.table", PartitionSpec::from_axes([Some("dp"), None])).unwrap(),
        PartitionRule::new(r".*", PartitionSpec::from_axes([None::<&str>])).unwrap(),
    ]
}

fn batches(count: usize, salt: usize) -> Vec<Batch> {
    (0..count)
        .map(|i| {
            let tokens = Array2::from_shape_fn((2, 6), |(b, t)| {
                ((i * 7 + b * 3 + t * 5 + salt) % VOCAB) as i32
            });
            Batch::unmasked(tokens)
        })
        .collect()
}

fn data(count: usize) -> DataSources {
    DataSources::new(
        VecBatchIterator::new(batches(count, 0)),
        VecBatchIterator::new(batches(count, 1)),
    )
}

fn model() -> BigramModel {
    BigramModel::new(BigramConfig::new(VOCAB)).unwrap()
}

fn checkpointer(dir: &Path) -> StreamingCheckpointer {
    StreamingCheckpointer::new(dir)
        .with_save_optimizer_state(true)
        .with_retry_backoff(Duration::from_millis(1))
}

fn trainer(dir: &Path, mesh: Mesh, config: TrainConfig) -> Trainer {
    Trainer::new(
        Box::new(model()),
        Box::new(AdamW::default_params(0.05)),
        rules(),
        mesh,
        checkpointer(dir),
        config,
    )
}

fn gathered_params(trainer: &Trainer, outcome: &TrainOutcome) -> crate::tree::ParameterTree {
    trainer
        .shardings()
        .unwrap()
        .params
        .gather_tree(&outcome.state.params)
        .unwrap()
}

#[test]
fn test_run_reaches_total_steps() {
    let dir = TempDir::new().unwrap();
    let sink = MemorySink::new();
    let mut t = trainer(dir.path(), Mesh::single(), TrainConfig::new().with_total_steps(6).with_logging(2, 0))
        .with_sink(sink.clone());
    let outcome = t.run(&mut data(10)).unwrap();

    assert_eq!(outcome.termination, Termination::Completed);
    assert_eq!(outcome.final_step, 6);
    assert_eq!(outcome.steps_run, 6);
    assert_eq!(t.phase(), Phase::Completed);

    let records = sink.records();
    assert_eq!(records.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![0, 2, 4]);
    let keys: Vec<&str> = records[0].1.keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        vec![
            "gradient_norm",
            "hf_accuracy",
            "hf_loss",
            "learning_rate",
            "param_norm",
            "pt_accuracy",
            "pt_loss"
        ]
    );
}

#[test]
fn test_training_lowers_the_loss() {
    let dir = TempDir::new().unwrap();
    let sink = MemorySink::new();
    let mut t = trainer(dir.path(), Mesh::single(), TrainConfig::new().with_total_steps(40).with_logging(1, 0))
        .with_sink(sink.clone());
    // Cycle the same few batches so the model can fit them
    let cycled = |salt| VecBatchIterator::new((0..40).flat_map(|_| batches(2, salt)).collect());
    t.run(&mut DataSources::new(cycled(0), cycled(1))).unwrap();

    let records = sink.records();
    let first = records.first().unwrap().1["hf_loss"];
    let last = records.last().unwrap().1["hf_loss"];
    assert!(last < first * 0.8, "loss went from {first} to {last}");
}

#[test]
fn test_sharded_run_matches_single_device() {
    let config = || TrainConfig::new().with_total_steps(5).with_logging(1, 0);
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let sink_a = MemorySink::new();
    let sink_b = MemorySink::new();
    let mut single = trainer(dir_a.path(), Mesh::single(), config()).with_sink(sink_a.clone());
    let mut sharded =
        trainer(dir_b.path(), Mesh::parse("dp=2", 2).unwrap(), config()).with_sink(sink_b.clone());

    let a = single.run(&mut data(5)).unwrap();
    let b = sharded.run(&mut data(5)).unwrap();
    assert_eq!(gathered_params(&single, &a), gathered_params(&sharded, &b));
    for ((_, ma), (_, mb)) in sink_a.records().iter().zip(sink_b.records().iter()) {
        assert_eq!(ma["hf_loss"], mb["hf_loss"]);
        assert_eq!(ma["pt_loss"], mb["pt_loss"]);
        assert_abs_diff_eq!(ma["gradient_norm"], mb["gradient_norm"], epsilon = 1e-9);
    }
}

#[test]
fn test_data_exhaustion_ends_gracefully_with_final_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = TrainConfig::new().with_total_steps(100).with_checkpoints(50, 0);
    let mut t = trainer(dir.path(), Mesh::single(), config);
    let mut sources = DataSources::new(
        VecBatchIterator::new(batches(10, 0)),
        VecBatchIterator::new(batches(4, 1)),
    );
    let outcome = t.run(&mut sources).unwrap();

    assert_eq!(
        outcome.termination,
        Termination::DataExhausted {
            source_name: "pt".into()
        }
    );
    assert_eq!(outcome.final_step, 4);
    // initial + final rolling checkpoints
    assert_eq!(outcome.checkpoints.len(), 2);
    let summary = StreamingCheckpointer::inspect(dir.path().join(ROLLING_FILE)).unwrap();
    assert_eq!(summary.metadata.step, 4);
}

#[test]
fn test_stop_request_is_honored_between_steps() {
    let dir = TempDir::new().unwrap();
    let mut t = trainer(dir.path(), Mesh::single(), TrainConfig::new().with_total_steps(10).with_checkpoints(5, 0));
    t.stop_handle().request_stop();
    let outcome = t.run(&mut data(10)).unwrap();
    assert_eq!(outcome.termination, Termination::Interrupted);
    assert_eq!(outcome.steps_run, 0);
    assert!(dir.path().join(ROLLING_FILE).exists());
}

#[test]
fn test_milestone_takes_priority_over_rolling() {
    let dir = TempDir::new().unwrap();
    let config = TrainConfig::new().with_total_steps(4).with_checkpoints(2, 4);
    let mut t = trainer(dir.path(), Mesh::single(), config);
    let outcome = t.run(&mut data(4)).unwrap();

    let written: Vec<(CheckpointKind, u64)> =
        outcome.checkpoints.iter().map(|r| (r.kind, r.step)).collect();
    assert_eq!(
        written,
        vec![
            (CheckpointKind::Rolling, 0),
            (CheckpointKind::Rolling, 2),
            (CheckpointKind::Milestone, 4),
            (CheckpointKind::Rolling, 4),
        ]
    );
    let state: DatasetState =
        StreamingCheckpointer::load_json(dir.path().join(DATASET_STATE_FILE)).unwrap();
    assert_eq!(state.step, 4);
    assert_eq!(state.hf, serde_json::json!({ "position": 4 }));
}

#[test]
fn test_eval_metrics_are_prefixed_and_averaged() {
    let dir = TempDir::new().unwrap();
    let sink = MemorySink::new();
    let config = TrainConfig::new()
        .with_total_steps(1)
        .with_logging(1, 3)
        .with_pt_loss_weight(0.5);
    let mut t = trainer(dir.path(), Mesh::single(), config).with_sink(sink.clone());
    let mut sources = data(1).with_eval(
        VecBatchIterator::new(batches(3, 2)),
        VecBatchIterator::new(batches(2, 3)),
    );
    t.run(&mut sources).unwrap();

    let records = sink.records();
    let (_, metrics) = &records[0];
    let combined = metrics["eval_hf_loss"] + 0.5 * metrics["eval_pt_loss"];
    assert_abs_diff_eq!(metrics["eval_loss"], combined, epsilon = 1e-12);
    assert!(metrics.contains_key("eval_hf_accuracy"));
    assert!(metrics.contains_key("hf_loss"));
}

#[test]
fn test_worker_process_neither_logs_nor_checkpoints() {
    let dir = TempDir::new().unwrap();
    let sink = MemorySink::new();
    let config = TrainConfig::new()
        .with_total_steps(2)
        .with_logging(1, 0)
        .with_checkpoints(1, 0)
        .with_process(1, false);
    let mut t = trainer(dir.path(), Mesh::single(), config).with_sink(sink.clone());
    let outcome = t.run(&mut data(2)).unwrap();

    assert_eq!(outcome.final_step, 2);
    assert!(outcome.checkpoints.is_empty());
    assert!(sink.records().is_empty());
    assert!(!t.checkpointer().is_enabled());
    assert!(!dir.path().join(ROLLING_FILE).exists());
}

#[test]
fn test_divisibility_fails_before_any_io() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("ckpt");
    let config = TrainConfig::new().with_total_steps(2).with_checkpoints(1, 0);
    let mut t = trainer(&root, Mesh::parse("dp=3", 3).unwrap(), config);
    let err = t.run(&mut data(2)).unwrap_err();
    assert!(matches!(err, Error::ShardDivisibility { ref path, .. } if path == "lm.table"));
    assert!(!root.exists());
}

#[test]
fn test_full_restore_resumes_step_and_rng() {
    let dir = TempDir::new().unwrap();
    let mut first = trainer(dir.path(), Mesh::single(), TrainConfig::new().with_total_steps(3).with_checkpoints(3, 0));
    let saved = first.run(&mut data(3)).unwrap();

    let path = dir.path().join(ROLLING_FILE);
    let config = TrainConfig::new()
        .with_total_steps(5)
        .with_load_checkpoint(LoadSource::Full(path.clone()))
        .with_dataset_state(dir.path().join(DATASET_STATE_FILE));
    let resume_dir = TempDir::new().unwrap();
    let mut second = trainer(resume_dir.path(), Mesh::single(), config);
    let outcome = second.run(&mut data(5)).unwrap();
    assert_eq!(outcome.steps_run, 2);
    assert_eq!(outcome.final_step, 5);

    let summary = StreamingCheckpointer::inspect(&path).unwrap();
    assert!(summary.metadata.rng.is_some());
    assert_eq!(summary.metadata.step, saved.final_step);
}

fn factory_fixture(dir: &Path) -> (BigramModel, AdamW, StateShardings, StreamingCheckpointer) {
    let model = model();
    let optimizer = AdamW::default_params(0.01);
    let shardings =
        StateShardings::build(&model, &optimizer, &rules(), &Mesh::parse("dp=2", 2).unwrap()).unwrap();
    (model, optimizer, shardings, checkpointer(dir))
}

#[test]
fn test_restored_params_after_checkpoint_load_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (model, optimizer, shardings, ckpt) = factory_fixture(dir.path());
    let mut factory = TrainStateFactory::new(&model, &optimizer, &shardings, &ckpt);
    let state = factory.from_scratch(RngKey::from_seed(0)).unwrap();
    ckpt.save(
        &crate::checkpoint::CheckpointMetadata::new(state.step),
        &state.params,
        Some(&state.opt_state),
        &shardings.checkpoint().gather,
        CheckpointKind::Rolling,
    )
    .unwrap();

    let mut factory = TrainStateFactory::new(&model, &optimizer, &shardings, &ckpt);
    factory.from_checkpoint(dir.path().join(ROLLING_FILE)).unwrap();
    let params = model.init(RngKey::from_seed(1)).unwrap();
    let err = factory.from_restored_params(params).unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)));
}

#[test]
fn test_full_restore_without_optimizer_state_points_at_params_only() {
    let dir = TempDir::new().unwrap();
    let (model, optimizer, shardings, ckpt) = factory_fixture(dir.path());
    let state = TrainStateFactory::new(&model, &optimizer, &shardings, &ckpt)
        .from_scratch(RngKey::from_seed(0))
        .unwrap();
    ckpt.save(
        &crate::checkpoint::CheckpointMetadata::new(7),
        &state.params,
        None,
        &shardings.checkpoint().gather,
        CheckpointKind::Rolling,
    )
    .unwrap();
    let path = dir.path().join(ROLLING_FILE);

    let mut factory = TrainStateFactory::new(&model, &optimizer, &shardings, &ckpt);
    let err = factory.from_checkpoint(&path).unwrap_err();
    assert!(err.to_string().contains("params-only::"), "{err}");

    let restored = factory.from_checkpoint_params(&path).unwrap();
    assert_eq!(restored.state.step, 0);
    assert_eq!(
        shardings.params.gather_tree(&restored.state.params).unwrap(),
        shardings.params.gather_tree(&state.params).unwrap()
    );
    assert_eq!(restored.metadata.unwrap().step, 7);
}

#[test]
fn test_from_restored_params_checks_shapes() {
    let dir = TempDir::new().unwrap();
    let (model, optimizer, shardings, ckpt) = factory_fixture(dir.path());
    let mut factory = TrainStateFactory::new(&model, &optimizer, &shardings, &ckpt);
    let mut params = model.init(RngKey::from_seed(0)).unwrap();
    params.remove("lm.bias");
    assert!(matches!(
        factory.from_restored_params(params).unwrap_err(),
        Error::MissingLeaf { .. }
    ));
}

#[test]
fn test_sgd_without_momentum_has_empty_optimizer_state() {
    let dir = TempDir::new().unwrap();
    let mut t = Trainer::new(
        Box::new(model()),
        Box::new(SGD::new(0.1, 0.0)),
        rules(),
        Mesh::parse("dp=2", 2).unwrap(),
        checkpointer(dir.path()),
        TrainConfig::new().with_total_steps(3),
    );
    let outcome = t.run(&mut data(3)).unwrap();
    assert!(outcome.state.opt_state.is_empty());
    assert_eq!(outcome.final_step, 3);
}
