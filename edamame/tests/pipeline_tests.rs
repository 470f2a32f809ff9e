use clap::Parser;
use approx::assert_abs_diff_eq;
use candle_util::candle_core::Device;
use candle_util::candle_data_loader::DataLoader;
use edamame::artifact::*;
use edamame::common::EVAL_BATCH_SIZE;
use edamame::dataset::*;
use edamame::error::EdamameError;
use edamame::normalization::model_input;
use edamame::predict::*;
use edamame::preprocess::*;
use edamame::train::*;
use matrix_util::common_io::write_lines;
use matrix_util::traits::{IoOps, MatWithNames, SampleOps};
use nalgebra::DMatrix;
use tempfile::TempDir;

type Mat = DMatrix<f32>;

#[derive(Parser)]
struct PreprocessCli {
    #[command(flatten)]
    args: PreprocessArgs,
}

#[derive(Parser)]
struct TrainCli {
    #[command(flatten)]
    args: TrainArgs,
}

#[derive(Parser)]
struct PredictCli {
    #[command(flatten)]
    args: PredictArgs,
}

fn preprocess_args(argv: &[&str]) -> PreprocessArgs {
    PreprocessCli::try_parse_from(std::iter::once("preprocess").chain(argv.iter().copied()))
        .expect("preprocess arguments")
        .args
}

fn train_args(argv: &[&str]) -> TrainArgs {
    TrainCli::try_parse_from(std::iter::once("train").chain(argv.iter().copied()))
        .expect("train arguments")
        .args
}

fn predict_args(argv: &[&str]) -> PredictArgs {
    PredictCli::try_parse_from(std::iter::once("predict").chain(argv.iter().copied()))
        .expect("predict arguments")
        .args
}

fn path_in(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

fn sample_names(nn: usize) -> Vec<Box<str>> {
    (0..nn).map(|i| format!("cell{}", i).into_boxed_str()).collect()
}

/// Poisson counts of a rank-2 rate matrix; every sample and feature
/// has at least one count
fn simulate_counts(nn: usize, dd: usize) -> anyhow::Result<Mat> {
    let loadings = Mat::runif(nn, 2);
    let factors = Mat::runif(2, dd);
    let rate = (loadings * factors).map(|x| 1.0 + 8.0 * x);
    let mut counts = Mat::rpois(&rate)?;
    for i in 0..nn {
        counts[(i, i % dd)] += 1.0;
    }
    Ok(counts)
}

fn write_count_table(file: &str, nn: usize, dd: usize) -> anyhow::Result<Mat> {
    let counts = simulate_counts(nn, dd)?;
    let features: Vec<Box<str>> = (0..dd)
        .map(|j| format!("gene{}", j).into_boxed_str())
        .collect();
    counts.write_data_with_names(file, &sample_names(nn), &features, "cell")?;
    Ok(counts)
}

fn read_table(file: &str) -> anyhow::Result<Mat> {
    let MatWithNames { mat, .. } = Mat::read_data_with_names(file, "\t")?;
    Ok(mat)
}

#[test]
fn preprocess_train_predict() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let table = path_in(&dir, "counts.tsv.gz");
    let prep = path_in(&dir, "prep");
    let model = path_in(&dir, "model");
    let pred = path_in(&dir, "pred");

    write_count_table(&table, 100, 20)?;

    let data = run_preprocess(&preprocess_args(&[&table, "-o", &prep, "--testsplit"]))?;
    assert_eq!(data.indices_of(Fold::Test).len(), 10);

    let outcome = run_train(&train_args(&[
        &prep, "-o", &model, "-t", "nb", "-s", "8,4,8", "-e", "5",
    ]))?;
    assert_eq!(outcome.history.len(), 5);
    assert_eq!(outcome.stopped, TrainingState::MaxEpochsReached);

    let reduced = read_table(&join(&model, REDUCED_FILE))?;
    assert_eq!(reduced.shape(), (100, 4));
    let mean = read_table(&join(&model, MEAN_FILE))?;
    assert_eq!(mean.shape(), (100, 20));
    assert!(mean.iter().all(|&x| x > 0.0 && x.is_finite()));
    let theta = read_table(&join(&model, DISPERSION_FILE))?;
    assert_eq!(theta.shape(), (100, 20));
    assert!(!std::path::Path::new(&join(&model, DROPOUT_FILE)).exists());

    let history = read_history(&join(&model, HISTORY_FILE))?;
    assert_eq!(history, outcome.history);

    let preds = run_predict(&predict_args(&[&table, &model, "-o", &pred]))?;
    assert_eq!(preds.reduced.shape(), (100, 4));
    assert_eq!(preds.mean.shape(), (100, 20));
    assert_eq!(read_table(&join(&pred, REDUCED_FILE))?.shape(), (100, 4));
    Ok(())
}

#[test]
fn prediction_is_deterministic() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let table = path_in(&dir, "counts.tsv.gz");
    let model = path_in(&dir, "model");

    write_count_table(&table, 60, 12)?;
    run_train(&train_args(&[
        &table, "-o", &model, "-t", "zinb", "-s", "6,3,6", "-e", "3", "-d", "0.1",
        "--no-reconstruct", "--no-reduce",
    ]))?;

    let first = run_predict(&predict_args(&[&table, &model, "-o", &path_in(&dir, "p1")]))?;
    let second = run_predict(&predict_args(&[&table, &model, "-o", &path_in(&dir, "p2")]))?;

    assert_eq!(first.mean, second.mean);
    assert_eq!(first.reduced, second.reduced);
    assert_eq!(first.dropout, second.dropout);

    let pi = first.dropout.expect("zinb has dropout");
    assert!(pi.iter().all(|&p| (0.0..=1.0).contains(&p)));
    Ok(())
}

#[test]
fn feature_count_must_match() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let table = path_in(&dir, "counts.tsv.gz");
    let narrow = path_in(&dir, "narrow.tsv.gz");
    let model = path_in(&dir, "model");

    write_count_table(&table, 40, 10)?;
    write_count_table(&narrow, 40, 9)?;

    run_train(&train_args(&[
        &table, "-o", &model, "-t", "poisson", "-s", "4", "-e", "2",
    ]))?;

    let err = run_predict(&predict_args(&[&narrow, &model, "-o", &path_in(&dir, "p")]))
        .expect_err("9 features for a 10-feature model");
    assert!(matches!(
        err.downcast_ref::<EdamameError>(),
        Some(EdamameError::DimensionMismatch {
            expected: 10,
            found: 9
        })
    ));
    Ok(())
}

#[test]
fn training_summary_and_kernels_are_saved() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let table = path_in(&dir, "counts.tsv.gz");
    let model = path_in(&dir, "model");

    write_count_table(&table, 80, 15)?;
    let outcome = run_train(&train_args(&[
        &table,
        "-o",
        &model,
        "-t",
        "nb-fork",
        "-s",
        "8,4,8",
        "-e",
        "8",
        "--validation-split",
        "0.25",
        "--saveweights",
    ]))?;

    let val: Vec<f64> = outcome
        .history
        .iter()
        .map(|r| r.val_loss.expect("validation loss"))
        .collect();
    let best = outcome.best_loss.expect("best loss");
    assert!(val.iter().all(|&v| best <= v));

    let config = ArtifactConfig::read(&model)?;
    let summary = config.training.expect("training summary");
    assert_eq!(summary.best_epoch, outcome.best_epoch);
    assert_eq!(summary.epochs_run, 8);

    let kernels = std::fs::read_dir(join(&model, WEIGHTS_DIR))?.count();
    assert!(kernels > 0);
    Ok(())
}

#[test]
fn conditions_must_be_known() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let table = path_in(&dir, "counts.tsv.gz");
    let model = path_in(&dir, "model");
    let cond = path_in(&dir, "cond.tsv");
    let new_cond = path_in(&dir, "new_cond.tsv");

    write_count_table(&table, 30, 8)?;
    let samples = sample_names(30);

    let lines: Vec<Box<str>> = samples
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}\tbatch{}", s, i % 2).into_boxed_str())
        .collect();
    write_lines(&lines, &cond)?;

    let lines: Vec<Box<str>> = samples
        .iter()
        .map(|s| format!("{}\tbatch9", s).into_boxed_str())
        .collect();
    write_lines(&lines, &new_cond)?;

    run_train(&train_args(&[
        &table,
        "-o",
        &model,
        "-t",
        "zinb-conddisp",
        "-s",
        "6,3,6",
        "-e",
        "2",
        "--conditions",
        &cond,
    ]))?;

    let config = ArtifactConfig::read(&model)?;
    assert_eq!(config.model.num_conditions, 2);

    let ok = run_predict(&predict_args(&[
        &table,
        &model,
        "-o",
        &path_in(&dir, "p1"),
        "--conditions",
        &cond,
    ]))?;
    assert_eq!(ok.dispersion.map(|m| m.shape()), Some((30, 8)));

    let err = run_predict(&predict_args(&[
        &table,
        &model,
        "-o",
        &path_in(&dir, "p2"),
        "--conditions",
        &new_cond,
    ]))
    .expect_err("batch9 was never seen");
    assert!(matches!(
        err.downcast_ref::<EdamameError>(),
        Some(EdamameError::UnknownCondition(l)) if l == "batch9"
    ));
    Ok(())
}

#[test]
fn shared_dispersion_is_constant_across_samples() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let table = path_in(&dir, "counts.tsv.gz");
    let model = path_in(&dir, "model");

    write_count_table(&table, 30, 8)?;
    run_train(&train_args(&[
        &table, "-o", &model, "-t", "nb-shared", "-s", "4", "-e", "2", "--nobatchnorm",
    ]))?;

    let theta = read_table(&join(&model, DISPERSION_FILE))?;
    for j in 0..theta.ncols() {
        let col = theta.column(j);
        assert!(col.iter().all(|&x| x == col[0]));
    }
    Ok(())
}

#[test]
fn unknown_noise_model_fails_before_reading() {
    let err = run_train(&train_args(&["missing.tsv", "-o", "unused", "-t", "gamma"]))
        .expect_err("gamma is not a noise model");
    assert!(matches!(
        err.downcast_ref::<EdamameError>(),
        Some(EdamameError::UnrecognizedVariant { .. })
    ));
}

#[test]
fn reloaded_checkpoint_scores_the_best_loss() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let table = path_in(&dir, "counts.tsv.gz");
    let prep = path_in(&dir, "prep");
    let model = path_in(&dir, "model");

    write_count_table(&table, 100, 20)?;
    run_preprocess(&preprocess_args(&[&table, "-o", &prep, "--testsplit"]))?;

    let args = train_args(&[
        &prep, "-o", &model, "-t", "zinb", "-s", "8,4,8", "-e", "25", "--earlystop", "3",
    ]);
    let outcome = run_train(&args)?;
    let best = outcome.best_loss.expect("best loss");

    // score the test fold with the weights on disk
    let dev = Device::Cpu;
    let trained = TrainedModel::load(&model, &dev)?;
    let config = &trained.config;
    let data = PreprocessedData::read_dir(&prep)?;
    let nn = data.dataset.num_samples();

    let input = model_input(
        &data.dataset.counts,
        &data.size_factors,
        &config.normalization,
        config.scaling.as_ref(),
    )?;
    let sf = Mat::from_column_slice(nn, 1, &data.size_factors);
    let test_idx = data.indices_of(Fold::Test);
    let mut test_data = in_memory_data(&input, &data.dataset.counts, &sf, None, &test_idx, None)?;
    test_data.ordered_minibatch(EVAL_BATCH_SIZE)?;

    let train_config = args.train_config()?;
    let trainer = Trainer {
        model: &trained.model,
        varmap: &trained.varmap,
        config: &train_config,
        use_size_factors: config.normalization.size_factors,
        device: &dev,
        checkpoint: None,
        verbose: true,
    };
    let loss = trainer.evaluate(&test_data, 0)?;

    assert_abs_diff_eq!(loss, best, epsilon = 1e-9);
    for r in outcome.history.iter() {
        assert!(loss <= r.val_loss.expect("validation loss"));
    }
    Ok(())
}

#[test]
fn plateau_halves_the_rate_then_stops() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let table = path_in(&dir, "counts.tsv.gz");
    let prep = path_in(&dir, "prep");
    let model = path_in(&dir, "model");

    write_count_table(&table, 100, 20)?;
    run_preprocess(&preprocess_args(&[&table, "-o", &prep, "--testsplit"]))?;

    // a vanishing step size keeps the loss flat from the first epoch
    let outcome = run_train(&train_args(&[
        &prep,
        "-o",
        &model,
        "-t",
        "zinb",
        "-s",
        "8,4,8",
        "-e",
        "20",
        "--optimizer",
        "sgd",
        "-r",
        "1e-20",
        "--nobatchnorm",
        "--earlystop",
        "5",
        "--reducelr",
        "2",
    ]))?;

    assert_eq!(outcome.stopped, TrainingState::EarlyStopped);
    assert_eq!(outcome.best_epoch, Some(1));
    assert_eq!(outcome.history.len(), 1 + 5);

    let first = outcome.history[0].val_loss.expect("validation loss");
    assert!(outcome.history.iter().all(|r| r.val_loss == Some(first)));

    let lr: Vec<f64> = outcome.history.iter().map(|r| r.learning_rate).collect();
    let expected = [1e-20, 1e-20, 1e-20, 5e-21, 5e-21, 2.5e-21];
    for (a, b) in lr.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-30);
    }
    Ok(())
}

#[test]
fn divergence_aborts_training() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let table = path_in(&dir, "counts.tsv.gz");
    let model = path_in(&dir, "model");

    write_count_table(&table, 60, 12)?;
    let err = run_train(&train_args(&[
        &table,
        "-o",
        &model,
        "-t",
        "zinb",
        "-s",
        "8,4,8",
        "--optimizer",
        "sgd",
        "-r",
        "1e30",
        "--gradclip",
        "0",
    ]))
    .expect_err("a huge step must blow up");

    assert!(matches!(
        err.downcast_ref::<EdamameError>(),
        Some(EdamameError::NumericInstability { .. })
    ));
    Ok(())
}

fn join(dir: &str, file: &str) -> String {
    matrix_util::common_io::join_path(dir, file)
}
