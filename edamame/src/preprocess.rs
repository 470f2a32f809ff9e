use crate::common::*;
use crate::config::SizeFactorMethod;
use crate::dataset::*;
use crate::error::EdamameError;
use crate::normalization::*;

use clap::Args;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

#[derive(Args, Debug)]
pub struct PreprocessArgs {
    #[arg(
        required = true,
        help = "Count table",
        long_help = "Delimited count table (tab, comma or space; may be gzipped).\n\
		     First row holds column names and first column row names.\n\
		     Rows are samples unless --transpose is given."
    )]
    pub input: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output directory",
        long_help = "Output directory:\n\
		     - {out}/counts.tsv.gz\n\
		     - {out}/size_factors.tsv.gz\n\
		     - {out}/split.tsv.gz\n\
		     - {out}/preprocess.json\n"
    )]
    pub output: Box<str>,

    #[arg(
        long,
        default_value = "zheng",
        help = "Size factor estimator",
        long_help = "Size factor estimator:\n\
		     deseq: median ratio against per-feature geometric means\n\
		     zheng: library size over the median library size"
    )]
    pub normtype: Box<str>,

    #[arg(long, short, help = "The table is features x samples")]
    pub transpose: bool,

    #[arg(long, help = "Hold out a test fold")]
    pub testsplit: bool,

    #[arg(long, default_value_t = 0.1, help = "Fraction of the test fold")]
    pub test_fraction: f32,

    #[arg(long, default_value_t = 42, help = "Random seed of the split")]
    pub seed: u64,
}

/// Assign `round(n * fraction)` random samples to the test fold,
/// leaving at least one sample on each side when `n >= 2`
pub fn split_folds(nn: usize, test_fraction: f32, seed: u64) -> Vec<Fold> {
    let mut folds = vec![Fold::Train; nn];
    if nn < 2 || !(test_fraction > 0.0) {
        return folds;
    }

    let n_test = ((nn as f32) * test_fraction.min(1.0)).round() as usize;
    let n_test = n_test.clamp(1, nn - 1);

    let mut idx: Vec<usize> = (0..nn).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    idx.shuffle(&mut rng);

    for &i in idx.iter().take(n_test) {
        folds[i] = Fold::Test;
    }
    folds
}

pub fn run_preprocess(args: &PreprocessArgs) -> anyhow::Result<PreprocessedData> {
    let method: SizeFactorMethod = args.normtype.parse()?;

    let mut dataset = CountDataset::read_table(&args.input, args.transpose)?;
    info!(
        "Read {} samples x {} features from {}",
        dataset.num_samples(),
        dataset.num_features(),
        args.input
    );

    let (dropped_samples, dropped_features) = dataset.drop_empty();
    if dropped_samples > 0 || dropped_features > 0 {
        warn!(
            "Removed {} samples and {} features without counts",
            dropped_samples, dropped_features
        );
    }

    if dataset.num_samples() == 0 || dataset.num_features() == 0 {
        return Err(EdamameError::InvalidCounts(format!("{} has no counts", args.input)).into());
    }

    let (size_factors, reference) = estimate_size_factors(&dataset.counts, method)?;

    let test_fraction = args.testsplit.then_some(args.test_fraction);
    let split = match test_fraction {
        Some(f) => split_folds(dataset.num_samples(), f, args.seed),
        None => vec![Fold::Train; dataset.num_samples()],
    };

    let data = PreprocessedData {
        dataset,
        size_factors,
        split,
        reference: reference.clone(),
    };

    let meta = PreprocessMeta {
        normtype: method,
        reference,
        transposed: args.transpose,
        test_fraction,
        seed: args.seed,
    };

    data.write_dir(&args.output, &meta)?;
    info!(
        "Wrote {} samples ({} test) to {}",
        data.dataset.num_samples(),
        data.indices_of(Fold::Test).len(),
        args.output
    );
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_is_sized_and_seeded() {
        let folds = split_folds(100, 0.1, 7);
        let n_test = folds.iter().filter(|&&f| f == Fold::Test).count();
        assert_eq!(n_test, 10);
        assert_eq!(folds, split_folds(100, 0.1, 7));
        assert_ne!(folds, split_folds(100, 0.1, 8));
    }

    #[test]
    fn tiny_splits_keep_both_folds() {
        let folds = split_folds(3, 0.01, 1);
        assert_eq!(folds.iter().filter(|&&f| f == Fold::Test).count(), 1);

        let folds = split_folds(3, 0.99, 1);
        assert_eq!(folds.iter().filter(|&&f| f == Fold::Train).count(), 1);

        assert_eq!(split_folds(1, 0.5, 1), vec![Fold::Train]);
        assert_eq!(split_folds(5, 0.0, 1), vec![Fold::Train; 5]);
    }
}
