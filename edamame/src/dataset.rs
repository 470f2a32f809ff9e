use crate::common::*;
use crate::config::SizeFactorMethod;
use crate::error::EdamameError;
use crate::normalization::*;

use matrix_util::common_io::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub const COUNTS_FILE: &str = "counts.tsv.gz";
pub const SIZE_FACTORS_FILE: &str = "size_factors.tsv.gz";
pub const SPLIT_FILE: &str = "split.tsv.gz";
pub const PREPROCESS_META_FILE: &str = "preprocess.json";

/// Samples x features count matrix with names
#[derive(Clone, Debug)]
pub struct CountDataset {
    pub samples: Vec<Box<str>>,
    pub features: Vec<Box<str>>,
    pub counts: Mat,
}

impl CountDataset {
    pub fn num_samples(&self) -> usize {
        self.counts.nrows()
    }

    pub fn num_features(&self) -> usize {
        self.counts.ncols()
    }

    /// Read a delimited table (optionally gzipped) whose first row
    /// holds column names and first column holds row names
    ///
    /// * `file` - table file
    /// * `transpose` - the table is features x samples
    pub fn read_table(file: &str, transpose: bool) -> anyhow::Result<Self> {
        let MatWithNames { rows, cols, mat } =
            Mat::read_data_with_names(file, &TABLE_DELIMITERS).map_err(|e| {
                EdamameError::InvalidCounts(format!("failed to parse {}: {}", file, e))
            })?;

        let dataset = if transpose {
            CountDataset {
                samples: cols,
                features: rows,
                counts: mat.transpose(),
            }
        } else {
            CountDataset {
                samples: rows,
                features: cols,
                counts: mat,
            }
        };

        validate_counts(&dataset.counts)?;
        Ok(dataset)
    }

    pub fn write_table(&self, file: &str) -> anyhow::Result<()> {
        self.counts
            .write_data_with_names(file, &self.samples, &self.features, "sample")
    }

    /// Drop samples and features without any count
    ///
    /// Returns the numbers of (samples, features) removed
    pub fn drop_empty(&mut self) -> (usize, usize) {
        let keep_rows: Vec<usize> = (0..self.num_samples())
            .filter(|&i| self.counts.row(i).iter().any(|&x| x > 0.0))
            .collect();
        let keep_cols: Vec<usize> = (0..self.num_features())
            .filter(|&j| self.counts.column(j).iter().any(|&x| x > 0.0))
            .collect();

        let dropped = (
            self.num_samples() - keep_rows.len(),
            self.num_features() - keep_cols.len(),
        );

        if dropped != (0, 0) {
            self.counts = Mat::from_fn(keep_rows.len(), keep_cols.len(), |i, j| {
                self.counts[(keep_rows[i], keep_cols[j])]
            });
            self.samples = keep_rows.iter().map(|&i| self.samples[i].clone()).collect();
            self.features = keep_cols.iter().map(|&j| self.features[j].clone()).collect();
        }
        dropped
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fold {
    Train,
    Test,
}

impl Fold {
    pub fn name(&self) -> &'static str {
        match self {
            Fold::Train => "train",
            Fold::Test => "test",
        }
    }
}

/// Settings recorded next to a preprocessed dataset
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreprocessMeta {
    pub normtype: SizeFactorMethod,
    pub reference: SizeFactorReference,
    pub transposed: bool,
    pub test_fraction: Option<f32>,
    pub seed: u64,
}

/// Output of `preprocess`, input of `train`
#[derive(Clone, Debug)]
pub struct PreprocessedData {
    pub dataset: CountDataset,
    pub size_factors: Vec<f32>,
    pub split: Vec<Fold>,
    pub reference: SizeFactorReference,
}

impl PreprocessedData {
    pub fn indices_of(&self, fold: Fold) -> Vec<usize> {
        self.split
            .iter()
            .enumerate()
            .filter(|&(_, &f)| f == fold)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn write_dir(&self, dir: &str, meta: &PreprocessMeta) -> anyhow::Result<()> {
        mkdir(dir)?;
        self.dataset.write_table(&join_path(dir, COUNTS_FILE))?;

        let sf = Mat::from_column_slice(self.size_factors.len(), 1, &self.size_factors);
        sf.write_data_with_names(
            &join_path(dir, SIZE_FACTORS_FILE),
            &self.dataset.samples,
            &["size_factor".into()],
            "sample",
        )?;

        let mut lines: Vec<Box<str>> = vec!["sample\tfold".into()];
        lines.extend(
            self.dataset
                .samples
                .iter()
                .zip(self.split.iter())
                .map(|(s, f)| format!("{}\t{}", s, f.name()).into_boxed_str()),
        );
        write_lines(&lines, &join_path(dir, SPLIT_FILE))?;

        let json = serde_json::to_string_pretty(meta)?;
        std::fs::write(join_path(dir, PREPROCESS_META_FILE), json)?;
        Ok(())
    }

    pub fn read_dir(dir: &str) -> anyhow::Result<Self> {
        let meta: PreprocessMeta = serde_json::from_str(&std::fs::read_to_string(join_path(
            dir,
            PREPROCESS_META_FILE,
        ))?)?;

        let MatWithNames { rows, cols, mat } =
            Mat::read_data_with_names(&join_path(dir, COUNTS_FILE), "\t")?;
        validate_counts(&mat)?;
        let dataset = CountDataset {
            samples: rows,
            features: cols,
            counts: mat,
        };

        let sf = Mat::read_data_with_names(&join_path(dir, SIZE_FACTORS_FILE), "\t")?;
        if sf.rows != dataset.samples || sf.mat.ncols() != 1 {
            return Err(anyhow::anyhow!(
                "size factors don't match the samples in {}",
                dir
            ));
        }

        let split_lines = read_lines_of_words_delim(&join_path(dir, SPLIT_FILE), "\t", Some(0))?;
        let split = split_lines
            .lines
            .iter()
            .zip(dataset.samples.iter())
            .map(|(words, sample)| match words.as_slice() {
                [s, fold] if s == sample => match &**fold {
                    "train" => Ok(Fold::Train),
                    "test" => Ok(Fold::Test),
                    _ => Err(anyhow::anyhow!("unknown fold `{}`", fold)),
                },
                _ => Err(anyhow::anyhow!("split file doesn't match sample {}", sample)),
            })
            .collect::<anyhow::Result<Vec<Fold>>>()?;

        if split.len() != dataset.num_samples() {
            return Err(anyhow::anyhow!(
                "{} folds for {} samples",
                split.len(),
                dataset.num_samples()
            ));
        }

        Ok(PreprocessedData {
            size_factors: sf.mat.iter().copied().collect(),
            split,
            reference: meta.reference,
            dataset,
        })
    }

    pub fn is_preprocessed_dir(path: &str) -> bool {
        Path::new(path).join(PREPROCESS_META_FILE).is_file()
    }

    /// Load a preprocessed directory, or a raw table with `zheng` size
    /// factors and every sample in the training fold
    pub fn load(path: &str, transpose: bool) -> anyhow::Result<Self> {
        if Self::is_preprocessed_dir(path) {
            info!("Reading the preprocessed dataset in {}", path);
            return Self::read_dir(path);
        }

        info!("Reading the count table {}", path);
        let dataset = CountDataset::read_table(path, transpose)?;
        let (size_factors, reference) =
            estimate_size_factors(&dataset.counts, SizeFactorMethod::Zheng)?;
        Ok(PreprocessedData {
            split: vec![Fold::Train; dataset.num_samples()],
            size_factors,
            reference,
            dataset,
        })
    }
}

/// Sorted set of side labels and their one-hot encoding
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionVocabulary {
    pub labels: Vec<Box<str>>,
}

impl ConditionVocabulary {
    pub fn from_labels(labels: &[Box<str>]) -> Self {
        let mut uniq: Vec<Box<str>> = labels
            .iter()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        uniq.sort();
        Self { labels: uniq }
    }

    /// a single label shared by every sample
    pub fn single() -> Self {
        Self {
            labels: vec!["all".into()],
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// samples x labels indicator matrix
    pub fn one_hot(&self, labels: &[Box<str>]) -> Result<Mat, EdamameError> {
        let index: HashMap<&str, usize> = self
            .labels
            .iter()
            .enumerate()
            .map(|(k, l)| (&**l, k))
            .collect();

        let mut ret = Mat::zeros(labels.len(), self.len());
        for (i, l) in labels.iter().enumerate() {
            let k = index
                .get(&**l)
                .ok_or_else(|| EdamameError::UnknownCondition(l.to_string()))?;
            ret[(i, *k)] = 1.0;
        }
        Ok(ret)
    }

    pub fn one_hot_single(&self, num_samples: usize) -> Result<Mat, EdamameError> {
        let label: Box<str> = self
            .labels
            .first()
            .cloned()
            .ok_or_else(|| EdamameError::UnknownCondition(String::new()))?;
        self.one_hot(&vec![label; num_samples])
    }
}

/// Read `sample<TAB>label` lines and order labels by `samples`
pub fn read_conditions(file: &str, samples: &[Box<str>]) -> anyhow::Result<Vec<Box<str>>> {
    let parsed = read_lines_of_words_delim(file, &TABLE_DELIMITERS, None)?;

    let mut sample_to_label: HashMap<Box<str>, Box<str>> = HashMap::new();
    for (i, words) in parsed.lines.into_iter().enumerate() {
        if words.len() < 2 {
            return Err(anyhow::anyhow!(
                "{} line {}: expected `sample<TAB>label`",
                file,
                i + 1
            ));
        }
        let mut words = words.into_iter();
        if let (Some(s), Some(l)) = (words.next(), words.next()) {
            sample_to_label.insert(s, l);
        }
    }

    samples
        .iter()
        .map(|s| {
            sample_to_label
                .get(s)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no condition for sample {} in {}", s, file))
        })
        .collect()
}
