use crate::common::*;
use crate::config::{InputNormalization, SizeFactorMethod};
use crate::error::EdamameError;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Standard deviations below this are treated as constant features
const MIN_FEATURE_STD: f32 = 1e-8;

/// What a size factor estimator needs to score a new sample
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum SizeFactorReference {
    /// per-feature log geometric means; `None` for features with a
    /// zero in some reference sample
    Deseq { log_geomeans: Vec<Option<f32>> },
    /// median library size of the reference samples
    Zheng { median_library_size: f32 },
}

impl SizeFactorReference {
    pub fn method(&self) -> SizeFactorMethod {
        match self {
            SizeFactorReference::Deseq { .. } => SizeFactorMethod::Deseq,
            SizeFactorReference::Zheng { .. } => SizeFactorMethod::Zheng,
        }
    }
}

/// Reject negative, NaN or infinite entries
pub fn validate_counts(counts: &Mat) -> Result<(), EdamameError> {
    for (j, col) in counts.column_iter().enumerate() {
        if let Some((i, x)) = col.iter().enumerate().find(|(_, x)| !x.is_finite() || **x < 0.0) {
            return Err(EdamameError::InvalidCounts(format!(
                "entry ({}, {}) = {} is not a non-negative finite number",
                i, j, x
            )));
        }
    }
    Ok(())
}

pub fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        Some(values[n / 2])
    } else {
        Some(0.5 * (values[n / 2 - 1] + values[n / 2]))
    }
}

/// Estimate per-sample size factors of a samples x features matrix
/// and the reference to score new samples with
pub fn estimate_size_factors(
    counts: &Mat,
    method: SizeFactorMethod,
) -> anyhow::Result<(Vec<f32>, SizeFactorReference)> {
    let reference = match method {
        SizeFactorMethod::Zheng => {
            let mut lib: Vec<f32> = library_sizes(counts);
            let median_library_size = median(&mut lib)
                .ok_or_else(|| EdamameError::InvalidCounts("no samples".into()))?;
            SizeFactorReference::Zheng {
                median_library_size,
            }
        }
        SizeFactorMethod::Deseq => {
            let nn = counts.nrows().max(1) as f32;
            let log_geomeans = counts
                .column_iter()
                .map(|x_j| {
                    if x_j.iter().all(|&x| x > 0.0) {
                        Some(x_j.iter().map(|x| x.ln()).sum::<f32>() / nn)
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>();
            SizeFactorReference::Deseq { log_geomeans }
        }
    };

    let sf = size_factors_from_reference(counts, &reference)?;
    Ok((sf, reference))
}

/// Size factors of samples against a persisted reference
///
/// * `deseq`: exp(median_j(log x_ij - log geomean_j)) over features
///   with a finite reference and a non-zero count
/// * `zheng`: library size / reference median library size
pub fn size_factors_from_reference(
    counts: &Mat,
    reference: &SizeFactorReference,
) -> anyhow::Result<Vec<f32>> {
    let sf: Vec<f32> = match reference {
        SizeFactorReference::Zheng {
            median_library_size,
        } => {
            if !(*median_library_size > 0.0) {
                return Err(EdamameError::InvalidCounts(
                    "the median library size is zero".into(),
                )
                .into());
            }
            library_sizes(counts)
                .into_iter()
                .map(|l| l / median_library_size)
                .collect()
        }
        SizeFactorReference::Deseq { log_geomeans } => {
            if log_geomeans.len() != counts.ncols() {
                return Err(EdamameError::DimensionMismatch {
                    expected: log_geomeans.len(),
                    found: counts.ncols(),
                }
                .into());
            }
            if log_geomeans.iter().all(|g| g.is_none()) {
                return Err(EdamameError::InvalidCounts(
                    "no feature is non-zero in every sample; try `--normtype zheng`".into(),
                )
                .into());
            }

            (0..counts.nrows())
                .into_par_iter()
                .map(|i| {
                    let mut ratios = counts
                        .row(i)
                        .iter()
                        .zip(log_geomeans.iter())
                        .filter_map(|(&x, g)| match g {
                            Some(g) if x > 0.0 => Some(x.ln() - g),
                            _ => None,
                        })
                        .collect::<Vec<f32>>();
                    median(&mut ratios).map(f32::exp).unwrap_or(0.0)
                })
                .collect()
        }
    };

    if let Some(i) = sf.iter().position(|s| !(*s > 0.0) || !s.is_finite()) {
        return Err(EdamameError::InvalidCounts(format!(
            "sample {} has no usable counts for size factor estimation",
            i
        ))
        .into());
    }
    Ok(sf)
}

pub fn library_sizes(counts: &Mat) -> Vec<f32> {
    counts.row_iter().map(|x_i| x_i.sum()).collect()
}

/// Divide rows by size factors (if enabled) and apply log1p (if
/// enabled)
pub fn transform_counts(counts: &Mat, sf: &[f32], norm: &InputNormalization) -> Mat {
    let mut x = counts.clone();
    if norm.size_factors {
        for (mut x_i, &s) in x.row_iter_mut().zip(sf.iter()) {
            x_i /= s;
        }
    }
    if norm.log_input {
        x.apply(|v| *v = v.ln_1p());
    }
    x
}

/// Per-feature standardization statistics of the training input
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaling {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl FeatureScaling {
    pub fn fit(x: &Mat) -> Self {
        let mean = x.column_means();
        let std = x
            .column_stds()
            .iter()
            .map(|&s| if s > MIN_FEATURE_STD { s } else { 1.0 })
            .collect();
        Self {
            mean: mean.iter().copied().collect(),
            std,
        }
    }

    pub fn apply(&self, x: &Mat) -> anyhow::Result<Mat> {
        if x.ncols() != self.mean.len() {
            return Err(EdamameError::DimensionMismatch {
                expected: self.mean.len(),
                found: x.ncols(),
            }
            .into());
        }
        let mut ret = x.clone();
        for (mut x_j, (&mu, &sd)) in ret
            .column_iter_mut()
            .zip(self.mean.iter().zip(self.std.iter()))
        {
            x_j.apply(|v| *v = (*v - mu) / sd);
        }
        Ok(ret)
    }
}

/// Model input of count rows: size factor division, log1p and
/// standardization with the given statistics
pub fn model_input(
    counts: &Mat,
    sf: &[f32],
    norm: &InputNormalization,
    scaling: Option<&FeatureScaling>,
) -> anyhow::Result<Mat> {
    let x = transform_counts(counts, sf, norm);
    match scaling {
        Some(scaling) if norm.scale_input => scaling.apply(&x),
        _ => Ok(x),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn toy_counts() -> Mat {
        Mat::from_row_slice(
            3,
            4,
            &[
                10., 20., 0., 5., //
                20., 40., 1., 10., //
                5., 10., 0., 2.5,
            ],
        )
    }

    #[test]
    fn zheng_factors_follow_library_size() -> anyhow::Result<()> {
        let (sf, reference) = estimate_size_factors(&toy_counts(), SizeFactorMethod::Zheng)?;
        // library sizes 35, 71, 17.5; median 35
        assert_abs_diff_eq!(sf[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sf[1], 71.0 / 35.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sf[2], 0.5, epsilon = 1e-6);
        assert_eq!(
            reference,
            SizeFactorReference::Zheng {
                median_library_size: 35.0
            }
        );
        Ok(())
    }

    #[test]
    fn deseq_factors_skip_features_with_zeros() -> anyhow::Result<()> {
        let (sf, reference) = estimate_size_factors(&toy_counts(), SizeFactorMethod::Deseq)?;
        match &reference {
            SizeFactorReference::Deseq { log_geomeans } => {
                assert!(log_geomeans[2].is_none());
                assert!(log_geomeans[0].is_some());
            }
            _ => panic!("expected a deseq reference"),
        }
        // rows are exact multiples 1 : 2 : 1/2 on usable features
        assert_abs_diff_eq!(sf[1] / sf[0], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(sf[2] / sf[0], 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(sf.iter().map(|s| s.ln()).sum::<f32>(), 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn zero_sample_is_rejected() {
        let counts = Mat::from_row_slice(2, 2, &[1., 2., 0., 0.]);
        assert!(estimate_size_factors(&counts, SizeFactorMethod::Zheng).is_err());
    }

    #[test]
    fn negative_counts_are_invalid() {
        let counts = Mat::from_row_slice(2, 2, &[1., -2., 0., 3.]);
        assert!(matches!(
            validate_counts(&counts),
            Err(EdamameError::InvalidCounts(_))
        ));
        let counts = Mat::from_row_slice(1, 2, &[1., f32::NAN]);
        assert!(validate_counts(&counts).is_err());
    }

    #[test]
    fn scaling_standardizes_and_guards_constants() -> anyhow::Result<()> {
        let x = Mat::from_row_slice(3, 2, &[1., 5., 2., 5., 3., 5.]);
        let scaling = FeatureScaling::fit(&x);
        assert_eq!(scaling.std[1], 1.0);

        let z = scaling.apply(&x)?;
        assert_abs_diff_eq!(z[(0, 0)], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(z[(2, 0)], 1.0, epsilon = 1e-6);
        assert!(z.column(1).iter().all(|&v| v == 0.0));
        Ok(())
    }

    #[test]
    fn input_chain_order() -> anyhow::Result<()> {
        let counts = Mat::from_row_slice(2, 1, &[4., 9.]);
        let sf = [2.0, 3.0];
        let norm = InputNormalization {
            size_factors: true,
            log_input: true,
            scale_input: false,
        };
        let x = model_input(&counts, &sf, &norm, None)?;
        assert_abs_diff_eq!(x[(0, 0)], 3f32.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(x[(1, 0)], 4f32.ln(), epsilon = 1e-6);
        Ok(())
    }
}
