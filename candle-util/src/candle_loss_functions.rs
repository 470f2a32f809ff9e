use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::candle_model_traits::CountParams;

/// lower bound applied before any logarithm
pub const LOG_EPS: f64 = 1e-10;

/// upper bound of the negative binomial dispersion
pub const MAX_DISPERSION: f64 = 1e6;

/// observed values below this are treated as zero counts
pub const ZERO_COUNT_TOL: f64 = 1e-8;

const HALF_LOG_TWO_PI: f64 = 0.918_938_533_204_672_8;

/// Numerically stable softplus
///
/// softplus(x) = log(1 + exp(x)) = max(x, 0) + log(1 + exp(-|x|))
///
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    x.relu()?.add(&tail)
}

/// log(exp(a) + exp(b)) without overflow or log(0)
pub fn log_sum_exp_pair(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let m = a.maximum(b)?;
    let sum = (a.sub(&m)?.exp()? + b.sub(&m)?.exp()?)?;
    m.add(&sum.log()?)
}

/// Log-gamma function as a differentiable tensor expression
///
/// lgamma(x) = lgamma(x + 6) - Σ_{k=0}^{5} log(x + k)
///
/// where lgamma(z) for z ≥ 6 is the Stirling series
///
/// (z - 1/2) log z - z + log(2π)/2 + 1/(12z) - 1/(360z³) + 1/(1260z⁵)
///
/// * `x` - positive tensor (clamped at `LOG_EPS`)
///
pub fn lgamma(x: &Tensor) -> Result<Tensor> {
    let x = x.maximum(LOG_EPS)?;

    let mut log_shift = x.log()?;
    for k in 1..6 {
        log_shift = log_shift.add(&(&x + k as f64)?.log()?)?;
    }

    let z = (&x + 6.0)?;
    let log_z = z.log()?;
    let z_inv = z.recip()?;
    let z_inv2 = z_inv.sqr()?;

    // 1/12 - z⁻²(1/360 - z⁻²/1260)
    let inner = z_inv2.affine(-1.0 / 1260.0, 1.0 / 360.0)?;
    let series = z_inv.mul(&inner.mul(&z_inv2)?.affine(-1.0, 1.0 / 12.0)?)?;

    let stirling = ((z.affine(1.0, -0.5)?.mul(&log_z)? - &z)? + HALF_LOG_TWO_PI)?;
    stirling.add(&series)?.sub(&log_shift)
}

/// Poisson negative log-likelihood
///
/// nll(i,j) = μ(i,j) - x(i,j) * log μ(i,j) + lgamma(x(i,j) + 1)
///
/// * `x_nd` - observed counts
/// * `mu_nd` - predicted mean (clamped at `LOG_EPS`)
///
pub fn poisson_nll(x_nd: &Tensor, mu_nd: &Tensor) -> Result<Tensor> {
    let mu_nd = mu_nd.maximum(LOG_EPS)?;
    let log_factorial = lgamma(&(x_nd + 1.0)?)?;
    mu_nd
        .sub(&x_nd.mul(&mu_nd.log()?)?)?
        .add(&log_factorial)
}

/// Negative binomial negative log-likelihood with mean μ and
/// inverse dispersion θ (Var = μ + μ²/θ)
///
/// nll = lgamma(θ) + lgamma(x + 1) - lgamma(x + θ)
///       + (θ + x) log(1 + μ/θ) + x (log θ - log μ)
///
/// * `x_nd` - observed counts
/// * `mu_nd` - predicted mean
/// * `theta_nd` - inverse dispersion (broadcast against `x_nd`)
///
pub fn negbinom_nll(x_nd: &Tensor, mu_nd: &Tensor, theta_nd: &Tensor) -> Result<Tensor> {
    let theta = theta_nd
        .clamp(LOG_EPS, MAX_DISPERSION)?
        .broadcast_as(x_nd.shape())?;
    let mu = mu_nd.maximum(LOG_EPS)?;

    let t1 = lgamma(&theta)?
        .add(&lgamma(&(x_nd + 1.0)?)?)?
        .sub(&lgamma(&x_nd.add(&theta)?)?)?;

    let log1p_ratio = (mu.div(&theta)? + 1.0)?.log()?;
    let t2 = theta
        .add(x_nd)?
        .mul(&log1p_ratio)?
        .add(&x_nd.mul(&theta.log()?.sub(&mu.log()?)?)?)?;

    t1.add(&t2)
}

/// Zero-inflated negative binomial negative log-likelihood
///
/// With π = sigmoid(logit):
///
/// x > 0: nll = nll_nb(x) - log(1 - π)
/// x = 0: nll = -log(π + (1 - π) exp(-nll_nb(0)))
///
/// The zero case is a two-term log-sum-exp of `log π` and
/// `log(1 - π) - nll_nb(0)`; both logs come from softplus.
///
/// * `x_nd` - observed counts
/// * `mu_nd` - predicted mean
/// * `theta_nd` - inverse dispersion
/// * `logit_nd` - dropout logit
///
pub fn zinb_nll(
    x_nd: &Tensor,
    mu_nd: &Tensor,
    theta_nd: &Tensor,
    logit_nd: &Tensor,
) -> Result<Tensor> {
    let nb_nll = negbinom_nll(x_nd, mu_nd, theta_nd)?;

    let log_pi = softplus(&logit_nd.neg()?)?.neg()?;
    let log_one_minus_pi = softplus(logit_nd)?.neg()?;

    let nonzero_case = nb_nll.sub(&log_one_minus_pi)?;
    let zero_case = log_sum_exp_pair(&log_pi, &log_one_minus_pi.sub(&nb_nll)?)?.neg()?;

    x_nd.lt(ZERO_COUNT_TOL)?
        .where_cond(&zero_case, &nonzero_case)
}

/// Squared error
///
/// nll(i,j) = (x(i,j) - μ(i,j))²
///
pub fn squared_error(x_nd: &Tensor, mu_nd: &Tensor) -> Result<Tensor> {
    x_nd.sub(mu_nd)?.sqr()
}

/// Ridge penalty on the dropout probabilities
///
/// λ * sigmoid(logit)²
///
pub fn dropout_ridge_penalty(logit_nd: &Tensor, lambda: f64) -> Result<Tensor> {
    candle_nn::ops::sigmoid(logit_nd)?.sqr()? * lambda
}

/// Elastic penalty on a set of weight matrices
///
/// l1 * Σ|w| + l2 * Σw²
///
/// Returns `None` if both coefficients are zero or there is nothing
/// to penalize.
pub fn weight_penalty(weights: &[&Tensor], l1: f64, l2: f64) -> Result<Option<Tensor>> {
    if (l1 == 0.0 && l2 == 0.0) || weights.is_empty() {
        return Ok(None);
    }

    let mut total: Option<Tensor> = None;
    for w in weights {
        let mut term: Option<Tensor> = None;
        if l1 != 0.0 {
            term = Some((w.abs()?.sum_all()? * l1)?);
        }
        if l2 != 0.0 {
            let sq = (w.sqr()?.sum_all()? * l2)?;
            term = Some(match term {
                Some(t) => t.add(&sq)?,
                None => sq,
            });
        }
        if let Some(term) = term {
            total = Some(match total {
                Some(t) => t.add(&term)?,
                None => term,
            });
        }
    }
    Ok(total)
}

/// Likelihood family of a count model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountFamily {
    /// squared error on counts
    Normal,
    /// Poisson(μ)
    Poisson,
    /// NB(μ, θ)
    NegBinom,
    /// ZINB(μ, θ, π)
    ZeroInflated,
}

impl CountFamily {
    pub fn has_dispersion(&self) -> bool {
        matches!(self, CountFamily::NegBinom | CountFamily::ZeroInflated)
    }

    pub fn has_dropout(&self) -> bool {
        matches!(self, CountFamily::ZeroInflated)
    }

    /// Element-wise negative log-likelihood of `x_nd` under the
    /// decoded parameters, plus the dropout ridge term for ZINB
    ///
    /// * `x_nd` - observed counts
    /// * `params` - decoded parameters (mean already scaled)
    /// * `ridge` - ridge coefficient on dropout probabilities
    pub fn nll(&self, x_nd: &Tensor, params: &CountParams, ridge: f64) -> Result<Tensor> {
        match self {
            CountFamily::Normal => squared_error(x_nd, &params.mean),
            CountFamily::Poisson => poisson_nll(x_nd, &params.mean),
            CountFamily::NegBinom => {
                let theta = params.require_dispersion()?;
                negbinom_nll(x_nd, &params.mean, theta)
            }
            CountFamily::ZeroInflated => {
                let theta = params.require_dispersion()?;
                let logit = params.require_dropout_logit()?;
                let nll = zinb_nll(x_nd, &params.mean, theta, logit)?;
                if ridge > 0.0 {
                    nll.add(&dropout_ridge_penalty(logit, ridge)?)
                } else {
                    Ok(nll)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn softplus_is_finite_at_extremes() -> Result<()> {
        let x = Tensor::new(&[-1e4f64, -20.0, 0.0, 20.0, 1e4], &Device::Cpu)?;
        let y = softplus(&x)?.to_vec1::<f64>()?;
        assert!(y.iter().all(|v| v.is_finite()));
        assert!((y[2] - 2f64.ln()).abs() < 1e-12);
        assert!((y[4] - 1e4).abs() < 1e-9);
        assert_eq!(y[0], 0.0);
        Ok(())
    }

    #[test]
    fn log_sum_exp_pair_matches_direct_sum() -> Result<()> {
        let a = Tensor::new(&[0.0f64, -3.0, 2.0], &Device::Cpu)?;
        let b = Tensor::new(&[1.0f64, -1000.0, 2.0], &Device::Cpu)?;
        let out = log_sum_exp_pair(&a, &b)?.to_vec1::<f64>()?;
        assert!((out[0] - (1f64.exp() + 1.0).ln()).abs() < 1e-12);
        assert!((out[1] + 3.0).abs() < 1e-12);
        assert!((out[2] - (2.0 + 2f64.ln())).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn weight_penalty_sums_both_terms() -> Result<()> {
        let w = Tensor::new(&[[1.0f32, -2.0], [0.5, 0.0]], &Device::Cpu)?;
        assert!(weight_penalty(&[&w], 0.0, 0.0)?.is_none());

        let pen = weight_penalty(&[&w, &w], 0.1, 0.01)?
            .expect("penalty")
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;
        // 2 * (0.1 * 3.5 + 0.01 * 5.25)
        assert!((pen - 0.805).abs() < 1e-5);
        Ok(())
    }
}
