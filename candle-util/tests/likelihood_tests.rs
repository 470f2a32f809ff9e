use approx::assert_abs_diff_eq;
use candle_util::candle_core::{DType, Device, Result, Tensor, Var};
use candle_util::candle_loss_functions::*;
use candle_util::candle_model_traits::CountParams;
use special::Gamma;

fn vec1(xs: &[f64]) -> Result<Tensor> {
    Tensor::new(xs, &Device::Cpu)
}

#[test]
fn lgamma_matches_reference() -> Result<()> {
    let xs = [1e-3, 0.5, 1.0, 2.0, 2.5, 7.0, 30.0, 1e3, 1e6];
    let approx = lgamma(&vec1(&xs)?)?.to_vec1::<f64>()?;

    for (&x, &y) in xs.iter().zip(approx.iter()) {
        let expected = x.ln_gamma().0;
        let tol = 1e-8 * expected.abs().max(1.0);
        assert!(
            (y - expected).abs() < tol,
            "lgamma({}) = {} vs. {}",
            x,
            y,
            expected
        );
    }
    Ok(())
}

#[test]
fn poisson_nll_nonnegative_and_minimized_at_observation() -> Result<()> {
    for x in [1.0, 3.0, 10.0, 50.0] {
        let mus = [x * 0.5, x * 0.9, x, x * 1.1, x * 2.0];
        let xx = vec1(&[x; 5])?;
        let nll = poisson_nll(&xx, &vec1(&mus)?)?.to_vec1::<f64>()?;

        assert!(nll.iter().all(|&v| v >= -1e-9));
        assert!(nll[2] <= nll[1] && nll[2] <= nll[3]);
        assert!(nll[1] <= nll[0] && nll[3] <= nll[4]);
    }

    // zero counts: nll = μ
    let nll = poisson_nll(&vec1(&[0.0, 0.0])?, &vec1(&[0.25, 4.0])?)?.to_vec1::<f64>()?;
    assert_abs_diff_eq!(nll[0], 0.25, epsilon = 1e-9);
    assert_abs_diff_eq!(nll[1], 4.0, epsilon = 1e-9);
    Ok(())
}

#[test]
fn negbinom_nll_finite_over_dispersion_range() -> Result<()> {
    let thetas = [1e-4, 1e-2, 1.0, 1e2, 1e4];
    let xs = [0.0, 1.0, 5.0, 100.0, 1000.0];
    let mus = [1e-5, 0.5, 5.0, 80.0, 1e6];

    for &theta in thetas.iter() {
        let nll = negbinom_nll(&vec1(&xs)?, &vec1(&mus)?, &vec1(&[theta; 5])?)?
            .to_vec1::<f64>()?;
        assert!(nll.iter().all(|v| v.is_finite()), "theta = {}", theta);
        assert!(nll.iter().all(|&v| v >= -1e-6), "theta = {}", theta);
    }
    Ok(())
}

#[test]
fn negbinom_approaches_poisson_for_large_theta() -> Result<()> {
    let xs = vec1(&[0.0, 1.0, 3.0, 7.0, 12.0])?;
    let mus = vec1(&[0.3, 1.5, 2.0, 8.0, 10.0])?;
    let theta = vec1(&[1e6; 5])?;

    let nb = negbinom_nll(&xs, &mus, &theta)?.to_vec1::<f64>()?;
    let pois = poisson_nll(&xs, &mus)?.to_vec1::<f64>()?;

    for (a, b) in nb.iter().zip(pois.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
    }
    Ok(())
}

#[test]
fn negbinom_zero_count_closed_form() -> Result<()> {
    // -log P(0) = θ log(1 + μ/θ)
    let (mu, theta) = (3.0_f64, 2.0_f64);
    let nll = negbinom_nll(&vec1(&[0.0])?, &vec1(&[mu])?, &vec1(&[theta])?)?
        .to_vec1::<f64>()?;
    assert_abs_diff_eq!(nll[0], theta * (1.0 + mu / theta).ln(), epsilon = 1e-8);
    Ok(())
}

#[test]
fn zinb_without_dropout_equals_negbinom() -> Result<()> {
    let xs = vec1(&[0.0, 0.0, 1.0, 4.0, 20.0])?;
    let mus = vec1(&[0.1, 3.0, 1.0, 6.0, 15.0])?;
    let theta = vec1(&[0.5, 2.0, 10.0, 1.0, 100.0])?;
    let logit = vec1(&[-1e4; 5])?;

    let zinb = zinb_nll(&xs, &mus, &theta, &logit)?.to_vec1::<f64>()?;
    let nb = negbinom_nll(&xs, &mus, &theta)?.to_vec1::<f64>()?;

    for (a, b) in zinb.iter().zip(nb.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
    Ok(())
}

#[test]
fn zinb_dropout_explains_zeros() -> Result<()> {
    let xs = vec1(&[0.0, 0.0])?;
    let mus = vec1(&[20.0, 20.0])?;
    let theta = vec1(&[5.0, 5.0])?;
    let logit = vec1(&[-5.0, 5.0])?;

    let nll = zinb_nll(&xs, &mus, &theta, &logit)?.to_vec1::<f64>()?;
    assert!(nll[1] < nll[0]);

    // π → 1 makes a zero almost certain
    assert!(nll[1] < 0.01);
    Ok(())
}

#[test]
fn zinb_gradients_are_finite_at_extremes() -> Result<()> {
    let dev = Device::Cpu;
    let xs = Tensor::new(&[0.0f32, 0.0, 3.0, 500.0], &dev)?;
    let log_mu = Var::from_tensor(&Tensor::new(&[-10.0f32, 12.0, 1.0, 5.0], &dev)?)?;
    let theta = Var::from_tensor(&Tensor::new(&[1e-4f32, 1e4, 1.0, 0.1], &dev)?)?;
    let logit = Var::from_tensor(&Tensor::new(&[-30.0f32, 30.0, 0.0, 10.0], &dev)?)?;

    let nll = zinb_nll(&xs, &log_mu.exp()?, theta.as_tensor(), logit.as_tensor())?;
    let grads = nll.sum_all()?.backward()?;

    for var in [&log_mu, &theta, &logit] {
        let g = grads.get(var).expect("gradient").to_vec1::<f32>()?;
        assert!(g.iter().all(|v| v.is_finite()), "{:?}", g);
    }
    Ok(())
}

#[test]
fn family_nll_applies_ridge_to_zero_inflation() -> Result<()> {
    let dev = Device::Cpu;
    let xs = Tensor::new(&[[0.0f64, 2.0]], &dev)?;
    let params = CountParams {
        mean: Tensor::new(&[[1.0f64, 2.0]], &dev)?,
        dispersion: Some(Tensor::new(&[[3.0f64, 3.0]], &dev)?),
        dropout_logit: Some(Tensor::zeros((1, 2), DType::F64, &dev)?),
    };

    let plain = CountFamily::ZeroInflated
        .nll(&xs, &params, 0.0)?
        .sum_all()?
        .to_scalar::<f64>()?;
    let ridged = CountFamily::ZeroInflated
        .nll(&xs, &params, 2.0)?
        .sum_all()?
        .to_scalar::<f64>()?;

    // sigmoid(0)² = 1/4 per element
    assert_abs_diff_eq!(ridged - plain, 2.0 * 2.0 * 0.25, epsilon = 1e-12);

    let missing = CountParams {
        dispersion: None,
        ..params
    };
    assert!(CountFamily::NegBinom.nll(&xs, &missing, 0.0).is_err());
    Ok(())
}
