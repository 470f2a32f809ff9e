use approx::assert_abs_diff_eq;
use matrix_util::traits::{ColumnStatOps, SampleOps};
use nalgebra::DMatrix;

#[test]
fn column_stat_test() {
    let xx = DMatrix::<f32>::from_row_slice(4, 2, &[1., 10., 2., 10., 3., 10., 4., 10.]);

    let mu = xx.column_means();
    let sd = xx.column_stds();

    assert_abs_diff_eq!(mu[0], 2.5);
    assert_abs_diff_eq!(mu[1], 10.0);
    assert_abs_diff_eq!(sd[0], (5.0_f32 / 3.0).sqrt(), epsilon = 1e-6);
    assert_abs_diff_eq!(sd[1], 0.0);
}

#[test]
fn rpois_test() -> anyhow::Result<()> {
    let rate = DMatrix::<f32>::from_element(200, 50, 3.0);
    let yy = DMatrix::<f32>::rpois(&rate)?;

    assert!(yy.iter().all(|&y| y >= 0.0 && y.fract() == 0.0));
    let mean = yy.sum() / (yy.nrows() * yy.ncols()) as f32;
    assert!((mean - 3.0).abs() < 0.2);
    Ok(())
}
