use crate::traits::*;
use candle_util::candle_core::{DType, Device, Tensor};
pub use nalgebra::{DMatrix, DVector};
pub use rand::Rng;
pub use rand_distr::{Distribution, Poisson, StandardNormal, Uniform};
pub use rayon::prelude::*;

impl SampleOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn runif(dd: usize, nn: usize) -> Self::Mat {
        let rvec = (0..(dd * nn))
            .into_par_iter()
            .map_init(rand::rng, |rng, _| rng.random::<f32>())
            .collect();

        DMatrix::<f32>::from_vec(dd, nn, rvec)
    }

    fn rnorm(dd: usize, nn: usize) -> Self::Mat {
        let rvec = (0..(dd * nn))
            .into_par_iter()
            .map_init(rand::rng, |rng, _| rng.sample::<f32, _>(StandardNormal))
            .collect();

        DMatrix::<f32>::from_vec(dd, nn, rvec)
    }

    fn rpois(rate: &Self::Mat) -> anyhow::Result<Self::Mat> {
        let mut rng = rand::rng();
        let mut ret = DMatrix::<f32>::zeros(rate.nrows(), rate.ncols());
        for (y, &lambda) in ret.iter_mut().zip(rate.iter()) {
            if lambda > 0.0 {
                let pois = Poisson::new(lambda as f64)
                    .map_err(|e| anyhow::anyhow!("invalid Poisson rate {}: {}", lambda, e))?;
                let draw: f64 = pois.sample(&mut rng);
                *y = draw as f32;
            }
        }
        Ok(ret)
    }
}

impl ColumnStatOps for DMatrix<f32> {
    type DVec = DVector<f32>;

    fn column_means(&self) -> Self::DVec {
        let n = self.nrows().max(1) as f32;
        DVector::from_iterator(self.ncols(), self.column_iter().map(|x_j| x_j.sum() / n))
    }

    fn column_stds(&self) -> Self::DVec {
        let n = self.nrows();
        let denom = (n.max(2) - 1) as f32;
        let means = self.column_means();
        DVector::from_iterator(
            self.ncols(),
            self.column_iter().zip(means.iter()).map(|(x_j, &mu)| {
                let ss: f32 = x_j.iter().map(|&x| (x - mu) * (x - mu)).sum();
                (ss / denom).sqrt()
            }),
        )
    }
}

impl ConvertMatOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn from_tensor(tensor: &Tensor) -> anyhow::Result<Self::Mat> {
        let (nrows, ncols) = tensor.dims2()?;
        let rows = tensor
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(DMatrix::<f32>::from_row_iterator(nrows, ncols, rows))
    }

    fn to_tensor(&self, dev: &Device) -> anyhow::Result<Tensor> {
        // nalgebra is column-major; transposing gives row-major storage
        let data = self.transpose().as_slice().to_vec();
        Ok(Tensor::from_vec(data, (self.nrows(), self.ncols()), dev)?)
    }
}

/// Take rows by their indexes
pub fn select_rows(mat: &DMatrix<f32>, rows: &[usize]) -> DMatrix<f32> {
    DMatrix::<f32>::from_fn(rows.len(), mat.ncols(), |i, j| mat[(rows[i], j)])
}
