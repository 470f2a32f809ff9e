use candle_core::{Device, Tensor};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

/// One minibatch of count data, all tensors have the same number of
/// rows
pub struct CountMinibatch {
    /// normalized encoder input (n x d)
    pub input: Tensor,
    /// raw counts, the reconstruction target (n x d)
    pub counts: Tensor,
    /// per-sample size factors (n x 1)
    pub size_factors: Tensor,
    /// one-hot condition labels (n x c)
    pub conditions: Option<Tensor>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<CountMinibatch>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;

    /// partition samples in their original order
    fn ordered_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

/// Matrices feeding an `InMemoryCountData`
pub struct InMemoryCountArgs<'a> {
    pub input: &'a DMatrix<f32>,
    pub counts: &'a DMatrix<f32>,
    pub size_factors: &'a DMatrix<f32>,
    pub conditions: Option<&'a DMatrix<f32>>,
    pub seed: Option<u64>,
}

///
/// A data loader for in-memory count matrices.  Each row is a
/// sample; input, counts, size factors and conditions are row-aligned.
///
pub struct InMemoryCountData {
    input_data: Vec<Tensor>,
    count_data: Vec<Tensor>,
    size_factor_data: Vec<Tensor>,
    condition_data: Option<Vec<Tensor>>,

    batched_input: Vec<Tensor>,
    batched_counts: Vec<Tensor>,
    batched_size_factors: Vec<Tensor>,
    batched_conditions: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

impl InMemoryCountData {
    pub fn from_args(args: InMemoryCountArgs) -> anyhow::Result<Self> {
        let nn = args.input.nrows();

        if args.counts.nrows() != nn || args.size_factors.nrows() != nn {
            return Err(anyhow::anyhow!(
                "row mismatch: input {}, counts {}, size factors {}",
                nn,
                args.counts.nrows(),
                args.size_factors.nrows()
            ));
        }

        if let Some(cond) = args.conditions {
            if cond.nrows() != nn {
                return Err(anyhow::anyhow!(
                    "row mismatch: input {}, conditions {}",
                    nn,
                    cond.nrows()
                ));
            }
        }

        let condition_data = match args.conditions {
            Some(cond) => Some(cond.rows_to_tensor_vec()?),
            None => None,
        };

        Ok(InMemoryCountData {
            input_data: args.input.rows_to_tensor_vec()?,
            count_data: args.counts.rows_to_tensor_vec()?,
            size_factor_data: args.size_factors.rows_to_tensor_vec()?,
            condition_data,
            batched_input: vec![],
            batched_counts: vec![],
            batched_size_factors: vec![],
            batched_conditions: None,
            minibatches: Minibatches::new(nn, args.seed),
        })
    }

    pub fn num_samples(&self) -> usize {
        self.minibatches.size()
    }

    /// sample indexes of each minibatch after the last partition
    pub fn chunks(&self) -> &[Vec<usize>] {
        &self.minibatches.chunks
    }

    fn preload_chunks(&mut self) -> anyhow::Result<()> {
        let gather = |data: &[Tensor], samples: &[usize]| -> anyhow::Result<Tensor> {
            let chunk: Vec<Tensor> = samples.iter().map(|&i| data[i].clone()).collect();
            Ok(Tensor::cat(&chunk, 0)?)
        };

        self.batched_input.clear();
        self.batched_counts.clear();
        self.batched_size_factors.clear();
        self.batched_conditions = self.condition_data.as_ref().map(|_| vec![]);

        for samples in self.minibatches.chunks.iter() {
            self.batched_input.push(gather(&self.input_data, samples)?);
            self.batched_counts.push(gather(&self.count_data, samples)?);
            self.batched_size_factors
                .push(gather(&self.size_factor_data, samples)?);

            if let (Some(cond), Some(batched)) =
                (self.condition_data.as_ref(), self.batched_conditions.as_mut())
            {
                batched.push(gather(cond, samples)?);
            }
        }
        Ok(())
    }
}

impl DataLoader for InMemoryCountData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<CountMinibatch> {
        if batch_idx >= self.batched_input.len() {
            return Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.batched_input.len()
            ));
        }

        let conditions = match self.batched_conditions.as_ref() {
            Some(batched) => Some(batched[batch_idx].to_device(target_device)?),
            None => None,
        };

        Ok(CountMinibatch {
            input: self.batched_input[batch_idx].to_device(target_device)?,
            counts: self.batched_counts[batch_idx].to_device(target_device)?,
            size_factors: self.batched_size_factors[batch_idx].to_device(target_device)?,
            conditions,
        })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size);
        self.preload_chunks()
    }

    fn ordered_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.ordered_minibatch(batch_size);
        self.preload_chunks()
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes
/// so that every sample appears exactly once per epoch.
///
pub struct Minibatches {
    samples: Vec<usize>,
    rng: StdRng,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(size: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Minibatches {
            samples: (0..size).collect(),
            rng,
            chunks: vec![],
        }
    }

    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        self.samples.shuffle(&mut self.rng);
        self.partition(batch_size);
    }

    pub fn ordered_minibatch(&mut self, batch_size: usize) {
        self.samples.sort_unstable();
        self.partition(batch_size);
    }

    fn partition(&mut self, batch_size: usize) {
        let batch_size = batch_size.max(1);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

///
/// Convert rows of a matrix to a vector of `Tensor`
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>>;
}

impl RowsToTensorVec for DMatrix<f32> {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>> {
        let mut idx_data = self
            .row_iter()
            .enumerate()
            .par_bridge()
            .map(|(i, row)| -> anyhow::Result<(usize, Tensor)> {
                let v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)?
                    .reshape((1, row.len()))?;
                Ok((i, v))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        idx_data.sort_by_key(|(i, _)| *i);
        Ok(idx_data.into_iter().map(|(_, t)| t).collect())
    }
}
