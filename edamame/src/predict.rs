use crate::artifact::*;
use crate::common::*;
use crate::config::ComputeDevice;
use crate::dataset::*;
use crate::error::EdamameError;
use crate::model::CountAutoencoder;
use crate::normalization::*;

use candle_core::{Device, Tensor};
use candle_util::candle_model_traits::*;
use clap::Args;
use matrix_util::common_io::*;

pub const MEAN_FILE: &str = "mean.tsv.gz";
pub const DISPERSION_FILE: &str = "dispersion.tsv.gz";
pub const DROPOUT_FILE: &str = "dropout.tsv.gz";
pub const REDUCED_FILE: &str = "reduced.tsv.gz";

#[derive(Args, Debug)]
pub struct PredictArgs {
    #[arg(
        required = true,
        help = "Dataset",
        long_help = "Output directory of `edamame preprocess`, or a count table\n\
		     (samples x features, first row and column are names)."
    )]
    pub dataset: Box<str>,

    #[arg(
        required = true,
        help = "Model directory",
        long_help = "Output directory of `edamame train`"
    )]
    pub modeldir: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output directory",
        long_help = "Output directory:\n\
		     - {out}/mean.tsv.gz\n\
		     - {out}/dispersion.tsv.gz (nb, zinb)\n\
		     - {out}/dropout.tsv.gz (zinb)\n\
		     - {out}/reduced.tsv.gz\n"
    )]
    pub outputdir: Box<str>,

    #[arg(long, short, help = "The table is features x samples")]
    pub transpose: bool,

    #[arg(
        long,
        short = 'r',
        help = "Save the bottleneck",
        long_help = "Save the bottleneck; same as --reduce"
    )]
    pub reduced: bool,

    #[arg(
        long,
        overrides_with = "noreconstruct",
        help = "Save reconstruction (default)"
    )]
    pub reconstruct: bool,

    #[arg(long, overrides_with = "reconstruct", help = "Don't save reconstruction")]
    pub noreconstruct: bool,

    #[arg(long, overrides_with = "noreduce", help = "Save the bottleneck (default)")]
    pub reduce: bool,

    #[arg(long, overrides_with = "reduce", help = "Don't save the bottleneck")]
    pub noreduce: bool,

    #[arg(
        long,
        help = "Condition file",
        long_help = "Two columns `sample<TAB>label`; labels must be\n\
		     among those seen in training"
    )]
    pub conditions: Option<Box<str>>,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    pub device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device number")]
    pub device_no: usize,
}

impl PredictArgs {
    pub fn output_selection(&self) -> OutputSelection {
        OutputSelection {
            reconstruct: self.reconstruct || !self.noreconstruct,
            reduce: self.reduced || self.reduce || !self.noreduce,
        }
    }
}

/// Which outputs to write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputSelection {
    /// mean, dispersion and dropout probabilities
    pub reconstruct: bool,
    /// bottleneck activations
    pub reduce: bool,
}

/// Network outputs of every sample, in input order
#[derive(Debug)]
pub struct Predictions {
    /// decoded mean before size factor scaling (n x d)
    pub mean: Mat,
    /// inverse dispersion θ (n x d)
    pub dispersion: Option<Mat>,
    /// dropout probability sigmoid(π) (n x d)
    pub dropout: Option<Mat>,
    /// bottleneck code (n x k)
    pub reduced: Mat,
}

/// Run the encoder and decoder on ordered chunks of rows with
/// `train = false`
///
/// * `input` - normalized model input (n x d)
/// * `conditions` - one-hot side labels (n x c) if the model uses them
pub fn predict_all(
    model: &CountAutoencoder,
    input: &Mat,
    conditions: Option<&Mat>,
    dev: &Device,
) -> anyhow::Result<Predictions> {
    let nn = input.nrows();
    if nn == 0 {
        return Err(anyhow::anyhow!("no samples to predict"));
    }
    if input.ncols() != model.encoder.dim_obs() {
        return Err(EdamameError::DimensionMismatch {
            expected: model.encoder.dim_obs(),
            found: input.ncols(),
        }
        .into());
    }

    let x_nd = input.to_tensor(dev)?;
    let c_nc = conditions.map(|c| c.to_tensor(dev)).transpose()?;

    let mut mean = vec![];
    let mut dispersion = vec![];
    let mut dropout = vec![];
    let mut reduced = vec![];

    for lb in (0..nn).step_by(EVAL_BATCH_SIZE) {
        let len = EVAL_BATCH_SIZE.min(nn - lb);
        let x_b = x_nd.narrow(0, lb, len)?;
        let c_b = c_nc.as_ref().map(|c| c.narrow(0, lb, len)).transpose()?;

        let z_b = model.encoder.forward_t(&x_b, false)?;
        let params = model.decoder.forward_t(&z_b, c_b.as_ref(), false)?;

        if let Some(theta) = params.dispersion.as_ref() {
            dispersion.push(theta.broadcast_as(params.mean.shape())?.contiguous()?);
        }
        if let Some(logit) = params.dropout_logit.as_ref() {
            dropout.push(candle_nn::ops::sigmoid(logit)?);
        }
        mean.push(params.mean);
        reduced.push(z_b);
    }

    let stack = |chunks: &[Tensor]| -> anyhow::Result<Option<Mat>> {
        if chunks.is_empty() {
            return Ok(None);
        }
        Ok(Some(Mat::from_tensor(&Tensor::cat(chunks, 0)?)?))
    };

    Ok(Predictions {
        mean: stack(&mean)?.ok_or_else(|| anyhow::anyhow!("empty mean"))?,
        dispersion: stack(&dispersion)?,
        dropout: stack(&dropout)?,
        reduced: stack(&reduced)?.ok_or_else(|| anyhow::anyhow!("empty bottleneck"))?,
    })
}

/// Write the selected predictions as named tables in `dir`
pub fn write_predictions(
    preds: &Predictions,
    dir: &str,
    samples: &[Box<str>],
    features: &[Box<str>],
    selection: &OutputSelection,
) -> anyhow::Result<()> {
    mkdir(dir)?;

    if selection.reconstruct {
        let out = join_path(dir, MEAN_FILE);
        preds
            .mean
            .write_data_with_names(&out, samples, features, "sample")?;
        info!("Wrote {}", out);

        for (mat, name) in [
            (&preds.dispersion, DISPERSION_FILE),
            (&preds.dropout, DROPOUT_FILE),
        ] {
            if let Some(mat) = mat {
                let out = join_path(dir, name);
                mat.write_data_with_names(&out, samples, features, "sample")?;
                info!("Wrote {}", out);
            }
        }
    }

    if selection.reduce {
        let out = join_path(dir, REDUCED_FILE);
        let latent: Vec<Box<str>> = (0..preds.reduced.ncols())
            .map(|k| format!("z{}", k).into_boxed_str())
            .collect();
        preds
            .reduced
            .write_data_with_names(&out, samples, &latent, "sample")?;
        info!("Wrote {}", out);
    }
    Ok(())
}

/// One-hot side labels against the training vocabulary
fn prediction_conditions(
    model: &TrainedModel,
    conditions_file: Option<&str>,
    samples: &[Box<str>],
) -> anyhow::Result<Option<Mat>> {
    if model.model.num_conditions() == 0 {
        return Ok(None);
    }

    let vocab = model
        .config
        .conditions
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("the model has no condition vocabulary"))?;

    match conditions_file {
        Some(file) => {
            let labels = read_conditions(file, samples)?;
            Ok(Some(vocab.one_hot(&labels)?))
        }
        None if vocab.len() == 1 => Ok(Some(vocab.one_hot_single(samples.len())?)),
        None => Err(anyhow::anyhow!(
            "{} needs --conditions with labels among {:?}",
            model.config.model.noise,
            vocab.labels
        )),
    }
}

pub fn run_predict(args: &PredictArgs) -> anyhow::Result<Predictions> {
    let dev = args.device.to_device(args.device_no);
    let trained = TrainedModel::load(&args.modeldir, &dev)?;
    let config = &trained.config;

    let dataset = if PreprocessedData::is_preprocessed_dir(&args.dataset) {
        PreprocessedData::read_dir(&args.dataset)?.dataset
    } else {
        CountDataset::read_table(&args.dataset, args.transpose)?
    };

    if dataset.num_features() != config.model.input_dim {
        return Err(EdamameError::DimensionMismatch {
            expected: config.model.input_dim,
            found: dataset.num_features(),
        }
        .into());
    }
    if dataset.features != config.features {
        warn!("feature names differ from the training data; matching by position");
    }

    let norm = &config.normalization;
    let sf = if norm.size_factors {
        size_factors_from_reference(&dataset.counts, &config.size_factor_reference)?
    } else {
        vec![1.0; dataset.num_samples()]
    };
    let input = model_input(&dataset.counts, &sf, norm, config.scaling.as_ref())?;
    let conditions = prediction_conditions(&trained, args.conditions.as_deref(), &dataset.samples)?;

    let preds = predict_all(&trained.model, &input, conditions.as_ref(), &dev)?;
    write_predictions(
        &preds,
        &args.outputdir,
        &dataset.samples,
        &dataset.features,
        &args.output_selection(),
    )?;
    Ok(preds)
}
