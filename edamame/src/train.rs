use crate::artifact::*;
use crate::common::*;
use crate::config::*;
use crate::dataset::*;
use crate::error::EdamameError;
use crate::model::*;
use crate::normalization::*;
use crate::predict::*;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_util::candle_data_loader::*;
use candle_util::candle_optimizers::*;
use clap::Args;
use indicatif::{ProgressBar, ProgressDrawTarget};
use matrix_util::common_io::*;
use matrix_util::dmatrix_util::select_rows;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(
        required = true,
        help = "Training set",
        long_help = "Output directory of `edamame preprocess`, or a count table\n\
		     (samples x features, first row and column are names).\n\
		     A raw table is normalized with `zheng` size factors."
    )]
    pub training_set: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output directory",
        long_help = "Output directory of the trained model:\n\
		     - {out}/model.safetensors\n\
		     - {out}/config.json\n\
		     - {out}/history.tsv\n\
		     - {out}/mean.tsv.gz, dispersion.tsv.gz, dropout.tsv.gz\n\
		     - {out}/reduced.tsv.gz\n"
    )]
    pub outputdir: Box<str>,

    #[arg(
        long = "type",
        short = 't',
        default_value = "zinb-conddisp",
        help = "Noise model",
        long_help = "Noise model of the counts:\n\
		     normal, poisson, nb, nb-shared, nb-conddisp, nb-fork,\n\
		     zinb, zinb-shared, zinb-conddisp, zinb-fork"
    )]
    pub noise_type: Box<str>,

    #[arg(long, short, default_value_t = 32, help = "Minibatch size")]
    pub batchsize: usize,

    #[arg(
        long,
        overrides_with = "nosizefactors",
        help = "Normalize by size factors (default)",
        long_help = "Divide the input by size factors and multiply\n\
		     the decoded mean by them (default)."
    )]
    pub sizefactors: bool,

    #[arg(long, overrides_with = "sizefactors", help = "Ignore size factors")]
    pub nosizefactors: bool,

    #[arg(
        long,
        overrides_with = "nonorminput",
        help = "Standardize input features (default)"
    )]
    pub norminput: bool,

    #[arg(long, overrides_with = "norminput", help = "Don't standardize input features")]
    pub nonorminput: bool,

    #[arg(long, overrides_with = "nologinput", help = "log1p-transform input (default)")]
    pub loginput: bool,

    #[arg(long, overrides_with = "loginput", help = "Don't log-transform input")]
    pub nologinput: bool,

    #[arg(
        long,
        short = 'd',
        default_value = "0.0",
        help = "Dropout rate(s)",
        long_help = "Dropout rate of hidden layers.\n\
		     A single rate for every layer or one rate per layer,\n\
		     e.g., `0.1` or `0.1,0,0.1`"
    )]
    pub dropoutrate: Box<str>,

    #[arg(long, overrides_with = "nobatchnorm", help = "Use batchnorm (default)")]
    pub batchnorm: bool,

    #[arg(long, overrides_with = "batchnorm", help = "Don't use batchnorm")]
    pub nobatchnorm: bool,

    #[arg(long, default_value_t = 0.0, help = "L2 penalty on every kernel")]
    pub l2: f64,

    #[arg(long, default_value_t = 0.0, help = "L1 penalty on every kernel")]
    pub l1: f64,

    #[arg(long, default_value_t = 0.0, help = "L2 penalty on encoder kernels")]
    pub l2enc: f64,

    #[arg(long, default_value_t = 0.0, help = "L1 penalty on encoder kernels")]
    pub l1enc: f64,

    #[arg(
        long,
        default_value_t = 0.0,
        help = "Ridge penalty on dropout probabilities",
        long_help = "Ridge penalty on the zero-inflation probabilities.\n\
		     Only used by the zinb noise models."
    )]
    pub ridge: f64,

    #[arg(
        long,
        default_value_t = 5.0,
        help = "Gradient clipping",
        long_help = "Clip the global gradient norm at this value (0: no clipping)"
    )]
    pub gradclip: f64,

    #[arg(long, default_value = "elu", help = "Hidden layer activation")]
    pub activation: Box<str>,

    #[arg(
        long,
        default_value = "rmsprop",
        help = "Optimizer",
        long_help = "Optimizer: rmsprop, adam, adamw, sgd"
    )]
    pub optimizer: Box<str>,

    #[arg(
        long,
        default_value = "glorot_uniform",
        help = "Weight initialization",
        long_help = "Kernel initialization:\n\
		     glorot_uniform, glorot_normal, he_uniform, he_normal, lecun_normal"
    )]
    pub init: Box<str>,

    #[arg(long, short, default_value_t = 500, help = "Maximum number of epochs")]
    pub epochs: usize,

    #[arg(
        long,
        default_value_t = 15,
        help = "Early stopping patience",
        long_help = "Stop after this many epochs without improvement (0: never)"
    )]
    pub earlystop: usize,

    #[arg(
        long,
        default_value_t = 10,
        help = "Learning rate patience",
        long_help = "Reduce the learning rate after this many epochs\n\
		     without improvement (0: never)"
    )]
    pub reducelr: usize,

    #[arg(long, default_value_t = 0.5, help = "Learning rate reduction factor")]
    pub reducelr_factor: f64,

    #[arg(
        long = "hiddensize",
        short = 's',
        value_delimiter(','),
        default_values_t = vec![32, 32, 32],
        help = "Hidden layer sizes",
        long_help = "Comma-separated hidden layer sizes.\n\
		     The narrowest layer is the bottleneck."
    )]
    pub hidden_sizes: Vec<usize>,

    #[arg(
        long = "learningrate",
        short = 'r',
        help = "Learning rate",
        long_help = "Learning rate (default: 0.001; 0.01 for sgd)"
    )]
    pub learning_rate: Option<f64>,

    #[arg(
        long,
        default_value_t = 0.1,
        help = "Validation fraction",
        long_help = "Fraction of training samples held out for validation\n\
		     when the training set has no test fold"
    )]
    pub validation_split: f32,

    #[arg(
        long,
        help = "Condition file",
        long_help = "Two columns `sample<TAB>label` for the conditioned\n\
		     dispersion models (*-conddisp)"
    )]
    pub conditions: Option<Box<str>>,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    pub seed: u64,

    #[arg(
        long,
        overrides_with = "no_reconstruct",
        help = "Save reconstructed training data (default)"
    )]
    pub reconstruct: bool,

    #[arg(long, overrides_with = "reconstruct", help = "Don't save reconstruction")]
    pub no_reconstruct: bool,

    #[arg(
        long,
        overrides_with = "no_reduce",
        help = "Save the bottleneck of training data (default)"
    )]
    pub reduce: bool,

    #[arg(long, overrides_with = "reduce", help = "Don't save the bottleneck")]
    pub no_reduce: bool,

    #[arg(
        long,
        overrides_with = "no_saveweights",
        help = "Export dense kernels",
        long_help = "Export every dense kernel to {out}/weights/{name}.tsv.gz"
    )]
    pub saveweights: bool,

    #[arg(long, overrides_with = "saveweights", help = "Don't export kernels (default)")]
    pub no_saveweights: bool,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    pub device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device number")]
    pub device_no: usize,

    #[arg(skip)]
    pub verbose: bool,
}

impl TrainArgs {
    pub fn normalization(&self) -> InputNormalization {
        InputNormalization {
            size_factors: self.sizefactors || !self.nosizefactors,
            log_input: self.loginput || !self.nologinput,
            scale_input: self.norminput || !self.nonorminput,
        }
    }

    pub fn batch_norm(&self) -> bool {
        self.batchnorm || !self.nobatchnorm
    }

    pub fn output_selection(&self) -> OutputSelection {
        OutputSelection {
            reconstruct: self.reconstruct || !self.no_reconstruct,
            reduce: self.reduce || !self.no_reduce,
        }
    }

    pub fn train_config(&self) -> anyhow::Result<TrainConfig> {
        let optimizer = parse_optimizer(&self.optimizer)?;
        Ok(TrainConfig {
            batch_size: self.batchsize,
            max_epochs: self.epochs,
            optimizer,
            learning_rate: self
                .learning_rate
                .unwrap_or(optimizer.default_learning_rate()),
            reducelr: self.reducelr,
            reducelr_factor: self.reducelr_factor,
            earlystop: self.earlystop,
            gradclip: self.gradclip,
            l1: self.l1,
            l2: self.l2,
            l1_enc: self.l1enc,
            l2_enc: self.l2enc,
            ridge: self.ridge,
            seed: Some(self.seed),
        })
    }
}

/// States of the training controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainingState {
    Initializing,
    Training,
    ReducingLr,
    EarlyStopped,
    MaxEpochsReached,
    Done,
}

/// What to do after an epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpochVerdict {
    Improved,
    Plateau,
    ReduceLr,
    Stop,
}

/// Tracks the best monitored loss with two independent patience
/// counters, one for learning-rate reduction and one for early stopping
#[derive(Clone, Debug)]
pub struct ConvergenceMonitor {
    best: Option<f64>,
    best_epoch: Option<usize>,
    wait_lr: usize,
    wait_stop: usize,
    reducelr: usize,
    earlystop: usize,
}

impl ConvergenceMonitor {
    /// `0` disables either counter
    pub fn new(reducelr: usize, earlystop: usize) -> Self {
        Self {
            best: None,
            best_epoch: None,
            wait_lr: 0,
            wait_stop: 0,
            reducelr,
            earlystop,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Only a strictly smaller loss counts as an improvement
    pub fn observe(&mut self, epoch: usize, loss: f64) -> EpochVerdict {
        let improved = match self.best {
            Some(best) => loss < best,
            None => loss.is_finite(),
        };

        if improved {
            self.best = Some(loss);
            self.best_epoch = Some(epoch);
            self.wait_lr = 0;
            self.wait_stop = 0;
            return EpochVerdict::Improved;
        }

        self.wait_lr += 1;
        self.wait_stop += 1;

        if self.earlystop > 0 && self.wait_stop >= self.earlystop {
            return EpochVerdict::Stop;
        }

        if self.reducelr > 0 && self.wait_lr >= self.reducelr {
            self.wait_lr = 0;
            return EpochVerdict::ReduceLr;
        }

        EpochVerdict::Plateau
    }
}

/// One line of the training history
#[derive(Clone, Debug, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: Option<f64>,
    pub learning_rate: f64,
}

#[derive(Clone, Debug)]
pub struct TrainOutcome {
    /// `EarlyStopped` or `MaxEpochsReached`
    pub stopped: TrainingState,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    pub history: Vec<EpochRecord>,
}

/// Minibatch optimization of a `CountAutoencoder`
pub struct Trainer<'a> {
    pub model: &'a CountAutoencoder,
    pub varmap: &'a VarMap,
    pub config: &'a TrainConfig,
    pub use_size_factors: bool,
    pub device: &'a Device,
    /// weights file rewritten at every improvement
    pub checkpoint: Option<&'a str>,
    pub verbose: bool,
}

impl Trainer<'_> {
    /// Train until early stopping or the epoch limit, then restore the
    /// best weights into the `VarMap`
    ///
    /// * `train_data` - shuffled every epoch
    /// * `validation` - monitored if given; otherwise the training loss
    pub fn fit(
        &self,
        train_data: &mut InMemoryCountData,
        mut validation: Option<&mut InMemoryCountData>,
    ) -> anyhow::Result<TrainOutcome> {
        let config = self.config;
        let mut state = TrainingState::Initializing;

        if let Some(val) = validation.as_deref_mut() {
            val.ordered_minibatch(EVAL_BATCH_SIZE)?;
        }

        let vars = self.varmap.all_vars();
        let mut opt = CountOptimizer::new(config.optimizer, vars.clone(), config.learning_rate)?;
        let mut monitor = ConvergenceMonitor::new(config.reducelr, config.earlystop);
        let mut best_weights = snapshot_weights(self.varmap)?;
        let mut history = Vec::with_capacity(config.max_epochs);

        let pb = ProgressBar::new(config.max_epochs as u64);
        if self.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        info!(
            "Training on {} samples, {} epochs at most",
            train_data.num_samples(),
            config.max_epochs
        );
        enter(&mut state, TrainingState::Training);

        for epoch in 1..=config.max_epochs {
            train_data.shuffle_minibatch(config.batch_size)?;

            let mut loss_tot = 0_f64;
            let mut nn = 0_usize;

            for b in 0..train_data.num_minibatch() {
                let mb = train_data.minibatch_data(b, self.device)?;
                let out = self
                    .model
                    .forward_t(&mb, self.use_size_factors, config.ridge, true)?;
                let loss = self.model.loss(&out, config)?;
                let loss_val = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;

                if !loss_val.is_finite() {
                    return Err(EdamameError::NumericInstability {
                        epoch,
                        batch: b,
                        what: format!("loss = {}", loss_val),
                    }
                    .into());
                }

                let mut grads = loss.backward()?;
                let grad_norm = clip_grad_norm(&mut grads, &vars, config.gradclip)?;

                if !grad_norm.is_finite() {
                    return Err(EdamameError::NumericInstability {
                        epoch,
                        batch: b,
                        what: format!("gradient norm = {}", grad_norm),
                    }
                    .into());
                }

                opt.step(&grads)?;

                let rows = mb.counts.dim(0)?;
                loss_tot += loss_val * rows as f64;
                nn += rows;
            }

            let train_loss = loss_tot / nn.max(1) as f64;

            let val_loss = match validation.as_deref() {
                Some(val) => Some(self.evaluate(val, epoch)?),
                None => None,
            };

            history.push(EpochRecord {
                epoch,
                train_loss,
                val_loss,
                learning_rate: opt.learning_rate(),
            });

            if self.verbose {
                match val_loss {
                    Some(v) => info!("[{}] loss: {:.4}, val_loss: {:.4}", epoch, train_loss, v),
                    None => info!("[{}] loss: {:.4}", epoch, train_loss),
                }
            }
            pb.inc(1);

            match monitor.observe(epoch, val_loss.unwrap_or(train_loss)) {
                EpochVerdict::Improved => {
                    best_weights = snapshot_weights(self.varmap)?;
                    if let Some(file) = self.checkpoint {
                        self.varmap.save(file)?;
                    }
                }
                EpochVerdict::Plateau => {}
                EpochVerdict::ReduceLr => {
                    enter(&mut state, TrainingState::ReducingLr);
                    let lr = opt.learning_rate() * config.reducelr_factor;
                    opt.set_learning_rate(lr);
                    info!("[{}] learning rate reduced to {:.3e}", epoch, lr);
                    enter(&mut state, TrainingState::Training);
                }
                EpochVerdict::Stop => {
                    enter(&mut state, TrainingState::EarlyStopped);
                    info!(
                        "[{}] early stopping; the best epoch was {:?}",
                        epoch,
                        monitor.best_epoch()
                    );
                    break;
                }
            }
        }
        pb.finish_and_clear();

        if state == TrainingState::Training {
            enter(&mut state, TrainingState::MaxEpochsReached);
        }
        let stopped = state;

        restore_weights(self.varmap, &best_weights)?;
        if let Some(file) = self.checkpoint {
            self.varmap.save(file)?;
        }
        enter(&mut state, TrainingState::Done);

        Ok(TrainOutcome {
            stopped,
            best_epoch: monitor.best_epoch(),
            best_loss: monitor.best(),
            history,
        })
    }

    /// Mean negative log-likelihood per element plus weight penalties,
    /// without dropout and with batchnorm running statistics
    ///
    /// `data` must be partitioned already
    pub fn evaluate(&self, data: &InMemoryCountData, epoch: usize) -> anyhow::Result<f64> {
        let mut nll_tot = 0_f64;
        let mut n_elem = 0_usize;

        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_data(b, self.device)?;
            let out = self
                .model
                .forward_t(&mb, self.use_size_factors, self.config.ridge, false)?;
            let nll = out.nll.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;

            if !nll.is_finite() {
                return Err(EdamameError::NumericInstability {
                    epoch,
                    batch: b,
                    what: format!("validation loss = {}", nll),
                }
                .into());
            }
            nll_tot += nll;
            n_elem += out.nll.elem_count();
        }

        let penalty = match self.model.penalty(self.config)? {
            Some(p) => p.to_dtype(DType::F64)?.to_scalar::<f64>()?,
            None => 0.0,
        };

        Ok(nll_tot / n_elem.max(1) as f64 + penalty)
    }
}

fn enter(state: &mut TrainingState, next: TrainingState) {
    debug!("{:?} -> {:?}", state, next);
    *state = next;
}

/// Deep copies of every variable
fn snapshot_weights(varmap: &VarMap) -> anyhow::Result<HashMap<String, Tensor>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("variable map lock: {}", e))?;

    data.iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
        .collect()
}

fn restore_weights(varmap: &VarMap, snapshot: &HashMap<String, Tensor>) -> anyhow::Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("variable map lock: {}", e))?;

    for (name, var) in data.iter() {
        if let Some(t) = snapshot.get(name) {
            var.set(t)?;
        }
    }
    Ok(())
}

/// Hold out the test fold, or a random `fraction` of the training fold
///
/// Returns (training, validation) sample indexes
pub fn validation_split(
    data: &PreprocessedData,
    fraction: f32,
    seed: u64,
) -> (Vec<usize>, Vec<usize>) {
    let mut train = data.indices_of(Fold::Train);
    let test = data.indices_of(Fold::Test);

    if !test.is_empty() {
        return (train, test);
    }

    let n_val = (train.len() as f32 * fraction.clamp(0.0, 1.0)).floor() as usize;
    if n_val == 0 || n_val >= train.len() {
        return (train, vec![]);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    train.shuffle(&mut rng);
    let mut val = train.split_off(train.len() - n_val);
    train.sort_unstable();
    val.sort_unstable();
    (train, val)
}

/// One-hot side labels and their vocabulary, if the noise model wants
/// them
fn training_conditions(
    noise: &NoiseModel,
    conditions_file: Option<&str>,
    samples: &[Box<str>],
) -> anyhow::Result<Option<(ConditionVocabulary, Mat)>> {
    if !noise.needs_conditions() {
        if conditions_file.is_some() {
            info!("{} doesn't use conditions; ignoring them", noise);
        }
        return Ok(None);
    }

    match conditions_file {
        Some(file) => {
            let labels = read_conditions(file, samples)?;
            let vocab = ConditionVocabulary::from_labels(&labels);
            info!("{} conditions: {:?}", vocab.len(), vocab.labels);
            let onehot = vocab.one_hot(&labels)?;
            Ok(Some((vocab, onehot)))
        }
        None => {
            warn!("{} without --conditions: every sample shares one condition", noise);
            let vocab = ConditionVocabulary::single();
            let onehot = vocab.one_hot_single(samples.len())?;
            Ok(Some((vocab, onehot)))
        }
    }
}

/// Rows `idx` of the model input, counts, size factors (n x 1) and
/// conditions as one data loader
pub fn in_memory_data(
    input: &Mat,
    counts: &Mat,
    sf: &Mat,
    conditions: Option<&Mat>,
    idx: &[usize],
    seed: Option<u64>,
) -> anyhow::Result<InMemoryCountData> {
    let cond = conditions.map(|c| select_rows(c, idx));
    InMemoryCountData::from_args(InMemoryCountArgs {
        input: &select_rows(input, idx),
        counts: &select_rows(counts, idx),
        size_factors: &select_rows(sf, idx),
        conditions: cond.as_ref(),
        seed,
    })
}

pub fn run_train(args: &TrainArgs) -> anyhow::Result<TrainOutcome> {
    // 1. parse every option before reading data
    let noise: NoiseModel = args.noise_type.parse()?;
    let activation = parse_activation(&args.activation)?;
    let init = parse_weight_init(&args.init)?;
    let train_config = args.train_config()?;
    let dropout = parse_dropout_rates(&args.dropoutrate, args.hidden_sizes.len())?;
    let norm = args.normalization();

    // 2. data, normalization and side labels
    let data = PreprocessedData::load(&args.training_set, false)?;
    let dataset = &data.dataset;
    let nn = dataset.num_samples();
    info!("{} samples x {} features", nn, dataset.num_features());

    let conditions = training_conditions(&noise, args.conditions.as_deref(), &dataset.samples)?;

    let sf = if norm.size_factors {
        data.size_factors.clone()
    } else {
        vec![1.0; nn]
    };
    let sf_mat = Mat::from_column_slice(nn, 1, &sf);

    let (train_idx, val_idx) = validation_split(&data, args.validation_split, args.seed);
    if train_idx.is_empty() {
        return Err(anyhow::anyhow!("no training samples"));
    }
    info!(
        "{} training, {} validation samples",
        train_idx.len(),
        val_idx.len()
    );

    let x = transform_counts(&dataset.counts, &sf, &norm);
    let scaling = norm
        .scale_input
        .then(|| FeatureScaling::fit(&select_rows(&x, &train_idx)));
    let input = match scaling.as_ref() {
        Some(s) => s.apply(&x)?,
        None => x,
    };

    // 3. model
    let model_config = ModelConfig {
        input_dim: dataset.num_features(),
        hidden: args.hidden_sizes.clone(),
        dropout,
        noise,
        activation,
        init,
        batch_norm: args.batch_norm(),
        num_conditions: conditions.as_ref().map(|(v, _)| v.len()).unwrap_or(0),
    };
    model_config.validate()?;

    let dev = args.device.to_device(args.device_no);
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let model = CountAutoencoder::new(&model_config, vb)?;
    info!(
        "{} autoencoder, hidden {:?}, bottleneck {}",
        noise,
        model_config.hidden,
        model_config.latent_dim()
    );

    let mut artifact = ArtifactConfig {
        model: model_config,
        normalization: norm,
        size_factor_reference: data.reference.clone(),
        features: dataset.features.clone(),
        scaling,
        conditions: conditions.as_ref().map(|(v, _)| v.clone()),
        training: None,
    };

    mkdir(&args.outputdir)?;
    artifact.write(&args.outputdir)?;

    // 4. training
    let cond_mat = conditions.as_ref().map(|(_, m)| m);
    let seed = train_config.seed;
    let mut train_data =
        in_memory_data(&input, &dataset.counts, &sf_mat, cond_mat, &train_idx, seed)?;
    let mut val_data = if val_idx.is_empty() {
        None
    } else {
        Some(in_memory_data(&input, &dataset.counts, &sf_mat, cond_mat, &val_idx, seed)?)
    };

    let weights_file = join_path(&args.outputdir, WEIGHTS_FILE);
    let trainer = Trainer {
        model: &model,
        varmap: &varmap,
        config: &train_config,
        use_size_factors: norm.size_factors,
        device: &dev,
        checkpoint: Some(&weights_file),
        verbose: args.verbose,
    };
    let outcome = trainer.fit(&mut train_data, val_data.as_mut())?;

    info!(
        "{:?}; best epoch {:?}, loss {:?}",
        outcome.stopped, outcome.best_epoch, outcome.best_loss
    );

    // 5. artifact and outputs
    varmap.save(&weights_file)?;
    write_history(&join_path(&args.outputdir, HISTORY_FILE), &outcome.history)?;
    artifact.training = Some(TrainingSummary::from(&outcome));
    artifact.write(&args.outputdir)?;

    let selection = args.output_selection();
    if selection.reconstruct || selection.reduce {
        let preds = predict_all(&model, &input, cond_mat, &dev)?;
        write_predictions(
            &preds,
            &args.outputdir,
            &dataset.samples,
            &dataset.features,
            &selection,
        )?;
    }

    if args.saveweights {
        export_kernels(&varmap, &join_path(&args.outputdir, WEIGHTS_DIR))?;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(monitor: &mut ConvergenceMonitor, losses: &[f64]) -> Vec<EpochVerdict> {
        losses
            .iter()
            .enumerate()
            .map(|(i, &l)| monitor.observe(i + 1, l))
            .collect()
    }

    #[test]
    fn early_stop_at_last_improvement_plus_patience() {
        let mut monitor = ConvergenceMonitor::new(0, 3);
        let verdicts = run(&mut monitor, &[5.0, 4.0, 3.0, 3.5, 3.2, 3.1, 2.0]);

        let stop = verdicts
            .iter()
            .position(|v| *v == EpochVerdict::Stop)
            .map(|i| i + 1);
        assert_eq!(monitor.best_epoch(), Some(3));
        assert_eq!(stop, Some(3 + 3));
    }

    #[test]
    fn equal_loss_is_not_an_improvement() {
        let mut monitor = ConvergenceMonitor::new(0, 2);
        let verdicts = run(&mut monitor, &[1.0, 1.0, 1.0]);
        assert_eq!(
            verdicts,
            vec![
                EpochVerdict::Improved,
                EpochVerdict::Plateau,
                EpochVerdict::Stop
            ]
        );
        assert_eq!(monitor.best_epoch(), Some(1));
    }

    #[test]
    fn plateau_reduces_then_resets() {
        let mut monitor = ConvergenceMonitor::new(2, 0);
        let verdicts = run(&mut monitor, &[3.0, 3.0, 3.0, 3.0, 3.0, 2.0, 2.5]);
        assert_eq!(
            verdicts,
            vec![
                EpochVerdict::Improved,
                EpochVerdict::Plateau,
                EpochVerdict::ReduceLr,
                EpochVerdict::Plateau,
                EpochVerdict::ReduceLr,
                EpochVerdict::Improved,
                EpochVerdict::Plateau,
            ]
        );
    }

    #[test]
    fn stopping_wins_over_reduction() {
        let mut monitor = ConvergenceMonitor::new(2, 2);
        let verdicts = run(&mut monitor, &[1.0, 2.0, 2.0]);
        assert_eq!(verdicts[2], EpochVerdict::Stop);
    }

    #[test]
    fn zero_patience_never_fires() {
        let mut monitor = ConvergenceMonitor::new(0, 0);
        let verdicts = run(&mut monitor, &[1.0; 50]);
        assert!(verdicts[1..].iter().all(|v| *v == EpochVerdict::Plateau));
    }

    #[test]
    fn split_keeps_test_fold() {
        let data = PreprocessedData {
            dataset: CountDataset {
                samples: (0..5).map(|i| format!("s{}", i).into()).collect(),
                features: vec!["g".into()],
                counts: Mat::from_element(5, 1, 1.0),
            },
            size_factors: vec![1.0; 5],
            split: vec![Fold::Train, Fold::Test, Fold::Train, Fold::Train, Fold::Test],
            reference: SizeFactorReference::Zheng {
                median_library_size: 1.0,
            },
        };
        let (train, val) = validation_split(&data, 0.5, 1);
        assert_eq!(train, vec![0, 2, 3]);
        assert_eq!(val, vec![1, 4]);

        let data = PreprocessedData {
            split: vec![Fold::Train; 5],
            ..data
        };
        let (train, val) = validation_split(&data, 0.4, 1);
        assert_eq!(train.len(), 3);
        assert_eq!(val.len(), 2);
        let mut all = [train, val].concat();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);

        let (train, val) = validation_split(&data, 0.0, 1);
        assert_eq!((train.len(), val.len()), (5, 0));
    }
}
