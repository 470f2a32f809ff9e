use crate::common::*;
use crate::config::*;
use crate::dataset::ConditionVocabulary;
use crate::model::CountAutoencoder;
use crate::normalization::*;
use crate::train::{EpochRecord, TrainOutcome};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use matrix_util::common_io::*;
use serde::{Deserialize, Serialize};

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "config.json";
pub const HISTORY_FILE: &str = "history.tsv";
pub const WEIGHTS_DIR: &str = "weights";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    pub epochs_run: usize,
    pub stopped: String,
}

impl From<&TrainOutcome> for TrainingSummary {
    fn from(outcome: &TrainOutcome) -> Self {
        Self {
            best_epoch: outcome.best_epoch,
            best_loss: outcome.best_loss,
            epochs_run: outcome.history.len(),
            stopped: format!("{:?}", outcome.stopped),
        }
    }
}

/// Everything besides the weights needed to replay a trained model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub model: ModelConfig,
    pub normalization: InputNormalization,
    pub size_factor_reference: SizeFactorReference,
    pub features: Vec<Box<str>>,
    pub scaling: Option<FeatureScaling>,
    pub conditions: Option<ConditionVocabulary>,
    #[serde(default)]
    pub training: Option<TrainingSummary>,
}

impl ArtifactConfig {
    pub fn write(&self, dir: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(join_path(dir, CONFIG_FILE), json)?;
        Ok(())
    }

    pub fn read(dir: &str) -> anyhow::Result<Self> {
        let file = join_path(dir, CONFIG_FILE);
        let json = std::fs::read_to_string(&file)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", file, e))?;
        let config: Self = serde_json::from_str(&json)?;

        if config.features.len() != config.model.input_dim {
            return Err(anyhow::anyhow!(
                "{}: {} feature names for input width {}",
                file,
                config.features.len(),
                config.model.input_dim
            ));
        }
        Ok(config)
    }
}

/// A model restored from its directory
pub struct TrainedModel {
    pub config: ArtifactConfig,
    pub varmap: VarMap,
    pub model: CountAutoencoder,
}

impl TrainedModel {
    /// Rebuild the graph from `config.json`, then overwrite every
    /// variable with `model.safetensors`
    pub fn load(dir: &str, dev: &Device) -> anyhow::Result<Self> {
        let config = ArtifactConfig::read(dir)?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let model = CountAutoencoder::new(&config.model, vb)?;
        varmap.load(join_path(dir, WEIGHTS_FILE))?;

        info!(
            "Loaded {} autoencoder: {} features, bottleneck {}",
            config.model.noise,
            config.model.input_dim,
            config.model.latent_dim()
        );

        Ok(Self {
            config,
            varmap,
            model,
        })
    }
}

/// `epoch`, `loss`, `val_loss` (`NA` if none), `lr`
pub fn write_history(file: &str, history: &[EpochRecord]) -> anyhow::Result<()> {
    let mut lines: Vec<Box<str>> = Vec::with_capacity(history.len() + 1);
    lines.push("epoch\tloss\tval_loss\tlr".into());
    for rec in history {
        let val = rec
            .val_loss
            .map(|v| v.to_string())
            .unwrap_or_else(|| "NA".to_string());
        lines.push(
            format!(
                "{}\t{}\t{}\t{}",
                rec.epoch, rec.train_loss, val, rec.learning_rate
            )
            .into_boxed_str(),
        );
    }
    write_lines(&lines, file)
}

/// Parse a history file written by `write_history`
pub fn read_history(file: &str) -> anyhow::Result<Vec<EpochRecord>> {
    let parsed = read_lines_of_words_delim(file, "\t", Some(0))?;
    parsed
        .lines
        .iter()
        .map(|words| match words.as_slice() {
            [epoch, loss, val, lr] => Ok(EpochRecord {
                epoch: epoch.parse()?,
                train_loss: loss.parse()?,
                val_loss: match &**val {
                    "NA" => None,
                    v => Some(v.parse()?),
                },
                learning_rate: lr.parse()?,
            }),
            _ => Err(anyhow::anyhow!("{}: expected 4 columns", file)),
        })
        .collect()
}

/// Write each 2-D `*.weight` variable to `{dir}/{name}.tsv.gz`
/// (output units x input units)
pub fn export_kernels(varmap: &VarMap, dir: &str) -> anyhow::Result<usize> {
    mkdir(dir)?;
    let data = varmap
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("variable map lock: {}", e))?;

    let mut names: Vec<&String> = data
        .iter()
        .filter(|(name, var)| name.ends_with(".weight") && var.rank() == 2)
        .map(|(name, _)| name)
        .collect();
    names.sort();

    for name in names.iter() {
        if let Some(var) = data.get(*name) {
            let kernel = Mat::from_tensor(var.as_tensor())?;
            kernel.to_tsv(&join_path(dir, &format!("{}.tsv.gz", name)))?;
        }
    }
    info!("Exported {} kernels to {}", names.len(), dir);
    Ok(names.len())
}
