use crate::common::*;
use crate::error::EdamameError;

use candle_core::Device;
use candle_util::candle_aux_layers::{HiddenActivation, WeightInit};
use candle_util::candle_loss_functions::CountFamily;
use candle_util::candle_optimizers::OptimizerKind;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const NOISE_MODEL_NAMES: [&str; 10] = [
    "normal",
    "poisson",
    "nb",
    "nb-shared",
    "nb-conddisp",
    "nb-fork",
    "zinb",
    "zinb-shared",
    "zinb-conddisp",
    "zinb-fork",
];

/// Where the dispersion (and dropout) parameters come from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispersionMode {
    /// extra heads on the shared decoder trunk
    PerSample,
    /// one trainable value per feature
    Shared,
    /// a branch fed by one-hot side labels
    Conditioned,
    /// a separate decoder trunk per head
    Forked,
}

/// Noise model: a likelihood family and a dispersion strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NoiseModel {
    pub family: CountFamily,
    pub dispersion: DispersionMode,
}

impl NoiseModel {
    pub fn needs_conditions(&self) -> bool {
        self.family.has_dispersion() && self.dispersion == DispersionMode::Conditioned
    }

    pub fn name(&self) -> &'static str {
        use CountFamily::*;
        use DispersionMode::*;
        match (self.family, self.dispersion) {
            (Normal, _) => "normal",
            (Poisson, _) => "poisson",
            (NegBinom, PerSample) => "nb",
            (NegBinom, Shared) => "nb-shared",
            (NegBinom, Conditioned) => "nb-conddisp",
            (NegBinom, Forked) => "nb-fork",
            (ZeroInflated, PerSample) => "zinb",
            (ZeroInflated, Shared) => "zinb-shared",
            (ZeroInflated, Conditioned) => "zinb-conddisp",
            (ZeroInflated, Forked) => "zinb-fork",
        }
    }
}

impl FromStr for NoiseModel {
    type Err = EdamameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        let (family, suffix) = match lower.split_once('-') {
            Some((family, suffix)) => (family, Some(suffix)),
            None => (lower.as_str(), None),
        };

        let family = match family {
            "normal" => CountFamily::Normal,
            "poisson" => CountFamily::Poisson,
            "nb" => CountFamily::NegBinom,
            "zinb" => CountFamily::ZeroInflated,
            _ => return Err(EdamameError::unrecognized("noise model", s, &NOISE_MODEL_NAMES)),
        };

        let dispersion = match (family.has_dispersion(), suffix) {
            (_, None) => DispersionMode::PerSample,
            (true, Some("shared")) => DispersionMode::Shared,
            (true, Some("conddisp")) => DispersionMode::Conditioned,
            (true, Some("fork")) => DispersionMode::Forked,
            _ => return Err(EdamameError::unrecognized("noise model", s, &NOISE_MODEL_NAMES)),
        };

        Ok(NoiseModel { family, dispersion })
    }
}

impl fmt::Display for NoiseModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TryFrom<String> for NoiseModel {
    type Error = EdamameError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NoiseModel> for String {
    fn from(m: NoiseModel) -> String {
        m.name().to_string()
    }
}

/// Size factor estimators
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeFactorMethod {
    Deseq,
    Zheng,
}

impl FromStr for SizeFactorMethod {
    type Err = EdamameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deseq" => Ok(Self::Deseq),
            "zheng" => Ok(Self::Zheng),
            _ => Err(EdamameError::unrecognized(
                "size factor estimator",
                s,
                &["deseq", "zheng"],
            )),
        }
    }
}

pub fn parse_activation(name: &str) -> Result<HiddenActivation, EdamameError> {
    HiddenActivation::from_name(name).ok_or_else(|| {
        EdamameError::unrecognized(
            "activation",
            name,
            &["relu", "elu", "selu", "leakyrelu", "tanh", "sigmoid", "gelu", "silu", "linear"],
        )
    })
}

pub fn parse_weight_init(name: &str) -> Result<WeightInit, EdamameError> {
    WeightInit::from_name(name).ok_or_else(|| {
        EdamameError::unrecognized(
            "initializer",
            name,
            &["glorot_uniform", "glorot_normal", "he_uniform", "he_normal", "lecun_normal"],
        )
    })
}

pub fn parse_optimizer(name: &str) -> Result<OptimizerKind, EdamameError> {
    OptimizerKind::from_name(name).ok_or_else(|| {
        EdamameError::unrecognized("optimizer", name, &["rmsprop", "adam", "adamw", "sgd"])
    })
}

/// Dropout rates, one per hidden layer; a single value is broadcast
pub fn parse_dropout_rates(arg: &str, num_layers: usize) -> anyhow::Result<Vec<f32>> {
    let rates = arg
        .split(',')
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .map(|w| {
            w.parse::<f32>()
                .map_err(|_| anyhow::anyhow!("invalid dropout rate `{}`", w))
        })
        .collect::<anyhow::Result<Vec<f32>>>()?;

    if let Some(bad) = rates.iter().find(|r| !(0.0..1.0).contains(*r)) {
        return Err(anyhow::anyhow!("dropout rate {} outside [0, 1)", bad));
    }

    match rates.len() {
        0 => Ok(vec![0.0; num_layers]),
        1 => Ok(vec![rates[0]; num_layers]),
        n if n == num_layers => Ok(rates),
        n => Err(anyhow::anyhow!(
            "{} dropout rates for {} hidden layers",
            n,
            num_layers
        )),
    }
}

/// Input transformation toggles, applied in this order: size factor
/// division, log1p, per-feature standardization.  `size_factors` also
/// scales the decoded mean.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputNormalization {
    pub size_factors: bool,
    pub log_input: bool,
    pub scale_input: bool,
}

impl Default for InputNormalization {
    fn default() -> Self {
        Self {
            size_factors: true,
            log_input: true,
            scale_input: true,
        }
    }
}

/// Architecture of the count autoencoder
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub input_dim: usize,
    pub hidden: Vec<usize>,
    pub dropout: Vec<f32>,
    pub noise: NoiseModel,
    pub activation: HiddenActivation,
    pub init: WeightInit,
    pub batch_norm: bool,
    /// width of the one-hot side label, 0 if unused
    pub num_conditions: usize,
}

impl ModelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input_dim == 0 {
            return Err(anyhow::anyhow!("no input features"));
        }
        if self.hidden.is_empty() || self.hidden.contains(&0) {
            return Err(anyhow::anyhow!(
                "hidden sizes must be positive: {:?}",
                self.hidden
            ));
        }
        if self.dropout.len() != self.hidden.len() {
            return Err(anyhow::anyhow!(
                "{} dropout rates for {} hidden layers",
                self.dropout.len(),
                self.hidden.len()
            ));
        }
        if self.noise.needs_conditions() && self.num_conditions == 0 {
            return Err(anyhow::anyhow!("{} needs at least one condition", self.noise));
        }
        Ok(())
    }

    /// Index of the narrowest hidden layer; among equally narrow
    /// layers the one closest to the middle, then the earlier one
    pub fn bottleneck_index(&self) -> usize {
        bottleneck_index(&self.hidden)
    }

    pub fn latent_dim(&self) -> usize {
        self.hidden[self.bottleneck_index()]
    }

    /// (widths, dropout rates) of the encoder, bottleneck included
    pub fn encoder_layers(&self) -> (&[usize], &[f32]) {
        let b = self.bottleneck_index();
        (&self.hidden[..=b], &self.dropout[..=b])
    }

    /// (widths, dropout rates) of the decoder trunk
    pub fn decoder_layers(&self) -> (&[usize], &[f32]) {
        let b = self.bottleneck_index();
        (&self.hidden[b + 1..], &self.dropout[b + 1..])
    }
}

pub fn bottleneck_index(hidden: &[usize]) -> usize {
    let Some(&narrowest) = hidden.iter().min() else {
        return 0;
    };
    // twice the distance to the middle, to stay in integers
    let middle2 = hidden.len().saturating_sub(1);
    hidden
        .iter()
        .enumerate()
        .filter(|&(_, &w)| w == narrowest)
        .min_by_key(|&(i, _)| ((2 * i).abs_diff(middle2), i))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Optimization settings of the training controller
#[derive(Clone, Debug)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub max_epochs: usize,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    /// epochs without improvement before the learning rate drops (0: never)
    pub reducelr: usize,
    pub reducelr_factor: f64,
    /// epochs without improvement before stopping (0: never)
    pub earlystop: usize,
    /// global gradient norm bound (0: no clipping)
    pub gradclip: f64,
    pub l1: f64,
    pub l2: f64,
    pub l1_enc: f64,
    pub l2_enc: f64,
    pub ridge: f64,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_epochs: 500,
            optimizer: OptimizerKind::Rmsprop,
            learning_rate: 0.001,
            reducelr: 10,
            reducelr_factor: 0.5,
            earlystop: 15,
            gradclip: 5.0,
            l1: 0.0,
            l2: 0.0,
            l1_enc: 0.0,
            l2_enc: 0.0,
            ridge: 0.0,
            seed: None,
        }
    }
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    /// Candle device; falls back to CPU if the backend is unavailable
    pub fn to_device(&self, device_no: usize) -> Device {
        let dev = match self {
            ComputeDevice::Cuda => Device::new_cuda(device_no),
            ComputeDevice::Metal => Device::new_metal(device_no),
            ComputeDevice::Cpu => return Device::Cpu,
        };
        match dev {
            Ok(dev) => dev,
            Err(err) => {
                warn!("{:?} device unavailable ({}); using CPU", self, err);
                Device::Cpu
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_model_names_round_trip() {
        for name in NOISE_MODEL_NAMES {
            let model: NoiseModel = name.parse().expect("known name");
            assert_eq!(model.name(), name);
            assert_eq!(model.to_string(), name);
        }

        let m: NoiseModel = "ZINB-CondDisp".parse().expect("case-insensitive");
        assert_eq!(m.family, CountFamily::ZeroInflated);
        assert_eq!(m.dispersion, DispersionMode::Conditioned);
    }

    #[test]
    fn unknown_noise_models_are_rejected() {
        for name in ["gamma", "poisson-shared", "normal-fork", "nb-forked", ""] {
            let err = name.parse::<NoiseModel>().expect_err("must fail");
            assert!(matches!(err, EdamameError::UnrecognizedVariant { .. }));
        }
    }

    #[test]
    fn conditions_only_for_conditioned_dispersion() {
        let m: NoiseModel = "zinb-conddisp".parse().expect("zinb-conddisp");
        assert!(m.needs_conditions());
        let m: NoiseModel = "nb-fork".parse().expect("nb-fork");
        assert!(!m.needs_conditions());
    }

    #[test]
    fn bottleneck_ties_go_to_the_middle() {
        assert_eq!(bottleneck_index(&[32, 32, 32]), 1);
        assert_eq!(bottleneck_index(&[8, 4, 8]), 1);
        assert_eq!(bottleneck_index(&[64, 32]), 1);
        assert_eq!(bottleneck_index(&[16]), 0);
        assert_eq!(bottleneck_index(&[16, 16, 16, 16]), 1);
        assert_eq!(bottleneck_index(&[4, 64, 64, 4]), 0);
    }

    #[test]
    fn dropout_rates_broadcast() -> anyhow::Result<()> {
        assert_eq!(parse_dropout_rates("0.1", 3)?, vec![0.1; 3]);
        assert_eq!(parse_dropout_rates("0.1,0,0.2", 3)?, vec![0.1, 0.0, 0.2]);
        assert!(parse_dropout_rates("0.1,0.2", 3).is_err());
        assert!(parse_dropout_rates("1.5", 3).is_err());
        Ok(())
    }

    #[test]
    fn encoder_and_decoder_split_at_bottleneck() {
        let config = ModelConfig {
            input_dim: 20,
            hidden: vec![8, 4, 8],
            dropout: vec![0.0, 0.1, 0.2],
            noise: "nb".parse().expect("nb"),
            activation: HiddenActivation::Elu,
            init: WeightInit::GlorotUniform,
            batch_norm: true,
            num_conditions: 0,
        };
        assert_eq!(config.encoder_layers().0, &[8, 4]);
        assert_eq!(config.decoder_layers(), (&[8usize][..], &[0.2f32][..]));
        assert_eq!(config.latent_dim(), 4);
        assert!(config.validate().is_ok());
    }
}
