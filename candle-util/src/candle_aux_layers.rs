use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Dropout, Init, Linear, ModuleT, VarBuilder};
use serde::{Deserialize, Serialize};

const SELU_ALPHA: f64 = 1.673_263_242_354_377_2;
const SELU_SCALE: f64 = 1.050_700_987_355_480_5;
const LEAKY_SLOPE: f64 = 0.3;

/// Activation of hidden dense layers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HiddenActivation {
    Relu,
    Elu,
    Selu,
    LeakyRelu,
    Tanh,
    Sigmoid,
    Gelu,
    Silu,
    Linear,
}

impl HiddenActivation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "relu" => Some(Self::Relu),
            "elu" => Some(Self::Elu),
            "selu" => Some(Self::Selu),
            "leakyrelu" => Some(Self::LeakyRelu),
            "tanh" => Some(Self::Tanh),
            "sigmoid" => Some(Self::Sigmoid),
            "gelu" => Some(Self::Gelu),
            "silu" | "swish" => Some(Self::Silu),
            "linear" => Some(Self::Linear),
            _ => None,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => x.relu(),
            Self::Elu => x.elu(1.0),
            Self::Selu => x.elu(SELU_ALPHA)? * SELU_SCALE,
            Self::LeakyRelu => candle_nn::ops::leaky_relu(x, LEAKY_SLOPE),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => candle_nn::ops::sigmoid(x),
            Self::Gelu => x.gelu_erf(),
            Self::Silu => x.silu(),
            Self::Linear => Ok(x.clone()),
        }
    }
}

/// Kernel initialization of dense layers; biases start at zero
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightInit {
    GlorotUniform,
    GlorotNormal,
    HeUniform,
    HeNormal,
    LecunNormal,
}

impl WeightInit {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "glorot_uniform" => Some(Self::GlorotUniform),
            "glorot_normal" => Some(Self::GlorotNormal),
            "he_uniform" => Some(Self::HeUniform),
            "he_normal" => Some(Self::HeNormal),
            "lecun_normal" => Some(Self::LecunNormal),
            _ => None,
        }
    }

    pub fn to_init(&self, fan_in: usize, fan_out: usize) -> Init {
        let fan_in = fan_in.max(1) as f64;
        let fan_avg = (fan_in + fan_out.max(1) as f64) / 2.0;
        match self {
            Self::GlorotUniform => {
                let limit = (3.0 / fan_avg).sqrt();
                Init::Uniform {
                    lo: -limit,
                    up: limit,
                }
            }
            Self::GlorotNormal => Init::Randn {
                mean: 0.0,
                stdev: (1.0 / fan_avg).sqrt(),
            },
            Self::HeUniform => {
                let limit = (6.0 / fan_in).sqrt();
                Init::Uniform {
                    lo: -limit,
                    up: limit,
                }
            }
            Self::HeNormal => Init::Randn {
                mean: 0.0,
                stdev: (2.0 / fan_in).sqrt(),
            },
            Self::LecunNormal => Init::Randn {
                mean: 0.0,
                stdev: (1.0 / fan_in).sqrt(),
            },
        }
    }
}

/// A dense layer with `init` kernel and zero bias
///
/// * `{vb}.weight` - (out_dim x in_dim)
/// * `{vb}.bias` - (out_dim)
pub fn dense(in_dim: usize, out_dim: usize, init: WeightInit, vb: VarBuilder) -> Result<Linear> {
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", init.to_init(in_dim, out_dim))?;
    let bs = vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?;
    Ok(Linear::new(ws, Some(bs)))
}

/// Shared options of a stack of hidden layers
#[derive(Clone, Debug)]
pub struct DenseStackConfig {
    pub activation: HiddenActivation,
    pub init: WeightInit,
    pub batch_norm: bool,
}

/// linear -> batchnorm -> activation -> dropout
pub struct DenseBlock {
    linear: Linear,
    batch_norm: Option<BatchNorm>,
    activation: HiddenActivation,
    dropout: Option<Dropout>,
}

impl ModuleT for DenseBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = self.linear.forward_t(x, train)?;
        if let Some(bn) = &self.batch_norm {
            h = bn.forward_t(&h, train)?;
        }
        h = self.activation.forward(&h)?;
        if let Some(dropout) = &self.dropout {
            h = dropout.forward_t(&h, train)?;
        }
        Ok(h)
    }
}

impl DenseBlock {
    pub fn weight(&self) -> &Tensor {
        self.linear.weight()
    }
}

/// build a stack of dense blocks
pub struct DenseStack {
    blocks: Vec<DenseBlock>,
    out_dim: usize,
}

impl ModuleT for DenseStack {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for block in self.blocks.iter() {
            x = block.forward_t(&x, train)?;
        }
        Ok(x)
    }
}

impl DenseStack {
    /// Will create variables:
    ///
    /// * `{vb}.{j}.weight`, `{vb}.{j}.bias` for each layer `j`
    /// * `{vb}.{j}.bn.*` if batchnorm is on
    ///
    /// # Arguments
    /// * `in_dim` - input dimension
    /// * `widths` - output width of each layer
    /// * `dropout_rates` - dropout rate of each layer (0 to skip)
    /// * `config` - activation, initialization, batchnorm
    pub fn new(
        in_dim: usize,
        widths: &[usize],
        dropout_rates: &[f32],
        config: &DenseStackConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bn_config = candle_nn::BatchNormConfig {
            eps: 1e-3,
            remove_mean: true,
            affine: true,
            momentum: 0.01,
        };

        let mut blocks = Vec::with_capacity(widths.len());
        let mut prev_dim = in_dim;

        for (j, &next_dim) in widths.iter().enumerate() {
            let vb_j = vb.pp(j.to_string());
            let linear = dense(prev_dim, next_dim, config.init, vb_j.clone())?;

            let batch_norm = if config.batch_norm {
                Some(candle_nn::batch_norm(next_dim, bn_config, vb_j.pp("bn"))?)
            } else {
                None
            };

            let rate = dropout_rates.get(j).copied().unwrap_or(0.0);
            let dropout = (rate > 0.0).then(|| Dropout::new(rate));

            blocks.push(DenseBlock {
                linear,
                batch_norm,
                activation: config.activation,
                dropout,
            });
            prev_dim = next_dim;
        }

        Ok(Self {
            blocks,
            out_dim: prev_dim,
        })
    }

    /// output width; the input width if there are no layers
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn kernels(&self) -> Vec<&Tensor> {
        self.blocks.iter().map(|b| b.weight()).collect()
    }
}
