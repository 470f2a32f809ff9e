use crate::common::*;
use crate::config::*;

use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, Module, ModuleT, VarBuilder};
use candle_util::candle_aux_layers::*;
use candle_util::candle_data_loader::CountMinibatch;
use candle_util::candle_loss_functions::{softplus, weight_penalty, CountFamily};
use candle_util::candle_model_traits::*;

const MIN_MEAN: f64 = 1e-5;
const MAX_MEAN: f64 = 1e6;
const MIN_DISPERSION: f64 = 1e-4;
const MAX_DISPERSION: f64 = 1e4;

/// exp link with the output clamped to [1e-5, 1e6]
pub fn mean_link(h: &Tensor) -> Result<Tensor> {
    h.clamp(MIN_MEAN.ln(), MAX_MEAN.ln())?.exp()
}

/// softplus link with the output clamped to [1e-4, 1e4]
pub fn dispersion_link(h: &Tensor) -> Result<Tensor> {
    softplus(h)?.clamp(MIN_DISPERSION, MAX_DISPERSION)
}

pub struct CountEncoder {
    n_features: usize,
    stack: DenseStack,
}

impl EncoderModuleT for CountEncoder {
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor> {
        self.stack.forward_t(x_nd, train)
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.stack.out_dim()
    }

    fn kernels(&self) -> Vec<&Tensor> {
        self.stack.kernels()
    }
}

impl CountEncoder {
    /// Will create `enc.{j}.*` for the layers up to the bottleneck
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let (widths, rates) = config.encoder_layers();
        let stack = DenseStack::new(
            config.input_dim,
            widths,
            rates,
            &stack_config(config),
            vb.pp("enc"),
        )?;
        Ok(Self {
            n_features: config.input_dim,
            stack,
        })
    }
}

/// Source of a dispersion or dropout parameter
enum ParamHead {
    /// dense layer on the decoder trunk
    Trunk(Linear),
    /// one trainable value per feature (1 x d)
    Shared(Tensor),
    /// dense layer on one-hot side labels
    Conditioned(Linear),
    /// its own trunk from the bottleneck, then a dense layer
    Forked { trunk: DenseStack, out: Linear },
}

impl ParamHead {
    fn new(
        mode: DispersionMode,
        config: &ModelConfig,
        trunk_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let d = config.input_dim;
        Ok(match mode {
            DispersionMode::PerSample => ParamHead::Trunk(dense(trunk_dim, d, config.init, vb)?),
            DispersionMode::Shared => {
                ParamHead::Shared(vb.get_with_hints((1, d), "shared", Init::Const(0.))?)
            }
            DispersionMode::Conditioned => ParamHead::Conditioned(dense(
                config.num_conditions,
                d,
                config.init,
                vb.pp("cond"),
            )?),
            DispersionMode::Forked => {
                let (widths, rates) = config.decoder_layers();
                let trunk = DenseStack::new(
                    config.latent_dim(),
                    widths,
                    rates,
                    &stack_config(config),
                    vb.pp("trunk"),
                )?;
                let out = dense(trunk.out_dim(), d, config.init, vb)?;
                ParamHead::Forked { trunk, out }
            }
        })
    }

    fn forward_t(
        &self,
        h_nl: &Tensor,
        z_nk: &Tensor,
        cond_nc: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        match self {
            ParamHead::Trunk(out) => out.forward(h_nl),
            ParamHead::Shared(theta) => Ok(theta.clone()),
            ParamHead::Conditioned(out) => {
                let cond_nc = cond_nc.ok_or_else(|| {
                    candle_core::Error::Msg("conditioned dispersion needs side labels".into())
                })?;
                out.forward(cond_nc)
            }
            ParamHead::Forked { trunk, out } => out.forward(&trunk.forward_t(z_nk, train)?),
        }
    }

    fn kernels(&self) -> Vec<&Tensor> {
        match self {
            ParamHead::Trunk(out) | ParamHead::Conditioned(out) => vec![out.weight()],
            ParamHead::Shared(_) => vec![],
            ParamHead::Forked { trunk, out } => {
                let mut ret = trunk.kernels();
                ret.push(out.weight());
                ret
            }
        }
    }
}

pub struct CountDecoder {
    n_features: usize,
    n_latent: usize,
    trunk: DenseStack,
    mean: Linear,
    dispersion: Option<ParamHead>,
    dropout: Option<ParamHead>,
}

impl DecoderModuleT for CountDecoder {
    fn forward_t(
        &self,
        z_nk: &Tensor,
        cond_nc: Option<&Tensor>,
        train: bool,
    ) -> Result<CountParams> {
        let h_nl = self.trunk.forward_t(z_nk, train)?;
        let mean = mean_link(&self.mean.forward(&h_nl)?)?;

        let dispersion = match &self.dispersion {
            Some(head) => Some(dispersion_link(
                &head.forward_t(&h_nl, z_nk, cond_nc, train)?,
            )?),
            None => None,
        };

        let dropout_logit = match &self.dropout {
            Some(head) => Some(head.forward_t(&h_nl, z_nk, cond_nc, train)?),
            None => None,
        };

        Ok(CountParams {
            mean,
            dispersion,
            dropout_logit,
        })
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }

    fn kernels(&self) -> Vec<&Tensor> {
        let mut ret = self.trunk.kernels();
        ret.push(self.mean.weight());
        for head in [&self.dispersion, &self.dropout].into_iter().flatten() {
            ret.extend(head.kernels());
        }
        ret
    }
}

impl CountDecoder {
    /// Will create these variables:
    ///
    /// * `dec.{j}.*` - decoder trunk after the bottleneck
    /// * `mean.*` - mean head
    /// * `disp.*` - dispersion head (`disp.shared`, `disp.cond.*` or
    ///   `disp.trunk.*` depending on the noise model)
    /// * `pi.*` - dropout head
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let (widths, rates) = config.decoder_layers();
        let trunk = DenseStack::new(
            config.latent_dim(),
            widths,
            rates,
            &stack_config(config),
            vb.pp("dec"),
        )?;
        let trunk_dim = trunk.out_dim();
        let mean = dense(trunk_dim, config.input_dim, config.init, vb.pp("mean"))?;

        let noise = config.noise;

        let dispersion = if noise.family.has_dispersion() {
            Some(ParamHead::new(
                noise.dispersion,
                config,
                trunk_dim,
                vb.pp("disp"),
            )?)
        } else {
            None
        };

        // dropout follows the dispersion only when forked
        let dropout = if noise.family.has_dropout() {
            let mode = match noise.dispersion {
                DispersionMode::Forked => DispersionMode::Forked,
                _ => DispersionMode::PerSample,
            };
            Some(ParamHead::new(mode, config, trunk_dim, vb.pp("pi"))?)
        } else {
            None
        };

        Ok(Self {
            n_features: config.input_dim,
            n_latent: config.latent_dim(),
            trunk,
            mean,
            dispersion,
            dropout,
        })
    }
}

fn stack_config(config: &ModelConfig) -> DenseStackConfig {
    DenseStackConfig {
        activation: config.activation,
        init: config.init,
        batch_norm: config.batch_norm,
    }
}

/// Output of one pass through the autoencoder
pub struct AutoencoderOut {
    /// bottleneck code (n x k)
    pub latent: Tensor,
    /// decoded parameters before size factor scaling
    pub params: CountParams,
    /// element-wise negative log-likelihood (n x d)
    pub nll: Tensor,
}

/// Encoder, decoder and the likelihood of the noise model
pub struct CountAutoencoder {
    pub encoder: CountEncoder,
    pub decoder: CountDecoder,
    family: CountFamily,
    num_conditions: usize,
}

impl CountAutoencoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            encoder: CountEncoder::new(config, vb.clone())?,
            decoder: CountDecoder::new(config, vb)?,
            family: config.noise.family,
            num_conditions: config.num_conditions,
        })
    }

    pub fn family(&self) -> CountFamily {
        self.family
    }

    pub fn num_conditions(&self) -> usize {
        self.num_conditions
    }

    /// Encode, decode and score a minibatch
    ///
    /// * `mb` - minibatch data
    /// * `use_size_factors` - multiply the decoded mean by size factors
    /// * `ridge` - ridge coefficient on dropout probabilities
    /// * `train` - whether to use dropout/batchnorm or not
    pub fn forward_t(
        &self,
        mb: &CountMinibatch,
        use_size_factors: bool,
        ridge: f64,
        train: bool,
    ) -> Result<AutoencoderOut> {
        let family = self.family;
        let nll_fn = |x: &Tensor, params: &CountParams| family.nll(x, params, ridge);

        let latent = self.encoder.forward_t(&mb.input, train)?;
        let sf = use_size_factors.then_some(&mb.size_factors);

        let (params, nll) = self.decoder.forward_with_nll(
            &latent,
            mb.conditions.as_ref(),
            &mb.counts,
            sf,
            &nll_fn,
            train,
        )?;

        Ok(AutoencoderOut {
            latent,
            params,
            nll,
        })
    }

    /// l1 * Σ|w| + l2 * Σw² over every dense kernel, plus the
    /// encoder-only terms
    pub fn penalty(&self, train_config: &TrainConfig) -> Result<Option<Tensor>> {
        let mut all = self.encoder.kernels();
        all.extend(self.decoder.kernels());

        let total = weight_penalty(&all, train_config.l1, train_config.l2)?;
        let enc = weight_penalty(
            &self.encoder.kernels(),
            train_config.l1_enc,
            train_config.l2_enc,
        )?;

        Ok(match (total, enc) {
            (Some(a), Some(b)) => Some(a.add(&b)?),
            (a, b) => a.or(b),
        })
    }

    /// Mean negative log-likelihood plus weight penalties
    pub fn loss(&self, out: &AutoencoderOut, train_config: &TrainConfig) -> Result<Tensor> {
        let nll = out.nll.mean_all()?;
        match self.penalty(train_config)? {
            Some(pen) => nll.add(&pen),
            None => Ok(nll),
        }
    }
}
