use candle_core::{Result, Tensor};

/// Decoded parameters of a count distribution, all (n x d) or
/// broadcastable to it
#[derive(Clone, Debug)]
pub struct CountParams {
    /// mean μ
    pub mean: Tensor,
    /// inverse dispersion θ
    pub dispersion: Option<Tensor>,
    /// logit of the dropout probability π
    pub dropout_logit: Option<Tensor>,
}

impl CountParams {
    pub fn require_dispersion(&self) -> Result<&Tensor> {
        self.dispersion
            .as_ref()
            .ok_or_else(|| candle_core::Error::Msg("missing dispersion head".into()))
    }

    pub fn require_dropout_logit(&self) -> Result<&Tensor> {
        self.dropout_logit
            .as_ref()
            .ok_or_else(|| candle_core::Error::Msg("missing dropout head".into()))
    }

    /// Multiply the mean by per-sample size factors
    ///
    /// * `sf_n1` - size factors (n x 1)
    pub fn scale_mean(self, sf_n1: &Tensor) -> Result<Self> {
        Ok(CountParams {
            mean: self.mean.broadcast_mul(sf_n1)?,
            dispersion: self.dispersion,
            dropout_logit: self.dropout_logit,
        })
    }
}

pub trait EncoderModuleT {
    /// An encoder that maps inputs to the bottleneck code
    ///
    /// # Arguments
    /// * `x_nd` - normalized input data (n x d)
    /// * `train` - whether to use dropout/batchnorm or not
    ///
    /// # Returns `z_nk` - bottleneck code (n x k)
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;

    /// dense kernels for weight penalties
    fn kernels(&self) -> Vec<&Tensor>;
}

pub trait DecoderModuleT {
    /// A decoder that spits out distribution parameters
    ///
    /// * `z_nk` - bottleneck code
    /// * `cond_nc` - one-hot side labels, if the model uses them
    /// * `train` - whether to use dropout/batchnorm or not
    fn forward_t(&self, z_nk: &Tensor, cond_nc: Option<&Tensor>, train: bool)
        -> Result<CountParams>;

    /// A decoder that spits out parameters and the element-wise
    /// negative log-likelihood of the observed counts
    ///
    /// * `z_nk` - bottleneck code
    /// * `cond_nc` - one-hot side labels
    /// * `x_nd` - observed counts to validate with
    /// * `sf_n1` - size factors multiplied into the mean
    /// * `nll` - fn (observed, parameters) -> negative log-likelihood
    fn forward_with_nll<NllFn>(
        &self,
        z_nk: &Tensor,
        cond_nc: Option<&Tensor>,
        x_nd: &Tensor,
        sf_n1: Option<&Tensor>,
        nll: &NllFn,
        train: bool,
    ) -> Result<(CountParams, Tensor)>
    where
        NllFn: Fn(&Tensor, &CountParams) -> Result<Tensor>,
    {
        let params = self.forward_t(z_nk, cond_nc, train)?;
        let scaled = match sf_n1 {
            Some(sf_n1) => params.clone().scale_mean(sf_n1)?,
            None => params.clone(),
        };
        let nll_nd = nll(x_nd, &scaled)?;
        Ok((params, nll_nd))
    }

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;

    /// dense kernels for weight penalties
    fn kernels(&self) -> Vec<&Tensor>;
}
