use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
pub struct ParamsRmsProp {
    pub lr: f64,
    pub rho: f64,
    pub eps: f64,
}

impl Default for ParamsRmsProp {
    fn default() -> Self {
        Self {
            lr: 0.001,
            rho: 0.9,
            eps: 1e-7,
        }
    }
}

struct VarRmsProp {
    var: Var,
    sq_avg: Var,
}

/// RMSProp without momentum
///
/// v ← ρ v + (1 - ρ) g²
/// w ← w - lr * g / (√v + ε)
pub struct RmsProp {
    vars: Vec<VarRmsProp>,
    params: ParamsRmsProp,
}

impl Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let sq_avg = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarRmsProp { var, sq_avg })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let rho = self.params.rho;
        let lr = self.params.lr;
        let eps = self.params.eps;

        for v in self.vars.iter() {
            if let Some(g) = grads.get(&v.var) {
                let sq_avg = ((v.sq_avg.as_tensor() * rho)? + (g.sqr()? * (1.0 - rho))?)?;
                let update = g.div(&(sq_avg.sqrt()? + eps)?)?;
                v.var.set(&v.var.as_tensor().sub(&(update * lr)?)?)?;
                v.sq_avg.set(&sq_avg)?;
            }
        }
        Ok(())
    }
}

/// Optimizer choices exposed on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Rmsprop,
    Adam,
    Adamw,
    Sgd,
}

impl OptimizerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "rmsprop" => Some(Self::Rmsprop),
            "adam" => Some(Self::Adam),
            "adamw" => Some(Self::Adamw),
            "sgd" => Some(Self::Sgd),
            _ => None,
        }
    }

    pub fn default_learning_rate(&self) -> f64 {
        match self {
            Self::Sgd => 0.01,
            _ => 0.001,
        }
    }
}

/// One of the supported optimizers behind a single interface
pub enum CountOptimizer {
    RmsProp(RmsProp),
    AdamW(AdamW),
    Sgd(SGD),
}

impl CountOptimizer {
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64) -> Result<Self> {
        Ok(match kind {
            OptimizerKind::Rmsprop => Self::RmsProp(RmsProp::new(
                vars,
                ParamsRmsProp {
                    lr,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Adam => Self::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Adamw => Self::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Sgd => Self::Sgd(SGD::new(vars, lr)?),
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::RmsProp(opt) => opt.step(grads),
            Self::AdamW(opt) => opt.step(grads),
            Self::Sgd(opt) => opt.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::RmsProp(opt) => opt.learning_rate(),
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::RmsProp(opt) => opt.set_learning_rate(lr),
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// Rescale gradients so that their global L2 norm is at most
/// `max_norm`; returns the norm before clipping
///
/// * `grads` - gradients from `backward()`
/// * `vars` - trainable variables
/// * `max_norm` - no clipping if not positive
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sq_sum = 0_f64;
    for var in vars {
        if let Some(g) = grads.get(var) {
            sq_sum += g
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let norm = sq_sum.sqrt();

    if max_norm > 0.0 && norm.is_finite() && norm > max_norm {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(g) = grads.remove(var) {
                grads.insert(var, (g * scale)?);
            }
        }
    }
    Ok(norm)
}
