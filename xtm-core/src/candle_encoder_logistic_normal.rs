use crate::candle_aux_layers::*;
use crate::candle_loss_functions::DirichletLogisticNormalPrior;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{ops, Dropout, Linear, Module, ModuleT, VarBuilder, VarMap};

pub struct LogisticNormalEncoder {
    n_features: usize,
    n_topics: usize,
    fc: StackLayers<Linear>,
    dropout: Dropout,
    z_mean: Linear,
    z_lnvar: Linear,
    bn_mean: ShiftBatchNorm,
    bn_lnvar: ShiftBatchNorm,
    prior: DirichletLogisticNormalPrior,
}

pub struct LogisticNormalEncoderArgs {
    pub n_features: usize,
    pub n_topics: usize,
    pub n_hidden: usize,
    pub dropout: f32,
    pub prior_concentration: f64,
}

impl EncoderModuleT for LogisticNormalEncoder {
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<EncoderLatent> {
        let (z_mean_nk, z_lnvar_nk) = self.latent_gaussian_params(x_nd, train)?;
        let z_nk = self.reparameterize(&z_mean_nk, &z_lnvar_nk, train)?;

        Ok(EncoderLatent {
            theta_nk: ops::softmax(&z_nk, 1)?,
            kl_n: self.prior.kl_loss(&z_mean_nk, &z_lnvar_nk)?,
        })
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_topics
    }
}

impl LogisticNormalEncoder {
    ///
    /// Evaluate latent Gaussian parameters: mu and log_var
    /// z ~ (mu(x), log_var(x))
    pub fn latent_gaussian_params(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        debug_assert_eq!(x_nd.dims().len(), 2);

        let h_nl = self.fc.forward(x_nd)?;
        let h_nl = self.dropout.forward_t(&h_nl, train)?;

        let z_mean_nk = self
            .bn_mean
            .forward_t(&self.z_mean.forward(&h_nl)?, train)?;
        let z_lnvar_nk = self
            .bn_lnvar
            .forward_t(&self.z_lnvar.forward(&h_nl)?, train)?;

        Ok((z_mean_nk, z_lnvar_nk))
    }

    ///
    /// z = mu + sigma * eps
    /// where eps ~ N(0, 1)
    ///
    /// # Arguments
    /// * `z_mean` - mean of Gaussian distribution
    /// * `z_lnvar` - log variance of Gaussian distribution
    fn reparameterize(&self, z_mean: &Tensor, z_lnvar: &Tensor, train: bool) -> Result<Tensor> {
        if train {
            let eps = Tensor::randn_like(z_mean, 0., 1.)?;
            z_mean + (z_lnvar * 0.5)?.exp()? * eps
        } else {
            Ok(z_mean.clone())
        }
    }

    pub fn prior(&self) -> &DirichletLogisticNormalPrior {
        &self.prior
    }

    /// Will create a new logistic-normal encoder module
    /// with these variables:
    ///
    /// * `fc.{}.weight` where {} is the layer index (2 layers)
    /// * `z.mean.weight`, `z.lnvar.weight`
    /// * `bn.mean.{shift,running_mean,running_var}`
    /// * `bn.lnvar.{shift,running_mean,running_var}`
    ///
    /// # Arguments
    /// * `args` - dimensions and dropout rate
    /// * `vs` - variable builder
    /// * `varmap` - where running statistics are registered
    pub fn new(args: LogisticNormalEncoderArgs, vs: VarBuilder, varmap: &VarMap) -> Result<Self> {
        let LogisticNormalEncoderArgs {
            n_features,
            n_topics,
            n_hidden,
            dropout,
            prior_concentration,
        } = args;

        // (1) data -> fc -> fc
        let mut fc = StackLayers::<Linear>::new();
        let mut prev_dim = n_features;
        for j in 0..2 {
            let _name = format!("fc.{}", j);
            fc.push_with_act(
                candle_nn::linear(prev_dim, n_hidden, vs.pp(_name))?,
                Act::Softplus,
            );
            prev_dim = n_hidden;
        }

        // (2) fc -> K, normalized without scaling
        let z_mean = candle_nn::linear(prev_dim, n_topics, vs.pp("z.mean"))?;
        let z_lnvar = candle_nn::linear(prev_dim, n_topics, vs.pp("z.lnvar"))?;

        let bn_config = ShiftBatchNormConfig::default();
        let bn_mean = shift_batch_norm(n_topics, bn_config, vs.pp("bn.mean"), varmap)?;
        let bn_lnvar = shift_batch_norm(n_topics, bn_config, vs.pp("bn.lnvar"), varmap)?;

        let prior = DirichletLogisticNormalPrior::new(n_topics, prior_concentration, vs.device())?;

        Ok(Self {
            n_features,
            n_topics,
            fc,
            dropout: Dropout::new(dropout),
            z_mean,
            z_lnvar,
            bn_mean,
            bn_lnvar,
            prior,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn build(varmap: &VarMap) -> Result<LogisticNormalEncoder> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        LogisticNormalEncoder::new(
            LogisticNormalEncoderArgs {
                n_features: 30,
                n_topics: 6,
                n_hidden: 16,
                dropout: 0.2,
                prior_concentration: 1.0,
            },
            vb.pp("enc"),
            varmap,
        )
    }

    #[test]
    fn theta_rows_on_simplex() -> Result<()> {
        let varmap = VarMap::new();
        let enc = build(&varmap)?;
        let x = Tensor::rand(0f32, 5., (10, 30), &Device::Cpu)?.floor()?;

        for train in [true, false] {
            let latent = enc.forward_t(&x, train)?;
            assert_eq!(latent.theta_nk.dims(), &[10, 6]);
            assert_eq!(latent.kl_n.dims(), &[10]);
            for row in latent.theta_nk.to_vec2::<f32>()? {
                assert!(row.iter().all(|&t| t >= 0.));
                approx::assert_abs_diff_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
            }
        }
        Ok(())
    }

    #[test]
    fn inference_mode_is_deterministic() -> Result<()> {
        let varmap = VarMap::new();
        let enc = build(&varmap)?;
        let x = Tensor::rand(0f32, 3., (4, 30), &Device::Cpu)?;

        let a = enc.forward_t(&x, false)?.theta_nk.to_vec2::<f32>()?;
        let b = enc.forward_t(&x, false)?.theta_nk.to_vec2::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }
}
