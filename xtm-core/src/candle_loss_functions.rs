#![allow(dead_code)]

use core::f64;

use candle_core::{DType, Device, Result, Tensor};

/// Squared Euclidean distances between the rows of `x_nd` and `y_md`
///
/// dist(i,j) = ||x(i)||^2 + ||y(j)||^2 - 2 x(i)·y(j)
///
/// No square root is taken.
///
/// * `x_nd` - n x d
/// * `y_md` - m x d
///
/// Returns n x m
pub fn pairwise_squared_euclidean(x_nd: &Tensor, y_md: &Tensor) -> Result<Tensor> {
    let xx_n1 = x_nd.sqr()?.sum_keepdim(1)?;
    let yy_1m = y_md.sqr()?.sum(1)?.unsqueeze(0)?;
    let xy_nm = x_nd.matmul(&y_md.t()?)?;
    xx_n1.broadcast_add(&yy_1m)? - (xy_nm * 2.)?
}

/// Logistic-normal (Laplace) approximation of a symmetric Dirichlet
/// prior over `n_topics` topics
///
/// mu(k) = log a(k) - mean_j log a(j)
/// var(k) = (1/a(k)) (1 - 2/K) + (1/K^2) sum_j 1/a(j)
///
pub struct DirichletLogisticNormalPrior {
    pub mu_1k: Tensor,
    pub var_1k: Tensor,
    pub ln_var_1k: Tensor,
}

impl DirichletLogisticNormalPrior {
    /// * `n_topics` - number of topics (K)
    /// * `concentration` - symmetric Dirichlet concentration
    pub fn new(n_topics: usize, concentration: f64, dev: &Device) -> Result<Self> {
        let kk = n_topics as f64;
        let a = vec![concentration; n_topics];

        let mean_ln_a = a.iter().map(|x| x.ln()).sum::<f64>() / kk;
        let sum_inv_a = a.iter().map(|x| 1. / x).sum::<f64>();

        let mu: Vec<f32> = a.iter().map(|x| (x.ln() - mean_ln_a) as f32).collect();
        let var: Vec<f32> = a
            .iter()
            .map(|x| ((1. / x) * (1. - 2. / kk) + sum_inv_a / (kk * kk)) as f32)
            .collect();

        let mu_1k = Tensor::from_vec(mu, (1, n_topics), dev)?;
        let var_1k = Tensor::from_vec(var, (1, n_topics), dev)?;
        let ln_var_1k = var_1k.log()?;

        Ok(Self {
            mu_1k,
            var_1k,
            ln_var_1k,
        })
    }

    pub fn n_topics(&self) -> Result<usize> {
        self.mu_1k.dim(1)
    }

    /// KL divergence of N(mu, exp(lnvar)) from the prior
    ///
    /// 0.5 * ( sum_k [ var/var0 + (mu - mu0)^2/var0 + log var0 - log var ] - K )
    ///
    /// * `z_mean_nk` - mean of Gaussian distribution
    /// * `z_lnvar_nk` - log variance of Gaussian distribution
    ///
    /// Returns `kl_n` (n)
    pub fn kl_loss(&self, z_mean_nk: &Tensor, z_lnvar_nk: &Tensor) -> Result<Tensor> {
        let kk = z_mean_nk.dim(z_mean_nk.rank() - 1)? as f64;

        let var_ratio = z_lnvar_nk.exp()?.broadcast_div(&self.var_1k)?;
        let diff_term = z_mean_nk
            .broadcast_sub(&self.mu_1k)?
            .sqr()?
            .broadcast_div(&self.var_1k)?;
        let lnvar_ratio = self.ln_var_1k.broadcast_sub(z_lnvar_nk)?;

        ((var_ratio + diff_term)? + lnvar_ratio)?
            .sum(z_mean_nk.rank() - 1)?
            .affine(0.5, -0.5 * kk)
    }
}

/// Topic model log-likelihood of multinomial data
///
/// llik(i) = sum_w x(i,w) * log pr(i,w)
///
/// * `x_nd` - data tensor (observed word counts)
/// * `log_recon_nd` - log-probability tensor (reconstruction)
///
pub fn topic_log_likelihood(x_nd: &Tensor, log_recon_nd: &Tensor) -> Result<Tensor> {
    x_nd.clamp(0.0, f64::INFINITY)?
        .mul(log_recon_nd)?
        .sum(x_nd.rank() - 1)
}

/// Frobenius inner product <a, b> = sum_ij a(i,j) b(i,j)
pub fn frobenius_inner(a_nm: &Tensor, b_nm: &Tensor) -> Result<Tensor> {
    a_nm.mul(b_nm)?.sum_all()
}

/// A scalar zero on the same device, handy for loss terms that are
/// switched off
pub fn zero_loss(dev: &Device) -> Result<Tensor> {
    Tensor::zeros((), DType::F32, dev)
}
