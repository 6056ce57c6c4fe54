#![allow(dead_code)]

use candle_core::{Result, Tensor};

/// Latent inference from an encoder
/// * `theta_nk` - topic proportions (n x k), rows on the simplex
/// * `kl_n` - KL divergence from the prior per sample (n)
pub struct EncoderLatent {
    pub theta_nk: Tensor,
    pub kl_n: Tensor,
}

pub trait EncoderModuleT {
    /// An encoder that spits out topic proportions and KL loss
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `train` - sample from the posterior and use dropout/batch
    ///   statistics, or take the posterior mean
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<EncoderLatent>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait DecoderModuleT {
    /// Reconstruction probabilities (n x d) given topic proportions
    fn forward_t(&self, theta_nk: &Tensor, train: bool) -> Result<Tensor>;

    /// Get a representative dictionary matrix (k x d)
    fn get_dictionary(&self) -> Result<Tensor>;

    /// A decoder that spits out reconstruction and log-likelihood
    /// * `theta_nk` - latent states
    /// * `x_nd` - observed data to validate with
    ///
    /// Returns `(recon_nd, llik_n)`
    fn forward_with_llik(
        &self,
        theta_nk: &Tensor,
        x_nd: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}
