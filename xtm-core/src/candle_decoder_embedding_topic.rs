use crate::candle_aux_layers::*;
use crate::candle_loss_functions::{pairwise_squared_euclidean, topic_log_likelihood};
use crate::candle_model_traits::*;
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::{ops, ModuleT, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

///////////////////////////////////////
// Embedding-based Topic Model Decoder //
///////////////////////////////////////

/// The dictionary is not a free parameter. It is induced by the
/// squared distances between topic and word embeddings:
///
/// beta(k,w) = softmax_k( -||t(k) - e(w)||^2 / temperature )
///
/// Each word's mass is normalized across topics.
pub struct EmbeddingTopicDecoder {
    n_features: usize,
    n_topics: usize,
    beta_temp: f64,
    word_emb_vd: Var,
    topic_emb_kd: Var,
    bn_recon: ShiftBatchNorm,
}

pub struct EmbeddingTopicDecoderArgs<'a> {
    pub n_features: usize,
    pub n_topics: usize,
    pub embed_size: usize,
    pub beta_temp: f64,
    pub pretrained_word_emb: Option<&'a Tensor>,
    pub seed: u64,
}

impl EmbeddingTopicDecoder {
    /// Will create a new topic model decoder with the following parameters:
    /// * `word_embeddings` (V x D), L2-normalized rows, trainable
    /// * `topic_embeddings` (K x D), L2-normalized rows, trainable
    /// * `bn.recon.{shift,running_mean,running_var}`
    ///
    /// Pretrained word embeddings must have exactly `n_features` rows;
    /// their column count overrides `embed_size`.
    pub fn new(args: EmbeddingTopicDecoderArgs, vs: VarBuilder, varmap: &VarMap) -> Result<Self> {
        let EmbeddingTopicDecoderArgs {
            n_features,
            n_topics,
            embed_size,
            beta_temp,
            pretrained_word_emb,
            seed,
        } = args;

        let dev = vs.device().clone();
        let mut rng = StdRng::seed_from_u64(seed);

        let word_emb_vd = match pretrained_word_emb {
            Some(we) => {
                let (nrows, ncols) = we.dims2()?;
                if nrows != n_features {
                    return Err(candle_core::Error::UnexpectedShape {
                        msg: "pretrained word embeddings vs. vocabulary".to_string(),
                        expected: (n_features, ncols).into(),
                        got: we.shape().clone(),
                    });
                }
                we.to_dtype(DType::F32)?.to_device(&dev)?
            }
            None => truncated_normal(n_features, embed_size, 1.0, &mut rng, &dev)?,
        };
        let word_emb_vd = l2_normalize_rows(&word_emb_vd)?;
        let embed_size = word_emb_vd.dim(1)?;

        let topic_emb_kd = truncated_normal(n_topics, embed_size, 0.1, &mut rng, &dev)?;
        let topic_emb_kd = l2_normalize_rows(&topic_emb_kd)?;

        let word_emb_vd = register_var(varmap, &var_path(&vs, "word_embeddings"), &word_emb_vd)?;
        let topic_emb_kd =
            register_var(varmap, &var_path(&vs, "topic_embeddings"), &topic_emb_kd)?;

        let bn_recon = shift_batch_norm(
            n_features,
            ShiftBatchNormConfig::default(),
            vs.pp("bn.recon"),
            varmap,
        )?;

        Ok(Self {
            n_features,
            n_topics,
            beta_temp,
            word_emb_vd,
            topic_emb_kd,
            bn_recon,
        })
    }

    pub fn word_embeddings(&self) -> &Tensor {
        self.word_emb_vd.as_tensor()
    }

    pub fn topic_embeddings(&self) -> &Tensor {
        self.topic_emb_kd.as_tensor()
    }

    pub fn embed_size(&self) -> Result<usize> {
        self.word_emb_vd.dim(1)
    }

    /// Topic-word distribution (K x V), recomputed from the current
    /// embeddings on every call
    pub fn get_beta(&self) -> Result<Tensor> {
        let dist_kv = pairwise_squared_euclidean(self.topic_embeddings(), self.word_embeddings())?;
        ops::softmax(&(dist_kv / (-self.beta_temp))?, 0)
    }

    fn log_recon(&self, theta_nk: &Tensor, train: bool) -> Result<Tensor> {
        let beta_kd = self.get_beta()?;
        let logits_nd = self.bn_recon.forward_t(&theta_nk.matmul(&beta_kd)?, train)?;
        ops::log_softmax(&logits_nd, 1)
    }
}

impl DecoderModuleT for EmbeddingTopicDecoder {
    fn forward_t(&self, theta_nk: &Tensor, train: bool) -> Result<Tensor> {
        self.log_recon(theta_nk, train)?.exp()
    }

    fn get_dictionary(&self) -> Result<Tensor> {
        self.get_beta()
    }

    fn forward_with_llik(
        &self,
        theta_nk: &Tensor,
        x_nd: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let log_recon_nd = self.log_recon(theta_nk, train)?;
        let llik = topic_log_likelihood(x_nd, &log_recon_nd)?;
        Ok((log_recon_nd.exp()?, llik))
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn build<'a>(varmap: &VarMap, pretrained: Option<&'a Tensor>) -> Result<EmbeddingTopicDecoder> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        EmbeddingTopicDecoder::new(
            EmbeddingTopicDecoderArgs {
                n_features: 40,
                n_topics: 5,
                embed_size: 8,
                beta_temp: 0.2,
                pretrained_word_emb: pretrained,
                seed: 7,
            },
            vb.pp("dec"),
            varmap,
        )
    }

    #[test]
    fn beta_is_normalized_over_topics() -> Result<()> {
        let varmap = VarMap::new();
        let dec = build(&varmap, None)?;
        let beta = dec.get_beta()?;
        assert_eq!(beta.dims(), &[5, 40]);
        for s in beta.sum(0)?.to_vec1::<f32>()? {
            approx::assert_abs_diff_eq!(s, 1.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn beta_is_a_pure_function_of_embeddings() -> Result<()> {
        let varmap = VarMap::new();
        let dec = build(&varmap, None)?;
        let a = dec.get_beta()?.to_vec2::<f32>()?;
        let b = dec.get_beta()?.to_vec2::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn embeddings_start_on_unit_sphere() -> Result<()> {
        let varmap = VarMap::new();
        let dec = build(&varmap, None)?;
        for emb in [dec.word_embeddings(), dec.topic_embeddings()] {
            for n in emb.sqr()?.sum(1)?.to_vec1::<f32>()? {
                approx::assert_abs_diff_eq!(n, 1.0, epsilon = 1e-5);
            }
        }
        Ok(())
    }

    #[test]
    fn pretrained_rows_must_match_vocabulary() -> Result<()> {
        let varmap = VarMap::new();
        let we = Tensor::rand(0f32, 1., (39, 8), &Device::Cpu)?;
        match build(&varmap, Some(&we)) {
            Err(candle_core::Error::UnexpectedShape { .. }) => Ok(()),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("should fail with a shape mismatch"),
        }
    }

    #[test]
    fn pretrained_columns_set_embedding_size() -> Result<()> {
        let varmap = VarMap::new();
        let we = Tensor::rand(0f32, 1., (40, 12), &Device::Cpu)?;
        let dec = build(&varmap, Some(&we))?;
        assert_eq!(dec.embed_size()?, 12);
        assert_eq!(dec.topic_embeddings().dims(), &[5, 12]);
        Ok(())
    }

    #[test]
    fn reconstruction_is_a_distribution_over_words() -> Result<()> {
        let varmap = VarMap::new();
        let dec = build(&varmap, None)?;
        let theta = ops::softmax(&Tensor::randn(0f32, 1., (3, 5), &Device::Cpu)?, 1)?;
        let x = Tensor::ones((3, 40), DType::F32, &Device::Cpu)?;
        let (recon, llik) = dec.forward_with_llik(&theta, &x, true)?;
        for s in recon.sum(1)?.to_vec1::<f32>()? {
            approx::assert_abs_diff_eq!(s, 1.0, epsilon = 1e-4);
        }
        assert!(llik.to_vec1::<f32>()?.iter().all(|&l| l <= 0.));
        Ok(())
    }
}
