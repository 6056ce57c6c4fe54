//! XTM: an embedding-based neural topic model regularized by two
//! entropic transport costs
//!
//! * word transport (ECR): topic embeddings vs. word embeddings
//! * group transport (XGR): topic embeddings vs. themselves, weighted
//!   by a group-connection prior that is fixed once topics are grouped

use crate::candle_decoder_embedding_topic::*;
use crate::candle_encoder_logistic_normal::*;
use crate::candle_loss_functions::{pairwise_squared_euclidean, zero_loss};
use crate::candle_model_traits::*;
use crate::candle_optimal_transport::*;
use crate::candle_topic_grouping::*;

use candle_core::{DType, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

/// All parameters needed to construct an [`XtmModel`]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct XtmConfig {
    pub vocab_size: usize,
    pub num_topics: usize,
    pub num_groups: usize,
    /// hidden units of the encoder
    pub en_units: usize,
    pub dropout: f32,
    pub embed_size: usize,
    pub beta_temp: f64,
    pub prior_concentration: f64,

    pub weight_loss_ecr: f64,
    pub weight_loss_xgr: f64,
    pub alpha_ecr: f64,
    pub alpha_xgr: f64,
    pub sinkhorn_max_iter: usize,
    pub sinkhorn_stop_threshold: f64,
    pub sinkhorn_check_every: usize,
    pub sinkhorn_epsilon: f64,

    /// epoch at which topics are grouped
    pub group_epoch: usize,
    pub group_weights: GroupConnectionWeights,
    /// added to the self-pair cost of the group transport
    pub self_cost_inflation: f64,
    pub kmeans_max_iter: usize,
    pub seed: u64,
}

impl Default for XtmConfig {
    fn default() -> Self {
        Self {
            vocab_size: 0,
            num_topics: 50,
            num_groups: 10,
            en_units: 200,
            dropout: 0.0,
            embed_size: 200,
            beta_temp: 0.2,
            prior_concentration: 1.0,
            weight_loss_ecr: 250.0,
            weight_loss_xgr: 250.0,
            alpha_ecr: 20.0,
            alpha_xgr: 4.0,
            sinkhorn_max_iter: 1000,
            sinkhorn_stop_threshold: 5e-3,
            sinkhorn_check_every: 50,
            sinkhorn_epsilon: 1e-16,
            group_epoch: 10,
            group_weights: GroupConnectionWeights::default(),
            self_cost_inflation: 100.0,
            kmeans_max_iter: 1000,
            seed: 0,
        }
    }
}

impl XtmConfig {
    pub fn with_vocab_size(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(candle_core::Error::Msg(msg));

        if self.vocab_size == 0 {
            return invalid("empty vocabulary".into());
        }
        if self.num_topics == 0 {
            return invalid("need at least one topic".into());
        }
        if self.num_groups == 0 || self.num_groups > self.num_topics {
            return invalid(format!(
                "number of groups {} should be in [1, {}]",
                self.num_groups, self.num_topics
            ));
        }
        if self.beta_temp <= 0.0 || !self.beta_temp.is_finite() {
            return invalid(format!("invalid beta temperature {}", self.beta_temp));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("invalid dropout rate {}", self.dropout));
        }
        if self.alpha_ecr <= 0.0 || self.alpha_xgr <= 0.0 {
            return invalid("transport alpha should be positive".into());
        }
        Ok(())
    }

    fn sinkhorn(&self, alpha: f64) -> SinkhornConfig {
        SinkhornConfig {
            alpha,
            max_iter: self.sinkhorn_max_iter,
            stop_threshold: self.sinkhorn_stop_threshold,
            check_every: self.sinkhorn_check_every,
            epsilon: self.sinkhorn_epsilon,
        }
    }

    fn grouping_args(&self) -> GroupingArgs {
        GroupingArgs {
            num_groups: self.num_groups,
            kmeans_max_iter: self.kmeans_max_iter,
            weights: self.group_weights,
        }
    }
}

/// A minibatch of documents and, during training, the current epoch
pub struct XtmInput<'a> {
    /// bag of words (n x V), non-negative counts
    pub data: &'a Tensor,
    pub epoch: Option<usize>,
}

/// Scalar loss tensors of one forward pass
pub struct LossBreakdown {
    /// `loss_tm + loss_ecr + loss_xgr`
    pub loss: Tensor,
    /// reconstruction + KL
    pub loss_tm: Tensor,
    pub loss_ecr: Tensor,
    /// zero until topics are grouped
    pub loss_xgr: Tensor,
}

impl LossBreakdown {
    pub const NAMES: [&'static str; 4] = ["loss", "loss_TM", "loss_ECR", "loss_XGR"];

    pub fn named(&self) -> [(&'static str, &Tensor); 4] {
        [
            (Self::NAMES[0], &self.loss),
            (Self::NAMES[1], &self.loss_tm),
            (Self::NAMES[2], &self.loss_ecr),
            (Self::NAMES[3], &self.loss_xgr),
        ]
    }

    pub fn to_scalars(&self) -> Result<[f32; 4]> {
        let mut ret = [0_f32; 4];
        for (r, (_, t)) in ret.iter_mut().zip(self.named()) {
            *r = t.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        }
        Ok(ret)
    }
}

pub struct XtmOutput {
    pub losses: LossBreakdown,
    /// group transport plan, present when the group loss was computed
    pub group_plan: Option<TransportPlan>,
}

pub struct XtmModel {
    config: XtmConfig,
    encoder: LogisticNormalEncoder,
    decoder: EmbeddingTopicDecoder,
    word_transport: TransportRegularizer,
    group_transport: TransportRegularizer,
    grouping: TopicGrouping,
}

impl XtmModel {
    /// Build the model under `vs` with these variables:
    /// * `enc.*` - see [`LogisticNormalEncoder::new`]
    /// * `dec.*` - see [`EmbeddingTopicDecoder::new`]
    ///
    /// With pretrained word embeddings (V x D) the embedding size
    /// recorded in the config is taken from them.
    pub fn new(
        config: XtmConfig,
        pretrained_word_emb: Option<&Tensor>,
        vs: VarBuilder,
        varmap: &VarMap,
    ) -> Result<Self> {
        config.validate()?;

        let encoder = LogisticNormalEncoder::new(
            LogisticNormalEncoderArgs {
                n_features: config.vocab_size,
                n_topics: config.num_topics,
                n_hidden: config.en_units,
                dropout: config.dropout,
                prior_concentration: config.prior_concentration,
            },
            vs.pp("enc"),
            varmap,
        )?;

        let decoder = EmbeddingTopicDecoder::new(
            EmbeddingTopicDecoderArgs {
                n_features: config.vocab_size,
                n_topics: config.num_topics,
                embed_size: config.embed_size,
                beta_temp: config.beta_temp,
                pretrained_word_emb,
                seed: config.seed,
            },
            vs.pp("dec"),
            varmap,
        )?;

        let mut config = config;
        config.embed_size = decoder.embed_size()?;

        let word_transport =
            TransportRegularizer::new(config.weight_loss_ecr, config.sinkhorn(config.alpha_ecr));
        let group_transport =
            TransportRegularizer::new(config.weight_loss_xgr, config.sinkhorn(config.alpha_xgr));

        Ok(Self {
            config,
            encoder,
            decoder,
            word_transport,
            group_transport,
            grouping: TopicGrouping::Ungrouped,
        })
    }

    pub fn config(&self) -> &XtmConfig {
        &self.config
    }

    pub fn grouping(&self) -> &TopicGrouping {
        &self.grouping
    }

    pub fn topic_embeddings(&self) -> &Tensor {
        self.decoder.topic_embeddings()
    }

    pub fn word_embeddings(&self) -> &Tensor {
        self.decoder.word_embeddings()
    }

    /// Topic-word distribution (K x V)
    pub fn get_beta(&self) -> Result<Tensor> {
        self.decoder.get_dictionary()
    }

    /// Posterior mean topic proportions (n x K) for a corpus, evaluated
    /// `batch_size` rows at a time without sampling
    pub fn get_theta(&self, x_nd: &Tensor, batch_size: usize) -> Result<Tensor> {
        let nn = x_nd.dim(0)?;
        let batch_size = batch_size.max(1);
        let dev = self.topic_embeddings().device();

        let mut chunks = vec![];
        for lb in (0..nn).step_by(batch_size) {
            let len = batch_size.min(nn - lb);
            let x = x_nd.narrow(0, lb, len)?.to_device(dev)?;
            chunks.push(self.encoder.forward_t(&x, false)?.theta_nk.detach());
        }

        if chunks.is_empty() {
            return Tensor::zeros((0, self.config.num_topics), DType::F32, dev);
        }
        Tensor::cat(&chunks, 0)
    }

    /// Group the topics now if `epoch` is the grouping epoch and this
    /// has not happened yet. Returns whether grouping took place.
    pub fn update_grouping(&mut self, epoch: Option<usize>) -> Result<bool> {
        match epoch {
            Some(e) if e == self.config.group_epoch && !self.grouping.is_grouped() => {
                let args = self.config.grouping_args();
                let topic_emb_kd = self.decoder.topic_embeddings().detach();
                self.grouping.group_once(&topic_emb_kd, &args)
            }
            _ => Ok(false),
        }
    }

    /// Word transport: move word mass (V) onto topics (K)
    fn loss_ecr(&self) -> Result<(Tensor, TransportPlan)> {
        let cost_kv =
            pairwise_squared_euclidean(self.topic_embeddings(), self.decoder.word_embeddings())?;
        self.word_transport.forward(&cost_kv, None)
    }

    /// Group transport between topics, with inflated self-pair costs
    fn loss_xgr(&self, groups: &TopicGroups) -> Result<(Tensor, TransportPlan)> {
        let topic_kd = self.topic_embeddings();
        let kk = self.config.num_topics;
        let self_cost = (Tensor::eye(kk, topic_kd.dtype(), topic_kd.device())?
            * self.config.self_cost_inflation)?;
        let cost_kk = (pairwise_squared_euclidean(topic_kd, topic_kd)? + self_cost)?;
        self.group_transport
            .forward(&cost_kk, Some(&groups.connection_kk))
    }

    /// One pass over a minibatch:
    /// encode -> KL -> beta -> reconstruct -> word transport
    /// -> (grouping at the grouping epoch) -> group transport
    /// (after the grouping epoch) -> sum
    pub fn forward_t(&mut self, input: &XtmInput, train: bool) -> Result<XtmOutput> {
        let x_nd = input.data;

        let latent = self.encoder.forward_t(x_nd, train)?;
        let (_, llik_n) = self
            .decoder
            .forward_with_llik(&latent.theta_nk, x_nd, train)?;
        let loss_tm = (&latent.kl_n - &llik_n)?.mean_all()?;

        let (loss_ecr, _) = self.loss_ecr()?;

        self.update_grouping(input.epoch)?;

        let group_epoch = self.config.group_epoch;
        let (loss_xgr, group_plan) = match (&self.grouping, input.epoch) {
            (TopicGrouping::Grouped(groups), Some(e)) if e > group_epoch && groups.num_topics() > 1 => {
                let (loss, plan) = self.loss_xgr(groups)?;
                (loss, Some(plan))
            }
            _ => (zero_loss(x_nd.device())?, None),
        };

        let loss = ((&loss_tm + &loss_ecr)? + &loss_xgr)?;

        Ok(XtmOutput {
            losses: LossBreakdown {
                loss,
                loss_tm,
                loss_ecr,
                loss_xgr,
            },
            group_plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn small_config() -> XtmConfig {
        XtmConfig {
            vocab_size: 30,
            num_topics: 4,
            num_groups: 2,
            en_units: 16,
            embed_size: 8,
            group_epoch: 2,
            ..Default::default()
        }
    }

    fn build(config: XtmConfig, varmap: &VarMap) -> Result<XtmModel> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        XtmModel::new(config, None, vb, varmap)
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let bad = [
            XtmConfig {
                num_topics: 0,
                ..small_config()
            },
            XtmConfig {
                num_groups: 0,
                ..small_config()
            },
            XtmConfig {
                num_groups: 5,
                ..small_config()
            },
            XtmConfig {
                beta_temp: 0.0,
                ..small_config()
            },
            XtmConfig {
                vocab_size: 0,
                ..small_config()
            },
        ];
        for config in bad {
            let varmap = VarMap::new();
            assert!(build(config, &varmap).is_err());
        }
    }

    #[test]
    fn loss_is_sum_of_terms() -> Result<()> {
        let varmap = VarMap::new();
        let mut model = build(small_config(), &varmap)?;
        let x = Tensor::rand(0f32, 3., (6, 30), &Device::Cpu)?.floor()?;

        let out = model.forward_t(
            &XtmInput {
                data: &x,
                epoch: Some(0),
            },
            true,
        )?;
        let [loss, tm, ecr, xgr] = out.losses.to_scalars()?;
        approx::assert_abs_diff_eq!(loss, tm + ecr + xgr, epsilon = 1e-3);
        assert_eq!(xgr, 0.0);
        assert!(ecr >= 0.0);
        assert!(out.group_plan.is_none());
        Ok(())
    }

    #[test]
    fn word_transport_moves_topics_onto_words() -> Result<()> {
        let varmap = VarMap::new();
        let config = small_config();
        let (kk, vv) = (config.num_topics, config.vocab_size);
        let model = build(config, &varmap)?;

        let (_, plan) = model.loss_ecr()?;
        assert_eq!(plan.plan_nm.dims(), &[kk, vv]);

        // uniform marginals: each topic row carries 1/K
        for r in plan.plan_nm.sum(1)?.to_vec1::<f32>()? {
            approx::assert_abs_diff_eq!(r, 1. / kk as f32, epsilon = 1e-2);
        }
        Ok(())
    }

    #[test]
    fn no_epoch_means_no_grouping() -> Result<()> {
        let varmap = VarMap::new();
        let mut model = build(small_config(), &varmap)?;
        let x = Tensor::rand(0f32, 3., (3, 30), &Device::Cpu)?.floor()?;
        model.forward_t(
            &XtmInput {
                data: &x,
                epoch: None,
            },
            true,
        )?;
        assert!(!model.grouping().is_grouped());
        Ok(())
    }

    #[test]
    fn theta_in_inference_mode_is_stable() -> Result<()> {
        let varmap = VarMap::new();
        let model = build(small_config(), &varmap)?;
        let x = Tensor::rand(0f32, 3., (7, 30), &Device::Cpu)?.floor()?;

        let a = model.get_theta(&x, 3)?;
        let b = model.get_theta(&x, 100)?;
        assert_eq!(a.dims(), &[7, 4]);
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn pretrained_embeddings_set_embedding_size() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let we = Tensor::rand(0f32, 1., (30, 5), &Device::Cpu)?;
        let model = XtmModel::new(small_config(), Some(&we), vb, &varmap)?;
        assert_eq!(model.config().embed_size, 5);
        Ok(())
    }
}
