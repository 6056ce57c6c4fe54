use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;
use crate::candle_model_xtm::*;
use crate::candle_optimal_transport::TransportPlan;

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

/// Loss terms averaged over the documents of an epoch
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LossScores {
    pub loss: f32,
    pub loss_tm: f32,
    pub loss_ecr: f32,
    pub loss_xgr: f32,
}

impl LossScores {
    pub fn from_array([loss, loss_tm, loss_ecr, loss_xgr]: [f32; 4]) -> Self {
        Self {
            loss,
            loss_tm,
            loss_ecr,
            loss_xgr,
        }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.loss, self.loss_tm, self.loss_ecr, self.loss_xgr]
    }

    fn add_weighted(&mut self, other: &Self, weight: f32) {
        self.loss += other.loss * weight;
        self.loss_tm += other.loss_tm * weight;
        self.loss_ecr += other.loss_ecr * weight;
        self.loss_xgr += other.loss_xgr * weight;
    }

    fn scale(&mut self, factor: f32) {
        self.loss *= factor;
        self.loss_tm *= factor;
        self.loss_ecr *= factor;
        self.loss_xgr *= factor;
    }
}

impl std::fmt::Display for LossScores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = LossBreakdown::NAMES;
        write!(
            f,
            "{}: {:.3}, {}: {:.3}, {}: {:.3}, {}: {:.3}",
            names[0], self.loss, names[1], self.loss_tm, names[2], self.loss_ecr, names[3], self.loss_xgr
        )
    }
}

/// Per-run bookkeeping, created fresh by every call to
/// [`XtmTrainer::train`]
#[derive(Debug)]
pub struct RunState {
    diagnostic_interval: usize,
    group_loss_count: usize,
    num_snapshots: usize,
}

impl RunState {
    pub fn new(diagnostic_interval: usize) -> Self {
        Self {
            diagnostic_interval: diagnostic_interval.max(1),
            group_loss_count: 0,
            num_snapshots: 0,
        }
    }

    /// Count one group-loss computation; every `diagnostic_interval`
    /// of them, log the plan. Returns whether a snapshot was logged.
    pub fn record_group_plan(&mut self, plan: &TransportPlan) -> candle_core::Result<bool> {
        self.group_loss_count += 1;
        if self.group_loss_count < self.diagnostic_interval {
            return Ok(false);
        }
        self.group_loss_count = 0;
        self.num_snapshots += 1;

        info!(
            "group transport plan ({} iterations, marginal error {:.2e}, converged: {}):",
            plan.iterations, plan.marginal_error, plan.converged
        );
        for line in plan.to_lines(4)? {
            info!("{}", line);
        }
        Ok(true)
    }

    pub fn num_snapshots(&self) -> usize {
        self.num_snapshots
    }
}

pub struct XtmTrainer<'a> {
    pub model: &'a mut XtmModel,
    pub variable_map: &'a candle_nn::VarMap,
}

impl<'a> XtmTrainer<'a> {
    pub fn new(model: &'a mut XtmModel, variable_map: &'a candle_nn::VarMap) -> Self {
        Self {
            model,
            variable_map,
        }
    }

    /// Train the model for `num_epochs` epochs, numbered from 1, and
    /// return the averaged losses of every epoch
    ///
    /// * `data` - data loader, reshuffled every epoch
    /// * `train_config` - training configuration
    pub fn train<DataL>(
        &mut self,
        data: &mut DataL,
        train_config: &TrainConfig,
    ) -> anyhow::Result<Vec<LossScores>>
    where
        DataL: DataLoader,
    {
        let device = &train_config.device;
        let base_lr = train_config.learning_rate as f64;

        let mut adam = AdamW::new(
            self.variable_map.all_vars(),
            ParamsAdamW {
                lr: base_lr,
                weight_decay: 0.,
                ..Default::default()
            },
        )?;

        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut state = RunState::new(train_config.diagnostic_interval);
        let mut trace = Vec::with_capacity(train_config.num_epochs);
        let ntot = data.num_data().max(1) as f32;

        for epoch in 1..=train_config.num_epochs {
            if let Some(sched) = train_config.lr_schedule.as_ref() {
                adam.set_learning_rate(sched.learning_rate(base_lr, epoch - 1));
            }

            data.shuffle_minibatch(train_config.batch_size)?;

            let mut scores = LossScores::default();

            for b in 0..data.num_minibatch() {
                let mb = data.minibatch_shuffled(b, device)?;
                let nb = mb.input.dim(0)? as f32;

                let output = self.model.forward_t(
                    &XtmInput {
                        data: &mb.input,
                        epoch: Some(epoch),
                    },
                    true,
                )?;

                let batch_scores = LossScores::from_array(output.losses.to_scalars()?);
                if !batch_scores.loss.is_finite() {
                    anyhow::bail!(
                        "non-finite loss at epoch {}, minibatch {} ({})",
                        epoch,
                        b,
                        batch_scores
                    );
                }

                adam.backward_step(&output.losses.loss)?;

                if let Some(plan) = output.group_plan.as_ref() {
                    state.record_group_plan(plan)?;
                }

                scores.add_weighted(&batch_scores, nb);
            }

            scores.scale(1. / ntot);
            trace.push(scores);
            pb.inc(1);

            if train_config.verbose {
                info!("[{}] {}", epoch, scores);
            }
        }

        pb.finish_and_clear();
        Ok(trace)
    }
}
