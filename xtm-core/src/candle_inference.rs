use serde::{Deserialize, Serialize};

/// Step-wise learning rate decay: multiply by `gamma` every
/// `step_size` epochs
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepLrSchedule {
    pub step_size: usize,
    pub gamma: f64,
}

impl Default for StepLrSchedule {
    fn default() -> Self {
        Self {
            step_size: 125,
            gamma: 0.5,
        }
    }
}

impl StepLrSchedule {
    /// learning rate after `epochs_done` completed epochs
    pub fn learning_rate(&self, base_lr: f64, epochs_done: usize) -> f64 {
        if self.step_size == 0 {
            return base_lr;
        }
        base_lr * self.gamma.powi((epochs_done / self.step_size) as i32)
    }
}

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub lr_schedule: Option<StepLrSchedule>,
    /// seed for minibatch shuffling
    pub seed: u64,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
    /// log the group transport plan every this many group-loss
    /// computations
    pub diagnostic_interval: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 200,
            num_epochs: 200,
            lr_schedule: None,
            seed: 0,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: true,
            diagnostic_interval: 100,
        }
    }
}
