pub use log::info;
pub use xtm_core::corpus_io::*;
pub use xtm_core::{candle_core, candle_nn};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use xtm_core::candle_model_xtm::XtmConfig;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

pub fn make_device(device: &ComputeDevice, device_no: usize) -> anyhow::Result<candle_core::Device> {
    Ok(match device {
        ComputeDevice::Metal => candle_core::Device::new_metal(device_no)?,
        ComputeDevice::Cuda => candle_core::Device::new_cuda(device_no)?,
        ComputeDevice::Cpu => candle_core::Device::Cpu,
    })
}

/// What `{out}.config.json` holds: enough to rebuild the model for
/// inference, plus a record of how it was trained
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelManifest {
    pub model: XtmConfig,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub epochs: usize,
    pub lr_step: Option<(usize, f64)>,
    pub num_top_words: usize,
}

impl ModelManifest {
    pub fn write(&self, file: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_lines(&[json], file)
    }

    pub fn read(file: &str) -> anyhow::Result<Self> {
        let reader = open_buf_reader(file)?;
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Output file names sharing the prefix `out`
pub struct OutputFiles {
    pub config: String,
    pub parameters: String,
    pub beta: String,
    pub top_words: String,
    pub theta: String,
    pub test_theta: String,
    pub groups: String,
    pub topic_embeddings: String,
    pub loss_trace: String,
}

impl OutputFiles {
    pub fn new(out: &str) -> Self {
        Self {
            config: format!("{}.config.json", out),
            parameters: format!("{}.safetensors", out),
            beta: format!("{}.beta.tsv", out),
            top_words: format!("{}.top_words.txt", out),
            theta: format!("{}.theta.tsv", out),
            test_theta: format!("{}.test_theta.tsv", out),
            groups: format!("{}.groups.txt", out),
            topic_embeddings: format!("{}.topic_embeddings.tsv", out),
            loss_trace: format!("{}.loss_trace.tsv", out),
        }
    }
}

/// Read a corpus and make sure it has `vocab_size` columns
pub fn read_corpus_checked(file: &str, vocab_size: usize) -> anyhow::Result<candle_core::Tensor> {
    let x_nd = read_corpus(file)?;
    let (nn, vv) = x_nd.dims2()?;
    if vv != vocab_size {
        anyhow::bail!("{}: {} columns, but the vocabulary has {} words", file, vv, vocab_size);
    }
    info!("read {} documents x {} words from {}", nn, vv, file);
    Ok(x_nd)
}
