use candle_core::{Device, Tensor};
use nalgebra::DMatrix;
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

pub struct MinibatchData {
    /// bag of words (n x V)
    pub input: Tensor,
    /// contextual document embeddings aligned with `input` rows
    pub contextual: Option<Tensor>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_shuffled(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn num_data(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for an in-memory document-term matrix. Each
/// row is a document; contextual embeddings, if any, must have one
/// row per document.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    contextual_data: Option<Vec<Tensor>>,

    shuffled_input_data: Option<Vec<Tensor>>,
    shuffled_contextual_data: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with the main data tensor `data`
    ///
    pub fn new<D>(data: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        Self::build(data.rows_to_tensor_vec()?, None)
    }

    ///
    /// Create a data loader with documents `data` and contextual
    /// embeddings `contextual`, aligned by row
    ///
    pub fn new_with_contextual<D>(data: &D, contextual: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let data = data.rows_to_tensor_vec()?;
        let contextual = contextual.rows_to_tensor_vec()?;

        if data.len() != contextual.len() {
            return Err(anyhow::anyhow!(
                "{} contextual embeddings for {} documents",
                contextual.len(),
                data.len()
            ));
        }

        Self::build(data, Some(contextual))
    }

    fn build(input_data: Vec<Tensor>, contextual_data: Option<Vec<Tensor>>) -> anyhow::Result<Self> {
        let rows = (0..input_data.len()).collect();
        Ok(InMemoryData {
            input_data,
            contextual_data,
            shuffled_input_data: None,
            shuffled_contextual_data: None,
            minibatches: Minibatches::new(rows, 0),
        })
    }

    /// Seed the shuffling of minibatches
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.minibatches.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Sample indexes of each minibatch after the last shuffle
    pub fn minibatch_samples(&self) -> &[Vec<usize>] {
        &self.minibatches.chunks
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_shuffled(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let input = take_shuffled(batch_idx, target_device, self.shuffled_input_data.as_ref())?
            .ok_or(anyhow::anyhow!("need to shuffle data first"))?;

        let contextual = take_shuffled(
            batch_idx,
            target_device,
            self.shuffled_contextual_data.as_ref(),
        )?;

        Ok(MinibatchData { input, contextual })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_data(&self) -> usize {
        self.input_data.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        /////////////////////
        // shuffle indexes //
        /////////////////////

        self.minibatches.shuffle_minibatch(batch_size);

        ///////////////////////////////////
        // preload all the shuffled data //
        ///////////////////////////////////

        let gather = |rows: &[Tensor], samples: &[usize]| -> anyhow::Result<Tensor> {
            let chunk: Vec<Tensor> = samples.iter().map(|&i| rows[i].clone()).collect();
            Ok(Tensor::cat(&chunk, 0)?)
        };

        let mut shuffled_input = vec![];
        let mut shuffled_contextual = vec![];

        for samples in self.minibatches.chunks.iter() {
            shuffled_input.push(gather(&self.input_data, samples)?);
            if let Some(contextual) = self.contextual_data.as_ref() {
                shuffled_contextual.push(gather(contextual, samples)?);
            }
        }

        self.shuffled_input_data = Some(shuffled_input);
        self.shuffled_contextual_data = self.contextual_data.as_ref().map(|_| shuffled_contextual);
        Ok(())
    }
}

fn take_shuffled(
    batch_idx: usize,
    target_device: &Device,
    data_vec: Option<&Vec<Tensor>>,
) -> anyhow::Result<Option<Tensor>> {
    if let Some(data_vec) = data_vec {
        if data_vec.len() <= batch_idx {
            Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                data_vec.len()
            ))
        } else {
            Ok(Some(data_vec[batch_idx].to_device(target_device)?))
        }
    } else {
        // if the data vector doesn't exist
        Ok(None)
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    samples: Vec<usize>,
    rng: StdRng,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(samples: Vec<usize>, seed: u64) -> Self {
        Self {
            samples,
            rng: StdRng::seed_from_u64(seed),
            chunks: vec![],
        }
    }

    /// Permute the samples and cut them into consecutive chunks of
    /// `batch_size`; the last chunk may be smaller.
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let batch_size = batch_size.max(1);
        self.samples.shuffle(&mut self.rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

///
/// Convert rows of a matrix to a vector of `Tensor`
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>>;
}

impl RowsToTensorVec for DMatrix<f32> {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>> {
        let ncols = self.ncols();
        let mut idx_data = self
            .row_iter()
            .enumerate()
            .par_bridge()
            .map(|(i, row)| {
                let v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)?;
                Ok((i, v.reshape((1, ncols))?))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        idx_data.sort_by_key(|(i, _)| *i);
        Ok(idx_data.into_iter().map(|(_, t)| t).collect())
    }
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>> {
        (0..self.dim(0)?).map(|i| self.narrow(0, i, 1)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn docs(n: usize) -> candle_core::Result<Tensor> {
        Tensor::arange(0f32, (n * 3) as f32, &Device::Cpu)?.reshape((n, 3))
    }

    #[test]
    fn minibatches_partition_all_documents() -> anyhow::Result<()> {
        let mut data = InMemoryData::new(&docs(11)?)?.with_seed(1);
        data.shuffle_minibatch(4)?;
        assert_eq!(data.num_minibatch(), 3);

        let mut seen: Vec<usize> = data.minibatch_samples().iter().flatten().copied().collect();
        seen.sort();
        assert_eq!(seen, (0..11).collect::<Vec<_>>());

        let last = data.minibatch_shuffled(2, &Device::Cpu)?;
        assert_eq!(last.input.dims(), &[3, 3]);
        assert!(last.contextual.is_none());
        Ok(())
    }

    #[test]
    fn shuffling_is_reproducible_with_seed() -> anyhow::Result<()> {
        let x = docs(20)?;
        let mut a = InMemoryData::new(&x)?.with_seed(42);
        let mut b = InMemoryData::new(&x)?.with_seed(42);
        for _ in 0..3 {
            a.shuffle_minibatch(6)?;
            b.shuffle_minibatch(6)?;
            assert_eq!(a.minibatch_samples(), b.minibatch_samples());
        }
        Ok(())
    }

    #[test]
    fn contextual_rows_follow_documents() -> anyhow::Result<()> {
        let x = docs(5)?;
        let ctx = (docs(5)? * 10.)?;
        let mut data = InMemoryData::new_with_contextual(&x, &ctx)?.with_seed(3);
        data.shuffle_minibatch(2)?;

        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_shuffled(b, &Device::Cpu)?;
            let ctx = mb.contextual.ok_or(anyhow::anyhow!("contextual"))?;
            let expected = (&mb.input * 10.)?;
            let diff = (ctx - expected)?.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert_eq!(diff, 0.0);
        }
        Ok(())
    }

    #[test]
    fn contextual_row_mismatch_fails() -> anyhow::Result<()> {
        let x = docs(5)?;
        let ctx = Tensor::zeros((4, 2), DType::F32, &Device::Cpu)?;
        assert!(InMemoryData::new_with_contextual(&x, &ctx).is_err());
        Ok(())
    }
}
