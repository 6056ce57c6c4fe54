#![allow(dead_code)]

use candle_core::{Device, Result, Tensor, Var};
use candle_nn::{Module, ModuleT, VarBuilder, VarMap};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Activations used between stacked layers
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Act {
    Softplus,
    Relu,
}

impl Module for Act {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Act::Softplus => softplus(x),
            Act::Relu => x.relu(),
        }
    }
}

/// log(1 + exp(x)) = max(x, 0) + log(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    x.relu()? + tail
}

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Act>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Act) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

//////////////////////////////////////////
// Batch normalization without a scale  //
//////////////////////////////////////////

#[derive(Clone, Copy, Debug)]
pub struct ShiftBatchNormConfig {
    pub eps: f64,
    pub momentum: f64,
}

impl Default for ShiftBatchNormConfig {
    fn default() -> Self {
        Self {
            eps: 1e-5,
            momentum: 0.1,
        }
    }
}

/// Standardize each feature by its minibatch statistics and add a
/// learnable shift. There is no scale parameter at all; only the
/// shift receives gradients. Running mean and variance are tracked
/// for evaluation.
///
/// * `shift_1d` - learnable shift (1 x d)
/// * `running_mean_1d` - running mean (1 x d), not trained
/// * `running_var_1d` - running (unbiased) variance (1 x d), not trained
pub struct ShiftBatchNorm {
    num_features: usize,
    shift_1d: Tensor,
    running_mean_1d: Var,
    running_var_1d: Var,
    config: ShiftBatchNormConfig,
}

impl ShiftBatchNorm {
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn running_mean(&self) -> &Tensor {
        self.running_mean_1d.as_tensor()
    }

    pub fn running_var(&self) -> &Tensor {
        self.running_var_1d.as_tensor()
    }

    fn update_running_stats(&self, mean_1d: &Tensor, var_1d: &Tensor, nn: usize) -> Result<()> {
        let m = self.config.momentum;
        let unbiased_1d = if nn > 1 {
            (var_1d * (nn as f64 / (nn as f64 - 1.0)))?
        } else {
            var_1d.clone()
        };

        let new_mean = ((self.running_mean_1d.as_tensor() * (1.0 - m))? + (mean_1d * m)?)?;
        let new_var = ((self.running_var_1d.as_tensor() * (1.0 - m))? + (unbiased_1d * m)?)?;

        self.running_mean_1d.set(&new_mean)?;
        self.running_var_1d.set(&new_var)
    }
}

impl ModuleT for ShiftBatchNorm {
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor> {
        let eps = self.config.eps;

        if train {
            let nn = x_nd.dim(0)?;
            let mean_1d = x_nd.mean_keepdim(0)?;
            let centred_nd = x_nd.broadcast_sub(&mean_1d)?;
            let var_1d = centred_nd.sqr()?.mean_keepdim(0)?;

            self.update_running_stats(&mean_1d.detach(), &var_1d.detach(), nn)?;

            centred_nd
                .broadcast_div(&(var_1d + eps)?.sqrt()?)?
                .broadcast_add(&self.shift_1d)
        } else {
            let sd_1d = (self.running_var_1d.as_tensor() + eps)?.sqrt()?;
            x_nd.broadcast_sub(self.running_mean_1d.as_tensor())?
                .broadcast_div(&sd_1d)?
                .broadcast_add(&self.shift_1d)
        }
    }
}

/// Will create a shift-only batch normalization layer:
/// * `{prefix}.shift` (trainable)
/// * `{prefix}.running_mean`, `{prefix}.running_var` (saved, not trained)
pub fn shift_batch_norm(
    num_features: usize,
    config: ShiftBatchNormConfig,
    vb: VarBuilder,
    varmap: &VarMap,
) -> Result<ShiftBatchNorm> {
    let shift_1d = vb.get_with_hints((1, num_features), "shift", candle_nn::init::ZERO)?;

    let dev = vb.device();
    let dtype = vb.dtype();

    let running_mean_1d = register_var(
        varmap,
        &var_path(&vb, "running_mean"),
        &Tensor::zeros((1, num_features), dtype, dev)?,
    )?;
    let running_var_1d = register_var(
        varmap,
        &var_path(&vb, "running_var"),
        &Tensor::ones((1, num_features), dtype, dev)?,
    )?;

    Ok(ShiftBatchNorm {
        num_features,
        shift_1d,
        running_mean_1d,
        running_var_1d,
        config,
    })
}

/////////////////////////////
// variable initialization //
/////////////////////////////

pub fn var_path(vb: &VarBuilder, name: &str) -> String {
    let prefix = vb.prefix();
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Put a variable with explicit initial values in the `varmap` so
/// that it is trained (if it gets gradients) and saved along with
/// everything else. An existing variable under `path` is reused if
/// the shapes agree.
pub fn register_var(varmap: &VarMap, path: &str, init: &Tensor) -> Result<Var> {
    let mut vars = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("variable map lock: {}", e)))?;

    if let Some(var) = vars.get(path) {
        if var.shape() != init.shape() {
            return Err(candle_core::Error::UnexpectedShape {
                msg: format!("variable {} already exists", path),
                expected: init.shape().clone(),
                got: var.shape().clone(),
            });
        }
        return Ok(var.clone());
    }

    let var = Var::from_tensor(init)?;
    vars.insert(path.to_string(), var.clone());
    Ok(var)
}

/// Sample `rows x cols` from N(0, std^2) truncated to [-2, 2]
pub fn truncated_normal<R: Rng>(
    rows: usize,
    cols: usize,
    std: f64,
    rng: &mut R,
    dev: &Device,
) -> Result<Tensor> {
    let (lb, ub) = (-2_f64, 2_f64);
    let normal = Normal::new(0_f64, std)
        .map_err(|e| candle_core::Error::Msg(format!("normal distribution: {}", e)))?;

    let data: Vec<f32> = (0..(rows * cols))
        .map(|_| loop {
            let x = normal.sample(rng);
            if x >= lb && x <= ub {
                break x as f32;
            }
        })
        .collect();

    Tensor::from_vec(data, (rows, cols), dev)
}

/// x / max(||x||, eps) for each row
pub fn l2_normalize_rows(x_nd: &Tensor) -> Result<Tensor> {
    let eps = 1e-12;
    let norm_n1 = x_nd.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(eps, f64::INFINITY)?;
    x_nd.broadcast_div(&norm_n1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn softplus_matches_naive_formula() -> Result<()> {
        let x = Tensor::new(&[-30f32, -1., 0., 1., 30.], &Device::Cpu)?;
        let y = softplus(&x)?.to_vec1::<f32>()?;
        for (&xi, yi) in [-30f32, -1., 0., 1., 30.].iter().zip(y) {
            let expected = (1.0 + (xi as f64).exp()).ln() as f32;
            approx::assert_abs_diff_eq!(yi, expected, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn shift_batch_norm_standardizes_and_tracks_stats() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let bn = shift_batch_norm(2, ShiftBatchNormConfig::default(), vb.pp("bn"), &varmap)?;

        let x = Tensor::new(&[[1f32, 10.], [3., 20.], [5., 30.]], &dev)?;
        let y = bn.forward_t(&x, true)?;

        let col_mean = y.mean(0)?.to_vec1::<f32>()?;
        for m in col_mean {
            approx::assert_abs_diff_eq!(m, 0.0, epsilon = 1e-5);
        }

        // momentum 0.1 from (0, 1)
        let rm = bn.running_mean().flatten_all()?.to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(rm[0], 0.3, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(rm[1], 2.0, epsilon = 1e-4);

        // only shift is trainable; running stats are saved but frozen
        let names = varmap.data().lock().unwrap().keys().cloned().collect::<Vec<_>>();
        assert!(names.contains(&"bn.shift".to_string()));
        assert!(names.contains(&"bn.running_mean".to_string()));
        assert!(names.contains(&"bn.running_var".to_string()));
        Ok(())
    }

    #[test]
    fn l2_rows_have_unit_norm() -> Result<()> {
        let x = Tensor::new(&[[3f32, 4.], [0., 2.]], &Device::Cpu)?;
        let y = l2_normalize_rows(&x)?.sqr()?.sum(1)?.to_vec1::<f32>()?;
        for v in y {
            approx::assert_abs_diff_eq!(v, 1.0, epsilon = 1e-6);
        }
        Ok(())
    }
}
