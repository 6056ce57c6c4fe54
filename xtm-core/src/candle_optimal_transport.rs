//! Entropic optimal transport by Sinkhorn scaling
//!
//! min_T <T, C> - (1/alpha) H(T | P)   s.t.  T 1 = a,  T' 1 = b
//!
//! The kernel is always `exp(-alpha C)`. With no prior coupling `P`
//! the marginals `a` and `b` are uniform; with one they are the row
//! and column sums of `P`. Pairs to avoid must be priced out through
//! the cost.

use crate::candle_loss_functions::frobenius_inner;
use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SinkhornConfig {
    /// inverse strength of the entropic regularization
    pub alpha: f64,
    pub max_iter: usize,
    /// stop once the L1 error of the column marginal falls below this
    pub stop_threshold: f64,
    /// how often (in iterations) the marginal error is evaluated
    pub check_every: usize,
    /// added to denominators
    pub epsilon: f64,
}

impl Default for SinkhornConfig {
    fn default() -> Self {
        Self {
            alpha: 20.0,
            max_iter: 1000,
            stop_threshold: 5e-3,
            check_every: 50,
            epsilon: 1e-16,
        }
    }
}

impl SinkhornConfig {
    pub fn with_alpha(alpha: f64, max_iter: usize) -> Self {
        Self {
            alpha,
            max_iter,
            ..Default::default()
        }
    }
}

/// Result of a Sinkhorn solve; the plan is detached from the graph
#[derive(Clone, Debug)]
pub struct TransportPlan {
    /// transport plan (n x m)
    pub plan_nm: Tensor,
    pub iterations: usize,
    /// L1 error of the column marginal at exit
    pub marginal_error: f64,
    pub converged: bool,
}

impl TransportPlan {
    /// total mass moved; should be one for probability marginals
    pub fn mass(&self) -> Result<f32> {
        self.plan_nm.sum_all()?.to_scalar::<f32>()
    }

    /// One text line per row of the plan, for logging
    pub fn to_lines(&self, precision: usize) -> Result<Vec<String>> {
        let rows = self.plan_nm.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        Ok(rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{:.*}", precision, x))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect())
    }
}

pub struct SinkhornSolver {
    config: SinkhornConfig,
}

impl SinkhornSolver {
    pub fn new(config: SinkhornConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SinkhornConfig {
        &self.config
    }

    /// Solve the entropic transport problem for a cost matrix.
    ///
    /// Iteration stops when the marginal error drops below the
    /// threshold or after `max_iter` rounds, whichever comes first;
    /// the last plan is returned either way.
    ///
    /// * `cost_nm` - non-negative cost (n x m)
    /// * `prior_nm` - optional non-negative prior coupling (n x m)
    pub fn solve(&self, cost_nm: &Tensor, prior_nm: Option<&Tensor>) -> Result<TransportPlan> {
        let SinkhornConfig {
            alpha,
            max_iter,
            stop_threshold,
            check_every,
            epsilon,
        } = self.config;

        let cost_nm = cost_nm.detach();
        let (nn, mm) = cost_nm.dims2()?;
        let dev = cost_nm.device();
        let dtype = cost_nm.dtype();

        let gibbs_nm = (&cost_nm * (-alpha))?.exp()?;

        let (kernel_nm, a_n1, b_m1) = match prior_nm {
            Some(prior_nm) => {
                let prior_nm = prior_nm.detach();
                if prior_nm.dims2()? != (nn, mm) {
                    return Err(candle_core::Error::UnexpectedShape {
                        msg: "prior coupling vs. cost".to_string(),
                        expected: cost_nm.shape().clone(),
                        got: prior_nm.shape().clone(),
                    });
                }
                let a_n1 = prior_nm.sum_keepdim(1)?;
                let b_m1 = prior_nm.sum(0)?.unsqueeze(1)?;
                (gibbs_nm, a_n1, b_m1)
            }
            None => {
                let a_n1 = (Tensor::ones((nn, 1), dtype, dev)? / nn as f64)?;
                let b_m1 = (Tensor::ones((mm, 1), dtype, dev)? / mm as f64)?;
                (gibbs_nm, a_n1, b_m1)
            }
        };

        let kernel_mn = kernel_nm.t()?;
        let check_every = check_every.max(1);

        let mut u_n1 = (Tensor::ones((nn, 1), dtype, dev)? / nn as f64)?;
        let mut v_m1 = Tensor::ones((mm, 1), dtype, dev)?;
        let mut err = f64::INFINITY;
        let mut iter = 0;

        while err > stop_threshold && iter < max_iter {
            v_m1 = b_m1.div(&(kernel_mn.matmul(&u_n1)? + epsilon)?)?;
            u_n1 = a_n1.div(&(kernel_nm.matmul(&v_m1)? + epsilon)?)?;
            iter += 1;

            if iter % check_every == 1 {
                err = column_marginal_error(&kernel_mn, &u_n1, &v_m1, &b_m1)?;
            }
        }

        let marginal_error = column_marginal_error(&kernel_mn, &u_n1, &v_m1, &b_m1)?;
        let plan_nm = u_n1.broadcast_mul(&kernel_nm)?.broadcast_mul(&v_m1.t()?)?;

        Ok(TransportPlan {
            plan_nm,
            iterations: iter,
            marginal_error,
            converged: marginal_error <= stop_threshold,
        })
    }
}

/// sum_j | v(j) (K'u)(j) - b(j) |
fn column_marginal_error(
    kernel_mn: &Tensor,
    u_n1: &Tensor,
    v_m1: &Tensor,
    b_m1: &Tensor,
) -> Result<f64> {
    let bb_m1 = v_m1.mul(&kernel_mn.matmul(u_n1)?)?;
    let err = (bb_m1 - b_m1)?.abs()?.sum_all()?.to_scalar::<f32>()?;
    Ok(err as f64)
}

/// Optimal-transport regularization of a cost matrix
///
/// loss = weight * <T*, C>
///
/// The plan `T*` is held fixed when differentiating, so the gradient
/// with respect to the cost is `weight * T*`, which is the gradient
/// of the optimal entropic transport value itself.
pub struct TransportRegularizer {
    weight: f64,
    solver: SinkhornSolver,
}

impl TransportRegularizer {
    pub fn new(weight: f64, config: SinkhornConfig) -> Self {
        Self {
            weight,
            solver: SinkhornSolver::new(config),
        }
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn solver(&self) -> &SinkhornSolver {
        &self.solver
    }

    /// Returns `(loss, plan)`; the loss is a scalar attached to the
    /// graph of `cost_nm`
    pub fn forward(
        &self,
        cost_nm: &Tensor,
        prior_nm: Option<&Tensor>,
    ) -> Result<(Tensor, TransportPlan)> {
        let plan = self.solver.solve(cost_nm, prior_nm)?;
        let loss = (frobenius_inner(&plan.plan_nm, cost_nm)? * self.weight)?;
        Ok((loss, plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn uniform_marginals_are_met() -> Result<()> {
        let dev = Device::Cpu;
        let cost = Tensor::rand(0f32, 2., (6, 9), &dev)?;
        let solver = SinkhornSolver::new(SinkhornConfig::with_alpha(5.0, 2000));
        let plan = solver.solve(&cost, None)?;

        let rows = plan.plan_nm.sum(1)?.to_vec1::<f32>()?;
        for r in rows {
            approx::assert_abs_diff_eq!(r, 1. / 6., epsilon = 1e-3);
        }
        approx::assert_abs_diff_eq!(plan.mass()?, 1.0, epsilon = 1e-2);
        assert!(plan.converged);
        Ok(())
    }

    #[test]
    fn larger_alpha_gives_sharper_plan() -> Result<()> {
        let dev = Device::Cpu;
        // two clean assignments on the diagonal
        let cost = Tensor::new(&[[0f32, 1.], [1., 0.]], &dev)?;

        let soft = SinkhornSolver::new(SinkhornConfig::with_alpha(1.0, 1000)).solve(&cost, None)?;
        let hard = SinkhornSolver::new(SinkhornConfig::with_alpha(50.0, 1000)).solve(&cost, None)?;

        let soft_diag = soft.plan_nm.to_vec2::<f32>()?[0][0];
        let hard_diag = hard.plan_nm.to_vec2::<f32>()?[0][0];
        assert!(hard_diag > soft_diag);
        approx::assert_abs_diff_eq!(hard_diag, 0.5, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn non_convergence_returns_last_plan() -> Result<()> {
        let dev = Device::Cpu;
        let cost = Tensor::rand(0f32, 4., (5, 7), &dev)?;
        let plan = SinkhornSolver::new(SinkhornConfig::with_alpha(20.0, 1)).solve(&cost, None)?;
        assert_eq!(plan.iterations, 1);
        assert_eq!(plan.plan_nm.dims(), &[5, 7]);
        assert!(plan.marginal_error.is_finite());
        Ok(())
    }

    #[test]
    fn prior_coupling_sets_marginals_and_cost_prices_out_self_pairs() -> Result<()> {
        let dev = Device::Cpu;
        let kk = 4;

        // uniform off-diagonal cost, inflated self-pairs
        let cost = ((Tensor::ones((kk, kk), DType::F32, &dev)? * 0.5)?
            + (Tensor::eye(kk, DType::F32, &dev)? * 99.5)?)?;

        let prior = crate::candle_topic_grouping::group_connection_matrix(
            &[0, 0, 1, 1],
            &Default::default(),
            &dev,
        )?;

        let plan = SinkhornSolver::new(SinkhornConfig::with_alpha(4.0, 1000))
            .solve(&cost, Some(&prior))?;
        let t = plan.plan_nm.to_vec2::<f32>()?;

        // each row of the prior sums to (1 + 0.2 + 0.2) / 5.6
        for (i, row) in t.iter().enumerate() {
            approx::assert_abs_diff_eq!(row[i], 0.0, epsilon = 1e-6);
            approx::assert_abs_diff_eq!(row.iter().sum::<f32>(), 0.25, epsilon = 1e-3);
        }

        // the kernel is not reweighted by the prior: the same-group
        // partner gets no more mass than the other group
        for &x in &t[0][1..] {
            approx::assert_abs_diff_eq!(x, 1. / 12., epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn regularizer_loss_is_weighted_transport_cost() -> Result<()> {
        let dev = Device::Cpu;
        let cost = Tensor::rand(0f32, 1., (4, 4), &dev)?;
        let reg = TransportRegularizer::new(3.0, SinkhornConfig::default());
        let (loss, plan) = reg.forward(&cost, None)?;

        let expected = (plan.plan_nm.mul(&cost)?.sum_all()? * 3.0)?.to_scalar::<f32>()?;
        let loss = loss.to_scalar::<f32>()?;
        approx::assert_abs_diff_eq!(loss, expected, epsilon = 1e-5);
        assert!(loss >= 0.);
        Ok(())
    }
}
