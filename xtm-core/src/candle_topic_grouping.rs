//! Grouping topics by k-means on their embeddings
//!
//! Grouping happens once during training. Before that the model is
//! `Ungrouped` and carries no group regularization; afterwards it is
//! `Grouped` and the group-connection matrix stays fixed.

use candle_core::{DType, Device, Result, Tensor};
use log::info;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Arguments for k-means clustering
#[derive(Debug, Clone)]
pub struct KmeansArgs {
    pub num_clusters: usize,
    pub max_iter: usize,
}

impl Default for KmeansArgs {
    fn default() -> Self {
        Self {
            num_clusters: 1,
            max_iter: 100,
        }
    }
}

impl KmeansArgs {
    pub fn with_clusters(num_clusters: usize) -> Self {
        Self {
            num_clusters,
            ..Default::default()
        }
    }
}

/// k-means clustering of matrix rows
pub trait Kmeans {
    /// Cluster rows and return membership vector, one entry per row
    fn kmeans_rows(&self, args: &KmeansArgs) -> Vec<usize>;
}

impl<T> Kmeans for DMatrix<T>
where
    T: Clone + Sync + Send,
    Vec<T>: clustering::Elem,
{
    fn kmeans_rows(&self, args: &KmeansArgs) -> Vec<usize> {
        let nn = self.nrows();
        let kk = args.num_clusters.min(nn);

        if kk <= 1 {
            return vec![0; nn];
        }

        let data: Vec<Vec<T>> = self
            .row_iter()
            .map(|x| x.iter().cloned().collect())
            .collect();

        clustering::kmeans(kk, &data, args.max_iter).membership
    }
}

/// Scale every row to unit length before clustering, so that only
/// directions matter
pub fn kmeans_unit_rows(x_nd: &DMatrix<f32>, args: &KmeansArgs) -> Vec<usize> {
    let mut x: DMatrix<f64> = x_nd.map(|v| v as f64);
    for mut row in x.row_iter_mut() {
        let norm = row.norm().max(1e-12);
        row /= norm;
    }
    x.kmeans_rows(args)
}

//////////////////////////////
// group connection weights //
//////////////////////////////

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct GroupConnectionWeights {
    /// weight for two distinct topics in the same group
    pub within: f64,
    /// weight for topics in different groups
    pub between: f64,
    /// off-diagonal entries never fall below this before normalization
    pub floor: f64,
}

impl Default for GroupConnectionWeights {
    fn default() -> Self {
        Self {
            within: 1.0,
            between: 0.2,
            floor: 1e-4,
        }
    }
}

/// Group-connection regularizer (K x K):
/// * zero on the diagonal
/// * `within` for same-group pairs, `between` otherwise
/// * clamped at `floor`, then divided by the total
pub fn group_connection_matrix(
    assignment: &[usize],
    weights: &GroupConnectionWeights,
    dev: &Device,
) -> Result<Tensor> {
    let kk = assignment.len();
    let mut data = vec![0_f32; kk * kk];

    for i in 0..kk {
        for j in 0..kk {
            if i == j {
                continue;
            }
            let w = if assignment[i] == assignment[j] {
                weights.within
            } else {
                weights.between
            };
            data[i * kk + j] = w.max(weights.floor) as f32;
        }
    }

    let total: f32 = data.iter().sum();
    if total > 0.0 {
        data.iter_mut().for_each(|x| *x /= total);
    }

    Tensor::from_vec(data, (kk, kk), dev)
}

/// Topic -> group assignment with the matching memberships and
/// connection matrix
#[derive(Clone, Debug)]
pub struct TopicGroups {
    /// group index of each topic
    pub assignment: Vec<usize>,
    /// topic indexes of each group
    pub members: Vec<Vec<usize>>,
    /// group-connection regularizer (K x K)
    pub connection_kk: Tensor,
}

impl TopicGroups {
    pub fn from_assignment(
        assignment: Vec<usize>,
        num_groups: usize,
        weights: &GroupConnectionWeights,
        dev: &Device,
    ) -> Result<Self> {
        let mut members = vec![vec![]; num_groups];
        for (k, &g) in assignment.iter().enumerate() {
            if g >= num_groups {
                return Err(candle_core::Error::Msg(format!(
                    "topic {} assigned to group {} of {}",
                    k, g, num_groups
                )));
            }
            members[g].push(k);
        }
        let connection_kk = group_connection_matrix(&assignment, weights, dev)?;
        Ok(Self {
            assignment,
            members,
            connection_kk,
        })
    }

    pub fn num_groups(&self) -> usize {
        self.members.len()
    }

    pub fn num_topics(&self) -> usize {
        self.assignment.len()
    }
}

#[derive(Clone, Debug)]
pub struct GroupingArgs {
    pub num_groups: usize,
    pub kmeans_max_iter: usize,
    pub weights: GroupConnectionWeights,
}

pub enum TopicGrouping {
    Ungrouped,
    Grouped(TopicGroups),
}

impl TopicGrouping {
    pub fn is_grouped(&self) -> bool {
        matches!(self, TopicGrouping::Grouped(_))
    }

    pub fn groups(&self) -> Option<&TopicGroups> {
        match self {
            TopicGrouping::Grouped(groups) => Some(groups),
            TopicGrouping::Ungrouped => None,
        }
    }

    /// Cluster the topic embeddings (K x D) and move to `Grouped`.
    /// Does nothing once grouped. Returns whether the transition
    /// happened in this call.
    pub fn group_once(&mut self, topic_emb_kd: &Tensor, args: &GroupingArgs) -> Result<bool> {
        if self.is_grouped() {
            return Ok(false);
        }

        let (kk, dd) = topic_emb_kd.dims2()?;
        let rows = topic_emb_kd
            .detach()
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .to_vec2::<f32>()?;
        let emb = DMatrix::<f32>::from_fn(kk, dd, |i, j| rows[i][j]);

        let assignment = kmeans_unit_rows(
            &emb,
            &KmeansArgs {
                num_clusters: args.num_groups,
                max_iter: args.kmeans_max_iter,
            },
        );

        let groups = TopicGroups::from_assignment(
            assignment,
            args.num_groups,
            &args.weights,
            topic_emb_kd.device(),
        )?;

        info!("groups:");
        for (g, topics) in groups.members.iter().enumerate() {
            info!("group {}: {:?}", g, topics);
        }
        info!("group assignment: {:?}", groups.assignment);

        *self = TopicGrouping::Grouped(groups);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_rows_cluster_by_direction() {
        // same directions, very different lengths
        let mat = DMatrix::<f32>::from_row_slice(
            4,
            2,
            &[
                1.0, 0.0, //
                50.0, 0.5, //
                0.0, 1.0, //
                0.3, 40.0, //
            ],
        );
        let membership = kmeans_unit_rows(&mat, &KmeansArgs::with_clusters(2));
        assert_eq!(membership[0], membership[1]);
        assert_eq!(membership[2], membership[3]);
        assert_ne!(membership[0], membership[2]);
    }

    #[test]
    fn more_clusters_than_rows_is_capped() {
        let mat = DMatrix::from_row_slice(3, 2, &[1.0f64, 0.0, 0.0, 1.0, -1.0, 0.0]);
        let membership = mat.kmeans_rows(&KmeansArgs::with_clusters(5));
        assert_eq!(membership.len(), 3);
        assert!(membership.iter().all(|&g| g < 3));
    }

    #[test]
    fn uneven_groups_cover_every_topic() -> Result<()> {
        // 7 topics into 3 groups: sizes cannot be equal
        let groups = TopicGroups::from_assignment(
            vec![0, 0, 0, 1, 1, 2, 2],
            3,
            &GroupConnectionWeights::default(),
            &Device::Cpu,
        )?;
        assert_eq!(groups.members, vec![vec![0, 1, 2], vec![3, 4], vec![5, 6]]);
        assert_eq!(groups.num_topics(), 7);
        Ok(())
    }

    #[test]
    fn connection_matrix_is_a_distribution_with_zero_diagonal() -> Result<()> {
        let assignment = vec![0, 0, 1, 1, 1, 2, 0];
        let conn = group_connection_matrix(
            &assignment,
            &GroupConnectionWeights::default(),
            &Device::Cpu,
        )?;
        let conn = conn.to_vec2::<f32>()?;

        let mut total = 0.0;
        for (i, row) in conn.iter().enumerate() {
            assert_eq!(row[i], 0.0);
            for (j, &x) in row.iter().enumerate() {
                assert!(x >= 0.0);
                if i != j {
                    assert!(x > 0.0);
                }
                total += x;
            }
        }
        approx::assert_abs_diff_eq!(total, 1.0, epsilon = 1e-5);

        // same group weighs five times a cross-group pair
        approx::assert_abs_diff_eq!(conn[0][1] / conn[0][2], 5.0, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn floor_applies_to_cross_group_pairs() -> Result<()> {
        let weights = GroupConnectionWeights {
            within: 1.0,
            between: 0.0,
            floor: 1e-4,
        };
        let conn = group_connection_matrix(&[0, 1], &weights, &Device::Cpu)?.to_vec2::<f32>()?;
        approx::assert_abs_diff_eq!(conn[0][1], 0.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn grouping_happens_once() -> Result<()> {
        let dev = Device::Cpu;
        let emb = Tensor::randn(0f32, 1., (7, 4), &dev)?;
        let args = GroupingArgs {
            num_groups: 3,
            kmeans_max_iter: 100,
            weights: GroupConnectionWeights::default(),
        };

        let mut grouping = TopicGrouping::Ungrouped;
        assert!(grouping.group_once(&emb, &args)?);

        let first = grouping.groups().map(|g| g.assignment.clone());
        let other = Tensor::randn(0f32, 1., (7, 4), &dev)?;
        assert!(!grouping.group_once(&other, &args)?);
        assert_eq!(grouping.groups().map(|g| g.assignment.clone()), first);

        let groups = grouping.groups().unwrap();
        assert_eq!(groups.num_groups(), 3);
        let total: usize = groups.members.iter().map(|m| m.len()).sum();
        assert_eq!(total, 7);
        Ok(())
    }
}
