//! Isolation ensemble
//!
//! Scores points by how quickly random axis-aligned splits isolate them.
//! Trees are grown on random subsamples with a depth limit of
//! `⌈log2 ψ⌉`; a point's score is `2^(−E[h(x)] / c(ψ))`, where `h` is the
//! path length and `c` the average path length of an unsuccessful search
//! in a binary search tree of `ψ` points.
//!
//! Every tree draws from its own ChaCha stream derived from the seed and the
//! tree index, so the ensemble is identical whether trees are built in
//! sequence or on the rayon pool.

use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use super::stats::quantile;
use super::DetectorError;

/// Euler–Mascheroni constant used by the path length normalisation
const EULER_GAMMA: f64 = 0.5772156649;

pub const DEFAULT_TREES: usize = 100;
pub const DEFAULT_MAX_SAMPLES: usize = 256;
pub const DEFAULT_SEED: u64 = 42;

/// Average path length of an unsuccessful BST search over `n` points
pub fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

/// Ensemble construction parameters
#[derive(Debug, Clone, PartialEq)]
pub struct IsolationForestParams {
    /// Number of trees
    pub n_trees: usize,
    /// Upper bound on the per-tree subsample size
    pub max_samples: usize,
    /// Seed for subsampling and split selection
    pub seed: u64,
}

impl Default for IsolationForestParams {
    fn default() -> Self {
        Self {
            n_trees: DEFAULT_TREES,
            max_samples: DEFAULT_MAX_SAMPLES,
            seed: DEFAULT_SEED,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// One isolation tree stored as a node arena, root at index 0
#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn build(data: &[Vec<f64>], indices: Vec<usize>, max_depth: usize, rng: &mut ChaCha8Rng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(data, indices, 0, max_depth, rng);
        tree
    }

    fn grow(
        &mut self,
        data: &[Vec<f64>],
        indices: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut ChaCha8Rng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf {
            size: indices.len(),
        });

        if indices.len() <= 1 || depth >= max_depth {
            return id;
        }

        // Only dimensions that still vary inside the node can split it
        let n_features = data[indices[0]].len();
        let splittable: Vec<(usize, f64, f64)> = (0..n_features)
            .filter_map(|feature| {
                let (min, max) = indices.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                    let v = data[i][feature];
                    (lo.min(v), hi.max(v))
                });
                (max > min).then_some((feature, min, max))
            })
            .collect();

        if splittable.is_empty() {
            return id;
        }

        let (feature, min, max) = splittable[rng.gen_range(0..splittable.len())];
        let threshold = split_point(min, max, rng.gen::<f64>());

        // threshold < max keeps both sides non-empty
        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) =
            indices.into_iter().partition(|&i| data[i][feature] <= threshold);

        let left = self.grow(data, left_idx, depth + 1, max_depth, rng);
        let right = self.grow(data, right_idx, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    /// Edges from the root to the terminal node, plus `c(size)` for
    /// terminal nodes still holding several points
    fn path_length(&self, point: &[f64]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if point[*feature] <= *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Point `u` of the way from `min` to `max`, kept in `[min, max)`
///
/// Halving both ends first keeps the span finite for values near `f64::MAX`.
fn split_point(min: f64, max: f64, u: f64) -> f64 {
    let t = min + u * (max / 2.0 - min / 2.0) * 2.0;
    if t.is_finite() && t >= min && t < max {
        t
    } else {
        min
    }
}

/// Fitted isolation ensemble
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    sample_size: usize,
    n_features: usize,
}

impl IsolationForest {
    /// Grow the ensemble on `data` (one row per observation)
    pub fn fit(data: &[Vec<f64>], params: &IsolationForestParams) -> Result<Self, DetectorError> {
        let n_features = validate_rows(data)?;
        if params.n_trees == 0 {
            return Err(DetectorError::InvalidParameter {
                name: "n_trees",
                reason: "must be at least 1".to_string(),
            });
        }
        if params.max_samples == 0 {
            return Err(DetectorError::InvalidParameter {
                name: "max_samples",
                reason: "must be at least 1".to_string(),
            });
        }

        let sample_size = params.max_samples.min(data.len());
        let max_depth = (sample_size as f64).log2().ceil() as usize;

        let trees = (0..params.n_trees)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
                rng.set_stream(tree_idx as u64);
                let subsample = sample(&mut rng, data.len(), sample_size).into_vec();
                IsolationTree::build(data, subsample, max_depth, &mut rng)
            })
            .collect();

        Ok(Self {
            trees,
            sample_size,
            n_features,
        })
    }

    /// Subsample size ψ used per tree
    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Anomaly score in `(0, 1]`: near 1 is anomalous, around 0.5 is normal
    pub fn score(&self, point: &[f64]) -> Result<f64, DetectorError> {
        if point.len() != self.n_features {
            return Err(DetectorError::RaggedInput {
                expected: self.n_features,
                row: 0,
                found: point.len(),
            });
        }

        let normaliser = average_path_length(self.sample_size);
        if normaliser == 0.0 {
            return Ok(0.5);
        }

        let mean_path =
            self.trees.iter().map(|t| t.path_length(point)).sum::<f64>() / self.trees.len() as f64;
        Ok(2f64.powf(-mean_path / normaliser))
    }

    /// Scores for every row of `data`
    pub fn score_samples(&self, data: &[Vec<f64>]) -> Result<Vec<f64>, DetectorError> {
        data.par_iter().map(|row| self.score(row)).collect()
    }

    /// Flags rows whose score exceeds the `(1 − contamination)` quantile of
    /// the scores in `data`; returns the flags and the threshold
    pub fn outliers(&self, data: &[Vec<f64>], contamination: f64) -> Result<(Vec<bool>, f64), DetectorError> {
        let scores = self.score_samples(data)?;
        let threshold = outlier_threshold(&scores, contamination)?;
        Ok((scores.iter().map(|s| *s > threshold).collect(), threshold))
    }
}

/// Score above which a point counts as an outlier
pub fn outlier_threshold(scores: &[f64], contamination: f64) -> Result<f64, DetectorError> {
    if !(contamination > 0.0 && contamination <= 0.5) {
        return Err(DetectorError::InvalidParameter {
            name: "contamination",
            reason: format!("must be in (0, 0.5], got {}", contamination),
        });
    }
    quantile(scores, 1.0 - contamination).ok_or(DetectorError::EmptyDataset)
}

fn validate_rows(data: &[Vec<f64>]) -> Result<usize, DetectorError> {
    let first = data.first().ok_or(DetectorError::EmptyDataset)?;
    let expected = first.len();
    if expected == 0 {
        return Err(DetectorError::RaggedInput {
            expected: 1,
            row: 0,
            found: 0,
        });
    }

    for (row, values) in data.iter().enumerate() {
        if values.len() != expected {
            return Err(DetectorError::RaggedInput {
                expected,
                row,
                found: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DetectorError::NonFinite {
                stage: "feature",
                index: row,
            });
        }
    }
    Ok(expected)
}
