//! Randomized kd-forest for approximate nearest neighbour search over
//! real-valued descriptors.
//!
//! Every tree splits on a dimension drawn at random from the few with the
//! highest variance, so the trees partition the data differently. A query
//! descends all trees, then explores the closest unexplored branches of any
//! tree until `checks` points have been compared. Results are exact
//! distances, but the neighbour found may not be the true nearest one.

use std::{cmp::Ordering, collections::BinaryHeap};

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Dimensions considered when picking a random split
const TOP_VARIANCE_DIMS: usize = 5;
/// Sample of points used to estimate the variance per dimension
const VARIANCE_SAMPLE: usize = 100;
const MAX_LEAF_SIZE: usize = 4;

#[derive(Debug, Clone)]
enum Node {
    Leaf { start: usize, end: usize },
    Split { dim: usize, value: f32, left: usize, right: usize },
}

#[derive(Debug, Clone)]
struct KdTree {
    nodes: Vec<Node>,
    /// Permuted point indices, leaves reference ranges of this
    order: Vec<usize>,
}

/// Branch waiting to be explored, ordered so the heap pops the closest first
#[derive(Debug, Clone, Copy)]
struct Branch {
    bound: f32,
    tree: usize,
    node: usize,
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Branch {}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Branch {
    fn cmp(&self, other: &Self) -> Ordering {
        other.bound.total_cmp(&self.bound)
    }
}

/// Neighbour found by an index query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
    pub index: usize,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct KdForest<'d> {
    data: &'d [f32],
    width: usize,
    trees: Vec<KdTree>,
    checks: usize,
}

impl<'d> KdForest<'d> {
    /// Indexes the rows of `data` (row-major, `width` floats per row).
    pub fn build(data: &'d [f32], width: usize, trees: usize, checks: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let rows = if width == 0 { 0 } else { data.len() / width };

        let trees = (0..trees.max(1))
            .map(|_| {
                let mut tree = KdTree {
                    nodes: Vec::new(),
                    order: (0..rows).collect(),
                };
                if rows > 0 {
                    Self::split(data, width, &mut tree, 0, rows, &mut rng);
                }
                tree
            })
            .collect();

        Self {
            data,
            width,
            trees,
            checks: checks.max(1),
        }
    }

    fn row(data: &[f32], width: usize, index: usize) -> &[f32] {
        &data[index * width..(index + 1) * width]
    }

    /// Builds the subtree over `order[start..end]`, returns its node index
    fn split(data: &[f32], width: usize, tree: &mut KdTree, start: usize, end: usize, rng: &mut StdRng) -> usize {
        let id = tree.nodes.len();
        if end - start <= MAX_LEAF_SIZE {
            tree.nodes.push(Node::Leaf { start, end });
            return id;
        }

        let points = &tree.order[start..end];
        let sample = &points[..points.len().min(VARIANCE_SAMPLE)];
        let mut mean = vec![0f32; width];
        for &p in sample {
            for (m, v) in mean.iter_mut().zip(Self::row(data, width, p)) {
                *m += v;
            }
        }
        mean.iter_mut().for_each(|m| *m /= sample.len() as f32);

        let mut variance: Vec<(f32, usize)> = (0..width)
            .map(|dim| {
                let var = sample
                    .iter()
                    .map(|&p| (data[p * width + dim] - mean[dim]).powi(2))
                    .sum::<f32>();
                (var, dim)
            })
            .collect();
        variance.sort_by(|a, b| b.0.total_cmp(&a.0));

        let candidates = TOP_VARIANCE_DIMS.min(width);
        let dim = variance[rng.gen_range(0..candidates)].1;
        let value = mean[dim];

        // partition around the mean, falling back to the middle on degenerate data
        let slice = &mut tree.order[start..end];
        slice.sort_by(|&a, &b| data[a * width + dim].total_cmp(&data[b * width + dim]));
        let below = slice.iter().filter(|&&p| data[p * width + dim] < value).count();
        let mid = if below == 0 || below == slice.len() {
            slice.len() / 2
        } else {
            below
        };
        let value = data[slice[mid] * width + dim];

        tree.nodes.push(Node::Leaf { start, end });
        let left = Self::split(data, width, tree, start, start + mid, rng);
        let right = Self::split(data, width, tree, start + mid, end, rng);
        tree.nodes[id] = Node::Split { dim, value, left, right };
        id
    }

    fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
    }

    /// Up to `k` approximate nearest rows of `query`, closest first.
    pub fn knn(&self, query: &[f32], k: usize) -> Vec<Neighbour> {
        let rows = self.trees.first().map_or(0, |tree| tree.order.len());
        if k == 0 || rows == 0 || query.len() != self.width {
            return Vec::new();
        }

        let mut best: Vec<(f32, usize)> = Vec::with_capacity(k + 1);
        let mut visited = vec![false; rows];
        let mut checked = 0;
        let mut heap: BinaryHeap<Branch> = (0..self.trees.len())
            .map(|tree| Branch {
                bound: 0.0,
                tree,
                node: 0,
            })
            .collect();

        while let Some(branch) = heap.pop() {
            let worst = if best.len() == k { best[k - 1].0 } else { f32::INFINITY };
            if (checked >= self.checks && best.len() == k) || branch.bound > worst {
                break;
            }

            // descend to a leaf, queueing the far sides
            let tree = &self.trees[branch.tree];
            let mut node = branch.node;
            loop {
                match tree.nodes[node] {
                    Node::Split { dim, value, left, right } => {
                        let diff = query[dim] - value;
                        let (near, far) = if diff < 0.0 { (left, right) } else { (right, left) };
                        heap.push(Branch {
                            bound: branch.bound.max(diff * diff),
                            tree: branch.tree,
                            node: far,
                        });
                        node = near;
                    }
                    Node::Leaf { start, end } => {
                        for &point in &tree.order[start..end] {
                            if std::mem::replace(&mut visited[point], true) {
                                continue;
                            }
                            checked += 1;
                            let distance = Self::squared_distance(query, Self::row(self.data, self.width, point));
                            let at = best.partition_point(|&(d, _)| d <= distance);
                            if at < k {
                                best.insert(at, (distance, point));
                                best.truncate(k);
                            }
                        }
                        break;
                    }
                }
            }
        }

        best.into_iter()
            .map(|(distance, index)| Neighbour {
                index,
                distance: distance.sqrt(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_points() -> Vec<f32> {
        (0..100).flat_map(|i| [(i % 10) as f32, (i / 10) as f32]).collect()
    }

    #[test]
    fn finds_exact_neighbours_with_enough_checks() {
        let data = grid_points();
        let forest = KdForest::build(&data, 2, 4, 1000, 7);

        let result = forest.knn(&[3.1, 4.2], 2);
        assert_eq!(result[0].index, 43);
        assert!((result[0].distance - (0.01f32 + 0.04).sqrt()).abs() < 1e-5);
        assert_eq!(result[1].index, 53);
    }

    #[test]
    fn results_are_sorted_and_bounded_by_k() {
        let data = grid_points();
        let forest = KdForest::build(&data, 2, 2, 16, 1);

        let result = forest.knn(&[5.0, 5.0], 3);
        assert_eq!(result.len(), 3);
        assert!(result.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn empty_index_and_wrong_width() {
        let forest = KdForest::build(&[], 4, 4, 32, 0);
        assert!(forest.knn(&[0.0; 4], 2).is_empty());

        let data = grid_points();
        let forest = KdForest::build(&data, 2, 1, 32, 0);
        assert!(forest.knn(&[0.0; 3], 1).is_empty());
    }

    #[test]
    fn single_row_has_one_neighbour() {
        let data = [1.0, 2.0, 3.0];
        let forest = KdForest::build(&data, 3, 4, 32, 0);
        let result = forest.knn(&[1.0, 2.0, 6.0], 2);
        assert_eq!(result, vec![Neighbour { index: 0, distance: 3.0 }]);
    }
}
