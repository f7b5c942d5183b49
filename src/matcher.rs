use space::{Knn, KnnFromBatch, LinearKnn, Metric};
use tracing::debug;

use crate::{
    algorithms::{
        kdtree::{KdForest, Neighbour},
        lsh::{hamming_distance, LshIndex},
    },
    config::{DescriptorMetric, MatcherFamily, PipelineConfig, SelectionStrategy, DEFAULT_RATIO},
    error::{PipelineError, Result},
    frame::{Descriptors, Match},
};

/// Randomized trees in the kd-forest
const KD_TREES: usize = 4;
/// Leaf points compared per kd-forest query
const KD_CHECKS: usize = 32;
const LSH_TABLES: usize = 12;
const LSH_KEY_BITS: usize = 8;
const INDEX_SEED: u64 = 0x5eed;

// Implementations for `space`

#[derive(Default)]
struct HammingRows;

impl<'r> Metric<&'r [u8]> for HammingRows {
    type Unit = u32;
    fn distance(&self, a: &&'r [u8], b: &&'r [u8]) -> Self::Unit {
        hamming_distance(a, b)
    }
}

/// Euclidean distance carried in the bit pattern of a non-negative `f32`,
/// which orders the same way as the float itself.
#[derive(Default)]
struct EuclideanRows;

impl<'r> Metric<&'r [f32]> for EuclideanRows {
    type Unit = u32;
    fn distance(&self, a: &&'r [f32], b: &&'r [f32]) -> Self::Unit {
        euclidean_distance(a, b).to_bits()
    }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

/// Descriptor rows borrowed from either matrix kind
#[derive(Clone, Copy)]
enum Rows<'d> {
    Binary { width: usize, data: &'d [u8] },
    Real { width: usize, data: &'d [f32] },
}

impl<'d> Rows<'d> {
    fn of(descriptors: &'d Descriptors) -> Option<Self> {
        match descriptors {
            Descriptors::Binary { width, data } => Some(Self::Binary { width: *width, data: data.as_slice() }),
            Descriptors::Real { width, data } => Some(Self::Real { width: *width, data: data.as_slice() }),
            Descriptors::Empty => None,
        }
    }
}

/// Finds correspondences from the newer frame's descriptors (query) into the
/// older frame's descriptors (train).
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorMatcher {
    pub family: MatcherFamily,
    pub metric: DescriptorMetric,
    pub selection: SelectionStrategy,
    /// Lowe's ratio, used by [`SelectionStrategy::RatioTest`]
    pub ratio: f32,
    /// Drop nearest neighbour matches that aren't mutual (brute force only)
    pub cross_check: bool,
}

impl DescriptorMatcher {
    pub fn new(family: MatcherFamily, metric: DescriptorMetric, selection: SelectionStrategy) -> Self {
        Self {
            family,
            metric,
            selection,
            ratio: DEFAULT_RATIO,
            cross_check: false,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            family: config.matcher,
            metric: config.metric(),
            selection: config.selector,
            ratio: config.ratio,
            cross_check: config.cross_check,
        }
    }

    pub fn with_ratio(mut self, ratio: f32) -> Self {
        self.ratio = ratio;
        self
    }

    pub fn with_cross_check(mut self, cross_check: bool) -> Self {
        self.cross_check = cross_check;
        self
    }

    /// Matches are ordered by query index. Either side being empty is not an
    /// error, it just produces no matches.
    pub fn match_descriptors(&self, query: &Descriptors, train: &Descriptors) -> Result<Vec<Match>> {
        let (Some(query_rows), Some(train_rows)) = (Rows::of(query), Rows::of(train)) else {
            return Ok(Vec::new());
        };
        if query.is_empty() || train.is_empty() {
            return Ok(Vec::new());
        }

        for descriptors in [query, train] {
            let fits = matches!(
                (self.metric, descriptors),
                (DescriptorMetric::Hamming, Descriptors::Binary { .. }) | (DescriptorMetric::L2, Descriptors::Real { .. })
            );
            if !fits {
                return Err(PipelineError::MetricMismatch {
                    metric: self.metric,
                    kind: descriptors.kind_name(),
                });
            }
        }

        if query.width() != train.width() {
            return Err(PipelineError::DescriptorWidthMismatch {
                query: query.width(),
                train: train.width(),
            });
        }

        let matches = match self.selection {
            SelectionStrategy::NearestNeighbor => {
                let forward = self.candidates(query_rows, train_rows, 1);
                let matches: Vec<Match> = forward
                    .iter()
                    .enumerate()
                    .filter_map(|(query_index, neighbours)| {
                        neighbours.first().map(|best| Match {
                            query_index,
                            train_index: best.index,
                            distance: best.distance,
                        })
                    })
                    .collect();

                if self.cross_check && self.family == MatcherFamily::BruteForce {
                    let backward = self.candidates(train_rows, query_rows, 1);
                    let before = matches.len();
                    let mutual: Vec<Match> = matches
                        .into_iter()
                        .filter(|m| backward[m.train_index].first().map(|n| n.index) == Some(m.query_index))
                        .collect();
                    debug!(before, after = mutual.len(), "cross check");
                    mutual
                } else {
                    matches
                }
            }
            SelectionStrategy::RatioTest => self
                .candidates(query_rows, train_rows, 2)
                .iter()
                .enumerate()
                .filter_map(|(query_index, neighbours)| match neighbours.as_slice() {
                    [best, second, ..] if best.distance < self.ratio * second.distance => Some(Match {
                        query_index,
                        train_index: best.index,
                        distance: best.distance,
                    }),
                    _ => None,
                })
                .collect(),
        };

        Ok(matches)
    }

    /// The `k` nearest train rows of every query row, closest first
    fn candidates(&self, query: Rows, train: Rows, k: usize) -> Vec<Vec<Neighbour>> {
        match (self.family, query, train) {
            (MatcherFamily::BruteForce, Rows::Binary { width, data: query }, Rows::Binary { data: train, .. }) => {
                let batch: Vec<(&[u8], usize)> = train.chunks_exact(width).zip(0..).collect();
                let search: LinearKnn<HammingRows, _> = KnnFromBatch::from_batch(batch.iter());
                query
                    .chunks_exact(width)
                    .map(|row| {
                        search
                            .knn(&row, k)
                            .into_iter()
                            .map(|nearest| Neighbour {
                                index: nearest.0.index,
                                distance: nearest.0.distance as f32,
                            })
                            .collect()
                    })
                    .collect()
            }
            (MatcherFamily::BruteForce, Rows::Real { width, data: query }, Rows::Real { data: train, .. }) => {
                let batch: Vec<(&[f32], usize)> = train.chunks_exact(width).zip(0..).collect();
                let search: LinearKnn<EuclideanRows, _> = KnnFromBatch::from_batch(batch.iter());
                query
                    .chunks_exact(width)
                    .map(|row| {
                        search
                            .knn(&row, k)
                            .into_iter()
                            .map(|nearest| Neighbour {
                                index: nearest.0.index,
                                distance: f32::from_bits(nearest.0.distance),
                            })
                            .collect()
                    })
                    .collect()
            }
            (MatcherFamily::Indexed, Rows::Binary { width, data: query }, Rows::Binary { data: train, .. }) => {
                let index = LshIndex::build(train, width, LSH_TABLES, LSH_KEY_BITS, INDEX_SEED);
                query.chunks_exact(width).map(|row| index.knn(row, k)).collect()
            }
            (MatcherFamily::Indexed, Rows::Real { width, data: query }, Rows::Real { data: train, .. }) => {
                let index = KdForest::build(train, width, KD_TREES, KD_CHECKS, INDEX_SEED);
                query.chunks_exact(width).map(|row| index.knn(row, k)).collect()
            }
            // kinds were checked against the metric before
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real(width: usize, rows: &[&[f32]]) -> Descriptors {
        Descriptors::real(width, rows.iter().flat_map(|r| r.iter().copied()).collect())
    }

    fn all_families() -> [MatcherFamily; 2] {
        [MatcherFamily::BruteForce, MatcherFamily::Indexed]
    }

    #[test]
    fn nearest_neighbor_single_pair() {
        let query = real(2, &[&[0.0, 0.0]]);
        let train = real(2, &[&[3.0, 0.0]]);

        for family in all_families() {
            let matcher = DescriptorMatcher::new(family, DescriptorMetric::L2, SelectionStrategy::NearestNeighbor);
            let matches = matcher.match_descriptors(&query, &train).unwrap();
            assert_eq!(
                matches,
                vec![Match {
                    query_index: 0,
                    train_index: 0,
                    distance: 3.0
                }],
                "{family}"
            );
        }
    }

    #[test]
    fn ratio_test_rejects_ambiguous_matches() {
        let query = real(1, &[&[0.0]]);
        let train = real(1, &[&[2.0], &[-2.1]]);

        for family in all_families() {
            let matcher = DescriptorMatcher::new(family, DescriptorMetric::L2, SelectionStrategy::RatioTest);
            assert!(matcher.match_descriptors(&query, &train).unwrap().is_empty(), "{family}");
        }
    }

    #[test]
    fn ratio_test_keeps_distinctive_matches() {
        let query = real(1, &[&[0.0], &[10.0]]);
        let train = real(1, &[&[9.0], &[0.5], &[30.0]]);
        let matcher =
            DescriptorMatcher::new(MatcherFamily::BruteForce, DescriptorMetric::L2, SelectionStrategy::RatioTest);

        let matches = matcher.match_descriptors(&query, &train).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!((matches[0].query_index, matches[0].train_index), (0, 1));
        assert_eq!((matches[1].query_index, matches[1].train_index), (1, 0));
        assert_eq!(matches[1].distance, 1.0);
    }

    #[test]
    fn ratio_test_needs_two_candidates() {
        let query = real(1, &[&[0.0]]);
        let train = real(1, &[&[0.1]]);
        let matcher =
            DescriptorMatcher::new(MatcherFamily::BruteForce, DescriptorMetric::L2, SelectionStrategy::RatioTest);
        assert!(matcher.match_descriptors(&query, &train).unwrap().is_empty());
    }

    #[test]
    fn hamming_nearest_neighbor() {
        let query = Descriptors::binary(2, vec![0b1111_0000, 0, 0xFF, 0xFF]);
        let train = Descriptors::binary(2, vec![0xFF, 0xFF, 0b1111_0001, 0]);

        for family in all_families() {
            let matcher =
                DescriptorMatcher::new(family, DescriptorMetric::Hamming, SelectionStrategy::NearestNeighbor);
            let matches = matcher.match_descriptors(&query, &train).unwrap();
            assert_eq!(matches.len(), 2, "{family}");
            assert_eq!((matches[0].train_index, matches[0].distance), (1, 1.0));
            assert_eq!((matches[1].train_index, matches[1].distance), (0, 0.0));
        }
    }

    #[test]
    fn cross_check_drops_one_sided_matches() {
        // both queries prefer train 0, but train 0 only prefers query 0
        let query = real(1, &[&[0.0], &[1.0]]);
        let train = real(1, &[&[0.2], &[5.0]]);
        let matcher =
            DescriptorMatcher::new(MatcherFamily::BruteForce, DescriptorMetric::L2, SelectionStrategy::NearestNeighbor)
                .with_cross_check(true);

        let matches = matcher.match_descriptors(&query, &train).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].query_index, matches[0].train_index), (0, 0));
    }

    #[test]
    fn empty_sides_match_nothing() {
        let matcher = DescriptorMatcher::new(
            MatcherFamily::BruteForce,
            DescriptorMetric::Hamming,
            SelectionStrategy::RatioTest,
        );
        let some = Descriptors::binary(1, vec![1, 2]);
        assert!(matcher.match_descriptors(&Descriptors::Empty, &some).unwrap().is_empty());
        assert!(matcher.match_descriptors(&some, &Descriptors::Empty).unwrap().is_empty());
    }

    #[test]
    fn metric_must_fit_descriptor_kind() {
        let matcher = DescriptorMatcher::new(
            MatcherFamily::BruteForce,
            DescriptorMetric::Hamming,
            SelectionStrategy::NearestNeighbor,
        );
        let real = real(1, &[&[0.0]]);
        assert!(matches!(
            matcher.match_descriptors(&real, &real),
            Err(PipelineError::MetricMismatch {
                metric: DescriptorMetric::Hamming,
                kind: "real-valued"
            })
        ));
    }

    #[test]
    fn widths_must_agree() {
        let matcher = DescriptorMatcher::new(
            MatcherFamily::Indexed,
            DescriptorMetric::Hamming,
            SelectionStrategy::NearestNeighbor,
        );
        let narrow = Descriptors::binary(1, vec![0]);
        let wide = Descriptors::binary(2, vec![0, 0]);
        assert!(matches!(
            matcher.match_descriptors(&narrow, &wide),
            Err(PipelineError::DescriptorWidthMismatch { query: 1, train: 2 })
        ));
    }
}
