//! Bit sampling locality sensitive hashing for binary descriptors.
//!
//! Each table hashes a row to the values of a fixed random subset of its
//! bits. Rows within a small Hamming distance of a query collide with it in
//! at least one table with high probability. Queries also probe every bucket
//! one bit flip away from their own key.

use std::collections::HashMap;

use rand::{rngs::StdRng, seq::index, SeedableRng};

use super::kdtree::Neighbour;

/// Number of differing bits between two equally long bit strings
#[inline]
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[derive(Debug, Clone)]
struct HashTable {
    /// Bit positions forming the key, most significant first
    bits: Vec<usize>,
    buckets: HashMap<u32, Vec<usize>>,
}

impl HashTable {
    fn key(&self, row: &[u8]) -> u32 {
        self.bits.iter().fold(0u32, |key, &bit| {
            let set = row[bit / 8] >> (7 - bit % 8) & 1;
            key << 1 | set as u32
        })
    }
}

#[derive(Debug, Clone)]
pub struct LshIndex<'d> {
    data: &'d [u8],
    width: usize,
    tables: Vec<HashTable>,
}

impl<'d> LshIndex<'d> {
    /// Indexes the rows of `data` (`width` bytes per row) in `tables` hash
    /// tables keyed by `key_bits` sampled bits.
    pub fn build(data: &'d [u8], width: usize, tables: usize, key_bits: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let rows = if width == 0 { 0 } else { data.len() / width };
        let key_bits = key_bits.clamp(1, 32).min(width * 8);

        let tables = (0..tables.max(1))
            .map(|_| {
                let mut table = HashTable {
                    bits: index::sample(&mut rng, width * 8, key_bits).into_vec(),
                    buckets: HashMap::new(),
                };
                for row in 0..rows {
                    let key = table.key(&data[row * width..(row + 1) * width]);
                    table.buckets.entry(key).or_default().push(row);
                }
                table
            })
            .collect();

        Self { data, width, tables }
    }

    /// Up to `k` closest colliding rows of `query`, closest first.
    ///
    /// Rows that share no probed bucket with the query are never compared, so
    /// fewer than `k` neighbours may come back.
    pub fn knn(&self, query: &[u8], k: usize) -> Vec<Neighbour> {
        if k == 0 || query.len() != self.width || self.width == 0 {
            return Vec::new();
        }

        let rows = self.data.len() / self.width;
        let mut seen = vec![false; rows];
        let mut best: Vec<(u32, usize)> = Vec::with_capacity(k + 1);

        for table in &self.tables {
            let key = table.key(query);
            let probes = std::iter::once(key).chain((0..table.bits.len()).map(|bit| key ^ (1 << bit)));

            for probe in probes {
                let Some(bucket) = table.buckets.get(&probe) else {
                    continue;
                };
                for &row in bucket {
                    if std::mem::replace(&mut seen[row], true) {
                        continue;
                    }
                    let distance = hamming_distance(query, &self.data[row * self.width..(row + 1) * self.width]);
                    let at = best.partition_point(|&(d, _)| d <= distance);
                    if at < k {
                        best.insert(at, (distance, row));
                        best.truncate(k);
                    }
                }
            }
        }

        best.into_iter()
            .map(|(distance, index)| Neighbour {
                index,
                distance: distance as f32,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_counts_differing_bits() {
        assert_eq!(hamming_distance(&[0b1010_0000, 0xFF], &[0b0010_0000, 0x0F]), 5);
        assert_eq!(hamming_distance(&[7; 8], &[7; 8]), 0);
    }

    #[test]
    fn identical_rows_always_collide() {
        let data: Vec<u8> = (0..64u8).flat_map(|i| [i.wrapping_mul(37), i ^ 0x5A, !i, i]).collect();
        let index = LshIndex::build(&data, 4, 6, 12, 3);

        for row in [0usize, 17, 63] {
            let result = index.knn(&data[row * 4..row * 4 + 4], 1);
            assert_eq!(result[0].distance, 0.0);
            assert_eq!(&data[result[0].index * 4..result[0].index * 4 + 4], &data[row * 4..row * 4 + 4]);
        }
    }

    #[test]
    fn one_bit_away_is_found_by_probing() {
        let data = [0u8; 4];
        // a single table keyed by all 32 bits: only the multi-probe can reach the row
        let index = LshIndex::build(&data, 4, 1, 32, 0);
        let result = index.knn(&[0, 0, 0, 1], 2);
        assert_eq!(result, vec![Neighbour { index: 0, distance: 1.0 }]);
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = LshIndex::build(&[], 32, 4, 12, 0);
        assert!(index.knn(&[0; 32], 2).is_empty());
    }
}
