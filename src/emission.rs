//! The bit-sliced popcount emission kernel (SPEC_FULL §4.2).
//!
//! Cells sharing a column share the same [`BitCountTable`], which is built
//! once per column visit and turns what would be an O(depth) scan per
//! candidate partition into eight popcounts.

use bio::stats::LogProb;

use crate::column::Column;
use crate::partition::{complement, Partition};
use crate::profile::{SubstitutionMatrix, NUM_EMISSION_CHANNELS, PROB_ONE};

const PROB_BITS: usize = 8;

/// `table[pos][channel][bit]`: bit `i` of the word is read `i`'s bit-`bit` of
/// its probability channel `channel` at position `pos`. Bits accumulate with
/// bitwise-OR across reads sharing a column — using `&=` here, as an easy
/// transcription mistake would, zeroes out every read's contribution but the
/// first and silently corrupts every column with depth above 1.
#[derive(Debug, Clone)]
pub struct BitCountTable {
    depth: usize,
    table: Vec<[[u64; PROB_BITS]; NUM_EMISSION_CHANNELS]>,
}

impl BitCountTable {
    pub fn build(column: &Column) -> Self {
        let depth = column.depth();
        let length = column.length as usize;
        let mut table = vec![[[0u64; PROB_BITS]; NUM_EMISSION_CHANNELS]; length];
        for (pos, slot) in table.iter_mut().enumerate() {
            let ref_pos = column.ref_start + pos as i64;
            for (i, read) in column.reads.iter().enumerate() {
                let probs = match read.probs_at(ref_pos) {
                    Some(p) => p,
                    None => continue,
                };
                for channel in 0..NUM_EMISSION_CHANNELS {
                    let value = probs[channel];
                    for bit in 0..PROB_BITS {
                        let bit_set = (value >> bit) & 1;
                        slot[channel][bit] |= (bit_set as u64) << i;
                    }
                }
            }
        }
        BitCountTable { depth, table }
    }

    /// The expected number of instances of `channel` at position `pos` among
    /// the reads selected by `partition`.
    pub fn expected_count(&self, partition: Partition, pos: usize, channel: usize) -> f64 {
        let mut raw = 0u64;
        let mut shift = 1u64;
        for bit in 0..PROB_BITS {
            let word = self.table[pos][channel][bit];
            raw += (word & partition).count_ones() as u64 * shift;
            shift <<= 1;
        }
        raw as f64 / (PROB_ONE * self.depth.max(1) as f64)
    }
}

fn log_prob_of_read_characters(
    expected_counts: &[f64; NUM_EMISSION_CHANNELS],
    sub_matrix: &SubstitutionMatrix,
    source: usize,
) -> f64 {
    (0..NUM_EMISSION_CHANNELS)
        .map(|derived| {
            // 0 expected instances contributes nothing even where the matrix
            // holds -infinity (a forbidden substitution): 0 * -inf is NaN in
            // IEEE754, but the correct weighted-log-probability convention is 0.
            let count = expected_counts[derived];
            if count == 0.0 {
                0.0
            } else {
                sub_matrix.get(source, derived) * count
            }
        })
        .sum()
}

/// The log-probability of the characters observed at one column position,
/// under `partition`, summed (via logSumExp) over which haplotype source
/// character produced them.
fn column_index_log_prob(
    table: &BitCountTable,
    partition: Partition,
    pos: usize,
    sub_matrix: &SubstitutionMatrix,
) -> LogProb {
    let mut expected = [0.0; NUM_EMISSION_CHANNELS];
    for (channel, slot) in expected.iter_mut().enumerate() {
        *slot = table.expected_count(partition, pos, channel);
    }
    let per_source: Vec<LogProb> = (0..NUM_EMISSION_CHANNELS)
        .map(|source| LogProb(log_prob_of_read_characters(&expected, sub_matrix, source)))
        .collect();
    LogProb::ln_sum_exp(&per_source)
}

/// The log-probability of the reads in `column` under `partition`, across
/// every position.
pub fn partition_log_prob(
    column: &Column,
    table: &BitCountTable,
    partition: Partition,
    sub_matrix: &SubstitutionMatrix,
) -> LogProb {
    (0..column.length as usize)
        .map(|pos| column_index_log_prob(table, partition, pos, sub_matrix))
        .fold(LogProb::ln_one(), |acc, p| acc + p)
}

/// A cell's emission log-probability: the column log-probability under its
/// partition plus the column log-probability under the complementary
/// partition (the other haplotype).
pub fn cell_emission_log_prob(
    column: &Column,
    table: &BitCountTable,
    partition: Partition,
    sub_matrix: &SubstitutionMatrix,
) -> LogProb {
    let depth = column.depth();
    partition_log_prob(column, table, partition, sub_matrix)
        + partition_log_prob(column, table, complement(partition, depth), sub_matrix)
}
