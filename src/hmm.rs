//! The read-partitioning HMM itself: the column/merge-column chain, and the
//! operations that build, combine and solve it (SPEC_FULL §4.3-4.9).

use std::collections::HashSet;
use std::sync::Arc;

use bio::stats::LogProb;

use crate::column::{Cell, Column, MergeColumn};
use crate::emission::{cell_emission_log_prob, BitCountTable};
use crate::errors::Error;
use crate::partition::{merge_masks, seq_in_hap1, Partition, MAX_DEPTH};
use crate::profile::{ProfileSequence, SharedSubstitutionMatrix, NUM_EMISSION_CHANNELS};

/// A read-partitioning HMM over a contiguous reference interval. `columns`
/// and `merge_columns` are parallel arenas: `merge_columns[i]` always sits
/// between `columns[i]` and `columns[i + 1]`, so `merge_columns.len() ==
/// columns.len() - 1` is an invariant of every well-formed `Hmm`.
#[derive(Debug, Clone)]
pub struct Hmm {
    pub reference_name: String,
    pub ref_start: i64,
    pub ref_length: i64,
    pub profile_seqs: Vec<Arc<ProfileSequence>>,
    pub max_depth: usize,
    pub log_sub_matrix: SharedSubstitutionMatrix,
    pub columns: Vec<Column>,
    pub merge_columns: Vec<MergeColumn>,
    pub forward_log_prob: LogProb,
    pub backward_log_prob: LogProb,
}

impl Hmm {
    /// A single-column HMM representing the two possible partitions (this
    /// read in haplotype 1, or in haplotype 2) of one profile sequence.
    pub fn from_profile_sequence(seq: Arc<ProfileSequence>, log_sub_matrix: SharedSubstitutionMatrix) -> Self {
        let ref_start = seq.ref_start();
        let ref_length = seq.length();
        let reference_name = seq.reference_name().to_string();
        let column = Column::new(ref_start, ref_length, vec![seq.clone()], vec![Cell::new(0), Cell::new(1)]);
        Hmm {
            reference_name,
            ref_start,
            ref_length,
            profile_seqs: vec![seq],
            max_depth: 1,
            log_sub_matrix,
            columns: vec![column],
            merge_columns: Vec::new(),
            forward_log_prob: LogProb::ln_zero(),
            backward_log_prob: LogProb::ln_zero(),
        }
    }

    pub fn ref_end(&self) -> i64 {
        self.ref_start + self.ref_length
    }

    pub fn column_number(&self) -> usize {
        self.columns.len()
    }

    /// Whether `self` and `other` are on the same reference and their
    /// intervals overlap.
    pub fn overlaps(&self, other: &Hmm) -> bool {
        if self.reference_name != other.reference_name {
            return false;
        }
        let (a, b) = if self.ref_start <= other.ref_start {
            (self, other)
        } else {
            (other, self)
        };
        a.ref_start + a.ref_length > b.ref_start
    }

    /// Concatenates two non-overlapping, ordered HMMs on the same reference
    /// into one (SPEC_FULL §4.4). Consumes both inputs.
    pub fn fuse(left: Hmm, right: Hmm) -> Result<Hmm, Error> {
        if left.reference_name != right.reference_name {
            return Err(Error::FuseDifferentReferences {
                left: left.reference_name,
                right: right.reference_name,
            });
        }
        if left.overlaps(&right) {
            return Err(Error::FuseOverlapping {
                reference_name: left.reference_name,
                left_start: left.ref_start,
                left_end: left.ref_end(),
                right_start: right.ref_start,
                right_end: right.ref_end(),
            });
        }
        if left.ref_start >= right.ref_start {
            return Err(Error::FuseOutOfOrder {
                reference_name: left.reference_name,
                left_start: left.ref_start,
                right_start: right.ref_start,
            });
        }
        if !Arc::ptr_eq(&left.log_sub_matrix, &right.log_sub_matrix) {
            return Err(Error::MismatchedSubstitutionMatrix);
        }

        let gap_length = right.ref_start - left.ref_end();
        debug_assert!(gap_length >= 0);

        let mut columns = left.columns;
        let mut merge_columns = left.merge_columns;

        merge_columns.push(MergeColumn::bridge());
        if gap_length > 0 {
            columns.push(Column::empty(left.ref_end(), gap_length));
            merge_columns.push(MergeColumn::bridge());
        }
        columns.extend(right.columns);
        merge_columns.extend(right.merge_columns);

        let mut profile_seqs = left.profile_seqs;
        profile_seqs.extend(right.profile_seqs);

        Ok(Hmm {
            reference_name: left.reference_name,
            ref_start: left.ref_start,
            ref_length: right.ref_start + right.ref_length - left.ref_start,
            profile_seqs,
            max_depth: left.max_depth.max(right.max_depth),
            log_sub_matrix: left.log_sub_matrix,
            columns,
            merge_columns,
            forward_log_prob: LogProb::ln_zero(),
            backward_log_prob: LogProb::ln_zero(),
        })
    }

    /// Mutates both inputs so they span the same reference interval, have
    /// the same number of columns, and column `i` of each spans the same
    /// interval as column `i` of the other (SPEC_FULL §4.5). Consumes and
    /// returns both, ordered by ascending `ref_start`.
    pub fn align_columns(hmm1: Hmm, hmm2: Hmm) -> (Hmm, Hmm) {
        let (mut hmm1, mut hmm2) = if hmm1.ref_start <= hmm2.ref_start {
            (hmm1, hmm2)
        } else {
            (hmm2, hmm1)
        };

        if hmm1.ref_start < hmm2.ref_start {
            hmm2 = Hmm::prepend_padding(hmm2, hmm1.ref_start);
        }
        if hmm1.ref_length < hmm2.ref_length {
            hmm1 = Hmm::append_padding(hmm1, hmm2.ref_length - hmm1.ref_length);
        } else if hmm2.ref_length < hmm1.ref_length {
            hmm2 = Hmm::append_padding(hmm2, hmm1.ref_length - hmm2.ref_length);
        }

        debug_assert_eq!(hmm1.ref_start, hmm2.ref_start);
        debug_assert_eq!(hmm1.ref_length, hmm2.ref_length);

        let mut i = 0;
        let mut j = 0;
        loop {
            let len1 = hmm1.columns[i].length;
            let len2 = hmm2.columns[j].length;
            if len1 > len2 {
                Hmm::split_column_at(&mut hmm1, i, len2);
            } else if len2 > len1 {
                Hmm::split_column_at(&mut hmm2, j, len1);
            }
            i += 1;
            j += 1;
            if i >= hmm1.columns.len() {
                debug_assert_eq!(j, hmm2.columns.len());
                break;
            }
        }

        (hmm1, hmm2)
    }

    /// Prepends an empty column spanning `[new_start, hmm.ref_start)`.
    fn prepend_padding(mut hmm: Hmm, new_start: i64) -> Hmm {
        let length = hmm.ref_start - new_start;
        let mut columns = Vec::with_capacity(hmm.columns.len() + 1);
        columns.push(Column::empty(new_start, length));
        columns.extend(hmm.columns);
        let mut merge_columns = Vec::with_capacity(hmm.merge_columns.len() + 1);
        merge_columns.push(MergeColumn::bridge());
        merge_columns.extend(hmm.merge_columns);
        hmm.columns = columns;
        hmm.merge_columns = merge_columns;
        hmm.ref_length += length;
        hmm.ref_start = new_start;
        hmm
    }

    /// Appends an empty column of the given length to the end of the HMM.
    fn append_padding(mut hmm: Hmm, length: i64) -> Hmm {
        let ref_start = hmm.ref_end();
        hmm.merge_columns.push(MergeColumn::bridge());
        hmm.columns.push(Column::empty(ref_start, length));
        hmm.ref_length += length;
        hmm
    }

    /// Splits `hmm.columns[index]` at offset `at`, inserting the resulting
    /// right half and the identity merge column joining them.
    fn split_column_at(hmm: &mut Hmm, index: usize, at: i64) {
        let column = hmm.columns.remove(index);
        let (left, right, merge_column) = column.split(at);
        hmm.columns.insert(index, left);
        hmm.columns.insert(index + 1, right);
        hmm.merge_columns.insert(index, merge_column);
    }

    /// The Cartesian product of two column-aligned HMMs (SPEC_FULL §4.6).
    /// Consumes both inputs.
    pub fn cross_product(hmm1: Hmm, hmm2: Hmm) -> Result<Hmm, Error> {
        if hmm1.columns.len() != hmm2.columns.len() {
            return Err(Error::NotAligned {
                left_columns: hmm1.columns.len(),
                right_columns: hmm2.columns.len(),
            });
        }
        if !Arc::ptr_eq(&hmm1.log_sub_matrix, &hmm2.log_sub_matrix) {
            return Err(Error::MismatchedSubstitutionMatrix);
        }

        let mut columns = Vec::with_capacity(hmm1.columns.len());
        let mut max_depth = 0usize;

        for (c1, c2) in hmm1.columns.iter().zip(hmm2.columns.iter()) {
            debug_assert_eq!(c1.ref_start, c2.ref_start);
            debug_assert_eq!(c1.length, c2.length);

            let depth1 = c1.depth();
            let depth2 = c2.depth();
            let new_depth = depth1 + depth2;
            if new_depth > MAX_DEPTH {
                return Err(Error::DepthExceedsMaxDepth {
                    combined: new_depth,
                    max: MAX_DEPTH,
                });
            }
            max_depth = max_depth.max(new_depth);

            let mut reads = c1.reads.clone();
            reads.extend(c2.reads.iter().cloned());

            // Combined read slots are c1's reads (low, unshifted) followed by
            // c2's reads (high, shifted up by depth1): the partition's bit
            // layout must mirror that order or emission reads the wrong bit
            // for the wrong read.
            let mut cells = Vec::with_capacity(c1.cells.len() * c2.cells.len());
            for cell1 in &c1.cells {
                for cell2 in &c2.cells {
                    cells.push(Cell::new(merge_masks(cell2.partition, cell1.partition, depth1)));
                }
            }
            columns.push(Column::new(c1.ref_start, c1.length, reads, cells));
        }

        let mut merge_columns = Vec::with_capacity(hmm1.merge_columns.len());
        for i in 0..hmm1.merge_columns.len() {
            let mc1 = &hmm1.merge_columns[i];
            let mc2 = &hmm2.merge_columns[i];
            let prev_depth1 = hmm1.columns[i].depth();
            let next_depth1 = hmm1.columns[i + 1].depth();

            let mask_from = merge_masks(mc2.mask_from, mc1.mask_from, prev_depth1);
            let mask_to = merge_masks(mc2.mask_to, mc1.mask_to, next_depth1);
            let mut merge_column = MergeColumn::new(mask_from, mask_to);
            for cell1 in &mc1.cells {
                for cell2 in &mc2.cells {
                    let from_partition = merge_masks(cell2.from_partition, cell1.from_partition, prev_depth1);
                    let to_partition = merge_masks(cell2.to_partition, cell1.to_partition, next_depth1);
                    merge_column.insert(from_partition, to_partition);
                }
            }
            merge_columns.push(merge_column);
        }

        let mut profile_seqs = hmm1.profile_seqs;
        profile_seqs.extend(hmm2.profile_seqs);

        Ok(Hmm {
            reference_name: hmm1.reference_name,
            ref_start: hmm1.ref_start,
            ref_length: hmm1.ref_length,
            profile_seqs,
            max_depth,
            log_sub_matrix: hmm1.log_sub_matrix,
            columns,
            merge_columns,
            forward_log_prob: LogProb::ln_zero(),
            backward_log_prob: LogProb::ln_zero(),
        })
    }

    /// Forward algorithm (SPEC_FULL §4.7): single-source dynamic programming
    /// from the first column to the last, accumulating `hmm.forward_log_prob`
    /// over the terminal column's cells.
    pub fn forward(&mut self) {
        self.reset_forward();

        let n = self.columns.len();
        for i in 0..n {
            let table = BitCountTable::build(&self.columns[i]);
            let partitions: Vec<Partition> = self.columns[i].cells.iter().map(|c| c.partition).collect();

            for partition in partitions {
                let inherited = if i > 0 {
                    match self.merge_columns[i - 1].previous_merge_cell(partition) {
                        Some(mc) => mc.forward_log_prob,
                        None => continue,
                    }
                } else {
                    LogProb::ln_one()
                };

                let emission = cell_emission_log_prob(&self.columns[i], &table, partition, &self.log_sub_matrix);
                let forward = inherited + emission;

                let cell_idx = self.columns[i]
                    .cells
                    .iter()
                    .position(|c| c.partition == partition)
                    .expect("partition collected from this column's own cells");
                self.columns[i].cells[cell_idx].forward_log_prob = forward;
                self.columns[i].forward_log_prob = self.columns[i].forward_log_prob.ln_add_exp(forward);

                if i + 1 < n {
                    if let Some(mc_idx) = self.merge_columns[i].next_merge_cell_index(partition) {
                        let prior = self.merge_columns[i].cells[mc_idx].forward_log_prob;
                        self.merge_columns[i].cells[mc_idx].forward_log_prob = prior.ln_add_exp(forward);
                    }
                } else {
                    self.forward_log_prob = self.forward_log_prob.ln_add_exp(forward);
                }
            }
        }
    }

    /// Backward algorithm (SPEC_FULL §4.7): walks the chain in reverse.
    /// `cell.backward_log_prob` is left *exclusive* of the cell's own
    /// emission (the probability of everything after it), so that
    /// `cell.forward_log_prob + cell.backward_log_prob` is the same total
    /// path probability `hmm.forward_log_prob` for every cell in every
    /// column — the standard forward/backward invariant. The inclusive
    /// local value (exclusive + this cell's own emission) is what gets
    /// propagated to the previous merge cell and folded into the column and
    /// HMM running totals; see DESIGN.md for why this differs from the
    /// source it is grounded on.
    pub fn backward(&mut self) {
        self.reset_backward();

        let n = self.columns.len();
        for i in (0..n).rev() {
            let table = BitCountTable::build(&self.columns[i]);
            let partitions: Vec<Partition> = self.columns[i].cells.iter().map(|c| c.partition).collect();

            for partition in partitions {
                let exclusive = if i + 1 < n {
                    match self.merge_columns[i].next_merge_cell(partition) {
                        Some(mc) => mc.backward_log_prob,
                        None => continue,
                    }
                } else {
                    LogProb::ln_one()
                };

                let cell_idx = self.columns[i]
                    .cells
                    .iter()
                    .position(|c| c.partition == partition)
                    .expect("partition collected from this column's own cells");
                self.columns[i].cells[cell_idx].backward_log_prob = exclusive;

                let emission = cell_emission_log_prob(&self.columns[i], &table, partition, &self.log_sub_matrix);
                let inclusive = exclusive + emission;
                self.columns[i].backward_log_prob = self.columns[i].backward_log_prob.ln_add_exp(inclusive);

                if i > 0 {
                    if let Some(mc_idx) = self.merge_columns[i - 1].previous_merge_cell_index(partition) {
                        let prior = self.merge_columns[i - 1].cells[mc_idx].backward_log_prob;
                        self.merge_columns[i - 1].cells[mc_idx].backward_log_prob = prior.ln_add_exp(inclusive);
                    }
                } else {
                    self.backward_log_prob = self.backward_log_prob.ln_add_exp(inclusive);
                }
            }
        }
    }

    fn reset_forward(&mut self) {
        self.forward_log_prob = LogProb::ln_zero();
        for column in &mut self.columns {
            column.forward_log_prob = LogProb::ln_zero();
            for cell in &mut column.cells {
                cell.forward_log_prob = LogProb::ln_zero();
            }
        }
        for merge_column in &mut self.merge_columns {
            for cell in &mut merge_column.cells {
                cell.forward_log_prob = LogProb::ln_zero();
            }
        }
    }

    fn reset_backward(&mut self) {
        self.backward_log_prob = LogProb::ln_zero();
        for column in &mut self.columns {
            column.backward_log_prob = LogProb::ln_zero();
            for cell in &mut column.cells {
                cell.backward_log_prob = LogProb::ln_zero();
            }
        }
        for merge_column in &mut self.merge_columns {
            for cell in &mut merge_column.cells {
                cell.backward_log_prob = LogProb::ln_zero();
            }
        }
    }

    /// Drops cells and merge cells whose posterior probability falls below
    /// `posterior_probability_threshold`, for columns/merge columns at or
    /// above `min_column_depth_to_filter` (SPEC_FULL §4.8). The normalizer
    /// is the single whole-HMM total `forward_log_prob`, not a per-column
    /// combination; requires forward and backward to have already been run.
    pub fn prune(&mut self, posterior_probability_threshold: f64, min_column_depth_to_filter: usize) {
        let z = self.forward_log_prob;

        for column in self.columns.iter_mut() {
            if column.depth() < min_column_depth_to_filter {
                continue;
            }
            column.cells.retain(|cell| {
                posterior_probability(cell.forward_log_prob, cell.backward_log_prob, z)
                    >= posterior_probability_threshold
            });
        }

        for merge_column in self.merge_columns.iter_mut() {
            let depth = merge_column.mask_to.count_ones() as usize + merge_column.mask_from.count_ones() as usize
                - (merge_column.mask_from & merge_column.mask_to).count_ones() as usize;
            if depth < min_column_depth_to_filter {
                continue;
            }
            let cells = std::mem::take(&mut merge_column.cells);
            let mut rebuilt = MergeColumn::new(merge_column.mask_from, merge_column.mask_to);
            for cell in cells {
                if posterior_probability(cell.forward_log_prob, cell.backward_log_prob, z)
                    >= posterior_probability_threshold
                {
                    rebuilt.insert(cell.from_partition, cell.to_partition);
                }
            }
            *merge_column = rebuilt;
        }
    }

    /// The most probable partition path through the HMM, one cell index per
    /// column, chosen via the forward table (SPEC_FULL §4.9).
    pub fn traceback(&self) -> Result<Vec<usize>, Error> {
        let n = self.columns.len();
        if n == 0 {
            return Err(Error::EmptyHmmTraceback);
        }

        let mut path = vec![0usize; n];

        let (idx, cell) = max_forward_cell(&self.columns[n - 1].cells).ok_or(Error::EmptyHmmTraceback)?;
        path[n - 1] = idx;
        let mut current_partition = cell.partition;

        for i in (0..n - 1).rev() {
            let merge_cell_idx =
                self.merge_columns[i]
                    .previous_merge_cell_index(current_partition)
                    .ok_or_else(|| Error::PruningTooAggressive {
                        column_index: i + 1,
                        forward_total: *self.forward_log_prob,
                        backward_total: *self.backward_log_prob,
                    })?;

            let candidates: Vec<(usize, &Cell)> = self.columns[i]
                .cells
                .iter()
                .enumerate()
                .filter(|(_, cell)| {
                    self.merge_columns[i].next_merge_cell_index(cell.partition) == Some(merge_cell_idx)
                })
                .collect();
            let (idx, cell) = max_forward_cell_ref(&candidates).ok_or_else(|| Error::PruningTooAggressive {
                column_index: i,
                forward_total: *self.forward_log_prob,
                backward_total: *self.backward_log_prob,
            })?;

            path[i] = idx;
            current_partition = cell.partition;
        }

        Ok(path)
    }

    /// The set of read ids assigned to haplotype `hap` (`false` = haplotype
    /// 1, `true` = haplotype 2) by the given traceback path.
    pub fn partition_sequences_by_state_path(&self, path: &[usize], hap: bool) -> HashSet<String> {
        let mut ids = HashSet::new();
        for (column, &cell_idx) in self.columns.iter().zip(path.iter()) {
            let partition = column.cells[cell_idx].partition;
            for (slot, read) in column.reads.iter().enumerate() {
                if seq_in_hap1(partition, slot) != hap {
                    ids.insert(read.id().to_string());
                }
            }
        }
        ids
    }

    /// The two consensus haplotype strings along the traceback path: for
    /// each column, the channel with the highest bit-sliced expected count
    /// under the column's chosen partition, resp. its complement
    /// (SPEC_FULL §4.9).
    pub fn consensus_haplotypes(&self, path: &[usize]) -> (Vec<usize>, Vec<usize>) {
        let mut hap1 = Vec::new();
        let mut hap2 = Vec::new();
        for (column, &cell_idx) in self.columns.iter().zip(path.iter()) {
            let table = BitCountTable::build(column);
            let partition = column.cells[cell_idx].partition;
            let depth = column.depth();
            let complement = crate::partition::complement(partition, depth);
            for pos in 0..column.length as usize {
                hap1.push(argmax_channel(&table, partition, pos));
                hap2.push(argmax_channel(&table, complement, pos));
            }
        }
        (hap1, hap2)
    }
}

fn argmax_channel(table: &BitCountTable, partition: Partition, pos: usize) -> usize {
    (0..NUM_EMISSION_CHANNELS)
        .map(|channel| (channel, table.expected_count(partition, pos, channel)))
        .fold((0, f64::NEG_INFINITY), |best, candidate| if candidate.1 > best.1 { candidate } else { best })
        .0
}

fn posterior_probability(forward: LogProb, backward: LogProb, normalizer: LogProb) -> f64 {
    let p = (*forward + *backward - *normalizer).exp();
    p.min(1.0).max(0.0)
}

fn max_forward_cell(cells: &[Cell]) -> Option<(usize, &Cell)> {
    cells
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| (*a.forward_log_prob).partial_cmp(&*b.forward_log_prob).unwrap())
}

fn max_forward_cell_ref<'a>(cells: &[(usize, &'a Cell)]) -> Option<(usize, &'a Cell)> {
    cells
        .iter()
        .max_by(|(_, a), (_, b)| (*a.forward_log_prob).partial_cmp(&*b.forward_log_prob).unwrap())
        .map(|&(idx, cell)| (idx, cell))
}
