//! The column / merge-column graph: the HMM's state space at a given
//! reference interval (`Column`) and the transition structure between
//! consecutive intervals (`MergeColumn`).

use std::collections::HashMap;
use std::sync::Arc;

use bio::stats::LogProb;

use crate::partition::{accept_mask, Partition};
use crate::profile::ProfileSequence;

/// A candidate bipartition of the reads active in a [`Column`], with its
/// forward/backward log-probabilities.
#[derive(Debug, Clone)]
pub struct Cell {
    pub partition: Partition,
    pub forward_log_prob: LogProb,
    pub backward_log_prob: LogProb,
}

impl Cell {
    pub fn new(partition: Partition) -> Self {
        Cell {
            partition,
            forward_log_prob: LogProb::ln_zero(),
            backward_log_prob: LogProb::ln_zero(),
        }
    }
}

/// A maximal reference interval over which the same set of reads are active.
/// `reads[i]` is the read occupying read-slot `i`; its bases for this
/// column's span are fetched on demand via [`ProfileSequence::probs_at`].
#[derive(Debug, Clone)]
pub struct Column {
    pub ref_start: i64,
    pub length: i64,
    pub reads: Vec<Arc<ProfileSequence>>,
    pub cells: Vec<Cell>,
    pub forward_log_prob: LogProb,
    pub backward_log_prob: LogProb,
}

impl Column {
    pub fn new(ref_start: i64, length: i64, reads: Vec<Arc<ProfileSequence>>, cells: Vec<Cell>) -> Self {
        Column {
            ref_start,
            length,
            reads,
            cells,
            forward_log_prob: LogProb::ln_zero(),
            backward_log_prob: LogProb::ln_zero(),
        }
    }

    /// A depth-0 column spanning a gap, with the single empty-partition cell.
    /// Used to bridge fuse boundaries and to pad HMMs during column-alignment.
    pub fn empty(ref_start: i64, length: i64) -> Self {
        Column::new(ref_start, length, Vec::new(), vec![Cell::new(0)])
    }

    pub fn depth(&self) -> usize {
        self.reads.len()
    }

    pub fn ref_end(&self) -> i64 {
        self.ref_start + self.length
    }

    pub fn cell(&self, partition: Partition) -> Option<&Cell> {
        self.cells.iter().find(|c| c.partition == partition)
    }

    /// Splits this column at offset `at` (`0 < at < self.length`) into a left
    /// and right half spanning the same reads, joined by an identity merge
    /// column: masks are `accept_mask(depth)` and each existing cell's
    /// partition maps to itself.
    pub fn split(self, at: i64) -> (Column, Column, MergeColumn) {
        debug_assert!(at > 0 && at < self.length);
        let mask = accept_mask(self.depth());
        let mut merge_column = MergeColumn::new(mask, mask);
        for cell in &self.cells {
            merge_column.insert(cell.partition, cell.partition);
        }
        let left = Column::new(self.ref_start, at, self.reads.clone(), self.cells.clone());
        let right = Column::new(self.ref_start + at, self.length - at, self.reads, self.cells);
        (left, right, merge_column)
    }
}

/// A candidate correspondence between a partition in the preceding column and
/// a partition in the following one.
#[derive(Debug, Clone)]
pub struct MergeCell {
    pub from_partition: Partition,
    pub to_partition: Partition,
    pub forward_log_prob: LogProb,
    pub backward_log_prob: LogProb,
}

impl MergeCell {
    pub fn new(from_partition: Partition, to_partition: Partition) -> Self {
        MergeCell {
            from_partition,
            to_partition,
            forward_log_prob: LogProb::ln_zero(),
            backward_log_prob: LogProb::ln_zero(),
        }
    }
}

/// Sits between two columns and describes which read slots carry across the
/// boundary. `mask_from` selects the bits of the left column's partitions
/// that persist into the right; `mask_to` symmetrically for the right.
/// `from_index`/`to_index` map a masked partition to its `cells` entry so
/// lookup from either side is O(1).
#[derive(Debug, Clone)]
pub struct MergeColumn {
    pub mask_from: u64,
    pub mask_to: u64,
    pub cells: Vec<MergeCell>,
    from_index: HashMap<u64, usize>,
    to_index: HashMap<u64, usize>,
}

impl MergeColumn {
    pub fn new(mask_from: u64, mask_to: u64) -> Self {
        MergeColumn {
            mask_from,
            mask_to,
            cells: Vec::new(),
            from_index: HashMap::new(),
            to_index: HashMap::new(),
        }
    }

    /// The mask-`(0, 0)` merge column with the single `(0 -> 0)` merge cell
    /// used at fuse boundaries and alignment filler, per SPEC_FULL §4.4/§4.5:
    /// the two sides share no reads, so every partition collapses to the
    /// degenerate empty partition on the other side.
    pub fn bridge() -> Self {
        let mut mc = MergeColumn::new(0, 0);
        mc.insert(0, 0);
        mc
    }

    pub fn insert(&mut self, from_partition: Partition, to_partition: Partition) {
        let idx = self.cells.len();
        self.cells.push(MergeCell::new(from_partition, to_partition));
        self.from_index.insert(from_partition & self.mask_from, idx);
        self.to_index.insert(to_partition & self.mask_to, idx);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The merge cell a cell in the preceding column with partition `p` feeds
    /// into (`mergeCellsFrom[p & maskFrom]`).
    pub fn next_merge_cell(&self, p: Partition) -> Option<&MergeCell> {
        self.from_index.get(&(p & self.mask_from)).map(|&i| &self.cells[i])
    }

    pub fn next_merge_cell_index(&self, p: Partition) -> Option<usize> {
        self.from_index.get(&(p & self.mask_from)).copied()
    }

    /// The merge cell a cell in the following column with partition `p`
    /// receives from (`mergeCellsTo[p & maskTo]`).
    pub fn previous_merge_cell(&self, p: Partition) -> Option<&MergeCell> {
        self.to_index.get(&(p & self.mask_to)).map(|&i| &self.cells[i])
    }

    pub fn previous_merge_cell_index(&self, p: Partition) -> Option<usize> {
        self.to_index.get(&(p & self.mask_to)).copied()
    }
}
