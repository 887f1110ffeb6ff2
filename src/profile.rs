//! Per-read profile sequences and the reference substitution matrix.

use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

/// One position's soft-call probabilities across the 8 stored channels:
/// (A, C, G, T, methyl-C, hydroxymethyl-C, methyl-A, other). Only the first
/// four participate in emission; the rest are carried for collaborators that
/// care about modified-base calls. 255 encodes probability 1.
pub type ProfileProb = [u8; 8];

/// Number of nucleotide channels that participate in emission.
pub const NUM_EMISSION_CHANNELS: usize = 4;

/// The maximum value of a [`ProfileProb`] channel, representing probability 1.
pub const PROB_ONE: f64 = 255.0;

/// An immutable per-read array of per-position channel probabilities over
/// `[ref_start, ref_start + length)` on some reference. Shared by reference
/// (`Arc`) across every HMM column that contains one of this read's
/// positions.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSequence {
    id: String,
    reference_name: String,
    ref_start: i64,
    probs: Vec<ProfileProb>,
}

impl ProfileSequence {
    pub fn new(
        id: impl Into<String>,
        reference_name: impl Into<String>,
        ref_start: i64,
        probs: Vec<ProfileProb>,
    ) -> Self {
        ProfileSequence {
            id: id.into(),
            reference_name: reference_name.into(),
            ref_start,
            probs,
        }
    }

    /// A profile sequence with all channels at probability 0, useful in tests
    /// and as a placeholder for depth-0 bridge columns.
    pub fn empty(
        id: impl Into<String>,
        reference_name: impl Into<String>,
        ref_start: i64,
        length: usize,
    ) -> Self {
        ProfileSequence::new(id, reference_name, ref_start, vec![[0u8; 8]; length])
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn reference_name(&self) -> &str {
        &self.reference_name
    }

    pub fn ref_start(&self) -> i64 {
        self.ref_start
    }

    pub fn length(&self) -> i64 {
        self.probs.len() as i64
    }

    pub fn ref_end(&self) -> i64 {
        self.ref_start + self.length()
    }

    /// The channel probabilities at reference position `pos`, or `None` if
    /// `pos` falls outside this sequence's interval.
    pub fn probs_at(&self, pos: i64) -> Option<&ProfileProb> {
        if pos < self.ref_start || pos >= self.ref_end() {
            return None;
        }
        Some(&self.probs[(pos - self.ref_start) as usize])
    }

    pub fn overlaps(&self, reference_name: &str, start: i64, end: i64) -> bool {
        self.reference_name == reference_name && self.ref_start < end && start < self.ref_end()
    }
}

/// A 4x4 row-major log-probability substitution matrix, indexed
/// `[source * 4 + derived]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubstitutionMatrix([f64; 16]);

impl SubstitutionMatrix {
    pub fn new(values: [f64; 16]) -> Self {
        SubstitutionMatrix(values)
    }

    #[inline]
    pub fn get(&self, source: usize, derived: usize) -> f64 {
        self.0[source * NUM_EMISSION_CHANNELS + derived]
    }

    /// A matrix with log(1) on the diagonal and log(0) off it; useful as a
    /// baseline in tests.
    pub fn identity() -> Self {
        let mut values = [f64::NEG_INFINITY; 16];
        for i in 0..NUM_EMISSION_CHANNELS {
            values[i * NUM_EMISSION_CHANNELS + i] = 0.0;
        }
        SubstitutionMatrix(values)
    }
}

/// A reference-counted, read-only handle to a [`SubstitutionMatrix`], shared
/// across every HMM that is combined together so identity comparisons
/// (`Arc::ptr_eq`) can detect accidental mixing of unrelated parameter sets.
pub type SharedSubstitutionMatrix = Arc<SubstitutionMatrix>;
