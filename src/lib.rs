//! A read-partitioning hidden Markov model engine for haplotype phasing
//! (SPEC_FULL §1-§9): turns a set of per-read soft base-call profiles into
//! disjoint phased regions, each split into two haplotype read sets and a
//! pair of consensus haplotype sequences.

pub mod column;
pub mod emission;
pub mod errors;
pub mod hmm;
pub mod params;
pub mod partition;
pub mod profile;
pub mod tiling;

pub use errors::Error;
pub use hmm::Hmm;
pub use params::{RpHmmParameters, RpHmmParametersBuilder};
pub use profile::{ProfileSequence, SubstitutionMatrix};

use std::collections::HashSet;
use std::sync::Arc;

use crate::profile::{SharedSubstitutionMatrix, PROB_ONE};

/// One disjoint phased region of a reference (SPEC_FULL §6): its interval,
/// the two disjoint read-id sets assigned to each haplotype, and the
/// consensus haplotype base sequences over the interval, each given as a
/// channel index per position (0=A, 1=C, 2=G, 3=T).
#[derive(Debug, Clone, PartialEq)]
pub struct PhasedRegion {
    pub reference_name: String,
    pub ref_start: i64,
    pub ref_length: i64,
    pub hap1_read_ids: HashSet<String>,
    pub hap2_read_ids: HashSet<String>,
    pub haplotype1: Vec<usize>,
    pub haplotype2: Vec<usize>,
}

/// Phases `profile_seqs` into disjoint regions (SPEC_FULL §6). Reads that
/// would push any region's simultaneous depth past `params.max_coverage_depth`
/// are set aside by [`tiling::filter_reads_by_coverage_depth`] and, if
/// `params.assign_discarded_reads`, assigned afterwards to whichever
/// haplotype of the overlapping region scores higher.
pub fn phase(profile_seqs: Vec<Arc<ProfileSequence>>, params: &RpHmmParameters) -> Result<Vec<PhasedRegion>, Error> {
    if profile_seqs.is_empty() {
        log::warn!("phase called with zero profile sequences");
        return Ok(Vec::new());
    }

    let log_sub_matrix: SharedSubstitutionMatrix = Arc::new(*params.log_sub_matrix());
    let (filtered, discarded) =
        tiling::filter_reads_by_coverage_depth(profile_seqs, *params.max_coverage_depth(), &log_sub_matrix);

    if filtered.is_empty() {
        log::warn!("every profile sequence was discarded by coverage-depth filtering");
        return Ok(Vec::new());
    }

    let hmms: Vec<Hmm> = filtered
        .into_iter()
        .map(|seq| Hmm::from_profile_sequence(seq, log_sub_matrix.clone()))
        .collect();
    let tiling_paths = tiling::get_tiling_paths(hmms);
    let min_column_depth_to_filter = (*params.min_column_depth_to_filter()).max(0) as usize;
    let mut final_hmms = tiling::merge_tiling_paths(
        tiling_paths,
        *params.posterior_probability_threshold(),
        min_column_depth_to_filter,
    )?;
    final_hmms.sort_by(|a, b| a.reference_name.cmp(&b.reference_name).then(a.ref_start.cmp(&b.ref_start)));

    let mut regions = Vec::with_capacity(final_hmms.len());
    for mut hmm in final_hmms {
        hmm.forward();
        hmm.backward();
        hmm.prune(*params.posterior_probability_threshold(), min_column_depth_to_filter);
        // Pruning removes cells; traceback walks a fresh forward/backward pass
        // over what survives rather than the pre-prune totals (SPEC_FULL §4.8).
        hmm.forward();
        hmm.backward();

        let path = hmm.traceback()?;
        let hap1_read_ids = hmm.partition_sequences_by_state_path(&path, false);
        let hap2_read_ids = hmm.partition_sequences_by_state_path(&path, true);
        let (haplotype1, haplotype2) = hmm.consensus_haplotypes(&path);

        regions.push(PhasedRegion {
            reference_name: hmm.reference_name,
            ref_start: hmm.ref_start,
            ref_length: hmm.ref_length,
            hap1_read_ids,
            hap2_read_ids,
            haplotype1,
            haplotype2,
        });
    }

    if *params.assign_discarded_reads() {
        for read in &discarded {
            assign_discarded_read(read, &mut regions);
        }
    }

    Ok(regions)
}

/// Assigns `read` to whichever haplotype of whichever overlapping region
/// scores higher under [`score_against_haplotype`]. A read overlapping no
/// region (possible if it falls in a coverage gap between regions) is left
/// unassigned, matching the "union of outputs may be a subset of the input
/// when depth filtering drops reads with nothing to rejoin" note in §6.
fn assign_discarded_read(read: &Arc<ProfileSequence>, regions: &mut [PhasedRegion]) {
    let mut best: Option<(usize, bool, f64)> = None;

    for (idx, region) in regions.iter().enumerate() {
        if !read.overlaps(&region.reference_name, region.ref_start, region.ref_start + region.ref_length) {
            continue;
        }
        let score1 = score_against_haplotype(read, region.ref_start, &region.haplotype1);
        let score2 = score_against_haplotype(read, region.ref_start, &region.haplotype2);

        if best.map_or(true, |(_, _, s)| score1 > s) {
            best = Some((idx, false, score1));
        }
        if best.map_or(true, |(_, _, s)| score2 > s) {
            best = Some((idx, true, score2));
        }
    }

    if let Some((idx, is_hap2, _)) = best {
        if is_hap2 {
            regions[idx].hap2_read_ids.insert(read.id().to_string());
        } else {
            regions[idx].hap1_read_ids.insert(read.id().to_string());
        }
    }
}

/// The sum, over the overlap between `read` and `haplotype` (which starts at
/// `haplotype_ref_start`), of the log-probability `read`'s own profile
/// assigns to `haplotype`'s called base at each position. Floors each term's
/// probability at a small epsilon so a single zero-probability channel does
/// not veto an otherwise-matching read with `-infinity`.
fn score_against_haplotype(read: &ProfileSequence, haplotype_ref_start: i64, haplotype: &[usize]) -> f64 {
    const EPSILON: f64 = 1e-9;
    let mut score = 0.0;
    for (offset, &channel) in haplotype.iter().enumerate() {
        let pos = haplotype_ref_start + offset as i64;
        if let Some(probs) = read.probs_at(pos) {
            let p = (probs[channel] as f64 / PROB_ONE).max(EPSILON);
            score += p.ln();
        }
    }
    score
}
