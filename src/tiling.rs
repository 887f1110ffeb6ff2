//! Assembling per-read HMMs into tiling paths and merging tiling paths
//! together into the final phased HMM chain (SPEC_FULL §4.10).

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::errors::Error;
use crate::hmm::Hmm;
use crate::profile::{ProfileSequence, SharedSubstitutionMatrix};

fn hmm_order(a: &Hmm, b: &Hmm) -> Ordering {
    a.reference_name.cmp(&b.reference_name).then(a.ref_start.cmp(&b.ref_start))
}

/// Partitions a set of HMMs into maximal "tiling paths": sequences of HMMs,
/// sorted by reference coordinate, that do not overlap each other. Every
/// input HMM appears in exactly one output path.
pub fn get_tiling_paths(mut hmms: Vec<Hmm>) -> Vec<Vec<Hmm>> {
    hmms.sort_by(hmm_order);
    let n = hmms.len();
    let mut slots: Vec<Option<Hmm>> = hmms.into_iter().map(Some).collect();
    let mut tiling_paths = Vec::new();

    let mut cursor = 0;
    while cursor < n {
        while cursor < n && slots[cursor].is_none() {
            cursor += 1;
        }
        if cursor >= n {
            break;
        }

        let mut path = vec![slots[cursor].take().unwrap()];
        let mut current_idx = cursor;
        loop {
            let mut next_idx = None;
            for idx in (current_idx + 1)..n {
                if let Some(candidate) = &slots[idx] {
                    let current = path.last().unwrap();
                    if current.reference_name != candidate.reference_name || !current.overlaps(candidate) {
                        next_idx = Some(idx);
                        break;
                    }
                }
            }
            match next_idx {
                Some(idx) => {
                    path.push(slots[idx].take().unwrap());
                    current_idx = idx;
                }
                None => break,
            }
        }
        tiling_paths.push(path);
    }

    tiling_paths
}

/// A connected component of mutually (transitively) overlapping HMMs drawn
/// from two tiling paths, tagged by which side each member came from.
#[derive(Debug, Default)]
struct OverlapComponent {
    from_path1: Vec<Hmm>,
    from_path2: Vec<Hmm>,
}

/// Groups two tiling paths (each internally sorted and non-overlapping) into
/// their overlap components via a merge-style interval sweep, replacing the
/// source's union-find-over-hash-table scheme: since both inputs are already
/// sorted and internally non-overlapping, a component is exactly a maximal
/// run of intervals (drawn from either side) whose reach keeps growing.
fn get_overlapping_components(path1: Vec<Hmm>, path2: Vec<Hmm>) -> Vec<OverlapComponent> {
    let mut p1: VecDeque<Hmm> = path1.into();
    let mut p2: VecDeque<Hmm> = path2.into();
    let mut components = Vec::new();

    while !p1.is_empty() || !p2.is_empty() {
        let take_from_1 = match (p1.front(), p2.front()) {
            (Some(h1), Some(h2)) => hmm_order(h1, h2) != Ordering::Greater,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => unreachable!("loop guard ensures at least one side is non-empty"),
        };

        let mut component = OverlapComponent::default();
        let seed = if take_from_1 { p1.pop_front().unwrap() } else { p2.pop_front().unwrap() };
        let reference_name = seed.reference_name.clone();
        let mut reach_end = seed.ref_end();
        if take_from_1 {
            component.from_path1.push(seed);
        } else {
            component.from_path2.push(seed);
        }

        loop {
            let extends_from_1 =
                p1.front().map_or(false, |h| h.reference_name == reference_name && h.ref_start < reach_end);
            let extends_from_2 =
                p2.front().map_or(false, |h| h.reference_name == reference_name && h.ref_start < reach_end);

            if extends_from_1 {
                let h = p1.pop_front().unwrap();
                reach_end = reach_end.max(h.ref_end());
                component.from_path1.push(h);
            } else if extends_from_2 {
                let h = p2.pop_front().unwrap();
                reach_end = reach_end.max(h.ref_end());
                component.from_path2.push(h);
            } else {
                break;
            }
        }

        components.push(component);
    }

    components
}

fn fuse_tiling_path(path: Vec<Hmm>) -> Result<Hmm, Error> {
    let mut iter = path.into_iter();
    let first = iter.next().ok_or(Error::EmptyTilingPath)?;
    iter.try_fold(first, Hmm::fuse)
}

/// Merges two tiling paths into one: HMMs that don't overlap anything on the
/// other side pass through untouched; HMMs that do are fused within each
/// side, column-aligned, cross-producted and run through forward/backward
/// and pruning (SPEC_FULL §4.10).
pub fn merge_two_tiling_paths(
    path1: Vec<Hmm>,
    path2: Vec<Hmm>,
    posterior_probability_threshold: f64,
    min_column_depth_to_filter: usize,
) -> Result<Vec<Hmm>, Error> {
    let components = get_overlapping_components(path1, path2);
    let mut merged = Vec::with_capacity(components.len());

    for component in components {
        let hmm = match (component.from_path1.is_empty(), component.from_path2.is_empty()) {
            (false, true) => fuse_tiling_path(component.from_path1)?,
            (true, false) => fuse_tiling_path(component.from_path2)?,
            (true, true) => return Err(Error::EmptyTilingPath),
            (false, false) => {
                let hmm1 = fuse_tiling_path(component.from_path1)?;
                let hmm2 = fuse_tiling_path(component.from_path2)?;
                let (hmm1, hmm2) = Hmm::align_columns(hmm1, hmm2);
                let mut hmm = Hmm::cross_product(hmm1, hmm2)?;
                hmm.forward();
                hmm.backward();
                hmm.prune(posterior_probability_threshold, min_column_depth_to_filter);
                hmm
            }
        };
        merged.push(hmm);
    }

    merged.sort_by(hmm_order);
    Ok(merged)
}

/// Recursively merges a list of tiling paths down to one, splitting the list
/// in half and recursing on each half in parallel via `rayon::join` when
/// there are more than two (SPEC_FULL §4.10).
pub fn merge_tiling_paths(
    mut tiling_paths: Vec<Vec<Hmm>>,
    posterior_probability_threshold: f64,
    min_column_depth_to_filter: usize,
) -> Result<Vec<Hmm>, Error> {
    if tiling_paths.is_empty() {
        log::warn!("zero tiling paths to merge");
        return Ok(Vec::new());
    }
    if tiling_paths.len() == 1 {
        return Ok(tiling_paths.pop().unwrap());
    }

    if tiling_paths.len() > 2 {
        let second_half = tiling_paths.split_off(tiling_paths.len() / 2);
        let first_half = tiling_paths;
        let (left, right) = rayon::join(
            || merge_tiling_paths(first_half, posterior_probability_threshold, min_column_depth_to_filter),
            || merge_tiling_paths(second_half, posterior_probability_threshold, min_column_depth_to_filter),
        );
        return merge_two_tiling_paths(left?, right?, posterior_probability_threshold, min_column_depth_to_filter);
    }

    let path2 = tiling_paths.pop().unwrap();
    let path1 = tiling_paths.pop().unwrap();
    merge_two_tiling_paths(path1, path2, posterior_probability_threshold, min_column_depth_to_filter)
}

fn profile_seqs_of(path: Vec<Hmm>) -> Vec<Arc<ProfileSequence>> {
    path.into_iter().flat_map(|hmm| hmm.profile_seqs).collect()
}

/// Splits `profile_seqs` into those that can be phased at a simultaneous
/// depth of at most `max_coverage_depth` and those that must be set aside
/// (SPEC_FULL §4.10). Reads are dropped whole tiling paths at a time, lowest
/// priority first, mirroring the source's behaviour of treating each tiling
/// path as one unit of coverage depth.
pub fn filter_reads_by_coverage_depth(
    profile_seqs: Vec<Arc<ProfileSequence>>,
    max_coverage_depth: usize,
    log_sub_matrix: &SharedSubstitutionMatrix,
) -> (Vec<Arc<ProfileSequence>>, Vec<Arc<ProfileSequence>>) {
    let hmms: Vec<Hmm> = profile_seqs
        .into_iter()
        .map(|seq| Hmm::from_profile_sequence(seq, log_sub_matrix.clone()))
        .collect();
    let mut tiling_paths = get_tiling_paths(hmms);

    let mut discarded = Vec::new();
    while tiling_paths.len() > max_coverage_depth {
        if let Some(path) = tiling_paths.pop() {
            discarded.extend(profile_seqs_of(path));
        }
    }

    let mut filtered = Vec::new();
    for path in tiling_paths {
        filtered.extend(profile_seqs_of(path));
    }

    (filtered, discarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::SubstitutionMatrix;

    fn matrix() -> SharedSubstitutionMatrix {
        Arc::new(SubstitutionMatrix::identity())
    }

    fn read(id: &str, start: i64, length: i64) -> Arc<ProfileSequence> {
        Arc::new(ProfileSequence::empty(id, "chr1", start, length as usize))
    }

    fn hmm(id: &str, start: i64, length: i64) -> Hmm {
        Hmm::from_profile_sequence(read(id, start, length), matrix())
    }

    #[test]
    fn get_tiling_paths_separates_overlapping_reads_into_distinct_paths() {
        // r1 [0,5) and r2 [2,7) overlap, so they must land on different tiling paths.
        let hmms = vec![hmm("r1", 0, 5), hmm("r2", 2, 5)];
        let paths = get_tiling_paths(hmms);
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].len(), 1);
        assert_eq!(paths[1].len(), 1);
    }

    #[test]
    fn get_tiling_paths_chains_disjoint_reads_into_one_path() {
        let hmms = vec![hmm("r1", 0, 5), hmm("r2", 5, 5), hmm("r3", 10, 5)];
        let paths = get_tiling_paths(hmms);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].len(), 3);
    }

    #[test]
    fn merge_two_tiling_paths_passes_singleton_components_through() {
        // Two entirely disjoint tiling paths: every component is one-sided.
        let path1 = vec![hmm("r1", 0, 5)];
        let path2 = vec![hmm("r2", 10, 5)];
        let merged = merge_two_tiling_paths(path1, path2, 0.01, 10).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].ref_start, 0);
        assert_eq!(merged[1].ref_start, 10);
    }

    #[test]
    fn merge_two_tiling_paths_cross_products_overlapping_components() {
        let path1 = vec![hmm("r1", 0, 5)];
        let path2 = vec![hmm("r2", 0, 5)];
        let merged = merge_two_tiling_paths(path1, path2, 0.01, 10).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].max_depth, 2);
    }

    #[test]
    fn merge_tiling_paths_recurses_over_more_than_two_paths() {
        let paths = vec![vec![hmm("r1", 0, 5)], vec![hmm("r2", 10, 5)], vec![hmm("r3", 20, 5)]];
        let merged = merge_tiling_paths(paths, 0.01, 10).unwrap();
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn merge_tiling_paths_with_zero_paths_returns_empty() {
        let merged = merge_tiling_paths(Vec::new(), 0.01, 10).unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn filter_reads_by_coverage_depth_discards_excess_tiling_paths() {
        // Three mutually overlapping reads => 3 tiling paths (depth 3); cap at 2.
        let reads = vec![read("r1", 0, 5), read("r2", 0, 5), read("r3", 0, 5)];
        let (filtered, discarded) = filter_reads_by_coverage_depth(reads, 2, &matrix());
        assert_eq!(filtered.len(), 2);
        assert_eq!(discarded.len(), 1);
    }

    #[test]
    fn filter_reads_by_coverage_depth_keeps_everything_under_the_cap() {
        let reads = vec![read("r1", 0, 5), read("r2", 5, 5)];
        let (filtered, discarded) = filter_reads_by_coverage_depth(reads, 4, &matrix());
        assert_eq!(filtered.len(), 2);
        assert!(discarded.is_empty());
    }
}
