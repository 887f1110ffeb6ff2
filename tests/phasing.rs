//! End-to-end phasing scenarios (SPEC_FULL §8, S1-S6).

use std::collections::HashSet;
use std::sync::Arc;

use rphmm::profile::{ProfileProb, ProfileSequence, SubstitutionMatrix};
use rphmm::{phase, RpHmmParametersBuilder};

/// Deterministic xorshift64* generator: these scenarios need reproducible
/// synthetic reads, not cryptographic randomness, so a hand-rolled generator
/// avoids pulling in a dependency for test fixtures alone.
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Lcg(seed | 1)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0 = self.0.wrapping_mul(0x2545_F491_4F6C_DD1D);
        self.0
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn next_channel(&mut self) -> usize {
        (self.next_u64() % 4) as usize
    }

    fn next_channel_excluding(&mut self, avoid: usize) -> usize {
        loop {
            let c = self.next_channel();
            if c != avoid {
                return c;
            }
        }
    }
}

fn hard_call(channel: usize) -> ProfileProb {
    let mut p = [0u8; 8];
    p[channel] = 255;
    p
}

/// A haplotype pair of the given length, differing at roughly `het_rate` of
/// positions.
fn build_haplotype_pair(lcg: &mut Lcg, length: usize, het_rate: f64) -> (Vec<usize>, Vec<usize>) {
    let mut hap1 = Vec::with_capacity(length);
    let mut hap2 = Vec::with_capacity(length);
    for _ in 0..length {
        let base = lcg.next_channel();
        hap1.push(base);
        if lcg.next_f64() < het_rate {
            hap2.push(lcg.next_channel_excluding(base));
        } else {
            hap2.push(base);
        }
    }
    (hap1, hap2)
}

/// A read sampled from `haplotype[ref_start..ref_start+length)`, with each
/// position independently miscalled at `error_rate`.
fn simulate_read(
    lcg: &mut Lcg,
    id: &str,
    reference_name: &str,
    haplotype: &[usize],
    ref_start: i64,
    length: usize,
    error_rate: f64,
) -> Arc<ProfileSequence> {
    let probs: Vec<ProfileProb> = (0..length)
        .map(|i| {
            let true_channel = haplotype[ref_start as usize + i];
            let observed = if lcg.next_f64() < error_rate {
                lcg.next_channel_excluding(true_channel)
            } else {
                true_channel
            };
            hard_call(observed)
        })
        .collect();
    Arc::new(ProfileSequence::new(id, reference_name, ref_start, probs))
}

/// A substitution matrix with a dominant diagonal, matching a read error rate
/// in the same ballpark as what generated the reads (so the engine's model
/// isn't fighting the data it's asked to phase).
fn error_tolerant_matrix() -> SubstitutionMatrix {
    let p_match = 0.94f64.ln();
    let p_mismatch = 0.02f64.ln();
    let mut values = [p_mismatch; 16];
    for i in 0..4 {
        values[i * 4 + i] = p_match;
    }
    SubstitutionMatrix::new(values)
}

fn precision_recall(predicted: &HashSet<String>, truth: &HashSet<String>) -> (f64, f64) {
    let true_positives = predicted.intersection(truth).count() as f64;
    let precision = if predicted.is_empty() { 1.0 } else { true_positives / predicted.len() as f64 };
    let recall = if truth.is_empty() { 1.0 } else { true_positives / truth.len() as f64 };
    (precision, recall)
}

/// S1: one reference, one haplotype pair, full-length reads split evenly
/// across both haplotypes. The predicted bipartition must recover the true
/// haplotype-of-origin split with precision and recall both > 0.9 (haplotype
/// labels are arbitrary, so the better of the two orientations is scored).
#[test]
fn s1_full_length_reads_recover_haplotype_origin() {
    let _ = env_logger::init();
    let mut lcg = Lcg::new(1);
    let (hap1, hap2) = build_haplotype_pair(&mut lcg, 1000, 0.02);

    let mut reads = Vec::new();
    let mut true_hap1 = HashSet::new();
    let mut true_hap2 = HashSet::new();
    for i in 0..10 {
        let id = format!("h1_{}", i);
        reads.push(simulate_read(&mut lcg, &id, "chr1", &hap1, 0, 1000, 0.01));
        true_hap1.insert(id);
    }
    for i in 0..10 {
        let id = format!("h2_{}", i);
        reads.push(simulate_read(&mut lcg, &id, "chr1", &hap2, 0, 1000, 0.01));
        true_hap2.insert(id);
    }

    let params = RpHmmParametersBuilder::default().log_sub_matrix(error_tolerant_matrix()).build().unwrap();
    let regions = phase(reads, &params).unwrap();
    assert_eq!(regions.len(), 1);
    let region = &regions[0];

    let (p1a, r1a) = precision_recall(&region.hap1_read_ids, &true_hap1);
    let (p2a, r2a) = precision_recall(&region.hap2_read_ids, &true_hap2);
    let straight = p1a.min(r1a).min(p2a).min(r2a);

    let (p1b, r1b) = precision_recall(&region.hap1_read_ids, &true_hap2);
    let (p2b, r2b) = precision_recall(&region.hap2_read_ids, &true_hap1);
    let crossed = p1b.min(r1b).min(p2b).min(r2b);

    assert!(straight.max(crossed) > 0.9, "straight {} crossed {}", straight, crossed);
}

/// S2: same haplotype pair, but reads shorter than the reference so the HMM
/// must tile several columns together. The engine should still converge to a
/// single region covering the whole reference with every read accounted for.
#[test]
fn s2_short_tiling_reads_still_converge_to_one_region() {
    let _ = env_logger::init();
    let mut lcg = Lcg::new(2);
    let (hap1, hap2) = build_haplotype_pair(&mut lcg, 1000, 0.02);

    let mut reads = Vec::new();
    for i in 0..10 {
        let start = (i * 90) as i64;
        reads.push(simulate_read(&mut lcg, &format!("h1_{}", i), "chr1", &hap1, start, 100, 0.01));
    }
    for i in 0..10 {
        let start = (i * 90) as i64;
        reads.push(simulate_read(&mut lcg, &format!("h2_{}", i), "chr1", &hap2, start, 100, 0.01));
    }

    let params = RpHmmParametersBuilder::default().log_sub_matrix(error_tolerant_matrix()).build().unwrap();
    let regions = phase(reads, &params).unwrap();
    assert_eq!(regions.len(), 1);
    let region = &regions[0];
    assert_eq!(region.ref_start, 0);
    assert_eq!(region.hap1_read_ids.len() + region.hap2_read_ids.len(), 20);
}

/// S3: variable read lengths at moderate coverage. No region may exceed
/// `MAX_DEPTH`, and every input read must appear in exactly one output set.
#[test]
fn s3_variable_length_reads_stay_under_max_depth_and_account_for_every_read() {
    use rphmm::partition::MAX_DEPTH;

    let _ = env_logger::init();
    let mut lcg = Lcg::new(3);
    let (hap1, hap2) = build_haplotype_pair(&mut lcg, 500, 0.02);

    let mut reads = Vec::new();
    let mut all_ids = HashSet::new();
    for i in 0..20 {
        let length = 10 + (lcg.next_u64() % 291) as usize;
        let max_start = 500 - length as i64;
        let start = (lcg.next_u64() % (max_start as u64 + 1)) as i64;
        let haplotype = if i % 2 == 0 { &hap1 } else { &hap2 };
        let id = format!("r{}", i);
        reads.push(simulate_read(&mut lcg, &id, "chr1", haplotype, start, length, 0.01));
        all_ids.insert(id);
    }

    let params = RpHmmParametersBuilder::default().log_sub_matrix(error_tolerant_matrix()).build().unwrap();
    let regions = phase(reads, &params).unwrap();

    let mut seen_ids = HashSet::new();
    for region in &regions {
        assert!(region.hap1_read_ids.len() <= MAX_DEPTH);
        assert!(region.hap2_read_ids.len() <= MAX_DEPTH);
        seen_ids.extend(region.hap1_read_ids.iter().cloned());
        seen_ids.extend(region.hap2_read_ids.iter().cloned());
    }
    assert_eq!(seen_ids, all_ids);
}

/// S4: several independent references. Each reference's reads form their own
/// connected region; no region mixes reads from two references.
#[test]
fn s4_multiple_references_produce_one_region_each() {
    let _ = env_logger::init();
    let mut lcg = Lcg::new(4);
    let references = ["chr1", "chr2", "chr3"];
    let mut reads = Vec::new();

    for reference_name in &references {
        let (hap1, hap2) = build_haplotype_pair(&mut lcg, 300, 0.02);
        for i in 0..5 {
            reads.push(simulate_read(&mut lcg, &format!("{}_h1_{}", reference_name, i), reference_name, &hap1, 0, 300, 0.01));
            reads.push(simulate_read(&mut lcg, &format!("{}_h2_{}", reference_name, i), reference_name, &hap2, 0, 300, 0.01));
        }
    }

    let params = RpHmmParametersBuilder::default().log_sub_matrix(error_tolerant_matrix()).build().unwrap();
    let regions = phase(reads, &params).unwrap();

    assert_eq!(regions.len(), references.len());
    let region_references: HashSet<&str> = regions.iter().map(|r| r.reference_name.as_str()).collect();
    for reference_name in &references {
        assert!(region_references.contains(reference_name));
    }
    for region in &regions {
        for id in region.hap1_read_ids.iter().chain(region.hap2_read_ids.iter()) {
            assert!(id.starts_with(region.reference_name.as_str()));
        }
    }
}

/// S5: two single-read HMMs overlapping by 50%, aligned and cross-producted
/// directly (bypassing the tiling driver) to check the column geometry.
#[test]
fn s5_fifty_percent_overlap_produces_three_columns_of_expected_depth() {
    use rphmm::Hmm;

    let _ = env_logger::init();
    let matrix = Arc::new(SubstitutionMatrix::identity());
    let read1 = Arc::new(ProfileSequence::new("r1", "chr1", 0, vec![hard_call(0); 4]));
    let read2 = Arc::new(ProfileSequence::new("r2", "chr1", 2, vec![hard_call(1); 4]));

    let hmm1 = Hmm::from_profile_sequence(read1, matrix.clone());
    let hmm2 = Hmm::from_profile_sequence(read2, matrix);
    let (hmm1, hmm2) = Hmm::align_columns(hmm1, hmm2);

    assert_eq!(hmm1.column_number(), 3);
    assert_eq!(hmm2.column_number(), 3);
    assert_eq!(hmm1.columns[0].length, 2);
    assert_eq!(hmm1.columns[1].length, 2);
    assert_eq!(hmm1.columns[2].length, 2);
    assert_eq!(hmm1.columns[0].depth(), 1);
    assert_eq!(hmm1.columns[1].depth(), 1);
    assert_eq!(hmm2.columns[1].depth(), 1);
    assert_eq!(hmm1.columns[2].depth(), 0);
    assert_eq!(hmm2.columns[0].depth(), 0);

    let product = Hmm::cross_product(hmm1, hmm2).unwrap();
    assert_eq!(product.columns[1].depth(), 2);
    assert_eq!(product.max_depth, 2);
}

/// S6: empty input phases to an empty output, without error.
#[test]
fn s6_empty_input_produces_empty_output() {
    let _ = env_logger::init();
    let params = RpHmmParametersBuilder::default().log_sub_matrix(SubstitutionMatrix::identity()).build().unwrap();
    let regions = phase(Vec::new(), &params).unwrap();
    assert!(regions.is_empty());
}
