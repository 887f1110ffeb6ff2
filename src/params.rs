//! Engine configuration: `RpHmmParameters` (SPEC_FULL §6).

use derive_builder::Builder;
use getset::Getters;
use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;
use crate::partition::MAX_DEPTH;
use crate::profile::SubstitutionMatrix;

/// Parameters controlling tiling, pruning and depth-filtering behaviour of
/// [`crate::phase`]. Constructed via the owned [`RpHmmParametersBuilder`], or
/// deserialized directly from a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, Builder)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
#[get = "pub"]
pub struct RpHmmParameters {
    /// The substitution matrix used by every HMM's emission model.
    log_sub_matrix: SubstitutionMatrix,
    /// Minimum posterior probability a cell or merge cell must retain to
    /// survive pruning.
    #[builder(default = "0.01")]
    posterior_probability_threshold: f64,
    /// Columns with depth below this are never pruned, regardless of
    /// posterior probability.
    #[builder(default = "10")]
    min_column_depth_to_filter: i64,
    /// Maximum simultaneous read depth a tiling-path merge is allowed to
    /// reach; excess tiling paths are set aside by
    /// [`crate::tiling::filter_reads_by_coverage_depth`].
    #[builder(default = "64")]
    max_coverage_depth: usize,
    /// Reads dropped by coverage-depth filtering are not discarded outright;
    /// if `true` they are scored against the final haplotypes and assigned
    /// to whichever scores higher (SPEC_FULL §4.10). If `false` they are
    /// dropped entirely.
    #[builder(default = "true")]
    assign_discarded_reads: bool,
    /// Number of passes of iterative refinement a caller performing phasing
    /// outside this core should run. Not acted on here; carried through for
    /// external collaborators that re-invoke `phase` with updated priors.
    #[builder(default = "1")]
    rounds_of_iterative_refinement: i64,
    /// Whether the external reference-prior collaborator should pre-filter
    /// likely-homozygous sites before calling `phase`. Inert pass-through:
    /// this core has no reference-prior input to act on (§6).
    #[builder(default = "false")]
    filter_likely_homozygous_sites: bool,
    /// Minimum count of the second-most-frequent base at a site for the
    /// external reference-prior collaborator to treat it as heterozygous.
    /// Inert pass-through, same rationale as `filter_likely_homozygous_sites`.
    #[builder(default = "2")]
    min_second_most_frequent_base_filter: i64,
}

impl RpHmmParameters {
    /// Loads parameters from a YAML document, the way the rest of this
    /// codebase's family loads scenario files.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| Error::InvalidYamlConfig(e.to_string()))
    }

    /// Loads parameters from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::InvalidJsonConfig(e.to_string()))
    }
}

impl RpHmmParametersBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(threshold) = self.posterior_probability_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(Error::InvalidPosteriorProbabilityThreshold { value: threshold }.to_string());
            }
        }
        if let Some(max_coverage_depth) = self.max_coverage_depth {
            if max_coverage_depth > MAX_DEPTH {
                return Err(Error::CoverageDepthExceedsMaxDepth {
                    configured: max_coverage_depth,
                    max: MAX_DEPTH,
                }
                .to_string());
            }
        }
        Ok(())
    }
}
