use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("attempted to fuse overlapping HMMs on {reference_name}: [{left_start}, {left_end}) and [{right_start}, {right_end})")]
    FuseOverlapping {
        reference_name: String,
        left_start: i64,
        left_end: i64,
        right_start: i64,
        right_end: i64,
    },
    #[error("attempted to fuse out-of-order HMMs on {reference_name}: left starts at {left_start}, right starts at {right_start}")]
    FuseOutOfOrder {
        reference_name: String,
        left_start: i64,
        right_start: i64,
    },
    #[error("attempted to fuse HMMs on different references: {left} and {right}")]
    FuseDifferentReferences { left: String, right: String },
    #[error("attempted cross-product of HMMs that are not column-aligned: column counts {left_columns} and {right_columns} differ")]
    NotAligned {
        left_columns: usize,
        right_columns: usize,
    },
    #[error("HMMs being combined have mismatched substitution matrices")]
    MismatchedSubstitutionMatrix,
    #[error("combined depth {combined} exceeds MAX_DEPTH ({max})")]
    DepthExceedsMaxDepth { combined: usize, max: usize },
    #[error("configured max coverage depth {configured} exceeds MAX_DEPTH ({max})")]
    CoverageDepthExceedsMaxDepth { configured: usize, max: usize },
    #[error("traceback could not find the merge cell required by the chosen next cell at column {column_index}; pruning was too aggressive (forward total {forward_total}, backward total {backward_total})")]
    PruningTooAggressive {
        column_index: usize,
        forward_total: f64,
        backward_total: f64,
    },
    #[error("traceback requested on an HMM with no columns")]
    EmptyHmmTraceback,
    #[error("posterior_probability_threshold must be in [0, 1], got {value}")]
    InvalidPosteriorProbabilityThreshold { value: f64 },
    #[error("attempted to fuse an empty tiling path")]
    EmptyTilingPath,
    #[error("failed to parse RpHmmParameters from YAML: {0}")]
    InvalidYamlConfig(String),
    #[error("failed to parse RpHmmParameters from JSON: {0}")]
    InvalidJsonConfig(String),
}
