//! Error taxonomy for tree construction and integration.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TtnError>;

#[derive(Debug, Error)]
pub enum TtnError {
    /// `n`, `binsize` and `liml` of a grid differ in length.
    #[error("grid arrays must be of equal length (n: {n}, binsize: {binsize}, liml: {liml})")]
    GridLength { n: usize, binsize: usize, liml: usize },

    /// A species has zero grid points.
    #[error("grid size must be larger than 0 (species {0})")]
    EmptyGrid(usize),

    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    /// The per-level rank vector does not match the depth of the partition.
    #[error("expected {expected} rank levels, got {found}")]
    RankLevels { expected: usize, found: usize },

    /// A depth level of the partition was given rank zero.
    #[error("rank of depth level {0} must be positive")]
    ZeroRank(usize),

    #[error("rank mismatch at node {node}: expected {expected}, found {found}")]
    RankMismatch {
        node: String,
        expected: usize,
        found: usize,
    },

    #[error("dimension mismatch at node {node}: expected {expected}, found {found}")]
    DimensionMismatch {
        node: String,
        expected: usize,
        found: usize,
    },

    #[error("species mismatch: {0}")]
    SpeciesMismatch(String),

    #[error("reaction {reaction}: {reason}")]
    InvalidReaction { reaction: String, reason: String },

    /// The tree integrator needs propensities that factor over species.
    #[error("reaction {0} has a non-separable propensity")]
    NonSeparablePropensity(String),

    #[error("cannot orthogonalize {columns} columns in a space of dimension {dimension}")]
    RankExceedsDimension { columns: usize, dimension: usize },

    #[error("non-finite value encountered during orthogonalization")]
    NonFinite,

    #[error("unknown integration method `{0}`")]
    UnknownMethod(String),
}
