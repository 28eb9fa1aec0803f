//! Error types for flat model transformations.
//!
//! Every structural failure surfaces as an [`OcpError`]; none of them are
//! transient, so callers are expected to report rather than retry.

use thiserror::Error;

/// Result type alias for flat model operations.
pub type Result<T> = std::result::Result<T, OcpError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OcpError {
    /// A variable with this name is already registered.
    #[error("variable \"{0}\" has already been added")]
    DuplicateVariable(String),

    /// No variable with this name is registered.
    #[error("no such variable: \"{0}\"")]
    UnknownVariable(String),

    /// Paired vectors disagree in length, or a vector argument is malformed.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Block-triangular decomposition requires as many equations as unknowns.
    #[error("non-square Jacobian sparsity: {rows} equations, {cols} unknowns")]
    NonSquareJacobian { rows: usize, cols: usize },

    /// The unknowns of a diagonal block do not enter its equations affinely.
    #[error("cannot find an explicit expression for variable(s) {0:?}")]
    UnsolvableBlock(Vec<String>),

    /// An elimination left a structural dependency on the eliminated symbols.
    #[error("{0}: equations still depend on eliminated symbols")]
    ResidualDependency(String),

    /// `make_explicit` finished with algebraic variables still implicit.
    #[error("failed to eliminate algebraic variables {0:?}")]
    UnresolvedAlgebraicVariables(Vec<String>),

    /// Ingestion met a construct it does not handle.
    #[error("unsupported construct: {0}")]
    UnsupportedConstruct(String),

    /// A role vector holds something other than a leaf symbol.
    #[error("non-symbolic {0}")]
    NonSymbolic(String),

    /// Rescaling cannot divide by a zero nominal value.
    #[error("variable \"{0}\" has a zero nominal value")]
    ZeroNominal(String),

    #[error("mixed units in {0:?}")]
    MixedUnits(Vec<String>),

    #[error("parse error: {0}")]
    Parse(String),
}
