//! Error kinds for the differentiation pass.
//!
//! All failures are synchronous and fatal to a single `differentiate` call;
//! no partial output is produced and the input module is never mutated.

use tensor_ad_ir::InferError;
use thiserror::Error;

/// Failure of one invocation of the differentiation pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    /// The target name does not name a function in the module.
    #[error("no function named '{name}' in module")]
    NotAFunction { name: String },

    /// The body is not a normalized straight-line block.
    #[error("function '{function}' cannot be differentiated: {reason}")]
    UnsupportedBody { function: String, reason: String },

    /// The return value is not a scalar tensor of floating dtype.
    #[error("function '{function}' must return a scalar floating-point tensor, found {found}")]
    NonScalarReturn { function: String, found: String },

    /// A requested gradient variable is not a differentiable parameter.
    #[error("cannot take the gradient with respect to '{param}': {reason}")]
    BadRequireGrads { param: String, reason: String },

    /// An operator with a live adjoint has no registered gradient rule.
    #[error("no gradient rule registered for operator '{op}'")]
    UnknownGradient { op: String },

    /// A gradient rule returned a partial whose structural type differs from
    /// the corresponding argument's.
    #[error(
        "gradient rule for '{op}' returned a partial of type {found} \
         for argument {index} of type {expected}"
    )]
    GradientShapeMismatch {
        op: String,
        index: usize,
        expected: String,
        found: String,
    },

    /// An internal invariant failed; indicates a bug in the pass or in a
    /// registered gradient rule.
    #[error("internal invariant violated: {message}")]
    InternalInvariant { message: String },

    /// Structural inference failed on a synthesized binding.
    #[error(transparent)]
    Infer(#[from] InferError),
}

pub type DiffResult<T> = Result<T, DiffError>;

impl DiffError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::InternalInvariant {
            message: message.into(),
        }
    }
}
