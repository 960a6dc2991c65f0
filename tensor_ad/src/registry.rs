//! Gradient-rule registry and dispatch.
//!
//! The registry maps operator identity to a pure expression-building rule.
//! Rules never emit bindings and carry no state; the pass invokes them with
//! the forward call and the named adjoint of its result, and folds the
//! returned per-argument partials into the adjoint store. The registry is
//! read-only for the duration of a pass invocation.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use tensor_ad_ir::{struct_type_of, Attrs, Expr, StructType};

use crate::error::{DiffError, DiffResult};
use crate::rules;

/// The forward call a gradient rule differentiates, with the structural
/// types the rule needs to build shape-correct partials.
#[derive(Debug)]
pub struct RuleCtx<'a> {
    /// Operator name of the forward call.
    pub op: &'a str,
    /// Forward call arguments (variable references or scalar constants).
    pub args: &'a [Expr],
    /// Forward call attributes.
    pub attrs: &'a Attrs,
    /// Structural type of each forward argument.
    pub arg_types: &'a [StructType],
    /// Variable reference to the forward result. Rules like `exp` and
    /// `divide` reuse the forward value instead of recomputing it.
    pub result: &'a Expr,
    /// Structural type of the forward result.
    pub result_type: &'a StructType,
}

impl RuleCtx<'_> {
    /// Tensor shape of argument `i`. Rules for tensor operators may rely on
    /// the forward code having been type-checked before the walk.
    pub fn arg_shape(&self, i: usize) -> DiffResult<&[usize]> {
        match self.arg_types.get(i) {
            Some(StructType::Tensor { shape, .. }) => Ok(shape),
            Some(other) => Err(DiffError::internal(format!(
                "rule for '{}' expected argument {} to be a tensor, found {}",
                self.op, i, other
            ))),
            None => Err(DiffError::internal(format!(
                "rule for '{}' asked for argument {} of {}",
                self.op,
                i,
                self.args.len()
            ))),
        }
    }
}

/// A per-operator gradient rule: one partial expression per forward argument,
/// each with the structural type of the corresponding argument.
pub type GradientFn = fn(&RuleCtx<'_>, &Expr) -> DiffResult<Vec<Expr>>;

/// Associative map from operator identity to gradient rule.
#[derive(Debug, Clone, Default)]
pub struct GradientRegistry {
    rules: HashMap<String, GradientFn>,
}

impl GradientRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the builtin operator library rules.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        rules::register_builtins(&mut registry);
        registry
    }

    /// Register (or replace) the rule for `op`. Returns the previous rule.
    pub fn register(&mut self, op: impl Into<String>, rule: GradientFn) -> Option<GradientFn> {
        self.rules.insert(op.into(), rule)
    }

    pub fn contains(&self, op: &str) -> bool {
        self.rules.contains_key(op)
    }

    /// Invoke the rule for `ctx.op` and validate its output: one partial per
    /// argument, each structurally typed like the argument it differentiates.
    /// Partials for constant arguments are not validated (they are discarded
    /// by the caller; constants consume no adjoint slot).
    pub(crate) fn dispatch(
        &self,
        ctx: &RuleCtx<'_>,
        out_adjoint: &Expr,
        lookup: &impl Fn(&str) -> Option<StructType>,
    ) -> DiffResult<Vec<Expr>> {
        let rule = self
            .rules
            .get(ctx.op)
            .ok_or_else(|| DiffError::UnknownGradient {
                op: ctx.op.to_string(),
            })?;
        let partials = rule(ctx, out_adjoint)?;
        if partials.len() != ctx.args.len() {
            return Err(DiffError::internal(format!(
                "rule for '{}' returned {} partial(s) for {} argument(s)",
                ctx.op,
                partials.len(),
                ctx.args.len()
            )));
        }
        for (i, (partial, arg)) in partials.iter().zip(ctx.args).enumerate() {
            if arg.is_const() {
                continue;
            }
            let found = struct_type_of(partial, lookup)?;
            let expected = &ctx.arg_types[i];
            if &found != expected {
                return Err(DiffError::GradientShapeMismatch {
                    op: ctx.op.to_string(),
                    index: i,
                    expected: expected.to_string(),
                    found: found.to_string(),
                });
            }
        }
        Ok(partials)
    }
}

/// Shared read-only registry holding the builtin rules; used by the plain
/// `differentiate` entry point. Callers with custom operators build their
/// own registry and go through `differentiate_with`.
pub(crate) static DEFAULT_REGISTRY: Lazy<GradientRegistry> =
    Lazy::new(GradientRegistry::with_builtins);
