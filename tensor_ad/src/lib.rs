//! tensor_ad
//!
//! Reverse-mode automatic differentiation over a straight-line tensor
//! dataflow IR. Given a function computing a scalar from tensor (and
//! tuple-of-tensor) parameters, the pass synthesizes a sibling function that
//! reproduces the forward computation and additionally returns the adjoints
//! of the result with respect to a chosen subset of the parameters.
//!
//! Per-operator gradient rules are an extension point: the pass consumes a
//! [`GradientRegistry`] and ships a builtin rule library for the standard
//! operator set. Everything an adjoint body computes flows through named
//! variables, multi-use accumulations coalesce into `add` chains, and dead
//! adjoints are never materialized.
//!
//! # Example
//!
//! ```
//! use tensor_ad::differentiate;
//! use tensor_ad_ir::{Attrs, DType, FunctionBuilder, Module, StructType};
//!
//! let mut fb = FunctionBuilder::new("main");
//! fb.param("x", StructType::tensor(vec![5, 5], DType::Float32));
//! fb.param("y", StructType::tensor(vec![5, 5], DType::Float32));
//! fb.call("l", "add", &["x", "y"], Attrs::new()).unwrap();
//! fb.call("g", "sum", &["l"], Attrs::new()).unwrap();
//! let module = Module::new(vec![fb.finish("g").unwrap()]);
//!
//! let out = differentiate(&module, "main", None).unwrap();
//! let grad_fn = out.lookup("main_adjoint").unwrap();
//! assert_eq!(grad_fn.params.len(), 2);
//! ```

pub mod api;
pub mod error;
pub mod eval;
pub mod registry;
pub mod rules;

mod diff;

// Re-exports
pub use api::differentiate_json_str;
pub use diff::{differentiate, differentiate_with, ADJOINT_SUFFIX};
pub use error::{DiffError, DiffResult};
pub use eval::{eval_function, EvalError, Tensor, Value};
pub use registry::{GradientFn, GradientRegistry, RuleCtx};
