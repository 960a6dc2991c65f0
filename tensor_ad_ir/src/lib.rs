//! tensor_ad_ir
//!
//! A statically-typed, tensor-oriented dataflow IR: straight-line functions
//! of single-assignment bindings over tensor and tuple-of-tensor values.
//!
//! The crate provides the node kinds themselves, structural (shape/dtype)
//! inference with per-operator transfer functions, a builder that produces
//! normalized functions, a stable text form, and a JSON wire form.
//!
//! # Example
//!
//! ```
//! use tensor_ad_ir::{Attrs, DType, FunctionBuilder, StructType};
//!
//! let mut fb = FunctionBuilder::new("main");
//! fb.param("x", StructType::tensor(vec![5, 5], DType::Float32));
//! fb.param("y", StructType::tensor(vec![5, 5], DType::Float32));
//! fb.call("l", "add", &["x", "y"], Attrs::new()).unwrap();
//! fb.call("g", "sum", &["l"], Attrs::new()).unwrap();
//! let f = fb.finish("g").unwrap();
//!
//! assert_eq!(f.var_type("g"), Some(&StructType::scalar(DType::Float32)));
//! ```

pub mod builder;
pub mod expr;
pub mod infer;
pub mod printer;
pub mod ty;

// Re-exports
pub use builder::FunctionBuilder;
pub use expr::{AttrValue, Attrs, Binding, Expr, Function, Literal, Module, Param};
pub use infer::{broadcast_shapes, broadcastable_to, op_result_type, struct_type_of, InferError};
pub use ty::{DType, Shape, StructType};
