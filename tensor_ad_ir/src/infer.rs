//! Structural (shape/dtype) inference for IR expressions.
//!
//! Each operator has a transfer function mapping operand structural types and
//! attributes to the result's structural type. Inference walks arbitrary
//! expression trees, so it serves both the function builder (checking forward
//! bindings at construction time) and any pass that synthesizes new bindings.

use thiserror::Error;

use crate::expr::{AttrValue, Attrs, Expr};
use crate::ty::{DType, Shape, StructType};

/// Structural inference failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferError {
    #[error("unknown operator '{op}'")]
    UnknownOperator { op: String },

    #[error("operator '{op}' expects {expected} argument(s), got {got}")]
    ArityMismatch {
        op: String,
        expected: usize,
        got: usize,
    },

    #[error("operator '{op}': operand {index} has type {found}, expected {expected}")]
    OperandMismatch {
        op: String,
        index: usize,
        expected: String,
        found: String,
    },

    #[error("operator '{op}': shapes {lhs} and {rhs} are not broadcast-compatible")]
    BroadcastMismatch { op: String, lhs: String, rhs: String },

    #[error("operator '{op}': missing or malformed attribute '{attr}'")]
    BadAttr { op: String, attr: String },

    #[error("undefined variable '{name}'")]
    UndefinedVariable { name: String },

    #[error("cannot project index {index} out of value of type {found}")]
    BadProjection { index: usize, found: String },
}

/// Right-aligned (numpy-style) broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = if da == db {
            da
        } else if da == 1 {
            db
        } else if db == 1 {
            da
        } else {
            return None;
        };
    }
    Some(out)
}

/// True if a value of shape `from` broadcasts to shape `to`.
pub fn broadcastable_to(from: &[usize], to: &[usize]) -> bool {
    matches!(broadcast_shapes(from, to), Some(s) if s == to)
}

fn shape_str(s: &[usize]) -> String {
    let dims: Vec<String> = s.iter().map(ToString::to_string).collect();
    if s.len() == 1 {
        format!("({},)", dims[0])
    } else {
        format!("({})", dims.join(", "))
    }
}

fn as_tensor<'a>(
    op: &str,
    index: usize,
    ty: &'a StructType,
) -> Result<(&'a [usize], DType), InferError> {
    match ty {
        StructType::Tensor { shape, dtype } => Ok((shape, *dtype)),
        StructType::Tuple(_) => Err(InferError::OperandMismatch {
            op: op.to_string(),
            index,
            expected: "a tensor".to_string(),
            found: ty.to_string(),
        }),
    }
}

fn expect_arity(op: &str, args: &[StructType], expected: usize) -> Result<(), InferError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(InferError::ArityMismatch {
            op: op.to_string(),
            expected,
            got: args.len(),
        })
    }
}

fn shape_attr(op: &str, attrs: &Attrs, name: &str) -> Result<Shape, InferError> {
    attrs
        .get(name)
        .and_then(AttrValue::as_shape)
        .cloned()
        .ok_or_else(|| InferError::BadAttr {
            op: op.to_string(),
            attr: name.to_string(),
        })
}

fn dtype_attr(op: &str, attrs: &Attrs, name: &str) -> Result<DType, InferError> {
    attrs
        .get(name)
        .and_then(AttrValue::as_dtype)
        .ok_or_else(|| InferError::BadAttr {
            op: op.to_string(),
            attr: name.to_string(),
        })
}

fn same_dtype(op: &str, a: DType, b: DType, index: usize) -> Result<DType, InferError> {
    if a == b {
        Ok(a)
    } else {
        Err(InferError::OperandMismatch {
            op: op.to_string(),
            index,
            expected: a.to_string(),
            found: b.to_string(),
        })
    }
}

/// Transfer function: result structural type of `op` applied to operands of
/// the given types with the given attributes.
pub fn op_result_type(
    op: &str,
    arg_types: &[StructType],
    attrs: &Attrs,
) -> Result<StructType, InferError> {
    match op {
        // elementwise binary with broadcasting
        "add" | "subtract" | "multiply" | "divide" => {
            expect_arity(op, arg_types, 2)?;
            let (sa, da) = as_tensor(op, 0, &arg_types[0])?;
            let (sb, db) = as_tensor(op, 1, &arg_types[1])?;
            let dtype = same_dtype(op, da, db, 1)?;
            let shape = broadcast_shapes(sa, sb).ok_or_else(|| InferError::BroadcastMismatch {
                op: op.to_string(),
                lhs: shape_str(sa),
                rhs: shape_str(sb),
            })?;
            Ok(StructType::Tensor { shape, dtype })
        }
        // shape-preserving unary
        "negative" => {
            expect_arity(op, arg_types, 1)?;
            let (shape, dtype) = as_tensor(op, 0, &arg_types[0])?;
            Ok(StructType::Tensor {
                shape: shape.to_vec(),
                dtype,
            })
        }
        "exp" | "log" | "tanh" => {
            expect_arity(op, arg_types, 1)?;
            let (shape, dtype) = as_tensor(op, 0, &arg_types[0])?;
            if !dtype.is_float() {
                return Err(InferError::OperandMismatch {
                    op: op.to_string(),
                    index: 0,
                    expected: "a floating-point tensor".to_string(),
                    found: arg_types[0].to_string(),
                });
            }
            Ok(StructType::Tensor {
                shape: shape.to_vec(),
                dtype,
            })
        }
        // full reduction to a scalar
        "sum" => {
            expect_arity(op, arg_types, 1)?;
            let (_, dtype) = as_tensor(op, 0, &arg_types[0])?;
            Ok(StructType::scalar(dtype))
        }
        "broadcast_to" => {
            expect_arity(op, arg_types, 1)?;
            let (shape, dtype) = as_tensor(op, 0, &arg_types[0])?;
            let target = shape_attr(op, attrs, "shape")?;
            if !broadcastable_to(shape, &target) {
                return Err(InferError::BroadcastMismatch {
                    op: op.to_string(),
                    lhs: shape_str(shape),
                    rhs: shape_str(&target),
                });
            }
            Ok(StructType::Tensor {
                shape: target,
                dtype,
            })
        }
        // sum along broadcast axes down to the target shape
        "collapse_sum_to" => {
            expect_arity(op, arg_types, 1)?;
            let (shape, dtype) = as_tensor(op, 0, &arg_types[0])?;
            let target = shape_attr(op, attrs, "shape")?;
            if !broadcastable_to(&target, shape) {
                return Err(InferError::BroadcastMismatch {
                    op: op.to_string(),
                    lhs: shape_str(&target),
                    rhs: shape_str(shape),
                });
            }
            Ok(StructType::Tensor {
                shape: target,
                dtype,
            })
        }
        "zeros" | "ones" => {
            expect_arity(op, arg_types, 0)?;
            Ok(StructType::Tensor {
                shape: shape_attr(op, attrs, "shape")?,
                dtype: dtype_attr(op, attrs, "dtype")?,
            })
        }
        "matmul" => {
            expect_arity(op, arg_types, 2)?;
            let (sa, da) = as_tensor(op, 0, &arg_types[0])?;
            let (sb, db) = as_tensor(op, 1, &arg_types[1])?;
            let dtype = same_dtype(op, da, db, 1)?;
            match (sa, sb) {
                ([m, k1], [k2, n]) if k1 == k2 => Ok(StructType::Tensor {
                    shape: vec![*m, *n],
                    dtype,
                }),
                _ => Err(InferError::OperandMismatch {
                    op: op.to_string(),
                    index: 1,
                    expected: format!("a 2-D tensor contractible with {}", shape_str(sa)),
                    found: arg_types[1].to_string(),
                }),
            }
        }
        "transpose" => {
            expect_arity(op, arg_types, 1)?;
            let (shape, dtype) = as_tensor(op, 0, &arg_types[0])?;
            match shape {
                [m, n] => Ok(StructType::Tensor {
                    shape: vec![*n, *m],
                    dtype,
                }),
                _ => Err(InferError::OperandMismatch {
                    op: op.to_string(),
                    index: 0,
                    expected: "a 2-D tensor".to_string(),
                    found: arg_types[0].to_string(),
                }),
            }
        }
        _ => Err(InferError::UnknownOperator { op: op.to_string() }),
    }
}

/// Infer the structural type of an arbitrary expression tree.
///
/// `lookup` resolves variable names to their structural types.
pub fn struct_type_of(
    expr: &Expr,
    lookup: &impl Fn(&str) -> Option<StructType>,
) -> Result<StructType, InferError> {
    match expr {
        Expr::Var(name) => lookup(name).ok_or_else(|| InferError::UndefinedVariable {
            name: name.clone(),
        }),
        Expr::Const(lit) => Ok(lit.struct_type()),
        Expr::Tuple(elems) => {
            let tys = elems
                .iter()
                .map(|e| struct_type_of(e, lookup))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(StructType::Tuple(tys))
        }
        Expr::TupleGet { tuple, index } => {
            let ty = struct_type_of(tuple, lookup)?;
            match ty {
                StructType::Tuple(mut elems) if *index < elems.len() => {
                    Ok(elems.swap_remove(*index))
                }
                other => Err(InferError::BadProjection {
                    index: *index,
                    found: other.to_string(),
                }),
            }
        }
        Expr::Call { op, args, attrs } => {
            let arg_types = args
                .iter()
                .map(|a| struct_type_of(a, lookup))
                .collect::<Result<Vec<_>, _>>()?;
            op_result_type(op, &arg_types, attrs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Literal;

    fn no_vars(_: &str) -> Option<StructType> {
        None
    }

    fn t(shape: &[usize]) -> StructType {
        StructType::tensor(shape.to_vec(), DType::Float32)
    }

    // ── broadcast helpers ────────────────────────────────────────────────────

    #[test]
    fn test_broadcast_shapes_basic() {
        assert_eq!(broadcast_shapes(&[5, 5], &[5, 5]), Some(vec![5, 5]));
        assert_eq!(broadcast_shapes(&[5, 5], &[]), Some(vec![5, 5]));
        assert_eq!(broadcast_shapes(&[5, 1], &[5]), Some(vec![5, 5]));
        assert_eq!(broadcast_shapes(&[2, 3], &[3, 2]), None);
    }

    #[test]
    fn test_broadcastable_to_is_directional() {
        assert!(broadcastable_to(&[], &[5, 5]));
        assert!(broadcastable_to(&[5], &[4, 5]));
        assert!(!broadcastable_to(&[4, 5], &[5]));
    }

    // ── operator transfer functions ──────────────────────────────────────────

    #[test]
    fn test_elementwise_broadcast_result() {
        let out = op_result_type("add", &[t(&[5, 1]), t(&[5])], &Attrs::new()).unwrap();
        assert_eq!(out, t(&[5, 5]));
    }

    #[test]
    fn test_elementwise_dtype_mismatch() {
        let a = StructType::tensor(vec![2], DType::Float32);
        let b = StructType::tensor(vec![2], DType::Float64);
        let err = op_result_type("add", &[a, b], &Attrs::new()).unwrap_err();
        assert!(matches!(err, InferError::OperandMismatch { .. }));
    }

    #[test]
    fn test_sum_reduces_to_scalar() {
        let out = op_result_type("sum", &[t(&[5, 5])], &Attrs::new()).unwrap();
        assert_eq!(out, StructType::scalar(DType::Float32));
    }

    #[test]
    fn test_zeros_from_attrs() {
        let mut attrs = Attrs::new();
        attrs.insert("shape".into(), AttrValue::Shape(vec![3, 4]));
        attrs.insert("dtype".into(), AttrValue::DType(DType::Float64));
        let out = op_result_type("zeros", &[], &attrs).unwrap();
        assert_eq!(out, StructType::tensor(vec![3, 4], DType::Float64));
    }

    #[test]
    fn test_collapse_sum_to_requires_reverse_broadcast() {
        let mut attrs = Attrs::new();
        attrs.insert("shape".into(), AttrValue::Shape(vec![5]));
        // (4, 5) can collapse to (5)
        assert!(op_result_type("collapse_sum_to", &[t(&[4, 5])], &attrs).is_ok());
        // (5) cannot collapse "up" to (4, 5)
        let mut up = Attrs::new();
        up.insert("shape".into(), AttrValue::Shape(vec![4, 5]));
        assert!(matches!(
            op_result_type("collapse_sum_to", &[t(&[5])], &up),
            Err(InferError::BroadcastMismatch { .. })
        ));
    }

    #[test]
    fn test_matmul_shapes() {
        let out = op_result_type("matmul", &[t(&[2, 3]), t(&[3, 4])], &Attrs::new()).unwrap();
        assert_eq!(out, t(&[2, 4]));
        assert!(op_result_type("matmul", &[t(&[2, 3]), t(&[4, 4])], &Attrs::new()).is_err());
    }

    #[test]
    fn test_unknown_operator() {
        let err = op_result_type("conv2d", &[], &Attrs::new()).unwrap_err();
        assert_eq!(
            err,
            InferError::UnknownOperator {
                op: "conv2d".into()
            }
        );
    }

    // ── expression-tree inference ────────────────────────────────────────────

    #[test]
    fn test_struct_type_of_nested_expr() {
        let lookup = |name: &str| match name {
            "x" => Some(t(&[2, 2])),
            "t" => Some(StructType::Tuple(vec![t(&[2, 2]), t(&[3])])),
            _ => None,
        };
        let e = Expr::call(
            "sum",
            vec![Expr::call(
                "multiply",
                vec![Expr::var("x"), Expr::tuple_get(Expr::var("t"), 0)],
                Attrs::new(),
            )],
            Attrs::new(),
        );
        assert_eq!(
            struct_type_of(&e, &lookup).unwrap(),
            StructType::scalar(DType::Float32)
        );
    }

    #[test]
    fn test_struct_type_of_undefined_variable() {
        let e = Expr::var("ghost");
        assert!(matches!(
            struct_type_of(&e, &no_vars),
            Err(InferError::UndefinedVariable { .. })
        ));
    }

    #[test]
    fn test_struct_type_of_const() {
        let e = Expr::Const(Literal::F32(2.0));
        assert_eq!(
            struct_type_of(&e, &no_vars).unwrap(),
            StructType::scalar(DType::Float32)
        );
    }

    #[test]
    fn test_projection_out_of_bounds() {
        let lookup = |name: &str| match name {
            "t" => Some(StructType::Tuple(vec![t(&[2])])),
            _ => None,
        };
        let e = Expr::tuple_get(Expr::var("t"), 3);
        assert!(matches!(
            struct_type_of(&e, &lookup),
            Err(InferError::BadProjection { .. })
        ));
    }
}
