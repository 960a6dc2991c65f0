//! Accumulator: tuple-aware "generalized addition" of adjoint contributions.
//!
//! `accumulate` merges a new partial contribution into a variable's
//! accumulated adjoint expression. Addition is elementwise on tensors and
//! structural on tuples; tuple adjoints follow a zero-until-first-write
//! policy, so untouched slots stay materialized structural zeros.

use tensor_ad_ir::{AttrValue, Attrs, Expr, StructType};

use crate::diff::emit::Emitter;
use crate::diff::store::AdjointStore;
use crate::error::{DiffError, DiffResult};

/// Structurally-zero expression for a type: `zeros(...)` calls at tensor
/// leaves under literal tuple structure.
pub(crate) fn zero_skeleton(ty: &StructType) -> Expr {
    match ty {
        StructType::Tensor { shape, dtype } => {
            let mut attrs = Attrs::new();
            attrs.insert("shape".into(), AttrValue::Shape(shape.clone()));
            attrs.insert("dtype".into(), AttrValue::DType(*dtype));
            Expr::call("zeros", Vec::new(), attrs)
        }
        StructType::Tuple(elems) => Expr::Tuple(elems.iter().map(zero_skeleton).collect()),
    }
}

/// Fold `inc` into the accumulated adjoint of `var` (typed `ty`).
///
/// The first tensor contribution is stored as-is; later contributions chain
/// through `add` with named operands, so the expression stays linear in the
/// number of uses and the emitted code carries `uses - 1` additions. Tuple
/// targets start from the zero skeleton so that rule-side structure is always
/// a literal tuple.
pub(crate) fn accumulate(
    store: &mut AdjointStore,
    em: &mut Emitter,
    var: &str,
    ty: &StructType,
    inc: Expr,
) -> DiffResult<()> {
    let next = match store.expr(var) {
        None => match ty {
            StructType::Tensor { .. } => inc,
            StructType::Tuple(_) => nested_add(zero_skeleton(ty), inc, em)?,
        },
        Some(prev) => nested_add(prev.clone(), inc, em)?,
    };
    store.set_expr(var, next)
}

/// `base + inc`, recursing through literal tuple structure and bottoming out
/// in `add` calls at tensor leaves. A zero-skeleton leaf absorbs the
/// increment directly, which keeps `+zero` chains out of the emitted code.
pub(crate) fn nested_add(base: Expr, inc: Expr, em: &mut Emitter) -> DiffResult<Expr> {
    match base {
        Expr::Tuple(base_elems) => {
            let inc_elems = tuple_parts(inc, base_elems.len(), em)?;
            let merged = base_elems
                .into_iter()
                .zip(inc_elems)
                .map(|(b, i)| nested_add(b, i, em))
                .collect::<DiffResult<Vec<_>>>()?;
            Ok(Expr::Tuple(merged))
        }
        _ if base.is_zero_leaf() => Ok(inc),
        base => {
            // keep an existing add chain as the left operand; name any other
            // pending first contribution so both operands are variables
            let lhs = match base {
                Expr::Var(_) => base,
                Expr::Call { ref op, .. } if op == "add" => base,
                pending => Expr::var(em.name_expr(pending)?),
            };
            let rhs = Expr::var(em.name_expr(inc)?);
            Ok(Expr::call("add", vec![lhs, rhs], Attrs::new()))
        }
    }
}

/// View an increment as the parts of a tuple of the given arity.
///
/// A literal tuple decomposes directly. An opaque increment (a variable, or
/// a projection of one) carries no visible structure to recurse into, so it
/// is named once and decomposed into projections of the name; the structural
/// walk then proceeds against the literal base.
fn tuple_parts(inc: Expr, arity: usize, em: &mut Emitter) -> DiffResult<Vec<Expr>> {
    match inc {
        Expr::Tuple(elems) => {
            if elems.len() != arity {
                return Err(DiffError::internal(format!(
                    "tuple adjoint arity mismatch: {} vs {}",
                    elems.len(),
                    arity
                )));
            }
            Ok(elems)
        }
        opaque => {
            let name = em.name_expr(opaque)?;
            Ok((0..arity)
                .map(|i| Expr::tuple_get(Expr::var(name.clone()), i))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensor_ad_ir::{Attrs, DType, Function, FunctionBuilder};

    fn forward() -> Function {
        let pair = StructType::Tuple(vec![
            StructType::tensor(vec![2], DType::Float32),
            StructType::scalar(DType::Float32),
        ]);
        let mut fb = FunctionBuilder::new("main");
        fb.param("x", StructType::tensor(vec![2], DType::Float32));
        fb.param("w", StructType::tensor(vec![2], DType::Float32));
        fb.param("t", pair.clone());
        fb.param("t_in", pair);
        fb.call("g", "sum", &["x"], Attrs::new()).unwrap();
        fb.finish("g").unwrap()
    }

    fn mul(a: &str, b: &str) -> Expr {
        Expr::call("multiply", vec![Expr::var(a), Expr::var(b)], Attrs::new())
    }

    fn add(a: Expr, b: Expr) -> Expr {
        Expr::call("add", vec![a, b], Attrs::new())
    }

    // ── zero skeletons ───────────────────────────────────────────────────────

    #[test]
    fn test_zero_skeleton_matches_structure() {
        let ty = StructType::Tuple(vec![
            StructType::tensor(vec![2], DType::Float32),
            StructType::Tuple(vec![StructType::scalar(DType::Float64)]),
        ]);
        let z = zero_skeleton(&ty);
        let Expr::Tuple(elems) = &z else {
            panic!("expected tuple skeleton, got {z}");
        };
        assert!(elems[0].is_zero_leaf());
        assert!(matches!(&elems[1], Expr::Tuple(inner) if inner[0].is_zero_leaf()));
    }

    // ── tensor accumulation ──────────────────────────────────────────────────

    #[test]
    fn test_first_tensor_contribution_stored_raw() {
        let f = forward();
        let mut em = Emitter::new(&f);
        let mut store = AdjointStore::new();
        let ty = StructType::tensor(vec![2], DType::Float32);

        accumulate(&mut store, &mut em, "x", &ty, mul("w", "w")).unwrap();
        assert_eq!(store.expr("x"), Some(&mul("w", "w")));
        // nothing emitted yet: the identity shortcut defers naming
        assert_eq!(em.bindings().len(), 1);
    }

    #[test]
    fn test_second_contribution_names_both_operands() {
        let f = forward();
        let mut em = Emitter::new(&f);
        let mut store = AdjointStore::new();
        let ty = StructType::tensor(vec![2], DType::Float32);

        accumulate(&mut store, &mut em, "x", &ty, mul("w", "w")).unwrap();
        accumulate(&mut store, &mut em, "x", &ty, mul("w", "x")).unwrap();
        assert_eq!(
            store.expr("x"),
            Some(&add(
                Expr::var("multiply_grad_0"),
                Expr::var("multiply_grad_1")
            ))
        );

        // a third use extends the chain without re-nesting the named leaves
        accumulate(&mut store, &mut em, "x", &ty, Expr::var("w")).unwrap();
        assert_eq!(
            store.expr("x"),
            Some(&add(
                add(Expr::var("multiply_grad_0"), Expr::var("multiply_grad_1")),
                Expr::var("w")
            ))
        );
    }

    // ── tuple accumulation ───────────────────────────────────────────────────

    #[test]
    fn test_tuple_first_contribution_fills_skeleton() {
        let f = forward();
        let mut em = Emitter::new(&f);
        let mut store = AdjointStore::new();
        let ty = f.var_type("t").unwrap().clone();

        // a literal tuple increment lands leaf-by-leaf on the zero skeleton
        let inc = Expr::Tuple(vec![mul("w", "w"), Expr::var("g")]);
        accumulate(&mut store, &mut em, "t", &ty, inc.clone()).unwrap();
        assert_eq!(store.expr("t"), Some(&inc));
    }

    #[test]
    fn test_opaque_tuple_increment_is_reified() {
        let f = forward();
        let mut em = Emitter::new(&f);
        let mut store = AdjointStore::new();
        let ty = f.var_type("t").unwrap().clone();

        let lit = Expr::Tuple(vec![mul("w", "w"), Expr::var("g")]);
        accumulate(&mut store, &mut em, "t", &ty, lit).unwrap();
        // second contribution is an opaque variable of tuple type
        accumulate(&mut store, &mut em, "t", &ty, Expr::var("t_in")).unwrap();

        let Expr::Tuple(elems) = store.expr("t").unwrap() else {
            panic!("tuple adjoint lost its structure");
        };
        // each slot became add(named_prev, t_in[i])
        for (i, slot) in elems.iter().enumerate() {
            let Expr::Call { op, args, .. } = slot else {
                panic!("slot {i} is not an add: {slot}");
            };
            assert_eq!(op, "add");
            let projected = em
                .name_expr(Expr::tuple_get(Expr::var("t_in"), i))
                .unwrap();
            assert_eq!(args[1], Expr::var(projected));
        }
    }

    #[test]
    fn test_tuple_arity_mismatch_is_internal_error() {
        let f = forward();
        let mut em = Emitter::new(&f);
        let err = nested_add(
            Expr::Tuple(vec![Expr::var("a"), Expr::var("b")]),
            Expr::Tuple(vec![Expr::var("a")]),
            &mut em,
        )
        .unwrap_err();
        assert!(matches!(err, DiffError::InternalInvariant { .. }));
    }
}
