//! Builtin operator gradient rules.
//!
//! Each rule builds the per-argument partial expressions for one operator.
//! Partials are plain expression trees; the emitter later names their
//! subexpressions into normalized bindings. Broadcasting correctness is the
//! rule's responsibility: elementwise rules reduce their partials back to the
//! argument shape with `collapse_sum_to`, so an argument that was broadcast
//! in the forward direction receives a correctly summed adjoint.

use tensor_ad_ir::{AttrValue, Attrs, DType, Expr, StructType};

use crate::error::{DiffError, DiffResult};
use crate::registry::{GradientRegistry, RuleCtx};

fn ew(op: &str, a: Expr, b: Expr) -> Expr {
    Expr::call(op, vec![a, b], Attrs::new())
}

fn unary(op: &str, a: Expr) -> Expr {
    Expr::call(op, vec![a], Attrs::new())
}

fn neg(a: Expr) -> Expr {
    unary("negative", a)
}

fn shaped(op: &str, a: Expr, shape: &[usize]) -> Expr {
    let mut attrs = Attrs::new();
    attrs.insert("shape".into(), AttrValue::Shape(shape.to_vec()));
    Expr::call(op, vec![a], attrs)
}

/// Reduce `e` along broadcast axes down to `shape`.
fn collapse(e: Expr, shape: &[usize]) -> Expr {
    shaped("collapse_sum_to", e, shape)
}

/// Broadcast `e` up to `shape`.
fn broadcast(e: Expr, shape: &[usize]) -> Expr {
    shaped("broadcast_to", e, shape)
}

fn ones(shape: &[usize], dtype: DType) -> Expr {
    let mut attrs = Attrs::new();
    attrs.insert("shape".into(), AttrValue::Shape(shape.to_vec()));
    attrs.insert("dtype".into(), AttrValue::DType(dtype));
    Expr::call("ones", Vec::new(), attrs)
}

fn result_tensor(ctx: &RuleCtx<'_>) -> DiffResult<(Vec<usize>, DType)> {
    match ctx.result_type {
        StructType::Tensor { shape, dtype } => Ok((shape.clone(), *dtype)),
        StructType::Tuple(_) => Err(DiffError::internal(format!(
            "rule for '{}' applied to a tuple-valued call",
            ctx.op
        ))),
    }
}

fn grad_add(ctx: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    Ok(vec![
        collapse(og.clone(), ctx.arg_shape(0)?),
        collapse(og.clone(), ctx.arg_shape(1)?),
    ])
}

fn grad_subtract(ctx: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    Ok(vec![
        collapse(og.clone(), ctx.arg_shape(0)?),
        collapse(neg(og.clone()), ctx.arg_shape(1)?),
    ])
}

fn grad_multiply(ctx: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    let a = ctx.args[0].clone();
    let b = ctx.args[1].clone();
    Ok(vec![
        collapse(ew("multiply", og.clone(), b), ctx.arg_shape(0)?),
        collapse(ew("multiply", og.clone(), a), ctx.arg_shape(1)?),
    ])
}

fn grad_divide(ctx: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    let b = ctx.args[1].clone();
    let y = ctx.result.clone();
    // d/da (a / b) = 1 / b
    let da = ew("divide", og.clone(), b.clone());
    // d/db (a / b) = -a / b^2 = -y / b
    let db = neg(ew("divide", ew("multiply", og.clone(), y), b));
    Ok(vec![
        collapse(da, ctx.arg_shape(0)?),
        collapse(db, ctx.arg_shape(1)?),
    ])
}

fn grad_negative(_: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    Ok(vec![neg(og.clone())])
}

fn grad_exp(ctx: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    // d/dx exp(x) = exp(x), which the forward body already computed
    Ok(vec![ew("multiply", og.clone(), ctx.result.clone())])
}

fn grad_log(ctx: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    Ok(vec![ew("divide", og.clone(), ctx.args[0].clone())])
}

fn grad_tanh(ctx: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    let (shape, dtype) = result_tensor(ctx)?;
    let y = ctx.result.clone();
    let one_minus_y2 = ew(
        "subtract",
        ones(&shape, dtype),
        ew("multiply", y.clone(), y),
    );
    Ok(vec![ew("multiply", og.clone(), one_minus_y2)])
}

fn grad_sum(ctx: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    Ok(vec![broadcast(og.clone(), ctx.arg_shape(0)?)])
}

fn grad_broadcast_to(ctx: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    Ok(vec![collapse(og.clone(), ctx.arg_shape(0)?)])
}

fn grad_collapse_sum_to(ctx: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    Ok(vec![broadcast(og.clone(), ctx.arg_shape(0)?)])
}

fn grad_matmul(ctx: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    let a = ctx.args[0].clone();
    let b = ctx.args[1].clone();
    Ok(vec![
        ew("matmul", og.clone(), unary("transpose", b)),
        ew("matmul", unary("transpose", a), og.clone()),
    ])
}

fn grad_transpose(_: &RuleCtx<'_>, og: &Expr) -> DiffResult<Vec<Expr>> {
    Ok(vec![unary("transpose", og.clone())])
}

/// `zeros`/`ones` take no tensor arguments, so their rules return no
/// partials; registering them keeps constant-producing bindings on live
/// paths from tripping UnknownGradient.
fn grad_nullary(_: &RuleCtx<'_>, _: &Expr) -> DiffResult<Vec<Expr>> {
    Ok(Vec::new())
}

/// Install the builtin operator library rules into `registry`.
pub fn register_builtins(registry: &mut GradientRegistry) {
    registry.register("add", grad_add);
    registry.register("subtract", grad_subtract);
    registry.register("multiply", grad_multiply);
    registry.register("divide", grad_divide);
    registry.register("negative", grad_negative);
    registry.register("exp", grad_exp);
    registry.register("log", grad_log);
    registry.register("tanh", grad_tanh);
    registry.register("sum", grad_sum);
    registry.register("broadcast_to", grad_broadcast_to);
    registry.register("collapse_sum_to", grad_collapse_sum_to);
    registry.register("matmul", grad_matmul);
    registry.register("transpose", grad_transpose);
    registry.register("zeros", grad_nullary);
    registry.register("ones", grad_nullary);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor_ctx<'a>(
        op: &'a str,
        args: &'a [Expr],
        arg_types: &'a [StructType],
        result: &'a Expr,
        result_type: &'a StructType,
        attrs: &'a Attrs,
    ) -> RuleCtx<'a> {
        RuleCtx {
            op,
            args,
            attrs,
            arg_types,
            result,
            result_type,
        }
    }

    // ── shape handling ───────────────────────────────────────────────────────

    #[test]
    fn test_add_rule_collapses_to_each_argument_shape() {
        let args = vec![Expr::var("a"), Expr::var("b")];
        let arg_types = vec![
            StructType::tensor(vec![4, 5], DType::Float32),
            StructType::tensor(vec![5], DType::Float32),
        ];
        let result = Expr::var("y");
        let result_type = StructType::tensor(vec![4, 5], DType::Float32);
        let attrs = Attrs::new();
        let ctx = tensor_ctx("add", &args, &arg_types, &result, &result_type, &attrs);

        let partials = grad_add(&ctx, &Expr::var("y_adjoint")).unwrap();
        assert_eq!(
            partials[0].to_string(),
            "collapse_sum_to(y_adjoint, shape=(4, 5))"
        );
        assert_eq!(
            partials[1].to_string(),
            "collapse_sum_to(y_adjoint, shape=(5,))"
        );
    }

    #[test]
    fn test_sum_rule_broadcasts_back() {
        let args = vec![Expr::var("l")];
        let arg_types = vec![StructType::tensor(vec![5, 5], DType::Float32)];
        let result = Expr::var("g");
        let result_type = StructType::scalar(DType::Float32);
        let attrs = Attrs::new();
        let ctx = tensor_ctx("sum", &args, &arg_types, &result, &result_type, &attrs);

        let partials = grad_sum(&ctx, &Expr::var("g_adjoint")).unwrap();
        assert_eq!(
            partials[0].to_string(),
            "broadcast_to(g_adjoint, shape=(5, 5))"
        );
    }

    #[test]
    fn test_exp_rule_reuses_forward_result() {
        let args = vec![Expr::var("x")];
        let arg_types = vec![StructType::tensor(vec![3], DType::Float64)];
        let result = Expr::var("e");
        let result_type = StructType::tensor(vec![3], DType::Float64);
        let attrs = Attrs::new();
        let ctx = tensor_ctx("exp", &args, &arg_types, &result, &result_type, &attrs);

        let partials = grad_exp(&ctx, &Expr::var("e_adjoint")).unwrap();
        assert_eq!(partials[0].to_string(), "multiply(e_adjoint, e)");
    }

    #[test]
    fn test_matmul_rule_contracts_with_transposes() {
        let args = vec![Expr::var("a"), Expr::var("b")];
        let arg_types = vec![
            StructType::tensor(vec![2, 3], DType::Float32),
            StructType::tensor(vec![3, 4], DType::Float32),
        ];
        let result = Expr::var("m");
        let result_type = StructType::tensor(vec![2, 4], DType::Float32);
        let attrs = Attrs::new();
        let ctx = tensor_ctx("matmul", &args, &arg_types, &result, &result_type, &attrs);

        let partials = grad_matmul(&ctx, &Expr::var("m_adjoint")).unwrap();
        assert_eq!(partials[0].to_string(), "matmul(m_adjoint, transpose(b))");
        assert_eq!(partials[1].to_string(), "matmul(transpose(a), m_adjoint)");
    }

    #[test]
    fn test_nullary_rules_registered() {
        let r = GradientRegistry::with_builtins();
        assert!(r.contains("zeros"));
        assert!(r.contains("ones"));
    }
}
