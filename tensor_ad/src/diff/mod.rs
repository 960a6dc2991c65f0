//! Reverse-mode differentiation of straight-line dataflow functions.
//!
//! `differentiate` synthesizes, for a function computing a scalar from tensor
//! (and tuple-of-tensor) parameters, a new function in the same module whose
//! body reproduces the forward computation and additionally produces the
//! adjoints of the return value with respect to the requested parameters.
//!
//! The pass is a pure transformation: single-threaded, no I/O, all state
//! local to one invocation, and deterministic up to the fresh-name allocator.
//! The input module is never mutated.
//!
//! # Module Organization
//!
//! - `store.rs`: per-variable adjoint expression/variable tables
//! - `accum.rs`: tuple-aware generalized addition of contributions
//! - `emit.rs`: output-binding emission, fresh names, and the leaf memo
//!
//! The driver and the reverse walker live here.

mod accum;
mod emit;
mod store;

use std::collections::HashSet;

use tracing::{debug, trace};

use tensor_ad_ir::{AttrValue, Attrs, Expr, Function, Module, Param, StructType};

use crate::error::{DiffError, DiffResult};
use crate::registry::{GradientRegistry, RuleCtx, DEFAULT_REGISTRY};

use accum::{accumulate, nested_add, zero_skeleton};
use emit::Emitter;
use store::{structural_replace, AdjointStore};

/// Suffix appended to the target's name for the generated function.
pub const ADJOINT_SUFFIX: &str = "_adjoint";

/// Differentiate `target` in `module` using the builtin gradient rules.
///
/// Returns a new module containing the original functions unchanged plus a
/// function named `<target>_adjoint` that returns
/// `(original_return, (adjoint_of_p1, adjoint_of_p2, ...))` for each
/// requested parameter (all parameters, in declaration order, when
/// `require_grads` is `None`).
pub fn differentiate(
    module: &Module,
    target: &str,
    require_grads: Option<&[&str]>,
) -> DiffResult<Module> {
    differentiate_with(&DEFAULT_REGISTRY, module, target, require_grads)
}

/// `differentiate` with an explicit gradient-rule registry.
pub fn differentiate_with(
    registry: &GradientRegistry,
    module: &Module,
    target: &str,
    require_grads: Option<&[&str]>,
) -> DiffResult<Module> {
    let func = module.lookup(target).ok_or_else(|| DiffError::NotAFunction {
        name: target.to_string(),
    })?;
    validate_body(func)?;
    let ret_ty = func
        .var_type(&func.ret)
        .ok_or_else(|| unsupported(func, "return references an undefined variable"))?;
    let ret_dtype = match ret_ty {
        StructType::Tensor { shape, dtype } if shape.is_empty() && dtype.is_float() => *dtype,
        other => {
            return Err(DiffError::NonScalarReturn {
                function: func.name.clone(),
                found: other.to_string(),
            })
        }
    };
    let grad_params = resolve_require_grads(func, require_grads)?;
    debug!(
        function = %func.name,
        bindings = func.body.len(),
        grads = grad_params.len(),
        "differentiating"
    );

    let mut em = Emitter::new(func);
    let mut store = AdjointStore::new();

    // seed: d(return)/d(return) = 1
    let mut seed_attrs = Attrs::new();
    seed_attrs.insert("shape".into(), AttrValue::Shape(Vec::new()));
    seed_attrs.insert("dtype".into(), AttrValue::DType(ret_dtype));
    store.set_expr(&func.ret, Expr::call("ones", Vec::new(), seed_attrs))?;

    for binding in func.body.iter().rev() {
        walk_binding(binding, registry, &mut em, &mut store)?;
    }

    // named adjoints for the requested parameters; a parameter no use ever
    // contributed to gets the structural zero of its type
    let mut grad_vars = Vec::with_capacity(grad_params.len());
    for p in &grad_params {
        let adjoint = match store.expr(&p.name).cloned() {
            Some(expr) => em.emit_adjoint(&p.name, &p.ty, expr)?,
            None => {
                trace!(param = %p.name, "emitting structural zero adjoint");
                em.emit_adjoint(&p.name, &p.ty, zero_skeleton(&p.ty))?
            }
        };
        grad_vars.push(adjoint);
    }

    let grads_tuple = em.name_expr(Expr::Tuple(
        grad_vars.into_iter().map(Expr::Var).collect(),
    ))?;
    let result = em.name_expr(Expr::Tuple(vec![
        Expr::var(func.ret.clone()),
        Expr::var(grads_tuple),
    ]))?;

    let adjoint_fn = Function {
        name: format!("{}{}", target, ADJOINT_SUFFIX),
        params: func.params.clone(),
        body: em.finish(),
        ret: result,
    };
    let mut out = module.clone();
    out.functions.push(adjoint_fn);
    Ok(out)
}

/// One reverse-walk step: skip dead variables, name the accumulated adjoint,
/// and dispatch on the binding's value kind to push contributions upstream.
fn walk_binding(
    binding: &tensor_ad_ir::Binding,
    registry: &GradientRegistry,
    em: &mut Emitter,
    store: &mut AdjointStore,
) -> DiffResult<()> {
    if !store.has_expr(&binding.var) {
        // no downstream use contributed an adjoint: the variable is
        // irrelevant to the return, so nothing is allocated or emitted
        trace!(var = %binding.var, "skipping dead adjoint");
        return Ok(());
    }
    let adj_expr = store
        .expr(&binding.var)
        .cloned()
        .ok_or_else(|| DiffError::internal("adjoint expression vanished mid-walk"))?;
    let adjoint_var = em.emit_adjoint(&binding.var, &binding.ty, adj_expr.clone())?;
    store.set_var(&binding.var, &adjoint_var)?;
    trace!(var = %binding.var, adjoint = %adjoint_var, "named adjoint");

    match &binding.value {
        Expr::Call { op, args, attrs } => {
            let arg_types = args
                .iter()
                .map(|a| em.infer_ty(a))
                .collect::<DiffResult<Vec<_>>>()?;
            let result = Expr::var(binding.var.clone());
            let ctx = RuleCtx {
                op,
                args,
                attrs,
                arg_types: &arg_types,
                result: &result,
                result_type: &binding.ty,
            };
            let out_adjoint = Expr::var(adjoint_var);
            let partials = registry.dispatch(&ctx, &out_adjoint, &|n| em.var_type(n))?;
            for (arg, partial) in args.iter().zip(partials) {
                if let Some(x) = arg.as_var() {
                    let ty = var_type_of(em, x)?;
                    accumulate(store, em, x, &ty, partial)?;
                }
                // constants consume no adjoint slot
            }
        }
        Expr::Tuple(elems) => {
            // the named adjoint is tuple-typed; each element receives the
            // matching projection, materialized by the emitter when used
            for (i, elem) in elems.iter().enumerate() {
                if let Some(x) = elem.as_var() {
                    let ty = var_type_of(em, x)?;
                    let projected = Expr::tuple_get(Expr::var(adjoint_var.clone()), i);
                    accumulate(store, em, x, &ty, projected)?;
                }
            }
        }
        Expr::TupleGet { tuple, index } => {
            let x = tuple
                .as_var()
                .ok_or_else(|| DiffError::internal("projection of a non-variable tuple"))?;
            let ty = var_type_of(em, x)?;
            // positional fold: replace only slot `index` of the (possibly
            // zero-skeleton) tuple adjoint; sibling slots are untouched
            let base = match store.expr(x) {
                Some(existing) => existing.clone(),
                None => zero_skeleton(&ty),
            };
            let slot = match &base {
                Expr::Tuple(elems) => elems.get(*index).cloned().ok_or_else(|| {
                    DiffError::internal(format!(
                        "projection index {} out of bounds for '{}'",
                        index, x
                    ))
                })?,
                other => {
                    return Err(DiffError::internal(format!(
                        "tuple adjoint of '{}' is not a tuple expression: {}",
                        x, other
                    )))
                }
            };
            let merged = nested_add(slot, Expr::var(adjoint_var), em)?;
            let replaced = structural_replace(base, *index, merged)?;
            store.set_expr(x, replaced)?;
        }
        Expr::Var(x) => {
            // pure assignment: fold the accumulated *expression* upstream.
            // The named adjoint variable is opaque; the expression side keeps
            // tuple structure visible for the structural walk.
            let ty = var_type_of(em, x)?;
            accumulate(store, em, x, &ty, adj_expr)?;
        }
        Expr::Const(_) => {
            // constants have no input adjoints
        }
    }
    Ok(())
}

fn var_type_of(em: &Emitter, name: &str) -> DiffResult<StructType> {
    em.var_type(name)
        .ok_or_else(|| DiffError::internal(format!("variable '{}' has no recorded type", name)))
}

fn unsupported(func: &Function, reason: impl Into<String>) -> DiffError {
    DiffError::UnsupportedBody {
        function: func.name.clone(),
        reason: reason.into(),
    }
}

/// Check the single straight-line normalized-body precondition: SSA bindings,
/// operands restricted to named variables (or scalar constants), projections
/// applied directly to variables, definitions before uses.
fn validate_body(func: &Function) -> DiffResult<()> {
    let mut defined: HashSet<&str> = func.params.iter().map(|p| p.name.as_str()).collect();
    if defined.len() != func.params.len() {
        return Err(unsupported(func, "duplicate parameter name"));
    }
    for b in &func.body {
        let check_operand = |e: &Expr, what: &str| -> DiffResult<()> {
            match e {
                Expr::Var(name) if defined.contains(name.as_str()) => Ok(()),
                Expr::Var(name) => Err(unsupported(
                    func,
                    format!("binding '{}' uses undefined variable '{}'", b.var, name),
                )),
                Expr::Const(_) => Ok(()),
                nested => Err(unsupported(
                    func,
                    format!(
                        "binding '{}' has a nested {} operand '{}'; operands must be named",
                        b.var, what, nested
                    ),
                )),
            }
        };
        match &b.value {
            Expr::Var(_) | Expr::Const(_) => check_operand(&b.value, "value")?,
            Expr::Tuple(elems) => {
                for e in elems {
                    check_operand(e, "tuple")?;
                }
            }
            Expr::TupleGet { tuple, .. } => match tuple.as_ref() {
                Expr::Var(_) => check_operand(tuple, "projection")?,
                _ => {
                    return Err(unsupported(
                        func,
                        format!(
                            "binding '{}' projects a non-variable; projections must not nest",
                            b.var
                        ),
                    ))
                }
            },
            Expr::Call { args, .. } => {
                for a in args {
                    check_operand(a, "call")?;
                }
            }
        }
        if !defined.insert(b.var.as_str()) {
            return Err(unsupported(
                func,
                format!("variable '{}' is bound more than once", b.var),
            ));
        }
    }
    if !defined.contains(func.ret.as_str()) {
        return Err(unsupported(func, "return references an undefined variable"));
    }
    Ok(())
}

/// Resolve the requested gradient parameters. An explicit request must name
/// parameters with at least one floating-point leaf; when unspecified, every
/// parameter is requested in declaration order.
fn resolve_require_grads(func: &Function, names: Option<&[&str]>) -> DiffResult<Vec<Param>> {
    match names {
        None => Ok(func.params.clone()),
        Some(names) => names
            .iter()
            .map(|name| {
                let p = func
                    .params
                    .iter()
                    .find(|p| p.name == *name)
                    .ok_or_else(|| DiffError::BadRequireGrads {
                        param: (*name).to_string(),
                        reason: "not a parameter of the target function".to_string(),
                    })?;
                if !p.ty.has_float_leaf() {
                    return Err(DiffError::BadRequireGrads {
                        param: (*name).to_string(),
                        reason: format!("type {} has no floating-point leaf", p.ty),
                    });
                }
                Ok(p.clone())
            })
            .collect(),
    }
}
