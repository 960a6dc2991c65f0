//! Emitter: the single point where output bindings and fresh names are made.
//!
//! The emitter owns the output body (seeded with the forward bindings copied
//! verbatim), the variable-type environment, and the expression→variable
//! memo. Emission order follows the reverse walker's visit order, so every
//! adjoint variable is defined before any later emission references it; no
//! topological sort is needed.

use std::collections::HashMap;

use tensor_ad_ir::{struct_type_of, Binding, Expr, Function, StructType};

use crate::error::{DiffError, DiffResult};

#[derive(Debug)]
pub(crate) struct Emitter {
    body: Vec<Binding>,
    types: HashMap<String, StructType>,
    memo: HashMap<Expr, String>,
    anon_counters: HashMap<String, u32>,
}

impl Emitter {
    /// Start from a copy of the forward function's bindings.
    pub fn new(forward: &Function) -> Self {
        let mut types = HashMap::new();
        for p in &forward.params {
            types.insert(p.name.clone(), p.ty.clone());
        }
        for b in &forward.body {
            types.insert(b.var.clone(), b.ty.clone());
        }
        Self {
            body: forward.body.clone(),
            types,
            memo: HashMap::new(),
            anon_counters: HashMap::new(),
        }
    }

    /// Structural type of a parameter, forward variable, or emitted adjoint.
    pub fn var_type(&self, name: &str) -> Option<StructType> {
        self.types.get(name).cloned()
    }

    /// Run structural inference against the emitter's type environment.
    pub fn infer_ty(&self, expr: &Expr) -> DiffResult<StructType> {
        struct_type_of(expr, &|n| self.var_type(n)).map_err(DiffError::from)
    }

    fn push(&mut self, var: String, ty: StructType, value: Expr) {
        self.types.insert(var.clone(), ty.clone());
        self.body.push(Binding { var, ty, value });
    }

    /// `base` if unused, else `base_2`, `base_3`, ...
    fn fresh_name(&mut self, base: &str) -> String {
        if !self.types.contains_key(base) {
            return base.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}_{}", base, n);
            if !self.types.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Fresh name for an anonymous adjoint intermediate: `<kind>_grad_<n>`.
    fn fresh_anon(&mut self, kind: &str) -> String {
        loop {
            let counter = self.anon_counters.entry(kind.to_string()).or_insert(0);
            let candidate = format!("{}_grad_{}", kind, *counter);
            *counter += 1;
            if !self.types.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Rewrite `expr` so that every call/tuple operand and projection target
    /// is a variable reference or constant, naming nested subexpressions.
    fn flatten(&mut self, expr: Expr) -> DiffResult<Expr> {
        Ok(match expr {
            Expr::Var(_) | Expr::Const(_) => expr,
            Expr::Tuple(elems) => Expr::Tuple(
                elems
                    .into_iter()
                    .map(|e| self.operand(e))
                    .collect::<DiffResult<_>>()?,
            ),
            Expr::TupleGet { tuple, index } => Expr::TupleGet {
                tuple: Box::new(self.operand(*tuple)?),
                index,
            },
            Expr::Call { op, args, attrs } => Expr::Call {
                op,
                args: args
                    .into_iter()
                    .map(|e| self.operand(e))
                    .collect::<DiffResult<_>>()?,
                attrs,
            },
        })
    }

    fn operand(&mut self, expr: Expr) -> DiffResult<Expr> {
        match expr {
            Expr::Var(_) | Expr::Const(_) => Ok(expr),
            nested => Ok(Expr::var(self.name_expr(nested)?)),
        }
    }

    /// Name an adjoint subexpression: return the existing variable when the
    /// (flattened) expression was already emitted, otherwise emit a fresh
    /// anonymous binding for it. Leaves of accumulated adjoint expressions
    /// stay variables, which keeps an n-use accumulation linear instead of
    /// re-nesting the prior term on every update.
    pub fn name_expr(&mut self, expr: Expr) -> DiffResult<String> {
        let flat = match expr {
            Expr::Var(name) => return Ok(name),
            other => self.flatten(other)?,
        };
        if let Some(existing) = self.memo.get(&flat) {
            return Ok(existing.clone());
        }
        let ty = self.infer_ty(&flat)?;
        let name = self.fresh_anon(anon_kind(&flat));
        self.push(name.clone(), ty, flat.clone());
        self.memo.insert(flat, name.clone());
        Ok(name)
    }

    /// Emit the named adjoint binding for original variable `orig`. The
    /// binding always gets its own `<orig>_adjoint` variable (a repeated
    /// expression is recorded in the memo but not aliased away; full
    /// cross-binding CSE is a downstream concern).
    pub fn emit_adjoint(
        &mut self,
        orig: &str,
        ty: &StructType,
        expr: Expr,
    ) -> DiffResult<String> {
        let flat = self.flatten(expr)?;
        let inferred = self.infer_ty(&flat)?;
        if &inferred != ty {
            return Err(DiffError::internal(format!(
                "adjoint of '{}' has type {}, expected {}",
                orig, inferred, ty
            )));
        }
        let base = format!("{}_adjoint", orig);
        let name = self.fresh_name(&base);
        self.push(name.clone(), ty.clone(), flat.clone());
        self.memo.entry(flat).or_insert_with(|| name.clone());
        Ok(name)
    }

    pub fn finish(self) -> Vec<Binding> {
        self.body
    }

    #[cfg(test)]
    pub fn bindings(&self) -> &[Binding] {
        &self.body
    }
}

fn anon_kind(expr: &Expr) -> &str {
    match expr {
        Expr::Call { op, .. } => op,
        Expr::Tuple(_) => "tuple",
        Expr::TupleGet { .. } => "proj",
        Expr::Var(_) | Expr::Const(_) => "value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensor_ad_ir::{Attrs, DType, FunctionBuilder};

    fn forward() -> Function {
        let mut fb = FunctionBuilder::new("main");
        fb.param("x", StructType::tensor(vec![2, 2], DType::Float32));
        fb.call("g", "sum", &["x"], Attrs::new()).unwrap();
        fb.finish("g").unwrap()
    }

    fn mul(a: &str, b: &str) -> Expr {
        Expr::call("multiply", vec![Expr::var(a), Expr::var(b)], Attrs::new())
    }

    // ── naming and memoization ───────────────────────────────────────────────

    #[test]
    fn test_name_expr_returns_var_unchanged() {
        let mut em = Emitter::new(&forward());
        assert_eq!(em.name_expr(Expr::var("x")).unwrap(), "x");
        assert_eq!(em.bindings().len(), 1);
    }

    #[test]
    fn test_name_expr_emits_once_per_distinct_expr() {
        let mut em = Emitter::new(&forward());
        let first = em.name_expr(mul("x", "x")).unwrap();
        let second = em.name_expr(mul("x", "x")).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "multiply_grad_0");
        // forward binding plus exactly one emitted intermediate
        assert_eq!(em.bindings().len(), 2);
    }

    #[test]
    fn test_flatten_names_nested_operands() {
        let mut em = Emitter::new(&forward());
        let nested = Expr::call(
            "multiply",
            vec![mul("x", "x"), Expr::var("x")],
            Attrs::new(),
        );
        let name = em.name_expr(nested).unwrap();
        assert_eq!(name, "multiply_grad_1");
        let bindings = em.bindings();
        assert_eq!(bindings[1].var, "multiply_grad_0");
        assert_eq!(bindings[1].value, mul("x", "x"));
        assert_eq!(bindings[2].value, mul("multiply_grad_0", "x"));
    }

    #[test]
    fn test_emit_adjoint_checks_structural_type() {
        let mut em = Emitter::new(&forward());
        let scalar = StructType::scalar(DType::Float32);
        let err = em.emit_adjoint("g", &scalar, mul("x", "x")).unwrap_err();
        assert!(matches!(err, DiffError::InternalInvariant { .. }));
    }

    #[test]
    fn test_emit_adjoint_does_not_alias_duplicates() {
        let mut em = Emitter::new(&forward());
        let ty = StructType::tensor(vec![2, 2], DType::Float32);
        let a = em.emit_adjoint("u", &ty, mul("x", "x")).unwrap();
        let b = em.emit_adjoint("v", &ty, mul("x", "x")).unwrap();
        assert_eq!(a, "u_adjoint");
        assert_eq!(b, "v_adjoint");
        // both bindings carry the full expression; the memo only aliases
        // anonymous leaf naming
        assert_eq!(em.bindings()[2].value, mul("x", "x"));
        assert_eq!(em.bindings()[3].value, mul("x", "x"));
        // and later leaf naming reuses the first named adjoint
        assert_eq!(em.name_expr(mul("x", "x")).unwrap(), "u_adjoint");
    }

    #[test]
    fn test_fresh_name_avoids_collisions() {
        let mut fb = FunctionBuilder::new("main");
        fb.param("x", StructType::scalar(DType::Float32));
        fb.assign("x_adjoint", "x").unwrap();
        let f = fb.finish("x_adjoint").unwrap();

        let mut em = Emitter::new(&f);
        let ty = StructType::scalar(DType::Float32);
        let name = em.emit_adjoint("x", &ty, Expr::var("x_adjoint")).unwrap();
        assert_eq!(name, "x_adjoint_2");
    }
}
