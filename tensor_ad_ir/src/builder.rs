//! Incremental construction of normalized functions.
//!
//! The builder only accepts variable names as operands, so every function it
//! produces is in normal form by construction: call and tuple operands are
//! variable references, projections apply directly to variables, and each
//! binding's structural type is inferred as it is added.

use std::collections::HashMap;

use crate::expr::{Attrs, Binding, Expr, Function, Literal, Param};
use crate::infer::{self, InferError};
use crate::ty::StructType;

/// Builder for a single straight-line function.
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    params: Vec<Param>,
    body: Vec<Binding>,
    types: HashMap<String, StructType>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            body: Vec::new(),
            types: HashMap::new(),
        }
    }

    /// Declare a parameter and return its name.
    pub fn param(&mut self, name: impl Into<String>, ty: StructType) -> String {
        let name = name.into();
        self.types.insert(name.clone(), ty.clone());
        self.params.push(Param {
            name: name.clone(),
            ty,
        });
        name
    }

    fn lookup(&self, name: &str) -> Option<StructType> {
        self.types.get(name).cloned()
    }

    /// Bind `value` to a fresh variable named `var`, inferring its type.
    pub fn bind(&mut self, var: impl Into<String>, value: Expr) -> Result<String, InferError> {
        let var = var.into();
        let ty = infer::struct_type_of(&value, &|n| self.lookup(n))?;
        self.types.insert(var.clone(), ty.clone());
        self.body.push(Binding { var: var.clone(), ty, value });
        Ok(var)
    }

    /// Bind an operator call over named operands.
    pub fn call(
        &mut self,
        var: impl Into<String>,
        op: &str,
        args: &[&str],
        attrs: Attrs,
    ) -> Result<String, InferError> {
        let args = args.iter().map(|a| Expr::var(*a)).collect();
        self.bind(var, Expr::call(op, args, attrs))
    }

    /// Bind a tuple of named operands.
    pub fn tuple(&mut self, var: impl Into<String>, elems: &[&str]) -> Result<String, InferError> {
        let elems = elems.iter().map(|e| Expr::var(*e)).collect();
        self.bind(var, Expr::Tuple(elems))
    }

    /// Bind the projection `tuple[index]`.
    pub fn tuple_get(
        &mut self,
        var: impl Into<String>,
        tuple: &str,
        index: usize,
    ) -> Result<String, InferError> {
        self.bind(var, Expr::tuple_get(Expr::var(tuple), index))
    }

    /// Bind a scalar constant.
    pub fn constant(&mut self, var: impl Into<String>, lit: Literal) -> Result<String, InferError> {
        self.bind(var, Expr::Const(lit))
    }

    /// Bind a pure assignment `var = source`.
    pub fn assign(&mut self, var: impl Into<String>, source: &str) -> Result<String, InferError> {
        self.bind(var, Expr::var(source))
    }

    /// Finish the function, returning `ret`.
    pub fn finish(self, ret: &str) -> Result<Function, InferError> {
        if !self.types.contains_key(ret) {
            return Err(InferError::UndefinedVariable {
                name: ret.to_string(),
            });
        }
        Ok(Function {
            name: self.name,
            params: self.params,
            body: self.body,
            ret: ret.to_string(),
        })
    }
}
