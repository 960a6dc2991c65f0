//! Core IR - expressions, bindings, functions, and modules.
//!
//! The IR is a straight-line dataflow representation: a function body is an
//! ordered list of single-assignment bindings followed by a return variable.
//! After normalization the operands of `Call` and `Tuple` are variable
//! references (or scalar constants), the operand of `TupleGet` is a variable
//! reference, and tuple projections are never nested.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use half::f16;
use serde::{Deserialize, Serialize};

use crate::ty::{DType, Shape, StructType};

/// Scalar constant embedded in the IR.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Literal {
    F16(f16),
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
    Bool(bool),
}

// Bit-pattern equality over floats so that Literal (and therefore Expr) can
// key hash maps. Under this relation NaN equals itself and 0.0 differs from
// -0.0, which is the right notion for structural identity of IR trees.
impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::F16(a), Self::F16(b)) => a.to_bits() == b.to_bits(),
            (Self::F32(a), Self::F32(b)) => a.to_bits() == b.to_bits(),
            (Self::F64(a), Self::F64(b)) => a.to_bits() == b.to_bits(),
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::F16(v) => (0u8, v.to_bits()).hash(state),
            Self::F32(v) => (1u8, v.to_bits()).hash(state),
            Self::F64(v) => (2u8, v.to_bits()).hash(state),
            Self::I32(v) => (3u8, v).hash(state),
            Self::I64(v) => (4u8, v).hash(state),
            Self::Bool(v) => (5u8, v).hash(state),
        }
    }
}

impl Literal {
    pub fn dtype(&self) -> DType {
        match self {
            Self::F16(_) => DType::Float16,
            Self::F32(_) => DType::Float32,
            Self::F64(_) => DType::Float64,
            Self::I32(_) => DType::Int32,
            Self::I64(_) => DType::Int64,
            Self::Bool(_) => DType::Bool,
        }
    }

    /// Structural type of the constant: always a scalar tensor.
    pub fn struct_type(&self) -> StructType {
        StructType::scalar(self.dtype())
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::F16(v) => write!(f, "{}f16", v),
            Self::F32(v) => write!(f, "{}f32", v),
            Self::F64(v) => write!(f, "{}f64", v),
            Self::I32(v) => write!(f, "{}i32", v),
            Self::I64(v) => write!(f, "{}i64", v),
            Self::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// Operator attribute value. Restricted to kinds with total equality so that
/// expressions remain usable as hash-map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    IntList(Vec<i64>),
    Shape(Shape),
    DType(DType),
    Str(String),
}

impl AttrValue {
    pub fn as_shape(&self) -> Option<&Shape> {
        match self {
            Self::Shape(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_dtype(&self) -> Option<DType> {
        match self {
            Self::DType(d) => Some(*d),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::IntList(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Self::Shape(s) => crate::ty::fmt_shape(s, f),
            Self::DType(d) => write!(f, "{}", d),
            Self::Str(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// Operator attributes, keyed by name. A `BTreeMap` keeps iteration (and
/// therefore printing and hashing) deterministic.
pub type Attrs = BTreeMap<String, AttrValue>;

/// Expression in the dataflow IR.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// Reference to a named SSA variable.
    Var(String),
    /// Tuple construction.
    Tuple(Vec<Expr>),
    /// Tuple projection: `tuple[index]`.
    TupleGet { tuple: Box<Expr>, index: usize },
    /// Operator invocation.
    Call {
        op: String,
        args: Vec<Expr>,
        #[serde(default, skip_serializing_if = "Attrs::is_empty")]
        attrs: Attrs,
    },
    /// Scalar constant.
    Const(Literal),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    pub fn call(op: impl Into<String>, args: Vec<Expr>, attrs: Attrs) -> Self {
        Self::Call {
            op: op.into(),
            args,
            attrs,
        }
    }

    pub fn tuple_get(tuple: Expr, index: usize) -> Self {
        Self::TupleGet {
            tuple: Box::new(tuple),
            index,
        }
    }

    /// The variable name if this is a `Var` reference.
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Self::Var(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Self::Var(_))
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Self::Const(_))
    }

    /// True for a `zeros(...)` call, the leaf form of a structural zero.
    pub fn is_zero_leaf(&self) -> bool {
        matches!(self, Self::Call { op, .. } if op == "zeros")
    }

    /// Visit every variable referenced anywhere in this expression tree.
    pub fn for_each_var<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Self::Var(name) => f(name),
            Self::Tuple(elems) => {
                for e in elems {
                    e.for_each_var(f);
                }
            }
            Self::TupleGet { tuple, .. } => tuple.for_each_var(f),
            Self::Call { args, .. } => {
                for a in args {
                    a.for_each_var(f);
                }
            }
            Self::Const(_) => {}
        }
    }
}

/// Single-assignment binding. The structural type of the bound variable is
/// stored on the binding itself, populated by inference at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub var: String,
    pub ty: StructType,
    pub value: Expr,
}

/// Function parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: StructType,
}

/// A straight-line dataflow function: parameters, an ordered binding list,
/// and a return variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Binding>,
    /// Name of the returned variable.
    pub ret: String,
}

impl Function {
    /// Resolve the structural type of a parameter or bound variable.
    pub fn var_type(&self, name: &str) -> Option<&StructType> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.ty)
            .or_else(|| {
                self.body
                    .iter()
                    .find(|b| b.var == name)
                    .map(|b| &b.ty)
            })
    }

    /// Number of uses of `name` across binding values and the return.
    pub fn uses_of(&self, name: &str) -> usize {
        let mut count = 0;
        for b in &self.body {
            b.value.for_each_var(&mut |v| {
                if v == name {
                    count += 1;
                }
            });
        }
        if self.ret == name {
            count += 1;
        }
        count
    }
}

/// A collection of functions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(functions: Vec<Function>) -> Self {
        Self { functions }
    }

    pub fn lookup(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from the JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
