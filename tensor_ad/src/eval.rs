//! Reference evaluator for straight-line dataflow functions.
//!
//! A tree-walking interpreter covering the builtin operator library,
//! computing in f64 regardless of the declared dtype. It exists to back the
//! numeric gradient tests (finite-difference comparison against the
//! differentiated function) and is not an execution engine.

use std::collections::HashMap;

use tensor_ad_ir::{AttrValue, Attrs, Expr, Function, Literal};
use thiserror::Error;

/// Evaluation failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("function '{function}' takes {expected} argument(s), got {got}")]
    ArityMismatch {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("undefined variable '{name}'")]
    UndefinedVariable { name: String },

    #[error("operator '{op}' is not implemented by the evaluator")]
    UnknownOperator { op: String },

    #[error("operator '{op}': {reason}")]
    BadOperand { op: String, reason: String },

    #[error("operator '{op}': missing or malformed attribute '{attr}'")]
    BadAttr { op: String, attr: String },

    #[error("cannot project index {index} out of a tuple of {arity} element(s)")]
    BadProjection { index: usize, arity: usize },
}

/// Dense row-major tensor of f64.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn ones(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![1.0; len],
        }
    }

    /// The single element of a rank-0 (or one-element) tensor.
    pub fn item(&self) -> f64 {
        self.data[0]
    }
}

/// Runtime value: a tensor or a tuple of values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tensor(Tensor),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn scalar(v: f64) -> Self {
        Self::Tensor(Tensor::scalar(v))
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            Self::Tuple(_) => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Self::Tuple(vs) => Some(vs),
            Self::Tensor(_) => None,
        }
    }
}

/// Evaluate `func` on `inputs`, returning the value of its return variable.
pub fn eval_function(func: &Function, inputs: &[Value]) -> Result<Value, EvalError> {
    if inputs.len() != func.params.len() {
        return Err(EvalError::ArityMismatch {
            function: func.name.clone(),
            expected: func.params.len(),
            got: inputs.len(),
        });
    }
    let mut env: HashMap<&str, Value> = HashMap::new();
    for (p, v) in func.params.iter().zip(inputs) {
        env.insert(p.name.as_str(), v.clone());
    }
    for b in &func.body {
        let v = eval_expr(&b.value, &env)?;
        env.insert(b.var.as_str(), v);
    }
    env.remove(func.ret.as_str())
        .ok_or_else(|| EvalError::UndefinedVariable {
            name: func.ret.clone(),
        })
}

fn eval_expr(expr: &Expr, env: &HashMap<&str, Value>) -> Result<Value, EvalError> {
    match expr {
        Expr::Var(name) => env
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| EvalError::UndefinedVariable { name: name.clone() }),
        Expr::Const(lit) => Ok(Value::scalar(literal_to_f64(lit))),
        Expr::Tuple(elems) => Ok(Value::Tuple(
            elems
                .iter()
                .map(|e| eval_expr(e, env))
                .collect::<Result<_, _>>()?,
        )),
        Expr::TupleGet { tuple, index } => {
            let v = eval_expr(tuple, env)?;
            match v {
                Value::Tuple(mut elems) if *index < elems.len() => Ok(elems.swap_remove(*index)),
                Value::Tuple(elems) => Err(EvalError::BadProjection {
                    index: *index,
                    arity: elems.len(),
                }),
                Value::Tensor(_) => Err(EvalError::BadProjection {
                    index: *index,
                    arity: 0,
                }),
            }
        }
        Expr::Call { op, args, attrs } => {
            let args = args
                .iter()
                .map(|a| eval_expr(a, env))
                .collect::<Result<Vec<_>, _>>()?;
            eval_call(op, &args, attrs)
        }
    }
}

fn literal_to_f64(lit: &Literal) -> f64 {
    match lit {
        Literal::F16(v) => f64::from(*v),
        Literal::F32(v) => f64::from(*v),
        Literal::F64(v) => *v,
        Literal::I32(v) => f64::from(*v),
        Literal::I64(v) => *v as f64,
        Literal::Bool(v) => f64::from(u8::from(*v)),
    }
}

fn tensor_arg<'a>(op: &str, args: &'a [Value], i: usize) -> Result<&'a Tensor, EvalError> {
    args.get(i)
        .and_then(Value::as_tensor)
        .ok_or_else(|| EvalError::BadOperand {
            op: op.to_string(),
            reason: format!("argument {} is not a tensor", i),
        })
}

fn shape_attr(op: &str, attrs: &Attrs, name: &str) -> Result<Vec<usize>, EvalError> {
    attrs
        .get(name)
        .and_then(AttrValue::as_shape)
        .cloned()
        .ok_or_else(|| EvalError::BadAttr {
            op: op.to_string(),
            attr: name.to_string(),
        })
}

fn eval_call(op: &str, args: &[Value], attrs: &Attrs) -> Result<Value, EvalError> {
    match op {
        "add" => binary_elementwise(op, args, |a, b| a + b),
        "subtract" => binary_elementwise(op, args, |a, b| a - b),
        "multiply" => binary_elementwise(op, args, |a, b| a * b),
        "divide" => binary_elementwise(op, args, |a, b| a / b),
        "negative" => unary_elementwise(op, args, |a| -a),
        "exp" => unary_elementwise(op, args, f64::exp),
        "log" => unary_elementwise(op, args, f64::ln),
        "tanh" => unary_elementwise(op, args, f64::tanh),
        "sum" => {
            let t = tensor_arg(op, args, 0)?;
            Ok(Value::scalar(t.data.iter().sum()))
        }
        "zeros" => Ok(Value::Tensor(Tensor::zeros(shape_attr(op, attrs, "shape")?))),
        "ones" => Ok(Value::Tensor(Tensor::ones(shape_attr(op, attrs, "shape")?))),
        "broadcast_to" => {
            let t = tensor_arg(op, args, 0)?;
            let target = shape_attr(op, attrs, "shape")?;
            broadcast_to(op, t, target).map(Value::Tensor)
        }
        "collapse_sum_to" => {
            let t = tensor_arg(op, args, 0)?;
            let target = shape_attr(op, attrs, "shape")?;
            collapse_sum_to(op, t, target).map(Value::Tensor)
        }
        "matmul" => {
            let a = tensor_arg(op, args, 0)?;
            let b = tensor_arg(op, args, 1)?;
            matmul(op, a, b).map(Value::Tensor)
        }
        "transpose" => {
            let t = tensor_arg(op, args, 0)?;
            transpose(op, t).map(Value::Tensor)
        }
        _ => Err(EvalError::UnknownOperator { op: op.to_string() }),
    }
}

fn unary_elementwise(
    op: &str,
    args: &[Value],
    f: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    let t = tensor_arg(op, args, 0)?;
    Ok(Value::Tensor(Tensor {
        shape: t.shape.clone(),
        data: t.data.iter().map(|&a| f(a)).collect(),
    }))
}

fn binary_elementwise(
    op: &str,
    args: &[Value],
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    let a = tensor_arg(op, args, 0)?;
    let b = tensor_arg(op, args, 1)?;
    let shape = tensor_ad_ir::broadcast_shapes(&a.shape, &b.shape).ok_or_else(|| {
        EvalError::BadOperand {
            op: op.to_string(),
            reason: format!("shapes {:?} and {:?} do not broadcast", a.shape, b.shape),
        }
    })?;
    let len = shape.iter().product();
    let mut data = Vec::with_capacity(len);
    let mut index = vec![0usize; shape.len()];
    for _ in 0..len {
        let va = a.data[broadcast_offset(&index, &a.shape)];
        let vb = b.data[broadcast_offset(&index, &b.shape)];
        data.push(f(va, vb));
        step_index(&mut index, &shape);
    }
    Ok(Value::Tensor(Tensor { shape, data }))
}

/// Row-major offset of a (right-aligned, broadcast) multi-index into a tensor
/// of shape `shape`.
fn broadcast_offset(index: &[usize], shape: &[usize]) -> usize {
    let skip = index.len() - shape.len();
    let mut offset = 0;
    for (dim, &extent) in shape.iter().enumerate() {
        let i = if extent == 1 { 0 } else { index[skip + dim] };
        offset = offset * extent + i;
    }
    offset
}

/// Advance a row-major multi-index by one position.
fn step_index(index: &mut [usize], shape: &[usize]) {
    for dim in (0..shape.len()).rev() {
        index[dim] += 1;
        if index[dim] < shape[dim] {
            return;
        }
        index[dim] = 0;
    }
}

fn broadcast_to(op: &str, t: &Tensor, target: Vec<usize>) -> Result<Tensor, EvalError> {
    if !tensor_ad_ir::broadcastable_to(&t.shape, &target) {
        return Err(EvalError::BadOperand {
            op: op.to_string(),
            reason: format!("shape {:?} does not broadcast to {:?}", t.shape, target),
        });
    }
    let len = target.iter().product();
    let mut data = Vec::with_capacity(len);
    let mut index = vec![0usize; target.len()];
    for _ in 0..len {
        data.push(t.data[broadcast_offset(&index, &t.shape)]);
        step_index(&mut index, &target);
    }
    Ok(Tensor {
        shape: target,
        data,
    })
}

fn collapse_sum_to(op: &str, t: &Tensor, target: Vec<usize>) -> Result<Tensor, EvalError> {
    if !tensor_ad_ir::broadcastable_to(&target, &t.shape) {
        return Err(EvalError::BadOperand {
            op: op.to_string(),
            reason: format!("shape {:?} does not collapse to {:?}", t.shape, target),
        });
    }
    let mut out = Tensor::zeros(target);
    let mut index = vec![0usize; t.shape.len()];
    for &v in &t.data {
        out.data[broadcast_offset(&index, &out.shape)] += v;
        step_index(&mut index, &t.shape);
    }
    Ok(out)
}

fn matmul(op: &str, a: &Tensor, b: &Tensor) -> Result<Tensor, EvalError> {
    let (&[m, k], &[k2, n]) = (&a.shape[..], &b.shape[..]) else {
        return Err(EvalError::BadOperand {
            op: op.to_string(),
            reason: "operands must be 2-D".to_string(),
        });
    };
    if k != k2 {
        return Err(EvalError::BadOperand {
            op: op.to_string(),
            reason: format!("inner dimensions {} and {} differ", k, k2),
        });
    }
    let mut data = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0;
            for l in 0..k {
                acc += a.data[i * k + l] * b.data[l * n + j];
            }
            data[i * n + j] = acc;
        }
    }
    Ok(Tensor {
        shape: vec![m, n],
        data,
    })
}

fn transpose(op: &str, t: &Tensor) -> Result<Tensor, EvalError> {
    let &[m, n] = &t.shape[..] else {
        return Err(EvalError::BadOperand {
            op: op.to_string(),
            reason: "operand must be 2-D".to_string(),
        });
    };
    let mut data = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            data[j * m + i] = t.data[i * n + j];
        }
    }
    Ok(Tensor {
        shape: vec![n, m],
        data,
    })
}
