//! Structural types: tensor leaves under tuple structure.

use serde::{Deserialize, Serialize};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Float16,
    Float32,
    Float64,
    Int32,
    Int64,
    Bool,
}

impl DType {
    /// True for the floating-point dtypes (the only ones with adjoints).
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::Float32 | Self::Float64)
    }

    /// Short name used by the printer and in attribute values (`f32`, `i64`, ...).
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Float16 => "f16",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
            Self::Int32 => "i32",
            Self::Int64 => "i64",
            Self::Bool => "bool",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Static tensor shape. Scalars have an empty dimension list.
pub type Shape = Vec<usize>;

/// Structural type of an IR value: a tree of tensor leaves under tuple nodes.
///
/// Two values have the same structural type iff the trees match node-for-node;
/// the derived `PartialEq` is exactly that comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructType {
    Tensor { shape: Shape, dtype: DType },
    Tuple(Vec<StructType>),
}

impl StructType {
    /// Scalar tensor of the given dtype.
    pub fn scalar(dtype: DType) -> Self {
        Self::Tensor {
            shape: Vec::new(),
            dtype,
        }
    }

    pub fn tensor(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self::Tensor {
            shape: shape.into(),
            dtype,
        }
    }

    /// True for a rank-0 tensor.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Tensor { shape, .. } if shape.is_empty())
    }

    /// True for a rank-0 tensor of floating dtype.
    pub fn is_float_scalar(&self) -> bool {
        matches!(self, Self::Tensor { shape, dtype } if shape.is_empty() && dtype.is_float())
    }

    /// True if any tensor leaf has a floating dtype.
    pub fn has_float_leaf(&self) -> bool {
        match self {
            Self::Tensor { dtype, .. } => dtype.is_float(),
            Self::Tuple(elems) => elems.iter().any(StructType::has_float_leaf),
        }
    }

    /// Number of tensor leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Tensor { .. } => 1,
            Self::Tuple(elems) => elems.iter().map(StructType::leaf_count).sum(),
        }
    }
}

/// Format a shape as `(5, 5)` / `()` / `(3,)`.
pub(crate) fn fmt_shape(shape: &[usize], f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "(")?;
    for (i, d) in shape.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", d)?;
    }
    if shape.len() == 1 {
        write!(f, ",")?;
    }
    write!(f, ")")
}

impl std::fmt::Display for StructType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tensor { shape, dtype } => {
                write!(f, "Tensor[")?;
                fmt_shape(shape, f)?;
                write!(f, ", {}]", dtype)
            }
            Self::Tuple(elems) => {
                write!(f, "(")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                if elems.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
        }
    }
}
