//! Stable text form for functions and modules.
//!
//! The printed form is one-way (there is no text parser); snapshot tests key
//! on it, so changes here are breaking for downstream test suites.

use crate::expr::{Expr, Function, Module};

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Var(name) => f.write_str(name),
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
            Self::TupleGet { tuple, index } => write!(f, "{}[{}]", tuple, index),
            Self::Call { op, args, attrs } => {
                write!(f, "{}(", op)?;
                let mut first = true;
                for a in args {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    write!(f, "{}", a)?;
                }
                for (key, value) in attrs {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    write!(f, "{}={}", key, value)?;
                }
                write!(f, ")")
            }
            Self::Const(lit) => write!(f, "{}", lit),
        }
    }
}

impl std::fmt::Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", p.name, p.ty)?;
        }
        writeln!(f, ") {{")?;
        for b in &self.body {
            writeln!(f, "  {}: {} = {}", b.var, b.ty, b.value)?;
        }
        writeln!(f, "  return {}", self.ret)?;
        write!(f, "}}")
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, func) in self.functions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
                writeln!(f)?;
            }
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}
