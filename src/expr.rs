//! Projection and filter expressions
//!
//! Stages hold pre-parsed expression trees; the textual grammar that
//! produces them lives upstream of this crate. Binding resolves every
//! property reference against the request's lookup once, so evaluation is
//! slot reads and arithmetic only.

use std::collections::HashMap;

use crate::error::{ErrorCode, QueryError};
use crate::lookup::{KeyId, Lookup, Row};
use crate::value::Value;

/// A parsed expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// A field reference, by name (`@price`).
    Property(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn num(n: f64) -> Expr {
        Expr::Literal(Value::number(n))
    }

    pub fn str(s: impl Into<String>) -> Expr {
        Expr::Literal(Value::string(s))
    }

    pub fn prop(name: impl Into<String>) -> Expr {
        Expr::Property(name.into())
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(func: Func, args: Vec<Expr>) -> Expr {
        Expr::Call { func, args }
    }

    fn collect_properties<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Property(name) => out.push(name),
            Expr::Neg(inner) | Expr::Not(inner) => inner.collect_properties(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_properties(out);
                rhs.collect_properties(out);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.collect_properties(out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Closed set of callable functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Abs,
    Ceil,
    Floor,
    Sqrt,
    Log,
    Log2,
    Exp,
    Pow,
    Upper,
    Lower,
    Substr,
    Exists,
    ToNumber,
}

/// An expression whose property references are resolved to lookup keys.
#[derive(Debug)]
pub struct BoundExpr {
    expr: Expr,
    keys: HashMap<String, KeyId>,
}

impl BoundExpr {
    /// Resolve every property reference in read mode. Unknown properties
    /// fail unless the lookup allows unresolved keys.
    pub fn bind(expr: Expr, lookup: &mut Lookup) -> Result<BoundExpr, QueryError> {
        let mut props = Vec::new();
        expr.collect_properties(&mut props);
        let mut keys = HashMap::new();
        for name in props {
            if keys.contains_key(name) {
                continue;
            }
            let id = lookup
                .get_key_read(name, crate::lookup::KeyFlags::empty())
                .ok_or_else(|| QueryError::unknown_property(name))?;
            keys.insert(name.to_owned(), id);
        }
        Ok(BoundExpr { expr, keys })
    }

    /// Keys referenced by this expression, for load planning.
    pub fn referenced_keys(&self) -> impl Iterator<Item = KeyId> + '_ {
        self.keys.values().copied()
    }

    pub fn eval(&self, lookup: &Lookup, row: &Row) -> Result<Value, QueryError> {
        self.eval_node(&self.expr, lookup, row)
    }

    fn eval_node(&self, node: &Expr, lookup: &Lookup, row: &Row) -> Result<Value, QueryError> {
        match node {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Property(name) => {
                let id = self.keys[name.as_str()];
                Ok(lookup.get_item(id, row).unwrap_or_else(Value::null))
            }
            Expr::Neg(inner) => {
                let v = self.eval_node(inner, lookup, row)?;
                if v.is_null() {
                    return Ok(Value::null());
                }
                Ok(Value::number(-numeric(&v)?))
            }
            Expr::Not(inner) => {
                let v = self.eval_node(inner, lookup, row)?;
                Ok(bool_value(!v.is_truthy()))
            }
            Expr::Binary { op, lhs, rhs } => {
                let a = self.eval_node(lhs, lookup, row)?;
                let b = self.eval_node(rhs, lookup, row)?;
                self.eval_binary(*op, a, b)
            }
            Expr::Call { func, args } => self.eval_call(*func, args, lookup, row),
        }
    }

    fn eval_binary(&self, op: BinOp, a: Value, b: Value) -> Result<Value, QueryError> {
        match op {
            BinOp::And => return Ok(bool_value(a.is_truthy() && b.is_truthy())),
            BinOp::Or => return Ok(bool_value(a.is_truthy() || b.is_truthy())),
            BinOp::Eq => return Ok(bool_value(a == b)),
            BinOp::Ne => return Ok(bool_value(a != b)),
            BinOp::Lt => return Ok(bool_value(a.total_compare(&b).is_lt())),
            BinOp::Le => return Ok(bool_value(a.total_compare(&b).is_le())),
            BinOp::Gt => return Ok(bool_value(a.total_compare(&b).is_gt())),
            BinOp::Ge => return Ok(bool_value(a.total_compare(&b).is_ge())),
            _ => {}
        }
        // Arithmetic: null propagates, everything else must coerce.
        if a.is_null() || b.is_null() {
            return Ok(Value::null());
        }
        let x = numeric(&a)?;
        let y = numeric(&b)?;
        let r = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Mod => x % y,
            BinOp::Pow => x.powf(y),
            _ => unreachable!("comparison ops handled above"),
        };
        Ok(Value::number(r))
    }

    fn eval_call(
        &self,
        func: Func,
        args: &[Expr],
        lookup: &Lookup,
        row: &Row,
    ) -> Result<Value, QueryError> {
        // EXISTS inspects the slot itself rather than the value.
        if func == Func::Exists {
            let [arg] = args else {
                return Err(arity_error("exists", 1, args.len()));
            };
            if let Expr::Property(name) = arg {
                let id = self.keys[name.as_str()];
                return Ok(bool_value(lookup.get_item(id, row).is_some()));
            }
            let v = self.eval_node(arg, lookup, row)?;
            return Ok(bool_value(!v.is_null()));
        }

        let mut values = Vec::with_capacity(args.len());
        for a in args {
            values.push(self.eval_node(a, lookup, row)?);
        }

        match func {
            Func::Abs | Func::Ceil | Func::Floor | Func::Sqrt | Func::Log | Func::Log2
            | Func::Exp => {
                let [v] = values.as_slice() else {
                    return Err(arity_error(func_name(func), 1, values.len()));
                };
                if v.is_null() {
                    return Ok(Value::null());
                }
                let x = numeric(v)?;
                let r = match func {
                    Func::Abs => x.abs(),
                    Func::Ceil => x.ceil(),
                    Func::Floor => x.floor(),
                    Func::Sqrt => x.sqrt(),
                    Func::Log => x.ln(),
                    Func::Log2 => x.log2(),
                    Func::Exp => x.exp(),
                    _ => unreachable!(),
                };
                Ok(Value::number(r))
            }
            Func::Pow => {
                let [base, exp] = values.as_slice() else {
                    return Err(arity_error("pow", 2, values.len()));
                };
                if base.is_null() || exp.is_null() {
                    return Ok(Value::null());
                }
                Ok(Value::number(numeric(base)?.powf(numeric(exp)?)))
            }
            Func::Upper | Func::Lower => {
                let [v] = values.as_slice() else {
                    return Err(arity_error(func_name(func), 1, values.len()));
                };
                if v.is_null() {
                    return Ok(Value::null());
                }
                let s = v.to_text();
                Ok(Value::string(if func == Func::Upper {
                    s.to_uppercase()
                } else {
                    s.to_lowercase()
                }))
            }
            Func::Substr => {
                let [v, start, len] = values.as_slice() else {
                    return Err(arity_error("substr", 3, values.len()));
                };
                if v.is_null() {
                    return Ok(Value::null());
                }
                let s = v.to_text();
                let start = numeric(start)?.max(0.0) as usize;
                let len = numeric(len)?;
                let chars: Vec<char> = s.chars().collect();
                if start >= chars.len() {
                    return Ok(Value::string(""));
                }
                let end = if len < 0.0 {
                    chars.len()
                } else {
                    (start + len as usize).min(chars.len())
                };
                Ok(Value::string(chars[start..end].iter().collect::<String>()))
            }
            Func::ToNumber => {
                let [v] = values.as_slice() else {
                    return Err(arity_error("to_number", 1, values.len()));
                };
                Ok(match v.to_number() {
                    Some(n) => Value::number(n),
                    None => Value::null(),
                })
            }
            Func::Exists => unreachable!("handled above"),
        }
    }
}

fn bool_value(b: bool) -> Value {
    Value::number(if b { 1.0 } else { 0.0 })
}

fn numeric(v: &Value) -> Result<f64, QueryError> {
    v.to_number().ok_or_else(|| {
        QueryError::new(
            ErrorCode::NotNumeric,
            format!("Error converting `{}` to number", v.to_text()),
        )
    })
}

fn func_name(f: Func) -> &'static str {
    match f {
        Func::Abs => "abs",
        Func::Ceil => "ceil",
        Func::Floor => "floor",
        Func::Sqrt => "sqrt",
        Func::Log => "log",
        Func::Log2 => "log2",
        Func::Exp => "exp",
        Func::Pow => "pow",
        Func::Upper => "upper",
        Func::Lower => "lower",
        Func::Substr => "substr",
        Func::Exists => "exists",
        Func::ToNumber => "to_number",
    }
}

fn arity_error(name: &str, want: usize, got: usize) -> QueryError {
    QueryError::new(
        ErrorCode::ParseArgs,
        format!("{name} expects {want} argument(s), got {got}"),
    )
}
