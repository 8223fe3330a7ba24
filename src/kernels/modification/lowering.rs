// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Lowering table: how each graph operation becomes fused-program instructions.

use std::collections::HashMap;
use std::fmt;

use super::expr::{BinaryOp, BufferId, ExprBuilder, Reg, UnaryOp};
use crate::error::{FlexAttnError, Result};

/// Operations a score-mod graph may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    FloorDivide,
    Remainder,
    Pow,
    Maximum,
    Minimum,
    Neg,
    Exp,
    Log,
    Sqrt,
    Rsqrt,
    Tanh,
    Sigmoid,
    Abs,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    LogicalAnd,
    LogicalOr,
    LogicalNot,
    /// `where(cond, a, b)`
    Where,
    /// `index(buffer, (i0, i1, ...))`
    Index,
    /// Sum over a whole captured buffer.
    Sum,
    /// Max over a whole captured buffer.
    Amax,
    /// `full(shape, value)`, a broadcast constant.
    Full,
}

impl Op {
    /// Operator name as it appears in traced graphs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "aten.add",
            Self::Sub => "aten.sub",
            Self::Mul => "aten.mul",
            Self::Div => "aten.div",
            Self::FloorDivide => "aten.floor_divide",
            Self::Remainder => "aten.remainder",
            Self::Pow => "aten.pow",
            Self::Maximum => "aten.maximum",
            Self::Minimum => "aten.minimum",
            Self::Neg => "aten.neg",
            Self::Exp => "aten.exp",
            Self::Log => "aten.log",
            Self::Sqrt => "aten.sqrt",
            Self::Rsqrt => "aten.rsqrt",
            Self::Tanh => "aten.tanh",
            Self::Sigmoid => "aten.sigmoid",
            Self::Abs => "aten.abs",
            Self::Gt => "aten.gt",
            Self::Ge => "aten.ge",
            Self::Lt => "aten.lt",
            Self::Le => "aten.le",
            Self::Eq => "aten.eq",
            Self::Ne => "aten.ne",
            Self::LogicalAnd => "aten.logical_and",
            Self::LogicalOr => "aten.logical_or",
            Self::LogicalNot => "aten.logical_not",
            Self::Where => "aten.where",
            Self::Index => "aten.index",
            Self::Sum => "aten.sum",
            Self::Amax => "aten.amax",
            Self::Full => "aten.full",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value bound to a graph node during inlining.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Per-element expression.
    Expr(Reg),
    /// Captured auxiliary tensor (must be indexed or reduced before use).
    Buffer(BufferId),
    /// Compile-time constant.
    Scalar(f64),
    /// Tuple of values.
    Tuple(Vec<Value>),
    /// Absent value.
    None,
}

impl Value {
    /// Short description used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Expr(_) => "expression",
            Self::Buffer(_) => "captured buffer",
            Self::Scalar(_) => "scalar constant",
            Self::Tuple(_) => "tuple",
            Self::None => "None",
        }
    }
}

/// Signature of a lowering rule.
pub type LoweringFn = fn(&mut ExprBuilder, &[Value]) -> Result<Value>;

/// Mapping from operation identity to lowering rule.
///
/// [`Lowerings::default`] registers every [`Op`]; callers can override or
/// extend entries with [`Lowerings::register`].
#[derive(Clone)]
pub struct Lowerings {
    table: HashMap<Op, LoweringFn>,
}

impl fmt::Debug for Lowerings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops: Vec<_> = self.table.keys().map(|op| op.name()).collect();
        ops.sort_unstable();
        f.debug_struct("Lowerings").field("ops", &ops).finish()
    }
}

impl Lowerings {
    /// A table with no rules.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Install `rule` for `op`, returning the rule it replaced.
    pub fn register(&mut self, op: Op, rule: LoweringFn) -> Option<LoweringFn> {
        self.table.insert(op, rule)
    }

    /// Whether `op` has a rule.
    #[must_use]
    pub fn contains(&self, op: Op) -> bool {
        self.table.contains_key(&op)
    }

    /// Lower one call node.
    ///
    /// # Errors
    /// Returns [`FlexAttnError::Lowering`] for unknown operations or operands
    /// the rule cannot handle.
    pub fn lower(&self, op: Op, builder: &mut ExprBuilder, args: &[Value]) -> Result<Value> {
        let rule = self.table.get(&op).ok_or_else(|| FlexAttnError::Lowering {
            op: op.name().into(),
            reason: "no lowering registered".into(),
        })?;
        rule(builder, args)
    }
}

impl Default for Lowerings {
    fn default() -> Self {
        let mut l = Self::empty();
        l.register(Op::Add, |b, a| binary(b, a, Op::Add, BinaryOp::Add));
        l.register(Op::Sub, |b, a| binary(b, a, Op::Sub, BinaryOp::Sub));
        l.register(Op::Mul, |b, a| binary(b, a, Op::Mul, BinaryOp::Mul));
        l.register(Op::Div, |b, a| binary(b, a, Op::Div, BinaryOp::Div));
        l.register(Op::FloorDivide, |b, a| {
            binary(b, a, Op::FloorDivide, BinaryOp::FloorDiv)
        });
        l.register(Op::Remainder, |b, a| {
            binary(b, a, Op::Remainder, BinaryOp::Rem)
        });
        l.register(Op::Pow, |b, a| binary(b, a, Op::Pow, BinaryOp::Pow));
        l.register(Op::Maximum, |b, a| binary(b, a, Op::Maximum, BinaryOp::Max));
        l.register(Op::Minimum, |b, a| binary(b, a, Op::Minimum, BinaryOp::Min));
        l.register(Op::Gt, |b, a| binary(b, a, Op::Gt, BinaryOp::Gt));
        l.register(Op::Ge, |b, a| binary(b, a, Op::Ge, BinaryOp::Ge));
        l.register(Op::Lt, |b, a| binary(b, a, Op::Lt, BinaryOp::Lt));
        l.register(Op::Le, |b, a| binary(b, a, Op::Le, BinaryOp::Le));
        l.register(Op::Eq, |b, a| binary(b, a, Op::Eq, BinaryOp::Eq));
        l.register(Op::Ne, |b, a| binary(b, a, Op::Ne, BinaryOp::Ne));
        l.register(Op::LogicalAnd, |b, a| {
            binary(b, a, Op::LogicalAnd, BinaryOp::And)
        });
        l.register(Op::LogicalOr, |b, a| {
            binary(b, a, Op::LogicalOr, BinaryOp::Or)
        });
        l.register(Op::Neg, |b, a| unary(b, a, Op::Neg, UnaryOp::Neg));
        l.register(Op::Exp, |b, a| unary(b, a, Op::Exp, UnaryOp::Exp));
        l.register(Op::Log, |b, a| unary(b, a, Op::Log, UnaryOp::Log));
        l.register(Op::Sqrt, |b, a| unary(b, a, Op::Sqrt, UnaryOp::Sqrt));
        l.register(Op::Rsqrt, |b, a| unary(b, a, Op::Rsqrt, UnaryOp::Rsqrt));
        l.register(Op::Tanh, |b, a| unary(b, a, Op::Tanh, UnaryOp::Tanh));
        l.register(Op::Sigmoid, |b, a| {
            unary(b, a, Op::Sigmoid, UnaryOp::Sigmoid)
        });
        l.register(Op::Abs, |b, a| unary(b, a, Op::Abs, UnaryOp::Abs));
        l.register(Op::LogicalNot, |b, a| {
            unary(b, a, Op::LogicalNot, UnaryOp::Not)
        });
        l.register(Op::Where, lower_where);
        l.register(Op::Index, lower_index);
        l.register(Op::Sum, |b, a| reduce(b, a, Op::Sum));
        l.register(Op::Amax, |b, a| reduce(b, a, Op::Amax));
        l.register(Op::Full, lower_full);
        l
    }
}

fn lowering_error(op: Op, reason: impl Into<String>) -> FlexAttnError {
    FlexAttnError::Lowering {
        op: op.name().into(),
        reason: reason.into(),
    }
}

fn arity(op: Op, args: &[Value], expected: usize) -> Result<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(lowering_error(
            op,
            format!("expected {expected} operands, got {}", args.len()),
        ))
    }
}

/// Turn an operand into a register, materializing constants and one-element buffers.
fn operand(b: &mut ExprBuilder, op: Op, value: &Value) -> Result<Reg> {
    match value {
        Value::Expr(reg) => Ok(*reg),
        Value::Scalar(v) => Ok(b.constant(*v)),
        Value::Buffer(id) => {
            let (numel, rank) = (b.buffer(*id).numel(), b.buffer(*id).rank());
            if numel != 1 {
                return Err(lowering_error(
                    op,
                    format!(
                        "captured buffer `{}` with {numel} elements used elementwise; \
                         index it first",
                        b.buffer(*id).name()
                    ),
                ));
            }
            let zeros = (0..rank).map(|_| b.constant(0.0)).collect();
            b.load(*id, zeros)
        }
        other => Err(lowering_error(
            op,
            format!("unsupported operand: {}", other.kind()),
        )),
    }
}

fn unary(b: &mut ExprBuilder, args: &[Value], op: Op, kind: UnaryOp) -> Result<Value> {
    arity(op, args, 1)?;
    if let Value::Scalar(x) = args[0] {
        return Ok(Value::Scalar(kind.eval(x)));
    }
    let a = operand(b, op, &args[0])?;
    Ok(Value::Expr(b.unary(kind, a)))
}

fn binary(b: &mut ExprBuilder, args: &[Value], op: Op, kind: BinaryOp) -> Result<Value> {
    arity(op, args, 2)?;
    if let (Value::Scalar(x), Value::Scalar(y)) = (&args[0], &args[1]) {
        return Ok(Value::Scalar(kind.eval(*x, *y)));
    }
    let lhs = operand(b, op, &args[0])?;
    let rhs = operand(b, op, &args[1])?;
    Ok(Value::Expr(b.binary(kind, lhs, rhs)))
}

fn lower_where(b: &mut ExprBuilder, args: &[Value]) -> Result<Value> {
    arity(Op::Where, args, 3)?;
    if let Value::Scalar(c) = args[0] {
        return Ok(if c == 0.0 { args[2].clone() } else { args[1].clone() });
    }
    let cond = operand(b, Op::Where, &args[0])?;
    let lhs = operand(b, Op::Where, &args[1])?;
    let rhs = operand(b, Op::Where, &args[2])?;
    Ok(Value::Expr(b.select(cond, lhs, rhs)))
}

/// Accepts `index(buf, (i, j))` as well as `index(buf, i, j)`.
fn lower_index(b: &mut ExprBuilder, args: &[Value]) -> Result<Value> {
    let Some((Value::Buffer(id), rest)) = args.split_first() else {
        return Err(lowering_error(
            Op::Index,
            "first operand must be a captured buffer",
        ));
    };
    let indices = match rest {
        [Value::Tuple(items)] => items.as_slice(),
        other => other,
    };
    let regs = indices
        .iter()
        .map(|v| operand(b, Op::Index, v))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::Expr(b.load(*id, regs)?))
}

/// Whole-buffer reductions fold to a constant at lowering time.
fn reduce(b: &mut ExprBuilder, args: &[Value], op: Op) -> Result<Value> {
    arity(op, args, 1)?;
    match &args[0] {
        Value::Scalar(v) => Ok(Value::Scalar(*v)),
        Value::Buffer(id) => {
            let data = b.buffer(*id).data();
            let folded = match op {
                Op::Amax => data
                    .iter()
                    .fold(f64::NEG_INFINITY, |acc, &x| acc.max(f64::from(x))),
                _ => data.iter().map(|&x| f64::from(x)).sum(),
            };
            Ok(Value::Scalar(folded))
        }
        other => Err(lowering_error(
            op,
            format!("can only reduce captured buffers, got {}", other.kind()),
        )),
    }
}

fn lower_full(_b: &mut ExprBuilder, args: &[Value]) -> Result<Value> {
    match args.last() {
        Some(Value::Scalar(v)) => Ok(Value::Scalar(*v)),
        _ => Err(lowering_error(Op::Full, "fill value must be a constant")),
    }
}
