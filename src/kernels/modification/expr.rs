// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Fused score-modification expressions.
//!
//! A [`FusedScoreExpression`] is the single expression obtained by binding a
//! score-mod graph's placeholders. It is stored as a small SSA program (one
//! register per instruction) and evaluated over a whole score tile at a time,
//! which is how the kernels inline it into their tile loops. The same program
//! can be rendered as Triton-style source for a device compiler.

use std::collections::{HashMap, HashSet};
use std::f32::consts::LOG2_E;
use std::fmt::Write as _;
use std::ops::Range;
use std::sync::Arc;

use candle_core::{DType, Tensor};

use super::SubgraphRole;
use crate::error::{FlexAttnError, Result};

/// Scalar inputs the kernels feed into a score modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sentinel {
    /// Raw (or pre-modification) query-key score.
    Score,
    /// Batch index.
    Batch,
    /// Head index.
    Head,
    /// Absolute query position.
    Query,
    /// Absolute key/value position.
    Key,
    /// Gradient flowing into the modified score (joint graphs only).
    GradScore,
}

impl Sentinel {
    /// Placeholder name used when tracing score modifications.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Score => "score",
            Self::Batch => "b",
            Self::Head => "h",
            Self::Query => "m",
            Self::Key => "n",
            Self::GradScore => "grad_score_mod",
        }
    }

    /// Whether the sentinel carries an int32 index rather than a score value.
    #[must_use]
    pub const fn is_index(self) -> bool {
        matches!(self, Self::Batch | Self::Head | Self::Query | Self::Key)
    }
}

/// SSA register (index of the producing instruction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub(crate) usize);

/// Handle of a captured auxiliary tensor inside an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) usize);

/// Elementwise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum UnaryOp {
    Neg,
    Exp,
    Log,
    Sqrt,
    Rsqrt,
    Tanh,
    Sigmoid,
    Abs,
    Not,
}

impl UnaryOp {
    /// Apply the operation to one value.
    #[must_use]
    pub fn eval(self, x: f64) -> f64 {
        match self {
            Self::Neg => -x,
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Sqrt => x.sqrt(),
            Self::Rsqrt => x.sqrt().recip(),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Abs => x.abs(),
            Self::Not => truth(x == 0.0),
        }
    }

    fn render(self, x: &str) -> String {
        match self {
            Self::Neg => format!("-({x})"),
            Self::Exp => format!("tl.exp({x})"),
            Self::Log => format!("tl.log({x})"),
            Self::Sqrt => format!("tl.sqrt({x})"),
            Self::Rsqrt => format!("1.0 / tl.sqrt({x})"),
            Self::Tanh => format!("libdevice.tanh({x})"),
            Self::Sigmoid => format!("tl.sigmoid({x})"),
            Self::Abs => format!("tl.abs({x})"),
            Self::Not => format!("({x}) == 0"),
        }
    }
}

/// Elementwise binary operations. Comparisons and logical ops yield 1.0 / 0.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
    Max,
    Min,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    /// Apply the operation to one pair of values.
    #[must_use]
    pub fn eval(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::FloorDiv => (a / b).floor(),
            // sign follows the divisor
            Self::Rem => a - b * (a / b).floor(),
            Self::Pow => a.powf(b),
            Self::Max => a.max(b),
            Self::Min => a.min(b),
            Self::Gt => truth(a > b),
            Self::Ge => truth(a >= b),
            Self::Lt => truth(a < b),
            Self::Le => truth(a <= b),
            Self::Eq => truth(a == b),
            Self::Ne => truth(a != b),
            Self::And => truth(a != 0.0 && b != 0.0),
            Self::Or => truth(a != 0.0 || b != 0.0),
        }
    }

    fn render(self, a: &str, b: &str) -> String {
        let infix = |sym: &str| format!("({a}) {sym} ({b})");
        match self {
            Self::Add => infix("+"),
            Self::Sub => infix("-"),
            Self::Mul => infix("*"),
            Self::Div => infix("/"),
            Self::FloorDiv => infix("//"),
            Self::Rem => infix("%"),
            Self::Pow => format!("libdevice.pow({a}, {b})"),
            Self::Max => format!("tl.maximum({a}, {b})"),
            Self::Min => format!("tl.minimum({a}, {b})"),
            Self::Gt => infix(">"),
            Self::Ge => infix(">="),
            Self::Lt => infix("<"),
            Self::Le => infix("<="),
            Self::Eq => infix("=="),
            Self::Ne => infix("!="),
            Self::And => infix("&"),
            Self::Or => infix("|"),
        }
    }
}

fn truth(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// One instruction of the fused program.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Read a sentinel input.
    Input(Sentinel),
    /// Broadcast constant.
    Const(f64),
    /// Elementwise unary op.
    Unary(UnaryOp, Reg),
    /// Elementwise binary op.
    Binary(BinaryOp, Reg, Reg),
    /// `cond != 0 ? a : b`.
    Where(Reg, Reg, Reg),
    /// Gather from a captured buffer, one index register per axis.
    Load {
        /// Source buffer.
        buffer: BufferId,
        /// Index registers, outermost axis first.
        indices: Vec<Reg>,
    },
}

impl Instr {
    fn operands(&self) -> Vec<Reg> {
        match self {
            Self::Input(_) | Self::Const(_) => Vec::new(),
            Self::Unary(_, a) => vec![*a],
            Self::Binary(_, a, b) => vec![*a, *b],
            Self::Where(c, a, b) => vec![*c, *a, *b],
            Self::Load { indices, .. } => indices.clone(),
        }
    }

    fn remap(&self, map: &[usize]) -> Self {
        let r = |reg: &Reg| Reg(map[reg.0]);
        match self {
            Self::Input(s) => Self::Input(*s),
            Self::Const(v) => Self::Const(*v),
            Self::Unary(op, a) => Self::Unary(*op, r(a)),
            Self::Binary(op, a, b) => Self::Binary(*op, r(a), r(b)),
            Self::Where(c, a, b) => Self::Where(r(c), r(a), r(b)),
            Self::Load { buffer, indices } => Self::Load {
                buffer: *buffer,
                indices: indices.iter().map(r).collect(),
            },
        }
    }
}

/// Auxiliary tensor captured by a score modification, held as contiguous f32.
#[derive(Debug, Clone)]
pub struct CapturedBuffer {
    name: String,
    data: Arc<[f32]>,
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl CapturedBuffer {
    /// Copy a host tensor into a captured buffer.
    ///
    /// # Errors
    /// Returns an error if the tensor cannot be converted to f32.
    pub fn from_tensor(name: &str, tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let mut strides = vec![1; shape.len()];
        for axis in (0..shape.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * shape[axis + 1];
        }
        Ok(Self {
            name: name.to_owned(),
            data: data.into(),
            shape,
            strides,
        })
    }

    /// Buffer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffer shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of axes.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Contiguous element data.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_index(value: f64, extent: usize, buffer: &CapturedBuffer, axis: usize) -> Result<usize> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && (value as usize) < extent {
        Ok(value as usize)
    } else {
        Err(FlexAttnError::Kernel(format!(
            "index {value} out of bounds for axis {axis} of `{}` with shape {:?}",
            buffer.name, buffer.shape
        )))
    }
}

/// Where a score tile sits in the (query, key) index space.
///
/// `QueryMajor` tiles are laid out `[query][key]` (forward, query phase of the
/// backward); `KeyMajor` tiles are `[key][query]` (key/value phase).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileLayout {
    /// Rows are queries.
    QueryMajor,
    /// Rows are keys.
    KeyMajor,
}

/// A block of scores together with its absolute coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreTile {
    /// Batch index of every element.
    pub batch: usize,
    /// Head index of every element.
    pub head: usize,
    /// Absolute query positions covered.
    pub query: Range<usize>,
    /// Absolute key/value positions covered.
    pub key: Range<usize>,
    /// Element ordering.
    pub layout: TileLayout,
}

impl ScoreTile {
    /// Number of elements in the tile.
    #[must_use]
    pub fn len(&self) -> usize {
        self.query.len() * self.key.len()
    }

    /// Whether the tile is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute `(query, key)` position of element `e`.
    #[must_use]
    pub fn coords(&self, e: usize) -> (usize, usize) {
        match self.layout {
            TileLayout::QueryMajor => {
                let cols = self.key.len();
                (self.query.start + e / cols, self.key.start + e % cols)
            }
            TileLayout::KeyMajor => {
                let rows = self.query.len();
                (self.query.start + e % rows, self.key.start + e / rows)
            }
        }
    }
}

/// Per-unit register storage reused across tiles.
#[derive(Debug, Default)]
pub struct Scratch {
    regs: Vec<Vec<f64>>,
}

/// Builder used by the lowering rules to assemble a fused program.
#[derive(Debug, Default)]
pub struct ExprBuilder {
    instrs: Vec<Instr>,
    inputs: HashMap<Sentinel, Reg>,
    buffers: Vec<CapturedBuffer>,
}

impl ExprBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, instr: Instr) -> Reg {
        self.instrs.push(instr);
        Reg(self.instrs.len() - 1)
    }

    /// Register reading `sentinel` (shared between uses).
    pub fn input(&mut self, sentinel: Sentinel) -> Reg {
        if let Some(reg) = self.inputs.get(&sentinel) {
            return *reg;
        }
        let reg = self.push(Instr::Input(sentinel));
        self.inputs.insert(sentinel, reg);
        reg
    }

    /// Broadcast constant.
    pub fn constant(&mut self, value: f64) -> Reg {
        self.push(Instr::Const(value))
    }

    /// Elementwise unary op.
    pub fn unary(&mut self, op: UnaryOp, a: Reg) -> Reg {
        self.push(Instr::Unary(op, a))
    }

    /// Elementwise binary op.
    pub fn binary(&mut self, op: BinaryOp, a: Reg, b: Reg) -> Reg {
        self.push(Instr::Binary(op, a, b))
    }

    /// Elementwise select.
    pub fn select(&mut self, cond: Reg, a: Reg, b: Reg) -> Reg {
        self.push(Instr::Where(cond, a, b))
    }

    /// Make a captured buffer addressable from the program.
    pub fn capture(&mut self, buffer: CapturedBuffer) -> BufferId {
        self.buffers.push(buffer);
        BufferId(self.buffers.len() - 1)
    }

    /// Look up a captured buffer.
    #[must_use]
    pub fn buffer(&self, id: BufferId) -> &CapturedBuffer {
        &self.buffers[id.0]
    }

    /// Gather `buffer[indices...]`.
    ///
    /// # Errors
    /// Returns an error if the number of indices does not match the buffer rank.
    pub fn load(&mut self, buffer: BufferId, indices: Vec<Reg>) -> Result<Reg> {
        let rank = self.buffer(buffer).rank();
        if indices.len() != rank {
            return Err(FlexAttnError::Lowering {
                op: "aten.index".into(),
                reason: format!(
                    "`{}` has rank {rank} but was indexed with {} indices",
                    self.buffer(buffer).name(),
                    indices.len()
                ),
            });
        }
        Ok(self.push(Instr::Load { buffer, indices }))
    }

    /// Seal the program with `result` as its output, dropping dead instructions.
    #[must_use]
    pub fn finish(self, result: Reg, role: SubgraphRole) -> FusedScoreExpression {
        let mut live = vec![false; self.instrs.len()];
        live[result.0] = true;
        for idx in (0..self.instrs.len()).rev() {
            if live[idx] {
                for operand in self.instrs[idx].operands() {
                    live[operand.0] = true;
                }
            }
        }

        let mut map = vec![usize::MAX; self.instrs.len()];
        let mut instrs = Vec::new();
        for (idx, instr) in self.instrs.iter().enumerate() {
            if live[idx] {
                map[idx] = instrs.len();
                instrs.push(instr.remap(&map));
            }
        }

        let reads = instrs
            .iter()
            .filter_map(|i| match i {
                Instr::Input(s) => Some(*s),
                _ => None,
            })
            .collect();

        FusedScoreExpression {
            role,
            instrs,
            result: Reg(map[result.0]),
            buffers: self.buffers,
            reads,
        }
    }
}

/// A score modification bound to concrete inputs, ready to be inlined.
#[derive(Debug, Clone)]
pub struct FusedScoreExpression {
    role: SubgraphRole,
    instrs: Vec<Instr>,
    result: Reg,
    buffers: Vec<CapturedBuffer>,
    reads: HashSet<Sentinel>,
}

impl FusedScoreExpression {
    /// Role the expression was built for.
    #[must_use]
    pub fn role(&self) -> SubgraphRole {
        self.role
    }

    /// Live instructions, in evaluation order.
    #[must_use]
    pub fn instructions(&self) -> &[Instr] {
        &self.instrs
    }

    /// Whether the expression reads `sentinel`.
    #[must_use]
    pub fn reads(&self, sentinel: Sentinel) -> bool {
        self.reads.contains(&sentinel)
    }

    /// Captured buffers referenced by the program.
    #[must_use]
    pub fn buffers(&self) -> &[CapturedBuffer] {
        &self.buffers
    }

    /// Fresh scratch space for [`apply`](Self::apply).
    #[must_use]
    pub fn scratch(&self) -> Scratch {
        Scratch {
            regs: vec![Vec::new(); self.instrs.len()],
        }
    }

    /// Evaluate the modification over one tile.
    ///
    /// `score` and `grad_score` are laid out as described by `tile.layout`;
    /// the modified values are written to `out`.
    ///
    /// # Errors
    /// Returns an error on length mismatches, a missing `grad_score` for a
    /// joint expression, or an out-of-bounds load from a captured buffer.
    #[allow(clippy::cast_precision_loss)]
    pub fn apply(
        &self,
        tile: &ScoreTile,
        score: &[f32],
        grad_score: Option<&[f32]>,
        scratch: &mut Scratch,
        out: &mut [f32],
    ) -> Result<()> {
        let len = tile.len();
        if score.len() != len || out.len() != len {
            return Err(FlexAttnError::Kernel(format!(
                "score tile holds {} values and output {} but tile covers {len}",
                score.len(),
                out.len()
            )));
        }
        if scratch.regs.len() != self.instrs.len() {
            *scratch = self.scratch();
        }

        for (idx, instr) in self.instrs.iter().enumerate() {
            let (done, rest) = scratch.regs.split_at_mut(idx);
            let dst = &mut rest[0];
            dst.clear();
            match instr {
                Instr::Input(sentinel) => match sentinel {
                    Sentinel::Score => dst.extend(score.iter().map(|&s| f64::from(s))),
                    Sentinel::GradScore => {
                        let grad = grad_score.ok_or_else(|| {
                            FlexAttnError::Kernel(
                                "joint expression evaluated without grad_score".into(),
                            )
                        })?;
                        if grad.len() != len {
                            return Err(FlexAttnError::Kernel(format!(
                                "grad_score tile holds {} values, expected {len}",
                                grad.len()
                            )));
                        }
                        dst.extend(grad.iter().map(|&g| f64::from(g)));
                    }
                    Sentinel::Batch => dst.resize(len, tile.batch as f64),
                    Sentinel::Head => dst.resize(len, tile.head as f64),
                    Sentinel::Query => dst.extend((0..len).map(|e| tile.coords(e).0 as f64)),
                    Sentinel::Key => dst.extend((0..len).map(|e| tile.coords(e).1 as f64)),
                },
                Instr::Const(value) => dst.resize(len, *value),
                Instr::Unary(op, a) => dst.extend(done[a.0].iter().map(|&x| op.eval(x))),
                Instr::Binary(op, a, b) => dst.extend(
                    done[a.0]
                        .iter()
                        .zip(&done[b.0])
                        .map(|(&x, &y)| op.eval(x, y)),
                ),
                Instr::Where(c, a, b) => dst.extend(
                    done[c.0]
                        .iter()
                        .zip(done[a.0].iter().zip(&done[b.0]))
                        .map(|(&c, (&x, &y))| if c != 0.0 { x } else { y }),
                ),
                Instr::Load { buffer, indices } => {
                    let buf = &self.buffers[buffer.0];
                    for e in 0..len {
                        let mut offset = 0;
                        for (axis, reg) in indices.iter().enumerate() {
                            let i = to_index(done[reg.0][e], buf.shape[axis], buf, axis)?;
                            offset += i * buf.strides[axis];
                        }
                        dst.push(f64::from(buf.data[offset]));
                    }
                }
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        for (o, &v) in out.iter_mut().zip(&scratch.regs[self.result.0]) {
            *o = v as f32;
        }
        Ok(())
    }

    /// Check that `f(c * s) == c * f(s)` at a few in-bounds positions.
    ///
    /// The first and last batch and head are sampled, each at the leading
    /// and trailing corners of the score matrix. Only modifications that
    /// pass may have the base-2 rescale folded into the query ahead of the
    /// modification.
    ///
    /// # Errors
    /// Propagates evaluation errors (e.g. captured buffers too small for the problem).
    pub fn probe_linear(
        &self,
        batch: usize,
        heads: usize,
        q_len: usize,
        kv_len: usize,
    ) -> Result<bool> {
        const PROBES: [f32; 4] = [-2.5, -0.5, 0.75, 3.0];

        if batch == 0 || heads == 0 || q_len == 0 || kv_len == 0 {
            return Ok(true);
        }
        let corners = |len: usize| {
            let width = len.min(2);
            [0..width, len - width..len]
        };

        let mut scratch = self.scratch();
        let mut base = Vec::new();
        let mut scaled = Vec::new();
        for (z, h) in [(0, 0), (0, heads - 1), (batch - 1, 0), (batch - 1, heads - 1)] {
            for query in corners(q_len) {
                for key in corners(kv_len) {
                    let tile = ScoreTile {
                        batch: z,
                        head: h,
                        query: query.clone(),
                        key,
                        layout: TileLayout::QueryMajor,
                    };
                    let len = tile.len();
                    base.resize(len, 0.0);
                    scaled.resize(len, 0.0);
                    for s in PROBES {
                        self.apply(&tile, &vec![s; len], None, &mut scratch, &mut base)?;
                        let rescaled = vec![s * LOG2_E; len];
                        self.apply(&tile, &rescaled, None, &mut scratch, &mut scaled)?;
                        let homogeneous = base.iter().zip(&scaled).all(|(&b, &c)| {
                            let expected = b * LOG2_E;
                            expected == c
                                || (expected - c).abs() <= 1e-4 * expected.abs().max(1.0)
                        });
                        if !homogeneous {
                            return Ok(false);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    /// Render the program as Triton-style statements ending in `output_name = ...`.
    ///
    /// `bind` supplies the source expression for each sentinel; captured
    /// buffers are addressed as `in_ptr{k}` with contiguous strides.
    #[must_use]
    pub fn render(&self, output_name: &str, bind: &dyn Fn(Sentinel) -> String) -> String {
        let tmp = |r: &Reg| format!("tmp{}", r.0);
        let mut src = String::new();
        for (idx, instr) in self.instrs.iter().enumerate() {
            let rhs = match instr {
                Instr::Input(s) => bind(*s),
                Instr::Const(v) => render_const(*v),
                Instr::Unary(op, a) => op.render(&tmp(a)),
                Instr::Binary(op, a, b) => op.render(&tmp(a), &tmp(b)),
                Instr::Where(c, a, b) => format!("tl.where({}, {}, {})", tmp(c), tmp(a), tmp(b)),
                Instr::Load { buffer, indices } => {
                    let strides = &self.buffers[buffer.0].strides;
                    let offset = indices
                        .iter()
                        .zip(strides)
                        .map(|(r, s)| format!("{} * {s}", tmp(r)))
                        .collect::<Vec<_>>();
                    let offset = if offset.is_empty() {
                        "0".to_owned()
                    } else {
                        offset.join(" + ")
                    };
                    format!("tl.load(in_ptr{} + ({offset}))", buffer.0)
                }
            };
            let _ = writeln!(src, "tmp{idx} = {rhs}");
        }
        let _ = write!(src, "{output_name} = tmp{}", self.result.0);
        src
    }
}

fn render_const(v: f64) -> String {
    if v.is_nan() {
        "float(\"nan\")".to_owned()
    } else if v == f64::INFINITY {
        "float(\"inf\")".to_owned()
    } else if v == f64::NEG_INFINITY {
        "float(\"-inf\")".to_owned()
    } else {
        format!("{v:?}")
    }
}
