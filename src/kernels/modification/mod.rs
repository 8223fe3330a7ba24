// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Score-modification inliner.
//!
//! Walks a [`ScoreModGraph`] in declaration order, binds its placeholders to
//! kernel sentinels or captured call arguments, lowers every call node through
//! a [`Lowerings`] table and returns the single fused expression the kernels
//! evaluate inside their tile loops.
//!
//! Placeholder binding is positional. The first placeholders map to the
//! role's sentinels (`score, b, h, m, n` and, for joint-backward graphs,
//! `grad_score_mod`); every later placeholder is a captured buffer taken from
//! the call arguments. The kernel call signatures are
//!
//! ```text
//! forward:  [q, k, v, score_mod, *other_buffers]
//! backward: [q, k, v, out, lse, grad_out, fw_graph, joint_graph, *other_buffers]
//! ```
//!
//! so placeholder number `cnt` (counting sentinels) maps to argument
//! `cnt - 1` in the forward pass, `cnt + 3` for the forward recomputation in
//! the backward pass and `cnt + 2` for the joint graph.

pub mod expr;
pub mod lowering;

use std::collections::HashMap;

use candle_core::Tensor;

pub use expr::{
    BinaryOp, BufferId, CapturedBuffer, ExprBuilder, FusedScoreExpression, Instr, Reg, Scratch,
    ScoreTile, Sentinel, TileLayout, UnaryOp,
};
pub use lowering::{LoweringFn, Lowerings, Op, Value};

use crate::error::{FlexAttnError, Result};
use crate::graph::{Arg, NodeId, NodeKind, ScoreModGraph};

const SCORE_SENTINELS: [Sentinel; 5] = [
    Sentinel::Score,
    Sentinel::Batch,
    Sentinel::Head,
    Sentinel::Query,
    Sentinel::Key,
];

const JOINT_SENTINELS: [Sentinel; 6] = [
    Sentinel::Score,
    Sentinel::Batch,
    Sentinel::Head,
    Sentinel::Query,
    Sentinel::Key,
    Sentinel::GradScore,
];

/// Which graph is being inlined, and into which kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubgraphRole {
    /// Score modification inside the forward kernel.
    Forward,
    /// Score modification recomputed inside the backward kernel.
    JointForward,
    /// Gradient of the score modification inside the backward kernel.
    JointBackward,
}

impl SubgraphRole {
    /// Sentinels bound to the leading placeholders, in order.
    #[must_use]
    pub const fn sentinels(self) -> &'static [Sentinel] {
        match self {
            Self::Forward | Self::JointForward => &SCORE_SENTINELS,
            Self::JointBackward => &JOINT_SENTINELS,
        }
    }

    /// Offset from placeholder counter to call-argument position.
    #[must_use]
    pub const fn other_buffer_offset(self) -> isize {
        match self {
            Self::Forward => -1,
            Self::JointForward => 3,
            Self::JointBackward => 2,
        }
    }

    /// Call-argument position bound to placeholder number `cnt`.
    #[must_use]
    pub const fn other_buffer_index(self, cnt: usize) -> usize {
        cnt.saturating_add_signed(self.other_buffer_offset())
    }
}

/// One positional argument of a kernel call.
#[derive(Debug, Clone, Copy)]
pub enum CallArg<'a> {
    /// Tensor argument (q, k, v, saved outputs or captured buffers).
    Tensor(&'a Tensor),
    /// Graph argument (score mod, joint graph).
    Graph(&'a ScoreModGraph),
}

/// Captured buffers of one call, resolved once per kernel build.
#[derive(Debug, Clone)]
pub struct BindingTable {
    role: SubgraphRole,
    first_buffer: usize,
    buffers: Vec<CapturedBuffer>,
}

impl BindingTable {
    /// Collect the captured buffers of `args` for a graph inlined as `role`.
    ///
    /// # Errors
    /// Returns [`FlexAttnError::Binding`] if the call is too short or a
    /// trailing argument is not a tensor.
    pub fn new(role: SubgraphRole, args: &[CallArg<'_>]) -> Result<Self> {
        let first_buffer = role.other_buffer_index(role.sentinels().len());
        if first_buffer > args.len() {
            return Err(FlexAttnError::Binding(format!(
                "call has {} arguments but {role:?} expects captured buffers \
                 from position {first_buffer}",
                args.len()
            )));
        }
        let buffers = args[first_buffer..]
            .iter()
            .enumerate()
            .map(|(k, arg)| match arg {
                CallArg::Tensor(t) => CapturedBuffer::from_tensor(&format!("other_buffer_{k}"), t),
                CallArg::Graph(_) => Err(FlexAttnError::Binding(format!(
                    "argument {} is a graph, expected a captured tensor",
                    first_buffer + k
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            role,
            first_buffer,
            buffers,
        })
    }

    /// Number of captured buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the call captured nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffer bound to placeholder number `cnt`.
    ///
    /// # Errors
    /// Returns [`FlexAttnError::Binding`] when the placeholder has no argument.
    pub fn resolve(&self, cnt: usize) -> Result<&CapturedBuffer> {
        let position = self.role.other_buffer_index(cnt);
        position
            .checked_sub(self.first_buffer)
            .and_then(|ordinal| self.buffers.get(ordinal))
            .ok_or_else(|| {
                FlexAttnError::Binding(format!(
                    "placeholder {cnt} maps to argument {position}, \
                     but only {} captured buffers were supplied",
                    self.buffers.len()
                ))
            })
    }
}

fn resolve_arg(env: &HashMap<NodeId, Value>, arg: &Arg) -> Result<Value> {
    Ok(match arg {
        Arg::Node(id) => env.get(id).cloned().ok_or_else(|| {
            FlexAttnError::MalformedGraph(format!("{id} is used before it is defined"))
        })?,
        Arg::Float(v) => Value::Scalar(*v),
        #[allow(clippy::cast_precision_loss)]
        Arg::Int(v) => Value::Scalar(*v as f64),
        Arg::Bool(v) => Value::Scalar(if *v { 1.0 } else { 0.0 }),
        Arg::Tuple(items) => Value::Tuple(
            items
                .iter()
                .map(|a| resolve_arg(env, a))
                .collect::<Result<_>>()?,
        ),
        Arg::None => Value::None,
    })
}

/// Inline `graph` against the call `args`, producing one fused expression.
///
/// Nodes are visited in declaration order. Evaluation stops at the first
/// output node; for joint-backward graphs the output is a tuple whose first
/// element is the score gradient.
///
/// # Errors
/// * [`FlexAttnError::MalformedGraph`] if there is no output node or a node
///   references one declared after it.
/// * [`FlexAttnError::OutputContract`] if the output is not a single
///   per-element expression.
/// * [`FlexAttnError::Binding`] / [`FlexAttnError::Lowering`] from
///   placeholder binding and call lowering.
pub fn build_subgraph_buffer(
    args: &[CallArg<'_>],
    graph: &ScoreModGraph,
    role: SubgraphRole,
    lowerings: &Lowerings,
) -> Result<FusedScoreExpression> {
    let table = BindingTable::new(role, args)?;
    let sentinels = role.sentinels();
    let mut builder = ExprBuilder::new();
    let mut env: HashMap<NodeId, Value> = HashMap::new();
    let mut cnt = 0;

    for node in graph.nodes() {
        match &node.kind {
            NodeKind::Placeholder { .. } => {
                let value = match sentinels.get(cnt) {
                    Some(sentinel) => Value::Expr(builder.input(*sentinel)),
                    None => Value::Buffer(builder.capture(table.resolve(cnt)?.clone())),
                };
                env.insert(node.id, value);
                cnt += 1;
            }
            NodeKind::CallFunction { target, args } => {
                let operands = args
                    .iter()
                    .map(|a| resolve_arg(&env, a))
                    .collect::<Result<Vec<_>>>()?;
                let value = lowerings.lower(*target, &mut builder, &operands)?;
                env.insert(node.id, value);
            }
            NodeKind::Output { value } => {
                let returned = match (role, value) {
                    (SubgraphRole::JointBackward, Arg::Tuple(items)) => items
                        .first()
                        .ok_or_else(|| FlexAttnError::OutputContract("an empty tuple".into()))?,
                    (SubgraphRole::JointBackward, _) => {
                        return Err(FlexAttnError::OutputContract(
                            "a joint graph result that is not a tuple".into(),
                        ))
                    }
                    _ => value,
                };
                return match resolve_arg(&env, returned)? {
                    Value::Expr(reg) => {
                        let expr = builder.finish(reg, role);
                        tracing::debug!(
                            ?role,
                            instructions = expr.instructions().len(),
                            captured = expr.buffers().len(),
                            "inlined score modification"
                        );
                        Ok(expr)
                    }
                    other => Err(FlexAttnError::OutputContract(format!("a {}", other.kind()))),
                };
            }
        }
    }

    Err(FlexAttnError::MalformedGraph(
        "score-mod graph has no output node".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn qkv() -> Tensor {
        Tensor::zeros((1, 1, 2, 2), candle_core::DType::F32, &Device::Cpu).unwrap()
    }

    fn bias_graph() -> ScoreModGraph {
        let mut g = ScoreModGraph::builder();
        let score = g.placeholder("score");
        g.placeholder("b");
        g.placeholder("h");
        let m = g.placeholder("m");
        let n = g.placeholder("n");
        let bias = g.placeholder("bias");
        let val = g.call(Op::Index, vec![bias.into(), Arg::Tuple(vec![m.into(), n.into()])]);
        let out = g.call(Op::Add, vec![score.into(), val.into()]);
        g.output(out.into());
        g.build()
    }

    #[test]
    fn test_offsets_per_role() {
        assert_eq!(SubgraphRole::Forward.other_buffer_index(5), 4);
        assert_eq!(SubgraphRole::JointForward.other_buffer_index(5), 8);
        assert_eq!(SubgraphRole::JointBackward.other_buffer_index(6), 8);
        assert_eq!(SubgraphRole::JointBackward.sentinels().len(), 6);
    }

    #[test]
    fn test_forward_binds_captured_buffer() {
        let t = qkv();
        let bias = Tensor::new(&[[0.0f32, 1.0], [2.0, 3.0]], &Device::Cpu).unwrap();
        let graph = bias_graph();
        let args = [
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Graph(&graph),
            CallArg::Tensor(&bias),
        ];
        let expr =
            build_subgraph_buffer(&args, &graph, SubgraphRole::Forward, &Lowerings::default())
                .unwrap();
        assert_eq!(expr.buffers().len(), 1);
        assert_eq!(expr.buffers()[0].shape(), &[2, 2]);
        assert!(expr.reads(Sentinel::Query));
    }

    #[test]
    fn test_joint_forward_binds_same_buffer_in_backward_call() {
        let t = qkv();
        let bias = Tensor::new(&[[0.0f32, 1.0], [2.0, 3.0]], &Device::Cpu).unwrap();
        let graph = bias_graph();
        let args = [
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Graph(&graph),
            CallArg::Graph(&graph),
            CallArg::Tensor(&bias),
        ];
        let expr = build_subgraph_buffer(
            &args,
            &graph,
            SubgraphRole::JointForward,
            &Lowerings::default(),
        )
        .unwrap();
        assert_eq!(expr.buffers()[0].data(), &[0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_missing_buffer_is_a_binding_error() {
        let t = qkv();
        let graph = bias_graph();
        let args = [
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Graph(&graph),
        ];
        let err =
            build_subgraph_buffer(&args, &graph, SubgraphRole::Forward, &Lowerings::default());
        assert!(matches!(err, Err(FlexAttnError::Binding(_))));
    }

    #[test]
    fn test_graph_in_buffer_slot_is_rejected() {
        let t = qkv();
        let graph = bias_graph();
        let args = [
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Graph(&graph),
            CallArg::Graph(&graph),
        ];
        assert!(BindingTable::new(SubgraphRole::Forward, &args).is_err());
    }

    #[test]
    fn test_missing_output_is_malformed() {
        let t = qkv();
        let mut g = ScoreModGraph::builder();
        for name in ["score", "b", "h", "m", "n"] {
            g.placeholder(name);
        }
        let graph = g.build();
        let args = [
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Graph(&graph),
        ];
        let err =
            build_subgraph_buffer(&args, &graph, SubgraphRole::Forward, &Lowerings::default());
        assert!(matches!(err, Err(FlexAttnError::MalformedGraph(_))));
    }

    #[test]
    fn test_scalar_output_violates_contract() {
        let t = qkv();
        let mut g = ScoreModGraph::builder();
        for name in ["score", "b", "h", "m", "n"] {
            g.placeholder(name);
        }
        let c = g.call(Op::Add, vec![Arg::Float(1.0), Arg::Float(2.0)]);
        g.output(c.into());
        let graph = g.build();
        let args = [
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Graph(&graph),
        ];
        let err =
            build_subgraph_buffer(&args, &graph, SubgraphRole::Forward, &Lowerings::default());
        assert!(matches!(err, Err(FlexAttnError::OutputContract(_))));
    }

    #[test]
    fn test_joint_output_takes_first_tuple_element() {
        let t = qkv();
        let mut g = ScoreModGraph::builder();
        for name in ["score", "b", "h", "m", "n"] {
            g.placeholder(name);
        }
        let grad = g.placeholder("grad_score_mod");
        let doubled = g.call(Op::Mul, vec![grad.into(), Arg::Float(2.0)]);
        g.output(Arg::Tuple(vec![
            doubled.into(),
            Arg::None,
            Arg::None,
            Arg::None,
            Arg::None,
        ]));
        let graph = g.build();
        let args: Vec<CallArg<'_>> = (0..6)
            .map(|_| CallArg::Tensor(&t))
            .chain([CallArg::Graph(&graph), CallArg::Graph(&graph)])
            .collect();
        let expr = build_subgraph_buffer(
            &args,
            &graph,
            SubgraphRole::JointBackward,
            &Lowerings::default(),
        )
        .unwrap();
        assert!(expr.reads(Sentinel::GradScore));
        assert!(!expr.reads(Sentinel::Score));
    }

    #[test]
    fn test_forward_reference_is_malformed() {
        let t = qkv();
        let mut g = ScoreModGraph::builder();
        let score = g.placeholder("score");
        for name in ["b", "h", "m", "n"] {
            g.placeholder(name);
        }
        let ahead = NodeId(score.index() + 7);
        let bad = g.call(Op::Add, vec![score.into(), ahead.into()]);
        g.output(bad.into());
        let graph = g.build();
        let args = [
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Tensor(&t),
            CallArg::Graph(&graph),
        ];
        let err =
            build_subgraph_buffer(&args, &graph, SubgraphRole::Forward, &Lowerings::default());
        assert!(matches!(err, Err(FlexAttnError::MalformedGraph(_))));
    }
}
