// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Node-list IR for score-modification graphs.
//!
//! A score modification (and its gradient, the "joint" graph) arrives as a
//! traced graph: an ordered list of placeholder, call and output nodes. Nodes
//! may only reference nodes declared before them, so declaration order is
//! also evaluation order.
//!
//! ```rust
//! use flex_attn_rs::graph::{Arg, ScoreModGraph};
//! use flex_attn_rs::kernels::modification::Op;
//!
//! // score * 0.125
//! let mut g = ScoreModGraph::builder();
//! let score = g.placeholder("score");
//! for name in ["b", "h", "m", "n"] {
//!     g.placeholder(name);
//! }
//! let scaled = g.call(Op::Mul, vec![score.into(), Arg::Float(0.125)]);
//! g.output(scaled.into());
//! let graph = g.build();
//! assert_eq!(graph.num_placeholders(), 5);
//! ```

use std::fmt;

use crate::kernels::modification::Op;

/// Identifier of a node inside one [`ScoreModGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position of the node in declaration order.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Argument of a call or output node.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Value produced by an earlier node.
    Node(NodeId),
    /// Floating point literal.
    Float(f64),
    /// Integer literal.
    Int(i64),
    /// Boolean literal.
    Bool(bool),
    /// Tuple of arguments (index lists, multi-value outputs).
    Tuple(Vec<Arg>),
    /// Absent value, e.g. the gradient slots of non-differentiable inputs.
    None,
}

impl From<NodeId> for Arg {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Kind of a graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Free variable bound positionally by the inliner.
    Placeholder {
        /// Name given at trace time.
        name: String,
    },
    /// Application of an operation from the lowering table.
    CallFunction {
        /// Operation identity.
        target: Op,
        /// Positional arguments.
        args: Vec<Arg>,
    },
    /// Graph result.
    Output {
        /// Returned value (a tuple for joint graphs).
        value: Arg,
    },
}

/// One node of a [`ScoreModGraph`].
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Node identifier.
    pub id: NodeId,
    /// Node kind and payload.
    pub kind: NodeKind,
}

/// Ordered node list describing a score modification or its gradient.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreModGraph {
    nodes: Vec<Node>,
}

impl ScoreModGraph {
    /// Start building a new graph.
    #[must_use]
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    /// Nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of placeholder nodes.
    #[must_use]
    pub fn num_placeholders(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Placeholder { .. }))
            .count()
    }
}

/// Incremental builder for [`ScoreModGraph`].
///
/// The builder does not require an output node; graphs without one are
/// rejected later, when the inliner walks them.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    fn push(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { id, kind });
        id
    }

    /// Declare the next placeholder.
    pub fn placeholder(&mut self, name: &str) -> NodeId {
        self.push(NodeKind::Placeholder {
            name: name.to_owned(),
        })
    }

    /// Append an operation node.
    pub fn call(&mut self, target: Op, args: Vec<Arg>) -> NodeId {
        self.push(NodeKind::CallFunction { target, args })
    }

    /// Append the output node.
    pub fn output(&mut self, value: Arg) -> NodeId {
        self.push(NodeKind::Output { value })
    }

    /// Finish the graph.
    #[must_use]
    pub fn build(self) -> ScoreModGraph {
        ScoreModGraph { nodes: self.nodes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_preserves_declaration_order() {
        let mut g = ScoreModGraph::builder();
        let a = g.placeholder("score");
        let b = g.placeholder("b");
        let sum = g.call(Op::Add, vec![a.into(), b.into()]);
        g.output(sum.into());
        let graph = g.build();

        assert_eq!(graph.nodes().len(), 4);
        assert_eq!(graph.num_placeholders(), 2);
        assert_eq!(graph.nodes()[2].id, sum);
        assert!(matches!(graph.nodes()[3].kind, NodeKind::Output { .. }));
    }

    #[test]
    fn test_arg_conversions() {
        assert_eq!(Arg::from(1.5), Arg::Float(1.5));
        assert_eq!(Arg::from(3_i64), Arg::Int(3));
        assert_eq!(Arg::from(true), Arg::Bool(true));
        assert_eq!(NodeId(7).to_string(), "%7");
    }
}
