// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Prebuilt score modifications.
//!
//! Each is a forward graph plus its joint (gradient) graph, laid out the way
//! traced graphs are: placeholders `score, b, h, m, n` (joint graphs add
//! `grad_score_mod`), captured tensors lifted to trailing placeholders, and
//! joint outputs of the form `(grad, None, None, None, None)`.

use crate::graph::{Arg, GraphBuilder, NodeId, ScoreModGraph};
use crate::kernels::modification::Op;

/// Forward and joint graphs of one score modification.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMod {
    /// `(score, b, h, m, n, *captured) -> modified score`.
    pub forward: ScoreModGraph,
    /// `(score, b, h, m, n, grad, *captured) -> (grad_score, None, ...)`.
    pub joint: ScoreModGraph,
}

struct Inputs {
    score: NodeId,
    head: NodeId,
    query: NodeId,
    key: NodeId,
}

fn score_inputs(g: &mut GraphBuilder) -> Inputs {
    let score = g.placeholder("score");
    g.placeholder("b");
    let head = g.placeholder("h");
    let query = g.placeholder("m");
    let key = g.placeholder("n");
    Inputs {
        score,
        head,
        query,
        key,
    }
}

/// Builds the forward graph and a joint graph whose gradient is `grad_fn`.
fn pair(
    captured: &[&str],
    forward: impl Fn(&mut GraphBuilder, &Inputs, &[NodeId]) -> NodeId,
    grad_fn: impl Fn(&mut GraphBuilder, &Inputs, NodeId) -> NodeId,
) -> ScoreMod {
    let mut g = ScoreModGraph::builder();
    let inputs = score_inputs(&mut g);
    let lifted: Vec<_> = captured.iter().map(|name| g.placeholder(name)).collect();
    let out = forward(&mut g, &inputs, &lifted);
    g.output(out.into());
    let forward = g.build();

    let mut g = ScoreModGraph::builder();
    let inputs = score_inputs(&mut g);
    let grad = g.placeholder("grad_score_mod");
    for name in captured {
        g.placeholder(name);
    }
    let grad_score = grad_fn(&mut g, &inputs, grad);
    g.output(Arg::Tuple(vec![
        grad_score.into(),
        Arg::None,
        Arg::None,
        Arg::None,
        Arg::None,
    ]));
    ScoreMod {
        forward,
        joint: g.build(),
    }
}

/// `score`
#[must_use]
pub fn identity() -> ScoreMod {
    pair(&[], |_, x, _| x.score, |_, _, grad| grad)
}

/// `score * scale`
#[must_use]
pub fn scaled(scale: f64) -> ScoreMod {
    pair(
        &[],
        move |g, x, _| g.call(Op::Mul, vec![x.score.into(), scale.into()]),
        move |g, _, grad| g.call(Op::Mul, vec![grad.into(), scale.into()]),
    )
}

/// `-inf` where the key is after the query.
#[must_use]
pub fn causal() -> ScoreMod {
    pair(
        &[],
        |g, x, _| {
            let future = g.call(Op::Gt, vec![x.key.into(), x.query.into()]);
            g.call(
                Op::Where,
                vec![future.into(), f64::NEG_INFINITY.into(), x.score.into()],
            )
        },
        |g, x, grad| {
            let future = g.call(Op::Gt, vec![x.key.into(), x.query.into()]);
            g.call(Op::Where, vec![future.into(), Arg::Float(0.0), grad.into()])
        },
    )
}

/// `score + bias[m, n]` with a captured `[M, N]` bias.
#[must_use]
pub fn relative_bias() -> ScoreMod {
    pair(
        &["bias"],
        |g, x, lifted| {
            let bias = g.call(
                Op::Index,
                vec![
                    lifted[0].into(),
                    Arg::Tuple(vec![x.query.into(), x.key.into()]),
                ],
            );
            g.call(Op::Add, vec![x.score.into(), bias.into()])
        },
        |_, _, grad| grad,
    )
}

/// `score + slopes[h] * (n - m)` with captured per-head slopes.
#[must_use]
pub fn alibi() -> ScoreMod {
    pair(
        &["slopes"],
        |g, x, lifted| {
            let slope = g.call(
                Op::Index,
                vec![lifted[0].into(), Arg::Tuple(vec![x.head.into()])],
            );
            let distance = g.call(Op::Sub, vec![x.key.into(), x.query.into()]);
            let bias = g.call(Op::Mul, vec![slope.into(), distance.into()]);
            g.call(Op::Add, vec![x.score.into(), bias.into()])
        },
        |_, _, grad| grad,
    )
}

/// Standard ALiBi slopes `2^(-8 (h + 1) / H)`.
#[must_use]
pub fn alibi_slopes(num_heads: usize) -> Vec<f32> {
    #[allow(clippy::cast_precision_loss)]
    let heads = num_heads as f32;
    (0..num_heads)
        .map(|h| {
            #[allow(clippy::cast_precision_loss)]
            let exponent = -8.0 * (h as f32 + 1.0) / heads;
            exponent.exp2()
        })
        .collect()
}

/// `cap * tanh(score / cap)`.
#[must_use]
pub fn soft_cap(cap: f64) -> ScoreMod {
    pair(
        &[],
        move |g, x, _| {
            let scaled = g.call(Op::Div, vec![x.score.into(), cap.into()]);
            let t = g.call(Op::Tanh, vec![scaled.into()]);
            g.call(Op::Mul, vec![t.into(), cap.into()])
        },
        move |g, x, grad| {
            let scaled = g.call(Op::Div, vec![x.score.into(), cap.into()]);
            let t = g.call(Op::Tanh, vec![scaled.into()]);
            let t2 = g.call(Op::Mul, vec![t.into(), t.into()]);
            let dtanh = g.call(Op::Sub, vec![Arg::Float(1.0), t2.into()]);
            g.call(Op::Mul, vec![grad.into(), dtanh.into()])
        },
    )
}
