// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Host entry points: inline the score modification, emit one kernel per
//! candidate tile configuration, autotune, and hand back candle tensors.
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use flex_attn_rs::kernels::config::FlexAttentionConfig;
//! use flex_attn_rs::kernels::flex_attention::flex_attention;
//! use flex_attn_rs::score_mods;
//!
//! # fn main() -> flex_attn_rs::Result<()> {
//! let q = Tensor::randn(0.0f32, 1.0, (1, 2, 8, 16), &Device::Cpu)?;
//! let k = Tensor::randn(0.0f32, 1.0, (1, 2, 8, 16), &Device::Cpu)?;
//! let v = Tensor::randn(0.0f32, 1.0, (1, 2, 8, 16), &Device::Cpu)?;
//! let causal = score_mods::causal();
//! let out = flex_attention(&q, &k, &v, &causal.forward, &[], &FlexAttentionConfig::default())?;
//! assert_eq!(out.output.dims(), &[1, 2, 8, 16]);
//! # Ok(())
//! # }
//! ```

use std::f32::consts::{LN_2, LOG2_E};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use super::autotune::{allclose, select_algorithm};
use super::backward::{compute_delta, BackwardInputs, BackwardKernel, BackwardOptions};
use super::config::{backward_candidates, forward_candidates, FlexAttentionConfig};
use super::forward::{ForwardInputs, ForwardKernel, ForwardOptions};
use super::modification::{build_subgraph_buffer, CallArg, Lowerings, SubgraphRole};
use super::problem::AttentionProblem;
use crate::error::{FlexAttnError, Result};
use crate::graph::ScoreModGraph;
use crate::score_mods::ScoreMod;

const ATOL: f32 = 1e-4;
const RTOL: f32 = 1e-3;

/// Forward result.
#[derive(Debug, Clone)]
pub struct FlexAttentionOutput {
    /// Attention output, same shape and dtype as the query.
    pub output: Tensor,
    /// Natural-log logsumexp per query row, `[Z, H, M]`, F32.
    pub logsumexp: Option<Tensor>,
}

/// Backward result.
#[derive(Debug, Clone)]
pub struct FlexAttentionGrads {
    /// Gradient w.r.t. the query.
    pub grad_query: Tensor,
    /// Gradient w.r.t. the key.
    pub grad_key: Tensor,
    /// Gradient w.r.t. the value.
    pub grad_value: Tensor,
}

/// Tensors saved from the forward pass plus the incoming gradient.
#[derive(Debug, Clone, Copy)]
pub struct BackwardArgs<'a> {
    /// Query, `[Z, H, M, D]`.
    pub query: &'a Tensor,
    /// Key, `[Z, H, N, D]`.
    pub key: &'a Tensor,
    /// Value, `[Z, H, N, D]`.
    pub value: &'a Tensor,
    /// Forward output, `[Z, H, M, D]`.
    pub out: &'a Tensor,
    /// Natural-log logsumexp from the forward pass, `[Z, H, M]`.
    pub logsumexp: &'a Tensor,
    /// Gradient of the output, `[Z, H, M, D]`.
    pub grad_out: &'a Tensor,
}

fn to_host(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?)
}

fn from_host(data: Vec<f32>, dims: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(data, dims, &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)?)
}

/// Emit one kernel per valid candidate, skipping invalid ones with a warning.
fn emit<T: std::fmt::Debug + Copy, K>(
    name: &str,
    candidates: Vec<T>,
    build: impl Fn(T) -> Result<K>,
) -> Result<Vec<K>> {
    let mut kernels = Vec::with_capacity(candidates.len());
    let mut last_error = None;
    for tiles in candidates {
        match build(tiles) {
            Ok(kernel) => kernels.push(kernel),
            Err(e) => {
                tracing::warn!(
                    kernel = name,
                    ?tiles,
                    error = %e,
                    "skipping invalid tile configuration"
                );
                last_error = Some(e);
            }
        }
    }
    match (kernels.is_empty(), last_error) {
        (true, Some(e)) => Err(e),
        (true, None) => Err(FlexAttnError::InvalidConfig(format!(
            "no tile configurations for {name}"
        ))),
        _ => Ok(kernels),
    }
}

/// Attention with a user-defined score modification.
///
/// `score_mod` is called with `[query, key, value, score_mod, *other_buffers]`;
/// placeholders after `score, b, h, m, n` bind to `other_buffers` in order.
/// No implicit `1/sqrt(D)` scaling is applied; use a scaling score mod.
///
/// # Errors
/// Returns an error for invalid shapes, malformed or unlowerable graphs,
/// invalid pinned tiles, a non-linear modification declared linear, or when
/// every candidate kernel fails.
pub fn flex_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    score_mod: &ScoreModGraph,
    other_buffers: &[Tensor],
    config: &FlexAttentionConfig,
) -> Result<FlexAttentionOutput> {
    let problem = AttentionProblem::from_tensors(query, key, value)?;

    let mut args = vec![
        CallArg::Tensor(query),
        CallArg::Tensor(key),
        CallArg::Tensor(value),
        CallArg::Graph(score_mod),
    ];
    args.extend(other_buffers.iter().map(CallArg::Tensor));
    let fused = Arc::new(build_subgraph_buffer(
        &args,
        score_mod,
        SubgraphRole::Forward,
        &Lowerings::default(),
    )?);

    if config.score_mod_is_linear
        && !fused.probe_linear(problem.batch, problem.heads, problem.q_len, problem.kv_len)?
    {
        return Err(FlexAttnError::InvalidConfig(
            "score_mod_is_linear is set but the score modification is not a linear rescaling"
                .into(),
        ));
    }

    let options = ForwardOptions {
        score_mod_is_linear: config.score_mod_is_linear,
        rows_guaranteed_safe: config.rows_guaranteed_safe,
        output_logsumexp: config.output_logsumexp,
    };
    let candidates = match config.forward_tiles {
        Some(tiles) => vec![tiles],
        None => forward_candidates(
            problem.dtype,
            problem.head_dim,
            config.tier(),
            config.max_autotune,
        ),
    };
    let kernels = emit("flex_attention", candidates, |tiles| {
        ForwardKernel::new(tiles, Arc::clone(&fused), options)
    })?;

    let q = to_host(query)?;
    let k = to_host(key)?;
    let v = to_host(value)?;
    let inputs = ForwardInputs {
        problem: &problem,
        query: &q,
        key: &k,
        value: &v,
    };
    let selection = select_algorithm(
        "flex_attention",
        kernels,
        ForwardKernel::name,
        |kernel| kernel.run(&inputs),
        |a, b| {
            allclose(&b.output, &a.output, ATOL, RTOL)
                && allclose(&b.logsumexp, &a.logsumexp, ATOL, RTOL)
        },
    )?;

    let buffers = selection.output;
    let output = from_host(buffers.output, query.dims(), query.dtype(), query.device())?;
    let logsumexp = if config.output_logsumexp {
        let natural: Vec<f32> = buffers.logsumexp.iter().map(|l| l * LN_2).collect();
        Some(from_host(natural, &problem.lse_shape(), DType::F32, query.device())?)
    } else {
        None
    };
    Ok(FlexAttentionOutput { output, logsumexp })
}

/// Gradients of [`flex_attention`] w.r.t. query, key and value.
///
/// The graphs are called with
/// `[query, key, value, out, logsumexp, grad_out, fw_graph, joint_graph, *other_buffers]`.
///
/// # Errors
/// Returns an error for inconsistent shapes, malformed graphs, invalid pinned
/// tiles or when every candidate kernel fails.
pub fn flex_attention_backward(
    saved: &BackwardArgs<'_>,
    score_mod: &ScoreMod,
    other_buffers: &[Tensor],
    config: &FlexAttentionConfig,
) -> Result<FlexAttentionGrads> {
    let problem = AttentionProblem::from_tensors(saved.query, saved.key, saved.value)?;
    AttentionProblem::expect_shape(saved.out, &problem.output_shape())?;
    AttentionProblem::expect_shape(saved.grad_out, &problem.output_shape())?;
    AttentionProblem::expect_shape(saved.logsumexp, &problem.lse_shape())?;

    let mut args = vec![
        CallArg::Tensor(saved.query),
        CallArg::Tensor(saved.key),
        CallArg::Tensor(saved.value),
        CallArg::Tensor(saved.out),
        CallArg::Tensor(saved.logsumexp),
        CallArg::Tensor(saved.grad_out),
        CallArg::Graph(&score_mod.forward),
        CallArg::Graph(&score_mod.joint),
    ];
    args.extend(other_buffers.iter().map(CallArg::Tensor));
    let lowerings = Lowerings::default();
    let fw = Arc::new(build_subgraph_buffer(
        &args,
        &score_mod.forward,
        SubgraphRole::JointForward,
        &lowerings,
    )?);
    let joint = Arc::new(build_subgraph_buffer(
        &args,
        &score_mod.joint,
        SubgraphRole::JointBackward,
        &lowerings,
    )?);

    let delta = to_host(&compute_delta(saved.out, saved.grad_out)?)?;
    let lse2: Vec<f32> = to_host(saved.logsumexp)?
        .iter()
        .map(|l| l * LOG2_E)
        .collect();

    let options = BackwardOptions {
        rows_guaranteed_safe: config.rows_guaranteed_safe,
    };
    let candidates = match config.backward_tiles {
        Some(tiles) => vec![tiles],
        None => backward_candidates(
            problem.dtype,
            problem.head_dim,
            config.tier(),
            config.max_autotune,
        ),
    };
    let kernels = emit("flex_attention_backward", candidates, |tiles| {
        BackwardKernel::new(tiles, Arc::clone(&fw), Arc::clone(&joint), options)
    })?;

    let q = to_host(saved.query)?;
    let k = to_host(saved.key)?;
    let v = to_host(saved.value)?;
    let grad_out = to_host(saved.grad_out)?;
    let inputs = BackwardInputs {
        problem: &problem,
        query: &q,
        key: &k,
        value: &v,
        grad_out: &grad_out,
        logsumexp: &lse2,
        delta: &delta,
    };
    let selection = select_algorithm(
        "flex_attention_backward",
        kernels,
        BackwardKernel::name,
        |kernel| kernel.run(&inputs),
        |a, b| {
            allclose(&b.grad_query, &a.grad_query, ATOL, RTOL)
                && allclose(&b.grad_key, &a.grad_key, ATOL, RTOL)
                && allclose(&b.grad_value, &a.grad_value, ATOL, RTOL)
        },
    )?;

    let grads = selection.output;
    let like = |data, t: &Tensor| from_host(data, t.dims(), t.dtype(), t.device());
    Ok(FlexAttentionGrads {
        grad_query: like(grads.grad_query, saved.query)?,
        grad_key: like(grads.grad_key, saved.key)?,
        grad_value: like(grads.grad_value, saved.value)?,
    })
}
