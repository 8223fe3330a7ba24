// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Dense reference attention.
//!
//! Materializes the full `[Z, H, M, N]` score matrix with candle ops, applies
//! the score modification to it as one tile per (batch, head) and normalizes
//! with `candle_nn::ops::softmax`. O(M·N) memory, used to validate the tiled
//! kernels.

use candle_core::{DType, Tensor, D};

use crate::error::Result;
use crate::kernels::modification::{FusedScoreExpression, ScoreTile, TileLayout};
use crate::kernels::problem::AttentionProblem;

/// Returns `(output, logsumexp)`; the logsumexp is natural-log, F32.
///
/// Fully masked rows come out as NaN here; the tiled kernels define them as
/// zero output and `-inf` logsumexp.
///
/// # Errors
/// Returns an error for invalid shapes or a failing score modification.
pub fn dense_flex_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    score_mod: &FusedScoreExpression,
) -> Result<(Tensor, Tensor)> {
    let problem = AttentionProblem::from_tensors(query, key, value)?;
    let q = query.to_dtype(DType::F32)?.contiguous()?;
    let k = key.to_dtype(DType::F32)?;
    let v = value.to_dtype(DType::F32)?.contiguous()?;

    let scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
    let raw: Vec<f32> = scores.flatten_all()?.to_vec1()?;

    let (m, n) = (problem.q_len, problem.kv_len);
    let mut modified = vec![0.0f32; raw.len()];
    let mut scratch = score_mod.scratch();
    for bh in 0..problem.batch_heads() {
        let tile = ScoreTile {
            batch: bh / problem.heads,
            head: bh % problem.heads,
            query: 0..m,
            key: 0..n,
            layout: TileLayout::QueryMajor,
        };
        let range = bh * m * n..(bh + 1) * m * n;
        score_mod.apply(&tile, &raw[range.clone()], None, &mut scratch, &mut modified[range])?;
    }
    let scores = Tensor::from_vec(modified, scores.dims(), scores.device())?;

    let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    let output = attn_weights.matmul(&v)?.to_dtype(query.dtype())?;

    let max = scores.max_keepdim(D::Minus1)?;
    let lse = (scores.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?.log()? + max)?
        .squeeze(D::Minus1)?;
    Ok((output, lse))
}
