// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Two-phase tiled backward kernel.
//!
//! The backward grid is split in two: the lower units each own one key/value
//! tile and sweep all query tiles to produce GradKey and GradValue, the upper
//! units each own one query tile and sweep all key/value tiles to produce
//! GradQuery. Probabilities are rebuilt from the stored base-2 logsumexp, so
//! no running max is tracked here.
//!
//! ```text
//! P   = 2^(modify(QK^T) * log2(e) - lse)
//! dV += P^T dO
//! dP  = dO V^T
//! dS  = P * (dP - Delta)
//! dS  = joint(QK^T, dS)            # chain rule through the modification
//! dK += dS^T Q,  dQ += dS K
//! ```

use std::f32::consts::LOG2_E;
use std::sync::Arc;

use candle_core::{DType, Tensor, D};
use rayon::prelude::*;

use super::config::BackwardTileConfig;
use super::forward::{axpy, check_len, dot, PAR_UNIT_THRESHOLD};
use super::launch::{backward_grid, dispatch_backward, BackwardUnit};
use super::modification::{
    FusedScoreExpression, Scratch, ScoreTile, SubgraphRole, TileLayout,
};
use super::problem::AttentionProblem;
use crate::error::{FlexAttnError, Result};

/// Delta = sum(out * grad_out, -1), in f32.
///
/// # Errors
/// Returns an error if the tensors have different shapes.
pub fn compute_delta(out: &Tensor, grad_out: &Tensor) -> Result<Tensor> {
    let out = out.to_dtype(DType::F32)?;
    let grad_out = grad_out.to_dtype(DType::F32)?;
    Ok((out * grad_out)?.sum(D::Minus1)?)
}

/// Backward specialization flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardOptions {
    /// Skip the guard for rows whose logsumexp is -inf.
    pub rows_guaranteed_safe: bool,
}

/// Host-side f32 inputs, contiguous.
#[derive(Debug, Clone, Copy)]
pub struct BackwardInputs<'a> {
    /// Problem description.
    pub problem: &'a AttentionProblem,
    /// Query, `[Z, H, M, D]`.
    pub query: &'a [f32],
    /// Key, `[Z, H, N, D]`.
    pub key: &'a [f32],
    /// Value, `[Z, H, N, D]`.
    pub value: &'a [f32],
    /// Gradient of the output, `[Z, H, M, D]`.
    pub grad_out: &'a [f32],
    /// Base-2 logsumexp from the forward pass, `[Z, H, M]`.
    pub logsumexp: &'a [f32],
    /// Delta pre-pass, `[Z, H, M]`.
    pub delta: &'a [f32],
}

impl BackwardInputs<'_> {
    fn validate(&self) -> Result<()> {
        let p = self.problem;
        let q_elems = p.batch_heads() * p.q_len * p.head_dim;
        let kv_elems = p.batch_heads() * p.kv_len * p.head_dim;
        let rows = p.batch_heads() * p.q_len;
        check_len("query", self.query, q_elems)?;
        check_len("key", self.key, kv_elems)?;
        check_len("value", self.value, kv_elems)?;
        check_len("grad_out", self.grad_out, q_elems)?;
        check_len("logsumexp", self.logsumexp, rows)?;
        check_len("delta", self.delta, rows)
    }
}

/// Gradients w.r.t. query, key and value.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardBuffers {
    /// `[Z, H, M, D]`.
    pub grad_query: Vec<f32>,
    /// `[Z, H, N, D]`.
    pub grad_key: Vec<f32>,
    /// `[Z, H, N, D]`.
    pub grad_value: Vec<f32>,
}

enum UnitGrad {
    KeyValue {
        row_offset: usize,
        grad_key: Vec<f32>,
        grad_value: Vec<f32>,
    },
    Query {
        row_offset: usize,
        grad_query: Vec<f32>,
    },
}

/// Per-unit working buffers.
struct Workspace {
    scores: Vec<f32>,
    post: Vec<f32>,
    probs: Vec<f32>,
    grad_scores: Vec<f32>,
    joint_out: Vec<f32>,
    fw_scratch: Scratch,
    joint_scratch: Scratch,
}

/// One backward kernel instance.
#[derive(Debug, Clone)]
pub struct BackwardKernel {
    tiles: BackwardTileConfig,
    score_mod: Arc<FusedScoreExpression>,
    joint: Arc<FusedScoreExpression>,
    options: BackwardOptions,
}

impl BackwardKernel {
    /// Emit a kernel instance.
    ///
    /// # Errors
    /// Returns [`FlexAttnError::InvalidConfig`] if the tiles violate the phase
    /// divisibility rules or the expressions were built for the wrong roles.
    pub fn new(
        tiles: BackwardTileConfig,
        score_mod: Arc<FusedScoreExpression>,
        joint: Arc<FusedScoreExpression>,
        options: BackwardOptions,
    ) -> Result<Self> {
        tiles.validate()?;
        if score_mod.role() != SubgraphRole::JointForward {
            return Err(FlexAttnError::InvalidConfig(format!(
                "backward kernel needs a joint-forward score modification, got {:?}",
                score_mod.role()
            )));
        }
        if joint.role() != SubgraphRole::JointBackward {
            return Err(FlexAttnError::InvalidConfig(format!(
                "backward kernel needs a joint-backward graph, got {:?}",
                joint.role()
            )));
        }
        Ok(Self {
            tiles,
            score_mod,
            joint,
            options,
        })
    }

    /// Tile configuration.
    #[must_use]
    pub fn tiles(&self) -> BackwardTileConfig {
        self.tiles
    }

    /// Name used in autotuning logs.
    #[must_use]
    pub fn name(&self) -> String {
        let t = self.tiles;
        format!(
            "flex_attention_backward_BLOCK_M1{}_BLOCK_N1{}_BLOCK_M2{}_BLOCK_N2{}_w{}_s{}",
            t.block_m1, t.block_n1, t.block_m2, t.block_n2, t.num_warps, t.num_stages
        )
    }

    /// Run both phases and assemble the gradients.
    ///
    /// # Errors
    /// Returns an error on input length mismatches or a failing score
    /// modification.
    pub fn run(&self, inputs: &BackwardInputs<'_>) -> Result<BackwardBuffers> {
        inputs.validate()?;
        let p = inputs.problem;
        let grid = backward_grid(p, &self.tiles);
        tracing::debug!(kernel = %self.name(), grid = ?grid, "launching flex attention backward");

        let run_unit = |linear: usize| {
            match dispatch_backward(grid.program_id(linear), p, &self.tiles) {
                BackwardUnit::KeyValue { batch, head, kv_tile } => {
                    self.run_key_value(batch, head, kv_tile, inputs)
                }
                BackwardUnit::Query { batch, head, q_tile } => {
                    self.run_query(batch, head, q_tile, inputs)
                }
            }
        };
        let units = if grid.num_units() >= PAR_UNIT_THRESHOLD {
            (0..grid.num_units())
                .into_par_iter()
                .map(run_unit)
                .collect::<Result<Vec<_>>>()?
        } else {
            (0..grid.num_units()).map(run_unit).collect::<Result<Vec<_>>>()?
        };

        let d = p.head_dim;
        let mut grad_query = vec![0.0; p.batch_heads() * p.q_len * d];
        let mut grad_key = vec![0.0; p.batch_heads() * p.kv_len * d];
        let mut grad_value = vec![0.0; p.batch_heads() * p.kv_len * d];
        for unit in units {
            match unit {
                UnitGrad::KeyValue {
                    row_offset,
                    grad_key: dk,
                    grad_value: dv,
                } => {
                    let r = row_offset * d;
                    grad_key[r..r + dk.len()].copy_from_slice(&dk);
                    grad_value[r..r + dv.len()].copy_from_slice(&dv);
                }
                UnitGrad::Query {
                    row_offset,
                    grad_query: dq,
                } => {
                    let r = row_offset * d;
                    for (acc, g) in grad_query[r..r + dq.len()].iter_mut().zip(&dq) {
                        *acc += g;
                    }
                }
            }
        }
        Ok(BackwardBuffers {
            grad_query,
            grad_key,
            grad_value,
        })
    }

    fn workspace(&self, capacity: usize) -> Workspace {
        Workspace {
            scores: Vec::with_capacity(capacity),
            post: Vec::with_capacity(capacity),
            probs: Vec::with_capacity(capacity),
            grad_scores: Vec::with_capacity(capacity),
            joint_out: Vec::with_capacity(capacity),
            fw_scratch: self.score_mod.scratch(),
            joint_scratch: self.joint.scratch(),
        }
    }

    /// Probability for a score already in base-2 form.
    fn prob(&self, score2: f32, lse2: f32) -> f32 {
        if !self.options.rows_guaranteed_safe && lse2 == f32::NEG_INFINITY {
            0.0
        } else {
            (score2 - lse2).exp2()
        }
    }

    /// Apply the forward and joint modifications to `ws.scores`; on return
    /// `ws.joint_out` holds the gradient w.r.t. the raw scores.
    ///
    /// `prob_and_ds` fills `ws.probs` and `ws.grad_scores` from `ws.post`.
    fn modify_tile(
        &self,
        tile: &ScoreTile,
        ws: &mut Workspace,
        prob_and_ds: impl FnOnce(&[f32], &mut Vec<f32>, &mut Vec<f32>),
    ) -> Result<()> {
        let len = tile.len();
        ws.post.resize(len, 0.0);
        self.score_mod
            .apply(tile, &ws.scores, None, &mut ws.fw_scratch, &mut ws.post)?;
        ws.probs.clear();
        ws.grad_scores.clear();
        prob_and_ds(&ws.post, &mut ws.probs, &mut ws.grad_scores);
        ws.joint_out.resize(len, 0.0);
        self.joint.apply(
            tile,
            &ws.scores,
            Some(&ws.grad_scores),
            &mut ws.joint_scratch,
            &mut ws.joint_out,
        )
    }

    fn run_key_value(
        &self,
        batch: usize,
        head: usize,
        kv_tile: usize,
        inputs: &BackwardInputs<'_>,
    ) -> Result<UnitGrad> {
        let p = inputs.problem;
        let d = p.head_dim;
        let bh = batch * p.heads + head;
        let (block_m, block_n) = (self.tiles.block_m1, self.tiles.block_n1);
        let start_n = kv_tile * block_n;
        let keys = block_n.min(p.kv_len - start_n);

        let kv_base = (bh * p.kv_len + start_n) * d;
        let k_tile = &inputs.key[kv_base..kv_base + keys * d];
        let v_tile = &inputs.value[kv_base..kv_base + keys * d];
        let mut dk = vec![0.0f32; keys * d];
        let mut dv = vec![0.0f32; keys * d];
        let mut dp = Vec::with_capacity(keys * block_m);
        let mut ws = self.workspace(keys * block_m);

        for start_m in (0..p.q_len).step_by(block_m) {
            let queries = block_m.min(p.q_len - start_m);
            let row = bh * p.q_len + start_m;
            let q_tile = &inputs.query[row * d..(row + queries) * d];
            let do_tile = &inputs.grad_out[row * d..(row + queries) * d];
            let lse = &inputs.logsumexp[row..row + queries];
            let delta = &inputs.delta[row..row + queries];

            // key-major: element (i, j) is key i, query j
            ws.scores.clear();
            dp.clear();
            for (k_row, v_row) in k_tile.chunks_exact(d).zip(v_tile.chunks_exact(d)) {
                ws.scores.extend(q_tile.chunks_exact(d).map(|q_row| dot(k_row, q_row)));
                dp.extend(do_tile.chunks_exact(d).map(|do_row| dot(v_row, do_row)));
            }
            let tile = ScoreTile {
                batch,
                head,
                query: start_m..start_m + queries,
                key: start_n..start_n + keys,
                layout: TileLayout::KeyMajor,
            };
            self.modify_tile(&tile, &mut ws, |post, probs, ds| {
                for (e, &s) in post.iter().enumerate() {
                    let j = e % queries;
                    let pt = self.prob(s * LOG2_E, lse[j]);
                    probs.push(pt);
                    ds.push(pt * (dp[e] - delta[j]));
                }
            })?;

            let kv_rows = dk.chunks_exact_mut(d).zip(dv.chunks_exact_mut(d));
            for (i, (dk_row, dv_row)) in kv_rows.enumerate() {
                let probs = &ws.probs[i * queries..(i + 1) * queries];
                let grads = &ws.joint_out[i * queries..(i + 1) * queries];
                let q_rows = q_tile.chunks_exact(d).zip(do_tile.chunks_exact(d));
                for (j, (q_row, do_row)) in q_rows.enumerate() {
                    axpy(dv_row, probs[j], do_row);
                    axpy(dk_row, grads[j], q_row);
                }
            }
        }

        Ok(UnitGrad::KeyValue {
            row_offset: bh * p.kv_len + start_n,
            grad_key: dk,
            grad_value: dv,
        })
    }

    fn run_query(
        &self,
        batch: usize,
        head: usize,
        q_tile_idx: usize,
        inputs: &BackwardInputs<'_>,
    ) -> Result<UnitGrad> {
        let p = inputs.problem;
        let d = p.head_dim;
        let bh = batch * p.heads + head;
        let (block_m, block_n) = (self.tiles.block_m2, self.tiles.block_n2);
        let start_m = q_tile_idx * block_m;
        let queries = block_m.min(p.q_len - start_m);

        let row = bh * p.q_len + start_m;
        let q_tile = &inputs.query[row * d..(row + queries) * d];
        let do_tile = &inputs.grad_out[row * d..(row + queries) * d];
        let lse = &inputs.logsumexp[row..row + queries];
        let delta = &inputs.delta[row..row + queries];
        let mut dq = vec![0.0f32; queries * d];
        let mut dp = Vec::with_capacity(queries * block_n);
        let mut ws = self.workspace(queries * block_n);

        for start_n in (0..p.kv_len).step_by(block_n) {
            let keys = block_n.min(p.kv_len - start_n);
            let kv_base = (bh * p.kv_len + start_n) * d;
            let k_tile = &inputs.key[kv_base..kv_base + keys * d];
            let v_tile = &inputs.value[kv_base..kv_base + keys * d];

            ws.scores.clear();
            dp.clear();
            for (q_row, do_row) in q_tile.chunks_exact(d).zip(do_tile.chunks_exact(d)) {
                ws.scores.extend(k_tile.chunks_exact(d).map(|k_row| dot(q_row, k_row)));
                dp.extend(v_tile.chunks_exact(d).map(|v_row| dot(do_row, v_row)));
            }
            let tile = ScoreTile {
                batch,
                head,
                query: start_m..start_m + queries,
                key: start_n..start_n + keys,
                layout: TileLayout::QueryMajor,
            };
            self.modify_tile(&tile, &mut ws, |post, probs, ds| {
                for (e, &s) in post.iter().enumerate() {
                    let i = e / keys;
                    let pv = self.prob(s * LOG2_E, lse[i]);
                    probs.push(pv);
                    ds.push(pv * (dp[e] - delta[i]));
                }
            })?;

            for (i, dq_row) in dq.chunks_exact_mut(d).enumerate() {
                let grads = &ws.joint_out[i * keys..(i + 1) * keys];
                for (&g, k_row) in grads.iter().zip(k_tile.chunks_exact(d)) {
                    axpy(dq_row, g, k_row);
                }
            }
        }

        Ok(UnitGrad::Query {
            row_offset: row,
            grad_query: dq,
        })
    }
}
