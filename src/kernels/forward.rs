// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Tiled online-softmax forward kernel with an inlined score modification.
//!
//! ## Algorithm Overview
//!
//! ```text
//! For each (query tile, batch*head) unit:
//!     Load Q_i (pre-scaled by log2(e) when the modification is linear)
//!     m_i = -inf, l_i = 0, acc = 0
//!
//!     For each KV tile j:
//!         S_ij = modify(Q_i @ K_j^T)            # absolute (b, h, m, n)
//!         S_ij *= log2(e)                        # unless folded into Q
//!         m_ij = max(m_i, rowmax(S_ij))
//!         alpha = 2^(m_i - m_ij), P_ij = 2^(S_ij - m_ij)
//!         (alpha, P_ij zeroed on rows whose m_ij is still -inf)
//!         l_i = l_i * alpha + rowsum(P_ij)
//!         acc = acc * alpha + P_ij @ V_j
//!         m_i = m_ij
//!
//!     O_i = acc / l_i, lse_i = m_i + log2(l_i)
//! ```
//!
//! Units are independent and run on the rayon pool; each owns its slice of
//! the output and logsumexp.

use std::f32::consts::LOG2_E;
use std::sync::Arc;

use rayon::prelude::*;

use super::config::TileConfig;
use super::launch::{dispatch_forward, forward_grid, ForwardUnit};
use super::modification::{FusedScoreExpression, ScoreTile, Sentinel, SubgraphRole, TileLayout};
use super::problem::AttentionProblem;
use crate::error::{FlexAttnError, Result};

/// Minimum grid units before we use rayon parallelism.
pub(crate) const PAR_UNIT_THRESHOLD: usize = 4;

/// Forward specialization flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Fold the base-2 rescale into the query.
    pub score_mod_is_linear: bool,
    /// Skip the fully-masked-row safety path.
    pub rows_guaranteed_safe: bool,
    /// Store the per-row logsumexp.
    pub output_logsumexp: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            score_mod_is_linear: false,
            rows_guaranteed_safe: false,
            output_logsumexp: true,
        }
    }
}

/// Host-side f32 inputs, contiguous `[Z, H, L, D]`.
#[derive(Debug, Clone, Copy)]
pub struct ForwardInputs<'a> {
    /// Problem description.
    pub problem: &'a AttentionProblem,
    /// Query values.
    pub query: &'a [f32],
    /// Key values.
    pub key: &'a [f32],
    /// Value values.
    pub value: &'a [f32],
}

impl ForwardInputs<'_> {
    fn validate(&self) -> Result<()> {
        let p = self.problem;
        check_len("query", self.query, p.batch_heads() * p.q_len * p.head_dim)?;
        check_len("key", self.key, p.batch_heads() * p.kv_len * p.head_dim)?;
        check_len("value", self.value, p.batch_heads() * p.kv_len * p.head_dim)
    }
}

pub(crate) fn check_len(name: &str, data: &[f32], expected: usize) -> Result<()> {
    if data.len() == expected {
        return Ok(());
    }
    tracing::debug!(buffer = name, expected, actual = data.len(), "host buffer length mismatch");
    Err(FlexAttnError::ShapeMismatch {
        expected: vec![expected],
        actual: vec![data.len()],
    })
}

/// Forward results.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardBuffers {
    /// Attention output, `[Z, H, M, D]`.
    pub output: Vec<f32>,
    /// Base-2 logsumexp `m + log2(l)`, `[Z, H, M]`; empty when not requested.
    pub logsumexp: Vec<f32>,
}

struct ForwardTile {
    row_offset: usize,
    output: Vec<f32>,
    logsumexp: Vec<f32>,
}

/// One forward kernel instance specialized on tiles, modification and flags.
#[derive(Debug, Clone)]
pub struct ForwardKernel {
    tiles: TileConfig,
    score_mod: Arc<FusedScoreExpression>,
    options: ForwardOptions,
}

impl ForwardKernel {
    /// Emit a kernel instance.
    ///
    /// # Errors
    /// Returns [`FlexAttnError::InvalidConfig`] for invalid tiles or a score
    /// modification that was not built for the forward role.
    pub fn new(
        tiles: TileConfig,
        score_mod: Arc<FusedScoreExpression>,
        options: ForwardOptions,
    ) -> Result<Self> {
        tiles.validate()?;
        if score_mod.role() != SubgraphRole::Forward || score_mod.reads(Sentinel::GradScore) {
            return Err(FlexAttnError::InvalidConfig(format!(
                "forward kernel needs a forward score modification, got {:?}",
                score_mod.role()
            )));
        }
        Ok(Self {
            tiles,
            score_mod,
            options,
        })
    }

    /// Tile configuration.
    #[must_use]
    pub fn tiles(&self) -> TileConfig {
        self.tiles
    }

    /// Name used in autotuning logs.
    #[must_use]
    pub fn name(&self) -> String {
        let t = self.tiles;
        format!(
            "flex_attention_BLOCK_M{}_BLOCK_N{}_w{}_s{}",
            t.block_m, t.block_n, t.num_warps, t.num_stages
        )
    }

    /// Rendered `modification` block for a device compiler.
    #[must_use]
    pub fn modification_source(&self) -> String {
        self.score_mod.render("qk", &|s| match s {
            Sentinel::Score => "qk".to_owned(),
            Sentinel::Batch => "off_hz // H".to_owned(),
            Sentinel::Head => "off_hz % H".to_owned(),
            Sentinel::Query => "offs_m[:, None]".to_owned(),
            Sentinel::Key => "offs_n[None, :]".to_owned(),
            Sentinel::GradScore => "grad_scores".to_owned(),
        })
    }

    /// Run every grid unit and assemble the output.
    ///
    /// # Errors
    /// Returns an error on input length mismatches or a failing score
    /// modification (e.g. out-of-bounds captured-buffer index).
    pub fn run(&self, inputs: &ForwardInputs<'_>) -> Result<ForwardBuffers> {
        inputs.validate()?;
        let p = inputs.problem;
        let grid = forward_grid(p, &self.tiles);
        tracing::debug!(
            kernel = %self.name(),
            grid = ?grid,
            shared_memory_bytes = self.tiles.shared_memory_bytes(p.head_dim, 4),
            "launching flex attention forward"
        );

        let run_unit =
            |linear: usize| self.run_unit(dispatch_forward(grid.program_id(linear), p), inputs);
        let tiles = if grid.num_units() >= PAR_UNIT_THRESHOLD {
            (0..grid.num_units())
                .into_par_iter()
                .map(run_unit)
                .collect::<Result<Vec<_>>>()?
        } else {
            (0..grid.num_units()).map(run_unit).collect::<Result<Vec<_>>>()?
        };

        let d = p.head_dim;
        let rows = p.batch_heads() * p.q_len;
        let mut output = vec![0.0; rows * d];
        let mut logsumexp = if self.options.output_logsumexp {
            vec![f32::NEG_INFINITY; rows]
        } else {
            Vec::new()
        };
        for tile in tiles {
            let r = tile.row_offset;
            output[r * d..r * d + tile.output.len()].copy_from_slice(&tile.output);
            if self.options.output_logsumexp {
                logsumexp[r..r + tile.logsumexp.len()].copy_from_slice(&tile.logsumexp);
            }
        }
        Ok(ForwardBuffers { output, logsumexp })
    }

    fn run_unit(&self, unit: ForwardUnit, inputs: &ForwardInputs<'_>) -> Result<ForwardTile> {
        let p = inputs.problem;
        let d = p.head_dim;
        let bh = unit.batch * p.heads + unit.head;
        let start_m = unit.q_tile * self.tiles.block_m;
        let rows = self.tiles.block_m.min(p.q_len - start_m);
        let linear = self.options.score_mod_is_linear;
        let safe = self.options.rows_guaranteed_safe;

        let q_base = (bh * p.q_len + start_m) * d;
        let kv_base = bh * p.kv_len * d;
        let qk_scale = if linear { LOG2_E } else { 1.0 };
        let q: Vec<f32> = inputs.query[q_base..q_base + rows * d]
            .iter()
            .map(|x| x * qk_scale)
            .collect();

        let mut m_i = vec![f32::NEG_INFINITY; rows];
        let mut l_i = vec![0.0f32; rows];
        let mut acc = vec![0.0f32; rows * d];
        let mut qk = Vec::with_capacity(rows * self.tiles.block_n);
        let mut scores = Vec::with_capacity(rows * self.tiles.block_n);
        let mut p_row = vec![0.0f32; self.tiles.block_n];
        let mut scratch = self.score_mod.scratch();

        for start_n in (0..p.kv_len).step_by(self.tiles.block_n) {
            let cols = self.tiles.block_n.min(p.kv_len - start_n);
            let k_tile = &inputs.key[kv_base + start_n * d..kv_base + (start_n + cols) * d];
            let v_tile = &inputs.value[kv_base + start_n * d..kv_base + (start_n + cols) * d];

            qk.clear();
            for q_row in q.chunks_exact(d) {
                qk.extend(k_tile.chunks_exact(d).map(|k_row| dot(q_row, k_row)));
            }
            scores.resize(rows * cols, 0.0);
            let tile = ScoreTile {
                batch: unit.batch,
                head: unit.head,
                query: start_m..start_m + rows,
                key: start_n..start_n + cols,
                layout: TileLayout::QueryMajor,
            };
            self.score_mod.apply(&tile, &qk, None, &mut scratch, &mut scores)?;
            if !linear {
                for s in &mut scores {
                    *s *= LOG2_E;
                }
            }

            for (i, row) in scores.chunks_exact(cols).enumerate() {
                let m_ij = row.iter().fold(m_i[i], |a, &b| a.max(b));
                let masked = !safe && m_ij == f32::NEG_INFINITY;
                let alpha = if masked { 0.0 } else { (m_i[i] - m_ij).exp2() };
                let mut row_sum = 0.0;
                for (pj, &s) in p_row.iter_mut().zip(row) {
                    *pj = if masked { 0.0 } else { (s - m_ij).exp2() };
                    row_sum += *pj;
                }
                l_i[i] = l_i[i] * alpha + row_sum;

                let acc_row = &mut acc[i * d..(i + 1) * d];
                for a in acc_row.iter_mut() {
                    *a *= alpha;
                }
                for (&pj, v_row) in p_row.iter().zip(v_tile.chunks_exact(d)) {
                    axpy(acc_row, pj, v_row);
                }
                m_i[i] = m_ij;
            }
        }

        for (i, acc_row) in acc.chunks_exact_mut(d).enumerate() {
            let inv = if !safe && l_i[i] == 0.0 { 0.0 } else { l_i[i].recip() };
            for a in acc_row {
                *a *= inv;
            }
        }
        let logsumexp = if self.options.output_logsumexp {
            m_i.iter().zip(&l_i).map(|(m, l)| m + l.log2()).collect()
        } else {
            Vec::new()
        };

        Ok(ForwardTile {
            row_offset: bh * p.q_len + start_m,
            output: acc,
            logsumexp,
        })
    }
}

#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `y += alpha * x`
#[inline]
pub(crate) fn axpy(y: &mut [f32], alpha: f32, x: &[f32]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::modification::{BinaryOp, ExprBuilder};
    use candle_core::DType;

    fn identity() -> Arc<FusedScoreExpression> {
        let mut b = ExprBuilder::new();
        let score = b.input(Sentinel::Score);
        Arc::new(b.finish(score, SubgraphRole::Forward))
    }

    fn causal() -> Arc<FusedScoreExpression> {
        let mut b = ExprBuilder::new();
        let score = b.input(Sentinel::Score);
        let m = b.input(Sentinel::Query);
        let n = b.input(Sentinel::Key);
        let cond = b.binary(BinaryOp::Gt, n, m);
        let ninf = b.constant(f64::NEG_INFINITY);
        let out = b.select(cond, ninf, score);
        Arc::new(b.finish(out, SubgraphRole::Forward))
    }

    fn sequence(len: usize, scale: f32) -> Vec<f32> {
        (0..len).map(|i| ((i * 7 % 11) as f32 - 5.0) * scale).collect()
    }

    #[test]
    fn test_single_key_returns_value() {
        let p = AttentionProblem::new(1, 1, 3, 1, 2, DType::F32);
        let q = sequence(6, 0.3);
        let k = vec![0.5, -0.5];
        let v = vec![2.0, -3.0];
        let kernel =
            ForwardKernel::new(TileConfig::new(2, 2, 4, 1), identity(), ForwardOptions::default())
                .unwrap();
        let out = kernel
            .run(&ForwardInputs { problem: &p, query: &q, key: &k, value: &v })
            .unwrap();
        for row in out.output.chunks_exact(2) {
            assert!((row[0] - 2.0).abs() < 1e-6);
            assert!((row[1] + 3.0).abs() < 1e-6);
        }
        // lse2 of a single key is the base-2 scaled score
        let expected = dot(&q[0..2], &k) * LOG2_E;
        assert!((out.logsumexp[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_tile_invariance_with_ragged_tiles() {
        let p = AttentionProblem::new(1, 2, 7, 9, 4, DType::F32);
        let q = sequence(2 * 7 * 4, 0.1);
        let k = sequence(2 * 9 * 4, 0.2);
        let v = sequence(2 * 9 * 4, 0.3);
        let inputs = ForwardInputs { problem: &p, query: &q, key: &k, value: &v };
        let reference =
            ForwardKernel::new(TileConfig::new(16, 16, 4, 1), causal(), ForwardOptions::default())
                .unwrap()
            .run(&inputs)
            .unwrap();
        for tiles in [
            TileConfig::new(2, 4, 4, 1),
            TileConfig::new(4, 2, 4, 1),
            TileConfig::new(1, 8, 4, 1),
        ] {
            let out = ForwardKernel::new(tiles, causal(), ForwardOptions::default())
                .unwrap()
                .run(&inputs)
                .unwrap();
            for (a, b) in out.output.iter().zip(&reference.output) {
                assert!((a - b).abs() < 1e-5, "{tiles:?}: {a} vs {b}");
            }
            for (a, b) in out.logsumexp.iter().zip(&reference.logsumexp) {
                assert!((a - b).abs() < 1e-5, "{tiles:?}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_fully_masked_row_is_zero() {
        let mut b = ExprBuilder::new();
        let score = b.input(Sentinel::Score);
        let m = b.input(Sentinel::Query);
        let zero = b.constant(0.0);
        let first_row = b.binary(BinaryOp::Eq, m, zero);
        let ninf = b.constant(f64::NEG_INFINITY);
        let out = b.select(first_row, ninf, score);
        let expr = Arc::new(b.finish(out, SubgraphRole::Forward));

        let p = AttentionProblem::new(1, 1, 2, 3, 2, DType::F32);
        let q = sequence(4, 0.5);
        let k = sequence(6, 0.5);
        let v = sequence(6, 1.0);
        let out = ForwardKernel::new(TileConfig::new(2, 2, 4, 1), expr, ForwardOptions::default())
            .unwrap()
            .run(&ForwardInputs { problem: &p, query: &q, key: &k, value: &v })
            .unwrap();
        assert_eq!(&out.output[0..2], &[0.0, 0.0]);
        assert_eq!(out.logsumexp[0], f32::NEG_INFINITY);
        assert!(out.logsumexp[1].is_finite());
    }

    #[test]
    fn test_linear_fold_matches_unfolded() {
        let mut b = ExprBuilder::new();
        let score = b.input(Sentinel::Score);
        let c = b.constant(0.25);
        let out = b.binary(BinaryOp::Mul, score, c);
        let expr = Arc::new(b.finish(out, SubgraphRole::Forward));

        let p = AttentionProblem::new(1, 1, 5, 6, 3, DType::F32);
        let q = sequence(15, 0.4);
        let k = sequence(18, 0.3);
        let v = sequence(18, 0.2);
        let inputs = ForwardInputs { problem: &p, query: &q, key: &k, value: &v };
        let tiles = TileConfig::new(2, 4, 4, 1);
        let plain = ForwardKernel::new(tiles, Arc::clone(&expr), ForwardOptions::default())
            .unwrap()
            .run(&inputs)
            .unwrap();
        let folded = ForwardKernel::new(
            tiles,
            expr,
            ForwardOptions { score_mod_is_linear: true, ..ForwardOptions::default() },
        )
        .unwrap()
        .run(&inputs)
        .unwrap();
        for (a, b) in plain.output.iter().zip(&folded.output) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_logsumexp_can_be_skipped() {
        let p = AttentionProblem::new(1, 1, 2, 2, 2, DType::F32);
        let data = sequence(4, 0.5);
        let out = ForwardKernel::new(
            TileConfig::new(2, 2, 4, 1),
            identity(),
            ForwardOptions { output_logsumexp: false, ..ForwardOptions::default() },
        )
        .unwrap()
        .run(&ForwardInputs { problem: &p, query: &data, key: &data, value: &data })
        .unwrap();
        assert!(out.logsumexp.is_empty());
        assert_eq!(out.output.len(), 4);
    }

    #[test]
    fn test_rejects_invalid_tiles_and_roles() {
        let odd = TileConfig::new(3, 2, 4, 1);
        assert!(ForwardKernel::new(odd, identity(), ForwardOptions::default()).is_err());

        let mut b = ExprBuilder::new();
        let grad = b.input(Sentinel::GradScore);
        let joint = Arc::new(b.finish(grad, SubgraphRole::JointBackward));
        let tiles = TileConfig::new(2, 2, 4, 1);
        assert!(ForwardKernel::new(tiles, joint, ForwardOptions::default()).is_err());
    }

    #[test]
    fn test_rejects_short_inputs() {
        let p = AttentionProblem::new(1, 1, 2, 2, 2, DType::F32);
        let data = sequence(4, 0.5);
        let kernel =
            ForwardKernel::new(TileConfig::new(2, 2, 4, 1), identity(), ForwardOptions::default())
                .unwrap();
        let err = kernel.run(&ForwardInputs {
            problem: &p,
            query: &data[..3],
            key: &data,
            value: &data,
        });
        assert!(matches!(err, Err(FlexAttnError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_modification_source_binds_kernel_names() {
        let kernel =
            ForwardKernel::new(TileConfig::new(2, 2, 4, 1), causal(), ForwardOptions::default())
                .unwrap();
        let src = kernel.modification_source();
        assert!(src.contains("offs_m[:, None]"));
        assert!(src.contains("offs_n[None, :]"));
        assert!(src.ends_with("qk = tmp5"));
        assert_eq!(kernel.name(), "flex_attention_BLOCK_M2_BLOCK_N2_w4_s1");
    }
}
