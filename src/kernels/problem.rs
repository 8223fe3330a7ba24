// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Attention problem description shared by the policy, planner and kernels.

use candle_core::{DType, Device, Tensor};

use crate::error::{FlexAttnError, Result};

/// Shape, dtype and placement of one attention call.
///
/// Tensors are `[batch, heads, seq, head_dim]`; query, key and value share
/// batch, heads and head dim, key and value share sequence length.
#[derive(Debug, Clone)]
pub struct AttentionProblem {
    /// Batch size (Z).
    pub batch: usize,
    /// Number of heads (H).
    pub heads: usize,
    /// Query length (M).
    pub q_len: usize,
    /// Key/value length (N).
    pub kv_len: usize,
    /// Head dimension (D).
    pub head_dim: usize,
    /// Element type of the inputs.
    pub dtype: DType,
    /// Device holding the inputs.
    pub device: Device,
}

impl AttentionProblem {
    /// Describe a problem directly.
    #[must_use]
    pub fn new(
        batch: usize,
        heads: usize,
        q_len: usize,
        kv_len: usize,
        head_dim: usize,
        dtype: DType,
    ) -> Self {
        Self {
            batch,
            heads,
            q_len,
            kv_len,
            head_dim,
            dtype,
            device: Device::Cpu,
        }
    }

    /// Validate query/key/value tensors and describe the problem they pose.
    ///
    /// # Errors
    /// Returns [`FlexAttnError::InvalidConfig`] if the tensors are not 4D,
    /// have an empty head dimension, or disagree on batch, heads, head dim,
    /// dtype or key/value shape.
    pub fn from_tensors(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self> {
        let q_dims = q.dims();
        let k_dims = k.dims();
        let v_dims = v.dims();

        if q_dims.len() != 4 || k_dims.len() != 4 || v_dims.len() != 4 {
            return Err(FlexAttnError::InvalidConfig(format!(
                "Expected 4D tensors [batch, heads, seq, dim], \
                 got Q: {q_dims:?}, K: {k_dims:?}, V: {v_dims:?}"
            )));
        }

        if q_dims[3] == 0 {
            return Err(FlexAttnError::InvalidConfig(format!(
                "Head dimension must be non-zero, got Q: {q_dims:?}"
            )));
        }

        if q_dims[0] != k_dims[0] || q_dims[1] != k_dims[1] {
            return Err(FlexAttnError::InvalidConfig(format!(
                "Batch/head mismatch: Q={q_dims:?}, K={k_dims:?}"
            )));
        }

        if q_dims[3] != k_dims[3] {
            return Err(FlexAttnError::InvalidConfig(format!(
                "Head dimension mismatch: Q={}, K={}",
                q_dims[3], k_dims[3]
            )));
        }

        if k_dims != v_dims {
            return Err(FlexAttnError::InvalidConfig(format!(
                "K and V shape mismatch: K={k_dims:?}, V={v_dims:?}"
            )));
        }

        if q.dtype() != k.dtype() || q.dtype() != v.dtype() {
            return Err(FlexAttnError::InvalidConfig(format!(
                "dtype mismatch: Q={:?}, K={:?}, V={:?}",
                q.dtype(),
                k.dtype(),
                v.dtype()
            )));
        }

        Ok(Self {
            batch: q_dims[0],
            heads: q_dims[1],
            q_len: q_dims[2],
            kv_len: k_dims[2],
            head_dim: q_dims[3],
            dtype: q.dtype(),
            device: q.device().clone(),
        })
    }

    /// Z * H.
    #[must_use]
    pub const fn batch_heads(&self) -> usize {
        self.batch * self.heads
    }

    /// Shape of the attention output.
    #[must_use]
    pub fn output_shape(&self) -> [usize; 4] {
        [self.batch, self.heads, self.q_len, self.head_dim]
    }

    /// Shape of the per-row logsumexp.
    #[must_use]
    pub fn lse_shape(&self) -> [usize; 3] {
        [self.batch, self.heads, self.q_len]
    }

    /// Ensure `tensor` has exactly `expected` dims.
    ///
    /// # Errors
    /// Returns [`FlexAttnError::ShapeMismatch`] otherwise.
    pub fn expect_shape(tensor: &Tensor, expected: &[usize]) -> Result<()> {
        if tensor.dims() == expected {
            Ok(())
        } else {
            Err(FlexAttnError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: tensor.dims().to_vec(),
            })
        }
    }
}
