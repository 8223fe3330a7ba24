//! Test utilities and fixtures for flex attention integration tests.
//!
//! Provides deterministic input generation, a dense candle reference that
//! supports autograd, and tensor comparison helpers.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var, D};

/// Attention problem shape used by a test.
#[derive(Debug, Clone, Copy)]
pub struct ProblemShape {
    /// Batch size.
    pub batch: usize,
    /// Number of heads.
    pub heads: usize,
    /// Query length.
    pub q_len: usize,
    /// Key/value length.
    pub kv_len: usize,
    /// Head dimension.
    pub head_dim: usize,
}

impl ProblemShape {
    /// Shape with `M = N`.
    pub const fn square(batch: usize, heads: usize, len: usize, head_dim: usize) -> Self {
        Self {
            batch,
            heads,
            q_len: len,
            kv_len: len,
            head_dim,
        }
    }

    /// `[Z, H, M, D]`.
    pub fn query_dims(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.heads, self.q_len, self.head_dim)
    }

    /// `[Z, H, N, D]`.
    pub fn kv_dims(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.heads, self.kv_len, self.head_dim)
    }
}

/// Score modification in dense candle form, applied to `[Z, H, M, N]` scores.
pub type DenseScoreMod<'a> = &'a dyn Fn(&Tensor) -> candle_core::Result<Tensor>;

/// Test fixtures for attention inputs.
pub struct TestFixtures;

impl TestFixtures {
    /// Deterministic uniform values in `[-max, max]`.
    pub fn uniform_values(count: usize, max: f32, seed: u64) -> Vec<f32> {
        let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        (0..count)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
                (unit * 2.0 - 1.0) * max
            })
            .collect()
    }

    /// Deterministic tensor with the given dims.
    pub fn tensor(dims: (usize, usize, usize, usize), seed: u64) -> Result<Tensor> {
        let count = dims.0 * dims.1 * dims.2 * dims.3;
        let values = Self::uniform_values(count, 1.0, seed);
        Ok(Tensor::from_vec(values, dims, &Device::Cpu)?)
    }

    /// Query, key and value for `shape`.
    pub fn qkv(shape: ProblemShape, seed: u64) -> Result<(Tensor, Tensor, Tensor)> {
        Ok((
            Self::tensor(shape.query_dims(), seed)?,
            Self::tensor(shape.kv_dims(), seed + 1)?,
            Self::tensor(shape.kv_dims(), seed + 2)?,
        ))
    }

    /// `[M, N]` tensor holding `n - m`.
    pub fn distance(q_len: usize, kv_len: usize) -> Result<Tensor> {
        let values: Vec<f32> = (0..q_len)
            .flat_map(|m| (0..kv_len).map(move |n| n as f32 - m as f32))
            .collect();
        Ok(Tensor::from_vec(values, (q_len, kv_len), &Device::Cpu)?)
    }

    /// `[M, N]` additive causal mask: `0` on and below the diagonal, `-inf` above.
    pub fn causal_mask(q_len: usize, kv_len: usize) -> Result<Tensor> {
        let values: Vec<f32> = (0..q_len)
            .flat_map(|m| (0..kv_len).map(move |n| if n > m { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Ok(Tensor::from_vec(values, (q_len, kv_len), &Device::Cpu)?)
    }
}

/// Dense reference attention implemented with differentiable candle ops.
pub struct DenseReference;

impl DenseReference {
    /// Softmax over the last dimension with the row maximum held constant.
    fn softmax(scores: &Tensor) -> candle_core::Result<Tensor> {
        let max = scores.max_keepdim(D::Minus1)?.detach();
        let e = scores.broadcast_sub(&max)?.exp()?;
        e.broadcast_div(&e.sum_keepdim(D::Minus1)?)
    }

    /// Output and natural-log logsumexp.
    pub fn forward(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        score_mod: DenseScoreMod<'_>,
    ) -> Result<(Tensor, Tensor)> {
        let scores = score_mod(&q.matmul(&k.transpose(2, 3)?.contiguous()?)?)?;
        let out = Self::softmax(&scores)?.matmul(v)?;
        let max = scores.max_keepdim(D::Minus1)?;
        let lse = (scores.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?.log()? + max)?
            .squeeze(D::Minus1)?;
        Ok((out, lse))
    }

    /// Gradients of `sum(out * grad_out)` w.r.t. query, key and value.
    pub fn grads(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        grad_out: &Tensor,
        score_mod: DenseScoreMod<'_>,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (q, k, v) = (Var::from_tensor(q)?, Var::from_tensor(k)?, Var::from_tensor(v)?);
        let (out, _) = Self::forward(q.as_tensor(), k.as_tensor(), v.as_tensor(), score_mod)?;
        let loss = (out * grad_out)?.sum_all()?;
        let grads = loss.backward()?;
        let get = |var: &Var| -> Result<Tensor> {
            grads
                .get(var.as_tensor())
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("missing gradient"))
        };
        Ok((get(&q)?, get(&k)?, get(&v)?))
    }
}

/// Utility functions for numerical validation.
pub struct ValidationUtils;

impl ValidationUtils {
    /// Maximum absolute elementwise difference, compared in F32.
    pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        assert_eq!(a.dims(), b.dims(), "Tensor dimensions must match");
        let a = a.to_dtype(DType::F32)?;
        let b = b.to_dtype(DType::F32)?;
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    /// Assert `|a - b| <= tol` everywhere.
    pub fn assert_close(name: &str, actual: &Tensor, expected: &Tensor, tol: f32) -> Result<()> {
        let diff = Self::max_abs_diff(actual, expected)?;
        assert!(diff <= tol, "{name}: max abs diff {diff} exceeds {tol}");
        Ok(())
    }

    /// Flattened host copy.
    pub fn values(t: &Tensor) -> Result<Vec<f32>> {
        Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
    }
}
