// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Tiling configuration policy.
//!
//! Chooses block sizes, warp count and pipeline depth per hardware generation,
//! head dimension and dtype. The policy is a pure function of the problem and
//! the hardware descriptor, so it can be tested without a GPU.
//!
//! # Example
//!
//! ```rust
//! use candle_core::DType;
//! use flex_attn_rs::kernels::config::{default_forward_config, HardwareTier, TileConfig};
//!
//! let tile = default_forward_config(DType::BF16, 128, HardwareTier::Hopper);
//! assert_eq!(tile, TileConfig::new(64, 32, 4, 3));
//! ```

use std::env;

use candle_core::DType;

use crate::error::{FlexAttnError, Result};

/// Environment switch enabling the expanded tile search.
pub const MAX_AUTOTUNE_ENV: &str = "FLEX_ATTN_MAX_AUTOTUNE";

/// CUDA-style compute capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComputeCapability {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl ComputeCapability {
    /// Create a capability descriptor.
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

/// Hardware generations with their own default tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareTier {
    /// H100 class (capability 9.0 and newer).
    Hopper,
    /// A100 class (capability 8.x).
    Ampere,
    /// Anything else, including the host CPU.
    Generic,
}

impl HardwareTier {
    /// Classify a device; `None` (no GPU) maps to [`HardwareTier::Generic`].
    #[must_use]
    pub fn from_capability(capability: Option<ComputeCapability>) -> Self {
        match capability {
            Some(c) if c >= ComputeCapability::new(9, 0) => Self::Hopper,
            Some(c) if c >= ComputeCapability::new(8, 0) => Self::Ampere,
            _ => Self::Generic,
        }
    }
}

fn check_block(name: &str, value: usize) -> Result<()> {
    if value == 0 || !value.is_power_of_two() {
        return Err(FlexAttnError::InvalidConfig(format!(
            "{name} must be a positive power of 2, got {value}"
        )));
    }
    Ok(())
}

fn check_launch(num_warps: usize, num_stages: usize) -> Result<()> {
    check_block("num_warps", num_warps)?;
    if num_stages == 0 {
        return Err(FlexAttnError::InvalidConfig(
            "num_stages must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Forward tile parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileConfig {
    /// Rows of the query tile.
    pub block_m: usize,
    /// Rows of the key/value tile.
    pub block_n: usize,
    /// Parallel width per tile.
    pub num_warps: usize,
    /// Pipeline depth.
    pub num_stages: usize,
}

impl TileConfig {
    /// Create a forward tile configuration.
    #[must_use]
    pub const fn new(block_m: usize, block_n: usize, num_warps: usize, num_stages: usize) -> Self {
        Self {
            block_m,
            block_n,
            num_warps,
            num_stages,
        }
    }

    /// Check block sizes and launch parameters.
    ///
    /// # Errors
    /// Returns [`FlexAttnError::InvalidConfig`] for non power-of-two sizes or
    /// zero stages.
    pub fn validate(&self) -> Result<()> {
        check_block("BLOCK_M", self.block_m)?;
        check_block("BLOCK_N", self.block_n)?;
        check_launch(self.num_warps, self.num_stages)
    }

    /// On-chip memory per unit in bytes.
    ///
    /// Layout:
    /// - Q tile: `block_m × head_dim`
    /// - K and V tiles: `block_n × head_dim` each, times `num_stages`
    /// - Scores tile: `block_m × block_n` (f32)
    /// - Accumulator: `block_m × head_dim` (f32)
    /// - Statistics: `block_m × 2` (f32 running max and sum)
    #[must_use]
    pub const fn shared_memory_bytes(&self, head_dim: usize, bytes_per_elem: usize) -> usize {
        let q = self.block_m * head_dim * bytes_per_elem;
        let kv = 2 * self.block_n * head_dim * bytes_per_elem * self.num_stages;
        let f32_state =
            (self.block_m * self.block_n + self.block_m * head_dim + 2 * self.block_m) * 4;
        q + kv + f32_state
    }

    /// Number of query tiles for `q_len`.
    #[must_use]
    pub const fn num_q_tiles(&self, q_len: usize) -> usize {
        q_len.div_ceil(self.block_m)
    }

    /// Number of key/value tiles for `kv_len`.
    #[must_use]
    pub const fn num_kv_tiles(&self, kv_len: usize) -> usize {
        kv_len.div_ceil(self.block_n)
    }
}

impl From<(usize, usize, usize, usize)> for TileConfig {
    fn from((block_m, block_n, num_warps, num_stages): (usize, usize, usize, usize)) -> Self {
        Self::new(block_m, block_n, num_warps, num_stages)
    }
}

/// Backward tile parameters: one block pair per phase.
///
/// `(block_m1, block_n1)` tile the key/value phase, `(block_m2, block_n2)`
/// the query phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackwardTileConfig {
    /// Query block iterated by the key/value phase.
    pub block_m1: usize,
    /// Key/value block owned by a key/value-phase unit.
    pub block_n1: usize,
    /// Query block owned by a query-phase unit.
    pub block_m2: usize,
    /// Key/value block iterated by the query phase.
    pub block_n2: usize,
    /// Parallel width per tile.
    pub num_warps: usize,
    /// Pipeline depth.
    pub num_stages: usize,
}

impl BackwardTileConfig {
    /// Configuration with `BLOCK_M1 = BLOCK_N1 = block1` and
    /// `BLOCK_M2 = BLOCK_N2 = block2`.
    #[must_use]
    pub const fn from_blocks(
        block1: usize,
        block2: usize,
        num_warps: usize,
        num_stages: usize,
    ) -> Self {
        Self {
            block_m1: block1,
            block_n1: block1,
            block_m2: block2,
            block_n2: block2,
            num_warps,
            num_stages,
        }
    }

    /// Check block sizes, launch parameters and phase divisibility.
    ///
    /// # Errors
    /// Returns [`FlexAttnError::InvalidConfig`] if any block is not a power of
    /// two, `BLOCK_N1 % BLOCK_M1 != 0` or `BLOCK_M2 % BLOCK_N2 != 0`.
    pub fn validate(&self) -> Result<()> {
        check_block("BLOCK_M1", self.block_m1)?;
        check_block("BLOCK_N1", self.block_n1)?;
        check_block("BLOCK_M2", self.block_m2)?;
        check_block("BLOCK_N2", self.block_n2)?;
        check_launch(self.num_warps, self.num_stages)?;
        if self.block_n1 % self.block_m1 != 0 {
            return Err(FlexAttnError::InvalidConfig(format!(
                "BLOCK_N1 ({}) must be a multiple of BLOCK_M1 ({})",
                self.block_n1, self.block_m1
            )));
        }
        if self.block_m2 % self.block_n2 != 0 {
            return Err(FlexAttnError::InvalidConfig(format!(
                "BLOCK_M2 ({}) must be a multiple of BLOCK_N2 ({})",
                self.block_m2, self.block_n2
            )));
        }
        Ok(())
    }
}

fn h100_forward(dtype: DType, head_dim: usize) -> Option<TileConfig> {
    let t = match (dtype, head_dim) {
        (DType::F32, 64) => (128, 32, 4, 3),
        (DType::F32, 128) => (32, 64, 4, 3),
        (DType::F32, 256) => (32, 32, 4, 3),
        (DType::BF16, 64) => (128, 64, 4, 3),
        (DType::BF16, 128 | 256) => (64, 32, 4, 3),
        _ => return None,
    };
    Some(t.into())
}

fn a100_forward(dtype: DType, head_dim: usize) -> Option<TileConfig> {
    let t = match (dtype, head_dim) {
        (DType::F32, 64 | 128) => (128, 32, 4, 3),
        (DType::F32, 256) => (64, 16, 4, 3),
        (DType::BF16, 64) => (128, 64, 4, 3),
        (DType::BF16, 128) => (128, 32, 4, 3),
        (DType::BF16, 256) => (32, 64, 4, 3),
        _ => return None,
    };
    Some(t.into())
}

/// Deterministic default forward configuration.
#[must_use]
pub fn default_forward_config(dtype: DType, head_dim: usize, tier: HardwareTier) -> TileConfig {
    let f32_input = dtype == DType::F32;
    let tier_default = if f32_input {
        TileConfig::new(64, 64, 4, 3)
    } else {
        TileConfig::new(128, 64, 4, 3)
    };
    match tier {
        HardwareTier::Hopper if head_dim <= 256 => {
            h100_forward(dtype, head_dim).unwrap_or(tier_default)
        }
        HardwareTier::Ampere if head_dim <= 256 => {
            a100_forward(dtype, head_dim).unwrap_or(tier_default)
        }
        _ if f32_input => TileConfig::new(32, 16, 4, 3),
        _ => TileConfig::new(64, 32, 4, 3),
    }
}

/// Deterministic default backward configuration.
///
/// Head dimensions above 256 use the generic fallback on every tier.
#[must_use]
pub fn default_backward_config(
    dtype: DType,
    head_dim: usize,
    tier: HardwareTier,
) -> BackwardTileConfig {
    match tier {
        HardwareTier::Hopper if head_dim <= 256 && dtype == DType::F32 => {
            BackwardTileConfig::from_blocks(64, 64, 4, 1)
        }
        HardwareTier::Hopper if head_dim <= 256 => BackwardTileConfig::from_blocks(128, 128, 4, 3),
        HardwareTier::Ampere if head_dim <= 256 => BackwardTileConfig::from_blocks(64, 64, 4, 1),
        _ => BackwardTileConfig::from_blocks(16, 16, 4, 1),
    }
}

/// Forward candidates: the default first, then the expanded search space.
#[must_use]
pub fn forward_candidates(
    dtype: DType,
    head_dim: usize,
    tier: HardwareTier,
    max_autotune: bool,
) -> Vec<TileConfig> {
    let mut configs = vec![default_forward_config(dtype, head_dim, tier)];
    if max_autotune {
        configs.extend(
            [
                (128, 64, 4, 3),
                (128, 128, 4, 3),
                (128, 128, 8, 2),
                (64, 128, 4, 3),
                (64, 64, 4, 3),
            ]
            .map(TileConfig::from),
        );
    }
    configs
}

/// Backward candidates: the default first, then the expanded search space.
#[must_use]
pub fn backward_candidates(
    dtype: DType,
    head_dim: usize,
    tier: HardwareTier,
    max_autotune: bool,
) -> Vec<BackwardTileConfig> {
    let mut configs = vec![default_backward_config(dtype, head_dim, tier)];
    if max_autotune {
        for block1 in [32, 64] {
            for block2 in [32, 64] {
                for num_warps in [4, 8] {
                    for num_stages in [1, 3] {
                        configs.push(BackwardTileConfig::from_blocks(
                            block1, block2, num_warps, num_stages,
                        ));
                    }
                }
            }
        }
    }
    configs
}

/// User-facing options for [`flex_attention`](super::flex_attention::flex_attention)
/// and its backward.
///
/// # Example
///
/// ```rust
/// use flex_attn_rs::kernels::config::{FlexAttentionConfig, TileConfig};
///
/// let config = FlexAttentionConfig::for_h100()
///     .with_max_autotune()
///     .with_forward_tiles(TileConfig::new(64, 64, 4, 3));
/// assert!(config.max_autotune);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlexAttentionConfig {
    /// Search the expanded candidate list instead of the single default.
    pub max_autotune: bool,
    /// Target device capability; `None` means host CPU.
    pub capability: Option<ComputeCapability>,
    /// Caller asserts the score modification is a linear rescaling of the score.
    pub score_mod_is_linear: bool,
    /// Caller asserts every query row has at least one finite modified score.
    pub rows_guaranteed_safe: bool,
    /// Return the per-row logsumexp from the forward pass.
    pub output_logsumexp: bool,
    /// Pin the forward tiles, bypassing the policy.
    pub forward_tiles: Option<TileConfig>,
    /// Pin the backward tiles, bypassing the policy.
    pub backward_tiles: Option<BackwardTileConfig>,
}

impl Default for FlexAttentionConfig {
    fn default() -> Self {
        Self {
            max_autotune: false,
            capability: None,
            score_mod_is_linear: false,
            rows_guaranteed_safe: false,
            output_logsumexp: true,
            forward_tiles: None,
            backward_tiles: None,
        }
    }
}

impl FlexAttentionConfig {
    /// Tables tuned for H100.
    #[must_use]
    pub fn for_h100() -> Self {
        Self {
            capability: Some(ComputeCapability::new(9, 0)),
            ..Self::default()
        }
    }

    /// Tables tuned for A100.
    #[must_use]
    pub fn for_a100() -> Self {
        Self {
            capability: Some(ComputeCapability::new(8, 0)),
            ..Self::default()
        }
    }

    /// Defaults, with `max_autotune` taken from `FLEX_ATTN_MAX_AUTOTUNE`.
    #[must_use]
    pub fn from_env() -> Self {
        let max_autotune = env::var(MAX_AUTOTUNE_ENV)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true"))
            .unwrap_or(false);
        Self {
            max_autotune,
            ..Self::default()
        }
    }

    /// Hardware tier implied by `capability`.
    #[must_use]
    pub fn tier(&self) -> HardwareTier {
        HardwareTier::from_capability(self.capability)
    }

    /// Enable the expanded candidate search.
    #[must_use]
    pub const fn with_max_autotune(mut self) -> Self {
        self.max_autotune = true;
        self
    }

    /// Declare the score modification linear.
    #[must_use]
    pub const fn with_linear_score_mod(mut self) -> Self {
        self.score_mod_is_linear = true;
        self
    }

    /// Skip the fully-masked-row safety path.
    #[must_use]
    pub const fn with_rows_guaranteed_safe(mut self) -> Self {
        self.rows_guaranteed_safe = true;
        self
    }

    /// Do not return the logsumexp.
    #[must_use]
    pub const fn without_logsumexp(mut self) -> Self {
        self.output_logsumexp = false;
        self
    }

    /// Pin the forward tile configuration.
    #[must_use]
    pub const fn with_forward_tiles(mut self, tiles: TileConfig) -> Self {
        self.forward_tiles = Some(tiles);
        self
    }

    /// Pin the backward tile configuration.
    #[must_use]
    pub const fn with_backward_tiles(mut self, tiles: BackwardTileConfig) -> Self {
        self.backward_tiles = Some(tiles);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_from_capability() {
        assert_eq!(
            HardwareTier::from_capability(Some(ComputeCapability::new(9, 0))),
            HardwareTier::Hopper
        );
        assert_eq!(
            HardwareTier::from_capability(Some(ComputeCapability::new(8, 6))),
            HardwareTier::Ampere
        );
        assert_eq!(
            HardwareTier::from_capability(Some(ComputeCapability::new(7, 5))),
            HardwareTier::Generic
        );
        assert_eq!(HardwareTier::from_capability(None), HardwareTier::Generic);
    }

    #[test]
    fn test_hopper_table() {
        let t = HardwareTier::Hopper;
        assert_eq!(default_forward_config(DType::F32, 64, t), TileConfig::new(128, 32, 4, 3));
        assert_eq!(default_forward_config(DType::F32, 128, t), TileConfig::new(32, 64, 4, 3));
        assert_eq!(default_forward_config(DType::BF16, 64, t), TileConfig::new(128, 64, 4, 3));
        // head dim outside the table falls back to the tier default
        assert_eq!(default_forward_config(DType::F32, 96, t), TileConfig::new(64, 64, 4, 3));
        assert_eq!(default_forward_config(DType::F16, 64, t), TileConfig::new(128, 64, 4, 3));
    }

    #[test]
    fn test_ampere_table() {
        let t = HardwareTier::Ampere;
        assert_eq!(default_forward_config(DType::F32, 256, t), TileConfig::new(64, 16, 4, 3));
        assert_eq!(default_forward_config(DType::BF16, 256, t), TileConfig::new(32, 64, 4, 3));
    }

    #[test]
    fn test_generic_and_large_head_dim() {
        assert_eq!(
            default_forward_config(DType::F32, 64, HardwareTier::Generic),
            TileConfig::new(32, 16, 4, 3)
        );
        assert_eq!(
            default_forward_config(DType::BF16, 512, HardwareTier::Hopper),
            TileConfig::new(64, 32, 4, 3)
        );
    }

    #[test]
    fn test_backward_defaults() {
        assert_eq!(
            default_backward_config(DType::F32, 64, HardwareTier::Hopper),
            BackwardTileConfig::from_blocks(64, 64, 4, 1)
        );
        assert_eq!(
            default_backward_config(DType::BF16, 128, HardwareTier::Hopper),
            BackwardTileConfig::from_blocks(128, 128, 4, 3)
        );
        assert_eq!(
            default_backward_config(DType::F32, 64, HardwareTier::Generic),
            BackwardTileConfig::from_blocks(16, 16, 4, 1)
        );
    }

    #[test]
    fn test_backward_large_head_dim_falls_back() {
        let generic = BackwardTileConfig::from_blocks(16, 16, 4, 1);
        assert_eq!(default_backward_config(DType::BF16, 512, HardwareTier::Hopper), generic);
        assert_eq!(default_backward_config(DType::F32, 512, HardwareTier::Hopper), generic);
        assert_eq!(default_backward_config(DType::BF16, 257, HardwareTier::Ampere), generic);
        assert_eq!(
            default_backward_config(DType::BF16, 256, HardwareTier::Hopper),
            BackwardTileConfig::from_blocks(128, 128, 4, 3)
        );
        assert_eq!(backward_candidates(DType::BF16, 512, HardwareTier::Hopper, false), [generic]);
    }

    #[test]
    fn test_candidate_counts() {
        assert_eq!(forward_candidates(DType::F32, 64, HardwareTier::Hopper, false).len(), 1);
        assert_eq!(forward_candidates(DType::F32, 64, HardwareTier::Hopper, true).len(), 6);
        let bwd = backward_candidates(DType::F32, 64, HardwareTier::Ampere, true);
        assert_eq!(bwd.len(), 17);
        assert!(bwd.iter().all(|c| c.validate().is_ok()));
    }

    #[test]
    fn test_default_is_first_candidate() {
        let fwd = forward_candidates(DType::BF16, 128, HardwareTier::Ampere, true);
        assert_eq!(fwd[0], default_forward_config(DType::BF16, 128, HardwareTier::Ampere));
    }

    #[test]
    fn test_tile_validation() {
        assert!(TileConfig::new(64, 32, 4, 3).validate().is_ok());
        assert!(TileConfig::new(48, 32, 4, 3).validate().is_err());
        assert!(TileConfig::new(64, 32, 3, 3).validate().is_err());
        assert!(TileConfig::new(64, 32, 4, 0).validate().is_err());
    }

    #[test]
    fn test_backward_divisibility() {
        let ok = BackwardTileConfig {
            block_m1: 32,
            block_n1: 64,
            block_m2: 64,
            block_n2: 32,
            num_warps: 4,
            num_stages: 1,
        };
        assert!(ok.validate().is_ok());
        let bad_kv = BackwardTileConfig { block_m1: 64, block_n1: 32, ..ok };
        assert!(bad_kv.validate().is_err());
        let bad_q = BackwardTileConfig { block_m2: 32, block_n2: 64, ..ok };
        assert!(bad_q.validate().is_err());
    }

    #[test]
    fn test_shared_memory_calculation() {
        let config = TileConfig::new(64, 64, 4, 1);
        // q 64*64*4 + kv 2*64*64*4 + (64*64 + 64*64 + 128)*4
        assert_eq!(config.shared_memory_bytes(64, 4), 16_384 + 32_768 + 33_280);
    }

    #[test]
    fn test_num_tiles() {
        let config = TileConfig::new(128, 64, 4, 3);
        assert_eq!(config.num_q_tiles(512), 4);
        assert_eq!(config.num_q_tiles(513), 5);
        assert_eq!(config.num_kv_tiles(65), 2);
    }

    #[test]
    fn test_builder_pattern() {
        let config = FlexAttentionConfig::for_a100()
            .with_rows_guaranteed_safe()
            .without_logsumexp()
            .with_backward_tiles(BackwardTileConfig::from_blocks(32, 32, 4, 1));
        assert_eq!(config.tier(), HardwareTier::Ampere);
        assert!(config.rows_guaranteed_safe);
        assert!(!config.output_logsumexp);
        assert!(config.backward_tiles.is_some());
        assert_eq!(FlexAttentionConfig::default().tier(), HardwareTier::Generic);
    }
}
