// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Flex attention kernels.
//!
//! The forward kernel is a tiled online-softmax attention, the backward
//! kernel runs a key/value phase and a query phase over the same launch grid.
//! Both evaluate an inlined score modification on every score tile.

pub mod autotune;
pub mod backward;
pub mod config;
pub mod flex_attention;
pub mod forward;
pub mod launch;
pub mod modification;
pub mod problem;

pub use backward::BackwardKernel;
pub use config::{BackwardTileConfig, FlexAttentionConfig, HardwareTier, TileConfig};
pub use flex_attention::{
    flex_attention, flex_attention_backward, BackwardArgs, FlexAttentionGrads, FlexAttentionOutput,
};
pub use forward::ForwardKernel;
pub use problem::AttentionProblem;
