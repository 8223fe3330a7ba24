// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! # flex-attn-rs
//!
//! Flexible attention with user-defined score modifications, built on
//! [Candle](https://github.com/huggingface/candle):
//!
//! - Score-modification graphs inlined into a single fused expression
//! - Tiled online-softmax forward kernel with logsumexp output
//! - Two-phase backward kernel (key/value, then query)
//! - Per-hardware tile tables and an autotuning harness
//! - Prebuilt modifications: causal, scaling, relative bias, ALiBi, soft-capping
//!
//! ## Status
//!
//! Kernels execute on the host with rayon over the launch grid; tensors on
//! other devices are staged through host memory.
//!
//! ## Quick Start
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use flex_attn_rs::kernels::{flex_attention, FlexAttentionConfig};
//! use flex_attn_rs::score_mods;
//!
//! # fn main() -> flex_attn_rs::Result<()> {
//! let q = Tensor::randn(0.0f32, 1.0, (2, 4, 16, 32), &Device::Cpu)?;
//! let k = Tensor::randn(0.0f32, 1.0, (2, 4, 16, 32), &Device::Cpu)?;
//! let v = Tensor::randn(0.0f32, 1.0, (2, 4, 16, 32), &Device::Cpu)?;
//!
//! let scaled = score_mods::scaled(1.0 / (32f64).sqrt());
//! let out = flex_attention(&q, &k, &v, &scaled.forward, &[], &FlexAttentionConfig::default())?;
//! assert_eq!(out.output.dims(), q.dims());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod graph;
pub mod kernels;
pub mod reference;
pub mod score_mods;

pub use error::{FlexAttnError, Result};
