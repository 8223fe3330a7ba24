// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Error types for flex-attn-rs.

use thiserror::Error;

/// Result type alias for flex-attn-rs operations.
pub type Result<T> = std::result::Result<T, FlexAttnError>;

/// Errors that can occur while building or running flex attention kernels.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FlexAttnError {
    /// The score-modification graph cannot produce a kernel (e.g. no output node).
    #[error("malformed score-mod graph: {0}")]
    MalformedGraph(String),

    /// The graph output did not resolve to a single tensor expression.
    #[error("score-mod output must be a single tensor expression, got {0}")]
    OutputContract(String),

    /// An operation node could not be lowered.
    #[error("cannot lower `{op}`: {reason}")]
    Lowering {
        /// Operation identity
        op: String,
        /// What went wrong
        reason: String,
    },

    /// A placeholder could not be bound against the call arguments.
    #[error("binding error: {0}")]
    Binding(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Kernel execution error.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Every autotuning candidate failed.
    #[error("autotuning `{name}` failed: {reason}")]
    Autotune {
        /// Kernel family being tuned
        name: String,
        /// Collected failure reasons
        reason: String,
    },

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
