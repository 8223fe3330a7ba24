// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Launch planner: grid shapes and per-unit dispatch.

use super::config::{BackwardTileConfig, TileConfig};
use super::problem::AttentionProblem;

/// Three-axis launch grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchGrid {
    /// First axis.
    pub x: usize,
    /// Second axis.
    pub y: usize,
    /// Third axis.
    pub z: usize,
}

/// Position of one unit in a [`LaunchGrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId {
    /// Index along x.
    pub x: usize,
    /// Index along y.
    pub y: usize,
    /// Index along z.
    pub z: usize,
}

impl LaunchGrid {
    /// Total number of units.
    #[must_use]
    pub const fn num_units(&self) -> usize {
        self.x * self.y * self.z
    }

    /// Program id of the `linear`-th unit, x varying fastest.
    #[must_use]
    pub const fn program_id(&self, linear: usize) -> ProgramId {
        ProgramId {
            x: linear % self.x,
            y: (linear / self.x) % self.y,
            z: linear / (self.x * self.y),
        }
    }

    /// Iterate over every unit.
    pub fn units(&self) -> impl Iterator<Item = ProgramId> + '_ {
        (0..self.num_units()).map(|linear| self.program_id(linear))
    }
}

/// `(ceil(M / BLOCK_M), Z * H, 1)`.
#[must_use]
pub fn forward_grid(problem: &AttentionProblem, tiles: &TileConfig) -> LaunchGrid {
    LaunchGrid {
        x: tiles.num_q_tiles(problem.q_len),
        y: problem.batch_heads(),
        z: 1,
    }
}

/// `(ceil(M / BLOCK_M2) + ceil(N / BLOCK_N1), 1, Z * H)`.
#[must_use]
pub fn backward_grid(problem: &AttentionProblem, tiles: &BackwardTileConfig) -> LaunchGrid {
    LaunchGrid {
        x: problem.q_len.div_ceil(tiles.block_m2) + problem.kv_len.div_ceil(tiles.block_n1),
        y: 1,
        z: problem.batch_heads(),
    }
}

/// Work assigned to a forward unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardUnit {
    /// Batch index.
    pub batch: usize,
    /// Head index.
    pub head: usize,
    /// Query tile index.
    pub q_tile: usize,
}

/// Decode a forward program id.
#[must_use]
pub fn dispatch_forward(pid: ProgramId, problem: &AttentionProblem) -> ForwardUnit {
    ForwardUnit {
        batch: pid.y / problem.heads,
        head: pid.y % problem.heads,
        q_tile: pid.x,
    }
}

/// Work assigned to a backward unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackwardUnit {
    /// Owns one key/value tile, produces its GradKey and GradValue.
    KeyValue {
        /// Batch index.
        batch: usize,
        /// Head index.
        head: usize,
        /// Key/value tile index (in `BLOCK_N1` units).
        kv_tile: usize,
    },
    /// Owns one query tile, produces its GradQuery.
    Query {
        /// Batch index.
        batch: usize,
        /// Head index.
        head: usize,
        /// Query tile index (in `BLOCK_M2` units).
        q_tile: usize,
    },
}

/// Decode a backward program id: ids below the key/value tile count run the
/// key/value phase, the rest run the query phase.
#[must_use]
pub fn dispatch_backward(
    pid: ProgramId,
    problem: &AttentionProblem,
    tiles: &BackwardTileConfig,
) -> BackwardUnit {
    let batch = pid.z / problem.heads;
    let head = pid.z % problem.heads;
    let num_kv_tiles = problem.kv_len.div_ceil(tiles.block_n1);
    if pid.x < num_kv_tiles {
        BackwardUnit::KeyValue {
            batch,
            head,
            kv_tile: pid.x,
        }
    } else {
        BackwardUnit::Query {
            batch,
            head,
            q_tile: pid.x - num_kv_tiles,
        }
    }
}
