use crate::{prelude::*, TerrainError};
use serde_derive::Deserialize;
use std::path::Path;

/// Tunables for one [`Terrain`](crate::terrain::Terrain) instance.
///
/// A zero in `max_loaded`, `worker_threads` or `hysteresis` means "derive the
/// value" (see the accessor methods); everything else is used as-is after
/// [`validate`](TerrainConfig::validate) passes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TerrainConfig {
    /// Voxels per chunk axis. Must be a power of two, at least 16.
    pub chunk_side: usize,
    /// Maximum number of Live chunks held simultaneously.
    pub max_active: usize,
    /// Chunk pool capacity. 0 derives `2 * max_active`.
    pub max_loaded: usize,
    /// Upper bound on meshing jobs dispatched per update tick.
    pub max_new_jobs_per_tick: usize,
    /// Margin, in voxels, by which a chunk's box is expanded when deciding
    /// whether a union shape can be skipped during cache builds.
    pub sdf_boundary: f32,
    /// Bisection iterations per surface-crossing edge.
    pub qef_iter: u32,
    /// Worker thread (and job) count. 0 derives three quarters of the
    /// hardware threads, minimum one.
    pub worker_threads: usize,
    /// Score bonus for chunks that are already resident, in world units.
    /// 0 derives half a chunk side.
    pub hysteresis: f32,
    /// Whether mesh publication events are collected for a renderer.
    pub render: bool,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            chunk_side: 64,
            max_active: 512,
            max_loaded: 0,
            max_new_jobs_per_tick: 4,
            sdf_boundary: 2.0,
            qef_iter: 8,
            worker_threads: 0,
            hysteresis: 0.0,
            render: true,
        }
    }
}

impl TerrainConfig {
    pub fn validate(&self) -> Result<(), TerrainError> {
        if self.chunk_side < 16 || !self.chunk_side.is_power_of_two() {
            return Err(TerrainError::InvalidConfig(
                "chunk_side must be a power of two no smaller than 16",
            ));
        }
        if self.chunk_side > 256 {
            // the vertex index type is u16; much past this the per-chunk
            // budgets stop meaning anything
            return Err(TerrainError::InvalidConfig("chunk_side must be at most 256"));
        }
        if self.max_active == 0 {
            return Err(TerrainError::InvalidConfig("max_active must be non-zero"));
        }
        if self.max_loaded != 0 && self.max_loaded < self.max_active {
            return Err(TerrainError::InvalidConfig(
                "max_loaded must be at least max_active",
            ));
        }
        if self.max_new_jobs_per_tick == 0 {
            return Err(TerrainError::InvalidConfig(
                "max_new_jobs_per_tick must be non-zero",
            ));
        }
        if !self.sdf_boundary.is_finite() || self.sdf_boundary < 2.0 {
            return Err(TerrainError::InvalidConfig("sdf_boundary must be at least 2"));
        }
        if self.qef_iter == 0 {
            return Err(TerrainError::InvalidConfig("qef_iter must be non-zero"));
        }
        if !self.hysteresis.is_finite() || self.hysteresis < 0.0 {
            return Err(TerrainError::InvalidConfig("hysteresis must be non-negative"));
        }
        Ok(())
    }

    pub fn max_loaded(&self) -> usize {
        match self.max_loaded {
            0 => self.max_active * 2,
            n => n,
        }
    }

    pub fn worker_threads(&self) -> usize {
        match self.worker_threads {
            0 => {
                let hardware = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                usize::max(1, hardware * 3 / 4)
            }
            n => n,
        }
    }

    pub fn hysteresis(&self) -> f32 {
        match self.hysteresis {
            h if h == 0.0 => self.chunk_side as f32 * 0.5,
            h => h,
        }
    }
}

/// Reads a [`TerrainConfig`] from a JSON file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TerrainConfig> {
    let file = std::fs::File::open(path.as_ref())?;
    let config: TerrainConfig = serde_json::from_reader(file)?;
    config.validate()?;
    Ok(config)
}
