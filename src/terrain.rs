//! Owner of one terrain instance: the composer, the worker pool, residency,
//! and the shared live chunk map. All mutation and the per-frame tick happen
//! through `&mut self` on the owning thread; queries go through the cloneable
//! [`TerrainReader`] and may run anywhere.

use crate::{
    chunk::{BlockKind, Chunk, ChunkMap, ChunkPos},
    config::TerrainConfig,
    debug::{DebugEvents, DebugSink},
    job::MesherPool,
    query::{RaycastResult, Sphere, SweepResult},
    residency::{MeshEvent, Residency},
    sdf::Composer,
    TerrainError,
};
use nalgebra::{Point3, Vector3};
use std::sync::Arc;

pub use crate::query::TerrainReader;

pub struct Terrain {
    composer: Composer,
    pool: MesherPool,
    residency: Residency,
    map: Arc<ChunkMap>,
    debug: DebugEvents,
}

impl Terrain {
    /// Builds the worker pool and allocates the chunk pool up front; nothing
    /// else allocates per frame.
    pub fn new(config: TerrainConfig) -> Result<Self, TerrainError> {
        config.validate()?;

        let map = Arc::new(ChunkMap::new(config.chunk_side));
        let debug = DebugEvents::default();
        let pool = MesherPool::new(&config);
        let residency = Residency::new(config, Arc::clone(&map), debug.clone());

        Ok(Self {
            composer: Composer::new(),
            pool,
            residency,
            map,
            debug,
        })
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn composer_mut(&mut self) -> &mut Composer {
        &mut self.composer
    }

    /// One residency tick for a viewer at `center` with active radius
    /// `radius`.
    pub fn update(&mut self, center: Point3<f32>, radius: f32) {
        self.residency
            .update(center, radius, &mut self.composer, &mut self.pool);
    }

    /// Waits for every in-flight job, integrates the results, and releases
    /// the workers. Dropping the terrain does the same; this form just makes
    /// the wait explicit.
    pub fn terminate(mut self) {
        self.residency.finish_all(&mut self.pool);
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// True once no work remains anywhere: no staged or dirty shapes, no
    /// jobs in flight, and every resident chunk meshed. After a mutation
    /// this goes false until enough update ticks have run.
    pub fn is_settled(&self) -> bool {
        self.pool.in_flight() == 0 && self.composer_is_idle() && self.residency.is_settled()
    }

    fn composer_is_idle(&self) -> bool {
        !self.composer.has_pending() && !self.composer.has_dirty()
    }

    /// Mesh publication notifications accumulated since the last drain.
    pub fn drain_mesh_events(&mut self) -> Vec<MeshEvent> {
        self.residency.drain_events()
    }

    pub fn set_debug_sink(&self, sink: Option<DebugSink>) {
        self.debug.set_sink(sink);
    }

    /// Read handle usable from any thread, concurrently with updates.
    pub fn reader(&self) -> TerrainReader {
        TerrainReader::new(Arc::clone(&self.map))
    }

    /// The chunk at `pos`, Live chunks only.
    pub fn chunk(&self, pos: ChunkPos) -> Option<Arc<Chunk>> {
        self.map.chunk(pos)
    }

    pub fn voxel(&self, voxel: Point3<i32>) -> BlockKind {
        self.map.voxel(voxel)
    }

    pub fn voxel_at(&self, position: Point3<f32>) -> BlockKind {
        self.reader().voxel_at(position)
    }

    pub fn collides(&self, position: Point3<f32>) -> bool {
        self.reader().collides(position)
    }

    pub fn raycast(&self, origin: Point3<f32>, ray: Vector3<f32>) -> RaycastResult {
        self.reader().raycast(origin, ray)
    }

    pub fn voxel_raycast(
        &self,
        origin: Point3<f32>,
        ray: Vector3<f32>,
        min_steps: usize,
        allow_source_collision: bool,
    ) -> RaycastResult {
        self.reader()
            .voxel_raycast(origin, ray, min_steps, allow_source_collision)
    }

    pub fn sweep_sphere(&self, sphere: Sphere, ray: Vector3<f32>) -> SweepResult {
        self.reader().sweep_sphere(sphere, ray)
    }

    pub fn push_out_sphere(&self, sphere: Sphere) -> Option<Vector3<f32>> {
        self.reader().push_out_sphere(sphere)
    }
}
