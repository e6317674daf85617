//! Decides which chunks are resident, dispatches meshing jobs for the ones
//! that need geometry, and integrates finished jobs by atomically publishing
//! their results.

use crate::{
    aabb::Aabb,
    chunk::{chunk_aabb, BlockKind, Chunk, ChunkContents, ChunkMap, ChunkPos, TerrainMesh},
    config::TerrainConfig,
    debug::DebugEvents,
    job::{MeshJob, MesherPool},
    sdf::{cache::CACHE_OFFSET, Composer},
};
use nalgebra::Point3;
use std::{collections::HashMap, sync::Arc};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkStatus {
    /// Allocated, no contents published yet.
    Empty,
    /// A meshing job is in flight for this chunk.
    Pending,
    /// Published and inside the target set.
    Live,
    /// Published but outside the target set; evicted under pool pressure.
    Retired,
}

/// Notification for the external renderer: there is a new (or no longer any)
/// buffer for this chunk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MeshEvent {
    Published(ChunkPos),
    Evicted(ChunkPos),
}

struct Resident {
    pos: ChunkPos,
    status: ChunkStatus,
    geo_dirty: bool,
    pending_generation: Option<u64>,
    chunk: Option<Arc<Chunk>>,
    score: f32,
}

impl Resident {
    fn new(pos: ChunkPos) -> Self {
        Self {
            pos,
            status: ChunkStatus::Empty,
            geo_dirty: false,
            pending_generation: None,
            chunk: None,
            score: f32::INFINITY,
        }
    }
}

pub struct Residency {
    config: TerrainConfig,
    slots: Vec<Option<Resident>>,
    free: Vec<usize>,
    index: HashMap<ChunkPos, usize>,
    map: Arc<ChunkMap>,
    /// Chunks that meshed to a single classification with no geometry, kept
    /// across frees so an empty chunk re-entering the radius never costs a
    /// job. Invalidations clear overlapping entries.
    known_uniform: HashMap<ChunkPos, BlockKind>,
    next_generation: u64,
    events: Vec<MeshEvent>,
    debug: DebugEvents,
}

impl Residency {
    pub fn new(config: TerrainConfig, map: Arc<ChunkMap>, debug: DebugEvents) -> Self {
        let capacity = config.max_loaded();
        Self {
            config,
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            index: HashMap::new(),
            map,
            known_uniform: HashMap::new(),
            next_generation: 1,
            events: Vec::new(),
            debug,
        }
    }

    pub fn resident_count(&self) -> usize {
        self.index.len()
    }

    pub fn status(&self, pos: ChunkPos) -> Option<ChunkStatus> {
        let &slot = self.index.get(&pos)?;
        self.slots[slot].as_ref().map(|resident| resident.status)
    }

    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        std::mem::take(&mut self.events)
    }

    /// True when every resident chunk has published contents and none is
    /// waiting on a re-mesh.
    pub fn is_settled(&self) -> bool {
        self.slots.iter().flatten().all(|resident| {
            !resident.geo_dirty
                && matches!(resident.status, ChunkStatus::Live | ChunkStatus::Retired)
        })
    }

    /// One full residency tick, in the order the pipeline demands:
    /// invalidations, target selection, dispatch, integration.
    pub fn update(
        &mut self,
        center: Point3<f32>,
        radius: f32,
        composer: &mut Composer,
        pool: &mut MesherPool,
    ) {
        // staged composer mutations merge only when no job could be holding
        // an older view of the shape list
        if pool.in_flight() == 0 {
            composer.update_pending();
        }

        let invalidations = composer.drain_invalidations();
        self.apply_invalidations(&invalidations);
        self.retarget(center, radius);
        self.dispatch_jobs(composer, pool);
        self.integrate(pool);
    }

    /// Waits for every in-flight job and integrates the results. Used on
    /// shutdown so buffers land in a well-defined place.
    pub fn finish_all(&mut self, pool: &mut MesherPool) {
        let finished = pool.wait_idle();
        for job in finished {
            self.integrate_job(job, pool);
        }
    }

    fn apply_invalidations(&mut self, invalidations: &[Aabb]) {
        if invalidations.is_empty() {
            return;
        }

        // a chunk's mesh reads samples a few voxels outside its own box, so
        // the changed region is grown by the halo before overlap testing
        let halo = CACHE_OFFSET as f32 + 1.0;
        for aabb in invalidations {
            let expanded = aabb.inflate(halo);
            for slot in self.slots.iter_mut().flatten() {
                if chunk_aabb(slot.pos, self.config.chunk_side).intersects(&expanded) {
                    slot.geo_dirty = true;
                }
            }
            let side = self.config.chunk_side;
            self.known_uniform
                .retain(|pos, _| !chunk_aabb(*pos, side).intersects(&expanded));
        }
    }

    fn score(&self, pos: ChunkPos, center: Point3<f32>, resident: bool) -> f32 {
        let distance = (pos.center(self.config.chunk_side) - center).norm();
        if resident {
            distance - self.config.hysteresis()
        } else {
            distance
        }
    }

    fn retarget(&mut self, center: Point3<f32>, radius: f32) {
        let side = self.config.chunk_side as f32;

        let min = |v: f32| ((v - radius) / side).floor() as i32;
        let max = |v: f32| ((v + radius) / side).floor() as i32;
        let mut candidates: Vec<(f32, ChunkPos)> = Vec::new();
        for x in min(center.x)..=max(center.x) {
            for y in min(center.y)..=max(center.y) {
                for z in min(center.z)..=max(center.z) {
                    let pos = ChunkPos::new([x, y, z]);
                    let aabb = chunk_aabb(pos, self.config.chunk_side);
                    if aabb.distance_sq(&center) > radius * radius {
                        continue;
                    }
                    let resident = self.index.contains_key(&pos);
                    candidates.push((self.score(pos, center, resident), pos));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        candidates.truncate(self.config.max_active);

        // refresh scores on everything resident; anything that fell out of
        // the target set goes to the retired tail
        for slot in self.slots.iter_mut().flatten() {
            slot.score = (slot.pos.center(self.config.chunk_side) - center).norm()
                - self.config.hysteresis();
            if slot.status == ChunkStatus::Live {
                slot.status = ChunkStatus::Retired;
            }
        }

        for &(score, pos) in candidates.iter() {
            match self.index.get(&pos).copied() {
                Some(slot) => {
                    let resident = self.slots[slot].as_mut().expect("index points at empty slot");
                    resident.score = score;
                    if resident.status == ChunkStatus::Retired {
                        resident.status = ChunkStatus::Live;
                    }
                }
                None => {
                    if !self.alloc(pos, score) {
                        // pool full and nothing evictable scored worse; skip
                        // the lowest-priority allocations this tick
                        self.debug.emit(
                            pos.center(self.config.chunk_side),
                            "chunk pool exhausted",
                        );
                        log::warn!("chunk pool exhausted, skipping allocation of {:?}", pos);
                    }
                }
            }
        }
    }

    /// Allocates a slot for `pos`, evicting the worst-scored chunk outside
    /// the target set if the pool is full. Fails when everything resident
    /// scores better than the newcomer.
    fn alloc(&mut self, pos: ChunkPos, score: f32) -> bool {
        if self.free.is_empty() {
            let victim = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| slot.as_ref().map(|r| (index, r)))
                .filter(|(_, r)| matches!(r.status, ChunkStatus::Retired | ChunkStatus::Pending))
                .max_by(|a, b| a.1.score.total_cmp(&b.1.score))
                .map(|(index, r)| (index, r.score));
            match victim {
                Some((index, victim_score)) if victim_score > score => self.release_slot(index),
                _ => return false,
            }
        }

        let slot = self.free.pop().expect("eviction yielded no free slot");
        let mut resident = Resident::new(pos);
        resident.score = score;
        self.slots[slot] = Some(resident);
        self.index.insert(pos, slot);
        true
    }

    fn release_slot(&mut self, slot: usize) {
        let resident = self.slots[slot].take().expect("releasing an empty slot");
        self.index.remove(&resident.pos);
        if resident.chunk.is_some() {
            self.map.remove(resident.pos);
            if self.config.render {
                self.events.push(MeshEvent::Evicted(resident.pos));
            }
        }
        self.free.push(slot);
    }

    fn dispatch_jobs(&mut self, composer: &Composer, pool: &mut MesherPool) {
        let mut budget = usize::min(self.config.max_new_jobs_per_tick, pool.idle_jobs());

        // chunks that need geometry, nearest first
        let mut needy: Vec<(f32, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|r| (index, r)))
            .filter(|(_, r)| {
                r.status != ChunkStatus::Pending
                    && r.status != ChunkStatus::Retired
                    && (r.status == ChunkStatus::Empty || r.geo_dirty)
            })
            .map(|(index, r)| (r.score, index))
            .collect();
        needy.sort_by(|a, b| a.0.total_cmp(&b.0));

        for (_, slot) in needy {
            if budget == 0 {
                break;
            }
            let resident = self.slots[slot].as_mut().expect("needy slot vanished");
            let pos = resident.pos;

            // chunks remembered as uniform publish directly and cost no job
            if resident.status == ChunkStatus::Empty && !resident.geo_dirty {
                if let Some(&kind) = self.known_uniform.get(&pos) {
                    let generation = self.next_generation;
                    self.next_generation += 1;
                    let contents =
                        ChunkContents::uniform(pos, self.config.chunk_side, kind, generation);
                    Self::publish(
                        &self.map,
                        &mut self.events,
                        self.config.render,
                        self.slots[slot].as_mut().unwrap(),
                        self.config.chunk_side,
                        contents,
                    );
                    continue;
                }
            }

            let generation = self.next_generation;
            self.next_generation += 1;
            if !pool.dispatch(pos, generation, composer.snapshot()) {
                break;
            }
            let resident = self.slots[slot].as_mut().unwrap();
            resident.status = ChunkStatus::Pending;
            resident.pending_generation = Some(generation);
            // invalidations that arrive while the job is flying re-latch this
            resident.geo_dirty = false;
            budget -= 1;
        }
    }

    fn integrate(&mut self, pool: &mut MesherPool) {
        for job in pool.drain_finished() {
            self.integrate_job(job, pool);
        }
    }

    fn integrate_job(&mut self, mut job: MeshJob, pool: &mut MesherPool) {
        let pos = job.pos();
        let accepted = self
            .index
            .get(&pos)
            .and_then(|&slot| self.slots[slot].as_ref().map(|r| (slot, r)))
            .filter(|(_, r)| r.pending_generation == Some(job.generation()))
            .map(|(slot, _)| slot);

        let slot = match accepted {
            Some(slot) => slot,
            None => {
                // the chunk was evicted while its job ran; the job still ran
                // to completion and its result is simply discarded
                pool.recycle(job);
                return;
            }
        };

        if job.saturated() {
            let center = pos.center(self.config.chunk_side);
            log::warn!("chunk {:?} exceeded its mesh budgets, publishing empty", pos);
            self.debug.emit(center, "mesh budget exceeded");
        }

        let contents = ChunkContents {
            blocks: std::mem::take(&mut job.out.blocks).into_boxed_slice(),
            vertex_slots: std::mem::take(&mut job.out.vertex_slots).into_boxed_slice(),
            mesh: TerrainMesh {
                vertices: std::mem::take(&mut job.out.vertices),
                indices: std::mem::take(&mut job.out.indices),
            },
            aabb: chunk_aabb(pos, self.config.chunk_side),
            generation: job.generation(),
        };

        if let Some(stats) = job.stats() {
            match stats.uniform {
                Some(kind) => {
                    self.known_uniform.insert(pos, kind);
                }
                None => {
                    self.known_uniform.remove(&pos);
                }
            }
        }

        let resident = self.slots[slot].as_mut().expect("accepted slot vanished");
        Self::publish(
            &self.map,
            &mut self.events,
            self.config.render,
            resident,
            self.config.chunk_side,
            contents,
        );
        pool.recycle(job);
    }

    fn publish(
        map: &ChunkMap,
        events: &mut Vec<MeshEvent>,
        render: bool,
        resident: &mut Resident,
        side: usize,
        contents: ChunkContents,
    ) {
        let pos = resident.pos;
        match &resident.chunk {
            Some(chunk) => chunk.publish(Arc::new(contents)),
            None => {
                let chunk = Arc::new(Chunk::new(pos, side, contents));
                map.insert(pos, Arc::clone(&chunk));
                resident.chunk = Some(chunk);
            }
        }
        resident.status = ChunkStatus::Live;
        resident.pending_generation = None;
        if render {
            events.push(MeshEvent::Published(pos));
        }
    }
}
