//! Pre-allocated meshing jobs and the worker pool that runs them.
//!
//! A job owns every buffer it touches for its whole lifetime: the sampled
//! field, the edge-table scratch, and the output vectors. Dispatch moves the
//! job into the work queue, the worker runs it to completion without
//! yielding, and the finished job comes back over the completion channel.
//! Nothing is allocated at dispatch time, and no state is shared between a
//! running job and the rest of the engine.

use crate::{
    chunk::ChunkPos,
    config::TerrainConfig,
    mesher::{MeshOutput, MeshStats, Mesher},
    sdf::{ComposerSnapshot, SdfCache},
    util::ChannelPair,
};
use crossbeam_channel::Sender;
use std::thread::JoinHandle;

pub struct MeshJob {
    pos: ChunkPos,
    generation: u64,
    boundary: f32,
    snapshot: Option<ComposerSnapshot>,
    cache: SdfCache,
    mesher: Mesher,
    pub out: MeshOutput,
    stats: Option<MeshStats>,
    saturated: bool,
}

impl MeshJob {
    fn new(config: &TerrainConfig) -> Self {
        Self {
            pos: ChunkPos::new([0, 0, 0]),
            generation: 0,
            boundary: config.sdf_boundary,
            snapshot: None,
            cache: SdfCache::new(config.chunk_side),
            mesher: Mesher::new(config.chunk_side, config.qef_iter),
            out: MeshOutput::default(),
            stats: None,
            saturated: false,
        }
    }

    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn saturated(&self) -> bool {
        self.saturated
    }

    pub fn stats(&self) -> Option<MeshStats> {
        self.stats
    }

    fn prime(&mut self, pos: ChunkPos, generation: u64, snapshot: ComposerSnapshot) {
        self.pos = pos;
        self.generation = generation;
        self.snapshot = Some(snapshot);
        self.stats = None;
        self.saturated = false;
    }

    /// The whole job, start to finish. Runs on a worker thread; only this
    /// job's own buffers are touched.
    fn run(&mut self) {
        let snapshot = self
            .snapshot
            .as_ref()
            .expect("job dispatched without a composer snapshot");
        self.cache.build(self.pos, snapshot, self.boundary);
        match self.mesher.build(&self.cache, &mut self.out) {
            Ok(stats) => self.stats = Some(stats),
            Err(_) => self.saturated = true,
        }
    }

    /// Dropping the snapshot here is what finally releases shapes destroyed
    /// while this job was in flight.
    fn release(&mut self) {
        self.snapshot = None;
    }
}

pub struct MesherPool {
    work_tx: Option<Sender<MeshJob>>,
    completed: ChannelPair<MeshJob>,
    idle: Vec<MeshJob>,
    in_flight: usize,
    workers: Vec<JoinHandle<()>>,
}

impl MesherPool {
    pub fn new(config: &TerrainConfig) -> Self {
        let worker_count = config.worker_threads();
        // with exactly one job per worker the bounded queue can never block
        // the dispatching thread
        let (work_tx, work_rx) = crossbeam_channel::bounded::<MeshJob>(worker_count);
        let completed = ChannelPair::new();

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let work_rx = work_rx.clone();
            let done_tx = completed.sender();
            let handle = std::thread::Builder::new()
                .name(format!("isoterra-mesher-{}", index))
                .spawn(move || {
                    for mut job in work_rx.iter() {
                        job.run();
                        if done_tx.send(job).is_err() {
                            break;
                        }
                    }
                })
                .expect("failed to spawn mesher worker");
            workers.push(handle);
        }

        log::debug!("mesher pool started with {} workers", worker_count);

        Self {
            work_tx: Some(work_tx),
            completed,
            idle: (0..worker_count).map(|_| MeshJob::new(config)).collect(),
            in_flight: 0,
            workers,
        }
    }

    pub fn idle_jobs(&self) -> usize {
        self.idle.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Hands an idle job to the workers. Returns false when every job is
    /// already running.
    pub fn dispatch(&mut self, pos: ChunkPos, generation: u64, snapshot: ComposerSnapshot) -> bool {
        let mut job = match self.idle.pop() {
            Some(job) => job,
            None => return false,
        };
        job.prime(pos, generation, snapshot);

        let work_tx = self.work_tx.as_ref().expect("pool already shut down");
        work_tx.send(job).expect("worker channel disconnected");
        self.in_flight += 1;
        true
    }

    /// Collects every job whose worker has finished. The caller integrates
    /// the results and must hand each job back through [`recycle`].
    ///
    /// [`recycle`]: MesherPool::recycle
    pub fn drain_finished(&mut self) -> Vec<MeshJob> {
        let finished: Vec<MeshJob> = self.completed.rx.try_iter().collect();
        self.in_flight -= finished.len();
        finished
    }

    pub fn recycle(&mut self, mut job: MeshJob) {
        job.release();
        self.idle.push(job);
    }

    /// Blocks until every in-flight job has drained into the completion
    /// queue. Used by terminate; jobs are never cancelled mid-run.
    pub fn wait_idle(&mut self) -> Vec<MeshJob> {
        let mut finished = Vec::new();
        while self.in_flight > 0 {
            match self.completed.rx.recv() {
                Ok(job) => {
                    self.in_flight -= 1;
                    finished.push(job);
                }
                Err(_) => break,
            }
        }
        finished
    }
}

impl Drop for MesherPool {
    fn drop(&mut self) {
        // closing the work queue lets each worker finish its current job and
        // exit
        self.work_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdf::Composer;
    use nalgebra::{vector, Matrix4};

    fn test_config() -> TerrainConfig {
        let mut config = TerrainConfig::default();
        config.chunk_side = 16;
        config.worker_threads = 2;
        config
    }

    fn snapshot_with_box() -> ComposerSnapshot {
        let mut composer = Composer::new();
        let id = composer.create_box();
        composer
            .set_transform(id, Matrix4::new_nonuniform_scaling(&vector![6.0, 6.0, 6.0]))
            .unwrap();
        composer.update_pending();
        composer.snapshot()
    }

    #[test]
    fn jobs_round_trip_through_the_pool() {
        let config = test_config();
        let mut pool = MesherPool::new(&config);
        assert_eq!(pool.idle_jobs(), 2);

        let snapshot = snapshot_with_box();
        assert!(pool.dispatch(ChunkPos::new([0, 0, 0]), 1, snapshot.clone()));
        assert!(pool.dispatch(ChunkPos::new([-1, -1, -1]), 2, snapshot.clone()));
        assert!(!pool.dispatch(ChunkPos::new([1, 1, 1]), 3, snapshot));
        assert_eq!(pool.in_flight(), 2);

        let finished = pool.wait_idle();
        assert_eq!(finished.len(), 2);
        for job in finished {
            assert!(!job.saturated());
            let stats = job.stats().expect("job completed");
            assert!(stats.vertex_count > 0, "chunk {:?} meshed empty", job.pos());
            pool.recycle(job);
        }
        assert_eq!(pool.idle_jobs(), 2);
    }

    #[test]
    fn drain_finished_eventually_returns_dispatched_jobs() {
        let config = test_config();
        let mut pool = MesherPool::new(&config);
        assert!(pool.dispatch(ChunkPos::new([0, 0, 0]), 7, snapshot_with_box()));

        let mut finished = Vec::new();
        while finished.is_empty() {
            finished = pool.drain_finished();
            std::thread::yield_now();
        }
        assert_eq!(finished[0].generation(), 7);
        assert_eq!(pool.in_flight(), 0);
    }
}
