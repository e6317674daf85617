//! Chunk identity, voxel classification, and the per-chunk published state
//! that renderers and queries read.

use crate::{aabb::Aabb, util};
use arc_swap::ArcSwap;
use nalgebra::{point, vector, Point3};
use std::sync::Arc;

pub type TerrainIndex = u16;

/// Sentinel for "this voxel owns no vertex".
pub const INVALID_INDEX: TerrainIndex = TerrainIndex::MAX;

/// Classification of one voxel after meshing.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlockKind {
    /// Entirely outside the surface.
    Exterior,
    /// Entirely inside, no owning vertex.
    Interior,
    /// Owns a mesh vertex.
    Surface,
    /// Outside, but adjacent to a surface voxel; participates in collision
    /// overlap tests.
    Blocking,
    /// Not resident.
    Unloaded,
}

impl BlockKind {
    pub fn collides(&self) -> bool {
        matches!(
            self,
            BlockKind::Interior | BlockKind::Surface | BlockKind::Blocking | BlockKind::Unloaded
        )
    }
}

/// Vertex layout published to the renderer. `materials` holds four blend
/// weights that sum to 255; `info` carries per-vertex diagnostics (currently
/// the number of contributing edge crossings in its first byte).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct TerrainVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub materials: [u8; 4],
    pub info: [u8; 4],
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TerrainMesh {
    pub vertices: Vec<TerrainVertex>,
    /// Chunk-local indices into `vertices`, three per triangle, CCW front
    /// faces.
    pub indices: Vec<TerrainIndex>,
}

impl TerrainMesh {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
    }
}

/// Coordinate of a chunk; the chunk covers the world cube
/// `[pos * side, (pos + 1) * side)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new<I: Into<[i32; 3]>>(pos: I) -> Self {
        let [x, y, z] = pos.into();
        Self { x, y, z }
    }

    pub fn offset<I: Into<[i32; 3]>>(self, offset: I) -> Self {
        let [dx, dy, dz] = offset.into();
        Self {
            x: dx + self.x,
            y: dy + self.y,
            z: dz + self.z,
        }
    }

    /// World position of this chunk's minimum corner.
    pub fn origin(self, side: usize) -> Point3<f32> {
        let side = side as f32;
        point![
            side * self.x as f32,
            side * self.y as f32,
            side * self.z as f32
        ]
    }

    pub fn center(self, side: usize) -> Point3<f32> {
        let half = side as f32 * 0.5;
        self.origin(side) + vector![half, half, half]
    }

    /// Chunk containing the given world-space voxel coordinate.
    pub fn of_voxel(voxel: Point3<i32>, side: usize) -> Self {
        Self {
            x: util::floor_div(voxel.x, side as i32),
            y: util::floor_div(voxel.y, side as i32),
            z: util::floor_div(voxel.z, side as i32),
        }
    }
}

impl From<ChunkPos> for Point3<i32> {
    fn from(ChunkPos { x, y, z }: ChunkPos) -> Self {
        point![x, y, z]
    }
}

pub fn chunk_aabb(pos: ChunkPos, side: usize) -> Aabb {
    let origin = pos.origin(side);
    Aabb {
        min: origin,
        max: origin + vector![side as f32, side as f32, side as f32],
    }
}

/// Splits a world voxel coordinate into its chunk and the offset within it.
pub fn voxel_chunk_and_offset(voxel: Point3<i32>, side: usize) -> (ChunkPos, [usize; 3]) {
    let pos = ChunkPos::of_voxel(voxel, side);
    let offset = [
        util::floor_rem(voxel.x, side as i32) as usize,
        util::floor_rem(voxel.y, side as i32) as usize,
        util::floor_rem(voxel.z, side as i32) as usize,
    ];
    (pos, offset)
}

/// Everything a chunk publishes, swapped as one unit so readers can never
/// observe a classification grid from one meshing pass next to vertex data
/// from another.
#[derive(Clone, Debug)]
pub struct ChunkContents {
    pub blocks: Box<[BlockKind]>,
    /// Per-voxel owning vertex slot, [`INVALID_INDEX`] when none.
    pub vertex_slots: Box<[TerrainIndex]>,
    pub mesh: TerrainMesh,
    pub aabb: Aabb,
    pub generation: u64,
}

impl ChunkContents {
    /// Contents where every voxel has the same classification and there is no
    /// geometry; used for chunks known to contain no surface.
    pub fn uniform(pos: ChunkPos, side: usize, kind: BlockKind, generation: u64) -> Self {
        Self {
            blocks: vec![kind; side * side * side].into_boxed_slice(),
            vertex_slots: vec![INVALID_INDEX; side * side * side].into_boxed_slice(),
            mesh: TerrainMesh::default(),
            aabb: chunk_aabb(pos, side),
            generation,
        }
    }

    pub fn block(&self, offset: [usize; 3], side: usize) -> BlockKind {
        self.blocks[(offset[0] * side + offset[1]) * side + offset[2]]
    }

    pub fn vertex_slot(&self, offset: [usize; 3], side: usize) -> TerrainIndex {
        self.vertex_slots[(offset[0] * side + offset[1]) * side + offset[2]]
    }
}

/// A resident chunk. The contents handle is the only shared mutable state;
/// publication is a single atomic pointer swap, and readers that loaded the
/// previous contents keep a consistent snapshot for as long as they hold it.
pub struct Chunk {
    pos: ChunkPos,
    side: usize,
    contents: ArcSwap<ChunkContents>,
}

impl Chunk {
    pub fn new(pos: ChunkPos, side: usize, contents: ChunkContents) -> Self {
        Self {
            pos,
            side,
            contents: ArcSwap::from_pointee(contents),
        }
    }

    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn contents(&self) -> Arc<ChunkContents> {
        self.contents.load_full()
    }

    pub(crate) fn publish(&self, contents: Arc<ChunkContents>) {
        self.contents.store(contents);
    }
}

/// The live chunk map shared between the residency owner and any number of
/// query threads. Only Live chunks appear here; everything else reads as
/// [`BlockKind::Unloaded`].
pub struct ChunkMap {
    side: usize,
    chunks: flurry::HashMap<ChunkPos, Arc<Chunk>>,
}

impl ChunkMap {
    pub fn new(side: usize) -> Self {
        Self {
            side,
            chunks: flurry::HashMap::new(),
        }
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn chunk(&self, pos: ChunkPos) -> Option<Arc<Chunk>> {
        self.chunks.pin().get(&pos).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.chunks.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.pin().is_empty()
    }

    pub(crate) fn insert(&self, pos: ChunkPos, chunk: Arc<Chunk>) {
        self.chunks.pin().insert(pos, chunk);
    }

    pub(crate) fn remove(&self, pos: ChunkPos) {
        self.chunks.pin().remove(&pos);
    }

    /// Classification of the voxel at a world-space voxel coordinate.
    pub fn voxel(&self, voxel: Point3<i32>) -> BlockKind {
        let (pos, offset) = voxel_chunk_and_offset(voxel, self.side);
        match self.chunk(pos) {
            Some(chunk) => chunk.contents().block(offset, self.side),
            None => BlockKind::Unloaded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voxel_offsets_stay_within_the_chunk() {
        let (pos, offset) = voxel_chunk_and_offset(point![-1, 0, 16], 16);
        assert_eq!(pos, ChunkPos::new([-1, 0, 1]));
        assert_eq!(offset, [15, 0, 0]);
    }

    #[test]
    fn chunk_aabb_covers_exactly_one_cube() {
        let aabb = chunk_aabb(ChunkPos::new([1, -1, 0]), 16);
        assert_eq!(aabb.min, point![16.0, -16.0, 0.0]);
        assert_eq!(aabb.max, point![32.0, 0.0, 16.0]);
    }

    #[test]
    fn publication_replaces_contents_atomically_for_readers() {
        let pos = ChunkPos::new([0, 0, 0]);
        let chunk = Chunk::new(pos, 16, ChunkContents::uniform(pos, 16, BlockKind::Exterior, 1));

        let held = chunk.contents();
        chunk.publish(Arc::new(ChunkContents::uniform(pos, 16, BlockKind::Interior, 2)));

        // the old snapshot is unchanged, new loads see the new generation
        assert_eq!(held.generation, 1);
        assert_eq!(held.block([0, 0, 0], 16), BlockKind::Exterior);
        assert_eq!(chunk.contents().generation, 2);
    }

    #[test]
    fn map_reports_unloaded_for_missing_chunks() {
        let map = ChunkMap::new(16);
        assert_eq!(map.voxel(point![5, 5, 5]), BlockKind::Unloaded);

        let pos = ChunkPos::new([0, 0, 0]);
        map.insert(
            pos,
            Arc::new(Chunk::new(
                pos,
                16,
                ChunkContents::uniform(pos, 16, BlockKind::Interior, 1),
            )),
        );
        assert_eq!(map.voxel(point![5, 5, 5]), BlockKind::Interior);
        assert_eq!(map.voxel(point![-1, 5, 5]), BlockKind::Unloaded);
    }
}
