//! Dual-contour meshing of one chunk from its sampled distance field.
//!
//! The pass structure follows the classic edge-based formulation: scan the
//! positive-axis grid edges for sign changes, place one vertex per cell from
//! the crossing tangent planes, then stitch a quad around every crossing
//! edge. Cells one step outside the chunk get provisional vertices so that
//! seam quads owned by this chunk can be emitted without waiting on
//! neighbors; the global field makes those provisional positions bitwise
//! identical to the ones the neighbor computes for itself.

use crate::{
    chunk::{BlockKind, TerrainIndex, TerrainVertex, INVALID_INDEX},
    sdf::SdfCache,
    Axis,
};
use nalgebra::{point, vector, Point3, Vector3};
use smallvec::SmallVec;

pub mod qef;

use self::qef::PlaneSet;

/// Samples that land exactly on the surface are nudged to the positive side
/// so that every edge has a well-defined crossing count.
const ZERO_NUDGE: f32 = 1.0e-4;

#[derive(Copy, Clone, Debug)]
struct EdgeCrossing {
    /// World position of the zero. Stored in world space, not chunk-local,
    /// so the arithmetic downstream is bit-identical no matter which chunk
    /// owns the edge; that is what keeps seams crack-free.
    position: Point3<f32>,
    normal: Vector3<f32>,
    material: u8,
}

/// Scratch table of edge crossings, indexed by the edge's base sample in
/// `[-1, side]³` and its axis. Owned by a job and reused across runs.
struct EdgeTable {
    dim: usize,
    entries: Vec<Option<EdgeCrossing>>,
}

impl EdgeTable {
    fn new(side: usize) -> Self {
        let dim = side + 2;
        Self {
            dim,
            entries: vec![None; dim * dim * dim * 3],
        }
    }

    fn index(&self, base: Point3<i32>, axis: Axis) -> usize {
        let x = (base.x + 1) as usize;
        let y = (base.y + 1) as usize;
        let z = (base.z + 1) as usize;
        debug_assert!(x < self.dim && y < self.dim && z < self.dim);
        ((x * self.dim + y) * self.dim + z) * 3 + axis as usize
    }

    fn get(&self, base: Point3<i32>, axis: Axis) -> Option<&EdgeCrossing> {
        self.entries[self.index(base, axis)].as_ref()
    }

    fn set(&mut self, base: Point3<i32>, axis: Axis, crossing: EdgeCrossing) {
        let index = self.index(base, axis);
        self.entries[index] = Some(crossing);
    }

    fn clear(&mut self) {
        self.entries.fill(None);
    }
}

/// Output buffers a meshing pass fills in. Owned by the job; the residency
/// integration step moves the vectors out into the published chunk contents.
#[derive(Default)]
pub struct MeshOutput {
    pub vertices: Vec<TerrainVertex>,
    pub indices: Vec<TerrainIndex>,
    pub blocks: Vec<BlockKind>,
    pub vertex_slots: Vec<TerrainIndex>,
}

/// Summary of one completed pass.
#[derive(Copy, Clone, Debug)]
pub struct MeshStats {
    pub vertex_count: usize,
    pub index_count: usize,
    /// When the whole chunk classified to a single kind (and produced no
    /// geometry), that kind. Lets residency remember chunks that need no
    /// mesh at all.
    pub uniform: Option<BlockKind>,
}

/// The per-chunk budgets were exceeded; the chunk publishes an empty mesh
/// instead.
#[derive(Copy, Clone, Debug)]
pub struct MeshOverflow;

pub struct Mesher {
    side: usize,
    qef_iter: u32,
    edges: EdgeTable,
    /// Provisional vertex id per cell in `[-1, side)³`.
    cells: Vec<TerrainIndex>,
}

impl Mesher {
    pub fn new(side: usize, qef_iter: u32) -> Self {
        let cell_dim = side + 1;
        Self {
            side,
            qef_iter,
            edges: EdgeTable::new(side),
            cells: vec![INVALID_INDEX; cell_dim * cell_dim * cell_dim],
        }
    }

    pub fn side(&self) -> usize {
        self.side
    }

    fn cell_index(&self, cell: Point3<i32>) -> usize {
        let dim = self.side + 1;
        let x = (cell.x + 1) as usize;
        let y = (cell.y + 1) as usize;
        let z = (cell.z + 1) as usize;
        debug_assert!(x < dim && y < dim && z < dim);
        (x * dim + y) * dim + z
    }

    fn block_index(&self, x: i32, y: i32, z: i32) -> usize {
        (x as usize * self.side + y as usize) * self.side + z as usize
    }

    /// Integer sample with the degenerate-zero nudge applied.
    fn sample(&self, cache: &SdfCache, p: Point3<i32>) -> f32 {
        let value = cache.value_i(p);
        if value == 0.0 {
            ZERO_NUDGE
        } else {
            value
        }
    }

    /// Runs the full pass. On overflow the output buffers are left cleared so
    /// the caller can publish an empty mesh.
    pub fn build(&mut self, cache: &SdfCache, out: &mut MeshOutput) -> Result<MeshStats, MeshOverflow> {
        assert_eq!(cache.side(), self.side, "cache built for a different chunk size");

        self.reset(out);

        self.scan_edges(cache);
        if let Err(overflow) = self.place_vertices(cache, out).and_then(|_| self.emit_quads(cache, out)) {
            self.reset(out);
            self.classify(cache, out);
            return Err(overflow);
        }

        let uniform = self.classify(cache, out);
        Ok(MeshStats {
            vertex_count: out.vertices.len(),
            index_count: out.indices.len(),
            uniform: if out.vertices.is_empty() { uniform } else { None },
        })
    }

    fn reset(&mut self, out: &mut MeshOutput) {
        let volume = self.side * self.side * self.side;
        self.edges.clear();
        self.cells.fill(INVALID_INDEX);
        out.vertices.clear();
        out.indices.clear();
        out.blocks.clear();
        out.blocks.resize(volume, BlockKind::Exterior);
        out.vertex_slots.clear();
        out.vertex_slots.resize(volume, INVALID_INDEX);
    }

    fn scan_edges(&mut self, cache: &SdfCache) {
        let side = self.side as i32;
        for x in -1..=side {
            for y in -1..=side {
                for z in -1..=side {
                    let base = point![x, y, z];
                    let fa = self.sample(cache, base);
                    Axis::enumerate(|axis| {
                        let tip = base + axis.unit();
                        let fb = self.sample(cache, tip);
                        if (fa < 0.0) != (fb < 0.0) {
                            let crossing = self.locate_crossing(cache, base, axis, fa, fb);
                            self.edges.set(base, axis, crossing);
                        }
                    });
                }
            }
        }
    }

    /// Bisects the interpolated field along the edge. Along an axis edge the
    /// trilinear field is linear, so the fixed iteration count converges
    /// fast; the count is configurable to trade cost against placement
    /// accuracy.
    fn locate_crossing(
        &self,
        cache: &SdfCache,
        base: Point3<i32>,
        axis: Axis,
        fa: f32,
        fb: f32,
    ) -> EdgeCrossing {
        let origin = point![base.x as f32, base.y as f32, base.z as f32];
        let unit = axis.unit();
        let dir = vector![unit.x as f32, unit.y as f32, unit.z as f32];

        let mut lo = 0.0f32;
        let mut hi = 1.0f32;
        let mut f_lo = fa;
        for _ in 0..self.qef_iter {
            let mid = (lo + hi) * 0.5;
            let f_mid = cache.value_f(origin + dir * mid);
            if (f_mid < 0.0) == (f_lo < 0.0) {
                lo = mid;
                f_lo = f_mid;
            } else {
                hi = mid;
            }
        }
        let t = (lo + hi) * 0.5;
        let local = origin + dir * t;

        let gradient = cache.derivative(local);
        let norm = gradient.norm();
        let normal = if norm > 0.0 {
            gradient / norm
        } else {
            dir * (fb - fa).signum()
        };

        EdgeCrossing {
            position: cache.origin() + local.coords,
            normal,
            material: cache.material_f(local),
        }
    }

    fn gather_cell_planes(&self, cell: Point3<i32>, planes: &mut PlaneSet) {
        planes.clear();
        Axis::enumerate(|axis| {
            let (u, v) = axis.others();
            for du in 0..2 {
                for dv in 0..2 {
                    let base = cell + u.unit() * du + v.unit() * dv;
                    if let Some(crossing) = self.edges.get(base, axis) {
                        planes.push((crossing.position, crossing.normal));
                    }
                }
            }
        });
    }

    fn gather_cell_materials(&self, cell: Point3<i32>) -> SmallVec<[u8; 12]> {
        let mut materials = SmallVec::new();
        Axis::enumerate(|axis| {
            let (u, v) = axis.others();
            for du in 0..2 {
                for dv in 0..2 {
                    let base = cell + u.unit() * du + v.unit() * dv;
                    if let Some(crossing) = self.edges.get(base, axis) {
                        materials.push(crossing.material);
                    }
                }
            }
        });
        materials
    }

    /// Majority vote over the crossing materials; ties go to the lowest id.
    fn vote_material(materials: &[u8]) -> u8 {
        let mut best = 0u8;
        let mut best_count = 0usize;
        for &candidate in materials {
            let count = materials.iter().filter(|&&m| m == candidate).count();
            if count > best_count || (count == best_count && candidate < best) {
                best = candidate;
                best_count = count;
            }
        }
        best
    }

    fn place_vertices(&mut self, cache: &SdfCache, out: &mut MeshOutput) -> Result<(), MeshOverflow> {
        let side = self.side as i32;
        let vertex_budget = usize::min(self.side.pow(3), INVALID_INDEX as usize);
        let mut planes = PlaneSet::new();

        for x in -1..side {
            for y in -1..side {
                for z in -1..side {
                    let cell = point![x, y, z];
                    self.gather_cell_planes(cell, &mut planes);
                    if planes.is_empty() {
                        continue;
                    }

                    if out.vertices.len() >= vertex_budget {
                        return Err(MeshOverflow);
                    }

                    let cell_min = cache.origin() + vector![x as f32, y as f32, z as f32];
                    let cell_max = cell_min + vector![1.0, 1.0, 1.0];
                    let world = qef::solve(&planes, cell_min, cell_max);

                    let mut normal = Vector3::zeros();
                    for (_, n) in planes.iter() {
                        normal += n;
                    }
                    let norm = normal.norm();
                    let normal = if norm > 0.0 {
                        normal / norm
                    } else {
                        vector![0.0, 0.0, 1.0]
                    };

                    let materials = self.gather_cell_materials(cell);
                    let winner = Self::vote_material(&materials);
                    let mut weights = [0u8; 4];
                    weights[usize::min(winner as usize, 3)] = 255;

                    let id = out.vertices.len() as TerrainIndex;
                    out.vertices.push(TerrainVertex {
                        position: [world.x, world.y, world.z],
                        normal: [normal.x, normal.y, normal.z],
                        materials: weights,
                        info: [planes.len() as u8, 0, 0, 0],
                    });
                    let index = self.cell_index(cell);
                    self.cells[index] = id;
                }
            }
        }
        Ok(())
    }

    fn emit_quads(&mut self, cache: &SdfCache, out: &mut MeshOutput) -> Result<(), MeshOverflow> {
        let side = self.side as i32;
        let index_budget = self.side.pow(3) * 6;

        for x in 0..side {
            for y in 0..side {
                for z in 0..side {
                    let base = point![x, y, z];
                    let mut overflowed = false;
                    Axis::enumerate(|axis| {
                        if overflowed || self.edges.get(base, axis).is_none() {
                            return;
                        }

                        let (u, v) = axis.others();
                        let cells = [
                            base,
                            base - u.unit(),
                            base - u.unit() - v.unit(),
                            base - v.unit(),
                        ];
                        let mut ids = [INVALID_INDEX; 4];
                        for (slot, cell) in ids.iter_mut().zip(cells.iter()) {
                            *slot = self.cells[self.cell_index(*cell)];
                        }
                        if ids.contains(&INVALID_INDEX) {
                            // a crossing edge always has four live cells; a miss
                            // here means an earlier overflow bailed out
                            return;
                        }

                        // walking the four cells around the edge is CCW seen
                        // from the positive axis end; flip when the surface
                        // faces the other way
                        let inside_at_base = self.sample(cache, base) < 0.0;
                        let quad = if inside_at_base {
                            [ids[0], ids[1], ids[2], ids[3]]
                        } else {
                            [ids[3], ids[2], ids[1], ids[0]]
                        };

                        if out.indices.len() + 6 > index_budget {
                            overflowed = true;
                            return;
                        }

                        let pos = |id: TerrainIndex| {
                            let p = out.vertices[id as usize].position;
                            vector![p[0], p[1], p[2]]
                        };
                        let diag_02 = (pos(quad[0]) - pos(quad[2])).norm_squared();
                        let diag_13 = (pos(quad[1]) - pos(quad[3])).norm_squared();
                        if diag_02 <= diag_13 {
                            out.indices
                                .extend_from_slice(&[quad[0], quad[1], quad[2], quad[0], quad[2], quad[3]]);
                        } else {
                            out.indices
                                .extend_from_slice(&[quad[1], quad[2], quad[3], quad[1], quad[3], quad[0]]);
                        }
                    });
                    if overflowed {
                        return Err(MeshOverflow);
                    }
                }
            }
        }
        Ok(())
    }

    /// Classifies every voxel of the chunk and fills the published vertex
    /// slot grid. Returns the single classification when the chunk is
    /// uniform.
    fn classify(&self, cache: &SdfCache, out: &mut MeshOutput) -> Option<BlockKind> {
        let side = self.side as i32;

        for x in 0..side {
            for y in 0..side {
                for z in 0..side {
                    let cell = point![x, y, z];
                    let block = self.block_index(x, y, z);
                    let slot = self.cells[self.cell_index(cell)];
                    if slot != INVALID_INDEX {
                        out.vertex_slots[block] = slot;
                        out.blocks[block] = BlockKind::Surface;
                        continue;
                    }

                    let mut all_negative = true;
                    let mut all_positive = true;
                    for corner in 0..8 {
                        let p = point![
                            x + (corner & 1),
                            y + ((corner >> 1) & 1),
                            z + ((corner >> 2) & 1)
                        ];
                        if self.sample(cache, p) < 0.0 {
                            all_positive = false;
                        } else {
                            all_negative = false;
                        }
                    }
                    out.blocks[block] = if all_negative {
                        BlockKind::Interior
                    } else if all_positive {
                        BlockKind::Exterior
                    } else {
                        BlockKind::Surface
                    };
                }
            }
        }

        // exterior voxels that touch the surface take part in collision
        // overlap tests
        for x in 0..side {
            for y in 0..side {
                for z in 0..side {
                    let block = self.block_index(x, y, z);
                    if out.blocks[block] != BlockKind::Exterior {
                        continue;
                    }
                    'neighbors: for dx in -1..=1 {
                        for dy in -1..=1 {
                            for dz in -1..=1 {
                                let (nx, ny, nz) = (x + dx, y + dy, z + dz);
                                if nx < 0 || ny < 0 || nz < 0 || nx >= side || ny >= side || nz >= side {
                                    continue;
                                }
                                if out.blocks[self.block_index(nx, ny, nz)] == BlockKind::Surface {
                                    out.blocks[block] = BlockKind::Blocking;
                                    break 'neighbors;
                                }
                            }
                        }
                    }
                }
            }
        }

        let first = out.blocks.first().copied()?;
        out.blocks.iter().all(|&kind| kind == first).then(|| first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::ChunkPos,
        sdf::{Composer, SdfCache},
    };
    use approx::assert_relative_eq;
    use nalgebra::Matrix4;

    fn build_chunk(composer: &Composer, pos: ChunkPos, side: usize) -> (MeshOutput, MeshStats) {
        let mut cache = SdfCache::new(side);
        cache.build(pos, &composer.snapshot(), 2.0);
        let mut mesher = Mesher::new(side, 8);
        let mut out = MeshOutput::default();
        let stats = mesher.build(&cache, &mut out).expect("mesh within budget");
        (out, stats)
    }

    fn box_composer(scale: f32) -> Composer {
        let mut composer = Composer::new();
        let id = composer.create_box();
        composer
            .set_transform(id, Matrix4::new_nonuniform_scaling(&vector![scale, scale, scale]))
            .unwrap();
        composer.update_pending();
        composer
    }

    #[test]
    fn box_surface_produces_geometry() {
        let composer = box_composer(6.0);
        let (out, stats) = build_chunk(&composer, ChunkPos::new([0, 0, 0]), 16);

        assert!(stats.vertex_count > 0);
        assert!(stats.index_count >= 6);
        assert_eq!(stats.index_count % 3, 0);
        assert!(stats.uniform.is_none());
        assert!(out.blocks.contains(&BlockKind::Surface));
        assert!(out.blocks.contains(&BlockKind::Interior));
    }

    #[test]
    fn indices_reference_the_chunks_own_vertices() {
        let composer = box_composer(6.0);
        let (out, _) = build_chunk(&composer, ChunkPos::new([0, 0, 0]), 16);
        assert!(out
            .indices
            .iter()
            .all(|&index| (index as usize) < out.vertices.len()));
    }

    #[test]
    fn normals_are_unit_length_and_point_outward() {
        let composer = box_composer(6.0);
        let (out, _) = build_chunk(&composer, ChunkPos::new([0, 0, 0]), 16);

        for vertex in &out.vertices {
            let n = vector![vertex.normal[0], vertex.normal[1], vertex.normal[2]];
            assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-3);

            // for a convex solid centered at the origin, normals face away
            // from the center
            let p = vector![vertex.position[0], vertex.position[1], vertex.position[2]];
            if p.norm() > 1.0 {
                assert!(n.dot(&p.normalize()) > 0.0, "normal {:?} at {:?}", n, p);
            }
        }
    }

    #[test]
    fn material_weights_always_sum_to_255() {
        let composer = box_composer(6.0);
        let (out, _) = build_chunk(&composer, ChunkPos::new([0, 0, 0]), 16);
        for vertex in &out.vertices {
            let total: u32 = vertex.materials.iter().map(|&w| w as u32).sum();
            assert_eq!(total, 255);
        }
    }

    #[test]
    fn empty_chunk_classifies_uniformly_exterior() {
        let composer = box_composer(2.0);
        let (out, stats) = build_chunk(&composer, ChunkPos::new([4, 4, 4]), 16);
        assert_eq!(stats.vertex_count, 0);
        assert_eq!(stats.uniform, Some(BlockKind::Exterior));
        assert!(out.vertices.is_empty() && out.indices.is_empty());
    }

    #[test]
    fn buried_chunk_classifies_uniformly_interior() {
        let composer = box_composer(100.0);
        let (_, stats) = build_chunk(&composer, ChunkPos::new([0, 0, 0]), 16);
        assert_eq!(stats.vertex_count, 0);
        assert_eq!(stats.uniform, Some(BlockKind::Interior));
    }

    #[test]
    fn surface_voxels_own_their_vertex_slots() {
        let composer = box_composer(6.0);
        let (out, _) = build_chunk(&composer, ChunkPos::new([0, 0, 0]), 16);
        for (index, &slot) in out.vertex_slots.iter().enumerate() {
            if slot != INVALID_INDEX {
                assert_eq!(out.blocks[index], BlockKind::Surface);
                assert!((slot as usize) < out.vertices.len());
            }
        }
    }

    #[test]
    fn blocking_shell_surrounds_the_surface() {
        let composer = box_composer(6.0);
        let (out, _) = build_chunk(&composer, ChunkPos::new([0, 0, 0]), 16);
        assert!(out.blocks.contains(&BlockKind::Blocking));
    }

    #[test]
    fn seam_vertices_match_across_adjacent_chunks() {
        // a box spanning the chunk boundary at x = 16
        let mut composer = Composer::new();
        let id = composer.create_box();
        composer
            .set_transform(
                id,
                Matrix4::new_translation(&vector![16.0, 8.0, 8.0])
                    * Matrix4::new_nonuniform_scaling(&vector![6.0, 4.0, 4.0]),
            )
            .unwrap();
        composer.update_pending();

        let (left, _) = build_chunk(&composer, ChunkPos::new([0, 0, 0]), 16);
        let (right, _) = build_chunk(&composer, ChunkPos::new([1, 0, 0]), 16);

        // the right chunk's border cells at local x = -1 are the left chunk's
        // interior cells at x = 15; their provisional vertices must match the
        // left chunk's own vertices bit for bit
        let right_border: Vec<_> = right
            .vertices
            .iter()
            .filter(|v| v.position[0] < 16.0)
            .collect();
        assert!(!right_border.is_empty());
        for vertex in &right_border {
            assert!(
                left.vertices.iter().any(|other| other.position == vertex.position),
                "unmatched seam vertex at {:?}",
                vertex.position
            );
        }
    }
}
