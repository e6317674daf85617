//! Dense per-chunk sampling of the composed field. Built once at the start
//! of a meshing job and read-only afterwards, so the job sees one coherent
//! field no matter what happens to the composer meanwhile.

use super::{composer::evaluate_shapes, ComposerSnapshot, CsgOp, Shape};
use crate::chunk::{chunk_aabb, ChunkPos};
use nalgebra::{point, vector, Point3, Vector3};

/// Halo on the negative side of the chunk. Together with the 3-sample halo on
/// the positive side (`side + 5` samples per axis) this keeps central
/// differences and edge-crossing searches inside the grid.
pub const CACHE_OFFSET: i32 = 2;

pub struct SdfCache {
    side: usize,
    dim: usize,
    origin: Point3<f32>,
    values: Box<[f32]>,
    materials: Box<[u8]>,
}

impl SdfCache {
    pub fn new(side: usize) -> Self {
        let dim = side + 5;
        Self {
            side,
            dim,
            origin: point![0.0, 0.0, 0.0],
            values: vec![0.0; dim * dim * dim].into_boxed_slice(),
            materials: vec![0; dim * dim * dim].into_boxed_slice(),
        }
    }

    pub fn side(&self) -> usize {
        self.side
    }

    /// World position of the chunk corner, i.e. of local sample `(0, 0, 0)`.
    pub fn origin(&self) -> Point3<f32> {
        self.origin
    }

    fn index(&self, p: Point3<i32>) -> usize {
        let x = p.x + CACHE_OFFSET;
        let y = p.y + CACHE_OFFSET;
        let z = p.z + CACHE_OFFSET;
        debug_assert!(
            (0..self.dim as i32).contains(&x)
                && (0..self.dim as i32).contains(&y)
                && (0..self.dim as i32).contains(&z),
            "cache sample out of bounds: {:?}",
            p
        );
        (x as usize * self.dim + y as usize) * self.dim + z as usize
    }

    /// Samples the composed field over the whole halo'd grid. Union and
    /// material shapes whose box misses the sampled region (expanded by
    /// `boundary` voxels) are skipped entirely; a union contributes nothing
    /// where it is absent, while subtractive and smooth shapes always
    /// participate because their absence cannot be assumed.
    pub fn build(&mut self, pos: ChunkPos, snapshot: &ComposerSnapshot, boundary: f32) {
        self.origin = pos.origin(self.side);

        let sampled = chunk_aabb(pos, self.side)
            .inflate(CACHE_OFFSET as f32 + 1.0)
            .inflate(boundary);
        let relevant: Vec<&Shape> = snapshot
            .shapes()
            .iter()
            .filter(|shape| match shape.op() {
                CsgOp::Union | CsgOp::Material => shape.aabb().intersects(&sampled),
                CsgOp::Subtraction | CsgOp::SmoothUnion | CsgOp::SmoothSubtraction => true,
            })
            .collect();

        for x in 0..self.dim as i32 {
            for y in 0..self.dim as i32 {
                for z in 0..self.dim as i32 {
                    let local = point![x - CACHE_OFFSET, y - CACHE_OFFSET, z - CACHE_OFFSET];
                    let world = self.origin + vector![local.x as f32, local.y as f32, local.z as f32];
                    let (value, material) = evaluate_shapes(relevant.iter().copied(), world);
                    let index = self.index(local);
                    self.values[index] = value;
                    self.materials[index] = material;
                }
            }
        }
    }

    /// Distance at an integer sample, in chunk-local voxel coordinates.
    pub fn value_i(&self, p: Point3<i32>) -> f32 {
        self.values[self.index(p)]
    }

    /// Trilinear interpolation over the eight surrounding samples. Reads are
    /// clamped to the halo so a query right on the positive border stays in
    /// bounds.
    pub fn value_f(&self, p: Point3<f32>) -> f32 {
        let max_base = (self.side as i32) + CACHE_OFFSET - 1;
        let bx = (p.x.floor() as i32).clamp(-CACHE_OFFSET, max_base);
        let by = (p.y.floor() as i32).clamp(-CACHE_OFFSET, max_base);
        let bz = (p.z.floor() as i32).clamp(-CACHE_OFFSET, max_base);
        let fx = (p.x - bx as f32).clamp(0.0, 1.0);
        let fy = (p.y - by as f32).clamp(0.0, 1.0);
        let fz = (p.z - bz as f32).clamp(0.0, 1.0);

        let v = |dx: i32, dy: i32, dz: i32| self.value_i(point![bx + dx, by + dy, bz + dz]);

        let lerp = crate::util::lerp;
        let z00 = lerp(v(0, 0, 0), v(0, 0, 1), fz);
        let z01 = lerp(v(0, 1, 0), v(0, 1, 1), fz);
        let z10 = lerp(v(1, 0, 0), v(1, 0, 1), fz);
        let z11 = lerp(v(1, 1, 0), v(1, 1, 1), fz);
        let y0 = lerp(z00, z01, fy);
        let y1 = lerp(z10, z11, fy);
        lerp(y0, y1, fx)
    }

    /// Central-difference gradient with a one-voxel step.
    pub fn derivative(&self, p: Point3<f32>) -> Vector3<f32> {
        vector![
            (self.value_f(p + vector![1.0, 0.0, 0.0]) - self.value_f(p - vector![1.0, 0.0, 0.0])) * 0.5,
            (self.value_f(p + vector![0.0, 1.0, 0.0]) - self.value_f(p - vector![0.0, 1.0, 0.0])) * 0.5,
            (self.value_f(p + vector![0.0, 0.0, 1.0]) - self.value_f(p - vector![0.0, 0.0, 1.0])) * 0.5
        ]
    }

    /// Material of the sample nearest to `p`.
    pub fn material_f(&self, p: Point3<f32>) -> u8 {
        let max_sample = (self.side as i32) + CACHE_OFFSET;
        let nearest = point![
            (p.x.round() as i32).clamp(-CACHE_OFFSET, max_sample),
            (p.y.round() as i32).clamp(-CACHE_OFFSET, max_sample),
            (p.z.round() as i32).clamp(-CACHE_OFFSET, max_sample)
        ];
        self.materials[self.index(nearest)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdf::Composer;
    use approx::assert_relative_eq;
    use nalgebra::Matrix4;

    fn box_snapshot(scale: f32) -> ComposerSnapshot {
        let mut composer = Composer::new();
        let id = composer.create_box();
        composer
            .set_transform(id, Matrix4::new_nonuniform_scaling(&vector![scale, scale, scale]))
            .unwrap();
        composer.update_pending();
        composer.snapshot()
    }

    #[test]
    fn integer_samples_match_the_composed_field() {
        let snapshot = box_snapshot(6.0);
        let mut cache = SdfCache::new(16);
        cache.build(ChunkPos::new([0, 0, 0]), &snapshot, 2.0);

        for &p in &[point![0, 0, 0], point![-2, -2, -2], point![18, 5, 0], point![4, 4, 4]] {
            let world = point![p.x as f32, p.y as f32, p.z as f32];
            assert_eq!(cache.value_i(p), snapshot.value(world));
        }
    }

    #[test]
    fn interpolation_is_linear_along_an_edge() {
        let snapshot = box_snapshot(6.0);
        let mut cache = SdfCache::new(16);
        cache.build(ChunkPos::new([0, 0, 0]), &snapshot, 2.0);

        let a = cache.value_i(point![8, 0, 0]);
        let b = cache.value_i(point![9, 0, 0]);
        assert_relative_eq!(cache.value_f(point![8.25, 0.0, 0.0]), a + (b - a) * 0.25);
    }

    #[test]
    fn rebuilds_are_bitwise_identical() {
        let snapshot = box_snapshot(6.0);
        let mut first = SdfCache::new(16);
        let mut second = SdfCache::new(16);
        first.build(ChunkPos::new([0, 0, 0]), &snapshot, 2.0);
        second.build(ChunkPos::new([0, 0, 0]), &snapshot, 2.0);
        assert!(first
            .values
            .iter()
            .zip(second.values.iter())
            .all(|(a, b)| a.to_bits() == b.to_bits()));
    }

    #[test]
    fn derivative_points_away_from_a_box_face() {
        let snapshot = box_snapshot(6.0);
        let mut cache = SdfCache::new(16);
        cache.build(ChunkPos::new([0, 0, 0]), &snapshot, 2.0);

        let gradient = cache.derivative(point![8.0, 0.0, 0.0]).normalize();
        assert!(gradient.x > 0.9);
    }

    #[test]
    fn cache_is_a_pure_value_after_build() {
        let mut composer = Composer::new();
        let id = composer.create_box();
        composer
            .set_transform(id, Matrix4::new_nonuniform_scaling(&vector![6.0, 6.0, 6.0]))
            .unwrap();
        composer.update_pending();

        let mut cache = SdfCache::new(16);
        cache.build(ChunkPos::new([0, 0, 0]), &composer.snapshot(), 2.0);
        let before = cache.value_i(point![0, 0, 0]);

        // mutating the composer afterwards must not be observable
        composer
            .set_transform(id, Matrix4::new_translation(&vector![100.0, 0.0, 0.0]))
            .unwrap();
        composer.update_pending();
        assert_eq!(cache.value_i(point![0, 0, 0]), before);
    }
}
