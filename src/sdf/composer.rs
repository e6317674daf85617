//! The ordered shape stack. Mutations are staged and merged at a safe point;
//! evaluation happens through immutable snapshots so meshing jobs never race
//! with edits.

use super::{
    op_smooth_subtraction, op_smooth_union, op_subtraction, op_union, CsgOp, Shape, ShapeKind,
};
use crate::{aabb::Aabb, TerrainError};
use nalgebra::{vector, Matrix4, Point3, Vector3};
use std::{collections::HashSet, sync::Arc};

/// Step used for the central-difference derivative of the composed field.
const DERIVATIVE_STEP: f32 = 0.05;

/// Stable handle to a shape owned by a [`Composer`]. Stays valid until the
/// shape is destroyed and its destruction is merged.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ShapeId(u64);

/// Evaluates the stack in insertion order, folding each shape into the
/// accumulated distance according to its operator, and tracking the material
/// whose contribution dominates (smallest `|d|` among union/material shapes
/// whose box contains the point).
pub(crate) fn evaluate_shapes<'a, I>(shapes: I, p: Point3<f32>) -> (f32, u8)
where
    I: IntoIterator<Item = &'a Shape>,
{
    // f32::MAX rather than infinity: absent-shape samples flow through the
    // cache's interpolation, and infinities would turn into NaN there
    let mut distance = f32::MAX;
    let mut material = 0u8;
    let mut dominant = f32::INFINITY;

    for shape in shapes {
        let value = shape.value(p);
        match shape.op {
            CsgOp::Union => distance = op_union(distance, value),
            CsgOp::Subtraction => distance = op_subtraction(distance, value),
            CsgOp::SmoothUnion => distance = op_smooth_union(distance, value, shape.smoothing),
            CsgOp::SmoothSubtraction => {
                distance = op_smooth_subtraction(distance, value, shape.smoothing)
            }
            CsgOp::Material => {}
        }

        if matches!(shape.op, CsgOp::Union | CsgOp::Material)
            && shape.aabb().contains(&p)
            && value.abs() < dominant
        {
            dominant = value.abs();
            material = shape.material_id;
        }
    }

    (distance, material)
}

/// Immutable value copy of the merged shape list, taken at job dispatch.
/// Shapes are small and few, so the copy is cheap, and holding the `Arc`
/// keeps destroyed shapes alive until the last job referencing them retires.
#[derive(Clone)]
pub struct ComposerSnapshot {
    shapes: Arc<[Shape]>,
}

impl ComposerSnapshot {
    pub(crate) fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    /// Composed signed distance at `p`. Pure; bitwise identical for the same
    /// snapshot no matter the calling thread.
    pub fn value(&self, p: Point3<f32>) -> f32 {
        evaluate_shapes(self.shapes.iter(), p).0
    }

    /// Dominant material at `p`.
    pub fn material(&self, p: Point3<f32>) -> u8 {
        evaluate_shapes(self.shapes.iter(), p).1
    }

    /// Unit surface normal estimate at `p`, from central differences of the
    /// composed field.
    pub fn derivative(&self, p: Point3<f32>) -> Vector3<f32> {
        let e = DERIVATIVE_STEP;
        let gradient = vector![
            self.value(p + vector![e, 0.0, 0.0]) - self.value(p - vector![e, 0.0, 0.0]),
            self.value(p + vector![0.0, e, 0.0]) - self.value(p - vector![0.0, e, 0.0]),
            self.value(p + vector![0.0, 0.0, e]) - self.value(p - vector![0.0, 0.0, e])
        ];
        let norm = gradient.norm();
        if norm > 0.0 {
            gradient / norm
        } else {
            vector![0.0, 0.0, 1.0]
        }
    }
}

/// Owns the ordered list of shapes and the staging buffers that absorb
/// mutations between frames. All mutation happens on the main thread; worker
/// threads only ever see [`ComposerSnapshot`]s.
#[derive(Default)]
pub struct Composer {
    shapes: Vec<(ShapeId, Shape)>,
    pending_created: Vec<(ShapeId, Shape)>,
    pending_destroy: Vec<ShapeId>,
    invalidations: Vec<Aabb>,
    next_id: u64,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, kind: ShapeKind) -> ShapeId {
        let id = ShapeId(self.next_id);
        self.next_id += 1;
        self.pending_created.push((id, Shape::new(kind)));
        id
    }

    pub fn create_box(&mut self) -> ShapeId {
        self.create(ShapeKind::Box { corner_radius: 0.0 })
    }

    pub fn create_cylinder(&mut self) -> ShapeId {
        self.create(ShapeKind::Cylinder { top: 1.0, bottom: 1.0 })
    }

    pub fn create_heightmap(&mut self, map: Arc<super::Heightfield>) -> ShapeId {
        self.create(ShapeKind::Heightmap { map })
    }

    /// Stages the shape for destruction. A shape that was created but never
    /// merged just disappears.
    pub fn destroy(&mut self, id: ShapeId) {
        if let Some(index) = self.pending_created.iter().position(|(i, _)| *i == id) {
            self.pending_created.swap_remove(index);
            return;
        }
        if !self.pending_destroy.contains(&id) {
            self.pending_destroy.push(id);
        }
    }

    pub fn shape(&self, id: ShapeId) -> Option<&Shape> {
        self.shapes
            .iter()
            .chain(self.pending_created.iter())
            .find(|(i, _)| *i == id)
            .map(|(_, shape)| shape)
    }

    fn shape_mut(&mut self, id: ShapeId) -> Result<&mut Shape, TerrainError> {
        self.shapes
            .iter_mut()
            .chain(self.pending_created.iter_mut())
            .find(|(i, _)| *i == id)
            .map(|(_, shape)| shape)
            .ok_or(TerrainError::UnknownShape)
    }

    /// All live shapes (merged and still-staged), in evaluation order.
    pub fn shapes(&self) -> impl Iterator<Item = (ShapeId, &Shape)> {
        self.shapes
            .iter()
            .chain(self.pending_created.iter())
            .map(|(id, shape)| (*id, shape))
    }

    pub fn set_transform(&mut self, id: ShapeId, transform: Matrix4<f32>) -> Result<(), TerrainError> {
        self.shape_mut(id)?.set_transform(transform)
    }

    /// Latches the dirty flag. Required after mutating a shape through a
    /// setter that does not itself invalidate (operator, material, smoothing,
    /// variant fields); `set_transform` latches on its own.
    pub fn mark_dirty(&mut self, id: ShapeId) -> Result<(), TerrainError> {
        self.shape_mut(id)?.dirty = true;
        Ok(())
    }

    pub fn set_op(&mut self, id: ShapeId, op: CsgOp) -> Result<(), TerrainError> {
        self.shape_mut(id)?.op = op;
        Ok(())
    }

    pub fn set_material(&mut self, id: ShapeId, material: u8) -> Result<(), TerrainError> {
        self.shape_mut(id)?.material_id = material;
        Ok(())
    }

    pub fn set_smoothing(&mut self, id: ShapeId, smoothing: f32) -> Result<(), TerrainError> {
        if !smoothing.is_finite() || smoothing < 0.0 {
            return Err(TerrainError::NegativeSmoothing(smoothing));
        }
        self.shape_mut(id)?.smoothing = smoothing;
        Ok(())
    }

    pub fn set_corner_radius(&mut self, id: ShapeId, radius: f32) -> Result<(), TerrainError> {
        let shape = self.shape_mut(id)?;
        let limit = shape.half_size().x.min(shape.half_size().y).min(shape.half_size().z);
        if !radius.is_finite() || radius < 0.0 || radius > limit {
            return Err(TerrainError::CornerRadiusTooLarge { radius, limit });
        }
        match &mut shape.kind {
            ShapeKind::Box { corner_radius } => {
                *corner_radius = radius;
                Ok(())
            }
            _ => Err(TerrainError::WrongShapeVariant { expected: "box" }),
        }
    }

    pub fn set_caps(&mut self, id: ShapeId, top: f32, bottom: f32) -> Result<(), TerrainError> {
        if !(0.0..=1.0).contains(&top) {
            return Err(TerrainError::CapOutOfRange(top));
        }
        if !(0.0..=1.0).contains(&bottom) {
            return Err(TerrainError::CapOutOfRange(bottom));
        }
        let shape = self.shape_mut(id)?;
        match &mut shape.kind {
            ShapeKind::Cylinder { top: t, bottom: b } => {
                *t = top;
                *b = bottom;
                Ok(())
            }
            _ => Err(TerrainError::WrongShapeVariant { expected: "cylinder" }),
        }
    }

    /// Whether any staged creations or destructions are waiting for the next
    /// safe point.
    pub fn has_pending(&self) -> bool {
        !self.pending_created.is_empty() || !self.pending_destroy.is_empty()
    }

    /// Whether any shape's dirty flag is latched or invalidation regions are
    /// waiting to be drained.
    pub fn has_dirty(&self) -> bool {
        !self.invalidations.is_empty()
            || self
                .shapes
                .iter()
                .chain(self.pending_created.iter())
                .any(|(_, shape)| shape.dirty)
    }

    /// A smooth operator bends the field up to `smoothing` away from the
    /// shape's box, so its invalidation region is wider than the box itself.
    fn invalidation_region(shape: &Shape, region: Aabb) -> Aabb {
        match shape.op {
            CsgOp::SmoothUnion | CsgOp::SmoothSubtraction => region.inflate(shape.smoothing),
            _ => region,
        }
    }

    /// Merges staged mutations and records invalidation regions for every
    /// created, destroyed, or dirty shape. Must only be called when no
    /// meshing job is in flight; the caller (the residency tick) guarantees
    /// that.
    pub fn update_pending(&mut self) {
        for (id, mut shape) in self.pending_created.drain(..) {
            self.invalidations
                .push(Self::invalidation_region(&shape, shape.aabb()));
            shape.dirty = false;
            shape.aabb_prev = shape.aabb();
            self.shapes.push((id, shape));
        }

        if !self.pending_destroy.is_empty() {
            let destroy: HashSet<ShapeId> = self.pending_destroy.drain(..).collect();
            let invalidations = &mut self.invalidations;
            self.shapes.retain(|(id, shape)| {
                if destroy.contains(id) {
                    invalidations.push(Self::invalidation_region(
                        shape,
                        shape.aabb_prev.union(&shape.aabb()),
                    ));
                    false
                } else {
                    true
                }
            });
        }

        for (_, shape) in self.shapes.iter_mut() {
            if shape.dirty {
                let region =
                    Self::invalidation_region(shape, shape.aabb_prev.union(&shape.aabb()));
                self.invalidations.push(region);
                shape.aabb_prev = shape.aabb();
                shape.dirty = false;
            }
        }
    }

    /// Returns and clears the invalidation regions accumulated since the last
    /// drain. Draining twice with no intervening mutation yields nothing the
    /// second time.
    pub fn drain_invalidations(&mut self) -> Vec<Aabb> {
        std::mem::take(&mut self.invalidations)
    }

    pub fn snapshot(&self) -> ComposerSnapshot {
        let shapes: Vec<Shape> = self.shapes.iter().map(|(_, shape)| shape.clone()).collect();
        ComposerSnapshot {
            shapes: shapes.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::point;

    fn scaled(s: f32) -> Matrix4<f32> {
        Matrix4::new_nonuniform_scaling(&vector![s, s, s])
    }

    fn translated(x: f32, y: f32, z: f32) -> Matrix4<f32> {
        Matrix4::new_translation(&vector![x, y, z])
    }

    #[test]
    fn creation_is_staged_until_merge() {
        let mut composer = Composer::new();
        let id = composer.create_box();
        assert!(composer.has_pending());
        assert!(composer.snapshot().value(point![0.0, 0.0, 0.0]) > 0.0);

        composer.update_pending();
        assert!(!composer.has_pending());
        assert!(composer.snapshot().value(point![0.0, 0.0, 0.0]) < 0.0);
        assert!(composer.shape(id).is_some());
    }

    #[test]
    fn drain_is_idempotent() {
        let mut composer = Composer::new();
        composer.create_box();
        composer.update_pending();
        assert_eq!(composer.drain_invalidations().len(), 1);
        assert!(composer.drain_invalidations().is_empty());
    }

    #[test]
    fn repeated_set_transform_yields_one_invalidation() {
        let mut composer = Composer::new();
        let id = composer.create_box();
        composer.update_pending();
        composer.drain_invalidations();

        let transform = translated(4.0, 0.0, 0.0);
        composer.set_transform(id, transform).unwrap();
        composer.set_transform(id, transform).unwrap();
        composer.update_pending();
        assert_eq!(composer.drain_invalidations().len(), 1);
    }

    #[test]
    fn moved_shape_invalidates_both_old_and_new_region() {
        let mut composer = Composer::new();
        let id = composer.create_box();
        composer.update_pending();
        composer.drain_invalidations();

        composer.set_transform(id, translated(10.0, 0.0, 0.0)).unwrap();
        composer.update_pending();
        let regions = composer.drain_invalidations();
        assert_eq!(regions.len(), 1);
        assert!(regions[0].contains(&point![0.0, 0.0, 0.0]));
        assert!(regions[0].contains(&point![10.0, 0.0, 0.0]));
    }

    #[test]
    fn destroyed_shape_invalidates_last_clean_region() {
        let mut composer = Composer::new();
        let id = composer.create_box();
        composer.update_pending();
        composer.drain_invalidations();

        composer.destroy(id);
        composer.update_pending();
        let regions = composer.drain_invalidations();
        assert_eq!(regions.len(), 1);
        assert!(regions[0].contains(&point![0.0, 0.0, 0.0]));
        assert!(composer.shape(id).is_none());
    }

    #[test]
    fn unmerged_creation_cancelled_by_destroy() {
        let mut composer = Composer::new();
        let id = composer.create_box();
        composer.destroy(id);
        composer.update_pending();
        assert!(composer.drain_invalidations().is_empty());
    }

    #[test]
    fn subtraction_carves_union() {
        let mut composer = Composer::new();
        let base = composer.create_box();
        composer.set_transform(base, scaled(4.0)).unwrap();
        let hole = composer.create_box();
        composer.set_op(hole, CsgOp::Subtraction).unwrap();
        composer.update_pending();

        let snapshot = composer.snapshot();
        // carved out at the origin, solid off to the side
        assert!(snapshot.value(point![0.0, 0.0, 0.0]) > 0.0);
        assert!(snapshot.value(point![2.5, 0.0, 0.0]) < 0.0);
    }

    #[test]
    fn material_shape_wins_inside_its_box_without_moving_surface() {
        let mut composer = Composer::new();
        let base = composer.create_box();
        composer.set_transform(base, scaled(4.0)).unwrap();
        let marker = composer.create_box();
        composer.set_op(marker, CsgOp::Material).unwrap();
        composer.set_material(marker, 3).unwrap();
        composer.update_pending();
        let with_marker = composer.snapshot();

        composer.destroy(marker);
        composer.update_pending();
        let without_marker = composer.snapshot();

        let p = point![0.5, 0.0, 0.0];
        assert_relative_eq!(with_marker.value(p), without_marker.value(p));
        assert_eq!(with_marker.material(p), 3);
        assert_eq!(without_marker.material(p), 0);
    }

    #[test]
    fn snapshot_is_isolated_from_later_edits() {
        let mut composer = Composer::new();
        let id = composer.create_box();
        composer.update_pending();
        let before = composer.snapshot();

        composer.set_transform(id, translated(100.0, 0.0, 0.0)).unwrap();
        assert!(before.value(point![0.0, 0.0, 0.0]) < 0.0);
        assert_relative_eq!(
            before.value(point![0.0, 0.0, 0.0]),
            composer.snapshot().value(point![100.0, 0.0, 0.0])
        );
    }

    #[test]
    fn derivative_points_out_of_the_surface() {
        let mut composer = Composer::new();
        composer.create_box();
        composer.update_pending();
        let snapshot = composer.snapshot();
        let normal = snapshot.derivative(point![1.0, 0.0, 0.0]);
        assert!(normal.x > 0.9);
    }
}
