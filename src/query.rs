//! Read-only spatial queries over the live chunk set. Everything here works
//! off published chunk contents, so any thread may call these concurrently
//! with meshing; a job only ever writes its own buffers until the atomic
//! publication swap.

use crate::{
    chunk::{voxel_chunk_and_offset, BlockKind, Chunk, ChunkMap, ChunkPos, INVALID_INDEX},
    Axis,
};
use nalgebra::{point, vector, Point3, Vector3};
use smallvec::SmallVec;
use std::sync::Arc;

/// Push-out gives up after this many projection rounds.
const PUSH_OUT_ITERATIONS: usize = 8;
/// Refinement steps for sweep contact times.
const SWEEP_REFINE_ITERATIONS: usize = 8;

#[derive(Copy, Clone, Debug)]
pub struct Sphere {
    pub center: Point3<f32>,
    pub radius: f32,
}

#[derive(Copy, Clone, Debug)]
pub struct RaycastHit {
    pub distance: f32,
    pub position: Point3<f32>,
    pub normal: Vector3<f32>,
    pub voxel: Point3<i32>,
    pub kind: BlockKind,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct RaycastResult {
    pub hit: Option<RaycastHit>,
    pub touched_unloaded: bool,
}

#[derive(Copy, Clone, Debug)]
pub struct SweepHit {
    /// Distance traveled before first contact.
    pub distance: f32,
    /// Contact point on the surface.
    pub position: Point3<f32>,
    pub normal: Vector3<f32>,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct SweepResult {
    pub hit: Option<SweepHit>,
    pub touched_unloaded: bool,
}

#[derive(Copy, Clone, Debug)]
struct Triangle {
    a: Point3<f32>,
    b: Point3<f32>,
    c: Point3<f32>,
}

impl Triangle {
    fn normal(&self) -> Vector3<f32> {
        let n = (self.b - self.a).cross(&(self.c - self.a));
        let len = n.norm();
        if len > 0.0 {
            n / len
        } else {
            vector![0.0, 0.0, 1.0]
        }
    }
}

type TriangleSet = SmallVec<[Triangle; 24]>;

/// Double-sided Möller–Trumbore. Returns the distance along the unit ray.
fn ray_triangle(origin: Point3<f32>, dir: Vector3<f32>, tri: &Triangle) -> Option<f32> {
    let e1 = tri.b - tri.a;
    let e2 = tri.c - tri.a;
    let pvec = dir.cross(&e2);
    let det = e1.dot(&pvec);
    if det.abs() < 1e-8 {
        return None;
    }
    let inv_det = 1.0 / det;
    let tvec = origin - tri.a;
    let u = tvec.dot(&pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let qvec = tvec.cross(&e1);
    let v = dir.dot(&qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(&qvec) * inv_det;
    (t >= 0.0).then(|| t)
}

/// Closest point on a triangle to `p` (Ericson's region walk).
fn closest_point_on_triangle(p: Point3<f32>, tri: &Triangle) -> Point3<f32> {
    let ab = tri.b - tri.a;
    let ac = tri.c - tri.a;
    let ap = p - tri.a;

    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return tri.a;
    }

    let bp = p - tri.b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return tri.b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return tri.a + ab * v;
    }

    let cp = p - tri.c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return tri.c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return tri.a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return tri.b + (tri.c - tri.b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    tri.a + ab * v + ac * w
}

#[derive(Copy, Clone, Debug)]
enum RayStep {
    Continue,
    Exit,
    Hit,
}

fn f32_checked_div(num: f32, denom: f32) -> Option<f32> {
    if denom == 0.0 {
        None
    } else {
        Some(num / denom)
    }
}

/// 3D DDA over the voxel grid. `func` sees each voxel together with the
/// distance at which the ray entered it and the axis it crossed to get
/// there (`None` for the starting voxel). Stops past `max_distance`.
fn walk_voxels<F>(origin: Point3<f32>, dir: Vector3<f32>, max_distance: f32, mut func: F)
where
    F: FnMut(Point3<i32>, f32, Option<Axis>) -> RayStep,
{
    let mut current = point![
        origin.x.floor() as i32,
        origin.y.floor() as i32,
        origin.z.floor() as i32
    ];

    let step_x = dir.x.signum();
    let step_y = dir.y.signum();
    let step_z = dir.z.signum();

    let next_x = current.x as f32 + if step_x < 0.0 { 0.0 } else { 1.0 };
    let next_y = current.y as f32 + if step_y < 0.0 { 0.0 } else { 1.0 };
    let next_z = current.z as f32 + if step_z < 0.0 { 0.0 } else { 1.0 };

    // distance along the ray at which each axis leaves the current voxel; an
    // axis the ray never crosses compares as larger than everything
    let mut t_max_x = f32_checked_div(next_x - origin.x, dir.x).unwrap_or(f32::MAX);
    let mut t_max_y = f32_checked_div(next_y - origin.y, dir.y).unwrap_or(f32::MAX);
    let mut t_max_z = f32_checked_div(next_z - origin.z, dir.z).unwrap_or(f32::MAX);

    let t_delta_x = f32_checked_div(step_x, dir.x).unwrap_or(f32::MAX);
    let t_delta_y = f32_checked_div(step_y, dir.y).unwrap_or(f32::MAX);
    let t_delta_z = f32_checked_div(step_z, dir.z).unwrap_or(f32::MAX);

    let step_x = step_x as i32;
    let step_y = step_y as i32;
    let step_z = step_z as i32;

    let mut t = 0.0f32;
    let mut entered = None;
    loop {
        match func(current, t, entered) {
            RayStep::Continue => {}
            RayStep::Exit | RayStep::Hit => break,
        }

        if t_max_x < t_max_y && t_max_x < t_max_z {
            current.x += step_x;
            t = t_max_x;
            t_max_x += t_delta_x;
            entered = Some(Axis::X);
        } else if t_max_y < t_max_z {
            current.y += step_y;
            t = t_max_y;
            t_max_y += t_delta_y;
            entered = Some(Axis::Y);
        } else {
            current.z += step_z;
            t = t_max_z;
            t_max_z += t_delta_z;
            entered = Some(Axis::Z);
        }

        if t > max_distance {
            break;
        }
    }
}

/// Cheap cloneable read handle over the live chunk set. Queries never block
/// the residency owner and may run from any thread.
#[derive(Clone)]
pub struct TerrainReader {
    map: Arc<ChunkMap>,
}

impl TerrainReader {
    pub(crate) fn new(map: Arc<ChunkMap>) -> Self {
        Self { map }
    }

    pub fn chunk(&self, pos: ChunkPos) -> Option<Arc<Chunk>> {
        self.map.chunk(pos)
    }

    pub fn voxel(&self, voxel: Point3<i32>) -> BlockKind {
        self.map.voxel(voxel)
    }

    pub fn voxel_at(&self, position: Point3<f32>) -> BlockKind {
        self.map.voxel(point![
            position.x.floor() as i32,
            position.y.floor() as i32,
            position.z.floor() as i32
        ])
    }

    pub fn collides(&self, position: Point3<f32>) -> bool {
        self.voxel_at(position).collides()
    }

    /// The published vertex of the voxel at `cell`, if it owns one.
    fn cell_vertex(&self, cell: Point3<i32>) -> Option<Point3<f32>> {
        let side = self.map.side();
        let (chunk_pos, offset) = voxel_chunk_and_offset(cell, side);
        let chunk = self.map.chunk(chunk_pos)?;
        let contents = chunk.contents();
        let slot = contents.vertex_slot(offset, side);
        if slot == INVALID_INDEX {
            return None;
        }
        let p = contents.mesh.vertices[slot as usize].position;
        Some(point![p[0], p[1], p[2]])
    }

    /// Reconstructs the quads stitched around the voxel's vertex from the
    /// vertex and its adjacent voxels' vertices, triangulated the way the
    /// mesher does it.
    fn collect_triangles(&self, voxel: Point3<i32>, out: &mut TriangleSet) {
        let center = match self.cell_vertex(voxel) {
            Some(vertex) => vertex,
            None => return,
        };

        const PAIRS: [(Axis, Axis); 3] = [(Axis::X, Axis::Y), (Axis::Y, Axis::Z), (Axis::Z, Axis::X)];
        for &(a, b) in PAIRS.iter() {
            for sa in [-1i32, 1] {
                for sb in [-1i32, 1] {
                    let da = a.unit() * sa;
                    let db = b.unit() * sb;
                    let corners = [
                        center,
                        match self.cell_vertex(voxel + da) {
                            Some(v) => v,
                            None => continue,
                        },
                        match self.cell_vertex(voxel + da + db) {
                            Some(v) => v,
                            None => continue,
                        },
                        match self.cell_vertex(voxel + db) {
                            Some(v) => v,
                            None => continue,
                        },
                    ];

                    let diag_02 = (corners[0] - corners[2]).norm_squared();
                    let diag_13 = (corners[1] - corners[3]).norm_squared();
                    if diag_02 <= diag_13 {
                        out.push(Triangle { a: corners[0], b: corners[1], c: corners[2] });
                        out.push(Triangle { a: corners[0], b: corners[2], c: corners[3] });
                    } else {
                        out.push(Triangle { a: corners[1], b: corners[2], c: corners[3] });
                        out.push(Triangle { a: corners[1], b: corners[3], c: corners[0] });
                    }
                }
            }
        }
    }

    /// Voxel-classification raycast: cheap, conservative, no triangle tests.
    /// `min_steps` voxels at the start of the ray are exempt from collision
    /// so a caller embedded in the surface can still look out.
    pub fn voxel_raycast(
        &self,
        origin: Point3<f32>,
        ray: Vector3<f32>,
        min_steps: usize,
        allow_source_collision: bool,
    ) -> RaycastResult {
        let length = ray.norm();
        if length == 0.0 {
            return RaycastResult::default();
        }
        let dir = ray / length;

        let mut result = RaycastResult::default();
        let mut steps = 0usize;
        walk_voxels(origin, dir, length, |voxel, t, entered| {
            let kind = self.map.voxel(voxel);
            if kind == BlockKind::Unloaded {
                result.touched_unloaded = true;
                return RayStep::Exit;
            }

            let skip = steps < min_steps || (entered.is_none() && !allow_source_collision);
            steps += 1;
            if !skip && kind.collides() {
                let normal = match entered {
                    Some(axis) => {
                        let unit = axis.unit();
                        let sign = -dir[axis as usize].signum();
                        vector![unit.x as f32 * sign, unit.y as f32 * sign, unit.z as f32 * sign]
                    }
                    None => -dir,
                };
                result.hit = Some(RaycastHit {
                    distance: t,
                    position: origin + dir * t,
                    normal,
                    voxel,
                    kind,
                });
                return RayStep::Hit;
            }
            RayStep::Continue
        });
        result
    }

    /// Triangle-exact raycast. Walks voxels front to back and tests the
    /// published triangles around each surface voxel, keeping the nearest
    /// hit; the walk stops once every remaining voxel starts past the best
    /// hit found.
    pub fn raycast(&self, origin: Point3<f32>, ray: Vector3<f32>) -> RaycastResult {
        let length = ray.norm();
        if length == 0.0 {
            return RaycastResult::default();
        }
        let dir = ray / length;

        let mut result = RaycastResult::default();
        let mut best: Option<RaycastHit> = None;
        let mut triangles = TriangleSet::new();

        walk_voxels(origin, dir, length, |voxel, t, _| {
            if let Some(hit) = &best {
                if t > hit.distance {
                    return RayStep::Hit;
                }
            }

            let kind = self.map.voxel(voxel);
            match kind {
                BlockKind::Unloaded => {
                    result.touched_unloaded = true;
                    return RayStep::Exit;
                }
                BlockKind::Surface => {
                    triangles.clear();
                    self.collect_triangles(voxel, &mut triangles);
                    for tri in triangles.iter() {
                        if let Some(distance) = ray_triangle(origin, dir, tri) {
                            if distance <= length
                                && best.map_or(true, |hit| distance < hit.distance)
                            {
                                let mut normal = tri.normal();
                                if normal.dot(&dir) > 0.0 {
                                    normal = -normal;
                                }
                                best = Some(RaycastHit {
                                    distance,
                                    position: origin + dir * distance,
                                    normal,
                                    voxel,
                                    kind,
                                });
                            }
                        }
                    }
                    RayStep::Continue
                }
                _ => RayStep::Continue,
            }
        });

        result.hit = best;
        result
    }

    /// Every triangle around surface voxels whose box overlaps `center ±
    /// reach`. Returns whether an unloaded chunk was touched.
    fn surface_triangles_near(
        &self,
        center: Point3<f32>,
        reach: f32,
        out: &mut Vec<Triangle>,
    ) -> bool {
        let mut touched_unloaded = false;
        let lo = |v: f32| (v - reach).floor() as i32;
        let hi = |v: f32| (v + reach).floor() as i32;

        let mut scratch = TriangleSet::new();
        for x in lo(center.x)..=hi(center.x) {
            for y in lo(center.y)..=hi(center.y) {
                for z in lo(center.z)..=hi(center.z) {
                    let voxel = point![x, y, z];
                    match self.map.voxel(voxel) {
                        BlockKind::Unloaded => touched_unloaded = true,
                        BlockKind::Surface => {
                            scratch.clear();
                            self.collect_triangles(voxel, &mut scratch);
                            out.extend_from_slice(&scratch);
                        }
                        _ => {}
                    }
                }
            }
        }
        touched_unloaded
    }

    /// Sweeps a sphere along `ray`, reporting the earliest contact. The
    /// sweep advances conservatively (half a radius per step over voxels
    /// expanded by the radius) and refines the contact time by bisection.
    pub fn sweep_sphere(&self, sphere: Sphere, ray: Vector3<f32>) -> SweepResult {
        let length = ray.norm();
        if length == 0.0 {
            return self.sweep_sample(sphere.center, sphere.radius, 0.0);
        }
        let dir = ray / length;
        let step = (sphere.radius * 0.5).max(0.1);

        let mut previous_t = 0.0f32;
        let mut t = 0.0f32;
        loop {
            let probe = self.sweep_sample(sphere.center + dir * t, sphere.radius, t);
            if probe.touched_unloaded {
                return probe;
            }
            if probe.hit.is_some() {
                if t == 0.0 {
                    return probe;
                }
                return self.refine_sweep(sphere, dir, previous_t, t);
            }

            if t >= length {
                return SweepResult::default();
            }
            previous_t = t;
            t = (t + step).min(length);
        }
    }

    /// Overlap test at one sweep position.
    fn sweep_sample(&self, center: Point3<f32>, radius: f32, distance: f32) -> SweepResult {
        let mut triangles = Vec::new();
        let touched_unloaded = self.surface_triangles_near(center, radius + 1.0, &mut triangles);
        if touched_unloaded {
            return SweepResult {
                hit: None,
                touched_unloaded: true,
            };
        }

        // deepest penetration wins
        let mut best: Option<SweepHit> = None;
        let mut best_dist = f32::INFINITY;
        for tri in &triangles {
            let closest = closest_point_on_triangle(center, tri);
            let offset = center - closest;
            let dist = offset.norm();
            if dist < radius && dist < best_dist {
                let normal = if dist > 1e-6 { offset / dist } else { tri.normal() };
                best_dist = dist;
                best = Some(SweepHit {
                    distance,
                    position: closest,
                    normal,
                });
            }
        }
        SweepResult {
            hit: best,
            touched_unloaded: false,
        }
    }

    fn refine_sweep(&self, sphere: Sphere, dir: Vector3<f32>, mut lo: f32, mut hi: f32) -> SweepResult {
        for _ in 0..SWEEP_REFINE_ITERATIONS {
            let mid = (lo + hi) * 0.5;
            let probe = self.sweep_sample(sphere.center + dir * mid, sphere.radius, mid);
            if probe.hit.is_some() {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        self.sweep_sample(sphere.center + dir * hi, sphere.radius, hi)
    }

    /// Iteratively projects the sphere out of every overlapping surface
    /// triangle. Returns the applied offset, or `None` when there was no
    /// overlap to resolve.
    pub fn push_out_sphere(&self, sphere: Sphere) -> Option<Vector3<f32>> {
        let mut center = sphere.center;
        let mut moved = false;

        for _ in 0..PUSH_OUT_ITERATIONS {
            let mut triangles = Vec::new();
            self.surface_triangles_near(center, sphere.radius + 1.0, &mut triangles);

            // deepest overlap first
            let mut deepest: Option<(f32, Point3<f32>, Vector3<f32>)> = None;
            for tri in &triangles {
                let closest = closest_point_on_triangle(center, tri);
                let offset = center - closest;
                let dist = offset.norm();
                if dist < sphere.radius && deepest.map_or(true, |(d, _, _)| dist < d) {
                    let away = if dist > 1e-6 { offset / dist } else { tri.normal() };
                    deepest = Some((dist, closest, away));
                }
            }

            match deepest {
                Some((dist, _, away)) => {
                    center += away * (sphere.radius - dist + 1e-3);
                    moved = true;
                }
                None => break,
            }
        }

        moved.then(|| center - sphere.center)
    }
}
