//! Least-squares placement of a cell vertex from the tangent planes of its
//! edge crossings.

use nalgebra::{Matrix3, Point3, Vector3};
use smallvec::SmallVec;

/// One tangent-plane constraint: a point on the surface and the unit normal
/// there.
pub type Plane = (Point3<f32>, Vector3<f32>);

/// A cell has at most twelve crossing edges.
pub type PlaneSet = SmallVec<[Plane; 12]>;

/// Above this ratio of extreme eigenvalues the normal equations are treated
/// as ill-conditioned and the mass point is used instead.
const MAX_CONDITION: f32 = 1.0e3;

/// Minimizes `Σ (nᵢ · (x - pᵢ))²` over the cell box. The system is solved
/// about the mass point of the crossings; eigendirections whose eigenvalue
/// falls below the condition threshold are dropped from the inverse, which
/// reverts exactly those directions to the mass point. A fully degenerate
/// system therefore falls back to the mean of the crossing positions.
pub fn solve(planes: &[Plane], cell_min: Point3<f32>, cell_max: Point3<f32>) -> Point3<f32> {
    debug_assert!(!planes.is_empty());

    let mut mass = Vector3::zeros();
    for (p, _) in planes {
        mass += p.coords;
    }
    mass /= planes.len() as f32;
    let mass = Point3::from(mass);

    let mut ata = Matrix3::zeros();
    let mut atb = Vector3::zeros();
    for (p, n) in planes {
        ata += n * n.transpose();
        atb += n * n.dot(&(p - mass));
    }

    let solution = solve_normal_equations(ata, &atb)
        .map(|offset| mass + offset)
        .unwrap_or(mass);

    clamp_to_cell(solution, cell_min, cell_max)
}

fn solve_normal_equations(ata: Matrix3<f32>, atb: &Vector3<f32>) -> Option<Vector3<f32>> {
    let eigen = nalgebra::SymmetricEigen::new(ata);
    let max_ev = eigen.eigenvalues.amax();
    if !max_ev.is_finite() || max_ev <= 1.0e-6 {
        return None;
    }

    let mut pseudo_inverse = Matrix3::zeros();
    for i in 0..3 {
        let value = eigen.eigenvalues[i];
        if value > max_ev / MAX_CONDITION {
            let axis = eigen.eigenvectors.column(i);
            pseudo_inverse += axis * axis.transpose() / value;
        }
    }
    Some(pseudo_inverse * atb)
}

fn clamp_to_cell(p: Point3<f32>, min: Point3<f32>, max: Point3<f32>) -> Point3<f32> {
    Point3::new(
        p.x.clamp(min.x, max.x),
        p.y.clamp(min.y, max.y),
        p.z.clamp(min.z, max.z),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{point, vector};

    fn cell() -> (Point3<f32>, Point3<f32>) {
        (point![0.0, 0.0, 0.0], point![1.0, 1.0, 1.0])
    }

    #[test]
    fn single_plane_falls_back_to_its_point() {
        let (min, max) = cell();
        let planes = [(point![0.5, 0.5, 0.25], vector![0.0, 0.0, 1.0])];
        let v = solve(&planes, min, max);
        // one plane leaves two directions unconstrained; the mass point wins
        assert_relative_eq!(v.z, 0.25, epsilon = 1e-5);
    }

    #[test]
    fn three_orthogonal_planes_meet_at_the_corner() {
        let (min, max) = cell();
        let planes = [
            (point![0.25, 0.5, 0.5], vector![1.0, 0.0, 0.0]),
            (point![0.5, 0.25, 0.5], vector![0.0, 1.0, 0.0]),
            (point![0.5, 0.5, 0.25], vector![0.0, 0.0, 1.0]),
        ];
        let v = solve(&planes, min, max);
        assert_relative_eq!(v.x, 0.25, epsilon = 1e-4);
        assert_relative_eq!(v.y, 0.25, epsilon = 1e-4);
        assert_relative_eq!(v.z, 0.25, epsilon = 1e-4);
    }

    #[test]
    fn two_planes_recover_an_edge() {
        let (min, max) = cell();
        let planes = [
            (point![0.75, 0.0, 0.5], vector![1.0, 0.0, 0.0]),
            (point![0.0, 0.75, 0.5], vector![0.0, 1.0, 0.0]),
            (point![0.75, 0.0, 0.25], vector![1.0, 0.0, 0.0]),
            (point![0.0, 0.75, 0.25], vector![0.0, 1.0, 0.0]),
        ];
        let v = solve(&planes, min, max);
        assert_relative_eq!(v.x, 0.75, epsilon = 1e-4);
        assert_relative_eq!(v.y, 0.75, epsilon = 1e-4);
    }

    #[test]
    fn solution_is_clamped_to_the_cell() {
        let (min, max) = cell();
        // planes that agree on a point outside the cell
        let planes = [
            (point![2.0, 0.5, 0.5], vector![1.0, 0.0, 0.0]),
            (point![0.5, 2.0, 0.5], vector![0.0, 1.0, 0.0]),
            (point![0.5, 0.5, 2.0], vector![0.0, 0.0, 1.0]),
        ];
        let v = solve(&planes, min, max);
        assert!(v.x <= 1.0 && v.y <= 1.0 && v.z <= 1.0);
    }
}
