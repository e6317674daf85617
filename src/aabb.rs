use crate::util;
use nalgebra::{point, vector, Point3, Vector3};

#[rustfmt::skip]
fn spans_overlap(amin: f32, amax: f32, bmin: f32, bmax: f32) -> bool {
    util::is_within(bmin, amin, amax) || util::is_within(amin, bmin, bmax) ||
    util::is_within(bmax, amin, amax) || util::is_within(amax, bmin, bmax)
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub min: Point3<f32>,
    pub max: Point3<f32>,
}

impl Aabb {
    pub fn new(min: Point3<f32>, max: Point3<f32>) -> Self {
        Self { min, max }
    }

    /// Smallest box containing every point of `points`.
    ///
    /// Panics when `points` is empty.
    pub fn from_points<I: IntoIterator<Item = Point3<f32>>>(points: I) -> Self {
        let mut points = points.into_iter();
        let first = points.next().expect("aabb from empty point set");
        let mut aabb = Aabb {
            min: first,
            max: first,
        };
        for point in points {
            aabb.min = point![
                util::min(aabb.min.x, point.x),
                util::min(aabb.min.y, point.y),
                util::min(aabb.min.z, point.z)
            ];
            aabb.max = point![
                util::max(aabb.max.x, point.x),
                util::max(aabb.max.y, point.y),
                util::max(aabb.max.z, point.z)
            ];
        }
        aabb
    }

    #[rustfmt::skip]
    pub fn contains(&self, point: &Point3<f32>) -> bool {
        util::is_within(point.x, self.min.x, self.max.x) &&
        util::is_within(point.y, self.min.y, self.max.y) &&
        util::is_within(point.z, self.min.z, self.max.z)
    }

    #[rustfmt::skip]
    pub fn intersects(&self, other: &Aabb) -> bool {
        spans_overlap(self.min.x, self.max.x, other.min.x, other.max.x) &&
        spans_overlap(self.min.y, self.max.y, other.min.y, other.max.y) &&
        spans_overlap(self.min.z, self.max.z, other.min.z, other.max.z)
    }

    pub fn dimensions(&self) -> Vector3<f32> {
        vector![
            self.max.x - self.min.x,
            self.max.y - self.min.y,
            self.max.z - self.min.z
        ]
    }

    pub fn center(&self) -> Point3<f32> {
        self.min + self.dimensions() / 2.0
    }

    pub fn inflate(&self, distance: f32) -> Aabb {
        Aabb {
            min: self.min - vector![distance, distance, distance],
            max: self.max + vector![distance, distance, distance],
        }
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: point![
                util::min(self.min.x, other.min.x),
                util::min(self.min.y, other.min.y),
                util::min(self.min.z, other.min.z)
            ],
            max: point![
                util::max(self.max.x, other.max.x),
                util::max(self.max.y, other.max.y),
                util::max(self.max.z, other.max.z)
            ],
        }
    }

    /// Squared distance from `point` to the closest point of the box; zero
    /// inside.
    pub fn distance_sq(&self, point: &Point3<f32>) -> f32 {
        let mut total = 0.0;
        for axis in 0..3 {
            let v = point[axis];
            if v < self.min[axis] {
                total += (self.min[axis] - v) * (self.min[axis] - v);
            } else if v > self.max[axis] {
                total += (v - self.max[axis]) * (v - self.max[axis]);
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> Aabb {
        Aabb::new(point![0.0, 0.0, 0.0], point![1.0, 1.0, 1.0])
    }

    #[test]
    fn contains_boundary_and_interior() {
        assert!(unit().contains(&point![0.5, 0.5, 0.5]));
        assert!(unit().contains(&point![0.0, 1.0, 0.0]));
        assert!(!unit().contains(&point![1.5, 0.5, 0.5]));
    }

    #[test]
    fn intersection_of_nested_and_disjoint_boxes() {
        let big = unit().inflate(2.0);
        assert!(big.intersects(&unit()));
        assert!(unit().intersects(&big));

        let far = Aabb::new(point![5.0, 5.0, 5.0], point![6.0, 6.0, 6.0]);
        assert!(!unit().intersects(&far));
    }

    #[test]
    fn union_covers_both_operands() {
        let far = Aabb::new(point![5.0, -1.0, 5.0], point![6.0, 6.0, 6.0]);
        let joined = unit().union(&far);
        assert_eq!(joined.min, point![0.0, -1.0, 0.0]);
        assert_eq!(joined.max, point![6.0, 6.0, 6.0]);
    }

    #[test]
    fn distance_is_zero_inside() {
        assert_eq!(unit().distance_sq(&point![0.5, 0.5, 0.5]), 0.0);
        assert_eq!(unit().distance_sq(&point![3.0, 0.5, 0.5]), 4.0);
    }
}
