use log::debug;
use ndarray::Array3;
use ndarray::parallel::prelude::*;

use crate::{
    error::{MetaballError, Result},
    types::{Point, Value, Vector},
};

/// Contributions closer than this squared distance are clamped, so an
/// influence point that lands exactly on a grid corner saturates to a large
/// finite value (~1e12) instead of dividing by zero.
pub const MIN_DISTANCE_SQUARED: Value = 1e-12;

/// Discrete grid-resolution presets.
///
/// The only lever trading surface fidelity for throughput: higher tiers mean
/// a smaller cell size and cubically more sampling work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Quality {
    /// 64 cubes per axis.
    Coarse,
    /// 96 cubes per axis.
    #[default]
    Medium,
    /// 120 cubes per axis.
    Fine,
    /// 480 cubes per axis. Expect multi-second passes on large point sets.
    Ultra,
}

impl Quality {
    /// Number of cubes along each grid axis for this tier.
    pub const fn resolution(self) -> usize {
        match self {
            Quality::Coarse => 64,
            Quality::Medium => 96,
            Quality::Fine => 120,
            Quality::Ultra => 480,
        }
    }
}

/// Summed metaball influence of `points` at `p`: `Σ 1 / |p − q|²`.
///
/// Plain inverse squared distance, with the denominator clamped at
/// [`MIN_DISTANCE_SQUARED`] so coincident points stay finite.
#[inline]
pub fn field_at(p: Point, points: &[Point]) -> Value {
    points
        .iter()
        .map(|q| 1.0 / (p - *q).norm_squared().max(MIN_DISTANCE_SQUARED))
        .sum()
}

/// A dense scalar field sampled on a regular axis-aligned grid.
///
/// A grid of `resolution` cubes per axis stores `(resolution + 1)³` corner
/// values in one flat contiguous buffer. The grid is owned by a single
/// sampling pass; extraction borrows it immutably afterwards, so extraction
/// can never observe a half-filled grid.
pub struct FieldGrid {
    resolution: usize,
    cell_size: Value,
    origin: Vector,
    values: Array3<Value>,
}

impl FieldGrid {
    /// Allocates a zeroed grid of `resolution` cubes per axis spanning
    /// `extent` world units from `origin`.
    ///
    /// Fails fast with [`MetaballError::GridAllocation`] if the corner count
    /// overflows or the buffer cannot be allocated; there is no partial-grid
    /// fallback.
    pub fn new(resolution: usize, extent: Value, origin: Vector) -> Result<Self> {
        debug_assert!(resolution > 0);
        let corners = resolution
            .checked_add(1)
            .ok_or(MetaballError::GridAllocation { resolution })?;
        let len = corners
            .checked_mul(corners)
            .and_then(|n| n.checked_mul(corners))
            .ok_or(MetaballError::GridAllocation { resolution })?;

        let mut buffer: Vec<Value> = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|_| MetaballError::GridAllocation { resolution })?;
        buffer.resize(len, 0.0);

        let values = Array3::from_shape_vec((corners, corners, corners), buffer)
            .map_err(|_| MetaballError::GridAllocation { resolution })?;

        Ok(Self {
            resolution,
            cell_size: extent / resolution as Value,
            origin,
            values,
        })
    }

    /// Number of cubes along each axis.
    pub fn resolution(&self) -> usize {
        self.resolution
    }

    /// World-space edge length of one grid cube.
    pub fn cell_size(&self) -> Value {
        self.cell_size
    }

    /// World-space position of grid corner `(x, y, z)`.
    pub fn corner_position(&self, x: usize, y: usize, z: usize) -> Point {
        corner_position(&self.origin, self.cell_size, x, y, z)
    }

    /// Field value stored at grid corner `(x, y, z)`.
    pub fn value(&self, x: usize, y: usize, z: usize) -> Value {
        self.values[[x, y, z]]
    }

    /// Whether corner `(x, y, z)` lies inside the surface at `threshold`.
    ///
    /// The field is a sum of positive falloffs, so "inside" means **at or
    /// above** the threshold (the opposite sense to a signed distance field).
    #[inline]
    pub fn occupied(&self, x: usize, y: usize, z: usize, threshold: Value) -> bool {
        self.values[[x, y, z]] >= threshold
    }

    /// Fills every grid corner with the summed influence of `points`.
    ///
    /// Serial reference path; cost is O(corners × points) with no spatial
    /// pruning.
    pub fn sample(&mut self, points: &[Point]) {
        let (origin, cell_size) = (self.origin, self.cell_size);
        for ((x, y, z), value) in self.values.indexed_iter_mut() {
            *value = field_at(corner_position(&origin, cell_size, x, y, z), points);
        }
        debug!(
            "sampled {n}x{n}x{n} grid from {p} influence points",
            n = self.resolution + 1,
            p = points.len(),
        );
    }

    /// Parallel equivalent of [`sample`](FieldGrid::sample).
    ///
    /// The grid is partitioned into disjoint X slabs, one rayon job per slab.
    /// No two workers ever write the same cell, so no locking or merge step
    /// is needed, and the result is bit-identical to the serial path: every
    /// cell sums the same contributions in the same order.
    pub fn par_sample(&mut self, points: &[Point]) {
        let (origin, cell_size) = (self.origin, self.cell_size);
        self.values
            .outer_iter_mut()
            .into_par_iter()
            .enumerate()
            .for_each(|(x, mut slab)| {
                for ((y, z), value) in slab.indexed_iter_mut() {
                    *value = field_at(corner_position(&origin, cell_size, x, y, z), points);
                }
            });
        debug!(
            "sampled {n}x{n}x{n} grid from {p} influence points (parallel)",
            n = self.resolution + 1,
            p = points.len(),
        );
    }
}

// Free function so sampling loops can use it while `values` is mutably borrowed.
#[inline]
fn corner_position(origin: &Vector, cell_size: Value, x: usize, y: usize, z: usize) -> Point {
    Point::new(
        origin.x + x as Value * cell_size,
        origin.y + y as Value * cell_size,
        origin.z + z as Value * cell_size,
    )
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn unit_grid(resolution: usize) -> FieldGrid {
        FieldGrid::new(resolution, resolution as Value, Vector::zeros()).unwrap()
    }

    #[test]
    fn quality_tiers_increase_resolution() {
        let tiers = [Quality::Coarse, Quality::Medium, Quality::Fine, Quality::Ultra];
        assert!(tiers.windows(2).all(|w| w[0].resolution() < w[1].resolution()));
        assert_eq!(Quality::default().resolution(), 96);
    }

    #[test]
    fn zero_points_leave_the_field_empty() {
        let mut grid = unit_grid(4);
        grid.sample(&[]);
        for x in 0..=4 {
            for y in 0..=4 {
                for z in 0..=4 {
                    assert_eq!(grid.value(x, y, z), 0.0);
                    assert!(!grid.occupied(x, y, z, 0.5));
                }
            }
        }
    }

    #[test]
    fn single_point_field_is_radially_symmetric() {
        let mut grid = unit_grid(10);
        grid.sample(&[Point::new(5.0, 5.0, 5.0)]);

        // Integer corner coordinates give exact integer squared distances, so
        // equidistant corners must carry bit-identical values.
        let mut by_distance: std::collections::HashMap<i64, Value> =
            std::collections::HashMap::new();
        for x in 0..=10_i64 {
            for y in 0..=10_i64 {
                for z in 0..=10_i64 {
                    let d2 = (x - 5).pow(2) + (y - 5).pow(2) + (z - 5).pow(2);
                    let v = grid.value(x as usize, y as usize, z as usize);
                    let seen = *by_distance.entry(d2).or_insert(v);
                    assert_eq!(seen.to_bits(), v.to_bits(), "corner ({x},{y},{z})");
                }
            }
        }
    }

    #[test]
    fn occupancy_matches_the_analytic_radius() {
        // One point at (5,5,5) on [0,10]^3 at threshold 0.5: occupied corners
        // are exactly those with squared distance <= 1/0.5 = 2.
        let mut grid = unit_grid(10);
        grid.sample(&[Point::new(5.0, 5.0, 5.0)]);
        for x in 0..=10_i64 {
            for y in 0..=10_i64 {
                for z in 0..=10_i64 {
                    let d2 = (x - 5).pow(2) + (y - 5).pow(2) + (z - 5).pow(2);
                    let expected = d2 <= 2;
                    assert_eq!(
                        grid.occupied(x as usize, y as usize, z as usize, 0.5),
                        expected,
                        "corner ({x},{y},{z}) d2 {d2}"
                    );
                }
            }
        }
    }

    #[test]
    fn coincident_point_saturates_instead_of_exploding() {
        let v = field_at(Point::new(1.0, 2.0, 3.0), &[Point::new(1.0, 2.0, 3.0)]);
        assert!(v.is_finite());
        assert_relative_eq!(v, 1.0 / MIN_DISTANCE_SQUARED);
        // Saturated value clears any practical threshold.
        assert!(v >= 17.0);
    }

    #[test]
    fn additive_field_sums_per_point_contributions() {
        let p = Point::new(0.0, 0.0, 0.0);
        let q = Point::new(2.0, 0.0, 0.0);
        assert_relative_eq!(field_at(p, &[q]), 0.25);
        assert_relative_eq!(field_at(p, &[q, q, q]), 0.75);
    }

    #[test]
    fn parallel_sampling_is_bit_identical_to_serial() {
        let points = [
            Point::new(3.2, 4.1, 5.9),
            Point::new(6.5, 3.5, 4.5),
            Point::new(5.0, 8.0, 5.0),
        ];
        let mut serial = unit_grid(16);
        let mut parallel = unit_grid(16);
        serial.sample(&points);
        parallel.par_sample(&points);
        for x in 0..=16 {
            for y in 0..=16 {
                for z in 0..=16 {
                    assert_eq!(
                        serial.value(x, y, z).to_bits(),
                        parallel.value(x, y, z).to_bits(),
                        "corner ({x},{y},{z})"
                    );
                }
            }
        }
    }

    #[test]
    fn oversized_grid_fails_fast() {
        // (2^22 + 1)^3 overflows usize on 64-bit targets; no allocation is
        // attempted.
        let result = FieldGrid::new(1 << 22, 20.0, Vector::zeros());
        assert!(matches!(
            result,
            Err(MetaballError::GridAllocation { .. })
        ));
    }
}
