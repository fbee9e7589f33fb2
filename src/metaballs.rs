use std::sync::Arc;

use bevy::prelude::*;

use crate::{
    field::Quality,
    types::{Point, Value, Vector},
};

/// A blobby implicit surface defined by a set of influence points.
///
/// Each point contributes `1 / distance²` to a scalar field sampled over a
/// cubic region of `extent` world units anchored at `origin`; the mesh is
/// the `threshold` level set of that field. The points are an immutable
/// snapshot for the duration of one pass (one generated mesh).
///
/// `points` is wrapped in an [`Arc`] so the async mesh-generation task can
/// hold a reference without copying it.
#[derive(Component)]
#[require(Transform)]
pub struct Metaballs {
    /// Influence point positions, in the grid's coordinate space.
    pub points: Arc<Vec<Point>>,
    /// Grid resolution preset for the field pass.
    pub quality: Quality,
    /// Iso-surface threshold — field values ≥ threshold are "inside".
    pub threshold: Value,
    /// World-space size of the sampled cube, per axis.
    pub extent: Value,
    /// World-space position of the grid's minimum corner.
    pub origin: Vector,
}

impl Default for Metaballs {
    fn default() -> Self {
        let extent = 20.0;
        Self {
            points: Arc::new(Vec::new()),
            quality: Quality::default(),
            threshold: 17.0,
            extent,
            origin: centered_origin(extent),
        }
    }
}

impl Metaballs {
    /// Creates a metaball surface from owned influence points.
    pub fn new(points: Vec<Point>) -> Self {
        Self {
            points: Arc::new(points),
            ..Default::default()
        }
    }

    /// Replaces the influence points with a previously saved [`Arc`].
    ///
    /// Use this to respawn an entity with points retained from a prior
    /// despawn, with zero allocation on the main thread.
    pub fn with_points(mut self, points: Arc<Vec<Point>>) -> Self {
        self.points = points;
        self
    }

    /// Sets the grid resolution preset.
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    /// Sets the iso-surface threshold.
    pub fn with_threshold(mut self, threshold: Value) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sets the sampled region's size and re-centers its origin on the X and
    /// Z axes (Y starts at the floor). Call [`with_origin`](Self::with_origin)
    /// afterwards to place the region somewhere else.
    pub fn with_extent(mut self, extent: Value) -> Self {
        self.extent = extent;
        self.origin = centered_origin(extent);
        self
    }

    /// Sets the world-space position of the grid's minimum corner.
    pub fn with_origin(mut self, origin: Vector) -> Self {
        self.origin = origin;
        self
    }
}

/// Default grid placement: centered on X and Z, resting on y = 0.
fn centered_origin(extent: Value) -> Vector {
    Vector::new(-extent / 2.0, 0.0, -extent / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_recenters_origin_until_overridden() {
        let balls = Metaballs::new(vec![]).with_extent(10.0);
        assert_eq!(balls.origin, Vector::new(-5.0, 0.0, -5.0));

        let placed = Metaballs::new(vec![])
            .with_extent(10.0)
            .with_origin(Vector::new(1.0, 2.0, 3.0));
        assert_eq!(placed.origin, Vector::new(1.0, 2.0, 3.0));
    }
}
