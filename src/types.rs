use nalgebra::{Point3, Vector3};

/// Scalar field value at a point in space.
pub type Value = f32;

/// A 3D point with [`Value`] components.
pub type Point = Point3<Value>;

/// A 3D vector with [`Value`] components.
pub type Vector = Vector3<Value>;

/// One triangle of the extracted iso-surface, in world space.
///
/// Vertex order follows the triangulation table exactly; the renderer's
/// back-face culling depends on that winding being preserved.
pub type Triangle = [Point; 3];
