use log::warn;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::{
    field::FieldGrid,
    tables::{CORNER_OFFSETS, EDGE_MIDPOINTS, TRI_TABLE},
    types::{Point, Triangle, Value},
};

/// Anything that consumes extracted triangles, one at a time.
///
/// The single capability an external renderer has to offer. Closures
/// implement it, so `extract_into(&grid, t, &mut |tri| ...)` works directly.
pub trait TriangleSink {
    fn draw_triangle(&mut self, triangle: Triangle);
}

impl<F: FnMut(Triangle)> TriangleSink for F {
    fn draw_triangle(&mut self, triangle: Triangle) {
        self(triangle)
    }
}

/// Computes the 8-bit corner occupancy index of the cube at `(x, y, z)`.
///
/// Bit `i` is set when corner `i` (see [`CORNER_OFFSETS`]) is at or above
/// the threshold. 0 means fully outside, 255 fully inside; both produce
/// no triangles.
#[inline]
pub fn corner_index(grid: &FieldGrid, threshold: Value, x: usize, y: usize, z: usize) -> usize {
    let mut index = 0;
    for (bit, [dx, dy, dz]) in CORNER_OFFSETS.iter().enumerate() {
        if grid.occupied(x + dx, y + dy, z + dz, threshold) {
            index |= 1 << bit;
        }
    }
    index
}

/// Emits the triangles for one cube into `out`, in table order.
fn triangles_for_cube(
    grid: &FieldGrid,
    threshold: Value,
    x: usize,
    y: usize,
    z: usize,
    out: &mut Vec<Triangle>,
) {
    let index = corner_index(grid, threshold, x, y, z);
    if index == 0 {
        return;
    }

    let base = grid.corner_position(x, y, z);
    let cell_size = grid.cell_size();

    for triple in TRI_TABLE[index].chunks_exact(3) {
        if triple[0] == -1 {
            break;
        }
        let mut vertices = [Point::origin(); 3];
        let mut valid = true;
        for (m, &edge) in triple.iter().enumerate() {
            // A negative or out-of-range id sign-extends past the table and
            // resolves to None.
            match EDGE_MIDPOINTS.get(edge as usize) {
                Some(offset) => {
                    vertices[m] = Point::new(
                        base.x + offset[0] * cell_size,
                        base.y + offset[1] * cell_size,
                        base.z + offset[2] * cell_size,
                    );
                }
                None => valid = false,
            }
        }
        if valid {
            out.push(vertices);
        } else {
            // Corrupt table row: drop this one triangle, keep the pass going.
            warn!("skipping triangle with unresolvable edge id in table row {index}");
        }
    }
}

/// Lazy marching cubes pass over a sampled [`FieldGrid`].
///
/// Walks every cube in `[0, N−1]³` in x → y → z scan order and yields each
/// triangle with its vertices at cube-edge midpoints, in world space.
/// Deterministic: identical grids and thresholds yield bit-identical
/// triangle sequences.
pub struct MarchingCubes<'a> {
    grid: &'a FieldGrid,
    threshold: Value,
    cursor: usize,
    cube_count: usize,
    pending: std::vec::IntoIter<Triangle>,
}

impl<'a> MarchingCubes<'a> {
    pub fn new(grid: &'a FieldGrid, threshold: Value) -> Self {
        let n = grid.resolution();
        Self {
            grid,
            threshold,
            cursor: 0,
            cube_count: n * n * n,
            pending: Vec::new().into_iter(),
        }
    }
}

impl Iterator for MarchingCubes<'_> {
    type Item = Triangle;

    fn next(&mut self) -> Option<Triangle> {
        loop {
            if let Some(triangle) = self.pending.next() {
                return Some(triangle);
            }
            if self.cursor >= self.cube_count {
                return None;
            }
            let n = self.grid.resolution();
            let x = self.cursor / (n * n);
            let y = (self.cursor / n) % n;
            let z = self.cursor % n;
            self.cursor += 1;

            let mut out = Vec::new();
            triangles_for_cube(self.grid, self.threshold, x, y, z, &mut out);
            self.pending = out.into_iter();
        }
    }
}

/// Drains a full marching cubes pass into `sink`.
pub fn extract_into<S: TriangleSink>(grid: &FieldGrid, threshold: Value, sink: &mut S) {
    for triangle in MarchingCubes::new(grid, threshold) {
        sink.draw_triangle(triangle);
    }
}

/// Runs a whole marching cubes pass and collects flat vertex positions.
///
/// Work is parallelised over X slices with Rayon; the ordered collect keeps
/// the output identical to the serial [`MarchingCubes`] iterator. Every
/// group of three consecutive vertices is one triangle.
pub fn polygonize(grid: &FieldGrid, threshold: Value) -> Vec<[f32; 3]> {
    let n = grid.resolution();
    let per_x: Vec<Vec<Triangle>> = (0..n)
        .into_par_iter()
        .map(|x| {
            let mut local = Vec::new();
            for y in 0..n {
                for z in 0..n {
                    triangles_for_cube(grid, threshold, x, y, z, &mut local);
                }
            }
            local
        })
        .collect();

    let total = per_x.iter().map(|t| t.len() * 3).sum();
    let mut vertices: Vec<[f32; 3]> = Vec::with_capacity(total);
    for triangles in per_x {
        for [a, b, c] in triangles {
            vertices.push([a.x, a.y, a.z]);
            vertices.push([b.x, b.y, b.z]);
            vertices.push([c.x, c.y, c.z]);
        }
    }
    vertices
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::types::Vector;

    use super::*;

    type VertexKey = [u32; 3];

    fn key(p: &Point) -> VertexKey {
        [p.x.to_bits(), p.y.to_bits(), p.z.to_bits()]
    }

    /// One point at (5,5,5) on a [0,10]^3 grid, N = 10.
    fn blob_grid() -> FieldGrid {
        let mut grid = FieldGrid::new(10, 10.0, Vector::zeros()).unwrap();
        grid.sample(&[Point::new(5.0, 5.0, 5.0)]);
        grid
    }

    fn occupied_corners(grid: &FieldGrid, threshold: Value) -> Vec<(usize, usize, usize)> {
        let n = grid.resolution();
        let mut set = Vec::new();
        for x in 0..=n {
            for y in 0..=n {
                for z in 0..=n {
                    if grid.occupied(x, y, z, threshold) {
                        set.push((x, y, z));
                    }
                }
            }
        }
        set
    }

    /// Counts connected components, joining triangles that share a
    /// bit-identical vertex.
    fn connected_components(triangles: &[Triangle]) -> usize {
        let mut parent: Vec<usize> = (0..triangles.len()).collect();
        fn find(parent: &mut Vec<usize>, i: usize) -> usize {
            let p = parent[i];
            if p == i {
                return i;
            }
            let root = find(parent, p);
            parent[i] = root;
            root
        }

        let mut by_vertex: HashMap<VertexKey, usize> = HashMap::new();
        for (i, triangle) in triangles.iter().enumerate() {
            for vertex in triangle {
                match by_vertex.entry(key(vertex)) {
                    std::collections::hash_map::Entry::Occupied(e) => {
                        let (a, b) = (find(&mut parent, i), find(&mut parent, *e.get()));
                        parent[a] = b;
                    }
                    std::collections::hash_map::Entry::Vacant(e) => {
                        e.insert(i);
                    }
                }
            }
        }
        (0..triangles.len())
            .filter(|&i| find(&mut parent, i) == i)
            .count()
    }

    #[test]
    fn empty_field_emits_no_triangles() {
        let mut grid = FieldGrid::new(8, 8.0, Vector::zeros()).unwrap();
        grid.sample(&[]);
        assert_eq!(MarchingCubes::new(&grid, 0.5).count(), 0);
    }

    #[test]
    fn fully_inside_field_emits_no_triangles() {
        // At threshold 0 every corner of the blob grid is occupied, so every
        // cube has index 255 and the empty table row.
        let grid = blob_grid();
        assert_eq!(MarchingCubes::new(&grid, 0.0).count(), 0);
    }

    #[test]
    fn blob_mesh_is_watertight() {
        let grid = blob_grid();
        let triangles: Vec<Triangle> = MarchingCubes::new(&grid, 0.5).collect();
        assert!(!triangles.is_empty());

        // Cell size is exactly 1.0, so shared midpoints are bit-identical
        // between neighbouring cubes and exact edge counting is sound. A
        // closed surface has every undirected edge on exactly two triangles.
        let mut edge_uses: HashMap<(VertexKey, VertexKey), usize> = HashMap::new();
        for triangle in &triangles {
            for (a, b) in [(0_usize, 1_usize), (1, 2), (2, 0)] {
                let (ka, kb) = (key(&triangle[a]), key(&triangle[b]));
                let edge = if ka <= kb { (ka, kb) } else { (kb, ka) };
                *edge_uses.entry(edge).or_insert(0) += 1;
            }
        }
        for (edge, uses) in &edge_uses {
            assert_eq!(*uses, 2, "boundary leak at edge {edge:?}");
        }
    }

    #[test]
    fn identical_passes_are_bit_identical() {
        let grid = blob_grid();
        let first: Vec<[VertexKey; 3]> = MarchingCubes::new(&grid, 0.5)
            .map(|t| [key(&t[0]), key(&t[1]), key(&t[2])])
            .collect();
        let second: Vec<[VertexKey; 3]> = MarchingCubes::new(&grid, 0.5)
            .map(|t| [key(&t[0]), key(&t[1]), key(&t[2])])
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn polygonize_matches_the_serial_iterator() {
        let grid = blob_grid();
        let serial: Vec<VertexKey> = MarchingCubes::new(&grid, 0.5)
            .flat_map(|t| t.map(|v| key(&v)))
            .collect();
        let parallel: Vec<VertexKey> = polygonize(&grid, 0.5)
            .iter()
            .map(|v| [v[0].to_bits(), v[1].to_bits(), v[2].to_bits()])
            .collect();
        assert_eq!(serial, parallel);
    }

    #[test]
    fn raising_the_threshold_only_shrinks_the_surface() {
        let grid = blob_grid();
        let low = occupied_corners(&grid, 0.5);
        let high = occupied_corners(&grid, 1.0);
        assert!(high.iter().all(|c| low.contains(c)));
        assert!(high.len() < low.len());

        let low_tris = MarchingCubes::new(&grid, 0.5).count();
        let high_tris = MarchingCubes::new(&grid, 1.0).count();
        assert!(high_tris <= low_tris);
        assert!(high_tris > 0);
    }

    #[test]
    fn clustered_points_merge_into_one_blob() {
        // Three points within 0.1 of each other, at a threshold a lone point
        // could not reach one cell away (1/1^2 = 1.0 < 1.2).
        let points = [
            Point::new(5.0, 5.0, 5.0),
            Point::new(5.05, 5.0, 5.0),
            Point::new(5.0, 5.05, 5.0),
        ];
        let mut grid = FieldGrid::new(10, 10.0, Vector::zeros()).unwrap();
        grid.sample(&points);
        let triangles: Vec<Triangle> = MarchingCubes::new(&grid, 1.2).collect();
        assert!(!triangles.is_empty());
        assert_eq!(connected_components(&triangles), 1);
    }

    #[test]
    fn sink_receives_the_full_pass() {
        let grid = blob_grid();
        let expected = MarchingCubes::new(&grid, 0.5).count();
        let mut seen = 0_usize;
        extract_into(&grid, 0.5, &mut |_tri| seen += 1);
        assert_eq!(seen, expected);
    }
}
