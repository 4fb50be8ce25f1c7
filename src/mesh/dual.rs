//! Face centroids and dual cell geometry.
//!
//! The dual cell of a vertex is the polygon through the centroids of its
//! incident faces, taken in star order. For a vertex on an open fan the
//! polygon is closed through the vertex itself.

use nalgebra::{Point3, Vector3};

use super::halfedge::{polygon_area, polygon_perimeter, Mesh, MeshState, Vertex};
use super::index::{FaceId, MeshIndex, VertexId};
use crate::error::{MeshError, Result};

/// How a vertex star closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarStatus {
    /// The incident faces surround the vertex.
    Closed,
    /// The incident faces form an open fan; the polygon closes through the vertex.
    Open,
    /// Fewer than three incident faces; area and perimeter are zero.
    Degenerate {
        /// Number of incident faces.
        faces: usize,
    },
}

/// Area and perimeter of one dual cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualCell {
    /// Enclosed area, projected along the vertex normal.
    pub area: f64,
    /// Length of the closed polygon.
    pub perimeter: f64,
    /// How the star closes.
    pub status: StarStatus,
}

impl DualCell {
    /// Zero cell for a vertex with too few faces.
    pub fn degenerate(faces: usize) -> Self {
        Self {
            area: 0.0,
            perimeter: 0.0,
            status: StarStatus::Degenerate { faces },
        }
    }

    /// Whether the cell has non-zero geometry.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        matches!(self.status, StarStatus::Degenerate { .. })
    }
}

const GEOMETRY: [MeshState; 2] = [MeshState::Geometry, MeshState::Ready];

impl<I: MeshIndex> Mesh<I> {
    /// Compute the centroid of an ordered face and store it.
    pub fn compute_centre(&mut self, f: FaceId<I>) -> Result<Point3<f64>> {
        self.require(
            "compute_centre",
            &[MeshState::Ordering, MeshState::Geometry, MeshState::Ready],
        )?;
        let face = self.try_face(f)?;
        if !face.ordered {
            return Err(MeshError::UnorderedFace { face: f.index() });
        }

        let centre = self.ring_centre(&face.vertices);
        let epoch = self.epoch;
        let face = &mut self.faces[f.index()];
        face.centre = centre;
        face.centre_epoch = Some(epoch);
        if self.state == MeshState::Ordering {
            self.state = MeshState::Geometry;
        }
        Ok(centre)
    }

    /// Area of the dual cell of `v`, projected along the vertex normal.
    ///
    /// Zero for vertices with fewer than three incident faces.
    pub fn dual_area(&self, v: VertexId<I>) -> Result<f64> {
        Ok(self.dual_cell(v)?.area)
    }

    /// Area of the dual cell of `v`, projected along `normal`.
    pub fn dual_area_along(&self, v: VertexId<I>, normal: &Vector3<f64>) -> Result<f64> {
        let vertex = self.star(v, "dual_area_along")?;
        let direction = normal
            .try_normalize(f64::EPSILON)
            .ok_or_else(|| MeshError::invalid_param("normal", format!("{:?}", normal), "zero vector"))?;
        Ok(self.cell_of(vertex, &direction).area)
    }

    /// Perimeter of the dual cell of `v`.
    pub fn dual_perimeter(&self, v: VertexId<I>) -> Result<f64> {
        Ok(self.dual_cell(v)?.perimeter)
    }

    /// Area, perimeter and closure of the dual cell of `v`.
    pub fn dual_cell(&self, v: VertexId<I>) -> Result<DualCell> {
        let vertex = self.star(v, "dual_cell")?;
        Ok(self.cell_of(vertex, &vertex.normal))
    }

    /// Dual polygon of `v`: centroids in star order, preceded by the vertex
    /// position when the star is open.
    pub fn dual_polygon(&self, v: VertexId<I>) -> Result<Vec<Point3<f64>>> {
        let vertex = self.star(v, "dual_polygon")?;
        Ok(self.polygon_of(vertex))
    }

    // ==================== Helpers ====================

    /// Vertex whose star is current, or the reason it is not.
    fn star(&self, v: VertexId<I>, operation: &'static str) -> Result<&Vertex<I>> {
        self.require(operation, &GEOMETRY)?;
        let vertex = self.try_vertex(v)?;
        if vertex.star_epoch != Some(self.epoch) {
            return Err(MeshError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(vertex)
    }

    fn polygon_of(&self, vertex: &Vertex<I>) -> Vec<Point3<f64>> {
        let mut points = Vec::with_capacity(vertex.faces.len() + 1);
        if vertex.boundary {
            points.push(vertex.position);
        }
        points.extend(vertex.faces.iter().map(|&f| self.faces[f.index()].centre));
        points
    }

    pub(crate) fn cell_of(&self, vertex: &Vertex<I>, normal: &Vector3<f64>) -> DualCell {
        let faces = vertex.faces.len();
        if faces < 3 {
            log::trace!("dual cell of {:?} is degenerate ({} faces)", vertex.id, faces);
            return DualCell::degenerate(faces);
        }

        let points = self.polygon_of(vertex);
        DualCell {
            area: polygon_area(&points, normal),
            perimeter: polygon_perimeter(&points),
            status: if vertex.boundary {
                StarStatus::Open
            } else {
                StarStatus::Closed
            },
        }
    }
}
