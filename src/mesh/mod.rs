//! Core mesh data structures.
//!
//! This module provides the half-edge cell mesh built over a particle
//! snapshot, its ordering engine and the dual cell geometry.
//!
//! # Overview
//!
//! The primary type is [`Mesh`]. Faces arrive as vertex rings in arbitrary
//! rotational order; [`Mesh::postprocess`] orders every ring and every vertex
//! star counter-clockwise about the outward normal, computes face centroids
//! and resolves twin/next/prev links. Dual areas and perimeters are then
//! available per vertex.
//!
//! # Index Types
//!
//! Mesh elements are identified by type-safe index wrappers:
//! - [`VertexId`] - Identifies a vertex (equal to the particle id)
//! - [`EdgeId`] - Identifies a directed edge
//! - [`FaceId`] - Identifies a face
//!
//! These indices are generic over the underlying integer type ([`MeshIndex`] trait),
//! allowing you to choose `u16`, `u32`, or `u64` based on mesh size.
//!
//! # Construction
//!
//! ```
//! use cellmesh::mesh::{Mesh, VertexId};
//!
//! let mut mesh: Mesh = Mesh::new();
//! mesh.add_vertex(0, 0.0, 0.0, 0.0).unwrap();
//! mesh.add_vertex(1, 1.0, 0.0, 0.0).unwrap();
//! mesh.add_vertex(2, 0.5, 1.0, 0.0).unwrap();
//! mesh.add_face(&[2, 1, 0]).unwrap();
//! mesh.postprocess().unwrap();
//!
//! assert_eq!(mesh.nedges(), 3);
//! assert_eq!(mesh.dual_area(VertexId::new(0)).unwrap(), 0.0);
//! ```

mod assembly;
mod builder;
mod dual;
mod halfedge;
mod index;
mod options;
mod order;

pub use builder::{build_mesh, rebuild, to_face_rings};
pub use dual::{DualCell, StarStatus};
pub use halfedge::{Edge, Face, FaceEdgeIter, Mesh, MeshState, Particle, Vertex};
pub use index::{EdgeId, FaceId, MeshIndex, VertexId};
pub use options::MeshOptions;
