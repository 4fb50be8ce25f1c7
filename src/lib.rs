//! # Cellmesh
//!
//! A half-edge cell mesh over particle snapshots for vertex-model tissue
//! simulations on curved surfaces.
//!
//! Once per simulation step the mesh is rebuilt from the current particles and
//! their face rings. Rings may arrive in any rotational order: the ordering
//! engine sorts every face ring and vertex star counter-clockwise about the
//! outward surface normal, after which the dual cell of every particle (the
//! polygon through the centroids of its faces) is available for area and
//! perimeter based energies.
//!
//! ## Features
//!
//! - **Half-edge data structure**: directed edges with twin/next/prev links and type-safe indices
//! - **Flexible indexing**: Support for 16-bit, 32-bit, and 64-bit indices
//! - **Deterministic ordering**: angular ties are broken by id and reported as diagnostics
//! - **Dual geometry**: per-vertex dual area and perimeter, batched in parallel with rayon
//! - **Periodic strips**: image particles paired with their sources by position
//!
//! ## Quick Start
//!
//! ```
//! use cellmesh::prelude::*;
//!
//! // A vertex surrounded by four unit squares
//! let particles: Vec<Particle> = (0..9)
//!     .map(|i| Particle::new(i, (i % 3) as f64, (i / 3) as f64, 0.0))
//!     .collect();
//! let rings = vec![[4, 0, 1, 3], [1, 2, 5, 4], [3, 4, 7, 6], [8, 7, 4, 5]];
//!
//! let mesh: Mesh = build_mesh(&particles, &rings, MeshOptions::default()).unwrap();
//! assert_eq!(mesh.state(), MeshState::Ready);
//!
//! // Dual cell of the centre particle
//! let v = VertexId::new(4);
//! assert!((mesh.dual_area(v).unwrap() - 1.0).abs() < 1e-12);
//! assert!((mesh.dual_perimeter(v).unwrap() - 4.0).abs() < 1e-12);
//! ```
//!
//! ## Incremental Assembly
//!
//! ```
//! use cellmesh::prelude::*;
//!
//! let mut mesh: Mesh = Mesh::new();
//! mesh.add_vertex(0, 0.0, 0.0, 0.0).unwrap();
//! mesh.add_vertex(1, 1.0, 0.0, 0.0).unwrap();
//! mesh.add_vertex(2, 1.0, 1.0, 0.0).unwrap();
//! mesh.add_vertex(3, 0.0, 1.0, 0.0).unwrap();
//! let f = mesh.add_face(&[0, 1, 2, 3]).unwrap();
//!
//! mesh.order_face(f).unwrap();
//! let centre = mesh.compute_centre(f).unwrap();
//! assert_eq!((centre.x, centre.y), (0.5, 0.5));
//!
//! mesh.postprocess().unwrap();
//! assert_eq!(mesh.nedges(), 4);
//! assert!(mesh.edge_face().is_empty());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod algo;
pub mod boundary;
pub mod error;
pub mod mesh;
pub mod params;

/// Prelude module for convenient imports.
///
/// This module re-exports the most commonly used types and functions:
///
/// ```
/// use cellmesh::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Diagnostic, MeshError, Result};
    pub use crate::mesh::{
        build_mesh, rebuild, to_face_rings, DualCell, Edge, EdgeId, Face, FaceId, Mesh,
        MeshIndex, MeshOptions, MeshState, Particle, StarStatus, Vertex, VertexId,
    };
}

// Re-export nalgebra types for convenience
pub use nalgebra;
