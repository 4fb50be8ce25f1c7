//! Dual cell metrics for every vertex of a mesh.
//!
//! # Example
//!
//! ```
//! use cellmesh::prelude::*;
//! use cellmesh::algo::cells::dual_cells;
//!
//! let particles: Vec<Particle> = (0..9)
//!     .map(|i| Particle::new(i, (i % 3) as f64, (i / 3) as f64, 0.0))
//!     .collect();
//! let rings = vec![[0, 1, 4, 3], [1, 2, 5, 4], [3, 4, 7, 6], [4, 5, 8, 7]];
//! let mesh: Mesh = build_mesh(&particles, &rings, MeshOptions::default()).unwrap();
//!
//! let cells = dual_cells(&mesh).unwrap();
//! assert!((cells[4].area - 1.0).abs() < 1e-12);
//! ```

use rayon::prelude::*;

use crate::error::Result;
use crate::mesh::{DualCell, Mesh, MeshIndex, MeshState, Vertex};

/// Compute the dual cell of every vertex, indexed by vertex id.
///
/// The mesh must be post-processed. This function uses parallel computation;
/// use [`dual_cells_sequential`] for single-threaded execution.
pub fn dual_cells<I: MeshIndex>(mesh: &Mesh<I>) -> Result<Vec<DualCell>> {
    dual_cells_impl(mesh, true)
}

/// Compute the dual cell of every vertex (sequential version).
pub fn dual_cells_sequential<I: MeshIndex>(mesh: &Mesh<I>) -> Result<Vec<DualCell>> {
    dual_cells_impl(mesh, false)
}

fn dual_cells_impl<I: MeshIndex>(mesh: &Mesh<I>, parallel: bool) -> Result<Vec<DualCell>> {
    mesh.require("dual_cells", &[MeshState::Ready])?;

    let compute_vertex = |v: &Vertex<I>| -> DualCell { mesh.cell_of(v, &v.normal) };

    let cells: Vec<DualCell> = if parallel {
        mesh.vertices().par_iter().map(compute_vertex).collect()
    } else {
        mesh.vertices().iter().map(compute_vertex).collect()
    };

    log::debug!(
        "computed {} dual cells ({} degenerate)",
        cells.len(),
        cells.iter().filter(|c| c.is_degenerate()).count()
    );
    Ok(cells)
}

/// Total area of all non-degenerate dual cells.
pub fn total_area(cells: &[DualCell]) -> f64 {
    cells.iter().map(|c| c.area).sum()
}
