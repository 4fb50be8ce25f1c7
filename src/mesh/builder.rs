//! Mesh construction utilities.
//!
//! This module provides one-call construction of a cell mesh from a particle
//! snapshot and a list of face rings, as produced once per simulation step.

use super::halfedge::{Mesh, Particle};
use super::index::MeshIndex;
use super::options::MeshOptions;
use crate::error::{MeshError, Result};

/// Build and post-process a mesh from particles and face rings.
///
/// # Arguments
/// * `particles` - Particle snapshot; ids must be `0..particles.len()` in order
/// * `rings` - Vertex rings, one per face, in any rotational order
/// * `options` - Ordering options
///
/// # Returns
/// A mesh in the `Ready` state, or the first structural error.
///
/// # Example
/// ```
/// use cellmesh::mesh::{build_mesh, Mesh, MeshOptions, Particle};
///
/// let particles = vec![
///     Particle::new(0, 0.0, 0.0, 0.0),
///     Particle::new(1, 1.0, 0.0, 0.0),
///     Particle::new(2, 1.0, 1.0, 0.0),
///     Particle::new(3, 0.0, 1.0, 0.0),
/// ];
/// let rings = vec![vec![0, 2, 1, 3]];
///
/// let mesh: Mesh = build_mesh(&particles, &rings, MeshOptions::default()).unwrap();
/// assert_eq!(mesh.nfaces(), 1);
/// assert_eq!(mesh.nedges(), 4);
/// ```
pub fn build_mesh<I: MeshIndex, R: AsRef<[usize]>>(
    particles: &[Particle],
    rings: &[R],
    options: MeshOptions,
) -> Result<Mesh<I>> {
    let mut mesh = Mesh::with_options(options);
    populate(&mut mesh, particles, rings)?;
    mesh.postprocess()?;
    Ok(mesh)
}

/// Reset `mesh` and rebuild it over a new snapshot, keeping its options.
pub fn rebuild<I: MeshIndex, R: AsRef<[usize]>>(
    mesh: &mut Mesh<I>,
    particles: &[Particle],
    rings: &[R],
) -> Result<()> {
    mesh.reset();
    populate(mesh, particles, rings)?;
    mesh.postprocess()?;
    log::info!(
        "rebuilt mesh generation {}: {} vertices, {} faces",
        mesh.generation(),
        mesh.size(),
        mesh.nfaces()
    );
    Ok(())
}

/// Convert a mesh back to a list of vertex rings, one per face.
///
/// Rings come out in their current (ordered, once post-processed) order.
pub fn to_face_rings<I: MeshIndex>(mesh: &Mesh<I>) -> Vec<Vec<usize>> {
    mesh.faces()
        .iter()
        .map(|f| f.vertices.iter().map(|v| v.index()).collect())
        .collect()
}

fn populate<I: MeshIndex, R: AsRef<[usize]>>(
    mesh: &mut Mesh<I>,
    particles: &[Particle],
    rings: &[R],
) -> Result<()> {
    if rings.is_empty() {
        return Err(MeshError::EmptyMesh);
    }
    for p in particles {
        mesh.add_particle(p)?;
    }
    for ring in rings {
        mesh.add_face(ring.as_ref())?;
    }
    Ok(())
}
