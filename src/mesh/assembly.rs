//! Mesh assembly: vertices, directed edges and faces.
//!
//! Assembly is only allowed while the mesh is `Empty` or `Assembling`. Any
//! structural error aborts the rebuild and moves the mesh to `Failed`.

use std::collections::{BTreeMap, HashMap};

use super::halfedge::{unordered, Edge, Face, Mesh, MeshState, Particle, Vertex};
use super::index::{EdgeId, FaceId, MeshIndex, VertexId};
use crate::error::{MeshError, Result};

const ASSEMBLY: [MeshState; 2] = [MeshState::Empty, MeshState::Assembling];

impl<I: MeshIndex> Mesh<I> {
    /// Add a vertex at `(x, y, z)`.
    ///
    /// Ids must arrive contiguously from zero.
    pub fn add_vertex(&mut self, id: usize, x: f64, y: f64, z: f64) -> Result<VertexId<I>> {
        self.add_particle(&Particle::new(id, x, y, z))
    }

    /// Add a vertex from a particle, carrying over its type and normal.
    pub fn add_particle(&mut self, p: &Particle) -> Result<VertexId<I>> {
        self.require("add_vertex", &ASSEMBLY)?;

        let expected = self.vertices.len();
        if p.id < expected {
            return Err(self.fail(MeshError::DuplicateVertex { id: p.id }));
        }
        if p.id > expected {
            return Err(self.fail(MeshError::NonContiguousVertex { id: p.id, expected }));
        }

        self.vertices.push(Vertex::from_particle(p));
        self.size += 1;
        self.state = MeshState::Assembling;
        Ok(VertexId::new(p.id))
    }

    /// Register the directed edge `i → j`.
    ///
    /// Twin, next and prev links stay unresolved until [`postprocess`](Self::postprocess).
    pub fn add_edge(&mut self, i: usize, j: usize) -> Result<EdgeId<I>> {
        self.require("add_edge", &ASSEMBLY)?;

        let a = self.assembly_vertex(i)?;
        let b = self.assembly_vertex(j)?;
        if a == b {
            return Err(self.fail(MeshError::SelfLoop { vertex: i }));
        }
        if self.edge_map.contains_key(&(a, b)) {
            return Err(self.fail(MeshError::DuplicateEdge { from: i, to: j }));
        }

        let e = self.push_edge(a, b);
        self.edges[e.index()].explicit = true;
        self.link_neighbours(a, b);
        Ok(e)
    }

    /// Add a face bounded by `ring`.
    ///
    /// The ring may be unordered; [`order_face`](Self::order_face) fixes it
    /// later. Directed edges are created for consecutive pairs as needed and
    /// every pair shared with an earlier face is recorded in
    /// [`edge_face`](Self::edge_face).
    pub fn add_face(&mut self, ring: &[usize]) -> Result<FaceId<I>> {
        self.require("add_face", &ASSEMBLY)?;

        let face = self.faces.len();
        if ring.len() < 3 {
            return Err(self.fail(MeshError::DegenerateFace {
                face,
                reason: "fewer than three vertices",
            }));
        }

        let mut ids = Vec::with_capacity(ring.len());
        for &vi in ring {
            ids.push(self.assembly_vertex(vi)?);
        }

        let mut sorted = ids.clone();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(self.fail(MeshError::DegenerateFace {
                face,
                reason: "repeated vertex",
            }));
        }

        let f = FaceId::new(face);
        let n = ids.len();

        // Check every pair before touching any state
        for k in 0..n {
            let key = unordered(ids[k], ids[(k + 1) % n]);
            if self.edge_face.contains_key(&key) {
                return Err(self.fail(MeshError::NonManifoldEdge {
                    v0: key.0.index(),
                    v1: key.1.index(),
                }));
            }
        }

        for k in 0..n {
            let (a, b) = (ids[k], ids[(k + 1) % n]);
            record_pair(&mut self.pair_owner, &mut self.edge_face, a, b, f)?;
            self.claim_edge(a, b, f);
            self.link_neighbours(a, b);
            self.vertices[a.index()].faces.push(f);
        }

        self.faces.push(Face::new(f, ids));
        self.nface += 1;
        Ok(f)
    }

    /// Refresh position, type and normal of an existing vertex.
    ///
    /// Once ordering has started this marks all derived geometry stale: the
    /// mesh drops back to `Ordering` until the next [`postprocess`](Self::postprocess).
    pub fn update(&mut self, p: &Particle) -> Result<()> {
        if matches!(self.state, MeshState::Empty | MeshState::Failed) {
            return Err(MeshError::InvalidState {
                operation: "update",
                state: self.state,
            });
        }

        let vertex = self
            .vertices
            .get_mut(p.id)
            .ok_or(MeshError::MissingVertex { id: p.id })?;
        vertex.position = p.position;
        vertex.kind = p.kind;
        vertex.surface_normal = p.normal;

        match self.state {
            MeshState::Ordering => self.epoch += 1,
            MeshState::Geometry | MeshState::Ready => {
                self.epoch += 1;
                self.state = MeshState::Ordering;
            }
            _ => {}
        }
        Ok(())
    }

    // ==================== Helpers ====================

    fn assembly_vertex(&mut self, id: usize) -> Result<VertexId<I>> {
        if id < self.vertices.len() {
            Ok(VertexId::new(id))
        } else {
            Err(self.fail(MeshError::MissingVertex { id }))
        }
    }

    pub(crate) fn push_edge(&mut self, a: VertexId<I>, b: VertexId<I>) -> EdgeId<I> {
        let e = EdgeId::new(self.edges.len());
        self.edges.push(Edge::new(e, a, b));
        self.edge_map.insert((a, b), e);
        self.nedge += 1;
        e
    }

    /// Give `a → b` to face `f`, falling back to `b → a` when another face
    /// already owns the forward direction.
    fn claim_edge(&mut self, a: VertexId<I>, b: VertexId<I>, f: FaceId<I>) {
        match self.edge_map.get(&(a, b)).copied() {
            Some(e) if !self.edges[e.index()].is_owned() => self.edges[e.index()].face = f,
            Some(_) => match self.edge_map.get(&(b, a)).copied() {
                Some(r) if !self.edges[r.index()].is_owned() => self.edges[r.index()].face = f,
                // Both directions taken; resolved once the rings are ordered
                Some(_) => {}
                None => {
                    let r = self.push_edge(b, a);
                    self.edges[r.index()].face = f;
                }
            },
            None => {
                let e = self.push_edge(a, b);
                self.edges[e.index()].face = f;
            }
        }
    }

    pub(crate) fn link_neighbours(&mut self, a: VertexId<I>, b: VertexId<I>) {
        if !self.vertices[a.index()].neighbours.contains(&b) {
            self.vertices[a.index()].neighbours.push(b);
        }
        if !self.vertices[b.index()].neighbours.contains(&a) {
            self.vertices[b.index()].neighbours.push(a);
        }
    }
}

/// Note that face `f` borders the pair `{a, b}`.
pub(crate) fn record_pair<I: MeshIndex>(
    owners: &mut HashMap<(VertexId<I>, VertexId<I>), FaceId<I>>,
    edge_face: &mut BTreeMap<(VertexId<I>, VertexId<I>), (FaceId<I>, FaceId<I>)>,
    a: VertexId<I>,
    b: VertexId<I>,
    f: FaceId<I>,
) -> Result<()> {
    let key = unordered(a, b);
    match owners.get(&key).copied() {
        Some(g) if g != f => {
            if edge_face.contains_key(&key) {
                return Err(MeshError::NonManifoldEdge {
                    v0: key.0.index(),
                    v1: key.1.index(),
                });
            }
            edge_face.insert(key, (g, f));
        }
        Some(_) => {}
        None => {
            owners.insert(key, f);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Mesh<u32> {
        let mut mesh = Mesh::new();
        mesh.add_vertex(0, 0.0, 0.0, 0.0).unwrap();
        mesh.add_vertex(1, 1.0, 0.0, 0.0).unwrap();
        mesh.add_vertex(2, 1.0, 1.0, 0.0).unwrap();
        mesh.add_vertex(3, 0.0, 1.0, 0.0).unwrap();
        mesh
    }

    #[test]
    fn test_single_face_counts() {
        let mut mesh = square();
        mesh.add_face(&[0, 1, 2, 3]).unwrap();

        assert_eq!(mesh.size(), 4);
        assert_eq!(mesh.nedges(), 4);
        assert_eq!(mesh.nfaces(), 1);
        assert!(mesh.edge_face().is_empty());
        assert!(mesh.edges().iter().all(|e| e.face.index() == 0));
        assert!(mesh.is_valid());
    }

    #[test]
    fn test_shared_pair_recorded() {
        let mut mesh = square();
        mesh.add_face(&[0, 1, 2]).unwrap();
        mesh.add_face(&[0, 2, 3]).unwrap();

        assert_eq!(mesh.nfaces(), 2);
        // 2→0 belongs to the first face, the second gets 0→2
        assert_eq!(mesh.nedges(), 6);
        let shared = mesh.adjoining_faces(VertexId::new(2), VertexId::new(0));
        assert_eq!(shared, Some((FaceId::new(0), FaceId::new(1))));
        assert_eq!(mesh.edge_face().len(), 1);
        assert_eq!(mesh.vertex(VertexId::new(0)).faces.len(), 2);
    }

    #[test]
    fn test_duplicate_edge() {
        let mut mesh = square();
        mesh.add_edge(0, 1).unwrap();
        let err = mesh.add_edge(0, 1).unwrap_err();

        assert_eq!(err, MeshError::DuplicateEdge { from: 0, to: 1 });
        assert_eq!(mesh.state(), MeshState::Failed);
        assert!(mesh.add_edge(1, 0).is_err());
        assert!(mesh.postprocess().is_err());
        assert_ne!(mesh.state(), MeshState::Ready);
    }

    #[test]
    fn test_reverse_edge_is_not_duplicate() {
        let mut mesh = square();
        mesh.add_edge(0, 1).unwrap();
        mesh.add_edge(1, 0).unwrap();
        assert_eq!(mesh.nedges(), 2);
        assert_eq!(mesh.state(), MeshState::Assembling);
    }

    #[test]
    fn test_vertex_ids_must_be_contiguous() {
        let mut mesh = Mesh::<u32>::new();
        mesh.add_vertex(0, 0.0, 0.0, 0.0).unwrap();
        assert_eq!(
            mesh.add_vertex(0, 0.0, 0.0, 0.0),
            Err(MeshError::DuplicateVertex { id: 0 })
        );

        let mut mesh = Mesh::<u32>::new();
        assert_eq!(
            mesh.add_vertex(2, 0.0, 0.0, 0.0),
            Err(MeshError::NonContiguousVertex { id: 2, expected: 0 })
        );
        assert_eq!(mesh.state(), MeshState::Failed);
    }

    #[test]
    fn test_missing_vertex() {
        let mut mesh = square();
        let err = mesh.add_face(&[0, 1, 7]).unwrap_err();
        assert_eq!(err, MeshError::MissingVertex { id: 7 });
        assert_eq!(mesh.nfaces(), 0);
    }

    #[test]
    fn test_degenerate_rings() {
        let mut mesh = square();
        assert!(matches!(
            mesh.add_face(&[0, 1]),
            Err(MeshError::DegenerateFace { .. })
        ));

        let mut mesh = square();
        assert!(matches!(
            mesh.add_face(&[0, 1, 0, 3]),
            Err(MeshError::DegenerateFace { .. })
        ));
    }

    #[test]
    fn test_third_face_on_pair_is_non_manifold() {
        let mut mesh = Mesh::<u32>::new();
        for (i, p) in [[0.0, 0.0], [1.0, 0.0], [0.5, 1.0], [0.5, -1.0], [0.5, 0.5]]
            .iter()
            .enumerate()
        {
            mesh.add_vertex(i, p[0], p[1], 0.0).unwrap();
        }
        mesh.add_face(&[0, 1, 2]).unwrap();
        mesh.add_face(&[1, 0, 3]).unwrap();
        let err = mesh.add_face(&[0, 1, 4]).unwrap_err();
        assert_eq!(err, MeshError::NonManifoldEdge { v0: 0, v1: 1 });
    }

    #[test]
    fn test_update_marks_geometry_stale() {
        let mut mesh = square();
        mesh.add_face(&[0, 1, 2, 3]).unwrap();
        mesh.postprocess().unwrap();
        assert_eq!(mesh.state(), MeshState::Ready);

        mesh.update(&Particle::new(2, 1.0, 1.5, 0.0).with_kind(2)).unwrap();
        assert_eq!(mesh.state(), MeshState::Ordering);
        assert_eq!(mesh.vertex(VertexId::new(2)).kind, 2);
        assert!(mesh.add_vertex(4, 0.0, 0.0, 0.0).is_err());
        assert!(mesh.update(&Particle::new(9, 0.0, 0.0, 0.0)).is_err());
    }
}
