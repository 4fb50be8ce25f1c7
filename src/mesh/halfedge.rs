//! Half-edge cell mesh data structure.
//!
//! The mesh is rebuilt over a particle snapshot once per simulation step. Each
//! particle becomes a [`Vertex`]; faces are supplied as vertex rings (ordered
//! or not) and every face boundary is stored as a cycle of directed [`Edge`]s.
//!
//! # Structure
//!
//! - Each directed edge knows its **twin** (the reverse edge, if registered),
//!   its owning **face**, and the **next**/**prev** edges around that face.
//! - Each vertex stores one outgoing edge, its incident faces and its
//!   neighbouring vertices. After [`Mesh::postprocess`] both lists are in
//!   star order (counter-clockwise about the outward normal).
//! - Each face stores its vertex ring, the matching edge ids, its centroid and
//!   its outward normal.
//!
//! # Lifecycle
//!
//! See [`MeshState`]. Assembly operations live in `assembly.rs`, the ordering
//! engine in `order.rs` and the dual geometry in `dual.rs`.

use std::collections::{BTreeMap, HashMap};

use nalgebra::{Point3, Vector3};

use super::index::{EdgeId, FaceId, MeshIndex, VertexId};
use super::options::MeshOptions;
use crate::error::{Diagnostic, MeshError, Result};

/// A particle as handed over by the simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    /// Particle id; becomes the vertex id.
    pub id: usize,
    /// Position.
    pub position: Point3<f64>,
    /// Particle type (1-based, as in simulation input files).
    pub kind: u32,
    /// Surface normal at the particle, when the manifold constraint provides one.
    pub normal: Option<Vector3<f64>>,
}

impl Particle {
    /// Create a type-1 particle without a surface normal.
    pub fn new(id: usize, x: f64, y: f64, z: f64) -> Self {
        Self {
            id,
            position: Point3::new(x, y, z),
            kind: 1,
            normal: None,
        }
    }

    /// Set the particle type.
    pub fn with_kind(mut self, kind: u32) -> Self {
        self.kind = kind;
        self
    }

    /// Attach the surface normal supplied by the constraint.
    pub fn with_normal(mut self, normal: Vector3<f64>) -> Self {
        self.normal = Some(normal);
        self
    }
}

/// A vertex of the cell mesh.
#[derive(Debug, Clone)]
pub struct Vertex<I: MeshIndex = u32> {
    /// Vertex id (equal to the particle id).
    pub id: VertexId<I>,

    /// Position of the particle.
    pub position: Point3<f64>,

    /// Particle type.
    pub kind: u32,

    /// Surface normal supplied with the particle, if any.
    pub surface_normal: Option<Vector3<f64>>,

    /// Normal used for the last star ordering.
    pub normal: Vector3<f64>,

    /// One outgoing edge. A boundary edge when the vertex is on the boundary.
    pub edge: EdgeId<I>,

    /// Incident faces (star order once ordered).
    pub faces: Vec<FaceId<I>>,

    /// Neighbouring vertices (star order once ordered).
    pub neighbours: Vec<VertexId<I>>,

    /// Whether the star is an open fan.
    pub boundary: bool,

    /// Geometry epoch at which the star was last ordered.
    pub(crate) star_epoch: Option<u64>,
}

impl<I: MeshIndex> Vertex<I> {
    /// Create a new vertex at the given position.
    pub fn new(id: VertexId<I>, position: Point3<f64>) -> Self {
        Self {
            id,
            position,
            kind: 1,
            surface_normal: None,
            normal: Vector3::zeros(),
            edge: EdgeId::invalid(),
            faces: Vec::new(),
            neighbours: Vec::new(),
            boundary: false,
            star_epoch: None,
        }
    }

    /// Create a vertex from a particle.
    pub fn from_particle(p: &Particle) -> Self {
        Self {
            kind: p.kind,
            surface_normal: p.normal,
            ..Self::new(VertexId::new(p.id), p.position)
        }
    }

    /// Number of incident faces.
    #[inline]
    pub fn valence(&self) -> usize {
        self.faces.len()
    }
}

/// A directed edge.
#[derive(Debug, Clone, Copy)]
pub struct Edge<I: MeshIndex = u32> {
    /// Edge id.
    pub id: EdgeId<I>,

    /// Origin vertex.
    pub from: VertexId<I>,

    /// Destination vertex.
    pub to: VertexId<I>,

    /// The reverse edge. Invalid when the reverse pair is not registered.
    pub twin: EdgeId<I>,

    /// The face this edge bounds. Invalid for unowned edges.
    pub face: FaceId<I>,

    /// Next edge around the owning face.
    pub next: EdgeId<I>,

    /// Previous edge around the owning face.
    pub prev: EdgeId<I>,

    /// Whether exactly one side of this edge carries a face.
    pub boundary: bool,

    /// Registered through `add_edge` rather than created by a face.
    pub(crate) explicit: bool,
}

impl<I: MeshIndex> Edge<I> {
    /// Create an unresolved edge from `from` to `to`.
    pub fn new(id: EdgeId<I>, from: VertexId<I>, to: VertexId<I>) -> Self {
        Self {
            id,
            from,
            to,
            twin: EdgeId::invalid(),
            face: FaceId::invalid(),
            next: EdgeId::invalid(),
            prev: EdgeId::invalid(),
            boundary: false,
            explicit: false,
        }
    }

    /// Whether a face owns this edge.
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.face.is_valid()
    }
}

/// A face of the cell mesh.
#[derive(Debug, Clone)]
pub struct Face<I: MeshIndex = u32> {
    /// Face id.
    pub id: FaceId<I>,

    /// Vertex ring. Counter-clockwise about `normal` once ordered.
    pub vertices: Vec<VertexId<I>>,

    /// Edge ids matching consecutive ring pairs, filled by link resolution.
    pub edges: Vec<EdgeId<I>>,

    /// Centroid of the ordered ring.
    pub centre: Point3<f64>,

    /// Outward unit normal estimated while ordering.
    pub normal: Vector3<f64>,

    /// Whether the ring has been ordered.
    pub ordered: bool,

    /// Geometry epoch at which the centre was last computed.
    pub(crate) centre_epoch: Option<u64>,
}

impl<I: MeshIndex> Face<I> {
    /// Create an unordered face over a vertex ring.
    pub fn new(id: FaceId<I>, vertices: Vec<VertexId<I>>) -> Self {
        Self {
            id,
            vertices,
            edges: Vec::new(),
            centre: Point3::origin(),
            normal: Vector3::zeros(),
            ordered: false,
            centre_epoch: None,
        }
    }

    /// Number of vertices in the ring.
    #[inline]
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Whether the ring is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

/// Lifecycle of one rebuild cycle.
///
/// `Empty → Assembling → Ordering → Geometry → Ready`. A fatal assembly error
/// moves the mesh to `Failed`; only [`Mesh::reset`] leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshState {
    /// Nothing added since the last reset.
    Empty,
    /// Vertices, edges and faces are being added.
    Assembling,
    /// Topology is closed; faces are being ordered.
    Ordering,
    /// Centroids, links and stars are being derived.
    Geometry,
    /// Fully post-processed; read-only until the next reset.
    Ready,
    /// A structural error aborted this rebuild.
    Failed,
}

/// The cell mesh over one particle snapshot.
#[derive(Debug, Clone)]
pub struct Mesh<I: MeshIndex = u32> {
    pub(crate) vertices: Vec<Vertex<I>>,
    pub(crate) edges: Vec<Edge<I>>,
    pub(crate) faces: Vec<Face<I>>,

    /// Directed vertex pair to edge id.
    pub(crate) edge_map: HashMap<(VertexId<I>, VertexId<I>), EdgeId<I>>,

    /// First face seen on each unordered vertex pair.
    pub(crate) pair_owner: HashMap<(VertexId<I>, VertexId<I>), FaceId<I>>,

    /// Unordered vertex pair to the two faces sharing it.
    pub(crate) edge_face: BTreeMap<(VertexId<I>, VertexId<I>), (FaceId<I>, FaceId<I>)>,

    pub(crate) size: usize,
    pub(crate) nedge: usize,
    pub(crate) nface: usize,

    pub(crate) state: MeshState,
    pub(crate) options: MeshOptions,
    pub(crate) diagnostics: Vec<Diagnostic<I>>,

    /// Mesh centroid captured when ordering begins; orients face normals.
    pub(crate) reference: Option<Point3<f64>>,

    /// Bumped whenever positions change after assembly.
    pub(crate) epoch: u64,

    /// Bumped on every reset.
    pub(crate) generation: u64,
}

impl<I: MeshIndex> Default for Mesh<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: MeshIndex> Mesh<I> {
    /// Create a new empty mesh with default options.
    pub fn new() -> Self {
        Self::with_options(MeshOptions::default())
    }

    /// Create a new empty mesh with the given options.
    pub fn with_options(options: MeshOptions) -> Self {
        Self {
            vertices: Vec::new(),
            edges: Vec::new(),
            faces: Vec::new(),
            edge_map: HashMap::new(),
            pair_owner: HashMap::new(),
            edge_face: BTreeMap::new(),
            size: 0,
            nedge: 0,
            nface: 0,
            state: MeshState::Empty,
            options,
            diagnostics: Vec::new(),
            reference: None,
            epoch: 0,
            generation: 0,
        }
    }

    /// Clear all topology and geometry, returning to [`MeshState::Empty`].
    pub fn reset(&mut self) {
        self.vertices.clear();
        self.edges.clear();
        self.faces.clear();
        self.edge_map.clear();
        self.pair_owner.clear();
        self.edge_face.clear();
        self.size = 0;
        self.nedge = 0;
        self.nface = 0;
        self.state = MeshState::Empty;
        self.diagnostics.clear();
        self.reference = None;
        self.epoch = 0;
        self.generation += 1;
        log::trace!("mesh reset (generation {})", self.generation);
    }

    // ==================== Accessors ====================

    /// Number of vertices.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of directed edges.
    #[inline]
    pub fn nedges(&self) -> usize {
        self.nedge
    }

    /// Number of faces.
    #[inline]
    pub fn nfaces(&self) -> usize {
        self.nface
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> MeshState {
        self.state
    }

    /// Rebuild counter, bumped by every [`reset`](Self::reset).
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Options the mesh was created with.
    #[inline]
    pub fn options(&self) -> &MeshOptions {
        &self.options
    }

    /// Replace the options. Takes effect at the next ordering pass.
    pub fn set_options(&mut self, options: MeshOptions) {
        self.options = options;
    }

    /// Non-fatal conditions recorded by the last [`postprocess`](Self::postprocess).
    #[inline]
    pub fn diagnostics(&self) -> &[Diagnostic<I>] {
        &self.diagnostics
    }

    /// All vertices, indexed by vertex id.
    #[inline]
    pub fn vertices(&self) -> &[Vertex<I>] {
        &self.vertices
    }

    /// All directed edges, indexed by edge id.
    #[inline]
    pub fn edges(&self) -> &[Edge<I>] {
        &self.edges
    }

    /// All faces, indexed by face id.
    #[inline]
    pub fn faces(&self) -> &[Face<I>] {
        &self.faces
    }

    /// Unordered vertex pairs shared by two faces, with the adjoining face ids.
    ///
    /// Keys are `(min, max)` vertex pairs.
    #[inline]
    pub fn edge_face(&self) -> &BTreeMap<(VertexId<I>, VertexId<I>), (FaceId<I>, FaceId<I>)> {
        &self.edge_face
    }

    /// Get a vertex by ID.
    #[inline]
    pub fn vertex(&self, id: VertexId<I>) -> &Vertex<I> {
        &self.vertices[id.index()]
    }

    /// Get an edge by ID.
    #[inline]
    pub fn edge(&self, id: EdgeId<I>) -> &Edge<I> {
        &self.edges[id.index()]
    }

    /// Get a face by ID.
    #[inline]
    pub fn face(&self, id: FaceId<I>) -> &Face<I> {
        &self.faces[id.index()]
    }

    /// Checked vertex lookup.
    pub fn try_vertex(&self, id: VertexId<I>) -> Result<&Vertex<I>> {
        self.vertices
            .get(id.index())
            .filter(|_| id.is_valid())
            .ok_or(MeshError::MissingVertex { id: id.index() })
    }

    /// Checked face lookup.
    pub fn try_face(&self, id: FaceId<I>) -> Result<&Face<I>> {
        self.faces
            .get(id.index())
            .filter(|_| id.is_valid())
            .ok_or(MeshError::MissingFace { id: id.index() })
    }

    /// Look up the directed edge `from → to`.
    pub fn find_edge(&self, from: VertexId<I>, to: VertexId<I>) -> Option<EdgeId<I>> {
        self.edge_map.get(&(from, to)).copied()
    }

    /// The two faces sharing the pair `{a, b}`, if any.
    pub fn adjoining_faces(&self, a: VertexId<I>, b: VertexId<I>) -> Option<(FaceId<I>, FaceId<I>)> {
        self.edge_face.get(&unordered(a, b)).copied()
    }

    /// Get the position of a vertex.
    #[inline]
    pub fn position(&self, v: VertexId<I>) -> &Point3<f64> {
        &self.vertex(v).position
    }

    // ==================== Iteration ====================

    /// Iterate over all vertex IDs.
    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId<I>> + '_ {
        (0..self.vertices.len()).map(VertexId::new)
    }

    /// Iterate over all edge IDs.
    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId<I>> + '_ {
        (0..self.edges.len()).map(EdgeId::new)
    }

    /// Iterate over all face IDs.
    pub fn face_ids(&self) -> impl Iterator<Item = FaceId<I>> + '_ {
        (0..self.faces.len()).map(FaceId::new)
    }

    /// Iterate over the edges of a face by walking `next` links.
    ///
    /// Empty until links have been resolved.
    pub fn face_edges(&self, f: FaceId<I>) -> FaceEdgeIter<'_, I> {
        FaceEdgeIter::new(self, f)
    }

    /// Faces incident to a vertex, in star order once ordered.
    pub fn vertex_faces(&self, v: VertexId<I>) -> impl Iterator<Item = FaceId<I>> + '_ {
        self.vertex(v).faces.iter().copied()
    }

    /// Neighbours of a vertex, in star order once ordered.
    pub fn vertex_neighbours(&self, v: VertexId<I>) -> impl Iterator<Item = VertexId<I>> + '_ {
        self.vertex(v).neighbours.iter().copied()
    }

    // ==================== Geometry ====================

    /// Length of an edge.
    pub fn edge_length(&self, e: EdgeId<I>) -> f64 {
        self.edge_vector(e).norm()
    }

    /// Edge vector from origin to destination.
    pub fn edge_vector(&self, e: EdgeId<I>) -> Vector3<f64> {
        let edge = self.edge(e);
        self.position(edge.to) - self.position(edge.from)
    }

    /// Outward normal estimated when the face was ordered.
    pub fn face_normal(&self, f: FaceId<I>) -> Vector3<f64> {
        self.face(f).normal
    }

    /// Area of a face, projected along its normal.
    pub fn face_area(&self, f: FaceId<I>) -> f64 {
        let face = self.face(f);
        let points: Vec<Point3<f64>> = face.vertices.iter().map(|&v| *self.position(v)).collect();
        polygon_area(&points, &face.normal)
    }

    /// Perimeter of a face ring.
    pub fn face_perimeter(&self, f: FaceId<I>) -> f64 {
        let points: Vec<Point3<f64>> = self
            .face(f)
            .vertices
            .iter()
            .map(|&v| *self.position(v))
            .collect();
        polygon_perimeter(&points)
    }

    /// Mean position of all vertices.
    pub fn centroid(&self) -> Option<Point3<f64>> {
        if self.vertices.is_empty() {
            return None;
        }
        let sum: Vector3<f64> = self.vertices.iter().map(|v| v.position.coords).sum();
        Some(Point3::from(sum / self.vertices.len() as f64))
    }

    // ==================== Validation ====================

    /// Check that connectivity and cached counts are consistent.
    pub fn is_valid(&self) -> bool {
        if self.size != self.vertices.len()
            || self.nedge != self.edges.len()
            || self.nface != self.faces.len()
        {
            return false;
        }

        for (i, v) in self.vertices.iter().enumerate() {
            if v.id.index() != i {
                return false;
            }
            if v.edge.is_valid() && self.edges[v.edge.index()].from != v.id {
                return false;
            }
        }

        for (i, e) in self.edges.iter().enumerate() {
            let eid = EdgeId::new(i);
            if e.id != eid || self.edge_map.get(&(e.from, e.to)) != Some(&eid) {
                return false;
            }

            // Twin consistency
            if e.twin.is_valid() {
                let twin = &self.edges[e.twin.index()];
                if twin.twin != eid || twin.from != e.to || twin.to != e.from {
                    return false;
                }
            }

            // Next/prev consistency
            if e.next.is_valid() && self.edges[e.next.index()].prev != eid {
                return false;
            }
            if e.prev.is_valid() && self.edges[e.prev.index()].next != eid {
                return false;
            }
        }

        // Face edges must be owned by the face and follow the ring
        for (i, f) in self.faces.iter().enumerate() {
            if f.vertices.len() < 3 {
                return false;
            }
            if f.edges.is_empty() {
                continue;
            }
            if f.edges.len() != f.vertices.len() {
                return false;
            }
            for (k, &e) in f.edges.iter().enumerate() {
                let edge = &self.edges[e.index()];
                if edge.face.index() != i || edge.from != f.vertices[k] {
                    return false;
                }
            }
        }

        true
    }

    // ==================== Lifecycle helpers ====================

    pub(crate) fn require(&self, operation: &'static str, allowed: &[MeshState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(MeshError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Record a fatal error: the rebuild is aborted until the next reset.
    pub(crate) fn fail(&mut self, err: MeshError) -> MeshError {
        if err.is_structural() {
            log::error!("mesh rebuild aborted: {}", err);
            self.state = MeshState::Failed;
        }
        err
    }
}

/// Key for an unordered vertex pair.
#[inline]
pub(crate) fn unordered<I: MeshIndex>(a: VertexId<I>, b: VertexId<I>) -> (VertexId<I>, VertexId<I>) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Area of a closed polygon projected along `normal`.
pub(crate) fn polygon_area(points: &[Point3<f64>], normal: &Vector3<f64>) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let origin = points[0];
    let n = points.len();
    let mut twice = 0.0;
    for k in 0..n {
        let a = points[k] - origin;
        let b = points[(k + 1) % n] - origin;
        twice += a.cross(&b).dot(normal);
    }
    0.5 * twice.abs()
}

/// Perimeter of a closed polygon.
pub(crate) fn polygon_perimeter(points: &[Point3<f64>]) -> f64 {
    let n = points.len();
    if n < 2 {
        return 0.0;
    }
    (0..n).map(|k| (points[(k + 1) % n] - points[k]).norm()).sum()
}

/// Iterator over the edges of a face.
pub struct FaceEdgeIter<'a, I: MeshIndex = u32> {
    mesh: &'a Mesh<I>,
    start: EdgeId<I>,
    current: EdgeId<I>,
    done: bool,
}

impl<'a, I: MeshIndex> FaceEdgeIter<'a, I> {
    fn new(mesh: &'a Mesh<I>, f: FaceId<I>) -> Self {
        let start = mesh.face(f).edges.first().copied().unwrap_or_default();
        Self {
            mesh,
            start,
            current: start,
            done: !start.is_valid(),
        }
    }
}

impl<'a, I: MeshIndex> Iterator for FaceEdgeIter<'a, I> {
    type Item = EdgeId<I>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let result = self.current;
        self.current = self.mesh.edge(self.current).next;

        if !self.current.is_valid() || self.current == self.start {
            self.done = true;
        }

        Some(result)
    }
}
