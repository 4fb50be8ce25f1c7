//! Ordering engine.
//!
//! Face rings and vertex stars are sorted by signed angle in a tangent plane,
//! counter-clockwise when viewed from the outward side of the surface. Angles
//! closer than [`MeshOptions::angle_tolerance`](super::MeshOptions) are
//! ordered by ascending id, so the result does not depend on input order.
//!
//! [`Mesh::postprocess`] runs the whole pipeline:
//!
//! 1. order every face
//! 2. flip rings so that neighbouring faces agree across shared edges
//! 3. compute every face centroid
//! 4. resolve twin/next/prev links against the ordered rings
//! 5. order every vertex star
//!
//! Stages 1, 3 and 5 are independent per entity and run on the rayon pool
//! when [`MeshOptions::parallel`](super::MeshOptions) is set.
//!
//! Stage 2 walks each connected component breadth-first. A component is
//! then turned as a whole: by supplied particle normals when present, else
//! outward for closed surfaces and towards the dominant axis for open sheets.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::f64::consts::TAU;

use nalgebra::{Matrix3, Point3, SymmetricEigen, Vector3};
use rayon::prelude::*;

use super::assembly::record_pair;
use super::halfedge::{polygon_area, unordered, Edge, Mesh, MeshState, Vertex};
use super::index::{EdgeId, FaceId, MeshIndex, VertexId};
use crate::error::{Diagnostic, MeshError, Result, TieSite};

/// Relative threshold below which a face offset cannot orient its normal.
const ORIENT_EPS: f64 = 1e-9;

/// Smallest norm accepted when normalising a summed normal.
const NORMAL_EPS: f64 = 1e-12;

/// States in which ordering operations are allowed.
const ORDERING: [MeshState; 4] = [
    MeshState::Assembling,
    MeshState::Ordering,
    MeshState::Geometry,
    MeshState::Ready,
];

/// Ring order computed for one face.
#[derive(Debug, Clone)]
pub(crate) struct FaceOrdering<I: MeshIndex> {
    ring: Vec<VertexId<I>>,
    normal: Vector3<f64>,
    supplied: bool,
    ties: Vec<(usize, usize)>,
}

/// Star order computed for one vertex.
#[derive(Debug, Clone)]
pub(crate) struct StarOrdering<I: MeshIndex> {
    faces: Vec<FaceId<I>>,
    neighbours: Vec<VertexId<I>>,
    normal: Vector3<f64>,
    open: bool,
    ties: Vec<(usize, usize)>,
}

/// Entries sorted by angle, ties resolved.
#[derive(Debug, Clone, Default)]
struct AngularOrder {
    ids: Vec<usize>,
    angles: Vec<f64>,
    ties: Vec<(usize, usize)>,
}

impl AngularOrder {
    /// Rotate so that entry `start` comes first.
    fn rotate(&mut self, start: usize) {
        if start < self.ids.len() {
            self.ids.rotate_left(start);
            self.angles.rotate_left(start);
        }
    }

    /// Index of the smallest id.
    fn min_id_position(&self) -> usize {
        self.ids
            .iter()
            .enumerate()
            .min_by_key(|&(_, id)| *id)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Index of the entry that follows the widest angular gap.
    fn after_widest_gap(&self) -> usize {
        let n = self.angles.len();
        let mut best = (0, f64::NEG_INFINITY);
        for i in 0..n {
            let next = if i + 1 < n {
                self.angles[i + 1]
            } else {
                self.angles[0] + TAU
            };
            let gap = next - self.angles[i];
            if gap > best.1 {
                best = (i, gap);
            }
        }
        if n == 0 {
            0
        } else {
            (best.0 + 1) % n
        }
    }
}

/// Orthonormal tangent basis `(u, w)` with `u × w = normal`.
fn tangent_basis(normal: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    // Axis least aligned with the normal
    let (ax, ay, az) = (normal.x.abs(), normal.y.abs(), normal.z.abs());
    let axis = if ax <= ay && ax <= az {
        Vector3::x()
    } else if ay <= az {
        Vector3::y()
    } else {
        Vector3::z()
    };
    let u = (axis - normal * normal.dot(&axis)).normalize();
    let w = normal.cross(&u);
    (u, w)
}

/// Sort `(id, offset)` entries counter-clockwise about `normal`.
fn angular_order(entries: &[(usize, Vector3<f64>)], normal: &Vector3<f64>, tolerance: f64) -> AngularOrder {
    let n = entries.len();
    if n == 0 {
        return AngularOrder::default();
    }

    let (u, w) = tangent_basis(normal);
    let mut items: Vec<(f64, usize)> = entries
        .iter()
        .map(|(id, d)| (d.dot(&w).atan2(d.dot(&u)), *id))
        .collect();
    items.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    // Angles just below +π coincide with angles just above -π
    let first = items[0].0;
    let wrapped = items
        .iter()
        .rev()
        .take(n - 1)
        .take_while(|(a, _)| a - TAU >= first - tolerance)
        .count();
    if wrapped > 0 {
        for item in items[n - wrapped..].iter_mut() {
            item.0 -= TAU;
        }
        items.rotate_right(wrapped);
    }

    let mut ties = Vec::new();
    let mut start = 0;
    for i in 1..=n {
        if i == n || items[i].0 - items[i - 1].0 > tolerance {
            if i - start > 1 {
                items[start..i].sort_by_key(|&(_, id)| id);
                for pair in items[start..i].windows(2) {
                    ties.push((pair[0].1, pair[1].1));
                }
            }
            start = i;
        }
    }

    AngularOrder {
        ids: items.iter().map(|&(_, id)| id).collect(),
        angles: items.iter().map(|&(a, _)| a).collect(),
        ties,
    }
}

impl<I: MeshIndex> Mesh<I> {
    /// Order the vertex ring of a face counter-clockwise about its outward normal.
    ///
    /// The ring is rotated so that its smallest vertex id comes first. The
    /// first call closes assembly.
    pub fn order_face(&mut self, f: FaceId<I>) -> Result<()> {
        self.require("order_face", &ORDERING)?;
        self.try_face(f)?;
        self.begin_ordering();

        let ordering = self.face_ordering(f)?;
        self.diagnostics.retain(|d| {
            !matches!(d, Diagnostic::OrderingAmbiguity { site: TieSite::Face(g), .. } if *g == f)
        });
        if self.apply_face_ordering(f, ordering)
            && matches!(self.state, MeshState::Geometry | MeshState::Ready)
        {
            self.state = MeshState::Ordering;
        }
        Ok(())
    }

    /// Order the incident faces and neighbours of a vertex.
    ///
    /// Requires the centroids of all incident faces.
    pub fn order_star(&mut self, v: VertexId<I>) -> Result<()> {
        self.require("order_star", &[MeshState::Geometry, MeshState::Ready])?;
        let ordering = self.star_ordering(v)?;
        self.diagnostics.retain(|d| {
            !matches!(d, Diagnostic::OrderingAmbiguity { site: TieSite::Star(u), .. } if *u == v)
        });
        self.apply_star_ordering(v, ordering);
        Ok(())
    }

    /// Run face ordering, orientation, centroids, link resolution and star
    /// ordering in sequence.
    ///
    /// Idempotent: running it again on an unchanged mesh reproduces the same
    /// rings, centroids and stars.
    pub fn postprocess(&mut self) -> Result<()> {
        self.require("postprocess", &ORDERING)?;
        if self.faces.is_empty() {
            return Err(MeshError::EmptyMesh);
        }

        self.diagnostics.clear();
        self.reference = self.centroid();
        self.state = MeshState::Ordering;

        // 1. Faces
        let mut rings = self.map_entities(self.faces.len(), |i| self.face_ordering(FaceId::new(i)))?;

        // 2. Orientation
        let flips = self.consistent_flips(&rings);
        let flipped: Vec<usize> = (0..rings.len()).filter(|&i| flips[i]).collect();
        if !flipped.is_empty() {
            log::trace!("reversing {} of {} face rings", flipped.len(), rings.len());
            let reversed = self.map_entities(flipped.len(), |k| Ok(self.reversed(&rings[flipped[k]])))?;
            for (i, ordering) in flipped.into_iter().zip(reversed) {
                rings[i] = ordering;
            }
        }
        for (i, ordering) in rings.into_iter().enumerate() {
            self.apply_face_ordering(FaceId::new(i), ordering);
        }

        // 3. Centroids
        let centres = self.map_entities(self.faces.len(), |i| {
            Ok(self.ring_centre(&self.faces[i].vertices))
        })?;
        for (face, centre) in self.faces.iter_mut().zip(centres) {
            face.centre = centre;
            face.centre_epoch = Some(self.epoch);
        }
        self.state = MeshState::Geometry;

        // 4. Links
        self.resolve_links()?;

        // 5. Stars
        let stars = self.map_entities(self.vertices.len(), |i| self.star_ordering(VertexId::new(i)))?;
        for (i, star) in stars.into_iter().enumerate() {
            self.apply_star_ordering(VertexId::new(i), star);
        }

        let mut degenerate = 0;
        for v in &self.vertices {
            if v.faces.len() < 3 {
                log::trace!("degenerate star at {:?} ({} faces)", v.id, v.faces.len());
                self.diagnostics.push(Diagnostic::DegenerateStar {
                    vertex: v.id,
                    faces: v.faces.len(),
                });
                degenerate += 1;
            }
        }

        if degenerate > 0 {
            log::warn!("{} vertices have fewer than three faces; their dual cells are empty", degenerate);
        }

        self.state = MeshState::Ready;
        log::debug!(
            "mesh ready: {} vertices, {} edges, {} faces, {} diagnostics",
            self.size,
            self.nedge,
            self.nface,
            self.diagnostics.len()
        );
        Ok(())
    }

    // ==================== Per-entity computations ====================

    /// Compute the ordered ring of a face without modifying the mesh.
    pub(crate) fn face_ordering(&self, f: FaceId<I>) -> Result<FaceOrdering<I>> {
        let ring = &self.try_face(f)?.vertices;
        // Sums run in id order so the result does not depend on the input rotation
        let mut canonical = ring.clone();
        canonical.sort_unstable();
        let centre = self.ring_centre(&canonical);
        let (normal, supplied) = self.estimate_face_normal(&canonical, &centre);
        Ok(self.ring_along(ring, &centre, normal, supplied))
    }

    /// Same face ordered about the opposite normal.
    fn reversed(&self, ordering: &FaceOrdering<I>) -> FaceOrdering<I> {
        let mut canonical = ordering.ring.clone();
        canonical.sort_unstable();
        let centre = self.ring_centre(&canonical);
        self.ring_along(&ordering.ring, &centre, -ordering.normal, ordering.supplied)
    }

    fn ring_along(
        &self,
        ring: &[VertexId<I>],
        centre: &Point3<f64>,
        normal: Vector3<f64>,
        supplied: bool,
    ) -> FaceOrdering<I> {
        let entries: Vec<(usize, Vector3<f64>)> = ring
            .iter()
            .map(|&v| (v.index(), self.position(v) - centre))
            .collect();
        let mut order = angular_order(&entries, &normal, self.options.angle_tolerance);
        order.rotate(order.min_id_position());

        FaceOrdering {
            ring: order.ids.into_iter().map(VertexId::new).collect(),
            normal,
            supplied,
            ties: order.ties,
        }
    }

    /// Decide which face orderings to reverse so that every shared edge is
    /// walked in opposite directions by its two faces.
    ///
    /// Edges shared by more than two faces are skipped; link resolution
    /// reports them. A non-orientable component keeps its first assignment
    /// and fails later with [`MeshError::OrientationConflict`].
    fn consistent_flips(&self, rings: &[FaceOrdering<I>]) -> Vec<bool> {
        // Faces on each vertex pair, with whether the ring walks it upwards
        let mut sides: HashMap<(VertexId<I>, VertexId<I>), Vec<(usize, bool)>> = HashMap::new();
        for (f, ordering) in rings.iter().enumerate() {
            let ring = &ordering.ring;
            let n = ring.len();
            for k in 0..n {
                let (a, b) = (ring[k], ring[(k + 1) % n]);
                sides.entry(unordered(a, b)).or_default().push((f, a < b));
            }
        }

        let mut flip: Vec<Option<bool>> = vec![None; rings.len()];
        let mut queue = VecDeque::new();
        let mut conflicts = 0;
        for seed in 0..rings.len() {
            if flip[seed].is_some() {
                continue;
            }
            flip[seed] = Some(false);
            queue.push_back(seed);
            let mut component = Vec::new();
            let mut closed = true;

            while let Some(f) = queue.pop_front() {
                component.push(f);
                let flip_f = flip[f] == Some(true);
                let ring = &rings[f].ring;
                let n = ring.len();
                for k in 0..n {
                    let (a, b) = (ring[k], ring[(k + 1) % n]);
                    let shared = match sides.get(&unordered(a, b)) {
                        Some(shared) if shared.len() == 2 => shared,
                        Some(shared) => {
                            if shared.len() == 1 {
                                closed = false;
                            }
                            continue;
                        }
                        None => continue,
                    };
                    for &(g, upwards) in shared {
                        if g == f {
                            continue;
                        }
                        // Same direction on both sides means one of them turns
                        let want = flip_f ^ ((a < b) == upwards);
                        match flip[g] {
                            None => {
                                flip[g] = Some(want);
                                queue.push_back(g);
                            }
                            Some(have) if have != want => conflicts += 1,
                            Some(_) => {}
                        }
                    }
                }
            }

            if self.component_inverted(rings, &component, &flip, closed) {
                for &f in &component {
                    flip[f] = flip[f].map(|x| !x);
                }
            }
        }

        if conflicts > 0 {
            log::warn!("{} shared edges cannot be oriented consistently; surface is not orientable", conflicts);
        }
        flip.into_iter().map(|x| x == Some(true)).collect()
    }

    /// Whether a consistently oriented component faces the wrong way.
    fn component_inverted(
        &self,
        rings: &[FaceOrdering<I>],
        component: &[usize],
        flip: &[Option<bool>],
        closed: bool,
    ) -> bool {
        let supplied = component.iter().filter(|&&f| rings[f].supplied).count();
        if supplied > 0 {
            let against = component
                .iter()
                .filter(|&&f| rings[f].supplied && flip[f] == Some(true))
                .count();
            return 2 * against > supplied;
        }

        let mut canonical = Vec::with_capacity(component.len());
        for &f in component {
            let mut ring = rings[f].ring.clone();
            ring.sort_unstable();
            let centre = self.ring_centre(&ring);
            let normal = if flip[f] == Some(true) {
                -rings[f].normal
            } else {
                rings[f].normal
            };
            let points: Vec<Point3<f64>> = rings[f].ring.iter().map(|&v| *self.position(v)).collect();
            canonical.push((centre, normal, polygon_area(&points, &normal)));
        }
        let mean: Vector3<f64> =
            canonical.iter().map(|(c, _, _)| c.coords).sum::<Vector3<f64>>() / canonical.len().max(1) as f64;

        // Outward normals enclose a positive volume
        if closed {
            let mut volume = 0.0;
            let mut scale = 0.0;
            for (centre, normal, area) in &canonical {
                let offset = centre.coords - mean;
                volume += area * normal.dot(&offset);
                scale += area * offset.norm();
            }
            if volume.abs() > ORIENT_EPS * scale {
                return volume < 0.0;
            }
        }

        let net: Vector3<f64> = canonical.iter().map(|(_, n, area)| n * *area).sum();
        net.norm() > NORMAL_EPS && net[net.iamax()] < 0.0
    }

    /// Compute the star of a vertex without modifying the mesh.
    pub(crate) fn star_ordering(&self, v: VertexId<I>) -> Result<StarOrdering<I>> {
        let vertex = self.try_vertex(v)?;
        if vertex
            .faces
            .iter()
            .any(|&f| self.faces[f.index()].centre_epoch != Some(self.epoch))
        {
            return Err(MeshError::InvalidState {
                operation: "order_star",
                state: self.state,
            });
        }

        let normal = self.estimate_vertex_normal(vertex);
        let origin = vertex.position;
        let tolerance = self.options.angle_tolerance;

        let face_entries: Vec<(usize, Vector3<f64>)> = vertex
            .faces
            .iter()
            .map(|&f| (f.index(), self.faces[f.index()].centre - origin))
            .collect();
        let neighbour_entries: Vec<(usize, Vector3<f64>)> = vertex
            .neighbours
            .iter()
            .map(|&u| (u.index(), self.position(u) - origin))
            .collect();

        let mut faces = angular_order(&face_entries, &normal, tolerance);
        let mut neighbours = angular_order(&neighbour_entries, &normal, tolerance);

        let open = self.star_is_open(vertex);
        if open {
            faces.rotate(faces.after_widest_gap());
            neighbours.rotate(neighbours.after_widest_gap());
        } else {
            faces.rotate(faces.min_id_position());
            neighbours.rotate(neighbours.min_id_position());
        }

        let mut ties = faces.ties;
        ties.extend(neighbours.ties);

        Ok(StarOrdering {
            faces: faces.ids.into_iter().map(FaceId::new).collect(),
            neighbours: neighbours.ids.into_iter().map(VertexId::new).collect(),
            normal,
            open,
            ties,
        })
    }

    /// Arithmetic mean of the ring positions.
    pub(crate) fn ring_centre(&self, ring: &[VertexId<I>]) -> Point3<f64> {
        let sum: Vector3<f64> = ring.iter().map(|&v| self.position(v).coords).sum();
        Point3::from(sum / ring.len().max(1) as f64)
    }

    /// Outward normal of a face ring, and whether it came from particle normals.
    ///
    /// Mean of the particle normals when every vertex carries one, otherwise
    /// the least-variance axis of the ring.
    fn estimate_face_normal(&self, ring: &[VertexId<I>], centre: &Point3<f64>) -> (Vector3<f64>, bool) {
        if self.options.use_particle_normals {
            let supplied: Option<Vector3<f64>> =
                ring.iter().map(|&v| self.vertex(v).surface_normal).sum();
            if let Some(unit) = supplied.and_then(|n| n.try_normalize(NORMAL_EPS)) {
                return (unit, true);
            }
        }

        let mut covariance = Matrix3::<f64>::zeros();
        let mut radius: f64 = 0.0;
        for &v in ring {
            let d = self.position(v) - centre;
            covariance += d * d.transpose();
            radius = radius.max(d.norm());
        }
        let eigen = SymmetricEigen::new(covariance);
        let axis = eigen.eigenvectors.column(eigen.eigenvalues.imin()).into_owned();
        (self.orient_outward(axis, centre, radius), false)
    }

    /// Flip `normal` to point away from the mesh centroid.
    ///
    /// Only a per-face guess; `postprocess` reconciles neighbouring faces
    /// afterwards. When the face offset is (nearly) tangent, as on a flat sheet, or
    /// vanishes against the face size `radius`, the largest-magnitude
    /// component is made positive instead.
    fn orient_outward(&self, normal: Vector3<f64>, centre: &Point3<f64>, radius: f64) -> Vector3<f64> {
        let reference = self.reference.unwrap_or(*centre);
        let offset = centre - reference;
        let side = normal.dot(&offset);
        if side.abs() > ORIENT_EPS * offset.norm().max(radius) {
            return if side < 0.0 { -normal } else { normal };
        }
        if normal[normal.iamax()] < 0.0 {
            -normal
        } else {
            normal
        }
    }

    /// Tangent-plane normal at a vertex.
    fn estimate_vertex_normal(&self, vertex: &Vertex<I>) -> Vector3<f64> {
        if self.options.use_particle_normals {
            if let Some(unit) = vertex.surface_normal.and_then(|n| n.try_normalize(NORMAL_EPS)) {
                return unit;
            }
        }
        let mut faces = vertex.faces.clone();
        faces.sort_unstable();
        let sum: Vector3<f64> = faces.iter().map(|&f| self.faces[f.index()].normal).sum();
        sum.try_normalize(NORMAL_EPS).unwrap_or_else(Vector3::z)
    }

    /// A star is open when some neighbour across a face edge is reached
    /// through only one incident face.
    fn star_is_open(&self, vertex: &Vertex<I>) -> bool {
        let mut seen: BTreeMap<VertexId<I>, usize> = BTreeMap::new();
        for &f in &vertex.faces {
            let ring = &self.faces[f.index()].vertices;
            let n = ring.len();
            if let Some(k) = ring.iter().position(|&u| u == vertex.id) {
                *seen.entry(ring[(k + 1) % n]).or_default() += 1;
                *seen.entry(ring[(k + n - 1) % n]).or_default() += 1;
            }
        }
        seen.values().any(|&count| count < 2)
    }

    // ==================== Application ====================

    /// Close assembly on the first ordering call.
    fn begin_ordering(&mut self) {
        if self.state == MeshState::Assembling {
            self.reference = self.centroid();
            self.state = MeshState::Ordering;
            log::debug!(
                "assembly closed: {} vertices, {} edges, {} faces",
                self.size,
                self.nedge,
                self.nface
            );
        }
    }

    /// Store a face ordering. Returns whether the ring changed.
    fn apply_face_ordering(&mut self, f: FaceId<I>, ordering: FaceOrdering<I>) -> bool {
        for (first, second) in ordering.ties {
            log::debug!("angular tie in {:?}: {} before {}", f, first, second);
            self.diagnostics.push(Diagnostic::OrderingAmbiguity {
                site: TieSite::Face(f),
                first,
                second,
            });
        }

        let face = &mut self.faces[f.index()];
        face.normal = ordering.normal;
        face.ordered = true;
        if face.vertices == ordering.ring {
            return false;
        }
        face.vertices = ordering.ring;
        face.edges.clear();
        face.centre_epoch = None;
        true
    }

    fn apply_star_ordering(&mut self, v: VertexId<I>, ordering: StarOrdering<I>) {
        for (first, second) in ordering.ties {
            log::debug!("angular tie in star of {:?}: {} before {}", v, first, second);
            self.diagnostics.push(Diagnostic::OrderingAmbiguity {
                site: TieSite::Star(v),
                first,
                second,
            });
        }

        let epoch = self.epoch;
        let vertex = &mut self.vertices[v.index()];
        vertex.faces = ordering.faces;
        vertex.neighbours = ordering.neighbours;
        vertex.normal = ordering.normal;
        vertex.boundary = ordering.open;
        vertex.star_epoch = Some(epoch);
    }

    /// Re-derive every edge link from the ordered rings.
    ///
    /// Face edges follow the ordered rings, face-created edges no ring uses
    /// any more are dropped, and twin/next/prev, boundary flags, vertex
    /// back-references, neighbours and the edge-face map are rebuilt.
    fn resolve_links(&mut self) -> Result<()> {
        for e in &mut self.edges {
            e.face = FaceId::invalid();
            e.twin = EdgeId::invalid();
            e.next = EdgeId::invalid();
            e.prev = EdgeId::invalid();
            e.boundary = false;
        }

        for fi in 0..self.faces.len() {
            let f = FaceId::new(fi);
            let ring = self.faces[fi].vertices.clone();
            let n = ring.len();
            let mut ids = Vec::with_capacity(n);
            for k in 0..n {
                let (a, b) = (ring[k], ring[(k + 1) % n]);
                let e = match self.edge_map.get(&(a, b)).copied() {
                    Some(e) => {
                        let owner = self.edges[e.index()].face;
                        if owner.is_valid() && owner != f {
                            return Err(self.fail(MeshError::OrientationConflict {
                                from: a.index(),
                                to: b.index(),
                                first: owner.index(),
                                second: fi,
                            }));
                        }
                        e
                    }
                    None => self.push_edge(a, b),
                };
                self.edges[e.index()].face = f;
                ids.push(e);
            }
            self.faces[fi].edges = ids;
        }

        self.drop_stale_edges();

        // Twins
        for i in 0..self.edges.len() {
            let (from, to) = (self.edges[i].from, self.edges[i].to);
            self.edges[i].twin = self.edge_map.get(&(to, from)).copied().unwrap_or_default();
        }

        // Next/prev around each face
        for face in &self.faces {
            let n = face.edges.len();
            for k in 0..n {
                let e = face.edges[k].index();
                self.edges[e].next = face.edges[(k + 1) % n];
                self.edges[e].prev = face.edges[(k + n - 1) % n];
            }
        }

        // Exactly one side carries a face
        for i in 0..self.edges.len() {
            let edge = &self.edges[i];
            let inside = edge.is_owned();
            let outside = edge.twin.is_valid() && self.edges[edge.twin.index()].is_owned();
            self.edges[i].boundary = inside != outside;
        }

        // Vertex back-references, preferring boundary edges
        for v in &mut self.vertices {
            v.edge = EdgeId::invalid();
        }
        for (i, edge) in self.edges.iter().enumerate() {
            let vertex = &mut self.vertices[edge.from.index()];
            let current = vertex.edge;
            if !current.is_valid() || (edge.boundary && !self.edges[current.index()].boundary) {
                vertex.edge = EdgeId::new(i);
            }
        }

        // Neighbours and shared pairs from the ordered rings
        for v in &mut self.vertices {
            v.neighbours.clear();
        }
        self.pair_owner.clear();
        self.edge_face.clear();
        let mut pairs = Vec::with_capacity(self.edges.len());
        for face in &self.faces {
            let n = face.vertices.len();
            for k in 0..n {
                pairs.push((face.vertices[k], face.vertices[(k + 1) % n], face.id));
            }
        }
        for (a, b, f) in pairs {
            if let Err(err) = record_pair(&mut self.pair_owner, &mut self.edge_face, a, b, f) {
                return Err(self.fail(err));
            }
            self.link_neighbours(a, b);
        }
        let explicit: Vec<(VertexId<I>, VertexId<I>)> = self
            .edges
            .iter()
            .filter(|e| e.explicit)
            .map(|e| (e.from, e.to))
            .collect();
        for (a, b) in explicit {
            self.link_neighbours(a, b);
        }

        log::trace!(
            "links resolved: {} edges, {} shared pairs",
            self.edges.len(),
            self.edge_face.len()
        );
        Ok(())
    }

    /// Remove face-created edges that no ordered ring uses.
    fn drop_stale_edges(&mut self) {
        if self.edges.iter().all(|e| e.explicit || e.is_owned()) {
            return;
        }

        let old = std::mem::take(&mut self.edges);
        let mut remap = vec![EdgeId::invalid(); old.len()];
        self.edge_map.clear();
        for e in old {
            if e.explicit || e.is_owned() {
                let id = EdgeId::new(self.edges.len());
                remap[e.id.index()] = id;
                self.edge_map.insert((e.from, e.to), id);
                self.edges.push(Edge { id, ..e });
            }
        }
        for face in &mut self.faces {
            for e in &mut face.edges {
                *e = remap[e.index()];
            }
        }
        self.nedge = self.edges.len();
    }

    /// Evaluate `f` for every entity index, in parallel when enabled.
    fn map_entities<T, F>(&self, n: usize, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync + Send,
    {
        if self.options.parallel {
            (0..n).into_par_iter().map(f).collect()
        } else {
            (0..n).map(f).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{build_mesh, MeshOptions, Particle};

    fn planar(points: &[[f64; 2]]) -> Mesh<u32> {
        let mut mesh = Mesh::with_options(MeshOptions::default().sequential());
        for (i, p) in points.iter().enumerate() {
            mesh.add_vertex(i, p[0], p[1], 0.0).unwrap();
        }
        mesh
    }

    fn ring(mesh: &Mesh<u32>, f: usize) -> Vec<usize> {
        mesh.face(FaceId::new(f))
            .vertices
            .iter()
            .map(|v| v.index())
            .collect()
    }

    /// Regular hexagon of triangles around vertex 0 whose centroids lie on
    /// the unit circle.
    fn hexagon_fan() -> Mesh<u32> {
        let r = 3f64.sqrt();
        let mut points = vec![[0.0, 0.0]];
        for k in 0..6 {
            let a = k as f64 * TAU / 6.0;
            points.push([r * a.cos(), r * a.sin()]);
        }
        let mut mesh = planar(&points);
        for k in 0..6 {
            mesh.add_face(&[0, 1 + k, 1 + (k + 1) % 6]).unwrap();
        }
        mesh
    }

    #[test]
    fn test_tangent_basis_is_right_handed() {
        for n in [Vector3::z(), -Vector3::x(), Vector3::new(1.0, 2.0, -0.5).normalize()] {
            let (u, w) = tangent_basis(&n);
            assert!(u.dot(&n).abs() < 1e-12);
            assert!(w.dot(&n).abs() < 1e-12);
            assert!((u.cross(&w) - n).norm() < 1e-12);
        }
    }

    #[test]
    fn test_angular_order_ties_by_id() {
        let entries = vec![
            (7, Vector3::new(1.0, 0.0, 0.0)),
            (3, Vector3::new(2.0, 0.0, 0.0)),
            (5, Vector3::new(0.0, 1.0, 0.0)),
        ];
        let order = angular_order(&entries, &Vector3::z(), 1e-9);
        assert_eq!(order.ids, vec![3, 7, 5]);
        assert_eq!(order.ties, vec![(3, 7)]);
    }

    #[test]
    fn test_angular_order_wraps_at_pi() {
        let entries = vec![
            (4, Vector3::new(-1.0, 1e-14, 0.0)),
            (2, Vector3::new(-1.0, -1e-14, 0.0)),
            (9, Vector3::new(1.0, 0.0, 0.0)),
        ];
        let order = angular_order(&entries, &Vector3::z(), 1e-9);
        assert_eq!(order.ties, vec![(2, 4)]);
        assert_eq!(order.ids.len(), 3);
    }

    #[test]
    fn test_unit_square_not_reordered() {
        let mut mesh = planar(&[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]);
        let f = mesh.add_face(&[0, 1, 2, 3]).unwrap();
        mesh.order_face(f).unwrap();

        assert_eq!(ring(&mesh, 0), vec![0, 1, 2, 3]);
        assert!((mesh.face_normal(f) - Vector3::z()).norm() < 1e-12);
        assert_eq!(mesh.state(), MeshState::Ordering);
    }

    #[test]
    fn test_scrambled_ring_is_ordered() {
        let mut mesh = planar(&[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]);
        mesh.add_face(&[2, 0, 3, 1]).unwrap();
        mesh.postprocess().unwrap();

        assert_eq!(ring(&mesh, 0), vec![0, 1, 2, 3]);
        // Diagonal and reversed edges created from the scrambled ring are gone
        assert_eq!(mesh.nedges(), 4);
        assert!(mesh.is_valid());
        let walked: Vec<(usize, usize)> = mesh
            .face_edges(FaceId::new(0))
            .map(|e| (mesh.edge(e).from.index(), mesh.edge(e).to.index()))
            .collect();
        assert_eq!(walked, vec![(0, 1), (1, 2), (2, 3), (3, 0)]);
    }

    #[test]
    fn test_convex_face_consistent_orientation() {
        // Regular pentagon fed in a scrambled order
        let points: Vec<[f64; 2]> = (0..5)
            .map(|k| {
                let a = k as f64 * TAU / 5.0 + 0.3;
                [2.0 * a.cos() + 5.0, 2.0 * a.sin() - 1.0]
            })
            .collect();
        let mut mesh = planar(&points);
        let f = mesh.add_face(&[3, 0, 4, 1, 2]).unwrap();
        mesh.order_face(f).unwrap();

        let ring = ring(&mesh, 0);
        let n = ring.len();
        let normal = mesh.face_normal(f);
        for k in 0..n {
            let p0 = mesh.position(VertexId::new(ring[k]));
            let p1 = mesh.position(VertexId::new(ring[(k + 1) % n]));
            let p2 = mesh.position(VertexId::new(ring[(k + 2) % n]));
            let turn = (p1 - p0).cross(&(p2 - p1)).dot(&normal);
            assert!(turn > 0.0, "turn {} at {}", turn, k);
        }
    }

    #[test]
    fn test_particle_normals_set_orientation() {
        // Viewed from -z the counter-clockwise order is reversed
        let mut mesh = Mesh::<u32>::with_options(MeshOptions::default().sequential());
        for (i, p) in [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]].iter().enumerate() {
            let particle = Particle::new(i, p[0], p[1], 0.0).with_normal(-Vector3::z());
            mesh.add_particle(&particle).unwrap();
        }
        let f = mesh.add_face(&[0, 1, 2, 3]).unwrap();
        mesh.order_face(f).unwrap();
        assert_eq!(ring(&mesh, 0), vec![0, 3, 2, 1]);

        mesh.set_options(MeshOptions::default().sequential().estimate_normals());
        mesh.order_face(f).unwrap();
        assert_eq!(ring(&mesh, 0), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_sphere_faces_point_outward() {
        // Octahedron with all faces given clockwise from outside
        let points = [
            [1.0, 0.0, 0.0],
            [-1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, -1.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, -1.0],
        ];
        let mut mesh = Mesh::<u32>::with_options(MeshOptions::default().sequential());
        for (i, p) in points.iter().enumerate() {
            mesh.add_vertex(i, p[0], p[1], p[2]).unwrap();
        }
        let faces = [
            [0, 4, 2],
            [2, 4, 1],
            [1, 4, 3],
            [3, 4, 0],
            [0, 2, 5],
            [2, 1, 5],
            [1, 3, 5],
            [3, 0, 5],
        ];
        for face in &faces {
            mesh.add_face(face).unwrap();
        }
        mesh.postprocess().unwrap();

        assert!(mesh.is_valid());
        assert_eq!(mesh.nedges(), 24);
        assert_eq!(mesh.edge_face().len(), 12);
        for f in mesh.face_ids() {
            let face = mesh.face(f);
            assert!(face.normal.dot(&face.centre.coords) > 0.0);
            assert!(mesh.face_edges(f).all(|e| mesh.edge(e).twin.is_valid()));
        }
        for v in mesh.vertex_ids() {
            assert_eq!(mesh.vertex(v).faces.len(), 4);
            assert!(!mesh.vertex(v).boundary);
        }
        assert!(mesh.edges().iter().all(|e| !e.boundary));
    }

    #[test]
    fn test_star_order_is_counter_clockwise() {
        let mut mesh = hexagon_fan();
        mesh.postprocess().unwrap();

        let centre = mesh.vertex(VertexId::new(0));
        assert!(!centre.boundary);
        let faces: Vec<usize> = centre.faces.iter().map(|f| f.index()).collect();
        assert_eq!(faces, vec![0, 1, 2, 3, 4, 5]);
        let neighbours: Vec<usize> = centre.neighbours.iter().map(|v| v.index()).collect();
        assert_eq!(neighbours, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_open_star_starts_at_boundary() {
        let mut mesh = hexagon_fan();
        mesh.postprocess().unwrap();

        // Rim vertex 1 touches faces 5 and 0; walking counter-clockwise from
        // the boundary visits face 0 before face 5
        let rim = mesh.vertex(VertexId::new(1));
        assert!(rim.boundary);
        let faces: Vec<usize> = rim.faces.iter().map(|f| f.index()).collect();
        assert_eq!(faces, vec![0, 5]);
        let neighbours: Vec<usize> = rim.neighbours.iter().map(|v| v.index()).collect();
        assert_eq!(neighbours, vec![2, 0, 6]);
        assert!(mesh.edge(rim.edge).boundary);
    }

    #[test]
    fn test_links_and_twins() {
        let mut mesh = hexagon_fan();
        mesh.postprocess().unwrap();

        assert!(mesh.is_valid());
        assert_eq!(mesh.nedges(), 18);
        assert_eq!(mesh.edge_face().len(), 6);
        let spoke = mesh.find_edge(VertexId::new(0), VertexId::new(1)).unwrap();
        let twin = mesh.edge(spoke).twin;
        assert_eq!(mesh.edge(twin).from.index(), 1);
        assert_eq!(mesh.edge(twin).to.index(), 0);
        assert!(!mesh.edge(spoke).boundary);
        let rim = mesh.find_edge(VertexId::new(1), VertexId::new(2)).unwrap();
        assert!(mesh.edge(rim).boundary);
        assert!(!mesh.edge(rim).twin.is_valid());
    }

    #[test]
    fn test_postprocess_is_idempotent() {
        let mut mesh = hexagon_fan();
        mesh.postprocess().unwrap();
        let rings: Vec<Vec<usize>> = (0..mesh.nfaces()).map(|f| ring(&mesh, f)).collect();
        let centres: Vec<Point3<f64>> = mesh.faces().iter().map(|f| f.centre).collect();
        let stars: Vec<Vec<FaceId>> = mesh.vertices().iter().map(|v| v.faces.clone()).collect();
        let area = mesh.dual_area(VertexId::new(0)).unwrap();

        mesh.postprocess().unwrap();
        assert_eq!(
            (0..mesh.nfaces()).map(|f| ring(&mesh, f)).collect::<Vec<_>>(),
            rings
        );
        assert_eq!(mesh.faces().iter().map(|f| f.centre).collect::<Vec<_>>(), centres);
        assert_eq!(
            mesh.vertices().iter().map(|v| v.faces.clone()).collect::<Vec<_>>(),
            stars
        );
        assert_eq!(mesh.dual_area(VertexId::new(0)).unwrap(), area);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let mut sequential = hexagon_fan();
        sequential.postprocess().unwrap();

        let mut parallel = hexagon_fan();
        parallel.set_options(MeshOptions::default().with_parallel(true));
        parallel.postprocess().unwrap();

        for f in 0..sequential.nfaces() {
            assert_eq!(ring(&sequential, f), ring(&parallel, f));
        }
        assert_eq!(sequential.diagnostics(), parallel.diagnostics());
    }

    #[test]
    fn test_coincident_vertices_report_ambiguity() {
        // Vertices 2 and 3 lie on the same ray from the centroid
        let points = [[-2.0, 0.0], [0.0, -2.0], [1.5, 1.5], [0.5, 0.5]];
        for input in [[3, 2, 0, 1], [2, 3, 1, 0]] {
            let mut mesh = Mesh::<u32>::with_options(MeshOptions::default().sequential());
            for (i, p) in points.iter().enumerate() {
                let particle = Particle::new(i, p[0], p[1], 0.0).with_normal(Vector3::z());
                mesh.add_particle(&particle).unwrap();
            }
            mesh.add_face(&input).unwrap();
            mesh.order_face(FaceId::new(0)).unwrap();

            assert_eq!(ring(&mesh, 0), vec![0, 1, 2, 3]);
            assert_eq!(
                mesh.diagnostics(),
                &[Diagnostic::OrderingAmbiguity {
                    site: TieSite::Face(FaceId::new(0)),
                    first: 2,
                    second: 3,
                }]
            );
        }
    }

    #[test]
    fn test_reordering_face_does_not_repeat_ties() {
        let points = [[-2.0, 0.0], [0.0, -2.0], [1.5, 1.5], [0.5, 0.5]];
        let mut mesh = Mesh::<u32>::with_options(MeshOptions::default().sequential());
        for (i, p) in points.iter().enumerate() {
            let particle = Particle::new(i, p[0], p[1], 0.0).with_normal(Vector3::z());
            mesh.add_particle(&particle).unwrap();
        }
        let f = mesh.add_face(&[3, 2, 0, 1]).unwrap();
        mesh.order_face(f).unwrap();
        mesh.order_face(f).unwrap();
        assert_eq!(mesh.diagnostics().len(), 1);

        mesh.postprocess().unwrap();
        let star_ties = mesh.diagnostics().len();
        mesh.order_star(VertexId::new(2)).unwrap();
        mesh.order_star(VertexId::new(2)).unwrap();
        assert_eq!(mesh.diagnostics().len(), star_ties);
    }

    /// Quad grid over `x, y` in `0..=n`, rings alternating in direction.
    fn height_field(n: usize, height: impl Fn(f64, f64) -> f64) -> (Vec<Particle>, Vec<Vec<usize>>) {
        let mut particles = Vec::new();
        for j in 0..=n {
            for i in 0..=n {
                let (x, y) = (i as f64, j as f64);
                particles.push(Particle::new(j * (n + 1) + i, x, y, height(x, y)));
            }
        }
        let mut rings = Vec::new();
        for j in 0..n {
            for i in 0..n {
                let v00 = j * (n + 1) + i;
                let mut ring = vec![v00, v00 + 1, v00 + n + 2, v00 + n + 1];
                if (i + j) % 2 == 1 {
                    ring.reverse();
                }
                rings.push(ring);
            }
        }
        (particles, rings)
    }

    #[test]
    fn test_wavy_sheet_is_oriented_consistently() {
        let n = 12;
        let (particles, rings) = height_field(n, |x, _| 0.5 * (TAU * x / n as f64).sin());
        let mesh: Mesh<u32> = build_mesh(&particles, &rings, MeshOptions::default()).unwrap();

        assert_eq!(mesh.state(), MeshState::Ready);
        assert!(mesh.is_valid());
        for f in mesh.face_ids() {
            assert!(mesh.face_normal(f).z > 0.5, "face {:?} points down", f);
        }
        for j in 1..n {
            for i in 1..n {
                let v = VertexId::new(j * (n + 1) + i);
                assert!(!mesh.vertex(v).boundary);
                assert!(mesh.dual_area(v).unwrap() > 0.0);
            }
        }
    }

    #[test]
    fn test_torus_faces_point_out_of_the_tube() {
        let (major, minor) = (3.0, 1.0);
        let (nu, nv) = (16, 8);
        let id = |i: usize, j: usize| (i % nu) * nv + j % nv;
        let mut particles = Vec::new();
        for i in 0..nu {
            let u = TAU * i as f64 / nu as f64;
            for j in 0..nv {
                let w = TAU * j as f64 / nv as f64;
                let r = major + minor * w.cos();
                particles.push(Particle::new(id(i, j), r * u.cos(), r * u.sin(), minor * w.sin()));
            }
        }
        let mut rings = Vec::new();
        for i in 0..nu {
            for j in 0..nv {
                let mut ring = vec![id(i, j), id(i + 1, j), id(i + 1, j + 1), id(i, j + 1)];
                if (i * 3 + j) % 5 < 2 {
                    ring.reverse();
                }
                rings.push(ring);
            }
        }

        let mesh: Mesh<u32> = build_mesh(&particles, &rings, MeshOptions::default()).unwrap();
        assert_eq!(mesh.state(), MeshState::Ready);
        assert!(mesh.is_valid());
        assert_eq!(mesh.nedges(), 2 * 2 * nu * nv);
        assert!(mesh.edges().iter().all(|e| e.twin.is_valid() && !e.boundary));
        for f in mesh.face_ids() {
            let face = mesh.face(f);
            let c = face.centre;
            let axis = Vector3::new(c.x, c.y, 0.0).normalize() * major;
            assert!(face.normal.dot(&(c.coords - axis)) > 0.0, "face {:?} points into the tube", f);
        }
        for v in mesh.vertex_ids() {
            assert_eq!(mesh.vertex(v).faces.len(), 4);
            assert!(mesh.dual_area(v).unwrap() > 0.0);
        }
    }

    #[test]
    fn test_mobius_strip_cannot_be_oriented() {
        let (radius, half_width, n) = (3.0, 0.5, 12);
        let mut particles = Vec::new();
        for i in 0..n {
            let t = TAU * i as f64 / n as f64;
            for s in [-1.0, 1.0] {
                let r = radius + s * half_width * (t / 2.0).cos();
                let id = particles.len();
                particles.push(Particle::new(id, r * t.cos(), r * t.sin(), s * half_width * (t / 2.0).sin()));
            }
        }
        let mut rings: Vec<Vec<usize>> = (0..n - 1)
            .map(|i| vec![2 * i, 2 * i + 1, 2 * i + 3, 2 * i + 2])
            .collect();
        // Half twist joins the last segment to the first with sides swapped
        rings.push(vec![2 * (n - 1), 2 * (n - 1) + 1, 0, 1]);

        let result: Result<Mesh<u32>> = build_mesh(&particles, &rings, MeshOptions::default());
        assert!(matches!(result, Err(MeshError::OrientationConflict { .. })));
    }

    #[test]
    fn test_order_star_requires_centres() {
        let mut mesh = hexagon_fan();
        mesh.order_face(FaceId::new(0)).unwrap();
        assert!(matches!(
            mesh.order_star(VertexId::new(0)),
            Err(MeshError::InvalidState { .. })
        ));

        mesh.compute_centre(FaceId::new(0)).unwrap();
        assert_eq!(mesh.state(), MeshState::Geometry);
        // Remaining faces have no centroid yet
        assert!(mesh.order_star(VertexId::new(0)).is_err());
        // Vertex 1 sees faces 0 and 5; face 5 is still missing
        assert!(mesh.order_star(VertexId::new(1)).is_err());
    }

    #[test]
    fn test_ordering_before_assembly_fails() {
        let mut mesh = Mesh::<u32>::new();
        assert!(matches!(
            mesh.order_face(FaceId::new(0)),
            Err(MeshError::InvalidState { .. })
        ));
        assert!(matches!(
            mesh.postprocess(),
            Err(MeshError::InvalidState { .. })
        ));

        let mut mesh = planar(&[[0.0, 0.0], [1.0, 0.0]]);
        assert_eq!(mesh.postprocess(), Err(MeshError::EmptyMesh));
        assert_eq!(
            mesh.order_face(FaceId::new(3)),
            Err(MeshError::MissingFace { id: 3 })
        );
    }

    #[test]
    fn test_topology_closed_after_ordering() {
        let mut mesh = hexagon_fan();
        mesh.postprocess().unwrap();
        assert!(matches!(
            mesh.add_face(&[1, 2, 3]),
            Err(MeshError::InvalidState { .. })
        ));
        assert!(mesh.add_edge(1, 3).is_err());
        assert_eq!(mesh.state(), MeshState::Ready);
    }

    #[test]
    fn test_explicit_edges_survive() {
        let mut mesh = planar(&[[0.0, 0.0], [1.0, 0.0], [0.5, 1.0], [3.0, 3.0]]);
        mesh.add_edge(1, 0).unwrap();
        mesh.add_edge(2, 3).unwrap();
        mesh.add_face(&[0, 1, 2]).unwrap();
        mesh.postprocess().unwrap();

        assert!(mesh.is_valid());
        assert_eq!(mesh.nedges(), 5);
        let outside = mesh.find_edge(VertexId::new(1), VertexId::new(0)).unwrap();
        assert!(!mesh.edge(outside).is_owned());
        assert!(mesh.edge(outside).boundary);
        let free = mesh.find_edge(VertexId::new(2), VertexId::new(3)).unwrap();
        assert!(!mesh.edge(free).boundary);
        assert!(mesh.vertex(VertexId::new(3)).neighbours.contains(&VertexId::new(2)));
    }
}
