//! Error and diagnostic types for cellmesh.
//!
//! Structural problems with the supplied connectivity are fatal and surface as
//! [`MeshError`]. Geometric degeneracies found while ordering or measuring are
//! absorbed locally and reported as [`Diagnostic`] values instead.

use thiserror::Error;

use crate::mesh::{FaceId, MeshIndex, MeshState, VertexId};

/// Result type alias using [`MeshError`].
pub type Result<T> = std::result::Result<T, MeshError>;

/// Errors that can occur while building or querying a mesh.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    /// The mesh has no faces.
    #[error("mesh has no faces")]
    EmptyMesh,

    /// The same directed edge was registered twice within one rebuild.
    #[error("directed edge ({from}, {to}) registered twice")]
    DuplicateEdge {
        /// Origin vertex id.
        from: usize,
        /// Destination vertex id.
        to: usize,
    },

    /// A vertex id was added twice.
    #[error("vertex {id} already exists")]
    DuplicateVertex {
        /// The repeated vertex id.
        id: usize,
    },

    /// Vertex ids must be contiguous from zero in insertion order.
    #[error("vertex id {id} is not contiguous (expected {expected})")]
    NonContiguousVertex {
        /// The supplied id.
        id: usize,
        /// The id the mesh expected next.
        expected: usize,
    },

    /// An edge from a vertex to itself.
    #[error("edge from vertex {vertex} to itself")]
    SelfLoop {
        /// The vertex.
        vertex: usize,
    },

    /// A vertex was referenced before being added.
    #[error("vertex {id} referenced before being added")]
    MissingVertex {
        /// The unknown vertex id.
        id: usize,
    },

    /// A face was referenced before being added.
    #[error("face {id} referenced before being added")]
    MissingFace {
        /// The unknown face id.
        id: usize,
    },

    /// A face ring has fewer than three vertices or repeats a vertex.
    #[error("face {face} is degenerate ({reason})")]
    DegenerateFace {
        /// Index the face would have received.
        face: usize,
        /// What is wrong with the ring.
        reason: &'static str,
    },

    /// More than two faces share one vertex pair.
    #[error("vertex pair ({v0}, {v1}) is shared by more than two faces")]
    NonManifoldEdge {
        /// First vertex of the pair.
        v0: usize,
        /// Second vertex of the pair.
        v1: usize,
    },

    /// Two ordered faces traverse the same directed edge.
    #[error("faces {first} and {second} both traverse edge ({from}, {to}) in the same direction")]
    OrientationConflict {
        /// Origin vertex id.
        from: usize,
        /// Destination vertex id.
        to: usize,
        /// Face that owned the edge first.
        first: usize,
        /// Face that claimed it again.
        second: usize,
    },

    /// A centroid was requested for a face whose ring is not ordered yet.
    #[error("face {face} must be ordered before its centre is computed")]
    UnorderedFace {
        /// The face id.
        face: usize,
    },

    /// The operation is not allowed in the current lifecycle state.
    #[error("operation `{operation}` is not allowed while the mesh is {state:?}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the mesh was in.
        state: MeshState,
    },

    /// A required parameter is missing.
    #[error("missing required parameter `{name}` for {context}")]
    MissingParameter {
        /// Parameter name.
        name: String,
        /// Component that asked for it.
        context: &'static str,
    },

    /// Invalid parameter value.
    #[error("invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// The invalid value (as string).
        value: String,
        /// Reason the value is invalid.
        reason: &'static str,
    },

    /// A particle type outside `1..=ntypes`.
    #[error("particle type {kind} out of range 1..={ntypes}")]
    TypeOutOfRange {
        /// The offending type.
        kind: u32,
        /// Number of types the table was sized for.
        ntypes: usize,
    },
}

impl MeshError {
    /// Create an invalid parameter error.
    pub fn invalid_param<T: std::fmt::Display>(
        name: impl Into<String>,
        value: T,
        reason: &'static str,
    ) -> Self {
        MeshError::InvalidParameter {
            name: name.into(),
            value: value.to_string(),
            reason,
        }
    }

    /// Whether the error leaves the mesh unusable until the next `reset`.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            MeshError::DuplicateEdge { .. }
                | MeshError::DuplicateVertex { .. }
                | MeshError::NonContiguousVertex { .. }
                | MeshError::SelfLoop { .. }
                | MeshError::MissingVertex { .. }
                | MeshError::DegenerateFace { .. }
                | MeshError::NonManifoldEdge { .. }
                | MeshError::OrientationConflict { .. }
        )
    }
}

/// Where an angular tie was broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieSite<I: MeshIndex = u32> {
    /// Inside the ring of a face.
    Face(FaceId<I>),
    /// Inside the star of a vertex.
    Star(VertexId<I>),
}

/// Non-fatal conditions recorded while post-processing a mesh.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic<I: MeshIndex = u32> {
    /// A vertex has fewer than three incident faces; its dual metrics are zero.
    DegenerateStar {
        /// The vertex.
        vertex: VertexId<I>,
        /// Number of incident faces.
        faces: usize,
    },

    /// Two entries had the same angle; they were ordered by ascending id.
    OrderingAmbiguity {
        /// Face ring or vertex star where the tie occurred.
        site: TieSite<I>,
        /// Smaller id of the tied pair.
        first: usize,
        /// Larger id of the tied pair.
        second: usize,
    },
}
