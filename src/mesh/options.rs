//! Options controlling mesh ordering.

/// Options for the ordering and geometry passes.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshOptions {
    /// Angles closer than this (radians) are treated as equal and ordered by id.
    pub angle_tolerance: f64,

    /// Whether to use parallel execution (default: true).
    pub parallel: bool,

    /// Whether particle-supplied surface normals take precedence over
    /// normals estimated from the geometry.
    pub use_particle_normals: bool,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            angle_tolerance: 1e-9,
            parallel: true,
            use_particle_normals: true,
        }
    }
}

impl MeshOptions {
    /// Set the angular tie tolerance.
    pub fn with_angle_tolerance(mut self, tolerance: f64) -> Self {
        self.angle_tolerance = tolerance.max(0.0);
        self
    }

    /// Set whether to use parallel execution.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Ignore particle normals and always estimate from geometry.
    pub fn estimate_normals(mut self) -> Self {
        self.use_particle_normals = false;
        self
    }

    /// Create options for single-threaded execution.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }
}
