//! Area/perimeter cell energy over the dual cells of a mesh.
//!
//! For each vertex with dual area `A` and perimeter `P`:
//!
//! ```text
//! E_v = K/2 (A - A0)² + Γ/2 (P - P0)²
//! ```
//!
//! Every vertex pair shared by two faces `f`, `g` adds a line tension term
//! `λ(t_i, t_j) |c_f - c_g|`, where `t_i`, `t_j` are the particle types of the
//! pair and `c_f`, `c_g` the face centroids, i.e. the length of the dual edge.

use crate::algo::cells::{dual_cells, dual_cells_sequential};
use crate::error::{MeshError, Result};
use crate::mesh::{DualCell, Mesh, MeshIndex};
use crate::params::{PairTable, ParamMap};

const CONTEXT: &str = "cell energy";
const PAIR_CONTEXT: &str = "pair line tension";

/// Parameters of the cell energy.
#[derive(Debug, Clone, PartialEq)]
pub struct CellEnergy {
    /// Area stiffness `K`.
    pub area_stiffness: f64,
    /// Preferred area `A0`.
    pub target_area: f64,
    /// Perimeter stiffness `Γ`.
    pub perimeter_stiffness: f64,
    /// Preferred perimeter `P0`.
    pub target_perimeter: f64,
    /// Line tension `λ` per pair of particle types.
    pub line_tension: PairTable<f64>,
}

/// Energy of a mesh split by term.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyReport {
    /// Sum of the area terms.
    pub area: f64,
    /// Sum of the perimeter terms.
    pub perimeter: f64,
    /// Sum of the line tension terms.
    pub line: f64,
    /// Area plus perimeter energy of each vertex, indexed by vertex id.
    pub per_vertex: Vec<f64>,
}

impl EnergyReport {
    /// Total energy.
    pub fn total(&self) -> f64 {
        self.area + self.perimeter + self.line
    }
}

impl CellEnergy {
    /// Unit stiffnesses, unit target area, zero target perimeter, no line tension.
    pub fn new(ntypes: usize) -> Self {
        Self {
            area_stiffness: 1.0,
            target_area: 1.0,
            perimeter_stiffness: 1.0,
            target_perimeter: 0.0,
            line_tension: PairTable::new(ntypes, 0.0),
        }
    }

    /// Read global parameters `kappa`, `A0`, `gamma`, `P0` and `lambda`.
    ///
    /// Missing keys fall back to the defaults of [`CellEnergy::new`]; `lambda`
    /// fills every type pair.
    pub fn from_params(params: &ParamMap, ntypes: usize) -> Result<Self> {
        if ntypes == 0 {
            return Err(MeshError::invalid_param("ntypes", ntypes, "must be at least 1"));
        }

        let energy = Self {
            area_stiffness: non_negative("kappa", params.optional("kappa", 1.0, CONTEXT)?)?,
            target_area: non_negative("A0", params.optional("A0", 1.0, CONTEXT)?)?,
            perimeter_stiffness: non_negative("gamma", params.optional("gamma", 1.0, CONTEXT)?)?,
            target_perimeter: non_negative("P0", params.optional("P0", 0.0, CONTEXT)?)?,
            line_tension: PairTable::new(ntypes, params.optional("lambda", 0.0, CONTEXT)?),
        };

        log::info!(
            "{}: K = {}, A0 = {}, gamma = {}, P0 = {}, {} particle types",
            CONTEXT,
            energy.area_stiffness,
            energy.target_area,
            energy.perimeter_stiffness,
            energy.target_perimeter,
            ntypes
        );
        Ok(energy)
    }

    /// Override the line tension for one type pair.
    ///
    /// `type_1` and `type_2` are required; a missing `lambda` keeps the
    /// current value.
    pub fn set_pair_parameters(&mut self, params: &ParamMap) -> Result<()> {
        let a: u32 = params.required("type_1", PAIR_CONTEXT)?;
        let b: u32 = params.required("type_2", PAIR_CONTEXT)?;
        let current = *self.line_tension.get(a, b)?;
        let lambda = params.optional("lambda", current, PAIR_CONTEXT)?;
        self.line_tension.set(a, b, lambda)?;
        log::info!("{}: lambda({}, {}) = {}", PAIR_CONTEXT, a, b, lambda);
        Ok(())
    }

    /// Area and perimeter energy of one dual cell. Degenerate cells contribute nothing.
    pub fn vertex_energy(&self, cell: &DualCell) -> f64 {
        if cell.is_degenerate() {
            return 0.0;
        }
        let da = cell.area - self.target_area;
        let dp = cell.perimeter - self.target_perimeter;
        0.5 * self.area_stiffness * da * da + 0.5 * self.perimeter_stiffness * dp * dp
    }

    /// Evaluate the energy of a post-processed mesh.
    pub fn evaluate<I: MeshIndex>(&self, mesh: &Mesh<I>) -> Result<EnergyReport> {
        let cells = if mesh.options().parallel {
            dual_cells(mesh)?
        } else {
            dual_cells_sequential(mesh)?
        };

        let mut area = 0.0;
        let mut perimeter = 0.0;
        let mut per_vertex = Vec::with_capacity(cells.len());
        for cell in &cells {
            if cell.is_degenerate() {
                per_vertex.push(0.0);
                continue;
            }
            let da = cell.area - self.target_area;
            let dp = cell.perimeter - self.target_perimeter;
            let ea = 0.5 * self.area_stiffness * da * da;
            let ep = 0.5 * self.perimeter_stiffness * dp * dp;
            area += ea;
            perimeter += ep;
            per_vertex.push(ea + ep);
        }

        let mut line = 0.0;
        for (&(a, b), &(f, g)) in mesh.edge_face() {
            let lambda = *self
                .line_tension
                .get(mesh.vertex(a).kind, mesh.vertex(b).kind)?;
            if lambda != 0.0 {
                line += lambda * (mesh.face(f).centre - mesh.face(g).centre).norm();
            }
        }

        Ok(EnergyReport {
            area,
            perimeter,
            line,
            per_vertex,
        })
    }
}

fn non_negative(name: &str, value: f64) -> Result<f64> {
    if value < 0.0 || !value.is_finite() {
        return Err(MeshError::invalid_param(name, value, "must be finite and non-negative"));
    }
    Ok(value)
}
