//! Algorithms over a post-processed cell mesh.
//!
//! - **Cells**: dual area and perimeter of every vertex, in parallel
//! - **Energy**: area/perimeter cell energy with per-type-pair line tension

pub mod cells;
pub mod energy;
