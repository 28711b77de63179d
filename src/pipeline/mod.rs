// Hardware pipeline: port types, the backend trait, the simulated backend
// and the capture graph.

pub mod backend;
pub mod error;
pub mod graph;
pub mod simulated;
pub mod types;
