//! Multi-rank execution: transport, named commands and worker mode.
//!
//! Provides:
//! - `Communicator`: broadcast/gather between ranks (`LocalComm`, `ThreadComm`)
//! - `share` / `distribute`: controller results and round-robin work for every rank
//! - `CommandRegistry`: ops callable by name on every rank
//! - `Pipeline::worker_mode`: workers serve the controller's calls

mod comm;
mod mode;
mod registry;

pub use comm::*;
pub use mode::*;
pub use registry::*;
