//! Iteration state and its persistent store.
//!
//! Provides:
//! - `Iteration` and `ConstructionChecklist`: what each iteration holds and
//!   which construction stages are still pending
//! - `IterationStore`: atomic persistence and loading of iterations

mod state;
mod store;

pub use state::*;
pub use store::*;
