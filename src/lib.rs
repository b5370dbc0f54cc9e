//! histmatch - Iterative history matching with regression and Gaussian process emulators.
//!
//! ## Architecture
//!
//! Each iteration emulates every model output with a polynomial regression
//! plus a Gaussian process, then rules out parameter regions whose
//! implausibility exceeds the cut-off:
//!
//! - **Construction**: Samples → Model evaluations → Active parameters →
//!   Regression → Covariance matrix
//! - **Analysis**: Evaluate candidates through every iteration → plausible samples
//! - **Refinement**: The next iteration samples inside the plausible region
//!
//! ## Ranks
//!
//! Every rank runs the same pipeline calls. The controller (rank 0) evaluates
//! the model and owns the store; fitting and candidate evaluation are spread
//! over all ranks. In worker mode only the controller runs user code and the
//! workers serve its calls.
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Model failures and empty plausible regions

pub mod checkpoint;
pub mod emulator;
pub mod modellink;
pub mod models;
pub mod pipeline;
pub mod worker;

// Re-exports for convenience
pub use checkpoint::{ConstructionState, Iteration, IterationStore, Stage};
pub use emulator::{EmulationMethod, SampleEvaluation};
pub use modellink::{GaussianLink, ModelLink};
pub use models::{Config, HistMatchError, RequestWarning, Result};
pub use pipeline::{DetailsReport, Pipeline, ProjectionRenderer, ProjectionSurface};
pub use worker::{Communicator, LocalComm, ThreadComm, WorkerMessage};
