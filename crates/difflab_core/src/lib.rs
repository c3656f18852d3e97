//! The `difflab_core` crate is the numerical core of the Differential Lab.
//! It compiles user-typed expressions into a safe bytecode form and solves
//! ODEs, recurrences and Poisson problems with them.
//!
//! Key components:
//! - **Equation Engine**: a restricted parser and bytecode VM; no host-language evaluation.
//! - **Engines**: `ode` (adaptive Runge-Kutta, SDIRK and shooting), `difference`, `pde`, `transforms`.
//! - **Statistics**: summaries and residual metrics of solver output.
//! - **Pipeline**: serde requests in, serde reports out, with `config` supplying defaults.
pub mod autodiff;
pub mod catalogue;
pub mod config;
pub mod difference;
pub mod equation_engine;
pub mod error;
pub mod logging;
pub mod ode;
pub mod pde;
pub mod pipeline;
pub mod registry;
pub mod solvers;
pub mod statistics;
pub mod traits;
pub mod transforms;
pub mod types;

pub use config::LabConfig;
pub use error::{ErrorKind, EvalError, FailureReport, Location, ParseError, SolveError};
pub use pipeline::{run, run_transform, SolveReport, SolveRequest, TransformRequest};
