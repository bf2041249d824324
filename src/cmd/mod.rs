//! CLI glue.
//!
//! | Module    | Concern                                        |
//! |-----------|------------------------------------------------|
//! | `logging` | `tracing` subscriber setup                     |
//! | `run`     | config resolution, the run itself, the report  |

pub mod logging;
pub mod run;

pub use logging::init_tracing;
pub use run::run_harness;
