//! `dbheal`: crash-recovery test harness for a state database.
//!
//! A sync process is repeatedly killed mid-write; after each kill the
//! archive is rolled back to a checkpoint it committed, the live store is
//! rebuilt from that checkpoint, and the sync is resumed from the next
//! block. Any failure of the sync process or of the recovery steps ends the
//! run.

pub mod config;
pub mod errors;
pub mod monitor;
pub mod orchestrator;
pub mod recovery;
pub mod report;
pub mod supervisor;
pub mod ui;
pub mod workspace;
