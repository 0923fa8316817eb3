//! Kurator backup operator: configuration and controller wiring

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod config;
/// Controller futures for the Backup, Restore and Migrate intents
pub mod controller_runner;
/// CRD installation on startup
pub mod crds;
