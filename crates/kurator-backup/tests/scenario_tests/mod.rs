//! Stories of platform operators protecting and moving workloads across a fleet
//!
//! - `backup`: fanning a Backup out to every member and following its progress
//! - `restore`: restoring into all or part of the backup's clusters
//! - `migrate`: backing up one cluster and restoring into others
//! - `deletion`: cascading cleanup of agent objects when an intent goes away

mod backup;
mod fakes;
mod migrate;
mod restore;
