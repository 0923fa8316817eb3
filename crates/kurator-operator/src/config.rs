//! Operator configuration
//!
//! Every flag can also be set through the environment so the Deployment
//! manifest does not need to repeat them as arguments.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use kurator_common::KURATOR_SYSTEM_NAMESPACE;

/// Kurator backup operator - fans Backup, Restore and Migrate intents out to fleet members
#[derive(Parser, Debug, Clone)]
#[command(name = "kurator-backup-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Reconciles run in parallel per controller
    #[arg(long, env = "KURATOR_MAX_CONCURRENT_RECONCILES", default_value_t = 4)]
    pub max_concurrent_reconciles: u16,

    /// Only run controllers while holding the leader lease
    #[arg(
        long,
        env = "KURATOR_LEADER_ELECTION",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub leader_election: bool,

    /// Namespace of the leader lease
    #[arg(long, env = "KURATOR_LEASE_NAMESPACE", default_value = KURATOR_SYSTEM_NAMESPACE)]
    pub lease_namespace: String,

    /// Lease holder identity, normally the pod name
    #[arg(long, env = "POD_NAME")]
    pub identity: Option<String>,

    /// Kubeconfig of the host cluster; in-cluster config when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
}

impl Cli {
    /// Identity used for the leader lease
    ///
    /// Falls back to the hostname, which is the pod name inside Kubernetes.
    pub fn lease_identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("kurator-backup-operator-{}", std::process::id()))
    }

    /// Reconcile concurrency, at least one
    pub fn concurrency(&self) -> u16 {
        self.max_concurrent_reconciles.max(1)
    }
}
