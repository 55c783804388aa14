//! Configuration for the etcd fleet supervisor
//!
//! Handles environment variable parsing for the Supervisor and Housekeeper.

use common::ConfigExt;
use std::time::Duration;

/// Process-wide, immutable configuration resolved once at startup.
///
/// The multi-region toggle (`regions`) is captured here rather than as
/// mutable global state: either `ACTIVE_REGIONS` names the fleet's regions,
/// or (single-region mode) it falls back to the one region discovered from
/// instance metadata once `Identity` is known.
#[derive(Debug, Clone)]
pub struct Config {
    /// DNS suffix records are published under, always normalized with a
    /// single trailing dot (matching Route53's own zone `Name` format);
    /// `None` disables publication.
    pub hosted_zone: Option<String>,
    /// All regions the fleet spans. `len() > 1` means multi-region mode.
    pub regions: Vec<String>,
    /// Target etcd version, e.g. "3.4.9".
    pub etcd_version: Option<String>,
    /// Version to run while `run_old` is set.
    pub etcd_version_prev: Option<String>,
    /// Seconds to sleep after any error, after the child exits, and after
    /// each membership mutation.
    pub naptime: Duration,
    /// Local data directory, owned exclusively by this node.
    pub data_dir: String,
    /// Path to the cluster daemon binary (`.old` is appended when running
    /// the previous version).
    pub etcd_binary: String,
}

impl Config {
    pub fn from_env() -> Self {
        let regions = String::env_csv("ACTIVE_REGIONS");
        Self {
            hosted_zone: std::env::var("HOSTED_ZONE")
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}.", v.trim_end_matches('.'))),
            regions,
            etcd_version: std::env::var("ETCDVERSION").ok().filter(|v| !v.is_empty()),
            etcd_version_prev: std::env::var("ETCDVERSION_PREV").ok().filter(|v| !v.is_empty()),
            naptime: Duration::from_secs(u64::env_parse("NAPTIME", 30)),
            data_dir: String::env_or("ETCD_DATA_DIR", "data"),
            etcd_binary: String::env_or("ETCD_BINARY", "/bin/etcd"),
        }
    }

    /// True once the fleet spans more than one region.
    ///
    /// Single-region deployments never set `ACTIVE_REGIONS`; in that case
    /// the caller seeds `regions` with the one region discovered from
    /// instance metadata, which keeps this simply `len() > 1` everywhere.
    pub fn is_multiregion(&self) -> bool {
        self.regions.len() > 1
    }

    /// Path to the bootstrap-leader's binary when `run_old` forces the
    /// previous version.
    pub fn binary_path(&self, run_old: bool) -> String {
        if run_old {
            format!("{}.old", self.etcd_binary)
        } else {
            self.etcd_binary.clone()
        }
    }

    /// `etcdctl`-equivalent binary for the cluster daemon, used by the
    /// Housekeeper's `cluster-health` probe.
    pub fn ctl_binary(&self) -> String {
        format!("{}ctl", self.etcd_binary)
    }
}
