//! Tick-abort signaling for the reconciliation core.
//!
//! The join-plan state machine in `reconcile` needs to distinguish "nothing
//! to do this tick" from "a cluster precondition is unmet, abandon this
//! tick" without unwinding the process. `ClusterError` is that second case;
//! it is caught by the supervisor's outer loop, logged, and followed by the
//! usual `NAPTIME` sleep — it is a tick-abort signal, not a process error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("etcd cluster does not have a leader yet; cannot {0}")]
    NoLeader(&'static str),

    #[error("cluster mutation failed: {0}")]
    MutationFailed(String),

    #[error("could not resolve own member identity")]
    UnknownSelf,
}
