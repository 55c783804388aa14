//! The first worker: own the child daemon process (spec §4.3, §9
//! "Two-worker coordination"). Grounded in `EtcdManager.run` in
//! `examples/original_source/etcd.py` for the tick structure, and in
//! `start_etcd`/`run_monitoring_loop` in the teacher's `etcd::cluster` and
//! `postgres-patroni::patroni::monitoring` for the child-process and
//! signal-handling idiom.

use crate::cloud::{CloudCompute, SgAction};
use crate::cluster::ClusterSnapshot;
use crate::cluster_client::ClusterClient;
use crate::config::Config;
use crate::member::{Member, DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT};
use crate::reconcile::{reconcile, TickResult};
use crate::state::SharedState;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;
use tracing::{error, info, warn};

pub struct Supervisor {
    cfg: Config,
    client: Arc<dyn ClusterClient>,
    compute: Arc<dyn CloudCompute>,
    state: Arc<SharedState>,
    identity: crate::identity::Identity,
    cluster_token: Option<String>,
    access_granted: bool,
}

impl Supervisor {
    pub fn new(
        cfg: Config,
        client: Arc<dyn ClusterClient>,
        compute: Arc<dyn CloudCompute>,
        state: Arc<SharedState>,
        identity: crate::identity::Identity,
    ) -> Self {
        Self { cfg, client, compute, state, identity, cluster_token: None, access_granted: false }
    }

    /// Run ticks until an external SIGTERM/SIGINT is observed, then return
    /// so the caller can perform terminal cleanup (spec §5, §6).
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    self.signal_child().await;
                    return Ok(());
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    self.signal_child().await;
                    return Ok(());
                }
                result = self.tick() => {
                    if let Err(e) = result {
                        error!(error = %e, "Exception in supervisor main loop");
                    }
                }
            }
            info!(naptime = ?self.cfg.naptime, "Sleeping before next try...");
            sleep(self.cfg.naptime).await;
        }
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let ec2_members = self.fleet().await?;
        let me = self.resolve_self(&ec2_members);
        self.state.set_me(me.clone()).await;

        let cluster = ClusterSnapshot::load(
            self.client.as_ref(),
            ec2_members,
            &self.identity.instance_id,
            self.cfg.is_multiregion(),
        )
        .await;

        match reconcile(&self.cfg, &cluster, &me, self.client.as_ref(), self.compute.as_ref()).await {
            Ok(TickResult::Skip(reason)) => {
                info!(reason = %reason, "Skipping this tick");
            }
            Ok(TickResult::Plan(plan)) => {
                self.spawn_and_wait(&me, plan).await?;
            }
            Err(e) => {
                warn!(error = %e, "Cluster precondition unmet, abandoning this tick");
            }
        }
        Ok(())
    }

    /// On shutdown, forward the signal to whichever child is currently
    /// running so it is not left orphaned when `tick`'s future is dropped
    /// by the `select!` (spec §5 "Cancellation").
    async fn signal_child(&self) {
        if let Some(pid) = self.state.child_pid().await {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = %e, "Failed to signal child on shutdown");
            }
        }
    }

    async fn fleet(&mut self) -> anyhow::Result<Vec<Member>> {
        let cluster_token = match &self.cluster_token {
            Some(t) => t.clone(),
            None => {
                let token = self.discover_own_cluster_token().await?;
                self.cluster_token = Some(token.clone());
                token
            }
        };
        let members = self.compute.list_fleet(&self.cfg.regions, &cluster_token).await?;

        if !self.access_granted {
            self.compute
                .adjust_security_groups(
                    &self.cfg.regions,
                    &cluster_token,
                    DEFAULT_CLIENT_PORT,
                    DEFAULT_PEER_PORT,
                    SgAction::AuthorizeIngress,
                    &members,
                    &self.identity.region,
                )
                .await;
            self.access_granted = true;
        }

        Ok(members)
    }

    /// The cluster token (CloudFormation/stack tag) is only known once this
    /// node's own instance record is fetched; the first call seeds it
    /// before the normal per-tick fleet scan can run.
    async fn discover_own_cluster_token(&self) -> anyhow::Result<String> {
        self.compute
            .describe_self(&self.identity.region, &self.identity.instance_id)
            .await?
            .and_then(|m| m.cluster_token)
            .ok_or_else(|| anyhow::anyhow!("could not determine this instance's cluster token"))
    }

    fn resolve_self(&self, ec2_members: &[Member]) -> Member {
        ec2_members
            .iter()
            .find(|m| m.instance_id.as_deref() == Some(self.identity.instance_id.as_str()))
            .cloned()
            .unwrap_or_else(|| {
                Member::from_cloud(
                    self.identity.instance_id.clone(),
                    None,
                    None,
                    None,
                    None,
                    &std::collections::HashMap::new(),
                    self.identity.region.clone(),
                )
            })
    }

    async fn spawn_and_wait(&mut self, me: &Member, plan: crate::reconcile::JoinPlan) -> anyhow::Result<()> {
        let data_dir = Path::new(&self.cfg.data_dir);
        let binary = self.cfg.binary_path(plan.run_old);
        let args = me.etcd_arguments(
            data_dir,
            &plan.initial_cluster,
            plan.cluster_state.as_str(),
            plan.run_old,
            self.cfg.is_multiregion(),
            self.cfg.etcd_version.as_deref(),
            self.cfg.etcd_version_prev.as_deref(),
        );

        info!(binary = %binary, args = ?args, "Starting cluster daemon");
        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        let pid = child.id();
        self.state.set_child(pid, plan.run_old).await;
        info!(pid = ?pid, "Cluster daemon started");

        let status = child.wait().await;
        self.state.set_child(None, false).await;

        match status {
            Ok(status) => warn!(?status, "Cluster daemon exited"),
            Err(e) => error!(error = %e, "Failed to wait on cluster daemon"),
        }

        Ok(())
    }
}
