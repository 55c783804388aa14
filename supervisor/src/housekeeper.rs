//! The second worker: cluster upkeep from whichever node is currently the
//! etcd leader, plus the leaderless-upgrade handshake (spec §4.4, §9
//! "Two-worker coordination"). Grounded in `HouseKeeper` in
//! `examples/original_source/etcd.py`.

use crate::cloud::{CloudCompute, CloudDns, SgAction};
use crate::cluster_client::ClusterClient;
use crate::config::Config;
use crate::member::{Member, RawEtcdMember, DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT};
use crate::state::SharedState;
use common::command::run_combined_output;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

const SELF_MAINTENANCE_LOCK: &str = "_self_maintenance_lock";
const UPGRADE_LOCK: &str = "_upgrade_lock";
const UPGRADE_LOCK_TTL: u64 = 600;
const UPGRADE_POLL_ATTEMPTS: u32 = 59;
const UPGRADE_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct Housekeeper {
    cfg: Config,
    client: Arc<dyn ClusterClient>,
    compute: Arc<dyn CloudCompute>,
    dns: Arc<dyn CloudDns>,
    state: Arc<SharedState>,
    instance_id: String,
    self_region: String,
    members: HashMap<String, RawEtcdMember>,
}

impl Housekeeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        client: Arc<dyn ClusterClient>,
        compute: Arc<dyn CloudCompute>,
        dns: Arc<dyn CloudDns>,
        state: Arc<SharedState>,
        instance_id: String,
        self_region: String,
    ) -> Self {
        Self { cfg, client, compute, dns, state, instance_id, self_region, members: HashMap::new() }
    }

    pub async fn run(mut self) {
        let mut update_required = false;
        loop {
            if let Err(e) = self.tick(&mut update_required).await {
                error!(error = %e, "Exception in housekeeper main loop");
            }
            sleep(self.cfg.naptime).await;
        }
    }

    async fn tick(&mut self, update_required: &mut bool) -> anyhow::Result<()> {
        let snapshot = self.state.snapshot().await;
        let Some(me) = snapshot.me else { return Ok(()) };
        let multiregion = self.cfg.is_multiregion();
        let endpoint = me.client_url(multiregion);

        let active = snapshot.child_pid.is_some() && self.client.is_leader(&endpoint).await.unwrap_or(false);

        if active {
            self.active_tick(update_required, &me, &endpoint).await?;
        } else {
            self.members.clear();
            *update_required = false;

            if let Some(pid) = snapshot.child_pid {
                if snapshot.run_old && !self.cluster_unhealthy().await && self.take_upgrade_lock(&endpoint).await? {
                    self.run_upgrade_handshake(&me, &endpoint, pid).await;
                }
            }
        }

        Ok(())
    }

    async fn active_tick(&mut self, update_required: &mut bool, me: &Member, endpoint: &str) -> anyhow::Result<()> {
        let new_members = self.client.get_members(endpoint).await?;
        let changed = self.members_changed(&new_members);
        let needs_update = *update_required || changed || self.cluster_unhealthy().await;

        if !needs_update {
            return Ok(());
        }
        if self.client.lock_exists(endpoint, UPGRADE_LOCK).await? {
            return Ok(());
        }
        if !self.client.acquire_lock(endpoint, SELF_MAINTENANCE_LOCK, &self.instance_id, self.cfg.naptime.as_secs()).await? {
            return Ok(());
        }

        *update_required = true;
        let cluster_token = me.cluster_token.as_deref().unwrap_or_default();
        let fleet = self.compute.list_fleet(&self.cfg.regions, cluster_token).await?;
        if fleet.is_empty() {
            return Ok(());
        }

        self.remove_unhealthy_members(endpoint, cluster_token, &fleet).await;

        if let Some(hosted_zone) = self.cfg.hosted_zone.clone() {
            let version_suffix = cluster_token.rsplit('-').next().unwrap_or_default().to_string();
            let published: Vec<Member> = fleet
                .into_iter()
                .filter(|ec2| self.members.values().any(|row| ec2.addr_matches(&row.peer_urls)))
                .collect();
            self.dns.publish(&hosted_zone, &version_suffix, &published, self.cfg.is_multiregion()).await?;
        }

        *update_required = false;
        Ok(())
    }

    fn members_changed(&mut self, new_members: &[RawEtcdMember]) -> bool {
        let mut old = std::mem::take(&mut self.members);
        let mut changed = false;
        for m in new_members {
            match old.remove(&m.id) {
                Some(prev) if &prev == m => {}
                _ => changed = true,
            }
        }
        if !old.is_empty() {
            changed = true;
        }
        self.members = new_members.iter().map(|m| (m.id.clone(), m.clone())).collect();
        changed
    }

    /// Text-scan health probe against the cluster daemon's `cluster-health`
    /// subcommand; deliberately preserved verbatim from the original rather
    /// than replaced by a structured API call (spec §9 Open Question).
    async fn cluster_unhealthy(&self) -> bool {
        match run_combined_output(&self.cfg.ctl_binary(), &["cluster-health"]).await {
            Ok(output) => output.lines().any(|l| l.contains("unhealthy") || l.contains("unreachable")),
            Err(e) => {
                warn!(error = %e, "Failed to run cluster-health probe");
                true
            }
        }
    }

    async fn remove_unhealthy_members(&self, endpoint: &str, cluster_token: &str, fleet: &[Member]) {
        for row in self.members.values() {
            if fleet.iter().any(|ec2| ec2.addr_matches(&row.peer_urls)) {
                continue;
            }
            if let Err(e) = self.client.delete_member(endpoint, &row.id).await {
                warn!(id = %row.id, error = %e, "Failed to remove unhealthy member");
                continue;
            }
            let removed = Member::from_etcd_row(row);
            self.compute
                .adjust_security_groups(
                    &self.cfg.regions,
                    cluster_token,
                    DEFAULT_CLIENT_PORT,
                    DEFAULT_PEER_PORT,
                    SgAction::RevokeIngress,
                    std::slice::from_ref(&removed),
                    &self.self_region,
                )
                .await;
        }
    }

    async fn take_upgrade_lock(&self, endpoint: &str) -> anyhow::Result<bool> {
        Ok(self.client.acquire_lock(endpoint, UPGRADE_LOCK, &self.instance_id, UPGRADE_LOCK_TTL).await?)
    }

    async fn release_upgrade_lock(&self, endpoint: &str) {
        let _ = self.client.release_lock(endpoint, UPGRADE_LOCK, &self.instance_id).await;
    }

    /// Send SIGTERM to the daemon, then poll `cluster-health` up to 59
    /// times at a 10s cadence, releasing the upgrade lock once the cluster
    /// reports healthy again (spec §4.4).
    async fn run_upgrade_handshake(&self, me: &Member, endpoint: &str, pid: u32) {
        info!(pid, name = %me.display_name(), "Performing upgrade of member");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %e, "Failed to signal daemon for upgrade");
            return;
        }

        for _ in 0..UPGRADE_POLL_ATTEMPTS {
            sleep(UPGRADE_POLL_INTERVAL).await;
            if self.cluster_unhealthy().await {
                info!("upgrade: cluster is unhealthy...");
            } else {
                info!("upgrade complete, removing upgrade lock");
                self.release_upgrade_lock(endpoint).await;
                return;
            }
        }
        error!("upgrade: giving up...");
    }
}
