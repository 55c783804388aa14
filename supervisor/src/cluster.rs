//! The transient per-tick cluster snapshot (spec §3, §4.2).

use crate::cluster_client::ClusterClient;
use crate::member::{merge_member_lists, Member, RawEtcdMember};
use tracing::warn;

/// `{accessible_member, leader_id, cluster_version, members[]}` assembled
/// fresh on every tick.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub accessible_member: Option<Member>,
    pub leader_id: Option<String>,
    pub cluster_version: Option<String>,
    pub members: Vec<Member>,
}

impl ClusterSnapshot {
    /// True iff the cluster-reported major.minor matches the target
    /// version's prefix (spec §4.3 "Version handling").
    pub fn is_upgraded(&self, target_version: Option<&str>) -> bool {
        let Some(target) = target_version else { return false };
        let Some(prefix_end) = target.rfind('.') else { return false };
        let prefix = &target[..=prefix_end];
        self.cluster_version
            .as_deref()
            .map(|v| v.starts_with(prefix))
            .unwrap_or(false)
    }

    /// Build the snapshot: try every cloud member other than self until one
    /// answers with a non-empty member list, then merge (spec §4.1, §4.2
    /// step 1).
    pub async fn load(
        client: &dyn ClusterClient,
        ec2_members: Vec<Member>,
        self_instance_id: &str,
        multiregion: bool,
    ) -> Self {
        let mut accessible_member = None;
        let mut leader_id = None;
        let mut cluster_version = None;
        let mut etcd_members: Vec<RawEtcdMember> = Vec::new();

        for candidate in &ec2_members {
            if candidate.instance_id.as_deref() == Some(self_instance_id) {
                continue;
            }
            let endpoint = candidate.client_url(multiregion);
            match client.get_members(&endpoint).await {
                Ok(rows) if !rows.is_empty() => {
                    leader_id = client.get_leader(&endpoint).await.unwrap_or_default();
                    cluster_version = client.get_cluster_version(&endpoint).await.unwrap_or_default();
                    etcd_members = rows;
                    accessible_member = Some(candidate.clone());
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Failed to load members from peer");
                }
            }
        }

        let members = merge_member_lists(ec2_members, &etcd_members);

        Self {
            accessible_member,
            leader_id,
            cluster_version,
            members,
        }
    }
}

/// Healthy-to-join check (spec §4.2 step 2, §8 invariant 3).
///
/// Scans members in order:
/// - self known to the cluster by name → healthy
/// - a member with no cloud instance id (not part of our fleet) → unhealthy
/// - a half-joined row (`id` set, `name`/`client_urls` empty) → healthy iff
///   it is our own half-finished join
/// - otherwise → healthy
pub fn is_healthy(members: &[Member], me: &Member) -> bool {
    for m in members {
        if m.name == me.instance_id.clone().unwrap_or_default() {
            return true;
        }
        if m.instance_id.is_none() {
            warn!(id = ?m.id, name = %m.name, "Member is not part of the autoscaling group");
            return false;
        }
        if m.id.is_some() && m.name.is_empty() && m.client_urls.is_empty() {
            if me.addr_matches(&m.peer_urls) {
                return true;
            }
            warn!(id = ?m.id, peer_urls = ?m.peer_urls, "Member is registered but not yet joined");
            return false;
        }
    }
    true
}
