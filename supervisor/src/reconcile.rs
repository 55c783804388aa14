//! The join-plan state machine (spec §4.3).
//!
//! `reconcile` decides, once per tick, whether this node needs to mutate
//! cluster membership before it can start the daemon, and what arguments
//! that daemon should be started with. It never touches the child process
//! itself — that is the Supervisor's job once it has a `JoinPlan` in hand.

use crate::cloud::{CloudCompute, SgAction};
use crate::cluster::ClusterSnapshot;
use crate::cluster_client::ClusterClient;
use crate::config::Config;
use crate::datadir;
use crate::error::ClusterError;
use crate::member::{Member, DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT};
use std::path::Path;
use tokio::time::sleep;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    New,
    Existing,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::New => "new",
            ClusterState::Existing => "existing",
        }
    }
}

/// Everything the Supervisor needs to start (or restart) the daemon this
/// tick (spec §4.3, §6).
#[derive(Debug, Clone)]
pub struct JoinPlan {
    pub cluster_state: ClusterState,
    pub initial_cluster: String,
    pub run_old: bool,
}

/// Outcome of one reconciliation tick. `Skip` is routine (retry next
/// tick); a `ClusterError` (returned as `Err`) aborts the tick and is
/// logged by the caller before the usual `NAPTIME` sleep.
#[derive(Debug)]
pub enum TickResult {
    Plan(JoinPlan),
    Skip(String),
}

/// Run the healthy-to-join check, then the join-plan decision table.
pub async fn reconcile(
    cfg: &Config,
    cluster: &ClusterSnapshot,
    me: &Member,
    client: &dyn ClusterClient,
    compute: &dyn CloudCompute,
) -> Result<TickResult, ClusterError> {
    if !crate::cluster::is_healthy(&cluster.members, me) {
        return Ok(TickResult::Skip(
            "a fleet member is not yet reconciled with the cluster".to_string(),
        ));
    }

    let plan = register_me(cfg, cluster, me, client, compute).await?;
    Ok(TickResult::Plan(plan))
}

/// The decision table itself (spec §4.3):
///
/// | accessible | client_urls | id | name | data exists | action |
/// |---|---|---|---|---|---|
/// | no  | -   | -   | -   | -   | no membership change; state = existing iff data exists, else new |
/// | yes | yes | -   | -   | yes | no membership change; existing |
/// | yes | yes | -   | -   | no  | wipe; remove self, re-add self; existing |
/// | yes | no  | yes | yes | -   | wipe; new |
/// | yes | no  | yes | no  | -   | wipe; existing (half-joined resume) |
/// | yes | no  | no  | -   | -   | wipe; add self; existing |
async fn register_me(
    cfg: &Config,
    cluster: &ClusterSnapshot,
    me: &Member,
    client: &dyn ClusterClient,
    compute: &dyn CloudCompute,
) -> Result<JoinPlan, ClusterError> {
    let data_dir = Path::new(&cfg.data_dir);
    let data_exists = datadir::data_exists(data_dir).await;

    let mut include_ec2_instances = false;
    let mut add_member = false;
    let mut remove_member = false;
    let mut wipe_needed = false;
    let cluster_state;

    match &cluster.accessible_member {
        None => {
            include_ec2_instances = true;
            cluster_state = if data_exists { ClusterState::Existing } else { ClusterState::New };
        }
        Some(accessible) => {
            if !me.client_urls.is_empty() {
                remove_member = !data_exists;
                add_member = !data_exists;
                wipe_needed = !data_exists;
                cluster_state = ClusterState::Existing;
            } else if me.id.is_some() {
                wipe_needed = true;
                cluster_state = if me.name.is_empty() { ClusterState::Existing } else { ClusterState::New };
            } else {
                add_member = true;
                wipe_needed = true;
                cluster_state = ClusterState::Existing;
            }

            if add_member || remove_member {
                let endpoint = accessible.client_url(cfg.is_multiregion());
                let leader_id = cluster
                    .leader_id
                    .as_ref()
                    .ok_or(ClusterError::NoLeader("mutate cluster membership"))?;
                info!(leader = %leader_id, "Leader confirmed, proceeding with membership change");

                if remove_member {
                    let id = me
                        .id
                        .clone()
                        .ok_or(ClusterError::UnknownSelf)?;
                    client
                        .delete_member(&endpoint, &id)
                        .await
                        .map_err(|e| ClusterError::MutationFailed(e.to_string()))?;
                    compute
                        .adjust_security_groups(
                            &cfg.regions,
                            me.cluster_token.as_deref().unwrap_or_default(),
                            DEFAULT_CLIENT_PORT,
                            DEFAULT_PEER_PORT,
                            SgAction::RevokeIngress,
                            std::slice::from_ref(me),
                            me.region.as_deref().unwrap_or_default(),
                        )
                        .await;
                    sleep(cfg.naptime).await;
                }
                if add_member {
                    client
                        .add_member(&endpoint, &me.peer_url(cfg.is_multiregion()))
                        .await
                        .map_err(|e| ClusterError::MutationFailed(e.to_string()))?;
                    sleep(cfg.naptime).await;
                }
            }

            if wipe_needed {
                datadir::wipe(data_dir).await;
            }
        }
    }

    let run_old = add_member && cluster_state == ClusterState::Existing && !cluster.is_upgraded(cfg.etcd_version.as_deref());

    let initial_cluster = build_initial_cluster(&cluster.members, include_ec2_instances, cfg.is_multiregion());

    Ok(JoinPlan { cluster_state, initial_cluster, run_old })
}

/// `name=peer_url` CSV for `-initial-cluster` (spec §4.1 step 3, §4.3):
/// either the fleet-wide candidate set (`include_ec2_instances`, used when
/// nobody answered this tick) or only rows the cluster itself reports.
fn build_initial_cluster(members: &[Member], include_ec2_instances: bool, multiregion: bool) -> String {
    members
        .iter()
        .filter(|m| (include_ec2_instances && m.instance_id.is_some()) || !m.peer_urls.is_empty())
        .map(|m| format!("{}={}", m.display_name(), m.peer_url(multiregion)))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_client::ClusterClient;
    use crate::member::{RawEtcdMember, AG_TAG, CF_TAG};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::Mutex as AsyncMutex;

    fn cloud_member(id: &str, ip: &str) -> Member {
        let mut tags = HashMap::new();
        tags.insert(CF_TAG.to_string(), "etc-cluster".to_string());
        tags.insert(AG_TAG.to_string(), "etc-cluster-postgres".to_string());
        Member::from_cloud(id, Some(ip.to_string()), None, None, None, &tags, "eu-west-1")
    }

    fn base_config(data_dir: &str) -> Config {
        Config {
            hosted_zone: None,
            regions: vec!["eu-west-1".to_string()],
            etcd_version: Some("3.4.9".to_string()),
            etcd_version_prev: None,
            naptime: std::time::Duration::from_millis(1),
            data_dir: data_dir.to_string(),
            etcd_binary: "/bin/etcd".to_string(),
        }
    }

    #[derive(Default)]
    struct FakeClient {
        added: Mutex<Vec<String>>,
        deleted: AsyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl ClusterClient for FakeClient {
        async fn get_members(&self, _endpoint: &str) -> Result<Vec<RawEtcdMember>> {
            Ok(vec![])
        }
        async fn is_leader(&self, _endpoint: &str) -> Result<bool> {
            Ok(false)
        }
        async fn get_leader(&self, _endpoint: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn get_cluster_version(&self, _endpoint: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn add_member(&self, _endpoint: &str, peer_url: &str) -> Result<RawEtcdMember> {
            self.added.lock().unwrap().push(peer_url.to_string());
            Ok(RawEtcdMember {
                id: "inew".to_string(),
                name: String::new(),
                peer_urls: vec![peer_url.to_string()],
                client_urls: vec![],
            })
        }
        async fn delete_member(&self, _endpoint: &str, id: &str) -> Result<()> {
            self.deleted.lock().await.push(id.to_string());
            Ok(())
        }
        async fn acquire_lock(&self, _e: &str, _k: &str, _v: &str, _ttl: u64) -> Result<bool> {
            Ok(true)
        }
        async fn lock_exists(&self, _e: &str, _k: &str) -> Result<bool> {
            Ok(false)
        }
        async fn release_lock(&self, _e: &str, _k: &str, _v: &str) -> Result<bool> {
            Ok(true)
        }
    }

    struct NullCompute;

    #[async_trait]
    impl CloudCompute for NullCompute {
        async fn describe_self(&self, _region: &str, _instance_id: &str) -> Result<Option<Member>> {
            Ok(None)
        }
        async fn list_fleet(&self, _regions: &[String], _cluster_token: &str) -> Result<Vec<Member>> {
            Ok(vec![])
        }
        async fn adjust_security_groups(
            &self,
            _regions: &[String],
            _cluster_token: &str,
            _client_port: u16,
            _peer_port: u16,
            _action: SgAction,
            _members: &[Member],
            _self_region: &str,
        ) {
        }
    }

    #[derive(Default)]
    struct RecordingCompute {
        revoked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CloudCompute for RecordingCompute {
        async fn describe_self(&self, _region: &str, _instance_id: &str) -> Result<Option<Member>> {
            Ok(None)
        }
        async fn list_fleet(&self, _regions: &[String], _cluster_token: &str) -> Result<Vec<Member>> {
            Ok(vec![])
        }
        async fn adjust_security_groups(
            &self,
            _regions: &[String],
            _cluster_token: &str,
            _client_port: u16,
            _peer_port: u16,
            action: SgAction,
            members: &[Member],
            _self_region: &str,
        ) {
            if action == SgAction::RevokeIngress {
                for m in members {
                    self.revoked.lock().unwrap().push(m.display_name().to_string());
                }
            }
        }
    }

    fn temp_data_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("supervisor-reconcile-{}-{}", name, std::process::id()))
    }

    #[tokio::test]
    async fn cold_start_three_node_fleet_none_reachable() {
        let data_dir = temp_data_dir("cold-start");
        let cfg = base_config(data_dir.to_str().unwrap());
        let me = cloud_member("i-deadbeef1", "127.0.0.1");
        let others = vec![cloud_member("i-deadbeef2", "127.0.0.2"), cloud_member("i-deadbeef3", "127.0.0.3")];
        let mut members = vec![me.clone()];
        members.extend(others);
        members.sort_by(|a, b| a.display_name().cmp(b.display_name()));

        let cluster = ClusterSnapshot { accessible_member: None, leader_id: None, cluster_version: None, members };
        let client = FakeClient::default();

        let result = reconcile(&cfg, &cluster, &me, &client, &NullCompute).await.unwrap();
        match result {
            TickResult::Plan(plan) => {
                assert_eq!(plan.cluster_state, ClusterState::New);
                assert!(!plan.run_old);
                assert!(plan.initial_cluster.contains("i-deadbeef1="));
                assert!(plan.initial_cluster.contains("i-deadbeef2="));
                assert!(plan.initial_cluster.contains("i-deadbeef3="));
            }
            TickResult::Skip(reason) => panic!("expected a plan, got skip: {reason}"),
        }
        assert!(client.added.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn warm_rejoin_with_data_dir_present() {
        let data_dir = temp_data_dir("warm-rejoin");
        tokio::fs::create_dir_all(&data_dir).await.unwrap();
        let cfg = base_config(data_dir.to_str().unwrap());
        let me = cloud_member("i-deadbeef1", "127.0.0.1");

        let cluster = ClusterSnapshot {
            accessible_member: None,
            leader_id: None,
            cluster_version: None,
            members: vec![me.clone()],
        };
        let client = FakeClient::default();

        let result = reconcile(&cfg, &cluster, &me, &client, &NullCompute).await.unwrap();
        match result {
            TickResult::Plan(plan) => assert_eq!(plan.cluster_state, ClusterState::Existing),
            TickResult::Skip(reason) => panic!("expected a plan, got skip: {reason}"),
        }
        tokio::fs::remove_dir_all(&data_dir).await.ok();
    }

    #[tokio::test]
    async fn churn_removes_and_readds_self_and_revokes_its_old_sg_ingress() {
        let data_dir = temp_data_dir("churn");
        let cfg = base_config(data_dir.to_str().unwrap());

        let mut me = cloud_member("i-deadbeef1", "127.0.0.1");
        me.id = Some("iold".to_string());
        me.name = "i-deadbeef1".to_string();
        me.client_urls = vec!["http://127.0.0.1:2379".to_string()];

        let accessible = cloud_member("i-deadbeef2", "127.0.0.2");
        let cluster = ClusterSnapshot {
            accessible_member: Some(accessible),
            leader_id: Some("ileader".to_string()),
            cluster_version: Some("3.4.9".to_string()),
            members: vec![me.clone()],
        };
        let client = FakeClient::default();
        let compute = RecordingCompute::default();

        let result = reconcile(&cfg, &cluster, &me, &client, &compute).await.unwrap();
        match result {
            TickResult::Plan(plan) => assert_eq!(plan.cluster_state, ClusterState::Existing),
            TickResult::Skip(reason) => panic!("expected a plan, got skip: {reason}"),
        }
        assert_eq!(client.deleted.lock().await.as_slice(), ["iold"]);
        assert_eq!(client.added.lock().unwrap().len(), 1);
        assert_eq!(compute.revoked.lock().unwrap().as_slice(), ["i-deadbeef1"]);
    }

    #[tokio::test]
    async fn half_joined_resume_keeps_existing_state_and_wipes_without_remote_calls() {
        let data_dir = temp_data_dir("half-joined");
        tokio::fs::create_dir_all(&data_dir).await.unwrap();
        let cfg = base_config(data_dir.to_str().unwrap());

        let mut me = cloud_member("i-deadbeef1", "127.0.0.1");
        me.id = Some("ihalf".to_string());
        me.name = String::new();

        let accessible = cloud_member("i-deadbeef2", "127.0.0.2");
        let cluster = ClusterSnapshot {
            accessible_member: Some(accessible),
            leader_id: Some("ihalf".to_string()),
            cluster_version: Some("3.4.9".to_string()),
            members: vec![me.clone()],
        };
        let client = FakeClient::default();

        let result = reconcile(&cfg, &cluster, &me, &client, &NullCompute).await.unwrap();
        match result {
            TickResult::Plan(plan) => {
                assert_eq!(plan.cluster_state, ClusterState::Existing);
                assert!(!plan.run_old);
            }
            TickResult::Skip(reason) => panic!("expected a plan, got skip: {reason}"),
        }
        assert!(client.added.lock().unwrap().is_empty());
        assert!(!datadir::data_exists(&data_dir).await);
    }

    #[tokio::test]
    async fn fresh_node_with_no_id_adds_self_and_requires_a_leader() {
        let data_dir = temp_data_dir("add-self");
        let cfg = base_config(data_dir.to_str().unwrap());
        let me = cloud_member("i-deadbeef1", "127.0.0.1");
        let accessible = cloud_member("i-deadbeef2", "127.0.0.2");

        let cluster_no_leader = ClusterSnapshot {
            accessible_member: Some(accessible.clone()),
            leader_id: None,
            cluster_version: Some("3.4.9".to_string()),
            members: vec![me.clone(), accessible.clone()],
        };
        let client = FakeClient::default();
        let err = reconcile(&cfg, &cluster_no_leader, &me, &client, &NullCompute).await.unwrap_err();
        assert!(matches!(err, ClusterError::NoLeader(_)));

        let cluster_with_leader = ClusterSnapshot {
            accessible_member: Some(accessible.clone()),
            leader_id: Some("ileader".to_string()),
            cluster_version: Some("3.4.9".to_string()),
            members: vec![me.clone(), accessible],
        };
        let result = reconcile(&cfg, &cluster_with_leader, &me, &client, &NullCompute).await.unwrap();
        match result {
            TickResult::Plan(plan) => assert_eq!(plan.cluster_state, ClusterState::Existing),
            TickResult::Skip(reason) => panic!("expected a plan, got skip: {reason}"),
        }
        assert_eq!(client.added.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_old_set_when_joining_existing_unupgraded_cluster() {
        let data_dir = temp_data_dir("run-old");
        let mut cfg = base_config(data_dir.to_str().unwrap());
        cfg.etcd_version = Some("3.5.0".to_string());
        let me = cloud_member("i-deadbeef1", "127.0.0.1");
        let accessible = cloud_member("i-deadbeef2", "127.0.0.2");

        let cluster = ClusterSnapshot {
            accessible_member: Some(accessible.clone()),
            leader_id: Some("ileader".to_string()),
            cluster_version: Some("3.4.9".to_string()),
            members: vec![me.clone(), accessible],
        };
        let client = FakeClient::default();
        let result = reconcile(&cfg, &cluster, &me, &client, &NullCompute).await.unwrap();
        match result {
            TickResult::Plan(plan) => assert!(plan.run_old),
            TickResult::Skip(reason) => panic!("expected a plan, got skip: {reason}"),
        }
    }

    #[tokio::test]
    async fn unreconciled_member_yields_skip_not_error() {
        let data_dir = temp_data_dir("skip");
        let cfg = base_config(data_dir.to_str().unwrap());
        let me = cloud_member("i-deadbeef1", "127.0.0.1");
        let zombie = Member::from_etcd_row(&RawEtcdMember {
            id: "izombie".to_string(),
            name: "i-zombie".to_string(),
            peer_urls: vec!["http://10.0.0.9:2380".to_string()],
            client_urls: vec!["http://10.0.0.9:2379".to_string()],
        });
        let cluster = ClusterSnapshot {
            accessible_member: None,
            leader_id: None,
            cluster_version: None,
            members: vec![zombie],
        };
        let client = FakeClient::default();
        let result = reconcile(&cfg, &cluster, &me, &client, &NullCompute).await.unwrap();
        assert!(matches!(result, TickResult::Skip(_)));
    }
}
