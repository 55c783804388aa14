//! etcd fleet supervisor
//!
//! Runs two cooperating tasks against an AWS autoscaling-group fleet:
//! - the Supervisor owns the cluster daemon child process, reconciling
//!   cluster membership before every (re)start
//! - the Housekeeper, active only from whichever node is currently the
//!   etcd leader, evicts stale members and republishes DNS, and drives the
//!   leaderless-upgrade handshake otherwise
//!
//! On shutdown, this node makes a best-effort attempt to remove itself
//! from the cluster before exiting.

mod cloud;
mod cluster;
mod cluster_client;
mod config;
mod datadir;
mod error;
mod housekeeper;
mod identity;
mod member;
mod reconcile;
mod state;
mod supervisor;

use anyhow::{Context, Result};
use cloud::{Ec2Compute, Route53Dns};
use cluster_client::ReqwestClusterClient;
use common::init_logging;
use config::Config;
use housekeeper::Housekeeper;
use state::SharedState;
use std::sync::Arc;
use supervisor::Supervisor;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logging("etcd-supervisor");

    let mut cfg = Config::from_env();
    let identity = identity::resolve().await.context("resolving instance identity")?;
    info!(instance_id = %identity.instance_id, region = %identity.region, "Resolved instance identity");

    if cfg.regions.is_empty() {
        cfg.regions = vec![identity.region.clone()];
    }

    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
    let client: Arc<dyn cluster_client::ClusterClient> = Arc::new(ReqwestClusterClient::new()?);
    let compute: Arc<dyn cloud::CloudCompute> = Arc::new(Ec2Compute::new(&aws_config));
    let dns: Arc<dyn cloud::CloudDns> = Arc::new(Route53Dns::new(&aws_config));
    let state = Arc::new(SharedState::new());

    let housekeeper = Housekeeper::new(
        cfg.clone(),
        client.clone(),
        compute.clone(),
        dns,
        state.clone(),
        identity.instance_id.clone(),
        identity.region.clone(),
    );
    tokio::spawn(housekeeper.run());

    let mut sup = Supervisor::new(cfg.clone(), client.clone(), compute.clone(), state.clone(), identity.clone());
    let run_result = sup.run().await;

    info!("Trying to remove myself from cluster...");
    if let Err(e) = remove_self(&cfg, client.as_ref(), compute.as_ref(), &state).await {
        error!(error = %e, "Failed to remove myself from cluster");
    }

    run_result
}

/// Best-effort self-removal on shutdown (spec §5, §6): if this node is
/// still a named member of an accessible cluster, delete it.
async fn remove_self(
    cfg: &Config,
    client: &dyn cluster_client::ClusterClient,
    compute: &dyn cloud::CloudCompute,
    state: &SharedState,
) -> Result<()> {
    let Some(me) = state.snapshot().await.me else {
        return Ok(());
    };

    let cluster_token = me.cluster_token.clone().unwrap_or_default();
    let ec2_members = compute.list_fleet(&cfg.regions, &cluster_token).await.unwrap_or_else(|_| vec![me.clone()]);
    let cluster = cluster::ClusterSnapshot::load(client, ec2_members, me.instance_id.as_deref().unwrap_or(""), cfg.is_multiregion()).await;

    let Some(accessible) = cluster.accessible_member else {
        anyhow::bail!("cluster does not have an accessible member");
    };

    let known = cluster.members.iter().any(|m| m.name == me.instance_id.clone().unwrap_or_default());
    if !known {
        return Ok(());
    }

    let endpoint = accessible.client_url(cfg.is_multiregion());
    let id = cluster
        .members
        .iter()
        .find(|m| m.name == me.instance_id.clone().unwrap_or_default())
        .and_then(|m| m.id.clone())
        .context("member row missing id")?;

    client.delete_member(&endpoint, &id).await.context("cannot remove myself from cluster")?;

    compute
        .adjust_security_groups(
            &cfg.regions,
            &cluster_token,
            member::DEFAULT_CLIENT_PORT,
            member::DEFAULT_PEER_PORT,
            cloud::SgAction::RevokeIngress,
            std::slice::from_ref(&me),
            me.region.as_deref().unwrap_or_default(),
        )
        .await;

    Ok(())
}
