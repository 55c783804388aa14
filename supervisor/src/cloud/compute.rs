//! Cloud compute inventory: fleet discovery and cross-region security
//! group upkeep (spec §6, §4.4).

use crate::member::{Member, CF_TAG};
use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_ec2::types::Filter;
use aws_sdk_ec2::Client as Ec2Client;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgAction {
    AuthorizeIngress,
    RevokeIngress,
}

#[async_trait]
pub trait CloudCompute: Send + Sync {
    /// Look up this node's own instance record, which carries the cluster
    /// token tag that seeds every later fleet scan (spec §3 Lifecycle;
    /// `find_my_instance` in the original).
    async fn describe_self(&self, region: &str, instance_id: &str) -> Result<Option<Member>>;

    /// Enumerate running instances tagged with `cluster_token` across
    /// every configured region (spec §6 "Cloud compute inventory").
    async fn list_fleet(&self, regions: &[String], cluster_token: &str) -> Result<Vec<Member>>;

    /// Authorize or revoke TCP ingress on `client_port..=peer_port` from
    /// each member's address, on every cross-region security group tagged
    /// with the same stack (spec §4.4). No-op in single-region mode.
    async fn adjust_security_groups(
        &self,
        regions: &[String],
        cluster_token: &str,
        client_port: u16,
        peer_port: u16,
        action: SgAction,
        members: &[Member],
        self_region: &str,
    );
}

pub struct Ec2Compute {
    client: Ec2Client,
}

impl Ec2Compute {
    pub fn new(aws_config: &aws_config::SdkConfig) -> Self {
        Self { client: Ec2Client::new(aws_config) }
    }
}

#[async_trait]
impl CloudCompute for Ec2Compute {
    async fn describe_self(&self, region: &str, instance_id: &str) -> Result<Option<Member>> {
        let filter = Filter::builder().name("instance-id").values(instance_id).build();
        let response = self.client.describe_instances().filters(filter).send().await?;

        for reservation in response.reservations() {
            for instance in reservation.instances() {
                if instance.instance_id() != Some(instance_id) {
                    continue;
                }
                let tags: HashMap<String, String> = instance
                    .tags()
                    .iter()
                    .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
                    .collect();
                if !tags.contains_key(CF_TAG) {
                    continue;
                }
                return Ok(Some(Member::from_cloud(
                    instance_id,
                    instance.private_ip_address().map(str::to_string),
                    instance.public_ip_address().map(str::to_string),
                    instance.private_dns_name().map(str::to_string),
                    instance.public_dns_name().map(str::to_string),
                    &tags,
                    region,
                )));
            }
        }
        Ok(None)
    }

    async fn list_fleet(&self, regions: &[String], cluster_token: &str) -> Result<Vec<Member>> {
        let mut members = Vec::new();

        for region in regions {
            let filter = Filter::builder().name(format!("tag:{CF_TAG}")).values(cluster_token).build();
            let response = self.client.describe_instances().filters(filter).send().await?;

            for reservation in response.reservations() {
                for instance in reservation.instances() {
                    if instance.state().and_then(|s| s.name()).map(|n| n.as_str()) != Some("running") {
                        continue;
                    }
                    let tags: HashMap<String, String> = instance
                        .tags()
                        .iter()
                        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
                        .collect();
                    if tags.get(CF_TAG).map(String::as_str) != Some(cluster_token) {
                        continue;
                    }
                    let Some(instance_id) = instance.instance_id() else { continue };
                    members.push(Member::from_cloud(
                        instance_id,
                        instance.private_ip_address().map(str::to_string),
                        instance.public_ip_address().map(str::to_string),
                        instance.private_dns_name().map(str::to_string),
                        instance.public_dns_name().map(str::to_string),
                        &tags,
                        region.clone(),
                    ));
                }
            }
        }

        Ok(members)
    }

    async fn adjust_security_groups(
        &self,
        regions: &[String],
        cluster_token: &str,
        client_port: u16,
        peer_port: u16,
        action: SgAction,
        members: &[Member],
        self_region: &str,
    ) {
        if regions.len() <= 1 {
            return;
        }

        for region in regions {
            let client = if region == self_region {
                self.client.clone()
            } else {
                // a peer-region client; the teacher pattern (shared `aws_config::SdkConfig`)
                // does not cover cross-region clients, so build one directly
                let cfg = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(aws_config::Region::new(region.clone()))
                    .load()
                    .await;
                Ec2Client::new(&cfg)
            };

            let groups = match client.describe_security_groups().send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(region = %region, error = %e, "Failed to list security groups");
                    continue;
                }
            };

            for sg in groups.security_groups() {
                let tagged = sg
                    .tags()
                    .iter()
                    .any(|t| t.key() == Some(CF_TAG) && t.value() == Some(cluster_token));
                if !tagged {
                    continue;
                }
                let Some(group_id) = sg.group_id() else { continue };

                for m in members {
                    if m.region.as_deref() == Some(region.as_str()) {
                        continue;
                    }
                    let Some(addr) = m.private_ip_address.clone().or_else(|| m.public_ip_address.clone()) else {
                        continue;
                    };
                    let cidr = format!("{addr}/32");
                    let result = match action {
                        SgAction::AuthorizeIngress => {
                            client
                                .authorize_security_group_ingress()
                                .group_id(group_id)
                                .ip_permissions(
                                    aws_sdk_ec2::types::IpPermission::builder()
                                        .ip_protocol("tcp")
                                        .from_port(client_port as i32)
                                        .to_port(peer_port as i32)
                                        .ip_ranges(aws_sdk_ec2::types::IpRange::builder().cidr_ip(&cidr).build())
                                        .build(),
                                )
                                .send()
                                .await
                                .map(|_| ())
                        }
                        SgAction::RevokeIngress => {
                            client
                                .revoke_security_group_ingress()
                                .group_id(group_id)
                                .ip_permissions(
                                    aws_sdk_ec2::types::IpPermission::builder()
                                        .ip_protocol("tcp")
                                        .from_port(client_port as i32)
                                        .to_port(peer_port as i32)
                                        .ip_ranges(aws_sdk_ec2::types::IpRange::builder().cidr_ip(&cidr).build())
                                        .build(),
                                )
                                .send()
                                .await
                                .map(|_| ())
                        }
                    };
                    if let Err(e) = result {
                        warn!(region = %region, addr = %addr, error = %e, "Security group adjustment failed");
                    }
                }
            }
        }
    }
}
