//! Cloud DNS publication: three UPSERT record sets describing the fleet
//! (spec §6, §4.5), grounded in `update_route53_records` in
//! `examples/original_source/etcd.py`.

use crate::member::Member;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, RecordType, ResourceRecord, ResourceRecordSet,
};
use aws_sdk_route53::Client as Route53Client;
use tracing::info;

const RECORD_TTL: i64 = 60;

#[async_trait]
pub trait CloudDns: Send + Sync {
    /// Publish the fleet under `hosted_zone`, namespaced by `version_suffix`
    /// (the trailing segment of the cluster token, spec §4.5): one SRV
    /// record for the peer port, one SRV record for the client port, and
    /// one A record with every member's routable address.
    async fn publish(
        &self,
        hosted_zone: &str,
        version_suffix: &str,
        members: &[Member],
        multiregion: bool,
    ) -> Result<()>;
}

pub struct Route53Dns {
    client: Route53Client,
}

impl Route53Dns {
    pub fn new(aws_config: &aws_config::SdkConfig) -> Self {
        Self { client: Route53Client::new(aws_config) }
    }

    async fn find_zone_id(&self, hosted_zone: &str) -> Result<String> {
        let resp = self.client.list_hosted_zones_by_name().dns_name(hosted_zone).send().await?;
        resp.hosted_zones()
            .iter()
            .find(|z| z.name() == hosted_zone)
            .map(|z| z.id().to_string())
            .ok_or_else(|| anyhow!("hosted zone {hosted_zone} not found"))
    }

    async fn upsert(&self, zone_id: &str, name: &str, rtype: RecordType, values: Vec<String>) -> Result<()> {
        let records: Vec<ResourceRecord> =
            values.into_iter().map(|v| ResourceRecord::builder().value(v).build().unwrap()).collect();

        let rrset = ResourceRecordSet::builder()
            .name(name)
            .r#type(rtype)
            .ttl(RECORD_TTL)
            .set_resource_records(Some(records))
            .build()?;

        let change = Change::builder().action(ChangeAction::Upsert).resource_record_set(rrset).build()?;

        self.client
            .change_resource_record_sets()
            .hosted_zone_id(zone_id)
            .change_batch(ChangeBatch::builder().changes(change).build()?)
            .send()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CloudDns for Route53Dns {
    async fn publish(
        &self,
        hosted_zone: &str,
        version_suffix: &str,
        members: &[Member],
        multiregion: bool,
    ) -> Result<()> {
        let zone_id = self.find_zone_id(hosted_zone).await?;
        info!(zone = %hosted_zone, members = members.len(), "Publishing fleet to DNS");

        let peer_srv_name = format!("_etcd-server._tcp.{version_suffix}.{hosted_zone}");
        let peer_values: Vec<String> = members
            .iter()
            .filter_map(|m| m.dns(multiregion).map(|dns| format!("1 1 {} {}", m.peer_port, dns)))
            .collect();
        self.upsert(&zone_id, &peer_srv_name, RecordType::Srv, peer_values).await?;

        let client_srv_name = format!("_etcd-client._tcp.{version_suffix}.{hosted_zone}");
        let client_values: Vec<String> = members
            .iter()
            .filter_map(|m| m.dns(multiregion).map(|dns| format!("1 1 {} {}", m.client_port, dns)))
            .collect();
        self.upsert(&zone_id, &client_srv_name, RecordType::Srv, client_values).await?;

        let a_name = format!("etcd-server.{version_suffix}.{hosted_zone}");
        let a_values: Vec<String> = members.iter().filter_map(|m| m.addr(multiregion)).collect();
        self.upsert(&zone_id, &a_name, RecordType::A, a_values).await?;

        Ok(())
    }
}
