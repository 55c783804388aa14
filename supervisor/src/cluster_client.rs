//! HTTP/1 JSON client against a peer's etcd v2 client API (spec §4.7).
//!
//! Reads surface a non-2xx response as "not found / not reachable" rather
//! than an error; mutations surface it as a hard failure. No call site
//! retries — the supervisor's outer loop is the only retry policy (spec §7).

use crate::member::RawEtcdMember;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const API_TIMEOUT: Duration = Duration::from_millis(3100);
const API_VERSION: &str = "v2";

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_members(&self, endpoint: &str) -> Result<Vec<RawEtcdMember>>;
    async fn is_leader(&self, endpoint: &str) -> Result<bool>;
    async fn get_leader(&self, endpoint: &str) -> Result<Option<String>>;
    async fn get_cluster_version(&self, endpoint: &str) -> Result<Option<String>>;
    async fn add_member(&self, endpoint: &str, peer_url: &str) -> Result<RawEtcdMember>;
    async fn delete_member(&self, endpoint: &str, id: &str) -> Result<()>;
    /// PUT a key with `prevExist=false`, `ttl`. Returns true iff the lock
    /// was acquired (i.e. the key did not already exist).
    async fn acquire_lock(&self, endpoint: &str, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;
    async fn lock_exists(&self, endpoint: &str, key: &str) -> Result<bool>;
    async fn release_lock(&self, endpoint: &str, key: &str, value: &str) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<RawEtcdMember>,
}

#[derive(Debug, Deserialize)]
struct SelfStatsResponse {
    #[serde(rename = "leaderInfo")]
    leader_info: Option<LeaderInfo>,
}

#[derive(Debug, Deserialize)]
struct LeaderInfo {
    leader: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    etcdcluster: Option<String>,
}

pub struct ReqwestClusterClient {
    client: reqwest::Client,
}

impl ReqwestClusterClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().timeout(API_TIMEOUT).build()?;
        Ok(Self { client })
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}/{}/{}", endpoint.trim_end_matches('/'), API_VERSION, path)
    }
}

#[async_trait]
impl ClusterClient for ReqwestClusterClient {
    async fn get_members(&self, endpoint: &str) -> Result<Vec<RawEtcdMember>> {
        let resp = self.client.get(Self::url(endpoint, "members")).send().await?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        let body: MembersResponse = resp.json().await.unwrap_or(MembersResponse { members: vec![] });
        Ok(body.members)
    }

    async fn is_leader(&self, endpoint: &str) -> Result<bool> {
        let resp = self.client.get(Self::url(endpoint, "stats/leader")).send().await?;
        Ok(resp.status().is_success())
    }

    async fn get_leader(&self, endpoint: &str) -> Result<Option<String>> {
        let resp = self.client.get(Self::url(endpoint, "stats/self")).send().await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body: SelfStatsResponse = match resp.json().await {
            Ok(b) => b,
            Err(_) => return Ok(None),
        };
        Ok(body.leader_info.and_then(|li| li.leader))
    }

    async fn get_cluster_version(&self, endpoint: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(format!("{}/version", endpoint.trim_end_matches('/')))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body: VersionResponse = match resp.json().await {
            Ok(b) => b,
            Err(_) => return Ok(None),
        };
        Ok(body.etcdcluster)
    }

    async fn add_member(&self, endpoint: &str, peer_url: &str) -> Result<RawEtcdMember> {
        let resp = self
            .client
            .post(Self::url(endpoint, "members"))
            .json(&json!({ "peerURLs": [peer_url] }))
            .send()
            .await?;
        if resp.status().as_u16() != 201 {
            anyhow::bail!("add_member failed: status={}", resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn delete_member(&self, endpoint: &str, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(Self::url(endpoint, &format!("members/{id}")))
            .send()
            .await?;
        if resp.status().as_u16() != 204 {
            anyhow::bail!("delete_member failed: status={}", resp.status());
        }
        Ok(())
    }

    async fn acquire_lock(&self, endpoint: &str, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let resp = self
            .client
            .put(Self::url(endpoint, &format!("keys/{key}")))
            .form(&[
                ("value", value.to_string()),
                ("ttl", ttl_secs.to_string()),
                ("prevExist", "false".to_string()),
            ])
            .send()
            .await?;
        Ok(resp.status().as_u16() == 201)
    }

    async fn lock_exists(&self, endpoint: &str, key: &str) -> Result<bool> {
        let resp = self.client.get(Self::url(endpoint, &format!("keys/{key}"))).send().await?;
        Ok(resp.status().is_success())
    }

    async fn release_lock(&self, endpoint: &str, key: &str, value: &str) -> Result<bool> {
        let resp = self
            .client
            .delete(Self::url(endpoint, &format!("keys/{key}")))
            .query(&[("prevValue", value)])
            .send()
            .await?;
        Ok(resp.status().as_u16() == 204)
    }
}
