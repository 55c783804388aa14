//! The unified per-node view: a cloud-instance record merged with a
//! cluster-membership record (spec §3, §4.1).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_CLIENT_PORT: u16 = 2379;
pub const DEFAULT_PEER_PORT: u16 = 2380;
pub const DEFAULT_METRICS_PORT: u16 = 2381;

pub const AG_TAG: &str = "aws:autoscaling:groupName";
pub const CF_TAG: &str = "aws:cloudformation:stack-name";

/// One cluster-membership row as returned by the etcd v2 `/v2/members` API.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RawEtcdMember {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "peerURLs", default)]
    pub peer_urls: Vec<String>,
    #[serde(rename = "clientURLs", default)]
    pub client_urls: Vec<String>,
}

/// The merged view of one fleet node (spec §3).
#[derive(Debug, Clone, Default)]
pub struct Member {
    // --- cloud-sourced fields ---
    pub instance_id: Option<String>,
    pub private_ip_address: Option<String>,
    pub public_ip_address: Option<String>,
    pub private_dns_name: Option<String>,
    pub public_dns_name: Option<String>,
    pub autoscaling_group: Option<String>,
    pub cluster_token: Option<String>,
    pub region: Option<String>,

    // --- cluster-sourced fields ---
    pub id: Option<String>,
    pub name: String,
    pub client_urls: Vec<String>,
    pub peer_urls: Vec<String>,

    // host form learned from a cluster-only row before it is matched to a
    // cloud instance (mirrors the `_addr`/`_dns` private fields in the
    // original implementation)
    resolved_addr: Option<String>,
    resolved_dns: Option<String>,

    pub client_port: u16,
    pub peer_port: u16,
    pub metrics_port: u16,
}

impl Member {
    /// Build a Member from a cloud instance record.
    pub fn from_cloud(
        instance_id: impl Into<String>,
        private_ip: Option<String>,
        public_ip: Option<String>,
        private_dns: Option<String>,
        public_dns: Option<String>,
        tags: &HashMap<String, String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            private_ip_address: private_ip,
            public_ip_address: public_ip,
            private_dns_name: private_dns,
            public_dns_name: public_dns,
            autoscaling_group: tags.get(AG_TAG).cloned(),
            cluster_token: tags.get(CF_TAG).cloned(),
            region: Some(region.into()),
            client_port: DEFAULT_CLIENT_PORT,
            peer_port: DEFAULT_PEER_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            ..Default::default()
        }
    }

    /// Build a cluster-only Member (no matching cloud instance found yet).
    pub fn from_etcd_row(row: &RawEtcdMember) -> Self {
        let mut m = Self {
            client_port: DEFAULT_CLIENT_PORT,
            peer_port: DEFAULT_PEER_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            ..Default::default()
        };
        m.apply_etcd_row(row);
        m
    }

    /// Enrich this Member with fields from a cluster-membership row,
    /// learning whichever of the four host forms the row's peer URL
    /// carries (spec §4.1 step 2).
    pub fn apply_etcd_row(&mut self, row: &RawEtcdMember) {
        if let Some(addr) = Self::first_host(&row.peer_urls) {
            if is_ipv4(&addr) {
                self.resolved_addr = Some(addr);
            } else {
                self.resolved_dns = Some(addr);
            }
        }
        self.id = Some(row.id.clone());
        self.name = row.name.clone();
        self.client_urls = row.client_urls.clone();
        self.peer_urls = row.peer_urls.clone();
    }

    fn first_host(urls: &[String]) -> Option<String> {
        urls.iter().find_map(|u| host_of(u))
    }

    /// True iff any of `peer_urls`' host:peer_port forms matches any of
    /// this Member's four cloud host forms. The single predicate used
    /// wherever the cloud view and the cluster view are joined (spec §9).
    pub fn addr_matches(&self, peer_urls: &[String]) -> bool {
        let candidates = [
            self.private_ip_address.as_deref(),
            self.public_ip_address.as_deref(),
            self.private_dns_name.as_deref(),
            self.public_dns_name.as_deref(),
        ];
        for url in peer_urls {
            let Some(host) = host_of(url) else { continue };
            let Some(port) = port_of(url) else { continue };
            if port != self.peer_port {
                continue;
            }
            if candidates.iter().flatten().any(|c| *c == host) {
                return true;
            }
        }
        false
    }

    /// Key used to merge a cloud member and a cluster row into one row
    /// (spec §4.1): `host:peer_port` from whichever addressing info is
    /// already known.
    pub fn peer_addr(&self) -> String {
        let host = self
            .dns(false)
            .or_else(|| self.resolved_dns.clone())
            .or_else(|| self.resolved_addr.clone())
            .unwrap_or_default();
        format!("{host}:{port}", port = self.peer_port)
    }

    /// Private or public IP, depending on multi-region mode.
    pub fn addr(&self, multiregion: bool) -> Option<String> {
        if multiregion {
            self.public_ip_address.clone()
        } else {
            self.private_ip_address.clone()
        }
    }

    /// Private or public DNS, depending on multi-region mode: the routable
    /// DNS used in DNS records (spec §3, §4.5).
    pub fn dns(&self, multiregion: bool) -> Option<String> {
        if multiregion {
            self.public_dns_name.clone()
        } else {
            self.private_dns_name.clone()
        }
    }

    /// The advertise address: public DNS in multi-region mode, private IP
    /// otherwise (spec §3).
    pub fn advertise_addr(&self, multiregion: bool) -> Option<String> {
        if multiregion {
            self.public_dns_name.clone()
        } else {
            self.private_ip_address.clone()
        }
    }

    pub fn client_url(&self, multiregion: bool) -> String {
        format!(
            "http://{}:{}",
            self.advertise_addr(multiregion).unwrap_or_default(),
            self.client_port
        )
    }

    pub fn peer_url(&self, multiregion: bool) -> String {
        if let Some(url) = self.peer_urls.first() {
            return url.clone();
        }
        format!(
            "http://{}:{}",
            self.advertise_addr(multiregion).unwrap_or_default(),
            self.peer_port
        )
    }

    /// `etcdN` or `etcd`, i.e. whichever identifier sorts/joins the
    /// `initial-cluster` CSV (spec §4.1 step 3, §4.3).
    pub fn display_name(&self) -> &str {
        self.instance_id.as_deref().unwrap_or(&self.name)
    }

    /// Arguments passed to the cluster daemon child process (spec §6).
    #[allow(clippy::too_many_arguments)]
    pub fn etcd_arguments(
        &self,
        data_dir: &Path,
        initial_cluster: &str,
        cluster_state: &str,
        run_old: bool,
        multiregion: bool,
        target_version: Option<&str>,
        prev_version: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec![
            "-name".to_string(),
            self.instance_id.clone().unwrap_or_default(),
            "--data-dir".to_string(),
            data_dir.display().to_string(),
            "-listen-peer-urls".to_string(),
            format!("http://0.0.0.0:{}", self.peer_port),
            "-initial-advertise-peer-urls".to_string(),
            self.peer_url(multiregion),
            "-listen-client-urls".to_string(),
            format!("http://0.0.0.0:{}", self.client_port),
            "-advertise-client-urls".to_string(),
            self.client_url(multiregion),
            "-initial-cluster".to_string(),
            initial_cluster.to_string(),
            "-initial-cluster-token".to_string(),
            self.cluster_token.clone().unwrap_or_default(),
            "-initial-cluster-state".to_string(),
            cluster_state.to_string(),
        ];

        let version = if run_old { prev_version } else { target_version };
        if let Some(v) = version.and_then(parse_version) {
            if v >= (3, 3) {
                args.push("-listen-metrics-urls".to_string());
                args.push(format!("http://0.0.0.0:{}", self.metrics_port));
            }
        }

        args
    }
}

fn parse_version(v: &str) -> Option<(u32, u32)> {
    let mut parts = v.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn host_of(url: &str) -> Option<String> {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority.rsplit_once(':').map(|(h, _)| h.to_string())
}

fn port_of(url: &str) -> Option<u16> {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
}

fn is_ipv4(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| !p.is_empty() && p.parse::<u8>().is_ok())
}

/// Merge the cloud fleet with raw cluster rows into one sorted list
/// (spec §4.1).
pub fn merge_member_lists(ec2_members: Vec<Member>, etcd_members: &[RawEtcdMember]) -> Vec<Member> {
    let mut peers: HashMap<String, Member> = ec2_members
        .into_iter()
        .map(|m| (m.peer_addr(), m))
        .collect();

    for row in etcd_members {
        let matched = peers
            .values_mut()
            .find(|peer| peer.addr_matches(&row.peer_urls));
        match matched {
            Some(peer) => peer.apply_etcd_row(row),
            None => {
                let m = Member::from_etcd_row(row);
                peers.insert(m.peer_addr(), m);
            }
        }
    }

    let mut merged: Vec<Member> = peers.into_values().collect();
    merged.sort_by(|a, b| a.display_name().cmp(b.display_name()));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud_member(id: &str, ip: &str) -> Member {
        let mut tags = HashMap::new();
        tags.insert(CF_TAG.to_string(), "etc-cluster".to_string());
        tags.insert(AG_TAG.to_string(), "etc-cluster-postgres".to_string());
        Member::from_cloud(
            id,
            Some(ip.to_string()),
            None,
            Some(format!("ip-{}.eu-west-1.compute.internal", ip.replace('.', "-"))),
            None,
            &tags,
            "eu-west-1",
        )
    }

    #[test]
    fn addr_matches_checks_all_four_host_forms() {
        let m = cloud_member("i-deadbeef1", "127.0.0.1");
        assert!(m.addr_matches(&["http://127.0.0.1:2380".to_string()]));
        assert!(m.addr_matches(&["http://ip-127-0-0-1.eu-west-1.compute.internal:2380".to_string()]));
        assert!(!m.addr_matches(&["http://127.0.0.2:2380".to_string()]));
        assert!(!m.addr_matches(&["http://127.0.0.1:9999".to_string()]));
    }

    #[test]
    fn merge_is_order_independent() {
        let ec2 = vec![cloud_member("i-deadbeef1", "127.0.0.1"), cloud_member("i-deadbeef2", "127.0.0.2")];
        let ec2_swapped = vec![cloud_member("i-deadbeef2", "127.0.0.2"), cloud_member("i-deadbeef1", "127.0.0.1")];
        let rows = vec![RawEtcdMember {
            id: "ifoobari1".to_string(),
            name: "i-deadbeef1".to_string(),
            peer_urls: vec!["http://127.0.0.1:2380".to_string()],
            client_urls: vec!["http://127.0.0.1:2379".to_string()],
        }];

        let a = merge_member_lists(ec2, &rows);
        let b = merge_member_lists(ec2_swapped, &rows);

        let names_a: Vec<_> = a.iter().map(|m| m.display_name().to_string()).collect();
        let names_b: Vec<_> = b.iter().map(|m| m.display_name().to_string()).collect();
        assert_eq!(names_a, names_b);
        assert_eq!(a[0].name, "i-deadbeef1");
        assert_eq!(a[0].id.as_deref(), Some("ifoobari1"));
    }

    #[test]
    fn merge_inserts_cluster_only_row_when_unmatched() {
        let ec2 = vec![cloud_member("i-deadbeef1", "127.0.0.1")];
        let rows = vec![RawEtcdMember {
            id: "izombie".to_string(),
            name: "i-zombie".to_string(),
            peer_urls: vec!["http://10.0.0.9:2380".to_string()],
            client_urls: vec!["http://10.0.0.9:2379".to_string()],
        }];

        let merged = merge_member_lists(ec2, &rows);
        assert_eq!(merged.len(), 2);
        let zombie = merged.iter().find(|m| m.name == "i-zombie").unwrap();
        assert!(zombie.instance_id.is_none());
    }

    #[test]
    fn etcd_arguments_include_metrics_port_from_3_3() {
        let m = cloud_member("i-deadbeef1", "127.0.0.1");
        let args = m.etcd_arguments(
            Path::new("data"),
            "i-deadbeef1=http://127.0.0.1:2380",
            "new",
            false,
            false,
            Some("3.3.9"),
            None,
        );
        assert!(args.contains(&"-listen-metrics-urls".to_string()));

        let args_old = m.etcd_arguments(
            Path::new("data"),
            "i-deadbeef1=http://127.0.0.1:2380",
            "new",
            false,
            false,
            Some("3.2.9"),
            None,
        );
        assert!(!args_old.contains(&"-listen-metrics-urls".to_string()));
    }
}
