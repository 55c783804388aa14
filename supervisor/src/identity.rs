//! Resolving this node's own cloud identity at startup (spec §4.6).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const IDENTITY_URL: &str = "http://169.254.169.254/latest/dynamic/instance-identity/document";

#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    pub region: String,
}

/// Fetch the instance identity document once at startup. There is no
/// retry here — if the metadata service is unreachable the process has
/// nothing useful to do and should exit (spec §7).
pub async fn resolve() -> Result<Identity> {
    let client = reqwest::Client::builder().timeout(METADATA_TIMEOUT).build()?;
    let identity = client
        .get(IDENTITY_URL)
        .send()
        .await
        .context("fetching instance identity document")?
        .json::<Identity>()
        .await
        .context("parsing instance identity document")?;
    Ok(identity)
}
