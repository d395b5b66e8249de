//! Client for the source of truth: the control plane that assigns
//! repositories to nodes and serves their index options.
//!
//! The wire contract is two POST operations. `list` returns the
//! authoritative owned set for a hostname. `search-configuration` returns
//! IndexOptions for the requested ids, delta-encoded against an opaque
//! fingerprint: the client echoes the last fingerprint it saw and the server
//! answers with only the entries that changed since. An empty response body
//! is a valid "nothing changed" reply.

use anyhow::Context;
use models::{IndexOptions, RepoId};

/// Header carrying the configuration fingerprint in both directions.
pub const FINGERPRINT_HEADER: &str = "X-Index-Fingerprint";

/// How many ids go into one `search_configuration` call.
pub const CONFIG_BATCH_SIZE: usize = 1000;

/// An opaque server-issued token. The only supported operations are
/// "remember the last one" and "send it back verbatim"; it is never parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One entry of a configuration response: either the options for a
/// repository, or a per-repository error the server wants surfaced.
#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
pub enum ConfigItem {
    // Order matters for untagged deserialization: an error object would
    // also satisfy IndexOptions (every field there has a default).
    #[serde(rename_all = "camelCase")]
    Error { repo_id: RepoId, error: String },
    Options(Box<IndexOptions>),
}

#[derive(Debug, Default)]
pub struct ConfigBatch {
    pub items: Vec<ConfigItem>,
    pub fingerprint: Option<Fingerprint>,
}

/// The two operations of the source of truth. A trait so tests substitute a
/// deterministic in-memory implementation.
#[async_trait::async_trait]
pub trait ConfigSource: Send + Sync {
    /// Authoritative set of repository ids assigned to `hostname`. The
    /// already-indexed ids inform the server's rebalancing decisions.
    async fn list(&self, hostname: &str, indexed: &[RepoId]) -> anyhow::Result<Vec<RepoId>>;

    /// Options for `ids` that changed since `fingerprint` was issued.
    async fn search_configuration(
        &self,
        ids: &[RepoId],
        fingerprint: Option<&Fingerprint>,
    ) -> anyhow::Result<ConfigBatch>;
}

pub struct HttpConfigSource {
    client: reqwest::Client,
    base: url::Url,
    hostname_hint: String,
}

impl HttpConfigSource {
    pub fn new(base: url::Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            hostname_hint: base.host_str().unwrap_or_default().to_string(),
            client,
            base,
        })
    }

    fn endpoint(&self, name: &str) -> anyhow::Result<url::Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("source-of-truth URL cannot be a base: {}", self.base))?
            .pop_if_empty()
            .extend(["indexer", "v1", name]);
        Ok(url)
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ListRequest<'a> {
    hostname: &'a str,
    indexed_ids: &'a [RepoId],
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    repo_ids: Vec<RepoId>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigRequest<'a> {
    repo_ids: &'a [RepoId],
}

#[async_trait::async_trait]
impl ConfigSource for HttpConfigSource {
    #[tracing::instrument(skip_all, fields(host = %self.hostname_hint, indexed = indexed.len()))]
    async fn list(&self, hostname: &str, indexed: &[RepoId]) -> anyhow::Result<Vec<RepoId>> {
        let response = self
            .client
            .post(self.endpoint("list")?)
            .json(&ListRequest {
                hostname,
                indexed_ids: indexed,
            })
            .send()
            .await
            .context("list request failed")?
            .error_for_status()
            .context("list request was rejected")?;

        let body: ListResponse = response.json().await.context("malformed list response")?;
        Ok(body.repo_ids)
    }

    #[tracing::instrument(skip_all, fields(ids = ids.len()))]
    async fn search_configuration(
        &self,
        ids: &[RepoId],
        fingerprint: Option<&Fingerprint>,
    ) -> anyhow::Result<ConfigBatch> {
        let mut request = self
            .client
            .post(self.endpoint("search-configuration")?)
            .json(&ConfigRequest { repo_ids: ids });
        if let Some(fingerprint) = fingerprint {
            request = request.header(FINGERPRINT_HEADER, fingerprint.as_str());
        }

        let response = request
            .send()
            .await
            .context("search-configuration request failed")?
            .error_for_status()
            .context("search-configuration request was rejected")?;

        let fingerprint = response
            .headers()
            .get(FINGERPRINT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(Fingerprint::new);

        let body = response
            .text()
            .await
            .context("failed to read search-configuration response")?;
        Ok(ConfigBatch {
            items: parse_items(&body)?,
            fingerprint,
        })
    }
}

fn parse_items(body: &str) -> anyhow::Result<Vec<ConfigItem>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).context("malformed search-configuration response")
}
