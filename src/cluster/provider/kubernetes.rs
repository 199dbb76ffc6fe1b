//! Kubernetes pod membership
//!
//! Members are the ready pods matching a label selector in the pod's own
//! namespace. Credentials come from the mounted service account.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{
    provider_error, MembershipChange, MembershipProvider, MembershipWatch, Snapshot, WatchEvent,
    WatchSender,
};
use crate::cluster::node::{Node, NodeId};
use crate::config::KubernetesConfig;
use crate::error::{Result, SwarmError};

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Server-side lifetime of one watch request; the reconciler resumes after it.
const WATCH_SECONDS: u64 = 300;

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: Option<String>,
    namespace: Option<String>,
    resource_version: Option<String>,
    deletion_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    node_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    phase: Option<String>,
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WatchLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: serde_json::Value,
}

impl Pod {
    fn is_ready(&self) -> bool {
        self.status.pod_ip.as_deref().is_some_and(|ip| !ip.is_empty())
            && self.metadata.deletion_timestamp.is_none()
            && self.status.phase.as_deref() == Some("Running")
            && self
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
    }

    fn to_node(&self) -> Option<Node> {
        let ip = self.status.pod_ip.as_deref()?;
        let mut node = Node::new(ip);
        if let Some(name) = &self.metadata.name {
            node = node.with_metadata("pod", name.as_str());
        }
        if let Some(namespace) = &self.metadata.namespace {
            node = node.with_metadata("namespace", namespace.as_str());
        }
        if let Some(host) = &self.spec.node_name {
            node = node.with_metadata("host", host.as_str());
        }
        Some(node)
    }
}

/// Lists and watches pods through the Kubernetes API server.
#[derive(Debug, Clone)]
pub struct KubernetesProvider {
    config: Arc<KubernetesConfig>,
    client: reqwest::Client,
}

impl KubernetesProvider {
    pub fn new(config: KubernetesConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);

        let ca_path = Path::new(&config.service_account_path).join("ca.crt");
        match std::fs::read(&ca_path) {
            Ok(pem) => {
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| provider_error("invalid cluster CA", e))?;
                builder = builder.add_root_certificate(cert);
            }
            Err(_) => {
                warn!(path = %ca_path.display(), "Cluster CA not found, server certificate will not be verified");
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        let client = builder
            .build()
            .map_err(|e| provider_error("failed to build API client", e))?;

        info!(
            api_host = %config.api_host,
            selector = ?config.effective_selector(),
            "Kubernetes membership provider configured"
        );
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    fn account_file(&self, name: &str) -> PathBuf {
        Path::new(&self.config.service_account_path).join(name)
    }

    async fn read_account_file(&self, name: &str) -> Result<String> {
        let path = self.account_file(name);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| provider_error(&format!("reading {}", path.display()), e))?;
        Ok(content.trim().to_string())
    }

    async fn credentials(&self) -> Result<(String, String)> {
        let token = match &self.config.token {
            Some(token) => token.clone(),
            None => self.read_account_file("token").await?,
        };
        let namespace = match &self.config.namespace {
            Some(namespace) => namespace.clone(),
            None => self.read_account_file("namespace").await?,
        };
        Ok((token, namespace))
    }

    fn pods_url(&self, namespace: &str) -> String {
        format!(
            "https://{}:{}/api/v1/namespaces/{}/pods",
            self.config.api_host, self.config.api_port, namespace
        )
    }

    fn selector_query(&self) -> Vec<(&'static str, String)> {
        self.config
            .effective_selector()
            .map(|s| vec![("labelSelector", s)])
            .unwrap_or_default()
    }

    async fn list(&self) -> Result<Snapshot> {
        let (token, namespace) = self.credentials().await?;
        let response = self
            .client
            .get(self.pods_url(&namespace))
            .bearer_auth(token)
            .query(&self.selector_query())
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .map_err(|e| provider_error("listing pods", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(provider_error(
                "listing pods",
                format!("{} {}", status.as_u16(), body.trim()),
            ));
        }

        let list: PodList = response
            .json()
            .await
            .map_err(|e| provider_error("decoding pod list", e))?;

        let nodes: Vec<Node> = list
            .items
            .iter()
            .filter(|pod| pod.is_ready())
            .filter_map(Pod::to_node)
            .collect();
        debug!(count = nodes.len(), "Listed ready pods");
        Ok(Snapshot {
            nodes,
            cursor: list.metadata.resource_version,
        })
    }

    async fn stream_changes(&self, cursor: Option<String>, tx: &WatchSender) -> Result<()> {
        let (token, namespace) = self.credentials().await?;
        let mut query = self.selector_query();
        query.push(("watch", "true".to_string()));
        query.push(("allowWatchBookmarks", "true".to_string()));
        query.push(("timeoutSeconds", WATCH_SECONDS.to_string()));
        if let Some(cursor) = &cursor {
            query.push(("resourceVersion", cursor.clone()));
        }

        let mut response = self
            .client
            .get(self.pods_url(&namespace))
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .map_err(|e| provider_error("opening pod watch", e))?;

        let status = response.status();
        if status.as_u16() == 410 {
            return Err(SwarmError::CursorExpired);
        }
        if !status.is_success() {
            return Err(provider_error("opening pod watch", status.as_u16()));
        }

        let mut decoder = WatchDecoder::default();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| provider_error("reading pod watch", e))?
        {
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match decoder.decode(&line)? {
                    Some(event) => {
                        if !tx.send(Ok(event)).await {
                            return Ok(());
                        }
                    }
                    None => continue,
                }
            }
        }
        Ok(())
    }
}

/// Turns watch lines into membership events. Remembers pod ips by name so a
/// pod that lost its ip on the way out can still be reported as removed.
#[derive(Debug, Default)]
struct WatchDecoder {
    ips: HashMap<String, String>,
    cursor: Option<String>,
}

impl WatchDecoder {
    fn decode(&mut self, line: &[u8]) -> Result<Option<WatchEvent>> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let line: WatchLine =
            serde_json::from_str(text).map_err(|e| provider_error("decoding watch event", e))?;

        if line.kind == "ERROR" {
            let code = line.object.get("code").and_then(|c| c.as_u64());
            if code == Some(410) {
                return Err(SwarmError::CursorExpired);
            }
            let message = line
                .object
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown watch error");
            return Err(provider_error("pod watch", message));
        }

        let pod: Pod = serde_json::from_value(line.object)
            .map_err(|e| provider_error("decoding watched pod", e))?;
        if let Some(version) = &pod.metadata.resource_version {
            self.cursor = Some(version.clone());
        }
        let name = pod.metadata.name.clone().unwrap_or_default();

        let change = match line.kind.as_str() {
            "BOOKMARK" => return Ok(self.cursor_only()),
            "ADDED" | "MODIFIED" if pod.is_ready() => {
                let Some(node) = pod.to_node() else {
                    return Ok(self.cursor_only());
                };
                self.ips.insert(name, node.id.to_string());
                MembershipChange::Added(node)
            }
            "ADDED" | "MODIFIED" | "DELETED" => {
                let known = self.ips.remove(&name);
                let node = match (pod.to_node(), known) {
                    (Some(node), _) => node,
                    (None, Some(ip)) => Node::new(NodeId::from(ip)),
                    (None, None) => return Ok(self.cursor_only()),
                };
                MembershipChange::Removed(node)
            }
            other => {
                debug!(kind = other, "Ignoring watch event");
                return Ok(self.cursor_only());
            }
        };

        Ok(Some(WatchEvent::new(change, self.cursor.clone())))
    }

    /// Passes a moved resource version on even when membership is unchanged.
    fn cursor_only(&self) -> Option<WatchEvent> {
        self.cursor.clone().map(WatchEvent::bookmark)
    }
}

#[async_trait]
impl MembershipProvider for KubernetesProvider {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        self.list().await
    }

    fn watch(&self, cursor: Option<String>) -> Option<MembershipWatch> {
        let (tx, watch) = MembershipWatch::channel();
        let provider = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("Pod watch dropped by subscriber");
                }
                result = provider.stream_changes(cursor, &tx) => {
                    if let Err(e) = result {
                        tx.send(Err(e)).await;
                    }
                }
            }
        });
        Some(watch)
    }
}
