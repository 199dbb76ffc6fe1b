//! Membership providers
//!
//! A provider is the source of truth for who is in the cluster. It offers a
//! full snapshot and, optionally, a watch stream of incremental changes that
//! can be resumed from the cursor of the last event seen.

mod kubernetes;
mod memory;
mod standalone;

pub use kubernetes::KubernetesProvider;
pub use memory::InMemoryProvider;
pub use standalone::StandaloneProvider;

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::info;

use super::node::{LocalIdentity, Node};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{Result, SwarmError};

const WATCH_BUFFER: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    /// Position to resume a watch from, when the provider supports it.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Added(Node),
    Removed(Node),
}

/// One step of a watch. Events without a change only move the cursor.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub change: Option<MembershipChange>,
    pub cursor: Option<String>,
}

impl WatchEvent {
    pub fn new(change: MembershipChange, cursor: Option<String>) -> Self {
        Self {
            change: Some(change),
            cursor,
        }
    }

    pub fn bookmark(cursor: impl Into<String>) -> Self {
        Self {
            change: None,
            cursor: Some(cursor.into()),
        }
    }
}

#[async_trait]
pub trait MembershipProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn snapshot(&self) -> Result<Snapshot>;

    /// Opens a change stream starting after `cursor`. `None` when the provider
    /// cannot watch; the reconciler then relies on periodic snapshots.
    fn watch(&self, _cursor: Option<String>) -> Option<MembershipWatch> {
        None
    }
}

/// A live watch subscription. Dropping it cancels the producer and whatever
/// connection the producer holds.
pub struct MembershipWatch {
    events: ReceiverStream<Result<WatchEvent>>,
    _guard: DropGuard,
}

/// Producer half of a [`MembershipWatch`].
#[derive(Debug, Clone)]
pub struct WatchSender {
    tx: mpsc::Sender<Result<WatchEvent>>,
    cancel: CancellationToken,
}

impl MembershipWatch {
    pub fn channel() -> (WatchSender, MembershipWatch) {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let cancel = CancellationToken::new();
        let watch = MembershipWatch {
            events: ReceiverStream::new(rx),
            _guard: cancel.clone().drop_guard(),
        };
        (WatchSender { tx, cancel }, watch)
    }
}

impl Stream for MembershipWatch {
    type Item = Result<WatchEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl WatchSender {
    /// Returns false once the subscriber is gone.
    pub async fn send(&self, item: Result<WatchEvent>) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    /// Non-blocking variant for producers that must not stall.
    pub fn try_send(&self, item: Result<WatchEvent>) -> bool {
        !self.cancel.is_cancelled() && self.tx.try_send(item).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

/// Picks the provider variant for this process from configuration.
pub fn from_config(
    config: &ProviderConfig,
    local: &LocalIdentity,
) -> Result<Arc<dyn MembershipProvider>> {
    let kind = match config.kind {
        ProviderKind::Auto => {
            let token = Path::new(&config.kubernetes.service_account_path).join("token");
            if token.exists() {
                ProviderKind::Kubernetes
            } else {
                ProviderKind::Standalone
            }
        }
        other => other,
    };

    let provider: Arc<dyn MembershipProvider> = match kind {
        ProviderKind::Kubernetes => Arc::new(KubernetesProvider::new(config.kubernetes.clone())?),
        ProviderKind::Standalone | ProviderKind::Auto => {
            Arc::new(StandaloneProvider::new(local.clone()))
        }
    };
    info!(provider = provider.name(), "Membership provider selected");
    Ok(provider)
}

impl std::fmt::Debug for MembershipWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipWatch").finish_non_exhaustive()
    }
}

pub(crate) fn provider_error(context: &str, err: impl std::fmt::Display) -> SwarmError {
    SwarmError::provider(format!("{}: {}", context, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_dropping_watch_cancels_producer() {
        let (tx, watch) = MembershipWatch::channel();
        assert!(!tx.is_closed());
        drop(watch);
        assert!(tx.is_closed());
        assert!(!tx.send(Err(SwarmError::provider("late"))).await);
    }

    #[tokio::test]
    async fn test_watch_yields_sent_events() {
        let (tx, mut watch) = MembershipWatch::channel();
        tx.send(Ok(WatchEvent::new(
            MembershipChange::Added(Node::new("a")),
            Some("1".into()),
        )))
        .await;
        drop(tx);

        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.change, Some(MembershipChange::Added(Node::new("a"))));
        assert!(watch.next().await.is_none());
    }

    #[test]
    fn test_auto_without_service_account_is_standalone() {
        let mut config = ProviderConfig::default();
        config.kubernetes.service_account_path = "/nonexistent/serviceaccount".into();
        let provider = from_config(&config, &LocalIdentity::new("127.0.0.1")).unwrap();
        assert_eq!(provider.name(), "standalone");
    }
}
