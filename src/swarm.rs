//! The cluster context
//!
//! A [`Swarm`] owns everything a node needs: identity, topology, election,
//! events, transport, scheduler and reconciler. Build one with
//! [`SwarmBuilder`], then `start` it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::provider;
use crate::cluster::{Election, LocalIdentity, MembershipProvider, Node, NodeId, Reconciler, Topology};
use crate::config::SwarmConfig;
use crate::error::{Result, SwarmError};
use crate::events::{EventBus, EventKind, EventListener, SwarmEvent};
use crate::tasks::Scheduler;
use crate::transport::{HttpTransport, TopicRouter, Transport};

pub struct SwarmBuilder {
    config: SwarmConfig,
    identity: Option<LocalIdentity>,
    provider: Option<Arc<dyn MembershipProvider>>,
    transport: Option<Arc<dyn Transport>>,
    listeners: Vec<(EventKind, EventListener)>,
}

impl SwarmBuilder {
    pub fn new(config: SwarmConfig) -> Self {
        Self {
            config,
            identity: None,
            provider: None,
            transport: None,
            listeners: Vec::new(),
        }
    }

    /// Defaults to the configured node address and aliases.
    pub fn identity(mut self, identity: LocalIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Defaults to the provider picked from configuration.
    pub fn provider(mut self, provider: Arc<dyn MembershipProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Defaults to HTTP.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn on_ready<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Node]) + Send + Sync + 'static,
    {
        self.listeners.push((
            EventKind::Ready,
            Arc::new(move |event: &SwarmEvent| {
                if let SwarmEvent::Ready(nodes) = event {
                    f(nodes);
                }
            }),
        ));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&SwarmError) + Send + Sync + 'static,
    {
        self.listeners.push((
            EventKind::Error,
            Arc::new(move |event: &SwarmEvent| {
                if let SwarmEvent::Error(e) = event {
                    f(e);
                }
            }),
        ));
        self
    }

    pub fn on_node_added<F>(mut self, f: F) -> Self
    where
        F: Fn(&Node) + Send + Sync + 'static,
    {
        self.listeners.push((
            EventKind::NodeAdded,
            Arc::new(move |event: &SwarmEvent| {
                if let SwarmEvent::NodeAdded(node) = event {
                    f(node);
                }
            }),
        ));
        self
    }

    pub fn on_node_removed<F>(mut self, f: F) -> Self
    where
        F: Fn(&Node) + Send + Sync + 'static,
    {
        self.listeners.push((
            EventKind::NodeRemoved,
            Arc::new(move |event: &SwarmEvent| {
                if let SwarmEvent::NodeRemoved(node) = event {
                    f(node);
                }
            }),
        ));
        self
    }

    pub fn build(self) -> Result<Swarm> {
        let config = self.config;
        config.validate()?;

        let identity = self.identity.unwrap_or_else(|| config.node.identity());
        let provider = match self.provider {
            Some(provider) => provider,
            None => provider::from_config(&config.provider, &identity)?,
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.transport.clone())?),
        };

        let events = Arc::new(EventBus::default());
        for (kind, listener) in self.listeners {
            events.on(kind, move |event| listener(event));
        }

        let topology = Arc::new(Topology::new(config.ring.replicas));
        let election = Arc::new(Election::new());
        let scheduler = Scheduler::new(
            topology.clone(),
            identity.clone(),
            transport.clone(),
            config.tasks.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(
            provider,
            topology.clone(),
            election.clone(),
            events.clone(),
            identity.clone(),
            &config.provider,
        ));

        info!(node = %identity.id(), "Swarm created");
        Ok(Swarm {
            inner: Arc::new(SwarmInner {
                config,
                identity,
                topology,
                election,
                events,
                transport,
                scheduler,
                reconciler,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                reconciling: Mutex::new(None),
            }),
        })
    }
}

struct SwarmInner {
    config: SwarmConfig,
    identity: LocalIdentity,
    topology: Arc<Topology>,
    election: Arc<Election>,
    events: Arc<EventBus>,
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    reconciler: Arc<Reconciler>,
    shutdown: CancellationToken,
    started: AtomicBool,
    reconciling: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a cluster node. Clones share the same node.
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<SwarmInner>,
}

impl Swarm {
    pub fn builder(config: SwarmConfig) -> SwarmBuilder {
        SwarmBuilder::new(config)
    }

    /// Starts serving messages and reconciling membership. Calling it again
    /// is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.inner.transport.start(self.inner.shutdown.child_token()).await {
            self.inner.started.store(false, Ordering::Release);
            return Err(e);
        }

        let reconciler = self.inner.reconciler.clone();
        let handle = tokio::spawn(reconciler.run(self.inner.shutdown.clone()));
        *self.inner.reconciling.lock() = Some(handle);
        info!(node = %self.inner.identity.id(), "Swarm started");
        Ok(())
    }

    /// Resolves with the first membership snapshot.
    pub async fn wait_ready(&self) -> Vec<Node> {
        self.inner.reconciler.wait_ready().await
    }

    pub fn is_ready(&self) -> bool {
        self.inner.reconciler.is_ready()
    }

    /// Stops the message server and the reconciliation loop.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.reconciling.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Reconciliation task ended abnormally: {}", e);
            }
        }
        info!(node = %self.inner.identity.id(), "Swarm stopped");
    }

    /// Resolves once this process must exit, e.g. after being removed from
    /// the cluster.
    pub async fn terminated(&self) {
        self.inner.reconciler.termination().cancelled().await
    }

    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&SwarmEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.inner.events.subscribe()
    }

    /// Router for messages addressed to this node.
    pub fn messages(&self) -> Arc<TopicRouter> {
        self.inner.transport.router()
    }

    pub async fn send(&self, node: &NodeId, topic: &str, payload: Value) -> Result<Option<Value>> {
        self.inner.transport.send(node, topic, payload).await
    }

    /// Sends to every member, this node included. One result per member.
    pub async fn broadcast(&self, topic: &str, payload: Value) -> Vec<(NodeId, Result<Option<Value>>)> {
        let members = self.inner.topology.member_ids();
        let sends = members.iter().map(|node| {
            let payload = payload.clone();
            async move { (node.clone(), self.send(node, topic, payload).await) }
        });
        join_all(sends).await
    }

    pub fn tasks(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub async fn exec(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.scheduler.exec(name, args).await
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.inner.reconciler
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    pub fn is_me(&self, node: &NodeId) -> bool {
        self.inner.identity.is_me(node)
    }

    pub fn master(&self) -> Option<NodeId> {
        self.inner.election.master()
    }

    pub fn am_i_master(&self) -> bool {
        self.master().is_some_and(|m| self.is_me(&m))
    }

    /// Current members ordered by id.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes = self.inner.topology.members();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("node", self.inner.identity.id())
            .field("members", &self.inner.topology.len())
            .field("master", &self.master())
            .field("ready", &self.is_ready())
            .finish()
    }
}
