//! Membership reconciliation
//!
//! Keeps the [`Topology`] aligned with a [`MembershipProvider`]. Full
//! snapshots are diffed against the current set; watch events are applied one
//! by one. Provider failures never clear the current membership: they are
//! reported on the event bus and retried with backoff for as long as the loop
//! runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::election::Election;
use super::membership::{ChangeSet, Topology};
use super::node::{LocalIdentity, Node};
use super::provider::{MembershipChange, MembershipProvider, MembershipWatch};
use super::retry::RetryPolicy;
use crate::config::ProviderConfig;
use crate::error::{Result, SwarmError};
use crate::events::{EventBus, SwarmEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncOutcome {
    Applied(ChangeSet),
    /// Another resync was already in flight.
    Skipped,
}

pub struct Reconciler {
    provider: Arc<dyn MembershipProvider>,
    topology: Arc<Topology>,
    election: Arc<Election>,
    events: Arc<EventBus>,
    identity: LocalIdentity,
    retry: RetryPolicy,
    refresh_interval: Duration,
    cursor: Mutex<Option<String>>,
    syncing: AtomicBool,
    sync_done: Notify,
    ready: watch::Sender<Option<Vec<Node>>>,
    terminate: CancellationToken,
}

/// Clears the in-flight flag even if the resync future is dropped mid-way.
struct InFlight<'a> {
    flag: &'a AtomicBool,
    done: &'a Notify,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.done.notify_waiters();
    }
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn MembershipProvider>,
        topology: Arc<Topology>,
        election: Arc<Election>,
        events: Arc<EventBus>,
        identity: LocalIdentity,
        config: &ProviderConfig,
    ) -> Self {
        let (ready, _) = watch::channel(None);
        Self {
            provider,
            topology,
            election,
            events,
            identity,
            retry: RetryPolicy::from(&config.retry),
            refresh_interval: Duration::from_millis(config.refresh_interval_ms.max(1)),
            cursor: Mutex::new(None),
            syncing: AtomicBool::new(false),
            sync_done: Notify::new(),
            ready,
            terminate: CancellationToken::new(),
        }
    }

    /// Cancelled once this process must stop, i.e. after self-removal.
    pub fn termination(&self) -> CancellationToken {
        self.terminate.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.borrow().is_some()
    }

    /// Resolves with the first successful snapshot.
    pub async fn wait_ready(&self) -> Vec<Node> {
        let mut rx = self.ready.subscribe();
        let nodes = match rx.wait_for(Option::is_some).await {
            Ok(nodes) => nodes.clone(),
            Err(_) => None,
        };
        nodes.unwrap_or_default()
    }

    pub fn cursor(&self) -> Option<String> {
        self.cursor.lock().clone()
    }

    /// Fetches a snapshot and applies the full diff. At most one resync runs
    /// at a time; concurrent calls return [`ResyncOutcome::Skipped`].
    pub async fn resync(&self) -> Result<ResyncOutcome> {
        if self.syncing.swap(true, Ordering::AcqRel) {
            debug!("Resync already in flight");
            return Ok(ResyncOutcome::Skipped);
        }
        let _in_flight = InFlight {
            flag: &self.syncing,
            done: &self.sync_done,
        };

        let snapshot = self.provider.snapshot().await?;
        *self.cursor.lock() = snapshot.cursor;
        let changes = self.apply_snapshot(&snapshot.nodes);
        Ok(ResyncOutcome::Applied(changes))
    }

    fn apply_snapshot(&self, nodes: &[Node]) -> ChangeSet {
        let changes = self.topology.diff(nodes);
        self.topology.apply(&changes);

        let first = !self.is_ready();
        if first {
            self.topology.initialize_ring();
        }

        for node in &changes.added {
            info!(node = %node.id, "Node added");
            self.events.emit(SwarmEvent::NodeAdded(node.clone()));
        }
        for node in &changes.removed {
            self.node_removed(node);
        }

        if first {
            self.mark_ready();
        }
        changes
    }

    fn mark_ready(&self) {
        let mut members = self.topology.members();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        self.election.elect(members.iter().map(|n| &n.id));

        let snapshot = members.clone();
        let fired = self.ready.send_if_modified(|ready| {
            if ready.is_some() {
                return false;
            }
            *ready = Some(snapshot);
            true
        });
        if fired {
            info!(members = members.len(), "Membership ready");
            self.events.emit(SwarmEvent::Ready(members));
        }
    }

    /// Applies a single watch event. Returns false when it changed nothing.
    pub fn apply_change(&self, change: MembershipChange) -> bool {
        match change {
            MembershipChange::Added(node) => {
                if !self.topology.add(node.clone()) {
                    return false;
                }
                info!(node = %node.id, "Node added");
                self.events.emit(SwarmEvent::NodeAdded(node));
                true
            }
            MembershipChange::Removed(node) => match self.topology.remove(&node.id) {
                Some(removed) => {
                    self.node_removed(&removed);
                    true
                }
                None => false,
            },
        }
    }

    fn node_removed(&self, node: &Node) {
        info!(node = %node.id, "Node removed");
        self.events.emit(SwarmEvent::NodeRemoved(node.clone()));

        if self.is_ready() {
            let members = self.topology.member_ids();
            self.election.on_removed(&node.id, &members);
        }

        if self.identity.is_me(&node.id) {
            error!(node = %node.id, "Local node removed from the cluster");
            self.events
                .emit(SwarmEvent::Error(SwarmError::SelfRemoved(node.id.clone())));
            self.terminate.cancel();
        }
    }

    fn report(&self, err: SwarmError) {
        warn!(provider = self.provider.name(), "Membership sync failed: {}", err);
        self.events.emit(SwarmEvent::Error(err));
    }

    /// Sleeps for `delay` unless stopped first. Returns false when stopped.
    async fn pause(&self, delay: Duration, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = self.terminate.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn initial_sync(&self, shutdown: &CancellationToken) -> bool {
        let mut attempt = 0u32;
        while !self.is_ready() {
            let done = self.sync_done.notified();
            tokio::pin!(done);
            done.as_mut().enable();

            match self.resync().await {
                Ok(ResyncOutcome::Applied(_)) => {}
                Ok(ResyncOutcome::Skipped) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return false,
                        _ = done => {}
                    }
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt, &e);
                    self.report(e);
                    if !self.pause(delay, shutdown).await {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Drives reconciliation until `shutdown` fires or the local node is
    /// removed.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(provider = self.provider.name(), "Membership reconciliation started");
        if !self.initial_sync(&shutdown).await {
            return;
        }

        let mut refresh = tokio::time::interval(self.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.reset();

        let mut watch = self.provider.watch(self.cursor());
        let mut failures = 0u32;
        // Consecutive stream ends with nothing delivered in between.
        let mut quiet_ends = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.terminate.cancelled() => break,
                _ = refresh.tick() => {
                    if let Err(e) = self.resync().await {
                        self.report(e);
                    }
                }
                event = next_event(&mut watch) => match event {
                    Some(Ok(event)) => {
                        failures = 0;
                        quiet_ends = 0;
                        if event.cursor.is_some() {
                            *self.cursor.lock() = event.cursor;
                        }
                        if let Some(change) = event.change {
                            self.apply_change(change);
                        }
                    }
                    Some(Err(e)) => {
                        failures += 1;
                        let delay = self.retry.delay_for(failures, &e);
                        let expired = matches!(e, SwarmError::CursorExpired);
                        if expired {
                            debug!("Watch cursor expired");
                            self.cursor.lock().take();
                        } else {
                            self.report(e);
                        }
                        if !self.pause(delay, &shutdown).await {
                            break;
                        }
                        if self.cursor().is_none() {
                            if let Err(e) = self.resync().await {
                                self.report(e);
                            }
                        }
                        watch = self.provider.watch(self.cursor());
                    }
                    None => {
                        quiet_ends += 1;
                        if quiet_ends > 1 {
                            let delay = self
                                .retry
                                .delay_for(quiet_ends - 1, &SwarmError::provider("watch closed"));
                            debug!(?delay, "Watch keeps closing without events, backing off");
                            if !self.pause(delay, &shutdown).await {
                                break;
                            }
                        } else {
                            debug!("Watch ended, resuming");
                        }
                        watch = self.provider.watch(self.cursor());
                    }
                },
            }
        }
        info!("Membership reconciliation stopped");
    }
}

async fn next_event(watch: &mut Option<MembershipWatch>) -> Option<Result<super::provider::WatchEvent>> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("provider", &self.provider.name())
            .field("ready", &self.is_ready())
            .field("cursor", &self.cursor())
            .finish_non_exhaustive()
    }
}
