//! Task registry and scheduler
//!
//! `exec` resolves the owner of a routing key on the ring and either runs the
//! task here or ships a [`TaskEnvelope`] to the owner, which always runs it
//! locally. Local runs of serialized tasks go through the task's
//! [`TaskQueue`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::options::{TaskOptions, TaskPolicy};
use super::queue::{Admission, Outcome, QueueState, TaskQueue};
use crate::cluster::{LocalIdentity, NodeId, Topology};
use crate::config::TasksConfig;
use crate::error::{Result, SwarmError};
use crate::transport::{Message, TaskEnvelope, Transport, TASK_TOPIC};

pub type TaskHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wraps an async function as a [`TaskHandler`]. Any error convertible to
/// `anyhow::Error` is accepted; a [`SwarmError`] reaches callers unchanged.
pub fn handler<F, Fut, E>(f: F) -> TaskHandler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, E>> + Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    Arc::new(move |args| f(args).map(|r| r.map_err(Into::into)).boxed())
}

/// A task to register in bulk.
pub struct TaskDefinition {
    pub name: String,
    pub handler: TaskHandler,
    pub options: TaskOptions,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, handler: TaskHandler) -> Self {
        Self {
            name: name.into(),
            handler,
            options: TaskOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

struct TaskEntry {
    name: String,
    handler: TaskHandler,
    policy: TaskPolicy,
    queue: Mutex<TaskQueue>,
}

struct SchedulerInner {
    tasks: DashMap<String, Arc<TaskEntry>>,
    topology: Arc<Topology>,
    identity: LocalIdentity,
    transport: Arc<dyn Transport>,
    config: TasksConfig,
}

/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Routing key for a call without an explicit one: the first argument,
/// unless it is missing or falsy, in which case the task name.
pub fn routing_key(name: &str, args: &[Value]) -> String {
    match args.first() {
        None | Some(Value::Null) | Some(Value::Bool(false)) => name.to_string(),
        Some(Value::String(s)) if s.is_empty() => name.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) if n.as_f64() == Some(0.0) => name.to_string(),
        Some(other) => other.to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

/// Runs the handler once, turning errors and panics into an outcome.
async fn invoke(entry: &TaskEntry, args: Vec<Value>) -> Outcome {
    let started = Instant::now();
    let call = AssertUnwindSafe(async move { (entry.handler)(args).await }).catch_unwind();
    let outcome = match call.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(match e.downcast::<SwarmError>() {
            Ok(e) => e,
            Err(e) => SwarmError::Handler {
                task: entry.name.clone(),
                message: format!("{:#}", e),
            },
        }),
        Err(panic) => Err(SwarmError::Handler {
            task: entry.name.clone(),
            message: panic_message(panic.as_ref()),
        }),
    };
    debug!(
        task = %entry.name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = outcome.is_ok(),
        "Invocation finished"
    );
    outcome
}

/// Runs invocations of a serialized task back to back until its queue is
/// empty.
async fn drain(entry: Arc<TaskEntry>, mut args: Vec<Value>) {
    loop {
        let outcome = invoke(&entry, args).await;
        let (finished, next) = entry.queue.lock().complete();
        if let Some(finished) = finished {
            finished.resolve(outcome);
        }
        match next {
            Some(next) => args = next,
            None => break,
        }
    }
}

async fn handle_envelope(scheduler: Weak<SchedulerInner>, message: Message) -> Result<Option<Value>> {
    let inner = scheduler
        .upgrade()
        .ok_or_else(|| SwarmError::transport("scheduler is gone"))?;
    let envelope: TaskEnvelope = serde_json::from_value(message.payload)
        .map_err(|e| SwarmError::bad_request(format!("Invalid task envelope: {}", e)))?;
    debug!(task = %envelope.task, from = ?message.from, "Dispatched task received");
    inner.execute_local(&envelope.task, envelope.args).await.map(Some)
}

impl SchedulerInner {
    fn entry(&self, name: &str) -> Result<Arc<TaskEntry>> {
        self.tasks
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| SwarmError::TaskNotFound(name.to_string()))
    }

    async fn execute_local(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let entry = self.entry(name)?;
        run(entry, args).await
    }
}

async fn run(entry: Arc<TaskEntry>, args: Vec<Value>) -> Result<Value> {
    let policy = entry.policy;
    let timed_out = || SwarmError::Timeout {
        task: entry.name.clone(),
        after: policy.timeout,
    };

    if !policy.serialized {
        let task = entry.clone();
        let handle = tokio::spawn(async move { invoke(&task, args).await });
        return match timeout(policy.timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(SwarmError::Handler {
                task: entry.name.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(timed_out()),
        };
    }

    let (tx, rx) = oneshot::channel();
    let admission = entry.queue.lock().admit(
        &entry.name,
        args,
        tx,
        policy.single_trigger,
        policy.max_queue_length,
    )?;
    match admission {
        Admission::Start(args) => {
            tokio::spawn(drain(entry.clone(), args));
        }
        Admission::Coalesced => debug!(task = %entry.name, "Call coalesced"),
        Admission::Queued(position) => debug!(task = %entry.name, queue = position, "Call queued"),
    }

    match timeout(policy.timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(SwarmError::Handler {
            task: entry.name.clone(),
            message: "invocation dropped before completing".to_string(),
        }),
        Err(_) => Err(timed_out()),
    }
}

impl Scheduler {
    /// Creates the scheduler and starts serving dispatched tasks on the
    /// transport's reserved topic.
    pub fn new(
        topology: Arc<Topology>,
        identity: LocalIdentity,
        transport: Arc<dyn Transport>,
        config: TasksConfig,
    ) -> Self {
        let inner = Arc::new(SchedulerInner {
            tasks: DashMap::new(),
            topology,
            identity,
            transport,
            config,
        });

        let weak = Arc::downgrade(&inner);
        inner
            .transport
            .router()
            .on(TASK_TOPIC, move |message| handle_envelope(weak.clone(), message));

        Self { inner }
    }

    /// Registers `name`. Options not given here come from the configured
    /// overrides for that name, then from the configured defaults.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: TaskHandler,
        options: TaskOptions,
    ) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SwarmError::Registration {
                task: name,
                reason: "task name must not be empty".to_string(),
            });
        }

        let config = &self.inner.config;
        let policy = options
            .or(&config.override_for(&name))
            .resolve(&config.defaults());

        match self.inner.tasks.entry(name.clone()) {
            Entry::Occupied(_) => Err(SwarmError::Registration {
                task: name,
                reason: "already registered".to_string(),
            }),
            Entry::Vacant(slot) => {
                info!(task = %name, ?policy, "Task registered");
                slot.insert(Arc::new(TaskEntry {
                    name,
                    handler,
                    policy,
                    queue: Mutex::new(TaskQueue::new()),
                }));
                Ok(())
            }
        }
    }

    /// Registers every definition, `shared` filling options an entry leaves
    /// unset. One failure does not stop the others.
    pub fn register_all<I>(&self, definitions: I, shared: TaskOptions) -> Vec<(String, Result<()>)>
    where
        I: IntoIterator<Item = TaskDefinition>,
    {
        definitions
            .into_iter()
            .map(|def| {
                let result = self.register(def.name.clone(), def.handler, def.options.or(&shared));
                if let Err(e) = &result {
                    warn!(task = %def.name, "Registration failed: {}", e);
                }
                (def.name, result)
            })
            .collect()
    }

    /// Runs `name` on the node owning the routing key derived from `args`.
    pub async fn exec(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let key = routing_key(name, &args);
        self.exec_with_key(name, &key, args).await
    }

    pub async fn exec_with_key(&self, name: &str, key: &str, args: Vec<Value>) -> Result<Value> {
        let entry = self.inner.entry(name)?;
        let owner = self.inner.topology.owner_of(key)?;
        match owner {
            Some(node) if !self.inner.identity.is_me(&node) => self.dispatch(name, node, args).await,
            _ => run(entry, args).await,
        }
    }

    /// Runs `name` here, whoever owns it on the ring.
    pub async fn execute_local(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.execute_local(name, args).await
    }

    async fn dispatch(&self, name: &str, node: NodeId, args: Vec<Value>) -> Result<Value> {
        debug!(task = name, node = %node, "Dispatching task");
        let envelope = TaskEnvelope {
            task: name.to_string(),
            args,
        };
        let wrap = |source: SwarmError| SwarmError::Dispatch {
            task: name.to_string(),
            node: node.clone(),
            source: Box::new(source),
        };
        let payload = serde_json::to_value(&envelope).map_err(|e| wrap(e.into()))?;
        let response = self
            .inner
            .transport
            .send(&node, TASK_TOPIC, payload)
            .await
            .map_err(wrap)?;
        Ok(response.unwrap_or(Value::Null))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.tasks.contains_key(name)
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tasks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn policy(&self, name: &str) -> Option<TaskPolicy> {
        self.inner.tasks.get(name).map(|e| e.policy)
    }

    /// `None` for unknown tasks. Parallel tasks are always idle.
    pub fn queue_state(&self, name: &str) -> Option<QueueState> {
        let entry = self.inner.tasks.get(name)?.value().clone();
        let state = entry.queue.lock().state();
        Some(state)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("local", self.inner.identity.id())
            .field("tasks", &self.task_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;
    use crate::tasks::SingleTrigger;
    use crate::transport::LocalNetwork;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn scheduler_with(members: &[&str], local: &str) -> Scheduler {
        let topology = Arc::new(Topology::new(16));
        for id in members {
            topology.add(Node::new(*id));
        }
        topology.initialize_ring();
        let network = LocalNetwork::new();
        let transport = Arc::new(network.transport(local, Duration::from_secs(60)));
        Scheduler::new(topology, LocalIdentity::new(local), transport, TasksConfig::default())
    }

    fn single_node() -> Scheduler {
        scheduler_with(&["local"], "local")
    }

    fn counted<F, Fut>(count: &Arc<AtomicUsize>, f: F) -> TaskHandler
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let count = count.clone();
        handler(move |args| {
            count.fetch_add(1, Ordering::SeqCst);
            f(args)
        })
    }

    fn sleeper(ms: u64) -> impl Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync {
        move |_args| {
            async move {
                let start = Instant::now();
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(start.elapsed().as_millis() as u64))
            }
            .boxed()
        }
    }

    #[test]
    fn test_routing_key_falls_back_on_falsy() {
        assert_eq!(routing_key("t", &[]), "t");
        assert_eq!(routing_key("t", &[Value::Null]), "t");
        assert_eq!(routing_key("t", &[json!(false)]), "t");
        assert_eq!(routing_key("t", &[json!(0)]), "t");
        assert_eq!(routing_key("t", &[json!("")]), "t");
        assert_eq!(routing_key("t", &[json!("user-1"), json!(2)]), "user-1");
        assert_eq!(routing_key("t", &[json!(7)]), "7");
        assert_eq!(routing_key("t", &[json!({"a": 1})]), "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_empty_names() {
        let scheduler = single_node();
        let noop = || handler(|_| async { Ok::<_, anyhow::Error>(Value::Null) });
        scheduler.register("a", noop(), TaskOptions::new()).unwrap();
        assert!(matches!(
            scheduler.register("a", noop(), TaskOptions::new()),
            Err(SwarmError::Registration { .. })
        ));
        assert!(scheduler.register(" ", noop(), TaskOptions::new()).is_err());

        let results = scheduler.register_all(
            [
                TaskDefinition::new("b", noop()),
                TaskDefinition::new("a", noop()),
                TaskDefinition::new("c", noop()).with_options(TaskOptions::new().serialized(true)),
            ],
            TaskOptions::new().serialized(false),
        );
        let ok: Vec<bool> = results.iter().map(|(_, r)| r.is_ok()).collect();
        assert_eq!(ok, vec![true, false, true]);
        assert_eq!(scheduler.task_names(), vec!["a", "b", "c"]);
        assert!(!scheduler.policy("b").unwrap().serialized);
        assert!(scheduler.policy("c").unwrap().serialized);
    }

    #[tokio::test]
    async fn test_unknown_task_and_empty_ring() {
        let scheduler = single_node();
        assert!(matches!(
            scheduler.exec("missing", vec![]).await,
            Err(SwarmError::TaskNotFound(_))
        ));

        let empty = scheduler_with(&[], "local");
        empty
            .register("t", handler(|_| async { Ok::<_, anyhow::Error>(json!(1)) }), TaskOptions::new())
            .unwrap();
        assert!(matches!(empty.exec("t", vec![]).await, Err(SwarmError::RingNotReady)));
        // dispatched envelopes bypass the ring
        assert_eq!(empty.execute_local("t", vec![]).await.unwrap(), json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialized_calls_run_in_order() {
        let scheduler = single_node();
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        scheduler
            .register(
                "sum",
                handler(move |args: Vec<Value>| {
                    let seen = seen.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        let sum = args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0);
                        seen.lock().push(sum);
                        Ok::<_, anyhow::Error>(json!(sum))
                    }
                }),
                TaskOptions::new(),
            )
            .unwrap();

        let (a, b) = tokio::join!(
            scheduler.exec("sum", vec![json!(1), json!(2)]),
            scheduler.exec("sum", vec![json!(3), json!(4)]),
        );
        assert_eq!(a.unwrap(), json!(3));
        assert_eq!(b.unwrap(), json!(7));
        assert_eq!(*order.lock(), vec![3, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trigger_shares_running_invocation() {
        let scheduler = single_node();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(
                "t",
                counted(&count, sleeper(100)),
                TaskOptions::new().single_trigger(true),
            )
            .unwrap();

        let (a, b, c) = tokio::join!(
            scheduler.exec("t", vec![]),
            scheduler.exec("t", vec![]),
            scheduler.exec("t", vec![]),
        );
        let a = a.unwrap();
        assert_eq!(a, b.unwrap());
        assert_eq!(a, c.unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_batch_runs_twice() {
        let scheduler = single_node();
        let count = Arc::new(AtomicUsize::new(0));
        let origin = Instant::now();
        scheduler
            .register(
                "t",
                counted(&count, move |_| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!(origin.elapsed().as_millis() as u64))
                }),
                TaskOptions::new().single_trigger(SingleTrigger::NextBatch),
            )
            .unwrap();

        let delayed = |ms: u64| {
            let scheduler = scheduler.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                scheduler.exec("t", vec![]).await.unwrap()
            }
        };
        let (first, b, c, d) = tokio::join!(delayed(0), delayed(25), delayed(50), delayed(75));

        assert_eq!(first, json!(100));
        assert_eq!(b, json!(200));
        assert_eq!(b, c);
        assert_eq!(b, d);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_limit_rejects_fourth_call_immediately() {
        let scheduler = single_node();
        scheduler
            .register(
                "t",
                handler(sleeper(100)),
                TaskOptions::new().max_queue_length(2),
            )
            .unwrap();

        let origin = Instant::now();
        let timed = || {
            let scheduler = scheduler.clone();
            async move {
                let result = scheduler.exec("t", vec![]).await;
                (result, origin.elapsed())
            }
        };
        let (a, b, c, d) = tokio::join!(timed(), timed(), timed(), timed());

        assert!(a.0.is_ok() && b.0.is_ok() && c.0.is_ok());
        assert!(matches!(d.0, Err(SwarmError::QueueFull { limit: 2, .. })));
        assert_eq!(d.1, Duration::ZERO);
        assert!(a.1 >= Duration::from_millis(100));
        assert!(c.1 >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_handler_running() {
        let scheduler = single_node();
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        scheduler
            .register(
                "slow",
                handler(move |_| {
                    let done = done.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(Value::Null)
                    }
                }),
                TaskOptions::new().timeout(Duration::from_millis(50)),
            )
            .unwrap();

        let origin = Instant::now();
        let err = scheduler.exec("slow", vec![]).await.unwrap_err();
        assert!(matches!(err, SwarmError::Timeout { .. }));
        assert_eq!(origin.elapsed(), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.queue_state("slow"), Some(QueueState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_tasks_do_not_queue() {
        let scheduler = single_node();
        scheduler
            .register("p", handler(sleeper(100)), TaskOptions::new().serialized(false))
            .unwrap();

        let origin = Instant::now();
        let (a, b, c) = tokio::join!(
            scheduler.exec("p", vec![]),
            scheduler.exec("p", vec![]),
            scheduler.exec("p", vec![]),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert!(origin.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_and_panic_do_not_stop_drain() {
        let scheduler = single_node();
        scheduler
            .register(
                "flaky",
                handler(|args: Vec<Value>| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    match args[0].as_str() {
                        Some("fail") => Err(anyhow::anyhow!("bad input")),
                        Some("panic") => panic!("boom"),
                        _ => Ok(json!("ok")),
                    }
                }),
                TaskOptions::new(),
            )
            .unwrap();

        let (a, b, c) = tokio::join!(
            scheduler.exec("flaky", vec![json!("fail")]),
            scheduler.exec("flaky", vec![json!("panic")]),
            scheduler.exec("flaky", vec![json!("fine")]),
        );
        assert!(matches!(a, Err(SwarmError::Handler { message, .. }) if message.contains("bad input")));
        assert!(matches!(b, Err(SwarmError::Handler { message, .. }) if message.contains("boom")));
        assert_eq!(c.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_single_node_always_local() {
        let scheduler = single_node();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(
                "t",
                counted(&count, |_| async { Ok(json!("here")) }),
                TaskOptions::new().serialized(false),
            )
            .unwrap();

        for key in ["a", "b", "zzz", "t"] {
            assert_eq!(scheduler.exec_with_key("t", key, vec![]).await.unwrap(), json!("here"));
        }
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_unreachable_owner_wraps_error() {
        let scheduler = scheduler_with(&["remote"], "local");
        scheduler
            .register("t", handler(|_| async { Ok::<_, anyhow::Error>(json!(1)) }), TaskOptions::new())
            .unwrap();

        let err = scheduler.exec("t", vec![]).await.unwrap_err();
        match err {
            SwarmError::Dispatch { task, node, source } => {
                assert_eq!(task, "t");
                assert_eq!(node, NodeId::from("remote"));
                assert!(matches!(*source, SwarmError::Transport(_)));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
