//! Named tasks and their execution policies

mod options;
mod queue;
mod scheduler;

pub use options::{SingleTrigger, TaskOptions, TaskPolicy, DEFAULT_MAX_QUEUE_LENGTH, DEFAULT_TIMEOUT};
pub use queue::{Admission, Invocation, Outcome, QueueState, TaskQueue};
pub use scheduler::{handler, routing_key, Scheduler, TaskDefinition, TaskHandler};
