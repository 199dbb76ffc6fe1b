//! Per-task execution queue
//!
//! Pure state machine: callers hold the task's lock around every transition
//! and never across an await. Running the handler and delivering outcomes
//! happens outside.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::oneshot;

use super::options::SingleTrigger;
use crate::error::{Result, SwarmError};

pub type Outcome = Result<Value>;
pub type Waiter = oneshot::Sender<Outcome>;

/// One handler execution and everybody waiting on it.
#[derive(Debug)]
pub struct Invocation {
    args: Vec<Value>,
    waiters: Vec<Waiter>,
}

impl Invocation {
    fn new(args: Vec<Value>, waiter: Waiter) -> Self {
        Self {
            args,
            waiters: vec![waiter],
        }
    }

    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }

    /// Hands the same outcome to every waiter still listening.
    pub fn resolve(self, outcome: Outcome) {
        for waiter in self.waiters {
            // Timed-out callers have dropped their receiver.
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Where an accepted call ended up.
#[derive(Debug, PartialEq)]
pub enum Admission {
    /// The queue was idle. The caller must run the handler with these args.
    Start(Vec<Value>),
    /// Joined an existing invocation.
    Coalesced,
    /// New invocation at this position of the pending queue, 1-based.
    Queued(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Running,
    /// Running with this many invocations pending.
    RunningQueued(usize),
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    current: Option<Invocation>,
    pending: VecDeque<Invocation>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> QueueState {
        match (&self.current, self.pending.len()) {
            (None, _) => QueueState::Idle,
            (Some(_), 0) => QueueState::Running,
            (Some(_), n) => QueueState::RunningQueued(n),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Accepts a call or rejects it with `QueueFull`. A rejected call's
    /// waiter is dropped.
    pub fn admit(
        &mut self,
        task: &str,
        args: Vec<Value>,
        waiter: Waiter,
        trigger: SingleTrigger,
        max_queue_length: usize,
    ) -> Result<Admission> {
        let Some(current) = self.current.as_mut() else {
            self.current = Some(Invocation::new(Vec::new(), waiter));
            return Ok(Admission::Start(args));
        };

        match trigger {
            SingleTrigger::Running => {
                current.waiters.push(waiter);
                return Ok(Admission::Coalesced);
            }
            SingleTrigger::NextBatch => {
                if let Some(next) = self.pending.front_mut() {
                    next.waiters.push(waiter);
                    return Ok(Admission::Coalesced);
                }
            }
            SingleTrigger::Off => {}
        }

        if self.pending.len() >= max_queue_length {
            return Err(SwarmError::QueueFull {
                task: task.to_string(),
                limit: max_queue_length,
            });
        }
        self.pending.push_back(Invocation::new(args, waiter));
        Ok(Admission::Queued(self.pending.len()))
    }

    /// Ends the running invocation and promotes the head of the queue.
    /// Returns the finished invocation, to be resolved outside the lock, and
    /// the args to run next, `None` once idle.
    pub fn complete(&mut self) -> (Option<Invocation>, Option<Vec<Value>>) {
        let finished = self.current.take();
        let next = self.pending.pop_front().map(|mut next| {
            let args = std::mem::take(&mut next.args);
            self.current = Some(next);
            args
        });
        (finished, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn waiter() -> (Waiter, oneshot::Receiver<Outcome>) {
        oneshot::channel()
    }

    #[test]
    fn test_fifo_without_trigger() {
        let mut queue = TaskQueue::new();
        let (w1, mut r1) = waiter();
        let (w2, mut r2) = waiter();
        let (w3, mut r3) = waiter();

        assert_eq!(
            queue.admit("t", vec![json!(1)], w1, SingleTrigger::Off, 20).unwrap(),
            Admission::Start(vec![json!(1)])
        );
        assert_eq!(queue.admit("t", vec![json!(2)], w2, SingleTrigger::Off, 20).unwrap(), Admission::Queued(1));
        assert_eq!(queue.admit("t", vec![json!(3)], w3, SingleTrigger::Off, 20).unwrap(), Admission::Queued(2));
        assert_eq!(queue.state(), QueueState::RunningQueued(2));

        let (finished, next) = queue.complete();
        finished.unwrap().resolve(Ok(json!("first")));
        assert_eq!(next, Some(vec![json!(2)]));
        assert_eq!(r1.try_recv().unwrap().unwrap(), json!("first"));
        assert!(r2.try_recv().is_err());

        let (finished, next) = queue.complete();
        finished.unwrap().resolve(Err(SwarmError::Handler { task: "t".into(), message: "boom".into() }));
        assert_eq!(next, Some(vec![json!(3)]));
        assert!(r2.try_recv().unwrap().is_err());

        let (finished, next) = queue.complete();
        finished.unwrap().resolve(Ok(json!("third")));
        assert_eq!(next, None);
        assert_eq!(r3.try_recv().unwrap().unwrap(), json!("third"));
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[test]
    fn test_running_trigger_joins_current() {
        let mut queue = TaskQueue::new();
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (w, r) = waiter();
            receivers.push(r);
            let admission = queue.admit("t", vec![json!(i)], w, SingleTrigger::Running, 0).unwrap();
            if i == 0 {
                assert!(matches!(admission, Admission::Start(_)));
            } else {
                assert_eq!(admission, Admission::Coalesced);
            }
        }
        assert_eq!(queue.state(), QueueState::Running);

        let (finished, next) = queue.complete();
        let finished = finished.unwrap();
        assert_eq!(finished.waiters(), 3);
        finished.resolve(Ok(json!(42)));
        assert_eq!(next, None);
        for mut r in receivers {
            assert_eq!(r.try_recv().unwrap().unwrap(), json!(42));
        }
    }

    #[test]
    fn test_next_batch_keeps_one_pending() {
        let mut queue = TaskQueue::new();
        let (w, _r0) = waiter();
        queue.admit("t", vec![json!(0)], w, SingleTrigger::NextBatch, 20).unwrap();

        let mut later = Vec::new();
        for i in 1..=3 {
            let (w, r) = waiter();
            later.push(r);
            queue.admit("t", vec![json!(i)], w, SingleTrigger::NextBatch, 20).unwrap();
        }
        assert_eq!(queue.state(), QueueState::RunningQueued(1));

        let (_, next) = queue.complete();
        // the batch runs with the arguments of the call that opened it
        assert_eq!(next, Some(vec![json!(1)]));
        let (finished, next) = queue.complete();
        assert_eq!(finished.unwrap().waiters(), 3);
        assert_eq!(next, None);
    }

    #[test]
    fn test_queue_full_rejects_only_new_invocation() {
        let mut queue = TaskQueue::new();
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (w, r) = waiter();
            receivers.push(r);
            queue.admit("t", vec![json!(i)], w, SingleTrigger::Off, 2).unwrap();
        }
        let (w, mut rejected) = waiter();
        let err = queue.admit("t", vec![json!(3)], w, SingleTrigger::Off, 2).unwrap_err();
        assert!(matches!(err, SwarmError::QueueFull { limit: 2, .. }));
        assert!(rejected.try_recv().is_err());
        assert_eq!(queue.pending_len(), 2);
    }

    #[test]
    fn test_zero_limit_next_batch_rejects_new_batch() {
        let mut queue = TaskQueue::new();
        let (w, _r) = waiter();
        queue.admit("t", vec![], w, SingleTrigger::NextBatch, 0).unwrap();
        let (w, _r) = waiter();
        assert!(queue.admit("t", vec![], w, SingleTrigger::NextBatch, 0).is_err());
    }
}
