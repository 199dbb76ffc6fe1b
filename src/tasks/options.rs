//! Per-task execution options

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 20;

/// How calls arriving while a serialized task is busy are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "TriggerRepr", into = "TriggerRepr")]
pub enum SingleTrigger {
    /// Every call gets its own invocation.
    #[default]
    Off,
    /// Join the invocation that is running right now.
    Running,
    /// Join the next queued invocation, creating it when needed.
    NextBatch,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TriggerRepr {
    Flag(bool),
    Mode(String),
}

impl TryFrom<TriggerRepr> for SingleTrigger {
    type Error = String;

    fn try_from(repr: TriggerRepr) -> Result<Self, Self::Error> {
        match repr {
            TriggerRepr::Flag(false) => Ok(SingleTrigger::Off),
            TriggerRepr::Flag(true) => Ok(SingleTrigger::Running),
            TriggerRepr::Mode(mode) if mode.eq_ignore_ascii_case("n") => Ok(SingleTrigger::NextBatch),
            TriggerRepr::Mode(mode) => Err(format!(
                "invalid single_trigger value {:?}, expected true, false or \"N\"",
                mode
            )),
        }
    }
}

impl From<SingleTrigger> for TriggerRepr {
    fn from(trigger: SingleTrigger) -> Self {
        match trigger {
            SingleTrigger::Off => TriggerRepr::Flag(false),
            SingleTrigger::Running => TriggerRepr::Flag(true),
            SingleTrigger::NextBatch => TriggerRepr::Mode("N".to_string()),
        }
    }
}

impl From<bool> for SingleTrigger {
    fn from(flag: bool) -> Self {
        if flag {
            SingleTrigger::Running
        } else {
            SingleTrigger::Off
        }
    }
}

/// Options as given at registration or in configuration. Unset fields fall
/// through to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serialized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_trigger: Option<SingleTrigger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_length: Option<usize>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn serialized(mut self, serialized: bool) -> Self {
        self.serialized = Some(serialized);
        self
    }

    pub fn single_trigger(mut self, trigger: impl Into<SingleTrigger>) -> Self {
        self.single_trigger = Some(trigger.into());
        self
    }

    pub fn max_queue_length(mut self, limit: usize) -> Self {
        self.max_queue_length = Some(limit);
        self
    }

    /// Fills every unset field from `fallback`.
    pub fn or(self, fallback: &TaskOptions) -> TaskOptions {
        TaskOptions {
            timeout_ms: self.timeout_ms.or(fallback.timeout_ms),
            serialized: self.serialized.or(fallback.serialized),
            single_trigger: self.single_trigger.or(fallback.single_trigger),
            max_queue_length: self.max_queue_length.or(fallback.max_queue_length),
        }
    }

    pub fn resolve(&self, defaults: &TaskPolicy) -> TaskPolicy {
        TaskPolicy {
            timeout: self
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            serialized: self.serialized.unwrap_or(defaults.serialized),
            single_trigger: self.single_trigger.unwrap_or(defaults.single_trigger),
            max_queue_length: self.max_queue_length.unwrap_or(defaults.max_queue_length),
        }
    }
}

/// Fully resolved options of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPolicy {
    pub timeout: Duration,
    pub serialized: bool,
    pub single_trigger: SingleTrigger,
    pub max_queue_length: usize,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            serialized: true,
            single_trigger: SingleTrigger::Off,
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_trigger_accepts_bool_or_n() {
        let t: SingleTrigger = serde_yaml::from_str("true").unwrap();
        assert_eq!(t, SingleTrigger::Running);
        let t: SingleTrigger = serde_yaml::from_str("false").unwrap();
        assert_eq!(t, SingleTrigger::Off);
        let t: SingleTrigger = serde_yaml::from_str("N").unwrap();
        assert_eq!(t, SingleTrigger::NextBatch);
        assert!(serde_yaml::from_str::<SingleTrigger>("maybe").is_err());

        assert_eq!(serde_json::to_string(&SingleTrigger::NextBatch).unwrap(), "\"N\"");
        assert_eq!(serde_json::to_string(&SingleTrigger::Running).unwrap(), "true");
    }

    #[test]
    fn test_layers_resolve_in_order() {
        let entry = TaskOptions::new().timeout(Duration::from_millis(50));
        let shared = TaskOptions::new().timeout(Duration::from_secs(1)).serialized(false);
        let configured = TaskOptions::new().max_queue_length(2).serialized(true);

        let policy = entry.or(&shared).or(&configured).resolve(&TaskPolicy::default());
        assert_eq!(policy.timeout, Duration::from_millis(50));
        assert!(!policy.serialized);
        assert_eq!(policy.max_queue_length, 2);
        assert_eq!(policy.single_trigger, SingleTrigger::Off);
    }
}
