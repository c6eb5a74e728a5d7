//! Hand-off of instance work to the runtime
//!
//! The repository never executes machines. It verifies that an
//! [`InstanceRef`] points at an existing instance and then hands a [`Job`]
//! to a [`Dispatcher`], typically a message queue consumed by the runtime.

use crate::entity::InstanceRef;
use crate::error::Result;
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Topic consumed by runtime workers starting instances
pub const RUN_TOPIC: &str = "runInstance";

/// Work item for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Job {
    /// Start or resume an instance, optionally from a snapshot
    Run {
        instance: InstanceRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<String>,
    },
    /// Stop a running instance
    Stop { instance: InstanceRef },
    /// Deliver an event to a running instance
    Event {
        instance: InstanceRef,
        event: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl Job {
    pub fn instance(&self) -> &InstanceRef {
        match self {
            Job::Run { instance, .. } | Job::Stop { instance } | Job::Event { instance, .. } => {
                instance
            }
        }
    }

    /// Queue topic the job is published on
    ///
    /// Runs share one topic; stops and events are addressed to the instance.
    pub fn topic(&self) -> String {
        match self {
            Job::Run { .. } => RUN_TOPIC.to_string(),
            Job::Stop { instance } => format!("stop:{}", instance),
            Job::Event { instance, .. } => format!("event:{}", instance),
        }
    }
}

/// Sink for runtime jobs
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Job) -> Result<()>;
}

/// Per-topic FIFO queues held in memory
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    topics: Mutex<AHashMap<String, VecDeque<Job>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the oldest job of `topic`
    pub fn pop(&self, topic: &str) -> Option<Job> {
        let mut topics = self.topics.lock();
        let queue = topics.get_mut(topic)?;
        let job = queue.pop_front();
        if queue.is_empty() {
            topics.remove(topic);
        }
        job
    }

    pub fn len(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, |q| q.len())
    }

    pub fn is_empty(&self) -> bool {
        self.topics.lock().is_empty()
    }

    /// Topics with pending jobs
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<_> = self.topics.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Dispatcher for InMemoryQueue {
    fn dispatch(&self, job: Job) -> Result<()> {
        self.topics
            .lock()
            .entry(job.topic())
            .or_default()
            .push_back(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceRef {
        InstanceRef::new("door", "version1", "instance2")
    }

    #[test]
    fn test_topics() {
        let run = Job::Run {
            instance: instance(),
            snapshot: None,
        };
        assert_eq!(run.topic(), "runInstance");
        assert_eq!(Job::Stop { instance: instance() }.topic(), "stop:door:version1:instance2");
        let event = Job::Event {
            instance: instance(),
            event: "open".to_string(),
            data: serde_json::Value::Null,
        };
        assert_eq!(event.topic(), "event:door:version1:instance2");
        assert_eq!(event.instance(), &instance());
    }

    #[test]
    fn test_queue_is_fifo_per_topic() {
        let queue = InMemoryQueue::new();
        for name in ["open", "close"] {
            queue
                .dispatch(Job::Event {
                    instance: instance(),
                    event: name.to_string(),
                    data: serde_json::json!({ "by": "test" }),
                })
                .unwrap();
        }
        queue.dispatch(Job::Stop { instance: instance() }).unwrap();

        assert_eq!(queue.len("event:door:version1:instance2"), 2);
        assert_eq!(queue.topics().len(), 2);

        match queue.pop("event:door:version1:instance2") {
            Some(Job::Event { event, .. }) => assert_eq!(event, "open"),
            other => panic!("unexpected: {:?}", other),
        }
        match queue.pop("event:door:version1:instance2") {
            Some(Job::Event { event, .. }) => assert_eq!(event, "close"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(queue.pop("event:door:version1:instance2").is_none());
        assert!(queue.pop("stop:door:version1:instance2").is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_job_json_shape() {
        let job = Job::Run {
            instance: instance(),
            snapshot: Some("snapshot3".to_string()),
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["type"], "run");
        assert_eq!(json["instance"]["machine"], "door");
        assert_eq!(json["snapshot"], "snapshot3");
    }
}
