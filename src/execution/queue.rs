//! Message transport between the engine's consumers
//!
//! Delivery is at least once: a consumed message stays in flight until it is
//! acked, and a nack puts it back (optionally delayed). Publishing is
//! deduplicated by the message's notify id. The in-memory queue remembers a
//! bounded window of the most recent notify ids.

use crate::core::schema;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// Logical queue a message is published to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    NodeStart,
    Facilitate,
    NodeAdvise,
    Interrupt,
    SdkResponse,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Interrupt,
        Topic::NodeStart,
        Topic::Facilitate,
        Topic::SdkResponse,
        Topic::NodeAdvise,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::NodeStart => "node-start",
            Topic::Facilitate => "facilitate",
            Topic::NodeAdvise => "node-advise",
            Topic::Interrupt => "interrupt",
            Topic::SdkResponse => "sdk-response",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to encode {schema} payload: {source}")]
    Encode {
        schema: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode message {id}: {source}")]
    Decode {
        id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("message {id} carries schema {actual}, expected {expected}")]
    SchemaMismatch { id: Uuid, expected: u32, actual: u32 },

    #[error("message {0} is not in flight")]
    NotInFlight(Uuid),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

impl QueueError {
    /// The transport itself failed, as opposed to a bad message
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// Payload carried on a topic, tagged with its schema identifier
pub trait Payload: Serialize + DeserializeOwned {
    const TOPIC: Topic;
    const SCHEMA_ID: u32;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub topic: Topic,
    /// Deduplication key; a second publish with the same key is dropped
    pub notify_id: Option<String>,
    pub schema_id: u32,
    pub payload: Vec<u8>,
    /// Deliveries so far, including the current one
    pub attempts: u32,
}

impl Message {
    pub fn encode<P: Payload>(payload: &P, notify_id: Option<String>) -> Result<Self, QueueError> {
        let bytes = serde_json::to_vec(payload).map_err(|source| QueueError::Encode {
            schema: schema::name_of(P::SCHEMA_ID).unwrap_or("unknown"),
            source,
        })?;
        Ok(Self {
            id: Uuid::new_v4(),
            topic: P::TOPIC,
            notify_id,
            schema_id: P::SCHEMA_ID,
            payload: bytes,
            attempts: 0,
        })
    }

    pub fn decode<P: Payload>(&self) -> Result<P, QueueError> {
        if self.schema_id != P::SCHEMA_ID {
            return Err(QueueError::SchemaMismatch {
                id: self.id,
                expected: P::SCHEMA_ID,
                actual: self.schema_id,
            });
        }
        serde_json::from_slice(&self.payload).map_err(|source| QueueError::Decode {
            id: self.id,
            source,
        })
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message, deliverable after `delay`. Returns false when a
    /// message with the same notify id was already published.
    async fn publish(&self, message: Message, delay: Duration) -> Result<bool, QueueError>;

    /// Next due message of a topic; it stays in flight until acked
    async fn consume(&self, topic: Topic) -> Result<Option<Message>, QueueError>;

    async fn ack(&self, message_id: Uuid) -> Result<(), QueueError>;

    /// Return an in-flight message for redelivery after `delay`
    async fn nack(&self, message_id: Uuid, delay: Duration) -> Result<(), QueueError>;

    /// Messages queued or in flight, delayed ones included
    async fn pending(&self) -> usize;

    /// Earliest time a queued message becomes deliverable
    async fn next_due(&self) -> Option<Instant>;
}

#[derive(Debug)]
struct Entry {
    message: Message,
    not_before: Instant,
}

/// Notify ids an [`InMemoryQueue`] remembers unless configured otherwise
pub const DEFAULT_DEDUP_WINDOW: usize = 100_000;

#[derive(Debug, Default)]
struct QueueState {
    topics: HashMap<Topic, VecDeque<Entry>>,
    in_flight: HashMap<Uuid, Message>,
    seen: HashSet<String>,
    /// Remembered notify ids, oldest first
    seen_order: VecDeque<String>,
}

impl QueueState {
    /// Returns false when the notify id is still remembered
    fn remember(&mut self, notify_id: &str, window: usize) -> bool {
        if !self.seen.insert(notify_id.to_string()) {
            return false;
        }
        self.seen_order.push_back(notify_id.to_string());
        while self.seen_order.len() > window {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// In-process queue (tests, dry runs, single-process deployments)
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    dedup_window: usize,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember at most `window` notify ids; older ones may be published again
    pub fn with_dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window.max(1);
        self
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, message: Message, delay: Duration) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if let Some(notify_id) = &message.notify_id {
            if !state.remember(notify_id, self.dedup_window) {
                return Ok(false);
            }
        }
        state
            .topics
            .entry(message.topic)
            .or_default()
            .push_back(Entry {
                message,
                not_before: Instant::now() + delay,
            });
        Ok(true)
    }

    async fn consume(&self, topic: Topic) -> Result<Option<Message>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let Some(queue) = state.topics.get_mut(&topic) else {
            return Ok(None);
        };
        let Some(index) = queue.iter().position(|e| e.not_before <= now) else {
            return Ok(None);
        };
        let Some(entry) = queue.remove(index) else {
            return Ok(None);
        };

        let mut message = entry.message;
        message.attempts += 1;
        state.in_flight.insert(message.id, message.clone());
        Ok(Some(message))
    }

    async fn ack(&self, message_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&message_id)
            .map(|_| ())
            .ok_or(QueueError::NotInFlight(message_id))
    }

    async fn nack(&self, message_id: Uuid, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let message = state
            .in_flight
            .remove(&message_id)
            .ok_or(QueueError::NotInFlight(message_id))?;
        state
            .topics
            .entry(message.topic)
            .or_default()
            .push_back(Entry {
                message,
                not_before: Instant::now() + delay,
            });
        Ok(())
    }

    async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.topics.values().map(VecDeque::len).sum::<usize>() + state.in_flight.len()
    }

    async fn next_due(&self) -> Option<Instant> {
        let state = self.state.lock().await;
        state
            .topics
            .values()
            .flat_map(|q| q.iter().map(|e| e.not_before))
            .min()
    }
}
