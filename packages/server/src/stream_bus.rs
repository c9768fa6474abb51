//! In-process per-job pub/sub: a bounded ring buffer fanning a bisect run's
//! output to any number of HTTP subscribers, with replay from an arbitrary
//! cursor and idle keepalives.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

const DEFAULT_CAPACITY: usize = 1000;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamMessageType {
    Log,
    Status,
    Progress,
    Result,
    Keepalive,
}

impl StreamMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMessageType::Log => "log",
            StreamMessageType::Status => "status",
            StreamMessageType::Progress => "progress",
            StreamMessageType::Result => "result",
            StreamMessageType::Keepalive => "keepalive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: StreamMessageType,
    pub content: String,
    pub timestamp: f64,
}

impl StreamMessage {
    pub fn new(kind: StreamMessageType, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }

    pub fn log(line: impl Into<String>) -> Self {
        Self::new(StreamMessageType::Log, line)
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self::new(StreamMessageType::Status, status)
    }

    fn keepalive() -> Self {
        Self::new(StreamMessageType::Keepalive, "")
    }
}

struct JobChannel {
    buffer: VecDeque<StreamMessage>,
    tx: broadcast::Sender<StreamMessage>,
    complete: bool,
}

impl JobChannel {
    fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(16));
        Self {
            buffer: VecDeque::with_capacity(capacity),
            tx,
            complete: false,
        }
    }
}

/// Shared, cloneable handle to the process-wide stream state. Owned by the
/// [`crate::Instance`], not a global.
#[derive(Clone)]
pub struct StreamBus {
    channels: Arc<RwLock<HashMap<i64, JobChannel>>>,
    capacity: usize,
    idle_timeout: Duration,
}

impl StreamBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Append a message to a job's buffer, dropping the oldest entry once
    /// the buffer is full, and wake any live subscribers.
    pub async fn publish(&self, job_id: i64, msg: StreamMessage) {
        let mut channels = self.channels.write().await;
        let channel = channels
            .entry(job_id)
            .or_insert_with(|| JobChannel::new(self.capacity));

        if channel.buffer.len() >= self.capacity {
            channel.buffer.pop_front();
        }
        channel.buffer.push_back(msg.clone());
        let _ = channel.tx.send(msg);
    }

    /// Flag a job's stream as finished. Subscribers still drain any buffered
    /// messages before their sequence ends.
    pub async fn mark_complete(&self, job_id: i64) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(&job_id) {
            channel.complete = true;
        }
    }

    /// Drop all state for a job. Called a grace period after completion.
    pub async fn cleanup(&self, job_id: i64) {
        self.channels.write().await.remove(&job_id);
    }

    /// Subscribe to a job's stream starting at `from_index` in its buffer.
    pub async fn subscribe(&self, job_id: i64, from_index: usize) -> Subscription {
        let mut channels = self.channels.write().await;
        let channel = channels
            .entry(job_id)
            .or_insert_with(|| JobChannel::new(self.capacity));

        let buffered: VecDeque<StreamMessage> =
            channel.buffer.iter().skip(from_index).cloned().collect();

        Subscription {
            buffered,
            rx: channel.tx.subscribe(),
            channels: self.channels.clone(),
            job_id,
            idle_timeout: self.idle_timeout,
        }
    }
}

impl Default for StreamBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A single subscriber's cursor into a job's stream.
pub struct Subscription {
    buffered: VecDeque<StreamMessage>,
    rx: broadcast::Receiver<StreamMessage>,
    channels: Arc<RwLock<HashMap<i64, JobChannel>>>,
    job_id: i64,
    idle_timeout: Duration,
}

impl Subscription {
    /// Yield the next message, a synthetic keepalive on idle, or `None` once
    /// the job is complete and the buffer has drained.
    pub async fn next(&mut self) -> Option<StreamMessage> {
        if let Some(msg) = self.buffered.pop_front() {
            return Some(msg);
        }

        loop {
            match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
                Ok(Ok(msg)) => return Some(msg),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_elapsed) => {
                    if self.is_complete().await {
                        return None;
                    }
                    return Some(StreamMessage::keepalive());
                }
            }
        }
    }

    async fn is_complete(&self) -> bool {
        self.channels
            .read()
            .await
            .get(&self.job_id)
            .map(|c| c.complete)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_replays_buffer() {
        let bus = StreamBus::new();
        bus.publish(1, StreamMessage::log("hello")).await;
        bus.publish(1, StreamMessage::log("world")).await;

        let mut sub = bus.subscribe(1, 0).await;
        assert_eq!(sub.buffered.pop_front().unwrap().content, "hello");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_noop() {
        let bus = StreamBus::new();
        bus.publish(99, StreamMessage::log("nobody listening")).await;
    }

    #[tokio::test]
    async fn cleanup_removes_job_state() {
        let bus = StreamBus::new();
        bus.publish(1, StreamMessage::log("x")).await;
        bus.cleanup(1).await;
        assert!(bus.channels.read().await.get(&1).is_none());
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest_when_full() {
        let bus = StreamBus::with_capacity(2);
        bus.publish(1, StreamMessage::log("a")).await;
        bus.publish(1, StreamMessage::log("b")).await;
        bus.publish(1, StreamMessage::log("c")).await;

        let sub = bus.subscribe(1, 0).await;
        let contents: Vec<_> = sub.buffered.iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_see_new_messages() {
        let bus = StreamBus::new();
        let mut sub1 = bus.subscribe(1, 0).await;
        let mut sub2 = bus.subscribe(1, 0).await;

        bus.publish(1, StreamMessage::log("broadcast")).await;

        assert_eq!(sub1.next().await.unwrap().content, "broadcast");
        assert_eq!(sub2.next().await.unwrap().content, "broadcast");
    }

    #[tokio::test]
    async fn subscription_ends_after_complete_and_drained() {
        let bus = StreamBus::new();
        bus.publish(1, StreamMessage::log("only message")).await;
        bus.mark_complete(1).await;

        let mut sub = bus.subscribe(1, 0).await;
        assert_eq!(sub.next().await.unwrap().content, "only message");
        // No more buffered messages and job is complete: the live branch
        // below relies on the idle timeout so we only assert drain order here.
    }
}
