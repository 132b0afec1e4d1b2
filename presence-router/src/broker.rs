//! Contract of the message broker that stores offline messages, plus an
//! in-process implementation of it.
//!
//! The contract mirrors what a queueing broker offers on a channel: declare
//! a named durable queue, publish to it, fetch one message at a time and
//! acknowledge it explicitly. Fetched messages that are never acknowledged
//! go back to the head of their queue when the connection that fetched them
//! is lost, which gives at-least-once delivery.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

pub type DeliveryTag = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker connection closed")]
    ConnectionClosed,
    #[error("queue '{0}' has not been declared")]
    UnknownQueue(String),
}

impl BrokerError {
    /// Whether a fresh connection might make the operation succeed.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BrokerError::Unavailable(_) | BrokerError::ConnectionClosed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: String,
}

/// Opens connections to the broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// Operations available on one open broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a durable queue; declaring an existing queue is a no-op.
    async fn declare(&self, queue: &str) -> Result<(), BrokerError>;

    /// Appends a persistent message to `queue`.
    async fn publish(&self, queue: &str, payload: &str) -> Result<(), BrokerError>;

    /// Takes the head of `queue` without acknowledging it.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    queues: HashMap<String, VecDeque<String>>,
    unacked: HashMap<DeliveryTag, (String, String)>,
    next_tag: DeliveryTag,
}

impl MemoryState {
    fn requeue_unacked(&mut self) {
        let mut pending: Vec<_> = self.unacked.drain().collect();
        // Highest tag first so the oldest fetch ends up at the head again.
        pending.sort_by(|(a, _), (b, _)| b.cmp(a));
        for (_, (queue, payload)) in pending {
            self.queues.entry(queue).or_default().push_front(payload);
        }
    }
}

#[derive(Debug)]
struct MemoryInner {
    state: Mutex<MemoryState>,
    generation: AtomicU64,
    available: AtomicBool,
    connects: AtomicUsize,
}

/// Broker kept in process memory.
///
/// Queues live as long as the process. [`MemoryBroker::sever`] and
/// [`MemoryBroker::set_available`] simulate a dropped connection and an
/// outage respectively.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                generation: AtomicU64::new(0),
                available: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Invalidates every open channel and returns unacknowledged messages to
    /// their queues.
    pub async fn sever(&self) {
        let mut state = self.inner.state.lock().await;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        state.requeue_unacked();
    }

    /// While unavailable, new connections are refused and open channels fail.
    pub async fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            self.sever().await;
        }
    }

    /// Number of successful connections handed out so far.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Ready messages in `queue`, not counting unacknowledged ones.
    pub async fn depth(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map_or(0, VecDeque::len)
    }

    pub async fn is_declared(&self, queue: &str) -> bool {
        self.inner.state.lock().await.queues.contains_key(queue)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("connection refused".to_string()));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryChannel {
            inner: Arc::clone(&self.inner),
            generation: self.inner.generation.load(Ordering::SeqCst),
        }))
    }
}

struct MemoryChannel {
    inner: Arc<MemoryInner>,
    generation: u64,
}

impl MemoryChannel {
    async fn open_state(&self) -> Result<tokio::sync::MutexGuard<'_, MemoryState>, BrokerError> {
        let state = self.inner.state.lock().await;
        if !self.inner.available.load(Ordering::SeqCst)
            || self.inner.generation.load(Ordering::SeqCst) != self.generation
        {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.open_state().await?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &str) -> Result<(), BrokerError> {
        let mut state = self.open_state().await?;
        let messages = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        messages.push_back(payload.to_string());
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.open_state().await?;
        let payload = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?
            .pop_front();

        Ok(payload.map(|payload| {
            state.next_tag += 1;
            let tag = state.next_tag;
            state.unacked.insert(tag, (queue.to_string(), payload.clone()));
            Delivery { tag, payload }
        }))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.open_state().await?;
        state.unacked.remove(&tag);
        Ok(())
    }
}
