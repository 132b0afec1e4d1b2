//! Offline-message queues on top of a [`Broker`].
//!
//! [`QueueClient`] owns the process-wide broker connection. Connectivity
//! failures send the caller through [`QueueClient::reconnect`], which retries
//! forever with a fixed backoff; only one reconnect runs at a time and
//! everyone else waits for its outcome. Callers therefore block for as long
//! as the broker is down, so nothing here may run on a connection's receive
//! loop.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerChannel, BrokerError};

/// How long to wait between failed connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Duration,
}

impl RetryPolicy {
    pub fn fixed(backoff: Duration) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

struct Link {
    epoch: u64,
    channel: Arc<dyn BrokerChannel>,
}

pub struct QueueClient {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    link: Mutex<Link>,
}

impl QueueClient {
    /// Connects to `broker`, waiting out outages according to `policy`.
    pub async fn connect(broker: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        let channel = open_channel(broker.as_ref(), policy).await;
        Self {
            broker,
            policy,
            link: Mutex::new(Link { epoch: 0, channel }),
        }
    }

    pub async fn declare_queue(&self, username: &str) -> Result<(), BrokerError> {
        self.retry_once(|channel| async move { channel.declare(username).await })
            .await
    }

    pub async fn enqueue(&self, username: &str, body: &str) -> Result<(), BrokerError> {
        self.retry_once(|channel| async move { channel.publish(username, body).await })
            .await?;
        debug!(queue = %username, "message stored for offline delivery");
        Ok(())
    }

    /// Drains `username`'s queue, acknowledging each message only once it is
    /// part of the returned batch.
    ///
    /// A connection lost mid-drain is re-established and draining resumes;
    /// messages that were fetched but not yet acknowledged come back from the
    /// broker and may therefore appear twice.
    ///
    /// Any other broker error ends the drain. Messages already acknowledged
    /// exist only in the batch, so a non-empty batch is still returned and the
    /// error is only logged; the error is returned when nothing was drained.
    pub async fn retrieve_all(&self, username: &str) -> Result<Vec<String>, BrokerError> {
        let mut batch = Vec::new();

        loop {
            let (epoch, channel) = self.current().await;
            let delivery = match channel.get(username).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(err) if err.is_connectivity() => {
                    warn!(queue = %username, error = %err, "broker failed during drain");
                    self.reconnect(epoch).await;
                    continue;
                }
                Err(err) => return cut_short(username, batch, err),
            };

            batch.push(delivery.payload);
            if let Err(err) = channel.ack(delivery.tag).await {
                if !err.is_connectivity() {
                    return cut_short(username, batch, err);
                }
                warn!(queue = %username, error = %err, "broker failed to acknowledge message");
                self.reconnect(epoch).await;
            }
        }

        Ok(batch)
    }

    async fn current(&self) -> (u64, Arc<dyn BrokerChannel>) {
        let link = self.link.lock().await;
        (link.epoch, Arc::clone(&link.channel))
    }

    async fn retry_once<T, F, Fut>(&self, op: F) -> Result<T, BrokerError>
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let (epoch, channel) = self.current().await;
        match op(channel).await {
            Err(err) if err.is_connectivity() => {
                warn!(error = %err, "broker operation failed, reconnecting");
                self.reconnect(epoch).await;
                let (_, channel) = self.current().await;
                op(channel).await
            }
            result => result,
        }
    }

    /// Replaces the channel observed at `failed_epoch`.
    ///
    /// If another task already replaced it, this returns as soon as that
    /// reconnect is done instead of opening a second connection.
    pub async fn reconnect(&self, failed_epoch: u64) {
        let mut link = self.link.lock().await;
        if link.epoch != failed_epoch {
            return;
        }
        link.channel = open_channel(self.broker.as_ref(), self.policy).await;
        link.epoch += 1;
    }
}

fn cut_short(
    username: &str,
    batch: Vec<String>,
    err: BrokerError,
) -> Result<Vec<String>, BrokerError> {
    if batch.is_empty() {
        return Err(err);
    }
    warn!(
        queue = %username,
        error = %err,
        drained = batch.len(),
        "drain stopped early, returning partial batch"
    );
    Ok(batch)
}

async fn open_channel(broker: &dyn Broker, policy: RetryPolicy) -> Arc<dyn BrokerChannel> {
    loop {
        match broker.connect().await {
            Ok(channel) => {
                info!("connected to message broker");
                return channel;
            }
            Err(err) => {
                warn!(
                    error = %err,
                    retry_in = ?policy.backoff(),
                    "failed to connect to message broker"
                );
                tokio::time::sleep(policy.backoff()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::broker::{Delivery, DeliveryTag, MemoryBroker};

    const FAST: Duration = Duration::from_millis(10);

    async fn client(broker: &MemoryBroker) -> QueueClient {
        QueueClient::connect(Arc::new(broker.clone()), RetryPolicy::fixed(FAST)).await
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Get,
        Ack,
    }

    /// Fails the `nth` call of `op`, counted across every connection.
    /// Connectivity errors also sever the underlying broker first, the way a
    /// dropped connection would.
    #[derive(Debug, Clone)]
    struct Fault {
        op: Op,
        nth: usize,
        error: BrokerError,
    }

    struct FlakyBroker {
        broker: MemoryBroker,
        fault: Fault,
        calls: Arc<AtomicUsize>,
    }

    impl FlakyBroker {
        fn new(broker: &MemoryBroker, fault: Fault) -> Self {
            Self {
                broker: broker.clone(),
                fault,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
            let inner = self.broker.connect().await?;
            Ok(Arc::new(FlakyChannel {
                inner,
                broker: self.broker.clone(),
                fault: self.fault.clone(),
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    struct FlakyChannel {
        inner: Arc<dyn BrokerChannel>,
        broker: MemoryBroker,
        fault: Fault,
        calls: Arc<AtomicUsize>,
    }

    impl FlakyChannel {
        async fn trip(&self, op: Op) -> Result<(), BrokerError> {
            if op != self.fault.op {
                return Ok(());
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call != self.fault.nth {
                return Ok(());
            }
            if self.fault.error.is_connectivity() {
                self.broker.sever().await;
            }
            Err(self.fault.error.clone())
        }
    }

    #[async_trait]
    impl BrokerChannel for FlakyChannel {
        async fn declare(&self, queue: &str) -> Result<(), BrokerError> {
            self.inner.declare(queue).await
        }

        async fn publish(&self, queue: &str, payload: &str) -> Result<(), BrokerError> {
            self.inner.publish(queue, payload).await
        }

        async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
            self.trip(Op::Get).await?;
            self.inner.get(queue).await
        }

        async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
            self.trip(Op::Ack).await?;
            self.inner.ack(tag).await
        }
    }

    async fn flaky_client(broker: &MemoryBroker, fault: Fault) -> QueueClient {
        let queue = QueueClient::connect(
            Arc::new(FlakyBroker::new(broker, fault)),
            RetryPolicy::fixed(FAST),
        )
        .await;
        queue.declare_queue("bob").await.expect("declare");
        queue.enqueue("bob", "one").await.expect("enqueue");
        queue.enqueue("bob", "two").await.expect("enqueue");
        queue
    }

    #[tokio::test]
    async fn drain_redelivers_message_whose_ack_was_lost() {
        let broker = MemoryBroker::new();
        let queue = flaky_client(
            &broker,
            Fault {
                op: Op::Ack,
                nth: 1,
                error: BrokerError::ConnectionClosed,
            },
        )
        .await;

        let batch = queue.retrieve_all("bob").await.expect("drain");

        // "one" was fetched, lost its ack with the connection and came back.
        assert_eq!(batch, vec!["one", "one", "two"]);
        assert_eq!(broker.depth("bob").await, 0);
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn drain_resumes_after_fetch_fails() {
        let broker = MemoryBroker::new();
        let queue = flaky_client(
            &broker,
            Fault {
                op: Op::Get,
                nth: 1,
                error: BrokerError::ConnectionClosed,
            },
        )
        .await;

        let batch = queue.retrieve_all("bob").await.expect("drain");

        assert_eq!(batch, vec!["one", "two"]);
        assert_eq!(broker.depth("bob").await, 0);
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn drain_keeps_acknowledged_messages_on_broker_error() {
        let broker = MemoryBroker::new();
        let queue = flaky_client(
            &broker,
            Fault {
                op: Op::Get,
                nth: 2,
                error: BrokerError::UnknownQueue("bob".into()),
            },
        )
        .await;

        let batch = queue.retrieve_all("bob").await.expect("partial drain");

        assert_eq!(batch, vec!["one"]);
        assert_eq!(broker.depth("bob").await, 1);
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn drain_reports_broker_error_when_nothing_was_drained() {
        let broker = MemoryBroker::new();
        let queue = flaky_client(
            &broker,
            Fault {
                op: Op::Get,
                nth: 1,
                error: BrokerError::UnknownQueue("bob".into()),
            },
        )
        .await;

        assert_eq!(
            queue.retrieve_all("bob").await,
            Err(BrokerError::UnknownQueue("bob".into()))
        );
        assert_eq!(broker.depth("bob").await, 2);
    }

    #[tokio::test]
    async fn drain_returns_items_in_order_and_empties_queue() {
        let broker = MemoryBroker::new();
        let queue = client(&broker).await;
        queue.declare_queue("bob").await.expect("declare");
        queue.enqueue("bob", "hey").await.expect("enqueue");
        queue.enqueue("bob", "you there?").await.expect("enqueue");

        let batch = queue.retrieve_all("bob").await.expect("drain");
        assert_eq!(batch, vec!["hey".to_string(), "you there?".to_string()]);
        assert_eq!(broker.depth("bob").await, 0);
        assert!(queue.retrieve_all("bob").await.expect("drain").is_empty());
    }

    #[tokio::test]
    async fn enqueue_reconnects_after_dropped_connection() {
        let broker = MemoryBroker::new();
        let queue = client(&broker).await;
        queue.declare_queue("bob").await.expect("declare");

        broker.sever().await;
        queue.enqueue("bob", "hey").await.expect("enqueue after sever");

        assert_eq!(broker.connect_count(), 2);
        assert_eq!(broker.depth("bob").await, 1);
    }

    #[tokio::test]
    async fn enqueue_waits_out_an_outage() {
        let broker = MemoryBroker::new();
        let queue = Arc::new(client(&broker).await);
        queue.declare_queue("bob").await.expect("declare");
        broker.set_available(false).await;

        let pending = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue("bob", "hey").await })
        };
        tokio::time::sleep(FAST * 5).await;
        assert!(!pending.is_finished());

        broker.set_available(true).await;
        tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("enqueue should finish once the broker is back")
            .expect("task")
            .expect("enqueue");
        assert_eq!(broker.depth("bob").await, 1);
    }

    #[tokio::test]
    async fn concurrent_failures_share_one_reconnect() {
        let broker = MemoryBroker::new();
        let queue = Arc::new(client(&broker).await);
        for name in ["a", "b", "c", "d"] {
            queue.declare_queue(name).await.expect("declare");
        }
        broker.sever().await;

        let tasks: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|name| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.enqueue(name, "hi").await })
            })
            .collect();
        for task in tasks {
            task.await.expect("task").expect("enqueue");
        }

        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn undeclared_queue_is_not_retried() {
        let broker = MemoryBroker::new();
        let queue = client(&broker).await;

        assert_eq!(
            queue.enqueue("nobody", "hi").await,
            Err(BrokerError::UnknownQueue("nobody".into()))
        );
        assert_eq!(broker.connect_count(), 1);
    }
}
