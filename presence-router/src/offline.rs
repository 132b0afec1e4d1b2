//! Background worker for everything that touches the broker.
//!
//! Connection tasks never call the [`QueueClient`] themselves: they post an
//! [`OfflineJob`] and move on to the next frame. The worker runs jobs one at
//! a time, so a broker outage stalls only the worker, and messages queued by
//! one sender reach the broker in the order they were sent.

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    connection::Connection,
    message::Notification,
    queue::QueueClient,
    registry::SessionRegistry,
};

#[derive(Debug)]
pub enum OfflineJob {
    /// Make sure `username` has a queue before anything is stored for it.
    Declare { username: String },
    /// Store `body` for `target` and confirm to the sender once stored.
    Enqueue {
        target: String,
        body: String,
        confirm_to: Connection,
    },
    /// Drain `username`'s queue and push the batch to whichever connection
    /// holds that name once the drain is done.
    Drain { username: String },
}

/// Sending side of the worker's job channel.
#[derive(Debug, Clone)]
pub struct OfflineHandle {
    jobs: mpsc::UnboundedSender<OfflineJob>,
}

impl OfflineHandle {
    pub fn submit(&self, job: OfflineJob) {
        if let Err(err) = self.jobs.send(job) {
            warn!(job = ?err.0, "offline worker is gone, dropping job");
        }
    }
}

pub struct OfflineWorker {
    queue: Arc<QueueClient>,
    registry: Arc<SessionRegistry>,
    jobs: mpsc::UnboundedReceiver<OfflineJob>,
}

impl OfflineWorker {
    /// Starts the worker. It runs until every [`OfflineHandle`] is dropped.
    pub fn spawn(
        queue: Arc<QueueClient>,
        registry: Arc<SessionRegistry>,
    ) -> (OfflineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = OfflineWorker {
            queue,
            registry,
            jobs: rx,
        };
        (OfflineHandle { jobs: tx }, tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            match job {
                OfflineJob::Declare { username } => self.declare(&username).await,
                OfflineJob::Enqueue {
                    target,
                    body,
                    confirm_to,
                } => self.enqueue(&target, &body, &confirm_to).await,
                OfflineJob::Drain { username } => self.drain(&username).await,
            }
        }
        debug!("offline worker stopped");
    }

    async fn declare(&self, username: &str) {
        if let Err(err) = self.queue.declare_queue(username).await {
            warn!(%username, error = %err, "failed to declare offline queue");
        }
    }

    async fn enqueue(&self, target: &str, body: &str, confirm_to: &Connection) {
        match self.queue.enqueue(target, body).await {
            Ok(()) => {
                if confirm_to
                    .send(Notification::Text(format!("Você (privado): {body}")))
                    .is_err()
                {
                    debug!(%target, "sender left before the queue confirmation");
                }
            }
            Err(err) => warn!(%target, error = %err, "failed to store offline message"),
        }
    }

    async fn drain(&self, username: &str) {
        let batch = match self.queue.retrieve_all(username).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(%username, error = %err, "failed to fetch offline messages");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }

        // Resolve the recipient now: the session that asked for the drain may
        // have been replaced by a reconnect in the meantime.
        let delivered = match self.registry.lookup_by_username(username).await {
            Some(session) => session
                .connection()
                .send(Notification::OfflineBatch(batch.clone()))
                .is_ok(),
            None => false,
        };

        if delivered {
            info!(%username, count = batch.len(), "delivered offline messages");
            return;
        }

        warn!(%username, count = batch.len(), "recipient gone, requeueing offline messages");
        for body in &batch {
            if let Err(err) = self.queue.enqueue(username, body).await {
                warn!(%username, error = %err, "failed to requeue offline message");
            }
        }
    }
}
