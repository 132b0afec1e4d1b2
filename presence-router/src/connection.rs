//! Outbound half of an accepted client connection.
//!
//! Every connection gets a writer task that owns the socket's write half and
//! drains an unbounded channel. Anything that wants to talk to the client
//! holds a cheap [`Connection`] clone and never touches the socket itself,
//! so sends never block and never happen under the registry lock.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::{io::AsyncWrite, sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::message::{Notification, write_message};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("connection is closed")]
pub struct ConnectionClosed;

#[derive(Debug, Clone)]
pub struct Connection {
    outbound: mpsc::UnboundedSender<Notification>,
}

impl Connection {
    pub fn new(outbound: mpsc::UnboundedSender<Notification>) -> Self {
        Self { outbound }
    }

    /// Connection backed by a bare channel, for driving the router without a socket.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Hands the notification to the writer task.
    ///
    /// Fails once the writer has stopped, which happens when the socket
    /// errors or the client went away.
    pub fn send(&self, notification: Notification) -> Result<(), ConnectionClosed> {
        self.outbound
            .send(notification)
            .map_err(|_| ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Creates the outbound channel for `writer` and spawns the task draining it.
///
/// The task ends when every [`Connection`] clone is dropped or a write fails;
/// the write half is dropped with it, closing the client's read side.
pub fn spawn_writer<W>(writer: W, peer: Option<SocketAddr>) -> (Connection, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(drain_outbound(writer, rx, peer));
    (Connection::new(tx), task)
}

async fn drain_outbound<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Notification>,
    peer: Option<SocketAddr>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(notification) = outbound.recv().await {
        if let Err(err) = write_message(&mut writer, &notification).await {
            debug!(?peer, ?err, "failed to deliver notification to client");
            break;
        }
    }
}
