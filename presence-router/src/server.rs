use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use tokio::{
    io::{AsyncBufRead, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    connection::spawn_writer,
    message::{Notification, read_message, write_message},
    offline::{OfflineJob, OfflineWorker},
    queue::{QueueClient, RetryPolicy},
    registry::{RegisterError, SessionHandle, SessionRegistry},
    router::Router,
};

const SERVER_FULL: &str = "Servidor cheio. Tente novamente mais tarde.";
const USERNAME_TAKEN: &str = "Nome de usuário já em uso. Tente outro.";
const USERNAME_EMPTY: &str = "Nome de usuário não pode ser vazio.";
const USERNAME_PADDED: &str = "Nome de usuário não pode começar ou terminar com espaços.";
const SHUTTING_DOWN: &str = "Servidor encerrando.";

const TURN_AWAY_GRACE: Duration = Duration::from_secs(1);
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Connections beyond this many are turned away before registration.
    pub max_clients: usize,
    pub retry: RetryPolicy,
    /// How long a new connection may take to send its username. It holds a
    /// client slot meanwhile.
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10,
            retry: RetryPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    queue: Arc<QueueClient>,
    config: ServerConfig,
}

impl Server {
    pub fn new(listener: TcpListener, queue: Arc<QueueClient>, config: ServerConfig) -> Self {
        Self {
            listener,
            queue,
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            queue,
            config,
        } = self;
        let registry = Arc::new(SessionRegistry::new());
        let (offline, worker) = OfflineWorker::spawn(queue, Arc::clone(&registry));
        let router = Router::new(registry, offline);
        let slots = Arc::new(Semaphore::new(config.max_clients));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut clients = JoinSet::new();
        let context = ClientContext {
            router: router.clone(),
            stop: stop_rx,
            handshake_timeout: config.handshake_timeout,
        };
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&router).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &context, &slots, &mut clients);
                }
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        }

        drop(listener);
        let _ = stop_tx.send(true);
        if timeout(DRAIN_GRACE, async { while clients.join_next().await.is_some() {} })
            .await
            .is_err()
        {
            warn!(remaining = clients.len(), "connections still open, aborting them");
            clients.shutdown().await;
        }

        // The worker stops once the last router clone is gone.
        drop(context);
        drop(router);
        drop(worker);
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// What each connection task needs from the server.
#[derive(Clone)]
struct ClientContext {
    router: Router,
    stop: watch::Receiver<bool>,
    handshake_timeout: Duration,
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopping| *stopping).await;
}

async fn handle_shutdown(router: &Router) {
    let sessions = router.registry().live_sessions().await;
    info!(sessions = sessions.len(), "server shutting down");
    for session in sessions {
        let _ = session
            .connection()
            .send(Notification::text(SHUTTING_DOWN));
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    context: &ClientContext,
    slots: &Arc<Semaphore>,
    clients: &mut JoinSet<()>,
) {
    let (stream, peer) = match result {
        Ok(accepted) => accepted,
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            return;
        }
    };

    match Arc::clone(slots).try_acquire_owned() {
        Ok(permit) => spawn_client_handler(stream, peer, context, permit, clients),
        Err(_) => {
            warn!(peer = %peer, "client limit reached, turning connection away");
            tokio::spawn(turn_away(stream));
        }
    }
}

async fn turn_away(mut stream: TcpStream) {
    if write_message(&mut stream, &Notification::text(SERVER_FULL))
        .await
        .is_err()
        || stream.shutdown().await.is_err()
    {
        return;
    }
    // Closing with unread input would reset the connection and could discard
    // the notice before the client reads it, so wait for the client to go.
    let mut sink = tokio::io::sink();
    let _ = tokio::time::timeout(TURN_AWAY_GRACE, tokio::io::copy(&mut stream, &mut sink)).await;
}

fn spawn_client_handler(
    stream: TcpStream,
    peer: SocketAddr,
    context: &ClientContext,
    permit: OwnedSemaphorePermit,
    clients: &mut JoinSet<()>,
) {
    let context = context.clone();
    clients.spawn(async move {
        if let Err(err) = handle_connection(stream, context).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
        drop(permit);
    });
}

async fn handle_connection(stream: TcpStream, mut context: ClientContext) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let handshake = timeout(context.handshake_timeout, read_username(&mut reader));
    let username = select! {
        result = handshake => match result {
            Ok(result) => result?,
            Err(_) => bail!("no username within {:?}", context.handshake_timeout),
        },
        _ = stopped(&mut context.stop) => return Ok(()),
    };
    let username = match validate_username(username) {
        Ok(username) => username,
        Err(rejection) => {
            write_message(&mut writer, &Notification::text(rejection)).await?;
            bail!("invalid username: {rejection}");
        }
    };

    let router = &context.router;
    let (connection, writer_task) = spawn_writer(writer, peer);
    let session = match router.registry().register(&username, connection.clone()).await {
        Ok(session) => session,
        Err(RegisterError::UsernameTaken(_)) => {
            let _ = connection.send(Notification::text(USERNAME_TAKEN));
            // Let the writer flush the rejection, then the socket closes.
            drop(connection);
            let _ = writer_task.await;
            bail!("username '{username}' already taken");
        }
    };
    drop(connection);

    info!(?peer, %username, "client registered");
    router.offline().submit(OfflineJob::Declare {
        username: username.clone(),
    });
    let contacts = router.registry().contacts_of(&session).await;
    let _ = session.connection().send(Notification::UserList(contacts));

    select! {
        result = router.run(&session, &mut reader) => result,
        _ = stopped(&mut context.stop) => {
            close_for_shutdown(router, &session).await;
            Ok(())
        }
    }
}

/// Removes the session so nothing routes to it any more. Once the caller drops
/// its handle the writer flushes what is queued and the socket closes.
async fn close_for_shutdown(router: &Router, session: &SessionHandle) {
    if router.registry().unregister(session).await {
        debug!(username = %session.username(), "session closed for shutdown");
    }
}

/// Reads the registration frame: a single JSON string holding the username.
async fn read_username<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    match read_message::<_, String>(reader).await? {
        Some(username) => Ok(username),
        None => bail!("connection closed before registration"),
    }
}

/// Usernames are taken exactly as sent: blank names and names with leading
/// or trailing whitespace are refused rather than altered.
fn validate_username(username: String) -> Result<String, &'static str> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(USERNAME_EMPTY);
    }
    if trimmed.len() != username.len() {
        return Err(USERNAME_PADDED);
    }
    Ok(username)
}
