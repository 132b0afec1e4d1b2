//! Per-connection protocol handling once a client has registered.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncBufRead;
use tracing::{debug, info, warn};

use crate::{
    message::{Action, Notification, read_message},
    offline::{OfflineHandle, OfflineJob},
    registry::{ContactError, Route, RouteError, SessionHandle, SessionRegistry},
};

#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<SessionRegistry>,
    offline: OfflineHandle,
}

impl Router {
    pub fn new(registry: Arc<SessionRegistry>, offline: OfflineHandle) -> Self {
        Self { registry, offline }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn offline(&self) -> &OfflineHandle {
        &self.offline
    }

    /// Reads actions from `reader` and dispatches them in order until the
    /// client hangs up. The session is unregistered however the loop ends;
    /// transport and decoding errors are returned after that.
    pub async fn run<R>(&self, session: &SessionHandle, reader: &mut R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let outcome = self.dispatch_all(session, reader).await;
        if self.registry.unregister(session).await {
            info!(username = %session.username(), "client disconnected");
        }
        outcome
    }

    async fn dispatch_all<R>(&self, session: &SessionHandle, reader: &mut R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        while let Some(action) = read_message::<_, Action>(reader).await? {
            debug!(username = %session.username(), ?action, "action received");
            self.dispatch(session, action).await;
        }
        Ok(())
    }

    pub async fn dispatch(&self, session: &SessionHandle, action: Action) {
        match action {
            Action::AddContact { contact } => self.add_contact(session, &contact).await,
            Action::RemoveContact { contact } => self.remove_contact(session, &contact).await,
            Action::StatusUpdate { status } => self.status_update(session, status).await,
            Action::StartPrivateChat { target_user } => {
                reply(
                    session,
                    format!("Conversa privada com {target_user} iniciada."),
                );
            }
            Action::SendPrivateMessage {
                target_user,
                message,
            } => self.send_private_message(session, target_user, message).await,
        }
    }

    async fn add_contact(&self, session: &SessionHandle, contact: &str) {
        match self.registry.add_contact(session, contact).await {
            Ok(contacts) => {
                info!(username = %session.username(), %contact, "contact added");
                send(session, Notification::UserList(contacts));
                reply(session, format!("Contato {contact} adicionado."));
            }
            Err(err) => reject_contact_change(session, contact, err),
        }
    }

    async fn remove_contact(&self, session: &SessionHandle, contact: &str) {
        match self.registry.remove_contact(session, contact).await {
            Ok(contacts) => {
                info!(username = %session.username(), %contact, "contact removed");
                send(session, Notification::UserList(contacts));
                reply(session, format!("Contato {contact} removido."));
            }
            Err(err) => reject_contact_change(session, contact, err),
        }
    }

    async fn status_update(&self, session: &SessionHandle, online: bool) {
        if !self.registry.set_status(session, online).await {
            return;
        }
        let status = if online { "online" } else { "offline" };
        info!(username = %session.username(), status, "status changed");
        if online {
            self.offline.submit(OfflineJob::Drain {
                username: session.username().to_string(),
            });
        }
    }

    async fn send_private_message(&self, session: &SessionHandle, target: String, body: String) {
        let sender = session.username();
        let route = match self.registry.route(session, &target).await {
            Ok(route) => route,
            Err(RouteError::NotAContact(_)) => {
                warn!(%sender, %target, "message to a user outside the contact list");
                reply(
                    session,
                    format!(
                        "Erro: Você não pode enviar mensagens para {target}, pois ele não está na sua lista de contatos."
                    ),
                );
                return;
            }
            Err(RouteError::SessionClosed) => return,
        };

        match route {
            Route::Direct(recipient) => {
                let delivered = recipient
                    .connection()
                    .send(Notification::Text(format!("{sender} (privado): {body}")));
                match delivered {
                    Ok(()) => reply(session, format!("Você para ({target}): {body}")),
                    // The recipient disconnected after the lookup. The message
                    // is not queued and the sender is not told.
                    Err(err) => warn!(%sender, %target, error = %err, "direct delivery failed"),
                }
            }
            Route::Queue => self.offline.submit(OfflineJob::Enqueue {
                target,
                body,
                confirm_to: session.connection().clone(),
            }),
        }
    }
}

fn reject_contact_change(session: &SessionHandle, contact: &str, err: ContactError) {
    let text = match &err {
        ContactError::SelfReference => "Você não pode adicionar a si mesmo como contato.".to_string(),
        ContactError::AlreadyPresent(_) => format!("Contato {contact} já está na lista."),
        ContactError::UnknownUser(_) => format!("Contato {contact} não existe."),
        ContactError::NotPresent(_) => format!("Contato {contact} não está na lista."),
        ContactError::SessionClosed => return,
    };
    debug!(username = %session.username(), %contact, reason = %err, "contact change rejected");
    reply(session, text);
}

fn reply(session: &SessionHandle, text: String) {
    send(session, Notification::Text(text));
}

fn send(session: &SessionHandle, notification: Notification) {
    if session.connection().send(notification).is_err() {
        debug!(username = %session.username(), "reply dropped, connection closed");
    }
}
