use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Requests a registered client may send, keyed by the `action` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    AddContact { contact: String },
    RemoveContact { contact: String },
    StatusUpdate { status: bool },
    StartPrivateChat { target_user: String },
    SendPrivateMessage { target_user: String, message: String },
}

/// Everything the server pushes to a client.
///
/// On the wire a plain text is a JSON string, an offline batch is a JSON
/// array of strings and a contact list is
/// `{"action": "update_user_list", "user_list": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(into = "WireNotification", from = "WireNotification")]
pub enum Notification {
    Text(String),
    UserList(Vec<String>),
    OfflineBatch(Vec<String>),
}

impl Notification {
    pub fn text(text: impl Into<String>) -> Self {
        Notification::Text(text.into())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireNotification {
    Text(String),
    Batch(Vec<String>),
    Action(ListAction),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ListAction {
    UpdateUserList { user_list: Vec<String> },
}

impl From<Notification> for WireNotification {
    fn from(notification: Notification) -> Self {
        match notification {
            Notification::Text(text) => WireNotification::Text(text),
            Notification::UserList(user_list) => {
                WireNotification::Action(ListAction::UpdateUserList { user_list })
            }
            Notification::OfflineBatch(messages) => WireNotification::Batch(messages),
        }
    }
}

impl From<WireNotification> for Notification {
    fn from(wire: WireNotification) -> Self {
        match wire {
            WireNotification::Text(text) => Notification::Text(text),
            WireNotification::Batch(messages) => Notification::OfflineBatch(messages),
            WireNotification::Action(ListAction::UpdateUserList { user_list }) => {
                Notification::UserList(user_list)
            }
        }
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // One JSON document per line; blank lines are skipped.
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
