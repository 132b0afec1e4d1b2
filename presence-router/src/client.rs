use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{Action, Notification, read_message, write_message},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let addr = SocketAddr::new(args.host, args.port);
    let (mut reader, mut writer) = establish_connection(addr).await?;
    register(&mut reader, &mut writer, &args.username).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut chat = ChatState::default();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input, &mut chat).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(addr: SocketAddr) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;

    info!("connected to {addr}");

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// Sends the username and waits for the server to accept it.
async fn register(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    username: &str,
) -> Result<()> {
    write_message(writer, &username).await?;

    match read_message::<_, Notification>(reader).await? {
        Some(Notification::UserList(contacts)) => {
            write_stdout(&format!("*** connected as {username}")).await?;
            render_contacts(&contacts).await?;
            Ok(())
        }
        Some(Notification::Text(reason)) => {
            write_stderr(&format!("!!! {reason}")).await?;
            bail!("registration rejected: {reason}");
        }
        Some(other) => bail!("unexpected registration response: {other:?}"),
        None => bail!("server closed the connection during registration"),
    }
}

/// The peer plain lines are sent to, picked with `/chat`.
#[derive(Debug, Default)]
struct ChatState {
    peer: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send(Action),
    Quit,
    Usage(&'static str),
    Ignore,
}

fn parse_input(line: &str, chat: &mut ChatState) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Ignore;
    }

    let (command, argument) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match (command, argument) {
        ("/quit", _) => Input::Quit,
        ("/online", _) => Input::Send(Action::StatusUpdate { status: true }),
        ("/offline", _) => Input::Send(Action::StatusUpdate { status: false }),
        ("/add" | "/remove" | "/chat", "") => Input::Usage("usage: /add|/remove|/chat <username>"),
        ("/add", name) => Input::Send(Action::AddContact {
            contact: name.to_string(),
        }),
        ("/remove", name) => Input::Send(Action::RemoveContact {
            contact: name.to_string(),
        }),
        ("/chat", name) => {
            chat.peer = Some(name.to_string());
            Input::Send(Action::StartPrivateChat {
                target_user: name.to_string(),
            })
        }
        _ if line.starts_with('/') => Input::Usage(
            "commands: /add <user>, /remove <user>, /chat <user>, /online, /offline, /quit",
        ),
        _ => match &chat.peer {
            Some(peer) => Input::Send(Action::SendPrivateMessage {
                target_user: peer.clone(),
                message: line.to_string(),
            }),
            None => Input::Usage("pick someone to talk to first: /chat <user>"),
        },
    }
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    chat: &mut ChatState,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = read_message::<_, Notification>(reader) => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer, chat).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(message: io::Result<Option<Notification>>) -> Result<bool> {
    match message? {
        Some(message) => {
            render_notification(message).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
    chat: &mut ChatState,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    match parse_input(input, chat) {
        Input::Send(action) => write_message(writer, &action).await?,
        Input::Quit => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Input::Usage(hint) => write_stderr(hint).await?,
        Input::Ignore => {}
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn render_notification(notification: Notification) -> io::Result<()> {
    match notification {
        Notification::Text(text) => write_stdout(&text).await,
        Notification::UserList(contacts) => render_contacts(&contacts).await,
        Notification::OfflineBatch(messages) => {
            write_stdout(&format!("*** {} offline message(s)", messages.len())).await?;
            for message in messages {
                write_stdout(&format!("*** offline: {message}")).await?;
            }
            Ok(())
        }
    }
}

async fn render_contacts(contacts: &[String]) -> io::Result<()> {
    if contacts.is_empty() {
        return write_stdout("*** contacts: (none)").await;
    }
    write_stdout(&format!("*** contacts: {}", contacts.join(", "))).await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
