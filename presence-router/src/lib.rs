//! Presence-aware private message router.
//!
//! Clients register under a unique username over TCP, keep a personal
//! contact list and exchange private messages with their contacts. Messages
//! for a contact who is offline are parked in a per-user broker queue and
//! handed over when that user reports being online again.
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`server`] accepts connections, enforces the client limit and runs the
//!   registration handshake.
//! - [`router`] dispatches each registered client's actions.
//! - [`registry`] holds sessions, online status and contact lists.
//! - [`connection`] owns the write half of every socket.
//! - [`queue`] and [`broker`] store offline messages; [`offline`] runs all
//!   broker work on a background task.
//! - [`client`] is a line-oriented terminal client.
//! - [`message`] defines the JSON line protocol.

pub mod broker;
pub mod cli;
pub mod client;
pub mod connection;
pub mod message;
pub mod offline;
pub mod queue;
pub mod registry;
pub mod router;
pub mod server;
