//! Multi-client text relay over TCP.
//!
//! Clients register a display name, broadcast plain text to everyone else,
//! and address a single participant with `@name message`, receiving a
//! delivery confirmation. Each module owns one responsibility:
//!
//! - [`cli`] parses the server and client subcommands.
//! - [`connection`] wraps a transport's write half with its identity and
//!   serializes writes to it.
//! - [`registry`] maps identities to live connections and hands out
//!   snapshots for fan-out.
//! - [`message`] classifies inbound payloads and renders outbound notices.
//! - [`router`] performs broadcast and private delivery.
//! - [`session`] drives one connection from identity negotiation to cleanup.
//! - [`server`] accepts connections and supervises sessions.
//! - [`client`] runs the terminal client's inbound and outbound flows.
//! - [`telemetry`] wires `tracing` to the console and the event log file.
//!
//! Payloads are not framed: one read is one payload, so adjacent sends may
//! arrive merged at a receiver.

pub mod cli;
pub mod client;
pub mod connection;
pub mod error;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod telemetry;
