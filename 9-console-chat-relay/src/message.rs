use std::{fmt, io};

use chrono::{DateTime, Local};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload a single read hands back.
pub const READ_BUFFER_SIZE: usize = 1024;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Reads one payload: whatever the transport delivers in a single read.
///
/// `Ok(None)` means the peer closed the stream. Payloads are not framed, so
/// two sends from the peer may arrive merged or one send split in two.
pub async fn read_payload<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let read = reader.read(&mut buf).await?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buf[..read]).into_owned()))
}

/// A chat payload sorted by its leading marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    Broadcast(&'a str),
    Unicast { recipient: &'a str, body: &'a str },
    MalformedUnicast,
}

impl<'a> Inbound<'a> {
    /// Classifies a payload. Returns `None` only for an empty payload.
    ///
    /// Broadcast bodies are carried verbatim. Private messages have trailing
    /// line endings stripped so the recipient name resolves.
    pub fn classify(payload: &'a str) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }

        let Some(addressed) = payload.strip_prefix('@') else {
            return Some(Inbound::Broadcast(payload));
        };
        let addressed = addressed.trim_end_matches(LINE_ENDINGS);

        Some(match addressed.split_once(' ') {
            Some((recipient, body)) => Inbound::Unicast { recipient, body },
            None => Inbound::MalformedUnicast,
        })
    }
}

/// Every text the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Joined { identity: String },
    Left { identity: String },
    Connected,
    Relay { sender: String, body: String },
    Private { sent_at: String, sender: String, body: String },
    Delivered { recipient: String },
    DeliveryFailed { recipient: String },
    RecipientNotFound { recipient: String },
    InvalidFormat,
    ShuttingDown,
}

impl Notice {
    pub fn private(sender: &str, body: &str) -> Self {
        Self::private_at(Local::now(), sender, body)
    }

    pub fn private_at(sent_at: DateTime<Local>, sender: &str, body: &str) -> Self {
        Notice::Private {
            sent_at: sent_at.format("%H:%M:%S").to_string(),
            sender: sender.to_string(),
            body: body.to_string(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Joined { identity } => write!(f, "{identity} has joined the chat!"),
            Notice::Left { identity } => write!(f, "{identity} has left the chat."),
            Notice::Connected => f.write_str("Connected to the chat server!"),
            Notice::Relay { sender, body } => write!(f, "{sender}: {body}"),
            Notice::Private {
                sent_at,
                sender,
                body,
            } => write!(f, "[{sent_at}] PM from {sender}: {body}"),
            Notice::Delivered { recipient } => write!(f, "Message delivered to {recipient}"),
            Notice::DeliveryFailed { recipient } => {
                write!(f, "Failed to deliver message to {recipient}")
            }
            Notice::RecipientNotFound { recipient } => write!(f, "Recipient {recipient} not found"),
            Notice::InvalidFormat => f.write_str("Invalid private message format"),
            Notice::ShuttingDown => f.write_str("Server is shutting down."),
        }
    }
}
