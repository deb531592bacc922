use std::{fmt, io, net::SocketAddr};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

pub type ConnectionId = u64;

/// Write half of a transport, erased so sessions can run over TCP or in-memory pipes.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live transport endpoint plus the identity it negotiated.
///
/// All writes go through [`Connection::send`], which holds a per-connection
/// lock for the duration of the write. A broadcast and a private message
/// aimed at the same peer therefore never interleave their bytes.
pub struct Connection {
    id: ConnectionId,
    identity: String,
    peer: Option<SocketAddr>,
    writer: Mutex<BoxedWriter>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        identity: impl Into<String>,
        peer: Option<SocketAddr>,
        writer: BoxedWriter,
    ) -> Self {
        Self {
            id,
            identity: identity.into(),
            peer,
            writer: Mutex::new(writer),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Writes one payload and flushes it.
    pub async fn send(&self, text: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(text.as_bytes()).await?;
        writer.flush().await
    }

    /// Shuts the write half down. Later sends fail.
    pub async fn close(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
