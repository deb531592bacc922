//! Server-side lifecycle of a single connection.
//!
//! A session walks `Negotiating → Active → Closing → Closed`. The first payload
//! names the client; after that every payload is handed to the [`Router`].
//! Whatever ends the exchange (peer EOF, a read error, server shutdown) the
//! session leaves through the same cleanup path: deregister, announce the
//! departure, close the transport.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{BoxedWriter, Connection, ConnectionId},
    error::SessionError,
    message::{Notice, read_payload},
    registry::Registry,
    router::Router,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ReadError,
    Shutdown,
    NegotiationFailed,
}

/// What a finished session did, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub identity: Option<String>,
    pub messages_routed: usize,
    pub close_reason: CloseReason,
}

pub struct Session<R> {
    router: Router,
    reader: R,
    writer: Option<BoxedWriter>,
    peer: Option<SocketAddr>,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new<W>(
        router: Router,
        reader: R,
        writer: W,
        peer: Option<SocketAddr>,
        shutdown: watch::Receiver<bool>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            router,
            reader,
            writer: Some(Box::new(writer)),
            peer,
            shutdown,
            state: SessionState::Negotiating,
        }
    }

    pub async fn run(mut self) -> SessionSummary {
        let identity = match self.negotiate().await {
            Ok(identity) => identity,
            Err(err) => return self.abandon(err).await,
        };

        let Some(writer) = self.writer.take() else {
            return self.abandon(SessionError::ClosedBeforeIdentity).await;
        };
        let registry = Arc::clone(self.router.registry());
        let connection = Arc::new(Connection::new(
            registry.next_connection_id(),
            identity.as_str(),
            self.peer,
            writer,
        ));
        let registration = Registration::new(registry, &connection);
        self.transition(SessionState::Active);
        info!(peer = ?self.peer, %identity, "client connected");

        self.router
            .announce(
                &Notice::Joined {
                    identity: identity.clone(),
                },
                Some(connection.id()),
            )
            .await;
        if let Err(err) = connection.send(&Notice::Connected.to_string()).await {
            debug!(%identity, ?err, "failed to acknowledge connection");
        }

        let (close_reason, messages_routed) = self.exchange(&connection).await;

        self.transition(SessionState::Closing);
        self.close(&connection, registration, close_reason).await;
        self.transition(SessionState::Closed);

        SessionSummary {
            identity: Some(identity),
            messages_routed,
            close_reason,
        }
    }

    async fn negotiate(&mut self) -> Result<String, SessionError> {
        let payload = select! {
            read = read_payload(&mut self.reader) => read?,
            _ = shutdown_requested(&mut self.shutdown) => return Err(SessionError::Shutdown),
        };

        let Some(payload) = payload else {
            return Err(SessionError::ClosedBeforeIdentity);
        };
        let identity = payload.trim();
        if identity.is_empty() {
            return Err(SessionError::EmptyIdentity);
        }
        Ok(identity.to_string())
    }

    async fn exchange(&mut self, connection: &Connection) -> (CloseReason, usize) {
        let mut routed = 0;
        let reason = loop {
            select! {
                read = read_payload(&mut self.reader) => match read {
                    Ok(Some(payload)) => {
                        info!(sender = connection.identity(), payload = %payload, "message received");
                        self.router.dispatch(connection, &payload).await;
                        routed += 1;
                    }
                    Ok(None) => break CloseReason::PeerClosed,
                    Err(err) => {
                        debug!(identity = connection.identity(), ?err, "read failed");
                        break CloseReason::ReadError;
                    }
                },
                _ = shutdown_requested(&mut self.shutdown) => break CloseReason::Shutdown,
            }
        };
        (reason, routed)
    }

    async fn close(
        &mut self,
        connection: &Connection,
        registration: Registration,
        reason: CloseReason,
    ) {
        let deregistered = registration.release();
        info!(
            peer = ?self.peer,
            identity = connection.identity(),
            ?reason,
            deregistered,
            "client disconnected"
        );

        self.router
            .announce(
                &Notice::Left {
                    identity: connection.identity().to_string(),
                },
                None,
            )
            .await;

        if let Err(err) = connection.close().await {
            debug!(identity = connection.identity(), ?err, "transport already closed");
        }
    }

    async fn abandon(mut self, err: SessionError) -> SessionSummary {
        let close_reason = match err {
            SessionError::Shutdown => CloseReason::Shutdown,
            _ => CloseReason::NegotiationFailed,
        };
        warn!(peer = ?self.peer, error = %err, "identity negotiation failed");

        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.shutdown().await {
                debug!(?err, "transport already closed");
            }
        }
        self.transition(SessionState::Closed);

        SessionSummary {
            identity: None,
            messages_routed: 0,
            close_reason,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(peer = ?self.peer, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone without signalling: nothing left to wait for.
        std::future::pending::<()>().await;
    }
}

/// Registry membership held for the lifetime of an active session.
///
/// Removal happens once: through [`Registration::release`] on the normal
/// close path, or on drop if the session future is cancelled first.
struct Registration {
    registry: Arc<Registry>,
    identity: String,
    connection_id: ConnectionId,
    released: bool,
}

impl Registration {
    fn new(registry: Arc<Registry>, connection: &Arc<Connection>) -> Self {
        if let Some(displaced) = registry.insert(connection) {
            warn!(
                identity = connection.identity(),
                displaced, "identity already registered; newest connection takes the name"
            );
        }
        Self {
            registry,
            identity: connection.identity().to_string(),
            connection_id: connection.id(),
            released: false,
        }
    }

    fn release(mut self) -> bool {
        self.released = true;
        self.registry.remove(&self.identity, self.connection_id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.released {
            self.registry.remove(&self.identity, self.connection_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };
    use tokio::{
        io::{AsyncReadExt, DuplexStream, ReadBuf},
        task::JoinHandle,
        time::timeout,
    };

    /// Yields an identity, then fails every later read.
    struct FailingReader {
        identity: Option<&'static [u8]>,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.identity.take() {
                Some(identity) => {
                    buf.put_slice(identity);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset",
                ))),
            }
        }
    }

    /// Client end of an in-memory session. Accumulates everything received
    /// because payloads are unframed and may coalesce.
    struct Client {
        stream: DuplexStream,
        seen: String,
    }

    impl Client {
        async fn send(&mut self, text: &str) {
            self.stream.write_all(text.as_bytes()).await.expect("send");
        }

        async fn expect(&mut self, needle: &str) {
            let deadline = Duration::from_secs(1);
            timeout(deadline, async {
                while !self.seen.contains(needle) {
                    let mut buf = [0u8; 1024];
                    let read = self.stream.read(&mut buf).await.expect("read");
                    assert!(read > 0, "stream closed while waiting for {needle:?}");
                    self.seen.push_str(&String::from_utf8_lossy(&buf[..read]));
                }
            })
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}; saw {:?}", self.seen));

            let end = self.seen.find(needle).expect("needle present") + needle.len();
            self.seen.drain(..end);
        }

        async fn expect_eof(&mut self) {
            let mut buf = [0u8; 1024];
            loop {
                let read = timeout(Duration::from_secs(1), self.stream.read(&mut buf))
                    .await
                    .expect("eof in time")
                    .expect("read");
                if read == 0 {
                    return;
                }
            }
        }

        /// Reads until the stream goes quiet and checks `needle` never shows up.
        async fn assert_absent(&mut self, needle: &str) {
            let mut buf = [0u8; 1024];
            while let Ok(read) = timeout(Duration::from_millis(100), self.stream.read(&mut buf)).await
            {
                let read = read.expect("read");
                if read == 0 {
                    break;
                }
                self.seen.push_str(&String::from_utf8_lossy(&buf[..read]));
            }
            assert!(
                !self.seen.contains(needle),
                "unexpected {needle:?}; saw {:?}",
                self.seen
            );
        }
    }

    fn spawn_session(
        router: &Router,
        shutdown: &watch::Sender<bool>,
    ) -> (Client, JoinHandle<SessionSummary>) {
        let (client, server) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        let session = Session::new(router.clone(), reader, writer, None, shutdown.subscribe());
        let handle = tokio::spawn(session.run());
        (
            Client {
                stream: client,
                seen: String::new(),
            },
            handle,
        )
    }

    async fn joined(
        router: &Router,
        shutdown: &watch::Sender<bool>,
        name: &str,
    ) -> (Client, JoinHandle<SessionSummary>) {
        let (mut client, handle) = spawn_session(router, shutdown);
        client.send(name).await;
        client.expect("Connected to the chat server!").await;
        (client, handle)
    }

    fn fixtures() -> (Router, watch::Sender<bool>) {
        let (shutdown, _) = watch::channel(false);
        (Router::new(Arc::new(Registry::new())), shutdown)
    }

    #[tokio::test]
    async fn join_is_announced_to_others_and_acknowledged() {
        let (router, shutdown) = fixtures();
        let (mut alice, _alice_task) = joined(&router, &shutdown, "alice").await;
        let (_bob, _bob_task) = joined(&router, &shutdown, "bob").await;

        alice.expect("bob has joined the chat!").await;
        assert!(router.registry().lookup("bob").is_some());
    }

    #[tokio::test]
    async fn blank_identity_closes_without_registering() {
        let (router, shutdown) = fixtures();
        let (mut watcher, _watcher_task) = joined(&router, &shutdown, "watcher").await;
        let (mut client, handle) = spawn_session(&router, &shutdown);

        client.send("   \n").await;
        client.expect_eof().await;
        let summary = handle.await.expect("session task");

        assert_eq!(summary.identity, None);
        assert_eq!(summary.close_reason, CloseReason::NegotiationFailed);
        assert_eq!(router.registry().len(), 1);
        let pending = timeout(Duration::from_millis(50), watcher.stream.read(&mut [0u8; 64])).await;
        assert!(pending.is_err(), "no announcement expected");
    }

    #[tokio::test]
    async fn disconnect_deregisters_and_announces_departure() {
        let (router, shutdown) = fixtures();
        let (mut alice, _alice_task) = joined(&router, &shutdown, "alice").await;
        let (mut bob, bob_task) = joined(&router, &shutdown, "bob").await;
        alice.expect("bob has joined the chat!").await;

        bob.send("hello everyone").await;
        alice.expect("bob: hello everyone").await;
        bob.stream.shutdown().await.expect("shutdown");

        let summary = bob_task.await.expect("session task");
        assert_eq!(summary.identity.as_deref(), Some("bob"));
        assert_eq!(summary.close_reason, CloseReason::PeerClosed);
        assert_eq!(summary.messages_routed, 1);
        alice.expect("bob has left the chat.").await;
        alice.assert_absent("bob has left the chat.").await;
        assert!(router.registry().lookup("bob").is_none());
    }

    #[tokio::test]
    async fn read_error_runs_cleanup_once() {
        let (router, shutdown) = fixtures();
        let (mut alice, _alice_task) = joined(&router, &shutdown, "alice").await;

        let (_carol_end, server_end) = tokio::io::duplex(4096);
        let reader = FailingReader {
            identity: Some(b"carol".as_slice()),
        };
        let session = Session::new(router.clone(), reader, server_end, None, shutdown.subscribe());
        let summary = timeout(Duration::from_secs(1), session.run())
            .await
            .expect("session finished");

        assert_eq!(summary.identity.as_deref(), Some("carol"));
        assert_eq!(summary.close_reason, CloseReason::ReadError);
        assert!(router.registry().lookup("carol").is_none());
        assert_eq!(router.registry().len(), 1);

        alice.expect("carol has joined the chat!").await;
        alice.expect("carol has left the chat.").await;
        alice.assert_absent("carol has left the chat.").await;
    }

    #[tokio::test]
    async fn read_error_on_sole_session_empties_registry() {
        let (router, shutdown) = fixtures();
        let (_dave_end, server_end) = tokio::io::duplex(4096);
        let reader = FailingReader {
            identity: Some(b"dave".as_slice()),
        };
        let session = Session::new(router.clone(), reader, server_end, None, shutdown.subscribe());

        let summary = session.run().await;

        assert_eq!(summary.close_reason, CloseReason::ReadError);
        assert!(router.registry().is_empty());
    }

    #[tokio::test]
    async fn displaced_session_leaves_newer_registration_in_place() {
        let (router, shutdown) = fixtures();
        let (mut first, first_task) = joined(&router, &shutdown, "alice").await;
        let (_second, _second_task) = joined(&router, &shutdown, "alice").await;
        first.expect("alice has joined the chat!").await;

        first.stream.shutdown().await.expect("shutdown");
        first_task.await.expect("session task");

        let current = router.registry().lookup("alice").expect("newer alice");
        assert_eq!(router.registry().len(), 1);
        assert_eq!(current.identity(), "alice");
    }

    #[tokio::test]
    async fn shutdown_signal_runs_normal_cleanup() {
        let (router, shutdown) = fixtures();
        let (mut alice, alice_task) = joined(&router, &shutdown, "alice").await;

        shutdown.send_replace(true);

        let summary = alice_task.await.expect("session task");
        assert_eq!(summary.close_reason, CloseReason::Shutdown);
        assert!(router.registry().is_empty());
        alice.expect_eof().await;
    }
}
