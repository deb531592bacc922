use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    message::Notice,
    registry::Registry,
    router::Router,
    session::{Session, SessionSummary},
};

/// How long shutdown waits for sessions to finish before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Server {
    listener: TcpListener,
    router: Router,
    shutdown_grace: Duration,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            router: Router::new(Arc::new(Registry::new())),
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.router.registry())
    }

    /// Accepts connections until `shutdown` resolves, then closes every
    /// session and waits for their cleanup to finish. Sessions still running
    /// after the grace period (a peer that stopped reading) are aborted.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            router,
            shutdown_grace,
        } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &router, &stop_rx, &mut sessions);
                }
                Some(finished) = sessions.join_next() => log_session_end(finished),
            }
        }

        let drained = timeout(shutdown_grace, async {
            handle_shutdown(&router, &stop_tx).await;
            while let Some(finished) = sessions.join_next().await {
                log_session_end(finished);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = sessions.len(),
                "sessions did not close within the grace period; aborting"
            );
            stop_tx.send_replace(true);
            sessions.shutdown().await;
        }

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

async fn handle_shutdown(router: &Router, stop: &watch::Sender<bool>) {
    info!(clients = router.registry().len(), "server shutting down");
    router.announce(&Notice::ShuttingDown, None).await;
    stop.send_replace(true);
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    router: &Router,
    stop: &watch::Receiver<bool>,
    sessions: &mut JoinSet<SessionSummary>,
) {
    match result {
        Ok((stream, peer)) => {
            debug!(%peer, "accepted connection");
            let (reader, writer) = stream.into_split();
            let session = Session::new(router.clone(), reader, writer, Some(peer), stop.clone());
            sessions.spawn(session.run());
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn log_session_end(finished: Result<SessionSummary, tokio::task::JoinError>) {
    match finished {
        Ok(summary) => debug!(
            identity = ?summary.identity,
            messages = summary.messages_routed,
            reason = ?summary.close_reason,
            "session finished"
        ),
        Err(err) => warn!(error = ?err, "session task failed"),
    }
}
