//! Terminal client: one connection, two flows.
//!
//! The outbound flow forwards operator lines to the server; the inbound flow
//! prints whatever the server sends. They share a [`Liveness`] flag and
//! whichever notices the end of the conversation first flips it, which stops
//! the other.

use std::{future::Future, io::BufRead, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::{Mutex, mpsc, watch},
};
use tracing::{debug, info, warn};

use crate::{cli::ClientArgs, message::read_payload};

pub const EXIT_KEYWORD: &str = "exit";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = establish_connection(&args).await?;
    let input = spawn_operator_input();
    run_with_console(stream, &args.name, input, ctrl_c(), tokio::io::stdout()).await
}

/// Resolves on Ctrl-C. If the handler cannot be installed the client simply
/// runs without one.
async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(?err, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}

async fn establish_connection(args: &ClientArgs) -> Result<TcpStream> {
    let addr = format!("{}:{}", args.host, args.port);
    let stream = TcpStream::connect(addr.as_str())
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    info!("connected to {addr}");
    Ok(stream)
}

/// Reads stdin on a detached thread so a pending read never holds up
/// runtime shutdown.
fn spawn_operator_input() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Runs a chat session over `stream`, taking operator lines from `input` and
/// rendering server payloads to `console`. Resolving `interrupt` ends the
/// session the same way the exit keyword does.
pub async fn run_with_console<S, I, O>(
    stream: S,
    name: &str,
    input: mpsc::Receiver<String>,
    interrupt: I,
    console: O,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    I: Future<Output = ()> + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let console = Console::new(console);

    send_payload(&mut writer, name)
        .await
        .context("failed to send identity")?;
    info!(name, "identity sent");

    console.line(&format!("Connected to chat server as {name}")).await?;
    console
        .line("Type your messages. Use @recipient for private messages.")
        .await?;
    console.line(&format!("Type '{EXIT_KEYWORD}' to quit.")).await?;

    let liveness = Liveness::new();
    let inbound = tokio::spawn(inbound_flow(reader, console.clone(), liveness.clone()));
    let outbound = tokio::spawn(outbound_flow(input, interrupt, writer, liveness));

    inbound.await.context("inbound flow panicked")?;
    outbound.await.context("outbound flow panicked")?;

    info!("disconnected from server");
    console.line("Disconnected from server").await?;
    Ok(())
}

async fn inbound_flow<R, O>(mut reader: R, console: Console<O>, liveness: Liveness)
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        select! {
            read = read_payload(&mut reader) => match read {
                Ok(Some(payload)) => {
                    info!(payload = %payload, "received message");
                    let text = payload.trim_end_matches(LINE_ENDINGS);
                    if let Err(err) = console.line(text).await {
                        warn!(?err, "failed to write to console");
                        break;
                    }
                }
                Ok(None) => {
                    info!("server closed the connection");
                    break;
                }
                Err(err) => {
                    warn!(?err, "receive failed");
                    break;
                }
            },
            _ = liveness.disconnected() => break,
        }
    }
    liveness.disconnect();
}

async fn outbound_flow<I, W>(
    mut input: mpsc::Receiver<String>,
    interrupt: I,
    mut writer: W,
    liveness: Liveness,
) where
    I: Future<Output = ()>,
    W: AsyncWrite + Unpin,
{
    tokio::pin!(interrupt);
    loop {
        let line = select! {
            line = input.recv() => line,
            _ = &mut interrupt => {
                info!("interrupted, disconnecting");
                break;
            }
            _ = liveness.disconnected() => break,
        };
        let Some(line) = line else {
            debug!("operator input closed");
            break;
        };

        let text = line.trim_end_matches(LINE_ENDINGS);
        if text.eq_ignore_ascii_case(EXIT_KEYWORD) {
            info!("exit requested");
            break;
        }
        if text.is_empty() {
            continue;
        }

        if let Err(err) = send_payload(&mut writer, text).await {
            warn!(?err, "send failed");
            break;
        }
        info!(message = text, "sent message");
    }

    if liveness.disconnect() {
        if let Err(err) = writer.shutdown().await {
            debug!(?err, "failed to shut down connection cleanly");
        }
    }
}

async fn send_payload<W>(writer: &mut W, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}

/// Shared "still connected" state for the two client flows.
#[derive(Clone)]
pub struct Liveness {
    state: Arc<watch::Sender<bool>>,
}

impl Liveness {
    pub fn new() -> Self {
        let (state, _) = watch::channel(true);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    /// Marks the link as down. Returns `true` only for the call that
    /// actually flipped it.
    pub fn disconnect(&self) -> bool {
        self.state.send_replace(false)
    }

    pub async fn disconnected(&self) {
        let mut state = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns once flipped.
        let _ = state.wait_for(|connected| !*connected).await;
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

struct Console<O> {
    out: Arc<Mutex<O>>,
}

impl<O> Clone for Console<O> {
    fn clone(&self) -> Self {
        Self {
            out: Arc::clone(&self.out),
        }
    }
}

impl<O> Console<O>
where
    O: AsyncWrite + Unpin,
{
    fn new(out: O) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    async fn line(&self, text: &str) -> std::io::Result<()> {
        let mut out = self.out.lock().await;
        out.write_all(text.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await
    }
}
