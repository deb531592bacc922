use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use console_chat_relay::{
    cli::{Cli, Command},
    client,
    server::Server,
    telemetry::{self, Console},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let _guard = telemetry::init(Console::Stdout, &args.log_file)?;
            let bind = format!("{}:{}", args.host, args.port);
            let listener = TcpListener::bind(bind.as_str())
                .await
                .with_context(|| format!("failed to bind {bind}"))?;
            let server = Server::new(listener);
            let addr = server.local_addr()?;
            info!("chat server listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => {
            let _guard = telemetry::init(Console::Stderr, &args.log_file)?;
            client::run(args).await?;
        }
    }

    Ok(())
}
