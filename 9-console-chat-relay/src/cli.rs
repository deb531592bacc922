use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Host or IP address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 5555)]
    pub port: u16,

    /// Append-only event log.
    #[arg(long, default_value = "chat_server.log")]
    pub log_file: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name other participants see.
    #[arg(long)]
    pub name: String,

    /// Server host to connect to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to connect to.
    #[arg(long, default_value_t = 5555)]
    pub port: u16,

    #[arg(long, default_value = "chat_client.log")]
    pub log_file: PathBuf,
}
