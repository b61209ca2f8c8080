use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Listening Websocket address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub(crate) address: String,
    /// Admin API and metrics address
    #[arg(long, default_value = "127.0.0.1:8081")]
    pub(crate) admin_address: String,
    /// Configuration file, created with defaults if missing
    #[arg(short, long, default_value = "orchestrator.toml")]
    pub(crate) config: PathBuf,
}
