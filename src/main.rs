use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use lockstep_tftpd::config::{self, Config};
use lockstep_tftpd::server::Server;
use lockstep_tftpd::srv_conn;

/// Serve files over TFTP (RFC 1350, octet mode).
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// IP address to listen on
    #[arg(short = 'a', long = "address", default_value = "0.0.0.0")]
    address: IpAddr,

    /// UDP port to listen on for new requests
    #[arg(short = 'p', long = "port", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Directory to serve files from and store uploads in
    #[arg(short = 'd', long = "root", default_value = ".")]
    root: PathBuf,

    /// Milliseconds to wait for the peer after each packet sent
    #[arg(long = "timeout-ms", default_value_t = srv_conn::DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Retransmissions allowed per packet before a session is abandoned
    #[arg(long = "retries", default_value_t = srv_conn::DEFAULT_MAX_RETRIES)]
    retries: u32,

    /// Seconds after which a session is torn down no matter what
    #[arg(long = "session-deadline-secs", default_value_t = config::DEFAULT_SESSION_DEADLINE.as_secs())]
    session_deadline_secs: u64,

    /// Reject all write requests
    #[arg(long = "read-only")]
    read_only: bool,

    /// Refuse uploads that would replace an existing file
    #[arg(long = "no-overwrite")]
    no_overwrite: bool,
}

impl Args {
    fn into_config(self) -> Config {
        Config::new(self.address, self.port, self.root)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_retries(self.retries)
            .with_session_deadline(Duration::from_secs(self.session_deadline_secs))
            .with_read_only(self.read_only)
            .with_overwrite(!self.no_overwrite)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    log::info!("Serving files from {}", config.root.display());
    log::info!("Read-only mode: {}", config.read_only);

    let server = Server::bind(&config)?;
    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}
