use crate::srv_conn::{SessionSettings, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

/// Sessions still running after this long are torn down regardless of progress.
pub const DEFAULT_SESSION_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// TFTP server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// IP address to listen on. Session sockets bind to the same address.
    pub ip_address: IpAddr,
    /// Port number to listen on for new requests
    pub port: u16,
    /// Directory files are served from and uploaded to
    pub root: PathBuf,
    /// How long to wait for the peer after each packet sent
    pub timeout: Duration,
    /// Retransmissions allowed per packet before the peer is given up on
    pub max_retries: u32,
    /// Upper bound on the lifetime of a single session
    pub session_deadline: Duration,
    /// Whether to reject all write requests
    pub read_only: bool,
    /// Whether uploads may replace existing files
    pub overwrite: bool,
}

impl Config {
    pub fn new(ip_address: IpAddr, port: u16, root: PathBuf) -> Self {
        Self {
            ip_address,
            port,
            root,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            session_deadline: DEFAULT_SESSION_DEADLINE,
            read_only: false,
            overwrite: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_session_deadline(mut self, deadline: Duration) -> Self {
        self.session_deadline = deadline;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.port)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            timeout: self.timeout,
            max_retries: self.max_retries,
            read_only: self.read_only,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            DEFAULT_PORT,
            std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()),
        )
    }
}
