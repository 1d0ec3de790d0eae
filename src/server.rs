// The listener: waits on the well-known port for requests and starts one session per request.
//
// The listening socket is only ever used to receive requests. Every session gets its own socket
// on an OS-assigned port, which becomes the server's TID for that client, and runs in its own
// task. Sessions share nothing but the storage handle.

use crate::config::Config;
use crate::srv_conn::{self, SessionSettings};
use crate::storage::{FsStorage, Storage};
use crate::tftp::{self, TftpSocket};
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct Server<S = FsStorage> {
    sock: TftpSocket,
    storage: Arc<S>,
    settings: SessionSettings,
    session_deadline: Duration,
}

impl Server<FsStorage> {
    /// Binds the listening socket and serves files from the configured root directory.
    pub fn bind(config: &Config) -> Result<Server<FsStorage>> {
        if !config.root.is_dir() {
            anyhow::bail!("Root is not a directory: {}", config.root.display());
        }
        let storage = FsStorage::new(config.root.clone(), config.overwrite);
        Server::with_storage(config, storage)
    }
}

impl<S: Storage + Send + Sync + 'static> Server<S> {
    pub fn with_storage(config: &Config, storage: S) -> Result<Server<S>> {
        let addr = config.listen_addr();
        let sock = TftpSocket::bind(addr).with_context(|| format!("Failed to bind TFTP socket on {addr}"))?;
        Ok(Server {
            sock,
            storage: Arc::new(storage),
            settings: config.session_settings(),
            session_deadline: config.session_deadline,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.sock.local_addr().context("Failed to get local address")
    }

    /// Receives requests forever. A failed receive only loses that one datagram.
    pub async fn serve(&self) -> Result<()> {
        log::info!("TFTP server listening on {}", self.local_addr()?);
        loop {
            let received = self.sock.recv_from().await;
            self.accept(received);
        }
    }

    /// Receives requests until `shutdown` resolves. Sessions already running are left to finish
    /// on their own.
    pub async fn serve_until<F: Future<Output = ()>>(&self, shutdown: F) -> Result<()> {
        tokio::select! {
            result = self.serve() => result,
            _ = shutdown => {
                log::info!("Shutting down listener");
                Ok(())
            }
        }
    }

    fn accept(&self, received: std::io::Result<(Vec<u8>, SocketAddr)>) {
        match received {
            Ok((buf, src)) => self.dispatch(buf, src),
            Err(e) => log::warn!("Failed to receive on the listening socket: {e}"),
        }
    }

    fn dispatch(&self, buf: Vec<u8>, src: SocketAddr) {
        match tftp::decode_opcode(&buf) {
            Ok(tftp::OpCode::Rrq | tftp::OpCode::Wrq) => {}
            Ok(opcode) => {
                log::debug!("Ignoring {opcode:?} packet from {src} on the listening port");
                return;
            }
            Err(e) => {
                log::warn!("Ignoring datagram from {src}: {e}");
                return;
            }
        }

        let local = match self.sock.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::error!("Failed to get local address: {e}");
                return;
            }
        };
        let sock = match TftpSocket::bind(SocketAddr::new(local.ip(), 0)) {
            Ok(sock) => sock,
            Err(e) => {
                log::error!("Couldn't bind a session socket for {src}: {e}");
                return;
            }
        };
        if let Ok(addr) = sock.local_addr() {
            log::debug!("Session socket for {src} bound to {addr}");
        }

        let storage = Arc::clone(&self.storage);
        let settings = self.settings.clone();
        let deadline = self.session_deadline;
        tokio::spawn(async move {
            let session = srv_conn::run_session(storage.as_ref(), &buf, src, sock, settings);
            match tokio::time::timeout(deadline, session).await {
                Ok(Ok(summary)) => log::info!(
                    "Transfer of '{}' with {src} complete: {} bytes, {} retransmissions",
                    summary.filename,
                    summary.bytes,
                    summary.retransmissions
                ),
                Ok(Err(e)) => log::warn!("Session with {src} failed: {e}"),
                Err(_) => log::warn!("Session with {src} exceeded {deadline:?}, dropping it"),
            }
        });
    }
}
