//! Java Edition TCP interposer (§4.3).
//!
//! While a server's process is down, this binds its configured port,
//! answers server-list pings with a "napping" MOTD, and turns any login
//! attempt into a single `wake_requested` signal plus a disconnect packet
//! carrying the configured starting-up message.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{Config, ServerConfig};
use crate::error::InterposerError;
use crate::protocol::java::{
    build_login_disconnect_payload, build_status_response_payload, decode_login_start,
    read_packet, write_packet, Handshake, NextState, StatusPayload,
};

use super::{bind_tcp, DRAIN_TIMEOUT, WAKE_COALESCE_WINDOW};

/// Owns the listener for one Java server's port. `acquire`/`release` are
/// idempotent: calling either while already in that state is a no-op.
///
/// Holds a `watch` receiver onto the live config snapshot rather than a
/// fixed `Arc<ServerConfig>`, so a reload that only changes display fields
/// (MOTD, kick message, …) takes effect on the next connection without a
/// rebind (§4.6, §4.7).
pub struct JavaInterposer {
    server_key: String,
    server_id: String,
    addr: SocketAddr,
    cfg_rx: watch::Receiver<Arc<Config>>,
    wake_tx: mpsc::Sender<String>,
    last_wake_sent: Arc<Mutex<Option<Instant>>>,
    task: Option<JoinHandle<()>>,
    shutdown: Option<Arc<Notify>>,
}

impl JavaInterposer {
    pub fn new(
        server_key: String,
        server_id: String,
        addr: SocketAddr,
        cfg_rx: watch::Receiver<Arc<Config>>,
        wake_tx: mpsc::Sender<String>,
    ) -> Self {
        JavaInterposer {
            server_key,
            server_id,
            addr,
            cfg_rx,
            wake_tx,
            last_wake_sent: Arc::new(Mutex::new(None)),
            task: None,
            shutdown: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.task.is_some()
    }

    /// Bind the port and start answering traffic. No-op if already bound.
    pub async fn acquire(&mut self) -> Result<(), InterposerError> {
        if self.task.is_some() {
            return Ok(());
        }

        let std_listener = bind_tcp(self.addr)?;
        let listener =
            TcpListener::from_std(std_listener).map_err(|source| InterposerError::PortBindFailed {
                addr: self.addr,
                source,
            })?;

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(accept_loop(
            listener,
            self.server_key.clone(),
            self.server_id.clone(),
            self.cfg_rx.clone(),
            self.wake_tx.clone(),
            self.last_wake_sent.clone(),
            shutdown.clone(),
        ));

        self.task = Some(task);
        self.shutdown = Some(shutdown);
        debug!(server = %self.server_id, addr = %self.addr, "java interposer bound");
        Ok(())
    }

    /// Stop accepting new connections and wait up to [`DRAIN_TIMEOUT`] for
    /// the accept loop to exit. The port is free for the real server the
    /// moment this returns `Ok`.
    pub async fn release(&mut self) -> Result<(), InterposerError> {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.notify_waiters();
        }

        if let Some(task) = self.task.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(server = %self.server_id, error = %e, "interposer accept task panicked"),
                Err(_) => return Err(InterposerError::DrainTimeout),
            }
        }

        debug!(server = %self.server_id, addr = %self.addr, "java interposer released");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    server_key: String,
    server_id: String,
    cfg_rx: watch::Receiver<Arc<Config>>,
    wake_tx: mpsc::Sender<String>,
    last_wake_sent: Arc<Mutex<Option<Instant>>>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let Some(cfg) = cfg_rx.borrow().servers.get(&server_key).cloned() else {
                            continue;
                        };
                        let wake_tx = wake_tx.clone();
                        let last_wake_sent = last_wake_sent.clone();
                        let server_key = server_key.clone();
                        let server_id = server_id.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(socket, peer, &cfg, &wake_tx, &last_wake_sent, &server_key, &server_id).await
                            {
                                debug!(%peer, error = %e, "java interposer connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(server = %server_id, error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    cfg: &ServerConfig,
    wake_tx: &mpsc::Sender<String>,
    last_wake_sent: &Mutex<Option<Instant>>,
    server_key: &str,
    server_id: &str,
) -> Result<(), InterposerError> {
    let handshake_packet = read_packet(&mut socket).await?;
    let handshake = Handshake::decode(&handshake_packet)?;

    match handshake.next_state {
        NextState::Status => {
            // Status Request, empty body.
            let _ = read_packet(&mut socket).await?;
            let payload = StatusPayload {
                version_name: &cfg.version_name,
                protocol_version: cfg.protocol_version,
                max_players: cfg.max_players,
                motd: &cfg.motd,
                favicon: None,
            };
            let body = build_status_response_payload(&payload);
            write_packet(&mut socket, 0x00, &body)
                .await
                .map_err(|e| InterposerError::ProtocolFramingError(e.to_string()))?;

            // Optional ping/pong: echo back whatever payload the client sent.
            if let Ok(ping) = read_packet(&mut socket).await {
                let _ = write_packet(&mut socket, 0x01, &ping.data).await;
            }
        }
        NextState::Login => {
            let _username = decode_login_start(&read_packet(&mut socket).await?)?;
            debug!(%peer, server = %server_id, "login attempt while napping, requesting wake");

            let should_send = {
                let mut guard = last_wake_sent.lock().unwrap();
                let now = Instant::now();
                let send = guard.map_or(true, |prev| now.duration_since(prev) >= WAKE_COALESCE_WINDOW);
                if send {
                    *guard = Some(now);
                }
                send
            };
            if should_send {
                // The monitor keys its server map by the config name, not
                // the controller's opaque id, so the wake channel carries
                // `server_key` (§4.3, §6: servers.<name> vs. crafty_server_id).
                let _ = wake_tx.send(server_key.to_string()).await;
            }

            let body = build_login_disconnect_payload(&cfg.starting_kick_message);
            write_packet(&mut socket, 0x00, &body)
                .await
                .map_err(|e| InterposerError::ProtocolFramingError(e.to_string()))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalescing_window_constant_is_two_seconds() {
        assert_eq!(WAKE_COALESCE_WINDOW, Duration::from_secs(2));
    }

    #[test]
    fn drain_timeout_constant_is_two_seconds() {
        assert_eq!(DRAIN_TIMEOUT, Duration::from_secs(2));
    }
}
