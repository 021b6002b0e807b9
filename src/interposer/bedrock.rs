//! Bedrock Edition UDP interposer (§4.4).
//!
//! A single socket answers every unconnected ping with a pong advertising
//! the napping MOTD. Waking is policy-driven per `bedrock.wake_on_ping`:
//! `always` wakes on the first ping, `repeated` waits for a second ping
//! from the same peer inside the coalescing window, `never` only wakes
//! through the Java interposer (or not at all, for Bedrock-only servers
//! left permanently asleep).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{Config, WakeOnPing};
use crate::error::InterposerError;
use crate::protocol::bedrock::{build_unconnected_pong, parse_unconnected_ping, MotdFields};

use super::{bind_udp, BEDROCK_REPEAT_PING_WINDOW, DRAIN_TIMEOUT};

pub struct BedrockInterposer {
    server_key: String,
    server_id: String,
    addr: SocketAddr,
    cfg_rx: watch::Receiver<Arc<Config>>,
    wake_tx: mpsc::Sender<String>,
    task: Option<JoinHandle<()>>,
    shutdown: Option<Arc<Notify>>,
}

impl BedrockInterposer {
    pub fn new(
        server_key: String,
        server_id: String,
        addr: SocketAddr,
        cfg_rx: watch::Receiver<Arc<Config>>,
        wake_tx: mpsc::Sender<String>,
    ) -> Self {
        BedrockInterposer {
            server_key,
            server_id,
            addr,
            cfg_rx,
            wake_tx,
            task: None,
            shutdown: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.task.is_some()
    }

    pub async fn acquire(&mut self) -> Result<(), InterposerError> {
        if self.task.is_some() {
            return Ok(());
        }

        let std_socket = bind_udp(self.addr)?;
        let socket =
            UdpSocket::from_std(std_socket).map_err(|source| InterposerError::PortBindFailed {
                addr: self.addr,
                source,
            })?;

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(recv_loop(
            socket,
            self.server_key.clone(),
            self.server_id.clone(),
            self.cfg_rx.clone(),
            self.wake_tx.clone(),
            shutdown.clone(),
        ));

        self.task = Some(task);
        self.shutdown = Some(shutdown);
        debug!(server = %self.server_id, addr = %self.addr, "bedrock interposer bound");
        Ok(())
    }

    pub async fn release(&mut self) -> Result<(), InterposerError> {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.notify_waiters();
        }

        if let Some(task) = self.task.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(server = %self.server_id, error = %e, "interposer recv task panicked"),
                Err(_) => return Err(InterposerError::DrainTimeout),
            }
        }

        debug!(server = %self.server_id, addr = %self.addr, "bedrock interposer released");
        Ok(())
    }
}

async fn recv_loop(
    socket: UdpSocket,
    server_key: String,
    server_id: String,
    cfg_rx: watch::Receiver<Arc<Config>>,
    wake_tx: mpsc::Sender<String>,
    shutdown: Arc<Notify>,
) {
    let mut buf = [0u8; 1500];
    // Tracks the most recent ping per peer, for the `repeated` wake policy.
    let mut seen: HashMap<SocketAddr, Instant> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(server = %server_id, error = %e, "bedrock recv failed");
                        continue;
                    }
                };

                let Some(ping) = parse_unconnected_ping(&buf[..len]) else {
                    continue;
                };

                let Some(cfg) = cfg_rx.borrow().servers.get(&server_key).cloned() else {
                    continue;
                };

                let fields = MotdFields {
                    motd_line1: &cfg.motd,
                    protocol_version: cfg.protocol_version,
                    version_name: &cfg.version_name,
                    max_players: cfg.max_players,
                    server_guid: ping.client_guid.wrapping_neg(),
                    motd_line2: &cfg.version_name,
                    port_v4: cfg.listen_port,
                    port_v6: cfg.listen_port,
                };
                let pong = build_unconnected_pong(ping.time, fields.server_guid, &fields);
                if let Err(e) = socket.send_to(&pong, peer).await {
                    warn!(server = %server_id, error = %e, "bedrock pong send failed");
                }

                if should_wake(&cfg.bedrock.wake_on_ping, &mut seen, peer) {
                    // The monitor keys its server map by the config name,
                    // not the controller's opaque id (§4.4, §6).
                    let _ = wake_tx.send(server_key.clone()).await;
                }
            }
        }
    }
}

fn should_wake(
    policy: &WakeOnPing,
    seen: &mut HashMap<SocketAddr, Instant>,
    peer: SocketAddr,
) -> bool {
    match policy {
        WakeOnPing::Never => false,
        WakeOnPing::Always => true,
        WakeOnPing::Repeated => {
            let now = Instant::now();
            match seen.get(&peer) {
                Some(prev) if now.duration_since(*prev) < BEDROCK_REPEAT_PING_WINDOW => {
                    seen.insert(peer, now);
                    true
                }
                _ => {
                    seen.insert(peer, now);
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn never_policy_never_wakes() {
        let mut seen = HashMap::new();
        assert!(!should_wake(&WakeOnPing::Never, &mut seen, peer(1)));
    }

    #[test]
    fn always_policy_wakes_on_first_ping() {
        let mut seen = HashMap::new();
        assert!(should_wake(&WakeOnPing::Always, &mut seen, peer(1)));
    }

    #[test]
    fn repeated_policy_requires_second_ping_inside_window() {
        let mut seen = HashMap::new();
        assert!(!should_wake(&WakeOnPing::Repeated, &mut seen, peer(1)));
        assert!(should_wake(&WakeOnPing::Repeated, &mut seen, peer(1)));
    }

    #[test]
    fn repeated_policy_tracks_peers_independently() {
        let mut seen = HashMap::new();
        assert!(!should_wake(&WakeOnPing::Repeated, &mut seen, peer(1)));
        assert!(!should_wake(&WakeOnPing::Repeated, &mut seen, peer(2)));
        let _ = Duration::from_secs(0);
    }

    #[test]
    fn repeat_ping_window_is_five_seconds() {
        assert_eq!(BEDROCK_REPEAT_PING_WINDOW, Duration::from_secs(5));
    }
}
