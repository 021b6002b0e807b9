//! The monitor loop (§4.6, §5, §9): the single coordinator that ticks the
//! controller, feeds every server's state machine, executes the intents
//! each machine emits, and arbitrates port ownership between the
//! interposers and the real servers.
//!
//! Everything here is the "glue": the FSM in [`crate::state_machine`] stays
//! a pure value transform, and all I/O — controller calls, socket
//! acquire/release, webhook posts, metrics, status snapshots — lives in
//! this module, one task, so ordering per server is trivially serialized.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{Config, ServerConfig, ServerKind};
use crate::controller::ControllerClient;
use crate::error::{ControllerError, InterposerError};
use crate::http::{ServerStatusEntry, StatusSnapshot};
use crate::interposer::bedrock::BedrockInterposer;
use crate::interposer::java::JavaInterposer;
use crate::signals::{self, ControlSignal};
use crate::state_machine::{Intent, MachineState, NotifyEvent, ObservedSample, State};
use crate::webhook::WebhookNotifier;

/// Repeated intent failures (§4.6) surface a machine-level `degraded` flag.
const DEGRADED_THRESHOLD: u32 = 5;

enum InterposerHandle {
    Java(JavaInterposer),
    Bedrock(BedrockInterposer),
}

impl InterposerHandle {
    async fn acquire(&mut self) -> Result<(), InterposerError> {
        match self {
            InterposerHandle::Java(i) => i.acquire().await,
            InterposerHandle::Bedrock(i) => i.acquire().await,
        }
    }

    async fn release(&mut self) -> Result<(), InterposerError> {
        match self {
            InterposerHandle::Java(i) => i.release().await,
            InterposerHandle::Bedrock(i) => i.release().await,
        }
    }
}

fn build_interposer(
    key: &str,
    server_id: &str,
    cfg: &ServerConfig,
    cfg_rx: watch::Receiver<Arc<Config>>,
    wake_tx: mpsc::Sender<String>,
) -> Result<(InterposerHandle, SocketAddr), InterposerError> {
    let addr = cfg.socket_addr().map_err(|_| InterposerError::PortBindFailed {
        addr: "0.0.0.0:0".parse().unwrap(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad bind address"),
    })?;

    let handle = match cfg.kind {
        ServerKind::Java => InterposerHandle::Java(JavaInterposer::new(
            key.to_string(),
            server_id.to_string(),
            addr,
            cfg_rx,
            wake_tx,
        )),
        ServerKind::Bedrock => InterposerHandle::Bedrock(BedrockInterposer::new(
            key.to_string(),
            server_id.to_string(),
            addr,
            cfg_rx,
            wake_tx,
        )),
    };
    Ok((handle, addr))
}

struct ServerRuntime {
    crafty_server_id: String,
    addr: SocketAddr,
    kind: ServerKind,
    machine: MachineState,
    interposer: InterposerHandle,
    idle_since_wall: Option<chrono::DateTime<Utc>>,
    last_sample: Option<ObservedSample>,
    pending_start: bool,
    pending_stop: bool,
}

pub struct Monitor {
    config_path: PathBuf,
    config: Arc<Config>,
    config_tx: watch::Sender<Arc<Config>>,
    /// Kept alive solely so `config_tx.send` always has at least one
    /// receiver; interposers hold their own clones.
    _config_rx_anchor: watch::Receiver<Arc<Config>>,
    controller: ControllerClient,
    servers: HashMap<String, ServerRuntime>,
    wake_tx: mpsc::Sender<String>,
    wake_rx: mpsc::Receiver<String>,
    webhook: WebhookNotifier,
    status: StatusSnapshot,
    signal_rx: mpsc::Receiver<ControlSignal>,
    /// Set once an `AuthDenied` is observed anywhere (status lookup, start,
    /// or stop) so every call site can stop reconciling and the `run()` loop
    /// can exit, per §7's "fatal at first occurrence" rule.
    fatal_shutdown: bool,
}

impl Monitor {
    pub fn new(
        config_path: PathBuf,
        config: Config,
        controller: ControllerClient,
        webhook: WebhookNotifier,
        status: StatusSnapshot,
    ) -> Result<Self, InterposerError> {
        let config = Arc::new(config);
        let (config_tx, config_rx_anchor) = watch::channel(config.clone());
        let (wake_tx, wake_rx) = mpsc::channel(64);
        let signal_rx = signals::spawn();

        let now = Instant::now();
        let mut servers = HashMap::with_capacity(config.servers.len());
        for (key, server_cfg) in &config.servers {
            let (interposer, addr) = build_interposer(
                key,
                &server_cfg.crafty_server_id,
                server_cfg,
                config_tx.subscribe(),
                wake_tx.clone(),
            )?;
            servers.insert(
                key.clone(),
                ServerRuntime {
                    crafty_server_id: server_cfg.crafty_server_id.clone(),
                    addr,
                    kind: server_cfg.kind,
                    machine: MachineState::new(now),
                    interposer,
                    idle_since_wall: None,
                    last_sample: None,
                    pending_start: false,
                    pending_stop: false,
                },
            );
        }

        Ok(Monitor {
            config_path,
            config,
            config_tx,
            _config_rx_anchor: config_rx_anchor,
            controller,
            servers,
            wake_tx,
            wake_rx,
            webhook,
            status,
            signal_rx,
            fatal_shutdown: false,
        })
    }

    /// Run until a shutdown signal arrives or an `AuthDenied` is observed.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.controller.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.run_tick().await {
                        break;
                    }
                }
                Some(server_key) = self.wake_rx.recv() => {
                    self.handle_wake(&server_key).await;
                    if self.fatal_shutdown {
                        self.shutdown().await;
                        break;
                    }
                }
                Some(signal) = self.signal_rx.recv() => {
                    match signal {
                        ControlSignal::Reload => self.reload().await,
                        ControlSignal::Shutdown => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// One reconciliation tick. Returns `false` if the process should exit
    /// (an `AuthDenied` was observed and is fatal).
    async fn run_tick(&mut self) -> bool {
        let ids: Vec<String> = self
            .servers
            .values()
            .map(|r| r.crafty_server_id.clone())
            .collect();
        let statuses = self.controller.list_status(&ids).await;

        let now = Instant::now();
        let keys: Vec<String> = self.servers.keys().cloned().collect();

        for key in &keys {
            let crafty_id = self.servers[key].crafty_server_id.clone();
            match statuses.get(&crafty_id) {
                Some(Ok(sample)) => {
                    if let Some(runtime) = self.servers.get_mut(key.as_str()) {
                        runtime.last_sample = Some(*sample);
                    }
                    if let Some(cfg) = self.server_config(key).cloned() {
                        self.apply_observed(key, &cfg, *sample, now).await;
                    }
                }
                Some(Err(ControllerError::AuthDenied)) => {
                    error!(server = %key, "controller denied credentials, shutting down");
                    self.fatal_shutdown = true;
                }
                Some(Err(e)) => {
                    crate::metrics::record_controller_error();
                    warn!(server = %key, error = %e, "controller status lookup failed, retrying next tick");
                    if let Some(cfg) = self.server_config(key).cloned() {
                        self.apply_timeout_check(key, &cfg, now).await;
                    }
                }
                None => {}
            }

            if self.fatal_shutdown {
                self.shutdown().await;
                return false;
            }

            self.retry_pending_intents(key, now).await;

            if self.fatal_shutdown {
                self.shutdown().await;
                return false;
            }
        }

        self.publish_status().await;
        true
    }

    fn server_config(&self, key: &str) -> Option<&ServerConfig> {
        self.config.servers.get(key)
    }

    async fn apply_observed(
        &mut self,
        key: &str,
        cfg: &ServerConfig,
        sample: ObservedSample,
        now: Instant,
    ) {
        let before = self.servers.get(key).map(|r| r.machine.state);
        let intents = {
            let runtime = match self.servers.get_mut(key) {
                Some(r) => r,
                None => return,
            };
            runtime.machine.on_observed(cfg, sample, now)
        };
        self.execute_intents(key, cfg, intents).await;
        self.apply_timeout_check(key, cfg, now).await;
        self.sync_idle_wall(key);
        self.record_transition_metric(key, before);
    }

    async fn apply_timeout_check(&mut self, key: &str, cfg: &ServerConfig, now: Instant) {
        let before = self.servers.get(key).map(|r| r.machine.state);
        let intents = {
            let runtime = match self.servers.get_mut(key) {
                Some(r) => r,
                None => return,
            };
            runtime.machine.on_tick_timeout_check(cfg, now)
        };
        self.execute_intents(key, cfg, intents).await;
        self.sync_idle_wall(key);
        self.record_transition_metric(key, before);
    }

    async fn handle_wake(&mut self, key: &str) {
        crate::metrics::record_wake_request(key);
        let cfg = match self.server_config(key).cloned() {
            Some(c) => c,
            None => return,
        };
        let now = Instant::now();
        let before = self.servers.get(key).map(|r| r.machine.state);
        let intents = {
            let runtime = match self.servers.get_mut(key) {
                Some(r) => r,
                None => return,
            };
            runtime.machine.on_wake_requested(&cfg, now)
        };
        self.execute_intents(key, &cfg, intents).await;
        self.record_transition_metric(key, before);
        self.publish_status().await;
    }

    fn sync_idle_wall(&mut self, key: &str) {
        if let Some(runtime) = self.servers.get_mut(key) {
            match runtime.machine.idle_since {
                Some(_) if runtime.idle_since_wall.is_none() => {
                    runtime.idle_since_wall = Some(Utc::now());
                }
                None => runtime.idle_since_wall = None,
                _ => {}
            }
        }
    }

    fn record_transition_metric(&self, key: &str, before: Option<State>) {
        if let (Some(before), Some(runtime)) = (before, self.servers.get(key)) {
            if before != runtime.machine.state {
                crate::metrics::record_transition(key, before, runtime.machine.state);
            }
            crate::metrics::record_state(key, runtime.machine.state);
            if let Some(sample) = runtime.last_sample {
                crate::metrics::record_players(key, sample.player_count);
            }
        }
    }

    /// Execute a batch of intents in emission order. Stops at the first
    /// failure, per §5's port-handoff discipline (a failed `release()`
    /// must not be followed by `start()`).
    async fn execute_intents(&mut self, key: &str, cfg: &ServerConfig, intents: Vec<Intent>) {
        for intent in intents {
            let ok = match intent {
                Intent::AcquirePort => self.do_acquire(key, cfg).await,
                Intent::ReleasePort => self.do_release(key).await,
                Intent::Start => self.do_start(key).await,
                Intent::Stop => self.do_stop(key).await,
                Intent::Notify(event) => {
                    self.do_notify(key, event).await;
                    true
                }
            };
            if !ok {
                break;
            }
        }
    }

    /// Acquire the interposer's port, retrying with exponential backoff up
    /// to `stop_timeout` if the socket is still held by the real server
    /// releasing it (§5 port handoff discipline).
    async fn do_acquire(&mut self, key: &str, cfg: &ServerConfig) -> bool {
        use backoff::backoff::Backoff;

        let mut backoff_policy = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(cfg.stop_timeout()))
            .build();

        loop {
            let attempt = match self.servers.get_mut(key) {
                Some(runtime) => runtime.interposer.acquire().await,
                None => return false,
            };

            match attempt {
                Ok(()) => {
                    if let Some(runtime) = self.servers.get_mut(key) {
                        runtime.machine.port_held_by_interposer = true;
                    }
                    return true;
                }
                Err(e) => match backoff_policy.next_backoff() {
                    Some(delay) => {
                        warn!(server = %key, error = %e, delay = ?delay, "port still held, retrying acquire");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(server = %key, error = %e, "failed to acquire interposer port after retrying");
                        return false;
                    }
                },
            }
        }
    }

    async fn do_release(&mut self, key: &str) -> bool {
        let runtime = match self.servers.get_mut(key) {
            Some(r) => r,
            None => return false,
        };
        match runtime.interposer.release().await {
            Ok(()) => {
                runtime.machine.port_held_by_interposer = false;
                true
            }
            Err(e) => {
                error!(server = %key, error = %e, "failed to release interposer port, aborting intent batch");
                false
            }
        }
    }

    async fn do_start(&mut self, key: &str) -> bool {
        let crafty_id = match self.servers.get(key) {
            Some(r) => r.crafty_server_id.clone(),
            None => return false,
        };
        match self.controller.start(&crafty_id).await {
            Ok(()) => {
                if let Some(runtime) = self.servers.get_mut(key) {
                    runtime.pending_start = false;
                    runtime.machine.on_intent_succeeded();
                }
                true
            }
            Err(ControllerError::AuthDenied) => {
                error!(server = %key, "controller denied credentials on start, shutting down");
                self.fatal_shutdown = true;
                false
            }
            Err(e) => {
                crate::metrics::record_controller_error();
                warn!(server = %key, error = %e, "start request failed, will retry next tick");
                if let Some(runtime) = self.servers.get_mut(key) {
                    runtime.pending_start = true;
                    runtime.machine.note_failure(DEGRADED_THRESHOLD);
                }
                false
            }
        }
    }

    async fn do_stop(&mut self, key: &str) -> bool {
        let crafty_id = match self.servers.get(key) {
            Some(r) => r.crafty_server_id.clone(),
            None => return false,
        };
        match self.controller.stop(&crafty_id).await {
            Ok(()) => {
                if let Some(runtime) = self.servers.get_mut(key) {
                    runtime.pending_stop = false;
                    runtime.machine.on_intent_succeeded();
                }
                true
            }
            Err(ControllerError::AuthDenied) => {
                error!(server = %key, "controller denied credentials on stop, shutting down");
                self.fatal_shutdown = true;
                false
            }
            Err(e) => {
                crate::metrics::record_controller_error();
                warn!(server = %key, error = %e, "stop request failed, will retry next tick");
                if let Some(runtime) = self.servers.get_mut(key) {
                    runtime.pending_stop = true;
                    runtime.machine.note_failure(DEGRADED_THRESHOLD);
                }
                false
            }
        }
    }

    async fn do_notify(&mut self, key: &str, event: NotifyEvent) {
        info!(server = %key, event = ?event, "lifecycle event");
        self.webhook.notify(key, event).await;
    }

    /// Retry `start`/`stop` intents that failed transiently, as long as the
    /// machine is still in the state that intent was meant to achieve
    /// (§4.6 retry policy).
    async fn retry_pending_intents(&mut self, key: &str, _now: Instant) {
        let (pending_start, pending_stop, state) = match self.servers.get(key) {
            Some(r) => (r.pending_start, r.pending_stop, r.machine.state),
            None => return,
        };

        if pending_start && state == State::Starting {
            self.do_start(key).await;
        }
        if pending_stop && state == State::Stopping {
            self.do_stop(key).await;
        }
    }

    async fn publish_status(&self) {
        let mut entries = Vec::with_capacity(self.servers.len());
        for (key, runtime) in &self.servers {
            let sample = runtime.last_sample;
            entries.push(ServerStatusEntry {
                name: key.clone(),
                state: state_label(runtime.machine.state),
                running: sample.map(|s| s.running).unwrap_or(false),
                players: sample.map(|s| s.player_count).unwrap_or(0),
                idle_since: runtime.idle_since_wall,
                degraded: runtime.machine.degraded,
                quarantined: self
                    .server_config(key)
                    .map(|cfg| runtime.machine.is_quarantined(cfg, Instant::now()))
                    .unwrap_or(false),
            });
        }
        *self.status.write().await = entries;
    }

    /// Re-read and re-validate the config file; keep the old config in
    /// effect if parsing or validation fails (`ConfigInvalid` on reload is
    /// non-fatal, §4.7).
    async fn reload(&mut self) {
        let new_config = match Config::load(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "config reload failed, keeping previous config");
                return;
            }
        };
        let new_config = Arc::new(new_config);
        info!("config reloaded");

        let now = Instant::now();
        let mut seen_keys = HashSet::new();

        for (key, server_cfg) in &new_config.servers {
            seen_keys.insert(key.clone());
            let needs_rebind = match self.servers.get(key) {
                None => true,
                Some(existing) => {
                    interposer_needs_rebind(existing.addr, existing.kind, server_cfg)
                }
            };

            if needs_rebind {
                let preserved_machine = if let Some(mut existing) = self.servers.remove(key) {
                    if let Err(e) = existing.interposer.release().await {
                        warn!(server = %key, error = %e, "failed to release interposer before reload rebind");
                    }
                    Some(existing.machine)
                } else {
                    None
                };
                let (interposer, addr) = match build_interposer(
                    key,
                    &server_cfg.crafty_server_id,
                    server_cfg,
                    self.config_tx.subscribe(),
                    self.wake_tx.clone(),
                ) {
                    Ok(v) => v,
                    Err(e) => {
                        error!(server = %key, error = %e, "failed to rebuild interposer on reload");
                        continue;
                    }
                };
                let machine = preserved_machine.unwrap_or_else(|| MachineState::new(now));
                self.servers.insert(
                    key.clone(),
                    ServerRuntime {
                        crafty_server_id: server_cfg.crafty_server_id.clone(),
                        addr,
                        kind: server_cfg.kind,
                        machine,
                        interposer,
                        idle_since_wall: None,
                        last_sample: None,
                        pending_start: false,
                        pending_stop: false,
                    },
                );
            } else if let Some(runtime) = self.servers.get_mut(key) {
                runtime.crafty_server_id = server_cfg.crafty_server_id.clone();
            }
        }

        let removed: Vec<String> = self
            .servers
            .keys()
            .filter(|k| !seen_keys.contains(*k))
            .cloned()
            .collect();
        for key in removed {
            if let Some(mut runtime) = self.servers.remove(&key) {
                if let Err(e) = runtime.interposer.release().await {
                    warn!(server = %key, error = %e, "failed to release interposer for removed server");
                }
            }
        }

        self.config = new_config.clone();
        let _ = self.config_tx.send(new_config);
        self.publish_status().await;
    }

    async fn shutdown(&mut self) {
        info!("shutting down, releasing all interposer sockets");
        for (key, runtime) in self.servers.iter_mut() {
            if let Err(e) = runtime.interposer.release().await {
                warn!(server = %key, error = %e, "error releasing interposer during shutdown");
            }
        }
    }
}

/// Whether an already-running interposer must be torn down and rebuilt for
/// a reloaded server config (§4.6: port or kind changes force a rebind;
/// display-field-only changes take effect via the config watch without one).
fn interposer_needs_rebind(existing_addr: SocketAddr, existing_kind: ServerKind, new_cfg: &ServerConfig) -> bool {
    existing_addr != new_cfg.socket_addr().unwrap_or(existing_addr) || existing_kind != new_cfg.kind
}

fn state_label(state: State) -> &'static str {
    match state {
        State::Unknown => "UNKNOWN",
        State::Online => "ONLINE",
        State::Idle => "IDLE",
        State::Starting => "STARTING",
        State::Stopping => "STOPPING",
        State::Stopped => "STOPPED",
        State::Crashed => "CRASHED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_cfg(yaml: &str) -> ServerConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn unchanged_reload_does_not_require_rebind() {
        let cfg = server_cfg(
            r#"
crafty_server_id: "abc"
listen_port: 25565
"#,
        );
        let addr = cfg.socket_addr().unwrap();
        assert!(!interposer_needs_rebind(addr, ServerKind::Java, &cfg));
    }

    #[test]
    fn display_only_change_does_not_require_rebind() {
        let cfg = server_cfg(
            r#"
crafty_server_id: "abc"
listen_port: 25565
motd: "a brand new motd"
"#,
        );
        let addr = cfg.socket_addr().unwrap();
        assert!(!interposer_needs_rebind(addr, ServerKind::Java, &cfg));
    }

    #[test]
    fn port_change_requires_rebind() {
        let cfg = server_cfg(
            r#"
crafty_server_id: "abc"
listen_port: 25566
"#,
        );
        let old_addr: SocketAddr = "0.0.0.0:25565".parse().unwrap();
        assert!(interposer_needs_rebind(old_addr, ServerKind::Java, &cfg));
    }

    #[test]
    fn kind_change_requires_rebind() {
        let cfg = server_cfg(
            r#"
crafty_server_id: "abc"
listen_port: 25565
kind: bedrock
"#,
        );
        let addr = cfg.socket_addr().unwrap();
        assert!(interposer_needs_rebind(addr, ServerKind::Java, &cfg));
    }
}
