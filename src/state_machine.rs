//! Per-server lifecycle FSM (§3, §4.5).
//!
//! The transition function is pure: `(state, event, now) -> intents`, with
//! all side effects (calling the controller, acquiring/releasing a port,
//! notifying sinks) left to the monitor loop. This keeps the guard logic
//! (idle/grace/cooldown/flap) unit-testable without any I/O.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unknown,
    Online,
    Idle,
    Starting,
    Stopping,
    Stopped,
    Crashed,
}

#[derive(Debug, Clone, Copy)]
pub struct ObservedSample {
    pub running: bool,
    pub player_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    Started,
    Stopped,
    Crashed,
    Quarantined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Stop,
    AcquirePort,
    ReleasePort,
    Notify(NotifyEvent),
}

/// A server's machine state plus the timers and bookkeeping the guards need.
#[derive(Debug, Clone)]
pub struct MachineState {
    pub state: State,
    pub idle_since: Option<Instant>,
    pub start_requested_at: Option<Instant>,
    pub stop_requested_at: Option<Instant>,
    pub last_transition_at: Instant,
    pub last_stop_at: Option<Instant>,
    /// ONLINE→STOPPING transition timestamps, newest last, pruned to the
    /// flap window on every transition.
    pub cycle_timestamps: VecDeque<Instant>,
    pub port_held_by_interposer: bool,
    pub degraded: bool,
    pub consecutive_failures: u32,
}

impl MachineState {
    pub fn new(now: Instant) -> Self {
        MachineState {
            state: State::Unknown,
            idle_since: None,
            start_requested_at: None,
            stop_requested_at: None,
            last_transition_at: now,
            last_stop_at: None,
            cycle_timestamps: VecDeque::new(),
            port_held_by_interposer: false,
            degraded: false,
            consecutive_failures: 0,
        }
    }

    fn set_state(&mut self, state: State, now: Instant) {
        self.state = state;
        self.last_transition_at = now;
    }

    /// Count of ONLINE→STOPPING transitions still inside the flap window.
    fn cycles_in_window(&self, window: Duration, now: Instant) -> usize {
        self.cycle_timestamps
            .iter()
            .filter(|ts| now.saturating_duration_since(**ts) < window)
            .count()
    }

    /// Whether the machine is currently quarantined (§4.5).
    pub fn is_quarantined(&self, cfg: &ServerConfig, now: Instant) -> bool {
        self.cycles_in_window(cfg.flap_window(), now) >= cfg.flap_threshold as usize
    }

    fn record_cycle(&mut self, cfg: &ServerConfig, now: Instant) {
        self.cycle_timestamps.push_back(now);
        let window = cfg.flap_window();
        while let Some(front) = self.cycle_timestamps.front() {
            if now.saturating_duration_since(*front) >= window {
                self.cycle_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn in_start_grace(&self, cfg: &ServerConfig, now: Instant) -> bool {
        now.saturating_duration_since(self.last_transition_at) < cfg.start_grace()
    }

    fn cooldown_elapsed(&self, cfg: &ServerConfig, now: Instant) -> bool {
        match self.last_stop_at {
            Some(at) => now.saturating_duration_since(at) >= cfg.stop_cooldown(),
            None => true,
        }
    }

    /// Feed an `observed(running, players)` sample (§4.5). Reality wins:
    /// this must be applied before any `wake_requested` queued in the same
    /// tick (tie-break rule).
    pub fn on_observed(
        &mut self,
        cfg: &ServerConfig,
        sample: ObservedSample,
        now: Instant,
    ) -> Vec<Intent> {
        match self.state {
            State::Unknown => {
                if sample.running {
                    self.set_state(State::Online, now);
                    self.idle_since = if sample.player_count == 0 {
                        Some(now)
                    } else {
                        None
                    };
                    vec![Intent::ReleasePort]
                } else {
                    self.set_state(State::Stopped, now);
                    vec![Intent::AcquirePort]
                }
            }

            State::Online | State::Idle => {
                if !sample.running {
                    self.set_state(State::Crashed, now);
                    self.idle_since = None;
                    return vec![Intent::AcquirePort, Intent::Notify(NotifyEvent::Crashed)];
                }

                if sample.player_count > 0 {
                    self.idle_since = None;
                    self.set_state(State::Online, now);
                    return vec![];
                }

                // Zero players: enter/remain IDLE and evaluate the stop guards.
                let idle_since = *self.idle_since.get_or_insert(now);
                self.set_state(State::Idle, now);

                let idle_elapsed = now.saturating_duration_since(idle_since) >= cfg.idle_timeout();
                if !idle_elapsed || self.in_start_grace(cfg, now) || !self.cooldown_elapsed(cfg, now)
                {
                    return vec![];
                }

                if self.is_quarantined(cfg, now) {
                    return vec![Intent::Notify(NotifyEvent::Quarantined)];
                }

                self.record_cycle(cfg, now);
                self.set_state(State::Stopping, now);
                self.stop_requested_at = Some(now);
                vec![Intent::Stop]
            }

            State::Stopping => {
                if !sample.running {
                    self.set_state(State::Stopped, now);
                    self.last_stop_at = Some(now);
                    self.stop_requested_at = None;
                    vec![Intent::AcquirePort, Intent::Notify(NotifyEvent::Stopped)]
                } else {
                    vec![]
                }
            }

            State::Stopped => {
                if sample.running {
                    self.set_state(State::Online, now);
                    self.idle_since = if sample.player_count == 0 {
                        Some(now)
                    } else {
                        None
                    };
                    vec![Intent::ReleasePort]
                } else {
                    vec![]
                }
            }

            State::Starting => {
                if sample.running {
                    self.set_state(State::Online, now);
                    self.idle_since = None;
                    self.start_requested_at = None;
                    vec![]
                } else {
                    vec![]
                }
            }

            State::Crashed => {
                if sample.running {
                    self.set_state(State::Online, now);
                    self.idle_since = if sample.player_count == 0 {
                        Some(now)
                    } else {
                        None
                    };
                    vec![Intent::ReleasePort]
                } else {
                    vec![]
                }
            }
        }
    }

    /// Feed a `wake_requested` trigger (player attempted to connect while
    /// stopped). Must be applied after `on_observed` for the same tick.
    pub fn on_wake_requested(&mut self, cfg: &ServerConfig, now: Instant) -> Vec<Intent> {
        match self.state {
            State::Stopped | State::Crashed => {
                if !self.cooldown_elapsed(cfg, now) {
                    return vec![];
                }
                self.set_state(State::Starting, now);
                self.start_requested_at = Some(now);
                vec![
                    Intent::ReleasePort,
                    Intent::Start,
                    Intent::Notify(NotifyEvent::Started),
                ]
            }
            _ => vec![],
        }
    }

    /// Check STARTING/STOPPING timeouts on a bare tick with no new sample
    /// (§3 invariants: STARTING/STOPPING persist at most their timeout).
    pub fn on_tick_timeout_check(&mut self, cfg: &ServerConfig, now: Instant) -> Vec<Intent> {
        match self.state {
            State::Starting => {
                let started = self.start_requested_at.unwrap_or(self.last_transition_at);
                if now.saturating_duration_since(started) > cfg.start_timeout() {
                    self.set_state(State::Crashed, now);
                    self.start_requested_at = None;
                    vec![Intent::AcquirePort, Intent::Notify(NotifyEvent::Crashed)]
                } else {
                    vec![]
                }
            }
            State::Stopping => {
                let requested = self.stop_requested_at.unwrap_or(self.last_transition_at);
                if now.saturating_duration_since(requested) > cfg.stop_timeout() {
                    self.set_state(State::Crashed, now);
                    self.stop_requested_at = None;
                    vec![Intent::AcquirePort, Intent::Notify(NotifyEvent::Crashed)]
                } else {
                    vec![]
                }
            }
            _ => vec![],
        }
    }

    pub fn on_start_failed(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn on_stop_failed(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn on_intent_succeeded(&mut self) {
        self.consecutive_failures = 0;
        self.degraded = false;
    }

    /// Surface the `degraded` flag once repeated intent failures pile up
    /// (§4.6, default threshold 5).
    pub fn note_failure(&mut self, degraded_threshold: u32) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= degraded_threshold {
            self.degraded = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg() -> ServerConfig {
        let yaml = r#"
crafty_server_id: "abc"
listen_port: 25565
idle_timeout_minutes: 10
start_timeout_seconds: 180
stop_timeout_seconds: 120
stop_cooldown_seconds: 60
start_grace_seconds: 120
flap_threshold: 3
flap_window_seconds: 3600
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    fn sample(running: bool, players: u32) -> ObservedSample {
        ObservedSample {
            running,
            player_count: players,
        }
    }

    #[test]
    fn unknown_to_stopped_acquires_port() {
        let mut m = MachineState::new(Instant::now());
        let intents = m.on_observed(&cfg(), sample(false, 0), Instant::now());
        assert_eq!(m.state, State::Stopped);
        assert_eq!(intents, vec![Intent::AcquirePort]);
    }

    #[test]
    fn unknown_to_online_releases_port() {
        let mut m = MachineState::new(Instant::now());
        let intents = m.on_observed(&cfg(), sample(true, 2), Instant::now());
        assert_eq!(m.state, State::Online);
        assert_eq!(intents, vec![Intent::ReleasePort]);
    }

    #[test]
    fn idle_lower_bound_respected() {
        let cfg = cfg();
        let mut m = MachineState::new(Instant::now());
        m.on_observed(&cfg, sample(true, 0), Instant::now());
        assert_eq!(m.state, State::Idle);

        // Not enough time has passed: must not stop yet.
        let soon = Instant::now();
        let intents = m.on_observed(&cfg, sample(true, 0), soon);
        assert!(!intents.contains(&Intent::Stop));
    }

    #[test]
    fn idle_shutdown_after_timeout() {
        let cfg = cfg();
        let start = Instant::now();
        let mut m = MachineState::new(start);
        m.state = State::Online;
        m.idle_since = Some(start);
        m.last_transition_at = start - cfg.start_grace() - Duration::from_secs(1);

        let later = start + cfg.idle_timeout() + Duration::from_secs(1);
        let intents = m.on_observed(&cfg, sample(true, 0), later);
        assert_eq!(intents, vec![Intent::Stop]);
        assert_eq!(m.state, State::Stopping);
    }

    #[test]
    fn players_reset_idle_since() {
        let cfg = cfg();
        let start = Instant::now();
        let mut m = MachineState::new(start);
        m.state = State::Idle;
        m.idle_since = Some(start);

        let ten_seconds_later = start + Duration::from_secs(10);
        m.on_observed(&cfg, sample(true, 1), ten_seconds_later);
        assert_eq!(m.state, State::Online);
        assert!(m.idle_since.is_none());
    }

    #[test]
    fn flap_guard_quarantines_after_threshold() {
        let cfg = cfg();
        let mut m = MachineState::new(Instant::now());
        let base = Instant::now();

        // Simulate three ONLINE->STOPPING cycles inside the flap window.
        for _ in 0..3 {
            m.record_cycle(&cfg, base);
        }
        assert!(m.is_quarantined(&cfg, base));

        // A fourth idle condition should not emit `stop`.
        m.state = State::Online;
        m.idle_since = Some(base);
        m.last_transition_at = base - cfg.start_grace() - Duration::from_secs(1);
        let later = base + cfg.idle_timeout() + Duration::from_secs(1);
        let intents = m.on_observed(&cfg, sample(true, 0), later);
        assert!(!intents.contains(&Intent::Stop));
        assert_eq!(intents, vec![Intent::Notify(NotifyEvent::Quarantined)]);
    }

    #[test]
    fn starting_timeout_becomes_crashed() {
        let cfg = cfg();
        let start = Instant::now();
        let mut m = MachineState::new(start);
        m.state = State::Starting;
        m.start_requested_at = Some(start);

        let later = start + cfg.start_timeout() + Duration::from_secs(1);
        let intents = m.on_tick_timeout_check(&cfg, later);
        assert_eq!(m.state, State::Crashed);
        assert!(intents.contains(&Intent::AcquirePort));
    }

    #[test]
    fn stopping_timeout_becomes_crashed() {
        let cfg = cfg();
        let start = Instant::now();
        let mut m = MachineState::new(start);
        m.state = State::Stopping;
        m.stop_requested_at = Some(start);

        let later = start + cfg.stop_timeout() + Duration::from_secs(1);
        let intents = m.on_tick_timeout_check(&cfg, later);
        assert_eq!(m.state, State::Crashed);
        assert!(intents.contains(&Intent::AcquirePort));
    }

    #[test]
    fn cooldown_blocks_wake_after_stop() {
        let cfg = cfg();
        let start = Instant::now();
        let mut m = MachineState::new(start);
        m.state = State::Stopped;
        m.last_stop_at = Some(start);

        let soon = start + Duration::from_secs(1);
        let intents = m.on_wake_requested(&cfg, soon);
        assert!(intents.is_empty());
        assert_eq!(m.state, State::Stopped);

        let later = start + cfg.stop_cooldown() + Duration::from_secs(1);
        let intents = m.on_wake_requested(&cfg, later);
        assert!(intents.contains(&Intent::Start));
        assert_eq!(m.state, State::Starting);
    }

    #[test]
    fn online_crash_detected_on_unexpected_stop() {
        let cfg = cfg();
        let mut m = MachineState::new(Instant::now());
        m.state = State::Online;
        let intents = m.on_observed(&cfg, sample(false, 0), Instant::now());
        assert_eq!(m.state, State::Crashed);
        assert!(intents.contains(&Intent::Notify(NotifyEvent::Crashed)));
    }

    #[test]
    fn reload_with_unchanged_config_produces_no_transitions() {
        // A pure-value FSM naturally has this property: calling no methods
        // produces no state change. This test documents the invariant the
        // monitor's reload path relies on (§8: Reload stability).
        let mut m = MachineState::new(Instant::now());
        m.state = State::Online;
        let before = m.state;
        let _unused: HashMap<(), ()> = HashMap::new();
        assert_eq!(m.state, before);
    }

    proptest::proptest! {
        /// `idle_since` must only ever be set while the machine is in a
        /// state that can legitimately be "idle" (§3 invariant).
        #[test]
        fn idle_since_only_set_while_online_or_idle(
            steps in proptest::collection::vec((proptest::bool::ANY, 0u32..3), 1..40),
        ) {
            let cfg = cfg();
            let start = Instant::now();
            let mut m = MachineState::new(start);
            let mut now = start;

            for (running, players) in steps {
                now += Duration::from_secs(1);
                m.on_observed(&cfg, sample(running, players), now);
                m.on_tick_timeout_check(&cfg, now);

                if m.idle_since.is_some() {
                    proptest::prop_assert!(matches!(m.state, State::Online | State::Idle));
                }
            }
        }

        /// `STARTING`/`STOPPING` never persist past their configured
        /// timeout once a tick has had the chance to observe it (§3, §8
        /// Timeout safety).
        #[test]
        fn starting_and_stopping_are_bounded_by_timeout(extra_secs in 1u64..300) {
            let cfg = cfg();
            let start = Instant::now();

            let mut starting = MachineState::new(start);
            starting.state = State::Starting;
            starting.start_requested_at = Some(start);
            let past_timeout = start + cfg.start_timeout() + Duration::from_secs(extra_secs);
            starting.on_tick_timeout_check(&cfg, past_timeout);
            proptest::prop_assert_eq!(starting.state, State::Crashed);

            let mut stopping = MachineState::new(start);
            stopping.state = State::Stopping;
            stopping.stop_requested_at = Some(start);
            let past_timeout = start + cfg.stop_timeout() + Duration::from_secs(extra_secs);
            stopping.on_tick_timeout_check(&cfg, past_timeout);
            proptest::prop_assert_eq!(stopping.state, State::Crashed);
        }
    }
}
