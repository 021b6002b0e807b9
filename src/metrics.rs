//! Prometheus exposition (§4.9, §6, ambient).
//!
//! Thin wrapper over the `metrics` facade and `metrics-exporter-prometheus`
//! recorder: the monitor loop calls the `record_*` helpers as transitions
//! and intents happen, and the `/metrics` HTTP handler renders whatever the
//! recorder has accumulated.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::state_machine::State;

/// Install the global Prometheus recorder and return a handle whose
/// `render()` produces the text exposition body for `/metrics`.
pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder")
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

const ALL_STATES: [State; 7] = [
    State::Unknown,
    State::Online,
    State::Idle,
    State::Starting,
    State::Stopping,
    State::Stopped,
    State::Crashed,
];

/// `csw_state{server,state}` gauge: 1 on the current state, 0 on every
/// other state, so a PromQL `sum by (state)` reads naturally.
pub fn record_state(server: &str, current: State) {
    for state in ALL_STATES {
        let value = if state == current { 1.0 } else { 0.0 };
        metrics::gauge!("csw_state", "server" => server.to_string(), "state" => state_label(state))
            .set(value);
    }
}

/// `csw_players{server}` gauge.
pub fn record_players(server: &str, player_count: u32) {
    metrics::gauge!("csw_players", "server" => server.to_string()).set(player_count as f64);
}

/// `csw_transitions_total{server,from,to}` counter.
pub fn record_transition(server: &str, from: State, to: State) {
    metrics::counter!(
        "csw_transitions_total",
        "server" => server.to_string(),
        "from" => state_label(from),
        "to" => state_label(to),
    )
    .increment(1);
}

/// `csw_controller_errors_total` counter.
pub fn record_controller_error() {
    metrics::counter!("csw_controller_errors_total").increment(1);
}

/// `csw_wake_requests_total{server}` counter.
pub fn record_wake_request(server: &str) {
    metrics::counter!("csw_wake_requests_total", "server" => server.to_string()).increment(1);
}
