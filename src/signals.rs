//! Signal-to-channel bridge (§6, §9).
//!
//! `HUP` becomes a `Reload` event, `TERM`/`INT` becomes `Shutdown`; both are
//! posted onto a channel the monitor drains in its normal select loop, so
//! reload and shutdown are handled with the same ordering guarantees as
//! every other event (no signal handler runs monitor logic directly).

use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Reload,
    Shutdown,
}

/// Spawn the bridge task and return the receiving end of its channel.
pub fn spawn() -> mpsc::Receiver<ControlSignal> {
    let (tx, rx) = mpsc::channel(4);

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut interrupt =
            signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("received SIGHUP, requesting config reload");
                    if tx.send(ControlSignal::Reload).await.is_err() {
                        break;
                    }
                }
                _ = terminate.recv() => {
                    info!("received SIGTERM, requesting shutdown");
                    let _ = tx.send(ControlSignal::Shutdown).await;
                    break;
                }
                _ = interrupt.recv() => {
                    info!("received SIGINT, requesting shutdown");
                    let _ = tx.send(ControlSignal::Shutdown).await;
                    break;
                }
            }
        }
    });

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, requesting shutdown");
            let _ = tx.send(ControlSignal::Shutdown).await;
        }
    });

    rx
}
