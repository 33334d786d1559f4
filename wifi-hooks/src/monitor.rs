// Event monitor: merges poll and push producers into one queue

//! Network event monitoring
//!
//! Merges independent observation producers into a single deduplicated event
//! queue for the dispatcher:
//!
//! - the poll producer asks the probe stack on a fixed interval and is always
//!   running as a fallback;
//! - the push producer follows a long-lived `nmcli monitor` subprocess and
//!   parses its `interface: status (detail)` lines, dropping anything that
//!   does not match the grammar.
//!
//! Both producers pass candidate observations through a shared dedup gate: an
//! observation is forwarded only when its (ssid, state) pair differs from the
//! last forwarded one. Signal, frequency, or address-only updates never wake
//! the dispatcher.
//!
//! Shutdown is a watch signal every producer checks before each send; the
//! queue closes only once every producer has exited and dropped its sender.

use crate::error::HookError;
use crate::probe::ProbeStack;
use crate::types::{ConnectionState, EventKind, NetworkObservation};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Size of the shared observation queue
pub const EVENT_QUEUE_SIZE: usize = 32;

/// Parse one push-source line of the form `interface: status (detail)`
///
/// Status must be exactly `connected`, `connecting`, or `disconnected`;
/// everything else is an error the caller drops.
pub fn parse_event_line(line: &str) -> Result<NetworkObservation, HookError> {
    let parse_err = || HookError::Parse {
        line: line.to_string(),
    };

    let (interface, rest) = line.split_once(':').ok_or_else(parse_err)?;
    let interface = interface.trim();
    let status = rest.trim();
    if interface.is_empty() || interface.contains(char::is_whitespace) || status.is_empty() {
        return Err(parse_err());
    }

    // The status word ends where an optional " (detail)" suffix begins
    let word = status.split(" (").next().unwrap_or(status).trim();
    let (state, kind) = match word {
        "connected" => (ConnectionState::Connected, EventKind::Push),
        "connecting" => (ConnectionState::Connecting, EventKind::Connect),
        "disconnected" => (ConnectionState::Disconnected, EventKind::Disconnect),
        _ => return Err(parse_err()),
    };

    let mut obs = NetworkObservation::bare(state, kind);
    obs.interface = Some(interface.to_string());
    Ok(obs)
}

/// Shared change detector over the last forwarded (ssid, state) pair
///
/// Read-mostly: producers take the read lock to compare, and only the
/// producer that actually forwards takes the write lock.
pub struct DedupGate {
    last: RwLock<Option<(Option<String>, ConnectionState)>>,
}

impl DedupGate {
    pub fn new() -> Self {
        Self {
            last: RwLock::new(None),
        }
    }

    /// Returns the observation if it should be forwarded, `None` if it
    /// duplicates the last forwarded one
    ///
    /// A forwarded observation that stays connected while the SSID changes is
    /// upgraded to [`EventKind::Change`].
    pub async fn admit(&self, mut obs: NetworkObservation) -> Option<NetworkObservation> {
        let key = (obs.ssid.clone(), obs.state);

        {
            let last = self.last.read().await;
            if last.as_ref() == Some(&key) {
                return None;
            }
        }

        let mut last = self.last.write().await;
        // Re-check: another producer may have forwarded the same pair while
        // we waited for the write lock
        if last.as_ref() == Some(&key) {
            return None;
        }

        if let Some((prev_ssid, prev_state)) = last.as_ref() {
            let switched_network = *prev_state == ConnectionState::Connected
                && obs.state == ConnectionState::Connected
                && *prev_ssid != key.0;
            if switched_network {
                obs.kind = EventKind::Change;
            }
        }

        *last = Some(key);
        Some(obs)
    }
}

impl Default for DedupGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Monitor tuning from the global config block and CLI flags
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub poll_interval: Duration,
    /// Also run the push producer (the poll producer always runs)
    pub use_events: bool,
}

/// Merges observation producers into one deduplicated queue
pub struct EventMonitor {
    probe: Arc<ProbeStack>,
    options: MonitorOptions,
}

/// Controls a running monitor's producers
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    producers: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signal every producer and wait for each to exit
    ///
    /// The observation queue yields `None` only after this completes, because
    /// the last sender is dropped by the last exiting producer.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for producer in self.producers {
            let _ = producer.await;
        }
    }
}

impl EventMonitor {
    pub fn new(probe: ProbeStack, options: MonitorOptions) -> Self {
        Self {
            probe: Arc::new(probe),
            options,
        }
    }

    /// Spawn the producers and return the event queue plus a handle for
    /// shutting them down
    pub fn start(self) -> (mpsc::Receiver<NetworkObservation>, MonitorHandle) {
        let (tx, rx) = mpsc::channel::<NetworkObservation>(EVENT_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let gate = Arc::new(DedupGate::new());

        let mut producers = Vec::new();

        producers.push(tokio::spawn(poll_producer(
            self.probe.clone(),
            self.options.poll_interval,
            tx.clone(),
            shutdown_rx.clone(),
            gate.clone(),
        )));

        if self.options.use_events {
            producers.push(tokio::spawn(push_producer(
                self.probe,
                tx,
                shutdown_rx,
                gate,
            )));
        }

        (
            rx,
            MonitorHandle {
                shutdown: shutdown_tx,
                producers,
            },
        )
    }
}

async fn poll_producer(
    probe: Arc<ProbeStack>,
    poll_interval: Duration,
    tx: mpsc::Sender<NetworkObservation>,
    mut shutdown: watch::Receiver<bool>,
    gate: Arc<DedupGate>,
) {
    let mut ticker = interval(poll_interval);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let obs = probe.observe().await;
                if *shutdown.borrow() {
                    break;
                }
                if let Some(obs) = gate.admit(obs).await {
                    log::debug!("poll: forwarding {} event: {}", obs.kind.as_str(), obs);
                    if tx.send(obs).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    log::debug!("poll producer exited");
}

async fn push_producer(
    probe: Arc<ProbeStack>,
    tx: mpsc::Sender<NetworkObservation>,
    mut shutdown: watch::Receiver<bool>,
    gate: Arc<DedupGate>,
) {
    let mut child = match Command::new("nmcli")
        .arg("monitor")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            log::warn!("event stream unavailable ({}), relying on polling", e);
            return;
        }
    };

    let Some(stdout) = child.stdout.take() else {
        log::warn!("event stream has no stdout, relying on polling");
        let _ = child.start_kill();
        return;
    };
    let mut lines = BufReader::new(stdout).lines();

    log::debug!("push producer attached to event stream");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        // Lines outside the grammar are dropped, never fatal
                        let Ok(parsed) = parse_event_line(&line) else {
                            continue;
                        };

                        let obs = if parsed.state == ConnectionState::Connected {
                            // The line itself carries no SSID; ask the probe
                            let mut current = probe.observe().await.with_kind(EventKind::Push);
                            if current.interface.is_none() {
                                current.interface = parsed.interface;
                            }
                            current
                        } else {
                            parsed
                        };

                        if *shutdown.borrow() {
                            break;
                        }
                        if let Some(obs) = gate.admit(obs).await {
                            log::debug!("push: forwarding {} event: {}", obs.kind.as_str(), obs);
                            if tx.send(obs).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        log::warn!("event stream ended, relying on polling");
                        break;
                    }
                    Err(e) => {
                        log::warn!("event stream read failed ({}), relying on polling", e);
                        break;
                    }
                }
            }
        }
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
    log::debug!("push producer exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandExecutor;

    fn connected(ssid: &str) -> NetworkObservation {
        let mut obs = NetworkObservation::bare(ConnectionState::Connected, EventKind::Poll);
        obs.ssid = Some(ssid.to_string());
        obs
    }

    #[test]
    fn test_parse_connected_with_detail() {
        let obs = parse_event_line("wlan0: connected (local only)").unwrap();
        assert_eq!(obs.state, ConnectionState::Connected);
        assert_eq!(obs.kind, EventKind::Push);
        assert_eq!(obs.interface.as_deref(), Some("wlan0"));
    }

    #[test]
    fn test_parse_disconnected_is_not_connected() {
        // "disconnected" contains "connected" as a substring; the word must
        // be matched exactly
        let obs = parse_event_line("wlan0: disconnected").unwrap();
        assert_eq!(obs.state, ConnectionState::Disconnected);
        assert_eq!(obs.kind, EventKind::Disconnect);
    }

    #[test]
    fn test_parse_connecting() {
        let obs = parse_event_line("wlan0: connecting (getting IP configuration)").unwrap();
        assert_eq!(obs.state, ConnectionState::Connecting);
        assert_eq!(obs.kind, EventKind::Connect);
    }

    #[test]
    fn test_parse_rejects_unmatched_lines() {
        assert!(parse_event_line("").is_err());
        assert!(parse_event_line("Connectivity is now 'full'").is_err());
        assert!(parse_event_line("wlan0: using connection 'HomeWiFi'").is_err());
        assert!(parse_event_line(": connected").is_err());
        assert!(parse_event_line("wlan0:").is_err());
        assert!(parse_event_line("two words: connected").is_err());
    }

    #[tokio::test]
    async fn test_gate_suppresses_repeats() {
        let gate = DedupGate::new();

        assert!(gate.admit(connected("A")).await.is_some());
        assert!(gate.admit(connected("A")).await.is_none());
        let forwarded = gate.admit(connected("B")).await.unwrap();
        assert_eq!(forwarded.ssid.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_gate_upgrades_network_switch_to_change() {
        let gate = DedupGate::new();

        let first = gate.admit(connected("A")).await.unwrap();
        assert_eq!(first.kind, EventKind::Poll);

        let second = gate.admit(connected("B")).await.unwrap();
        assert_eq!(second.kind, EventKind::Change);
    }

    #[tokio::test]
    async fn test_gate_signal_only_update_is_suppressed() {
        let gate = DedupGate::new();

        let mut strong = connected("A");
        strong.signal_dbm = Some(-40);
        let mut weak = connected("A");
        weak.signal_dbm = Some(-80);

        assert!(gate.admit(weak).await.is_some());
        assert!(gate.admit(strong).await.is_none());
    }

    #[tokio::test]
    async fn test_gate_disconnect_then_reconnect_is_not_a_change() {
        let gate = DedupGate::new();

        gate.admit(connected("A")).await.unwrap();
        let down = gate
            .admit(NetworkObservation::bare(
                ConnectionState::Disconnected,
                EventKind::Disconnect,
            ))
            .await
            .unwrap();
        assert_eq!(down.kind, EventKind::Disconnect);

        let up = gate.admit(connected("A")).await.unwrap();
        assert_eq!(up.kind, EventKind::Poll);
    }

    #[tokio::test]
    async fn test_monitor_dedups_and_joins_on_shutdown() {
        // A closed executor makes every probe backend unavailable, so the
        // poll producer emits a stream of identical Unknown observations
        let executor = CommandExecutor::new(1, Duration::from_secs(1));
        executor.close();
        let probe = ProbeStack::new(executor);

        let monitor = EventMonitor::new(
            probe,
            MonitorOptions {
                poll_interval: Duration::from_millis(20),
                use_events: false,
            },
        );
        let (mut rx, handle) = monitor.start();

        // Exactly one Unknown observation gets through the gate
        let first = rx.recv().await.unwrap();
        assert_eq!(first.state, ConnectionState::Unknown);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        // After shutdown every producer has dropped its sender
        handle.shutdown().await;
        assert!(rx.recv().await.is_none());
    }
}
