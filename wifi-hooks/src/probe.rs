// Network state probes

//! Best-effort network state observation
//!
//! Strategies for obtaining a [`NetworkObservation`] from the OS, tried in
//! order until one produces an answer. Each backend wraps one external query
//! tool behind a narrow parse; a backend that cannot run yields a typed
//! unavailable error and the next one is tried. When every backend fails the
//! stack returns an `Unknown` observation rather than an error, so callers
//! always have a comparable value.
//!
//! Query commands run through [`CommandExecutor::execute_cached`], so a poll
//! loop and a status query landing inside the same TTL share one process
//! spawn.

use crate::error::HookError;
use crate::executor::{CommandExecutor, CommandSpec};
use crate::types::{ConnectionState, EventKind, NetworkObservation};

/// Queries NetworkManager's terse device listing
pub struct NmcliProbe;

impl NmcliProbe {
    const NAME: &'static str = "nmcli";

    fn query() -> CommandSpec {
        CommandSpec::new("nmcli", ["-t", "-f", "SSID,STATE,SIGNAL,IP4", "dev", "wifi"])
    }

    /// Parse `nmcli -t` colon-separated rows; the first `connected` row wins
    fn parse(output: &str) -> NetworkObservation {
        for line in output.lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 2 || fields[1] != "connected" {
                continue;
            }

            let mut obs = NetworkObservation::bare(ConnectionState::Connected, EventKind::Poll);
            if !fields[0].is_empty() {
                obs.ssid = Some(fields[0].to_string());
            }
            if let Some(signal) = fields.get(2).and_then(|s| s.parse::<i32>().ok()) {
                obs.signal_dbm = Some(signal);
            }
            if let Some(ip) = fields.get(3).filter(|s| !s.is_empty()) {
                obs.ip_address = Some(ip.to_string());
            }
            return obs;
        }

        NetworkObservation::bare(ConnectionState::Disconnected, EventKind::Poll)
    }
}

/// Scrapes `iwconfig` output when NetworkManager is unavailable
pub struct IwProbe;

impl IwProbe {
    const NAME: &'static str = "iwconfig";

    fn query() -> CommandSpec {
        CommandSpec::new("iwconfig", Vec::<String>::new())
    }

    fn parse(output: &str) -> NetworkObservation {
        let mut interface = None;

        for line in output.lines() {
            // Stanza headers start at column zero with the interface name
            if !line.starts_with(char::is_whitespace) {
                interface = line.split_whitespace().next().map(str::to_string);
            }

            if let Some(rest) = line.split("ESSID:").nth(1) {
                if rest.contains("off/any") {
                    continue;
                }
                let ssid = rest.trim().trim_matches('"').to_string();
                if ssid.is_empty() {
                    continue;
                }

                let mut obs =
                    NetworkObservation::bare(ConnectionState::Connected, EventKind::Poll);
                obs.ssid = Some(ssid);
                obs.interface = interface.clone();
                obs.signal_dbm = Self::parse_signal(output);
                return obs;
            }
        }

        NetworkObservation::bare(ConnectionState::Disconnected, EventKind::Poll)
    }

    /// Extract "Signal level=-54 dBm" if present anywhere in the output
    fn parse_signal(output: &str) -> Option<i32> {
        let rest = output.split("Signal level=").nth(1)?;
        let token = rest.split_whitespace().next()?;
        token.parse::<i32>().ok()
    }
}

/// One variant per query backend
pub enum ProbeBackend {
    Nmcli(NmcliProbe),
    Iw(IwProbe),
}

impl ProbeBackend {
    fn name(&self) -> &'static str {
        match self {
            ProbeBackend::Nmcli(_) => NmcliProbe::NAME,
            ProbeBackend::Iw(_) => IwProbe::NAME,
        }
    }

    async fn observe(&self, executor: &CommandExecutor) -> Result<NetworkObservation, HookError> {
        let query = match self {
            ProbeBackend::Nmcli(_) => NmcliProbe::query(),
            ProbeBackend::Iw(_) => IwProbe::query(),
        };

        let result = executor
            .execute_cached(&query)
            .await
            .map_err(|e| HookError::ProbeUnavailable {
                backend: self.name(),
                reason: e.to_string(),
            })?;

        if let Some(err) = result.error {
            return Err(HookError::ProbeUnavailable {
                backend: self.name(),
                reason: err.to_string(),
            });
        }

        Ok(match self {
            ProbeBackend::Nmcli(_) => NmcliProbe::parse(&result.output),
            ProbeBackend::Iw(_) => IwProbe::parse(&result.output),
        })
    }
}

/// Ordered probe strategies with graceful degradation
pub struct ProbeStack {
    backends: Vec<ProbeBackend>,
    executor: CommandExecutor,
}

impl ProbeStack {
    /// Stack with the default backend order: NetworkManager, then iwconfig
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            backends: vec![
                ProbeBackend::Nmcli(NmcliProbe),
                ProbeBackend::Iw(IwProbe),
            ],
            executor,
        }
    }

    /// Produce the current observation, falling back across backends
    ///
    /// Never fails: when every backend is unavailable the result has
    /// `ConnectionState::Unknown`.
    pub async fn observe(&self) -> NetworkObservation {
        for backend in &self.backends {
            match backend.observe(&self.executor).await {
                Ok(obs) => return Self::enrich(obs),
                Err(e) => log::debug!("{}", e),
            }
        }
        NetworkObservation::unknown()
    }

    /// Fill in the interface address when the backend knew the interface
    /// name but not the IP
    fn enrich(mut obs: NetworkObservation) -> NetworkObservation {
        if obs.ip_address.is_some() {
            return obs;
        }
        let Some(interface) = obs.interface.clone() else {
            return obs;
        };

        if let Ok(addrs) = if_addrs::get_if_addrs() {
            for addr in addrs {
                if addr.name == interface {
                    if let if_addrs::IfAddr::V4(v4) = addr.addr {
                        obs.ip_address = Some(v4.ip.to_string());
                        break;
                    }
                }
            }
        }
        obs
    }
}
