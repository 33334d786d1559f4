// Rule dispatcher

//! Observation-to-action dispatch
//!
//! The dispatcher drains the monitor's event queue one observation at a time,
//! evaluates every configured rule in declared order, and executes matches
//! through the shared [`CommandExecutor`]. A rule's commands always run
//! sequentially within the rule, bounded by its execution timeout; whether
//! the *dispatcher* waits for the rule depends on its concurrency mode.
//! Failure policies are applied per rule after completion or timeout.
//!
//! A session moves Idle → Watching → Draining → Stopped. Draining is entered
//! on queue closure (external cancellation) or on an abort-policy failure; it
//! stops consuming observations and joins in-flight concurrent rules without
//! cancelling them.

use crate::config::{ActionRule, FailurePolicy, DEFAULT_HOOK_TIMEOUT};
use crate::error::HookError;
use crate::executor::CommandExecutor;
use crate::state_file;
use crate::types::NetworkObservation;
use anyhow::Result;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

/// Lifecycle of one dispatch session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Constructed, not yet running
    Idle,
    /// Producers running, queue being drained
    Watching,
    /// No longer accepting observations, awaiting in-flight actions
    Draining,
    /// Session over
    Stopped,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Watching => "watching",
            SessionPhase::Draining => "draining",
            SessionPhase::Stopped => "stopped",
        }
    }
}

/// Dispatch tuning from the global config block and CLI flags
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Extra attempts for a failing command before the rule counts as failed
    pub max_retries: u32,
    /// Log matched commands instead of executing them
    pub dry_run: bool,
    /// Mirror session phase into the runtime state file
    pub write_state: bool,
    /// Timeout for rules that do not set their own
    pub default_timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_retries: 0,
            dry_run: false,
            write_state: false,
            default_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }
}

/// Matches observations against the rule set and runs matching actions
pub struct Dispatcher {
    rules: Vec<ActionRule>,
    executor: CommandExecutor,
    options: DispatchOptions,
    phase: SessionPhase,
    last_observation: Option<NetworkObservation>,
    /// Names of concurrent rules currently running (observability only)
    in_flight: HashSet<String>,
}

/// What a finished rule reports back: name, its policy, and the outcome
type RuleCompletion = (String, FailurePolicy, Result<(), HookError>);

impl Dispatcher {
    pub fn new(rules: Vec<ActionRule>, executor: CommandExecutor, options: DispatchOptions) -> Self {
        Self {
            rules,
            executor,
            options,
            phase: SessionPhase::Idle,
            last_observation: None,
            in_flight: HashSet::new(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn last_observation(&self) -> Option<&NetworkObservation> {
        self.last_observation.as_ref()
    }

    pub fn in_flight(&self) -> &HashSet<String> {
        &self.in_flight
    }

    /// Drain the queue until it closes or an abort-policy failure fires,
    /// then join in-flight concurrent rules and stop
    ///
    /// Returns an error only for an abort: the session then exits non-zero.
    pub async fn run(&mut self, mut rx: mpsc::Receiver<NetworkObservation>) -> Result<()> {
        self.set_phase(SessionPhase::Watching);

        let mut running: JoinSet<RuleCompletion> = JoinSet::new();
        let mut aborted: Option<String> = None;

        loop {
            tokio::select! {
                maybe_obs = rx.recv() => match maybe_obs {
                    Some(obs) => {
                        if let Some(rule) = self.handle_observation(obs, &mut running).await {
                            aborted = Some(rule);
                            break;
                        }
                    }
                    // Every producer has exited; nothing more will arrive
                    None => break,
                },
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Some(rule) = self.settle(joined) {
                        aborted = Some(rule);
                        break;
                    }
                }
            }
        }

        self.set_phase(SessionPhase::Draining);

        // Join what is still running; policies still apply but a late abort
        // cannot make the session any more stopped than it already is
        while let Some(joined) = running.join_next().await {
            let _ = self.settle(joined);
        }

        self.set_phase(SessionPhase::Stopped);

        if let Some(rule) = aborted {
            anyhow::bail!("action '{}' failed with on_failure = abort", rule);
        }
        Ok(())
    }

    /// Evaluate every rule against one observation; returns the rule name
    /// when an abort-policy failure should end the session
    async fn handle_observation(
        &mut self,
        obs: NetworkObservation,
        running: &mut JoinSet<RuleCompletion>,
    ) -> Option<String> {
        log::info!("network change: {} [{}]", obs, obs.kind.as_str());
        self.last_observation = Some(obs.clone());
        self.write_state_file();

        for rule in &self.rules {
            if !rule_matches(rule, &obs) {
                continue;
            }

            log::info!("action '{}' matched", rule.name);
            if !rule.description.is_empty() {
                log::debug!("  {}", rule.description);
            }

            let executor = self.executor.clone();
            let name = rule.name.clone();
            let policy = rule.on_failure;
            let commands = rule.commands.clone();
            let timeout = rule.timeout.unwrap_or(self.options.default_timeout);
            let max_retries = self.options.max_retries;
            let dry_run = self.options.dry_run;

            if rule.concurrent {
                self.in_flight.insert(name.clone());
                running.spawn(async move {
                    let outcome =
                        run_rule(&executor, &name, &commands, timeout, max_retries, dry_run).await;
                    (name, policy, outcome)
                });
            } else {
                let outcome =
                    run_rule(&executor, &name, &commands, timeout, max_retries, dry_run).await;
                if let Some(abort) = apply_policy(&name, policy, outcome) {
                    return Some(abort);
                }
            }
        }

        None
    }

    /// Apply the policy of a joined concurrent rule
    fn settle(&mut self, joined: Result<RuleCompletion, JoinError>) -> Option<String> {
        match joined {
            Err(e) => {
                log::error!("action task panicked: {}", e);
                None
            }
            Ok((name, policy, outcome)) => {
                self.in_flight.remove(&name);
                apply_policy(&name, policy, outcome)
            }
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        log::debug!("session: {} -> {}", self.phase.as_str(), phase.as_str());
        self.phase = phase;
        self.write_state_file();
    }

    fn write_state_file(&self) {
        if !self.options.write_state {
            return;
        }
        let ssid = self
            .last_observation
            .as_ref()
            .and_then(|obs| obs.ssid.as_deref());
        if let Err(e) = state_file::write_state(self.phase.as_str(), ssid) {
            log::warn!("failed to write state file: {}", e);
        }
    }
}

/// A rule matches iff every non-empty condition field accepts the observation
pub fn rule_matches(rule: &ActionRule, obs: &NetworkObservation) -> bool {
    let conditions = &rule.conditions;

    if !list_matches(&conditions.ssid, obs.ssid.as_deref()) {
        return false;
    }
    if !list_matches(&conditions.interface, obs.interface.as_deref()) {
        return false;
    }
    if !conditions.state.is_empty()
        && !conditions.state.iter().any(|s| s == obs.state.as_str())
    {
        return false;
    }
    if !conditions.event_type.is_empty()
        && !conditions.event_type.iter().any(|k| k == obs.kind.as_str())
    {
        return false;
    }
    if let Some(min) = conditions.signal_min {
        // An observation without a signal reading fails the bound
        match obs.signal_dbm {
            Some(signal) if signal >= min => {}
            _ => return false,
        }
    }

    true
}

/// Empty list matches everything; otherwise the observation must have a
/// value contained in the list
fn list_matches(list: &[String], value: Option<&str>) -> bool {
    if list.is_empty() {
        return true;
    }
    match value {
        Some(v) => list.iter().any(|entry| entry == v),
        None => false,
    }
}

/// Run one rule's commands sequentially inside its timeout scope
async fn run_rule(
    executor: &CommandExecutor,
    name: &str,
    commands: &[String],
    timeout: Duration,
    max_retries: u32,
    dry_run: bool,
) -> Result<(), HookError> {
    if dry_run {
        for command in commands {
            log::info!("[dry-run] {}: {}", name, command);
        }
        return Ok(());
    }

    match tokio::time::timeout(timeout, run_commands(executor, name, commands, max_retries)).await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(HookError::ActionTimeout {
            rule: name.to_string(),
            timeout,
        }),
    }
}

async fn run_commands(
    executor: &CommandExecutor,
    name: &str,
    commands: &[String],
    max_retries: u32,
) -> Result<(), HookError> {
    for command in commands {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match executor.execute_shell(command).await {
                Ok(result) => result,
                // The executor refused the call (closed during shutdown)
                Err(e) => {
                    return Err(HookError::CommandSpawn {
                        command: command.clone(),
                        source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                    })
                }
            };

            match result.error {
                None => {
                    log::debug!("{}: '{}' completed in {:?}", name, command, result.duration);
                    break;
                }
                Some(err) if attempt <= max_retries => {
                    log::debug!(
                        "{}: '{}' failed ({}), retry {}/{}",
                        name,
                        command,
                        err,
                        attempt,
                        max_retries
                    );
                }
                Some(err) => return Err(err),
            }
        }
    }
    Ok(())
}

/// Returns the rule name when an abort should end the session
fn apply_policy(
    name: &str,
    policy: FailurePolicy,
    outcome: Result<(), HookError>,
) -> Option<String> {
    match outcome {
        Ok(()) => {
            log::debug!("action '{}' completed", name);
            None
        }
        Err(err) => match policy {
            FailurePolicy::Ignore => None,
            FailurePolicy::Warn => {
                log::warn!("action '{}' failed: {}", name, err);
                None
            }
            FailurePolicy::Abort => {
                log::error!("action '{}' failed (on_failure = abort): {}", name, err);
                Some(name.to_string())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConditionSet;
    use crate::executor::DEFAULT_CACHE_TTL;
    use crate::monitor::DedupGate;
    use crate::types::{ConnectionState, EventKind};
    use std::path::PathBuf;
    use std::time::Instant;

    fn rule(name: &str, commands: &[&str]) -> ActionRule {
        ActionRule {
            name: name.to_string(),
            description: String::new(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            timeout: Some(Duration::from_secs(10)),
            concurrent: false,
            on_failure: FailurePolicy::Warn,
            conditions: ConditionSet::default(),
        }
    }

    fn observation(ssid: Option<&str>, state: ConnectionState, kind: EventKind) -> NetworkObservation {
        let mut obs = NetworkObservation::bare(state, kind);
        obs.ssid = ssid.map(str::to_string);
        obs
    }

    fn connected(ssid: &str) -> NetworkObservation {
        observation(Some(ssid), ConnectionState::Connected, EventKind::Connect)
    }

    fn marker_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "wifi-hooks-dispatch-{}-{}",
            std::process::id(),
            name
        ))
    }

    fn marker_lines(path: &PathBuf) -> usize {
        std::fs::read_to_string(path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    async fn run_session(rules: Vec<ActionRule>, observations: Vec<NetworkObservation>) -> Result<()> {
        let executor = CommandExecutor::new(4, DEFAULT_CACHE_TTL);
        let mut dispatcher = Dispatcher::new(rules, executor, DispatchOptions::default());

        let (tx, rx) = mpsc::channel(16);
        for obs in observations {
            tx.send(obs).await.expect("queue full in test");
        }
        drop(tx);

        dispatcher.run(rx).await
    }

    #[test]
    fn test_ssid_and_state_conditions_and_together() {
        let mut r = rule("office", &["true"]);
        r.conditions.ssid = vec!["OfficeWiFi".to_string()];
        r.conditions.state = vec!["connected".to_string()];

        assert!(rule_matches(&r, &connected("OfficeWiFi")));
        assert!(!rule_matches(&r, &connected("HomeWiFi")));
        assert!(!rule_matches(
            &r,
            &observation(
                Some("OfficeWiFi"),
                ConnectionState::Disconnected,
                EventKind::Disconnect
            )
        ));
    }

    #[test]
    fn test_empty_ssid_list_matches_any_ssid() {
        let mut r = rule("any-network", &["true"]);
        r.conditions.state = vec!["connected".to_string()];

        assert!(rule_matches(&r, &connected("OfficeWiFi")));
        assert!(rule_matches(&r, &connected("HomeWiFi")));
    }

    #[test]
    fn test_unconstrained_rule_matches_everything() {
        let r = rule("always", &["true"]);
        assert!(rule_matches(&r, &connected("A")));
        assert!(rule_matches(&r, &NetworkObservation::unknown()));
    }

    #[test]
    fn test_event_type_condition() {
        let mut r = rule("on-connect", &["true"]);
        r.conditions.event_type = vec!["connect".to_string(), "change".to_string()];

        assert!(rule_matches(&r, &connected("A")));
        let polled = observation(Some("A"), ConnectionState::Connected, EventKind::Poll);
        assert!(!rule_matches(&r, &polled));
    }

    #[test]
    fn test_interface_condition_requires_known_interface() {
        let mut r = rule("wired", &["true"]);
        r.conditions.interface = vec!["wlan0".to_string()];

        let mut on_wlan = connected("A");
        on_wlan.interface = Some("wlan0".to_string());
        assert!(rule_matches(&r, &on_wlan));

        let mut on_other = connected("A");
        on_other.interface = Some("wlp3s0".to_string());
        assert!(!rule_matches(&r, &on_other));

        // Observation without interface data cannot satisfy the list
        assert!(!rule_matches(&r, &connected("A")));
    }

    #[test]
    fn test_signal_min_bound() {
        let mut r = rule("good-signal", &["true"]);
        r.conditions.signal_min = Some(-70);

        let mut strong = connected("A");
        strong.signal_dbm = Some(-55);
        assert!(rule_matches(&r, &strong));

        let mut weak = connected("A");
        weak.signal_dbm = Some(-82);
        assert!(!rule_matches(&r, &weak));

        // No reading fails the bound
        assert!(!rule_matches(&r, &connected("A")));
    }

    #[tokio::test]
    async fn test_warn_policy_keeps_session_running() {
        let marker = marker_path("warn");
        let _ = std::fs::remove_file(&marker);

        let mut failing = rule("failing", &["sh -c 'exit 1'"]);
        failing.on_failure = FailurePolicy::Warn;
        let recorder = rule(
            "recorder",
            &[&format!("echo ran >> {}", marker.display())],
        );

        let result = run_session(
            vec![failing, recorder],
            vec![connected("A"), connected("B")],
        )
        .await;

        assert!(result.is_ok());
        // The recorder ran for both observations despite the failures
        assert_eq!(marker_lines(&marker), 2);
        let _ = std::fs::remove_file(&marker);
    }

    #[tokio::test]
    async fn test_ignore_policy_is_silent_success() {
        let mut failing = rule("failing", &["sh -c 'exit 1'"]);
        failing.on_failure = FailurePolicy::Ignore;

        let result = run_session(vec![failing], vec![connected("A")]).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_abort_policy_stops_observation_processing() {
        let marker = marker_path("abort");
        let _ = std::fs::remove_file(&marker);

        let mut fatal = rule("fatal", &["sh -c 'exit 1'"]);
        fatal.on_failure = FailurePolicy::Abort;
        fatal.conditions.ssid = vec!["A".to_string()];

        let mut later = rule(
            "later",
            &[&format!("echo ran >> {}", marker.display())],
        );
        later.conditions.ssid = vec!["B".to_string()];

        let result = run_session(
            vec![fatal, later],
            vec![connected("A"), connected("B")],
        )
        .await;

        assert!(result.is_err());
        // The second observation was never dispatched
        assert_eq!(marker_lines(&marker), 0);
        let _ = std::fs::remove_file(&marker);
    }

    #[tokio::test]
    async fn test_sequential_rules_do_not_overlap() {
        let first = rule("first", &["sleep 0.25"]);
        let second = rule("second", &["sleep 0.25"]);

        let start = Instant::now();
        run_session(vec![first, second], vec![connected("A")])
            .await
            .expect("session failed");
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(480),
            "sequential rules overlapped: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_concurrent_rules_overlap() {
        let mut first = rule("first", &["sleep 0.25"]);
        first.concurrent = true;
        let mut second = rule("second", &["sleep 0.25"]);
        second.concurrent = true;

        let start = Instant::now();
        run_session(vec![first, second], vec![connected("A")])
            .await
            .expect("session failed");
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(240),
            "concurrent rules were joined before finishing: {:?}",
            elapsed
        );
        assert!(
            elapsed < Duration::from_millis(450),
            "concurrent rules did not overlap: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_concurrent_rule_does_not_block_next_sequential() {
        let mut slow = rule("slow", &["sleep 0.25"]);
        slow.concurrent = true;
        let quick = rule("quick", &["sleep 0.25"]);

        let start = Instant::now();
        run_session(vec![slow, quick], vec![connected("A")])
            .await
            .expect("session failed");
        let elapsed = start.elapsed();

        // Both sleeps overlap: well under the 500ms a serial run would take
        assert!(
            elapsed < Duration::from_millis(450),
            "concurrent rule blocked the sequential one: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_rule_timeout_applies_failure_policy() {
        let mut slow = rule("slow", &["sleep 5"]);
        slow.timeout = Some(Duration::from_millis(100));
        slow.on_failure = FailurePolicy::Warn;

        let start = Instant::now();
        let result = run_session(vec![slow], vec![connected("A")]).await;
        let elapsed = start.elapsed();

        assert!(result.is_ok());
        assert!(
            elapsed < Duration::from_secs(2),
            "timeout did not cut the rule short: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_timeout_with_abort_policy_fails_session() {
        let mut slow = rule("slow", &["sleep 5"]);
        slow.timeout = Some(Duration::from_millis(100));
        slow.on_failure = FailurePolicy::Abort;

        let result = run_session(vec![slow], vec![connected("A")]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failed_command_retried_within_budget() {
        let marker = marker_path("retry");
        let _ = std::fs::remove_file(&marker);

        // Fails every attempt while recording each one
        let command = format!("echo attempt >> {} && exit 1", marker.display());
        let failing = rule("flaky", &[&command]);

        let executor = CommandExecutor::new(2, DEFAULT_CACHE_TTL);
        let mut dispatcher = Dispatcher::new(
            vec![failing],
            executor,
            DispatchOptions {
                max_retries: 2,
                ..Default::default()
            },
        );

        let (tx, rx) = mpsc::channel(4);
        tx.send(connected("A")).await.expect("send failed");
        drop(tx);
        dispatcher.run(rx).await.expect("warn policy should not fail");

        // One initial attempt plus two retries
        assert_eq!(marker_lines(&marker), 3);
        let _ = std::fs::remove_file(&marker);
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let marker = marker_path("dry");
        let _ = std::fs::remove_file(&marker);

        let recorder = rule(
            "recorder",
            &[&format!("echo ran >> {}", marker.display())],
        );

        let executor = CommandExecutor::new(2, DEFAULT_CACHE_TTL);
        let mut dispatcher = Dispatcher::new(
            vec![recorder],
            executor,
            DispatchOptions {
                dry_run: true,
                ..Default::default()
            },
        );

        let (tx, rx) = mpsc::channel(4);
        tx.send(connected("A")).await.expect("send failed");
        drop(tx);
        dispatcher.run(rx).await.expect("dry run failed");

        assert_eq!(marker_lines(&marker), 0);
    }

    #[tokio::test]
    async fn test_session_phases_end_stopped() {
        let executor = CommandExecutor::new(2, DEFAULT_CACHE_TTL);
        let mut dispatcher =
            Dispatcher::new(vec![rule("noop", &["true"])], executor, DispatchOptions::default());
        assert_eq!(dispatcher.phase(), SessionPhase::Idle);

        let (tx, rx) = mpsc::channel(4);
        tx.send(connected("A")).await.expect("send failed");
        drop(tx);
        dispatcher.run(rx).await.expect("session failed");

        assert_eq!(dispatcher.phase(), SessionPhase::Stopped);
        assert!(dispatcher.in_flight().is_empty());
        assert_eq!(
            dispatcher.last_observation().and_then(|o| o.ssid.as_deref()),
            Some("A")
        );
    }

    #[tokio::test]
    async fn test_home_dns_transition_runs_once_through_gate() {
        let marker = marker_path("home-dns");
        let _ = std::fs::remove_file(&marker);

        let mut home_dns = rule(
            "home-dns",
            &[&format!("echo reset-dns >> {}", marker.display())],
        );
        home_dns.conditions.ssid = vec!["HomeWiFi".to_string()];

        // Feed the dispatcher through the monitor's dedup gate, the way a
        // live session does
        let gate = DedupGate::new();
        let mut queue = Vec::new();
        for obs in [connected("HomeWiFi"), connected("HomeWiFi")] {
            if let Some(obs) = gate.admit(obs).await {
                queue.push(obs);
            }
        }

        run_session(vec![home_dns], queue).await.expect("session failed");

        // Exactly one execution: the duplicate observation never reached
        // the dispatcher
        assert_eq!(marker_lines(&marker), 1);
        let _ = std::fs::remove_file(&marker);
    }
}
