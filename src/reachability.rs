//! Server reachability monitor.
//!
//! Combines the passive OS link-state signal with an active health probe
//! (every 30 s, 5 s timeout by default) into one sticky boolean. The status
//! only flips on contradicting evidence:
//!
//! - a successful probe makes the server reachable immediately;
//! - while reachable, failed probes and link-down events count as
//!   contradictions, and the status flips to unreachable once
//!   `failure_threshold` of them arrive in a row;
//! - any confirming signal resets the count.
//!
//! Subscribers hear about each real transition exactly once.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{bounded_check, HealthProbe};
use crate::config::EngineConfig;
use crate::events::{EventBus, Subscription};

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
}

impl From<&EngineConfig> for MonitorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            probe_interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
            failure_threshold: config.probe_failure_threshold.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Link(bool),
    Probe(bool),
}

#[derive(Debug)]
struct MonitorState {
    online: bool,
    link_up: bool,
    contradictions: u32,
}

pub struct ReachabilityMonitor {
    probe: Arc<dyn HealthProbe>,
    settings: MonitorSettings,
    state: Mutex<MonitorState>,
    listeners: EventBus<bool>,
    shutdown: CancellationToken,
}

impl ReachabilityMonitor {
    /// `initially_online` seeds the status from the OS link state, before
    /// the first probe has answered.
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        settings: MonitorSettings,
        initially_online: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            probe,
            settings,
            state: Mutex::new(MonitorState {
                online: initially_online,
                link_up: initially_online,
                contradictions: 0,
            }),
            listeners: EventBus::new("network_status"),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn get_status(&self) -> bool {
        self.state.lock().map(|s| s.online).unwrap_or(false)
    }

    pub fn link_up(&self) -> bool {
        self.state.lock().map(|s| s.link_up).unwrap_or(false)
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Probe right now and return the resulting status.
    pub async fn force_check(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return self.get_status();
        }
        let healthy = bounded_check(self.probe.as_ref(), self.settings.probe_timeout).await;
        self.record(Signal::Probe(healthy));
        self.get_status()
    }

    /// Feed the passive OS connectivity signal; the embedding host calls this
    /// from its network-change notifications. A link change in either
    /// direction is confirmed by an immediate probe.
    pub async fn report_link_state(&self, up: bool) {
        self.record(Signal::Link(up));
        let online = self.get_status();
        if up != online {
            self.force_check().await;
        }
    }

    /// Start the periodic probe. The first probe runs immediately.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let interval = self.settings.probe_interval;

        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Reachability monitor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(monitor) = weak.upgrade() else { break };
                monitor.force_check().await;
            }
            info!("Reachability monitor stopped");
        })
    }

    /// Stop probing and drop every listener.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.listeners.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn record(&self, signal: Signal) {
        let transition = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if let Signal::Link(up) = signal {
                state.link_up = up;
            }
            apply_signal(&mut state, signal, self.settings.failure_threshold)
        };

        if let Some(online) = transition {
            if online {
                info!("Server reachable");
            } else {
                warn!("Server unreachable; sales will be queued locally");
            }
            self.listeners.emit(&online);
        }
    }
}

/// Pure transition rule. Returns the new status when it changed.
fn apply_signal(state: &mut MonitorState, signal: Signal, threshold: u32) -> Option<bool> {
    match signal {
        Signal::Probe(true) => {
            state.contradictions = 0;
            if state.online {
                None
            } else {
                state.online = true;
                Some(true)
            }
        }
        Signal::Probe(false) | Signal::Link(false) => {
            if !state.online {
                return None;
            }
            state.contradictions += 1;
            debug!(
                ?signal,
                contradictions = state.contradictions,
                threshold,
                "Contradicting reachability signal"
            );
            if state.contradictions >= threshold {
                state.online = false;
                state.contradictions = 0;
                Some(false)
            } else {
                None
            }
        }
        // Link-up says nothing about the server; only a probe can restore
        // reachability.
        Signal::Link(true) => {
            if state.online {
                state.contradictions = 0;
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProbe;
    use std::sync::atomic::Ordering;

    fn settings() -> MonitorSettings {
        MonitorSettings {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 2,
        }
    }

    fn record_transitions(monitor: &ReachabilityMonitor) -> Arc<Mutex<Vec<bool>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = monitor.subscribe(move |online| sink.lock().unwrap().push(*online));
        seen
    }

    #[tokio::test]
    async fn test_single_failed_probe_is_not_enough() {
        let probe = ScriptedProbe::new(vec![false, false], true);
        let monitor = ReachabilityMonitor::new(probe.clone(), settings(), true);
        let seen = record_transitions(&monitor);

        assert!(monitor.force_check().await);
        assert!(!monitor.force_check().await);
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_success_between_failures_resets_count() {
        let probe = ScriptedProbe::new(vec![false, true, false, true], true);
        let monitor = ReachabilityMonitor::new(probe, settings(), true);
        let seen = record_transitions(&monitor);

        for _ in 0..4 {
            assert!(monitor.force_check().await);
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_restores_and_notifies_once() {
        let probe = ScriptedProbe::new(vec![true, true, true], true);
        let monitor = ReachabilityMonitor::new(probe, settings(), false);
        let seen = record_transitions(&monitor);

        assert!(monitor.force_check().await);
        assert!(monitor.force_check().await);
        assert!(monitor.force_check().await);
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_link_down_confirmed_by_failed_probe_goes_offline() {
        let probe = ScriptedProbe::new(vec![false], true);
        let monitor = ReachabilityMonitor::new(probe.clone(), settings(), true);
        let seen = record_transitions(&monitor);

        monitor.report_link_state(false).await;
        assert!(!monitor.get_status());
        assert!(!monitor.link_up());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_link_flap_with_healthy_server_stays_online() {
        let probe = ScriptedProbe::new(vec![], true);
        let monitor = ReachabilityMonitor::new(probe, settings(), true);
        let seen = record_transitions(&monitor);

        monitor.report_link_state(false).await;
        monitor.report_link_state(true).await;
        assert!(monitor.get_status());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_link_up_while_offline_probes_immediately() {
        let probe = ScriptedProbe::new(vec![], true);
        let monitor = ReachabilityMonitor::new(probe.clone(), settings(), false);

        monitor.report_link_state(true).await;
        assert!(monitor.get_status());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_probe_and_shutdown() {
        let probe = ScriptedProbe::new(vec![], false);
        let monitor = ReachabilityMonitor::new(probe.clone(), settings(), true);
        let seen = record_transitions(&monitor);
        let handle = monitor.start();

        // Probes at t=0 and t=30s; the second flips the status.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!monitor.get_status());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*seen.lock().unwrap(), vec![false]);

        monitor.shutdown();
        handle.await.unwrap();
        let calls = probe.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), calls);
        assert_eq!(monitor.listeners.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_counts_as_failure() {
        let probe = ScriptedProbe::hanging();
        let monitor = ReachabilityMonitor::new(probe, settings(), true);
        assert!(monitor.force_check().await);
        assert!(!monitor.force_check().await);
    }

    #[test]
    fn test_threshold_of_one_flips_immediately() {
        let mut state = MonitorState {
            online: true,
            link_up: true,
            contradictions: 0,
        };
        assert_eq!(apply_signal(&mut state, Signal::Probe(false), 1), Some(false));
        assert_eq!(apply_signal(&mut state, Signal::Link(false), 1), None);
        assert_eq!(apply_signal(&mut state, Signal::Link(true), 1), None);
        assert_eq!(apply_signal(&mut state, Signal::Probe(true), 1), Some(true));
    }
}
