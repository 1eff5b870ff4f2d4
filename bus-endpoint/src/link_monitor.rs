//! Idle-link detection via ProbeReq/ProbeAck.
//!
//! The monitor is a pure state machine over caller-supplied instants; the rx
//! pump drives it from its bounded stream waits and carries out the actions
//! it returns. With idle timeout `T`, probe timeout `P` and `N` max probes, a
//! silent link sees probes at `T, T+P, …, T+(N-1)P` and is declared dead at
//! `T+N·P`. Probes are scheduled from their due time rather than from when
//! the pump happened to look, so poll jitter does not stretch the schedule.

use std::time::{Duration, Instant};

/// What the endpoint should do after polling the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Nothing due.
    None,
    /// Send a ProbeReq now.
    SendProbe,
    /// Every probe went unanswered; the link is dead.
    Dead,
}

/// Link-monitor parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimeoutParams {
    /// Seconds of inbound silence before the first probe; `0` disables.
    pub idle_timeout_secs: u32,
    /// Seconds to wait for each ProbeAck.
    pub probe_timeout_secs: u32,
    /// Probes to send before declaring the link dead.
    pub max_idle_probes: u32,
}

impl LinkTimeoutParams {
    /// Split a single user-facing link timeout into monitor parameters.
    ///
    /// The requested value is raised to `min_link_timeout_secs` (and to at
    /// least one second of idle time beyond the probe budget); whatever is
    /// left after reserving `probe_timeout_secs * max_idle_probes` becomes the
    /// idle timeout. Returns the parameters and the effective link timeout,
    /// which is what a dead peer will actually take to detect. `0` disables
    /// the monitor.
    pub fn from_link_timeout(
        requested_secs: u32,
        min_link_timeout_secs: u32,
        probe_timeout_secs: u32,
        max_idle_probes: u32,
    ) -> (Self, u32) {
        if requested_secs == 0 {
            let params = Self {
                idle_timeout_secs: 0,
                probe_timeout_secs,
                max_idle_probes,
            };
            return (params, 0);
        }
        let probe_budget = probe_timeout_secs.saturating_mul(max_idle_probes);
        let total = requested_secs
            .max(min_link_timeout_secs)
            .max(probe_budget.saturating_add(1));
        let idle_timeout_secs = total.saturating_sub(probe_budget);
        let params = Self {
            idle_timeout_secs,
            probe_timeout_secs,
            max_idle_probes,
        };
        (params, idle_timeout_secs.saturating_add(probe_budget))
    }
}

/// Per-endpoint link-monitor state.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    idle_timeout: Duration,
    probe_timeout: Duration,
    max_idle_probes: u32,
    probes_sent: u32,
    last_activity: Instant,
    /// Due time of the outstanding probe, if one is in flight.
    probe_due: Option<Instant>,
}

impl LinkMonitor {
    /// Create a monitor whose idle window starts at `now`.
    pub fn new(params: LinkTimeoutParams, now: Instant) -> Self {
        Self {
            idle_timeout: Duration::from_secs(params.idle_timeout_secs.into()),
            probe_timeout: Duration::from_secs(params.probe_timeout_secs.into()),
            max_idle_probes: params.max_idle_probes,
            probes_sent: 0,
            last_activity: now,
            probe_due: None,
        }
    }

    /// Replace the parameters and restart the idle window at `now`.
    pub fn reconfigure(&mut self, params: LinkTimeoutParams, now: Instant) {
        *self = Self::new(params, now);
    }

    /// Whether idle probing is switched on.
    pub fn is_enabled(&self) -> bool {
        !self.idle_timeout.is_zero()
    }

    /// Any inbound frame: reset the probe count and restart the idle window.
    pub fn record_activity(&mut self, now: Instant) {
        self.probes_sent = 0;
        self.probe_due = None;
        self.last_activity = now;
    }

    /// Advance the state machine to `now`.
    pub fn poll(&mut self, now: Instant) -> LinkAction {
        if !self.is_enabled() {
            return LinkAction::None;
        }
        match self.probe_due {
            None => {
                let Some(due) = self.last_activity.checked_add(self.idle_timeout) else {
                    return LinkAction::None;
                };
                if now < due {
                    return LinkAction::None;
                }
                self.probes_sent = 1;
                self.probe_due = Some(due);
                LinkAction::SendProbe
            }
            Some(sent) => {
                let Some(expires) = sent.checked_add(self.probe_timeout) else {
                    return LinkAction::None;
                };
                if now < expires {
                    return LinkAction::None;
                }
                if self.probes_sent >= self.max_idle_probes {
                    return LinkAction::Dead;
                }
                self.probes_sent = self.probes_sent.saturating_add(1);
                self.probe_due = Some(expires);
                LinkAction::SendProbe
            }
        }
    }

    /// Time from `now` until the next `poll` could return an action.
    /// `None` when the monitor is disabled.
    pub fn time_to_next_action(&self, now: Instant) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        let next = match self.probe_due {
            None => self.last_activity.checked_add(self.idle_timeout)?,
            Some(sent) => sent.checked_add(self.probe_timeout)?,
        };
        Some(next.saturating_duration_since(now))
    }

    /// Probes sent since the last inbound activity.
    pub fn probes_sent(&self) -> u32 {
        self.probes_sent
    }

    /// When inbound activity was last seen.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Current parameters.
    pub fn params(&self) -> LinkTimeoutParams {
        LinkTimeoutParams {
            idle_timeout_secs: u32::try_from(self.idle_timeout.as_secs()).unwrap_or(u32::MAX),
            probe_timeout_secs: u32::try_from(self.probe_timeout.as_secs()).unwrap_or(u32::MAX),
            max_idle_probes: self.max_idle_probes,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const T: u64 = 10;
    const P: u64 = 2;
    const N: u32 = 3;

    fn params() -> LinkTimeoutParams {
        LinkTimeoutParams {
            idle_timeout_secs: T as u32,
            probe_timeout_secs: P as u32,
            max_idle_probes: N,
        }
    }

    fn at(start: Instant, millis: u64) -> Instant {
        start + Duration::from_millis(millis)
    }

    /// Poll every 100ms from `from_ms` to `to_ms` and record when each
    /// action fired.
    fn drive(
        monitor: &mut LinkMonitor,
        start: Instant,
        from_ms: u64,
        to_ms: u64,
    ) -> Vec<(u64, LinkAction)> {
        let mut fired = Vec::new();
        let mut ms = from_ms;
        while ms <= to_ms {
            let action = monitor.poll(at(start, ms));
            if action != LinkAction::None {
                fired.push((ms, action));
                if action == LinkAction::Dead {
                    break;
                }
            }
            ms += 100;
        }
        fired
    }

    #[test]
    fn test_silent_link_probes_then_dies() {
        let start = Instant::now();
        let mut monitor = LinkMonitor::new(params(), start);
        let fired = drive(&mut monitor, start, 0, 60_000);
        assert_eq!(
            fired,
            vec![
                (10_000, LinkAction::SendProbe),
                (12_000, LinkAction::SendProbe),
                (14_000, LinkAction::SendProbe),
                (16_000, LinkAction::Dead),
            ]
        );
        assert_eq!(monitor.probes_sent(), N);
    }

    #[test]
    fn test_activity_restarts_idle_window() {
        let start = Instant::now();
        let mut monitor = LinkMonitor::new(params(), start);
        assert!(drive(&mut monitor, start, 0, 4_900).is_empty());
        monitor.record_activity(at(start, 5_000));
        let fired = drive(&mut monitor, start, 5_000, 15_500);
        assert_eq!(fired, vec![(15_000, LinkAction::SendProbe)]);
    }

    #[test]
    fn test_ack_resets_probe_counter() {
        let start = Instant::now();
        let mut monitor = LinkMonitor::new(params(), start);
        assert_eq!(monitor.poll(at(start, 10_000)), LinkAction::SendProbe);
        assert_eq!(monitor.poll(at(start, 12_000)), LinkAction::SendProbe);
        assert_eq!(monitor.probes_sent(), 2);
        monitor.record_activity(at(start, 12_500));
        assert_eq!(monitor.probes_sent(), 0);
        assert_eq!(monitor.poll(at(start, 14_000)), LinkAction::None);
        assert_eq!(monitor.poll(at(start, 22_500)), LinkAction::SendProbe);
    }

    #[test]
    fn test_late_poll_keeps_schedule() {
        let start = Instant::now();
        let mut monitor = LinkMonitor::new(params(), start);
        // The pump looks 700ms late; the next probe is still due at T+P.
        assert_eq!(monitor.poll(at(start, 10_700)), LinkAction::SendProbe);
        assert_eq!(
            monitor.time_to_next_action(at(start, 10_700)),
            Some(Duration::from_millis(1_300))
        );
    }

    #[test]
    fn test_disabled_monitor_never_fires() {
        let start = Instant::now();
        let mut monitor = LinkMonitor::new(
            LinkTimeoutParams {
                idle_timeout_secs: 0,
                ..params()
            },
            start,
        );
        assert!(!monitor.is_enabled());
        assert!(drive(&mut monitor, start, 0, 100_000).is_empty());
        assert_eq!(monitor.time_to_next_action(start), None);
    }

    #[test]
    fn test_time_to_next_action() {
        let start = Instant::now();
        let monitor = LinkMonitor::new(params(), start);
        assert_eq!(
            monitor.time_to_next_action(at(start, 4_000)),
            Some(Duration::from_secs(6))
        );
        assert_eq!(
            monitor.time_to_next_action(at(start, 11_000)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_link_timeout_split() {
        // 60s requested, 3 probes of 10s: 30s idle + 30s probing.
        let (p, effective) = LinkTimeoutParams::from_link_timeout(60, 40, 10, 3);
        assert_eq!(p.idle_timeout_secs, 30);
        assert_eq!(effective, 60);

        // Below the minimum: raised to 40.
        let (p, effective) = LinkTimeoutParams::from_link_timeout(5, 40, 10, 3);
        assert_eq!(p.idle_timeout_secs, 10);
        assert_eq!(effective, 40);

        // Probe budget larger than the minimum: keep at least 1s idle.
        let (p, effective) = LinkTimeoutParams::from_link_timeout(5, 1, 10, 3);
        assert_eq!(p.idle_timeout_secs, 1);
        assert_eq!(effective, 31);

        let (p, effective) = LinkTimeoutParams::from_link_timeout(0, 40, 10, 3);
        assert_eq!(p.idle_timeout_secs, 0);
        assert_eq!(effective, 0);
    }
}
